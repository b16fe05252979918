//! POP3 command parsing (RFC 1939).
//!
//! Arguments are kept as raw strings; message numbers are parsed by the
//! session so that a bad number can be answered with the exact argument
//! echoed back.

/// POP3 protocol commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop3Command {
    User(String),
    Pass(String),
    Stat,
    /// Optional message number argument, raw.
    List(String),
    /// Optional message number argument, raw.
    Uidl(String),
    /// Message number argument, raw.
    Retr(String),
    /// `msg_num n` argument pair, raw.
    Top(String),
    /// Message number argument, raw.
    Dele(String),
    Noop,
    Rset,
    Capa,
    Quit,
    Unknown(String),
}

impl Pop3Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("").to_uppercase();
        let arg = parts.next().unwrap_or("").trim().to_string();

        match cmd.as_str() {
            "USER" => Pop3Command::User(arg),
            "PASS" => Pop3Command::Pass(arg),
            "STAT" => Pop3Command::Stat,
            "LIST" => Pop3Command::List(arg),
            "UIDL" => Pop3Command::Uidl(arg),
            "RETR" => Pop3Command::Retr(arg),
            "TOP" => Pop3Command::Top(arg),
            "DELE" => Pop3Command::Dele(arg),
            "NOOP" => Pop3Command::Noop,
            "RSET" => Pop3Command::Rset,
            "CAPA" => Pop3Command::Capa,
            "QUIT" => Pop3Command::Quit,
            _ => Pop3Command::Unknown(cmd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_pass() {
        assert_eq!(
            Pop3Command::parse("USER alice"),
            Pop3Command::User("alice".to_string())
        );
        assert_eq!(
            Pop3Command::parse("PASS secret word"),
            Pop3Command::Pass("secret word".to_string())
        );
    }

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!(Pop3Command::parse("stat"), Pop3Command::Stat);
        assert_eq!(
            Pop3Command::parse("retr 1"),
            Pop3Command::Retr("1".to_string())
        );
    }

    #[test]
    fn test_parse_optional_args() {
        assert_eq!(Pop3Command::parse("LIST"), Pop3Command::List("".to_string()));
        assert_eq!(
            Pop3Command::parse("LIST 2"),
            Pop3Command::List("2".to_string())
        );
        assert_eq!(Pop3Command::parse("UIDL"), Pop3Command::Uidl("".to_string()));
    }

    #[test]
    fn test_parse_top() {
        assert_eq!(
            Pop3Command::parse("TOP 1 10"),
            Pop3Command::Top("1 10".to_string())
        );
    }

    #[test]
    fn test_parse_strips_crlf() {
        assert_eq!(
            Pop3Command::parse("DELE 3\r\n"),
            Pop3Command::Dele("3".to_string())
        );
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            Pop3Command::parse("APOP user digest"),
            Pop3Command::Unknown("APOP".to_string())
        );
    }
}
