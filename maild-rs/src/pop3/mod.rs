//! POP3 retrieval server (RFC 1939).

pub mod commands;
pub mod server;
pub mod session;

pub use commands::Pop3Command;
pub use server::{handle_connection, Pop3Server};
pub use session::{Pop3Reply, Pop3Session, Pop3State};
