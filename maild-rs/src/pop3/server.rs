//! POP3 listeners.
//!
//! Plaintext and implicit-TLS variants on distinct ports. A connection
//! above the cap is answered `-ERR Too many connections` and closed at
//! accept time. An idle TRANSACTION session times out after the
//! configured quiet period; the timeout path never enters UPDATE, so
//! pending deletions are discarded.

use crate::auth::AuthService;
use crate::config::Config;
use crate::error::Result;
use crate::net::{tune_socket, ConnectionLimiter, Shutdown};
use crate::pop3::commands::Pop3Command;
use crate::pop3::session::{Pop3Session, Pop3State};
use crate::security::TlsConfig;
use crate::service::MailService;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Maximum POP3 command line length (RFC 1939 allows 512 octets).
const MAX_LINE_LENGTH: usize = 512;

/// Idle timeout before authentication completes.
const AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Pop3Server {
    config: Arc<Config>,
    mail_service: Arc<MailService>,
    auth: Arc<AuthService>,
    tls: Option<TlsConfig>,
    shutdown: Shutdown,
}

impl Pop3Server {
    pub fn new(
        config: Arc<Config>,
        mail_service: Arc<MailService>,
        auth: Arc<AuthService>,
        tls: Option<TlsConfig>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config,
            mail_service,
            auth,
            tls,
            shutdown,
        }
    }

    /// Bind and serve both listener variants until shutdown.
    pub async fn run(&self) -> Result<()> {
        let plain_addr = format!("{}:{}", self.config.pop3.host, self.config.pop3.port);
        let plain = TcpListener::bind(&plain_addr).await?;
        info!("POP3 server listening on {}", plain_addr);

        let ssl = if self.config.pop3.use_ssl {
            match &self.tls {
                Some(tls) => {
                    let ssl_addr =
                        format!("{}:{}", self.config.pop3.host, self.config.pop3.ssl_port);
                    let listener = TcpListener::bind(&ssl_addr).await?;
                    info!("POP3 SSL server listening on {}", ssl_addr);
                    Some((listener, tls.acceptor()))
                }
                None => {
                    warn!("POP3 SSL requested but no TLS configuration available");
                    None
                }
            }
        } else {
            None
        };

        let tracker = self.shutdown.tracker().clone();
        tracker.spawn(Self::accept_loop(
            plain,
            None,
            self.config.clone(),
            self.mail_service.clone(),
            self.auth.clone(),
            self.shutdown.clone(),
        ));

        if let Some((listener, acceptor)) = ssl {
            let tracker = self.shutdown.tracker().clone();
            tracker.spawn(Self::accept_loop(
                listener,
                Some(acceptor),
                self.config.clone(),
                self.mail_service.clone(),
                self.auth.clone(),
                self.shutdown.clone(),
            ));
        }

        Ok(())
    }

    async fn accept_loop(
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        config: Arc<Config>,
        mail_service: Arc<MailService>,
        auth: Arc<AuthService>,
        shutdown: Shutdown,
    ) {
        let limiter = ConnectionLimiter::new(config.pop3.max_connections);
        let token = shutdown.token();

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => {
                    info!("POP3 accept loop stopping");
                    return;
                }
                accepted = listener.accept() => accepted,
            };

            let (mut socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Failed to accept POP3 connection: {}", e);
                    continue;
                }
            };

            let Some(permit) = limiter.try_acquire() else {
                warn!(
                    "POP3 connection limit of {} reached, rejecting {}",
                    config.pop3.max_connections, peer
                );
                let _ = socket.write_all(b"-ERR Too many connections\r\n").await;
                continue;
            };

            if let Err(e) = tune_socket(&socket) {
                debug!("Failed to tune socket for {}: {}", peer, e);
            }

            info!("New POP3 connection from {}", peer);

            let session = Pop3Session::new(mail_service.clone(), auth.clone());
            let idle_timeout = Duration::from_secs(config.pop3.idle_timeout_secs);
            let acceptor = acceptor.clone();

            shutdown.tracker().spawn(async move {
                let _permit = permit;

                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(tls_stream) => {
                            handle_connection(tls_stream, session, idle_timeout).await
                        }
                        Err(e) => {
                            debug!("TLS handshake failed for {}: {}", peer, e);
                            return;
                        }
                    },
                    None => handle_connection(socket, session, idle_timeout).await,
                };

                if let Err(e) = result {
                    error!("POP3 session error for {}: {}", peer, e);
                }
                debug!("POP3 connection from {} closed", peer);
            });
        }
    }
}

/// Drive one POP3 connection.
///
/// A read timeout or connection drop tears the session down without
/// entering UPDATE: the marked-for-deletion set dies with the session.
pub async fn handle_connection<S>(
    stream: S,
    mut session: Pop3Session,
    idle_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);

    reader.write_all(Pop3Session::greeting().as_bytes()).await?;

    let mut line = String::new();

    loop {
        line.clear();

        let read_timeout = match session.state() {
            Pop3State::Transaction => idle_timeout,
            _ => AUTHORIZATION_TIMEOUT,
        };

        let n = match timeout(read_timeout, reader.read_line(&mut line)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("IO error reading POP3 command: {}", e);
                return Err(e.into());
            }
            Err(_) => {
                warn!("POP3 session idle timeout, discarding pending deletions");
                let _ = reader.write_all(b"-ERR Connection timeout\r\n").await;
                return Ok(());
            }
        };

        if n == 0 {
            debug!("POP3 client disconnected");
            return Ok(());
        }

        if line.len() > MAX_LINE_LENGTH {
            reader.write_all(b"-ERR Line too long\r\n").await?;
            continue;
        }

        let trimmed = line.trim_end();
        match trimmed.get(..4) {
            // Never log passwords
            Some(prefix) if prefix.eq_ignore_ascii_case("PASS") => {
                debug!("POP3 <- PASS [hidden]");
            }
            _ => debug!("POP3 <- {}", trimmed),
        }

        let reply = session.handle_command(Pop3Command::parse(trimmed)).await;
        reader.write_all(reply.text.as_bytes()).await?;

        if reply.close {
            return Ok(());
        }
    }
}
