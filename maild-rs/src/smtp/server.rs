//! SMTP listeners.
//!
//! Two variants coexist on distinct ports: plaintext and implicit TLS
//! (the TLS handshake happens before any SMTP banner; there is no
//! STARTTLS). Each accepted connection is handled by one spawned task;
//! the per-listener cap is enforced with connection permits, and
//! overflow sockets are closed at accept time.

use crate::auth::AuthService;
use crate::config::Config;
use crate::error::Result;
use crate::net::{tune_socket, ConnectionLimiter, Shutdown};
use crate::security::TlsConfig;
use crate::service::MailService;
use crate::smtp::session::SmtpSession;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub struct SmtpServer {
    config: Arc<Config>,
    mail_service: Arc<MailService>,
    auth: Arc<AuthService>,
    tls: Option<TlsConfig>,
    shutdown: Shutdown,
}

impl SmtpServer {
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
        let plain_addr = format!("{}:{}", self.config.smtp.host, self.config.smtp.port);
        let plain = TcpListener::bind(&plain_addr).await?;
        info!("SMTP server listening on {}", plain_addr);

        let ssl = if self.config.smtp.use_ssl {
            match &self.tls {
                Some(tls) => {
                    let ssl_addr =
                        format!("{}:{}", self.config.smtp.host, self.config.smtp.ssl_port);
                    let listener = TcpListener::bind(&ssl_addr).await?;
                    info!("SMTP SSL server listening on {}", ssl_addr);
                    Some((listener, tls.acceptor()))
                }
                None => {
                    warn!("SMTP SSL requested but no TLS configuration available");
                    None
                }
            }
        } else {
            None
        };

        if self.config.smtp.require_auth {
            info!("SMTP authentication is REQUIRED for sending mail");
        }

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
        let limiter = ConnectionLimiter::new(config.smtp.max_connections);
        let token = shutdown.token();

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => {
                    info!("SMTP accept loop stopping");
                    return;
                }
                accepted = listener.accept() => accepted,
            };

            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Failed to accept SMTP connection: {}", e);
                    continue;
                }
            };

            // Backpressure: at capacity, close at the transport level
            let Some(permit) = limiter.try_acquire() else {
                warn!(
                    "SMTP connection limit of {} reached, closing {}",
                    config.smtp.max_connections, peer
                );
                drop(socket);
                continue;
            };

            if let Err(e) = tune_socket(&socket) {
                debug!("Failed to tune socket for {}: {}", peer, e);
            }

            info!("New SMTP connection from {}", peer);

            let session = SmtpSession::new(
                config.server.hostname.clone(),
                mail_service.clone(),
                auth.clone(),
                config.smtp.require_auth,
                config.smtp.max_message_size,
            );
            let acceptor = acceptor.clone();

            shutdown.tracker().spawn(async move {
                let _permit = permit;

                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(tls_stream) => session.handle(tls_stream).await,
                        Err(e) => {
                            // Handshake failures tear down quietly
                            debug!("TLS handshake failed for {}: {}", peer, e);
                            return;
                        }
                    },
                    None => session.handle(socket).await,
                };

                if let Err(e) = result {
                    error!("SMTP session error for {}: {}", peer, e);
                }
                debug!("SMTP connection from {} closed", peer);
            });
        }
    }
}
