use clap::Parser;
use maild_rs::auth::AuthService;
use maild_rs::config::Config;
use maild_rs::net::Shutdown;
use maild_rs::pop3::Pop3Server;
use maild_rs::security::TlsConfig;
use maild_rs::service::MailService;
use maild_rs::smtp::SmtpServer;
use maild_rs::storage::connect_pool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "maild")]
#[command(about = "SMTP/POP3 mail server", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// SMTP plaintext port (overrides env and config file)
    #[arg(long)]
    smtp_port: Option<u16>,

    /// SMTP implicit-TLS port
    #[arg(long)]
    smtp_ssl_port: Option<u16>,

    /// POP3 plaintext port
    #[arg(long)]
    pop3_port: Option<u16>,

    /// POP3 implicit-TLS port
    #[arg(long)]
    pop3_ssl_port: Option<u16>,

    /// Disable the implicit-TLS listeners
    #[arg(long)]
    no_ssl: bool,

    /// Accept MAIL FROM without authentication
    #[arg(long)]
    no_auth: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // CLI argument > environment variable > JSON config file > default
    let mut config = Config::load(Some(&cli.config))?;
    if let Some(port) = cli.smtp_port {
        config.smtp.port = port;
    }
    if let Some(port) = cli.smtp_ssl_port {
        config.smtp.ssl_port = port;
    }
    if let Some(port) = cli.pop3_port {
        config.pop3.port = port;
    }
    if let Some(port) = cli.pop3_ssl_port {
        config.pop3.ssl_port = port;
    }
    if cli.no_ssl {
        config.smtp.use_ssl = false;
        config.pop3.use_ssl = false;
    }
    if cli.no_auth {
        config.smtp.require_auth = false;
    }

    init_logging(&config);

    info!("Starting maild-rs");
    info!("  SMTP: {}:{}", config.smtp.host, config.smtp.port);
    if config.smtp.use_ssl {
        info!("  SMTP SSL: {}:{}", config.smtp.host, config.smtp.ssl_port);
    }
    info!("  POP3: {}:{}", config.pop3.host, config.pop3.port);
    if config.pop3.use_ssl {
        info!("  POP3 SSL: {}:{}", config.pop3.host, config.pop3.ssl_port);
    }
    info!("  Database: {}", config.storage.database_path);
    info!("  Email storage: {}", config.storage.email_dir);

    // Missing TLS material at startup is fatal for the SSL listeners,
    // so resolve it before binding anything
    let tls = if config.smtp.use_ssl || config.pop3.use_ssl {
        Some(TlsConfig::load_or_generate(
            &config.tls.cert_file,
            &config.tls.key_file,
        )?)
    } else {
        None
    };

    let pool = connect_pool(&config.storage.database_path, config.storage.db_pool_size).await?;

    let config = Arc::new(config);
    let mail_service = Arc::new(MailService::new(pool.clone(), &config)?);
    let auth = Arc::new(AuthService::new(pool));
    let shutdown = Shutdown::new();

    let smtp = SmtpServer::new(
        config.clone(),
        mail_service.clone(),
        auth.clone(),
        tls.clone(),
        shutdown.clone(),
    );
    smtp.run().await?;

    let pop3 = Pop3Server::new(
        config.clone(),
        mail_service,
        auth,
        tls,
        shutdown.clone(),
    );
    pop3.run().await?;

    wait_for_signal().await;

    shutdown
        .drain(Duration::from_secs(config.shutdown.graceful_timeout_secs))
        .await;

    info!("maild-rs stopped");
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.pretty().try_init()
    };

    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }
}
