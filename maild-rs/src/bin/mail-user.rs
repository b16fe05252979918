//! CLI tool for managing mail user accounts.
//!
//! ```bash
//! # Add a new user
//! mail-user add alice alice@example.com password123
//!
//! # List all users
//! mail-user list
//!
//! # Change a password
//! mail-user passwd alice newpassword
//!
//! # Deactivate / reactivate
//! mail-user deactivate alice
//! mail-user activate alice
//! ```

use clap::{Parser, Subcommand};
use maild_rs::auth::AuthService;
use maild_rs::config::Config;
use maild_rs::storage::connect_pool;

#[derive(Parser)]
#[command(name = "mail-user")]
#[command(about = "Manage mail user accounts", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new user
    Add {
        /// Login name
        username: String,
        /// Mailbox address
        email: String,
        /// Password
        password: String,
        /// Display name
        #[arg(long)]
        full_name: Option<String>,
    },
    /// List all users
    List,
    /// Change a user's password
    Passwd {
        username: String,
        password: String,
    },
    /// Reactivate a user
    Activate { username: String },
    /// Deactivate a user (the record is kept)
    Deactivate { username: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(Some(&cli.config))?;
    let pool = connect_pool(&config.storage.database_path, config.storage.db_pool_size).await?;
    let auth = AuthService::new(pool);

    match cli.command {
        Commands::Add {
            username,
            email,
            password,
            full_name,
        } => {
            let user = auth
                .create_user(&username, &email, &password, full_name.as_deref())
                .await?;
            println!("User {} <{}> added", user.username, user.email);
        }
        Commands::List => {
            let users = auth.list_users().await?;

            if users.is_empty() {
                println!("No users found.");
            } else {
                println!(
                    "{:<20} {:<30} {:<8} {:<20}",
                    "Username", "Email", "Active", "Last Login"
                );
                println!("{:-<80}", "");
                for user in &users {
                    println!(
                        "{:<20} {:<30} {:<8} {:<20}",
                        user.username,
                        user.email,
                        if user.is_active { "yes" } else { "no" },
                        user.last_login.as_deref().unwrap_or("Never")
                    );
                }
                println!("\nTotal: {} user(s)", users.len());
            }
        }
        Commands::Passwd { username, password } => {
            if auth.change_password(&username, &password).await? {
                println!("Password changed for {}", username);
            } else {
                eprintln!("Error: user {} does not exist", username);
                std::process::exit(1);
            }
        }
        Commands::Activate { username } => {
            if auth.activate_user(&username).await? {
                println!("User {} activated", username);
            } else {
                eprintln!("Error: user {} does not exist", username);
                std::process::exit(1);
            }
        }
        Commands::Deactivate { username } => {
            if auth.deactivate_user(&username).await? {
                println!("User {} deactivated", username);
            } else {
                eprintln!("Error: user {} does not exist", username);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
