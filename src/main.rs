//! bookvill server entry point.

use bookvill::{
    auth::AuthService,
    config::{Cli, Command, Config, UserCommand},
    db::{Database, Role},
    server,
};
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    // Handle command
    match cli.command {
        Some(Command::Init { force }) => cmd_init(force).await,
        Some(Command::User { action }) => cmd_user(action, &config).await,
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => {
            // Default: start server
            cmd_serve(config, None).await
        }
    }
}

/// Initialize config and database.
async fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    // Write default config
    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    // Initialize database
    let config = Config::default();
    let _db = Database::open(&config.database.path)?;
    println!("Initialized database: {}", config.database.path.display());

    println!("\nEdit config.toml and set [auth] jwt_secret.");
    println!("Then run: bookvill user add <username> --email <email> --role admin");

    Ok(())
}

/// User management commands.
async fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;
    let auth = AuthService::new(
        db,
        config.auth.jwt_secret.clone(),
        config.auth.token_days,
    );

    match action {
        UserCommand::Add {
            username,
            email,
            password,
            role,
        } => {
            let role = Role::parse(&role)
                .ok_or_else(|| anyhow::anyhow!("Role must be reader, author or admin"))?;

            let password = match password {
                Some(p) => p,
                None => prompt_password("Password: ")?,
            };

            let user = auth.create_user(&username, &email, &password, role)?;
            println!(
                "Created user: {} (role: {}, id: {})",
                user.username,
                user.role.as_str(),
                user.id
            );
        }

        UserCommand::Del { username } => {
            if auth.delete_user(&username)? {
                println!("Deleted user: {}", username);
            } else {
                println!("User not found: {}", username);
            }
        }

        UserCommand::List => {
            let users = auth.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<20} {:<10} {:<36} EMAIL", "USERNAME", "ROLE", "ID");
                println!("{}", "-".repeat(90));
                for user in users {
                    println!(
                        "{:<20} {:<10} {:<36} {}",
                        user.username,
                        user.role.as_str(),
                        user.id,
                        user.email
                    );
                }
            }
        }

        UserCommand::Passwd { username, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("New password: ")?,
            };

            if auth.change_password(&username, &password)? {
                println!("Password changed for: {}", username);
            } else {
                println!("User not found: {}", username);
            }
        }
    }

    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    // Override bind address if specified
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bookvill=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.auth.jwt_secret.is_empty() {
        anyhow::bail!(
            "No jwt_secret configured. Set [auth] jwt_secret in config.toml (see `bookvill init`)."
        );
    }

    // Open database
    let db = Database::open(&config.database.path)?;

    // Create auth service
    let auth = AuthService::new(
        db.clone(),
        config.auth.jwt_secret.clone(),
        config.auth.token_days,
    );

    tracing::info!(
        bind = %config.server.bind,
        database = %config.database.path.display(),
        "Starting bookvill server"
    );

    // Create application state and router
    let state = server::AppState::new(config.clone(), db, auth);
    let app = server::create_router(state);

    let listener = TcpListener::bind(config.server.bind).await?;
    tracing::info!(address = %config.server.bind, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Prompt for password input.
fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;

    Ok(password.trim().to_string())
}
