//! quill - command-line client for the blog API.
//!
//! Signs in, keeps the session's tokens fresh and sends authenticated
//! requests on the user's behalf. The session survives between runs in
//! the configured credential storage.

use std::io::{self, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use quill_core::config::Config;
use quill_core::reqwest::Method;
use quill_core::{ProfileUpdate, RegisterRequest, SessionManager};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "quill", version, about = "Command-line client for the quill blog API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// API base URL, overriding the config file and QUILL_API_URL
    #[arg(long, global = true)]
    api_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in (prompts for password)
    Login {
        /// Defaults to the last email used
        email: Option<String>,
    },
    /// Sign out and forget stored tokens
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Show token and refresh-timer state
    Status,
    /// Refresh the access token now
    Refresh,
    /// Create an account (prompts for password)
    Register {
        username: String,
        email: String,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
    },
    /// Update one profile field
    Profile {
        #[arg(value_enum)]
        field: ProfileField,
        /// New value; words are joined with spaces
        #[arg(required = true, num_args = 1..)]
        value: Vec<String>,
    },
    /// Authenticated GET, prints the response body
    Get { path: String },
    /// Authenticated DELETE
    Delete { path: String },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ProfileField {
    #[value(name = "first_name")]
    FirstName,
    #[value(name = "last_name")]
    LastName,
    Bio,
    Avatar,
}

impl ProfileField {
    fn update(self, value: Option<String>) -> ProfileUpdate {
        let mut update = ProfileUpdate::default();
        match self {
            ProfileField::FirstName => update.first_name = value,
            ProfileField::LastName => update.last_name = value,
            ProfileField::Bio => update.bio = value,
            ProfileField::Avatar => update.profile_image_url = value,
        }
        update
    }
}

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr; when `log_dir` is set they also go to a daily
/// rolling file. The returned guard must be held until exit so buffered
/// file output is flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "quill.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(filter)
                .init();
            None
        }
    }
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{}: ", label);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn prompt_password(label: &str) -> Result<String> {
    rpassword::prompt_password(format!("{}: ", label)).context("Failed to read password")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = Config::load()?.with_api_url_override(cli.api_url.clone());
    let _log_guard = init_tracing(config.log_dir.as_deref());
    info!(api = %config.api_base_url, storage = ?config.storage, "quill starting");

    let session = config.build_session()?;
    let restored = match session.initialize().await {
        Ok(restored) => restored,
        Err(e) => {
            debug!(error = %e, "Could not restore session");
            false
        }
    };

    let result = run(cli.command, &session, &mut config, restored).await;
    session.shutdown();
    result
}

async fn run(command: Commands, session: &SessionManager, config: &mut Config, restored: bool) -> Result<()> {
    match command {
        Commands::Login { email } => {
            let email = match email {
                Some(email) => email,
                None => match config.last_email.clone() {
                    Some(last) => {
                        let entered = prompt(&format!("Email [{}]", last))?;
                        if entered.is_empty() { last } else { entered }
                    }
                    None => prompt("Email")?,
                },
            };
            let password = prompt_password("Password")?;
            let user = session.login(&email, &password).await?;

            config.last_email = Some(email);
            if let Err(e) = config.save() {
                debug!(error = %e, "Failed to save config");
            }
            println!("Signed in as {} ({})", user.display_name(), user.email);
        }
        Commands::Logout => {
            session.logout().await;
            println!("Signed out");
        }
        Commands::Whoami => match session.current_user() {
            Some(user) => {
                println!("{} <{}>", user.display_name(), user.email);
                println!("  username: {}", user.username);
                println!("  role:     {}", user.role);
                if let Some(bio) = user.bio.as_deref() {
                    println!("  bio:      {}", bio);
                }
            }
            None => {
                let reason = session.last_error().unwrap_or_else(|| "Not signed in".to_string());
                bail!(reason);
            }
        },
        Commands::Status => {
            println!("signed in: {}", session.is_authenticated());
            println!("restored:  {}", restored);
            if let Some(cred) = session.credential() {
                println!("token type: {}", cred.token_type);
                println!("expires in: {}s", cred.expires_in);
                println!("refresh token: {}", if cred.has_refresh_token() { "present" } else { "none" });
            }
            match session.scheduled_refresh() {
                Some(scheduled) => println!(
                    "next refresh: {} (in {}s)",
                    scheduled.due_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    scheduled.remaining.as_secs()
                ),
                None => println!("next refresh: not scheduled"),
            }
            if let Some(error) = session.last_error() {
                println!("last error: {}", error);
            }
        }
        Commands::Refresh => match session.refresh().await {
            Some(_) => println!("Access token refreshed"),
            None => {
                let reason = session.last_error().unwrap_or_else(|| "Refresh failed".to_string());
                bail!(reason);
            }
        },
        Commands::Register {
            username,
            email,
            first_name,
            last_name,
        } => {
            let password = prompt_password("Password")?;
            let confirm = prompt_password("Confirm password")?;
            if password != confirm {
                bail!("Passwords do not match");
            }
            let request = RegisterRequest {
                username,
                email,
                password,
                first_name,
                last_name,
            };
            session.register(&request).await?;
            println!("Account created. Run `quill login {}` to sign in.", request.email);
        }
        Commands::Profile { field, value } => {
            let value = Some(value.join(" ")).filter(|v| !v.trim().is_empty());
            let user = session.update_profile(&field.update(value)).await?;
            println!("Profile updated for {}", user.display_name());
        }
        Commands::Get { path } => send(session, Method::GET, &path).await?,
        Commands::Delete { path } => send(session, Method::DELETE, &path).await?,
    }
    Ok(())
}

async fn send(session: &SessionManager, method: Method, path: &str) -> Result<()> {
    let response = session.authenticated_request(method, path, None).await?;
    let status = response.status();
    let body = response.text().await.context("Failed to read response body")?;
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", body),
    }
    if !status.is_success() {
        bail!("Request failed with status {}", status);
    }
    Ok(())
}
