use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Method;
use std::sync::Arc;

use crm_client::auth::{Notification, NotificationLevel, NotificationSink, SqliteCredentialCache};
use crm_client::config::{self, CliArgs, Command, Config, LogFormat};
use crm_client::{ApiRequest, CrmClient};

/// Writes user-facing notifications to stderr
struct StderrSink;

impl NotificationSink for StderrSink {
    fn notify(&self, notification: Notification) {
        eprintln!("{}", render_notification(&notification));
    }
}

fn render_notification(notification: &Notification) -> String {
    let prefix = match notification.level {
        NotificationLevel::Info => "ℹ️",
        NotificationLevel::Warning => "⚠️",
    };
    format!("{} {}", prefix, notification.message)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before clap reads env fallbacks
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::from_args(&args)?;
    config.validate()?;

    init_logging(&config);
    tracing::debug!(base_url = %config.base_url, "Configuration loaded");

    let cache = Arc::new(SqliteCredentialCache::open(&config.cache_db));
    let navigator = || {
        eprintln!("Sign in with: crm-client login");
    };

    let sink: Arc<dyn NotificationSink> = Arc::new(StderrSink);
    let client = CrmClient::new(config, cache, Some(sink), Arc::new(navigator))?;

    match args.command {
        Command::Login { username } => {
            let (username, password) = config::prompt_login(username)?;
            let identity = client
                .login(&username, &password)
                .await
                .context("Sign-in failed")?;
            println!("✅ Signed in as {} ({:?})", identity.display_name, identity.role);
        }

        Command::Logout => {
            client.restore();
            client.logout().await;
        }

        Command::Status => {
            if client.restore() {
                print_status(&client);
            }
        }

        Command::Request { method, path, data } => {
            if !client.restore() {
                anyhow::bail!("Not signed in");
            }

            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;
            let mut request = ApiRequest::new(method, path);
            if let Some(data) = data {
                let body: serde_json::Value =
                    serde_json::from_str(&data).context("--data must be valid JSON")?;
                request = request.with_body(body);
            }

            let response = client.pipeline().send(request).await?;
            print_body(&response.body);
        }
    }

    Ok(())
}

/// Initialize logging with the configured level and format
fn init_logging(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn print_status(client: &CrmClient) {
    let Some(session) = client.session() else {
        println!("Not signed in");
        return;
    };

    match session.identity {
        Some(ref identity) => println!(
            "  User:     {} (id {}, {:?})",
            identity.display_name, identity.id, identity.role
        ),
        None => println!("  User:     unknown"),
    }
    println!("  API:      {}", client.config().base_url);
    println!("  Issued:   {}", session.issued_at.to_rfc3339());
    println!(
        "  Expires:  {} (estimate)",
        session.expires_at().to_rfc3339()
    );
}

/// Pretty-print JSON bodies, pass anything else through
fn print_body(body: &[u8]) {
    if body.is_empty() {
        return;
    }
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(json) => println!(
            "{}",
            serde_json::to_string_pretty(&json).unwrap_or_default()
        ),
        Err(_) => println!("{}", String::from_utf8_lossy(body)),
    }
}
