use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use dialoguer::{Input, Password};
use reqwest::Url;
use std::path::PathBuf;

/// Application name used for the data directory
const APP_NAME: &str = "crm-client";

/// Cache database file name
const CACHE_DB_FILE: &str = "session.sqlite3";

/// CRM Client - authenticated access to the CRM API
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// API origin, e.g. https://crm.example.com/api/
    #[arg(short = 'b', long, env = "CRM_API_BASE_URL", default_value = "http://127.0.0.1:8000")]
    pub base_url: String,

    /// Show user-facing notifications (session expired, signed out)
    #[arg(long, env = "CRM_NOTIFICATIONS", default_value = "true", action = ArgAction::Set)]
    pub notifications: bool,

    /// Path to the session cache database
    #[arg(long, env = "CRM_CACHE_DB")]
    pub cache_db: Option<String>,

    /// Refresh exchange timeout in seconds
    #[arg(long, env = "REFRESH_TIMEOUT", default_value = "10")]
    pub refresh_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Sign in and store the session
    Login {
        /// Username (prompted when omitted)
        #[arg(short, long, env = "CRM_USERNAME")]
        username: Option<String>,
    },

    /// Sign out and wipe the stored session
    Logout,

    /// Show the signed-in user and credential expiry
    Status,

    /// Send an authenticated request and print the response body
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,

        /// Path relative to the API origin, e.g. /leads
        path: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub base_url: Url,

    // Session
    pub cache_db: PathBuf,
    pub refresh_timeout: u64,
    pub token_refresh_threshold: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Presentation
    pub notifications_enabled: bool,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Defaults for the given API origin
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            cache_db: default_cache_db(),
            refresh_timeout: 10,
            token_refresh_threshold: 0,
            http_max_connections: 20,
            http_connect_timeout: 10,
            http_request_timeout: 30,
            notifications_enabled: true,
            log_level: "warn".to_string(),
            log_format: LogFormat::Text,
        }
    }

    /// Build configuration with priority: CLI > ENV > defaults.
    /// `.env` must already be loaded so clap sees its values.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let base_url = Url::parse(&args.base_url)
            .with_context(|| format!("CRM_API_BASE_URL is not a valid URL: {}", args.base_url))?;

        let config = Config {
            base_url: normalize_base_url(base_url),

            cache_db: args
                .cache_db
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(default_cache_db),

            refresh_timeout: args.refresh_timeout,

            token_refresh_threshold: env_or("TOKEN_REFRESH_THRESHOLD", 0),

            http_max_connections: env_or("HTTP_MAX_CONNECTIONS", 20),

            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),

            http_request_timeout: args.http_timeout,

            notifications_enabled: args.notifications,

            log_level: args.log_level.clone(),

            log_format: parse_log_format(&args.log_format),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.base_url.scheme() {
            "http" | "https" => {}
            other => anyhow::bail!("CRM_API_BASE_URL must be http or https, got {}", other),
        }

        if self.refresh_timeout == 0 {
            anyhow::bail!("REFRESH_TIMEOUT must be greater than zero");
        }
        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        Ok(())
    }
}

/// Read a numeric setting from the environment, falling back to a default
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Make relative joins land under the base path: `/api` becomes `/api/`
fn normalize_base_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn default_cache_db() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
        .join(CACHE_DB_FILE)
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

// === Interactive Login ===

/// Prompt for whatever sign-in details were not supplied
pub fn prompt_login(username: Option<String>) -> Result<(String, String)> {
    let username = match username {
        Some(username) => username,
        None => Input::new()
            .with_prompt("Username")
            .interact_text()
            .context("Failed to read username")?,
    };

    let password = Password::new()
        .with_prompt("Password")
        .interact()
        .context("Failed to read password")?;

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    Ok((username, password))
}
