use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;

use crate::auth::StorageScope;

/// Bearer Session - token lifecycle and authenticated requests
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Token renewal endpoint
    #[arg(short = 'r', long, env = "RENEWAL_URL")]
    pub renewal_url: Option<String>,

    /// Base URL for relative request targets
    #[arg(short = 'b', long, env = "API_BASE_URL")]
    pub base_url: Option<String>,

    /// Path to the durable credential database
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Default storage scope (local, session)
    #[arg(long, env = "SESSION_STORAGE_SCOPE", default_value = "local")]
    pub scope: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Store a token pair issued by a login
    Import {
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: String,
        /// Access token lifetime in seconds
        #[arg(long)]
        expires_in: i64,
    },

    /// Show the stored session
    Status,

    /// Renew the token pair now
    Renew,

    /// Execute a request with the stored credentials
    Request {
        /// Absolute URL or path relative to the base URL
        target: String,
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
        /// Send without credentials
        #[arg(long)]
        no_auth: bool,
    },

    /// Keep the session renewed until interrupted
    Watch,

    /// Move the stored session to another scope
    Migrate {
        /// Target scope (local, session)
        scope: String,
    },

    /// Forget the stored session
    Logout,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Endpoints
    pub renewal_url: String,
    pub base_url: Option<String>,

    // Storage
    pub db_file: PathBuf,
    pub storage_scope: StorageScope,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone();
        Ok((Self::from_args(args)?, command))
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            renewal_url: args
                .renewal_url
                .context("RENEWAL_URL is required (use -r or set RENEWAL_URL env var)")?,

            base_url: args.base_url,

            db_file: args
                .db_file
                .map(|s| expand_tilde(&s))
                .or_else(default_db_file)
                .context("SESSION_DB_FILE is required (use -d or set SESSION_DB_FILE env var)")?,

            storage_scope: parse_scope(&args.scope).context("Invalid SESSION_STORAGE_SCOPE")?,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,

            log_level: args.log_level,

            log_format: parse_log_format(&args.log_format),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.renewal_url()?;
        self.base_url()?;
        Ok(())
    }

    /// Reject one-shot commands that would leave the session in the ephemeral
    /// scope. That scope lives in process memory and is gone once the command
    /// exits.
    pub fn check_command(&self, command: &Command) -> Result<()> {
        let target = match command {
            Command::Import { .. } => Some(self.storage_scope),
            Command::Migrate { scope } => Some(parse_scope(scope)?),
            _ => None,
        };

        if target == Some(StorageScope::Ephemeral) {
            anyhow::bail!(
                "The '{}' scope does not outlive this process; store the session in the '{}' scope instead",
                StorageScope::Ephemeral,
                StorageScope::Durable
            );
        }
        Ok(())
    }

    pub fn renewal_url(&self) -> Result<Url> {
        Url::parse(&self.renewal_url)
            .with_context(|| format!("RENEWAL_URL is not a valid URL: {}", self.renewal_url))
    }

    pub fn base_url(&self) -> Result<Option<Url>> {
        self.base_url
            .as_deref()
            .map(|s| {
                Url::parse(s).with_context(|| format!("API_BASE_URL is not a valid URL: {}", s))
            })
            .transpose()
    }
}

/// Default location of the durable credential database
fn default_db_file() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("bearer-session").join("session.sqlite3"))
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

/// Parse a storage scope name (local, session)
pub fn parse_scope(s: &str) -> Result<StorageScope> {
    s.parse().map_err(|e: String| anyhow::anyhow!(e))
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["bearer-session"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_parse_log_format() {
        assert_eq!(parse_log_format("json"), LogFormat::Json);
        assert_eq!(parse_log_format("JSON"), LogFormat::Json);
        assert_eq!(parse_log_format("text"), LogFormat::Text);
        assert_eq!(parse_log_format("anything"), LogFormat::Text);
    }

    #[test]
    fn test_from_args() {
        let config = Config::from_args(args(&[
            "-r",
            "https://auth.example.test/refresh",
            "-d",
            "/tmp/session.sqlite3",
            "--scope",
            "session",
            "status",
        ]))
        .unwrap();

        assert_eq!(config.renewal_url, "https://auth.example.test/refresh");
        assert_eq!(config.db_file, PathBuf::from("/tmp/session.sqlite3"));
        assert_eq!(config.storage_scope, StorageScope::Ephemeral);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_scope_is_rejected() {
        let result = Config::from_args(args(&[
            "-r",
            "https://auth.example.test/refresh",
            "-d",
            "/tmp/session.sqlite3",
            "--scope",
            "cookie",
            "status",
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        let mut config = Config::from_args(args(&[
            "-r",
            "not a url",
            "-d",
            "/tmp/session.sqlite3",
            "status",
        ]))
        .unwrap();
        assert!(config.validate().is_err());

        config.renewal_url = "https://auth.example.test/refresh".to_string();
        config.base_url = Some("::nope".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_one_shot_commands_reject_ephemeral_scope() {
        let ephemeral = Config::from_args(args(&[
            "-r",
            "https://auth.example.test/refresh",
            "-d",
            "/tmp/session.sqlite3",
            "--scope",
            "session",
            "status",
        ]))
        .unwrap();
        let import = args(&["import", "--access-token", "A", "--refresh-token", "R", "--expires-in", "3600"]).command;

        assert!(ephemeral.check_command(&import).is_err());
        assert!(ephemeral.check_command(&Command::Status).is_ok());
        assert!(ephemeral.check_command(&Command::Watch).is_ok());

        let durable = Config {
            storage_scope: StorageScope::Durable,
            ..ephemeral
        };
        assert!(durable.check_command(&import).is_ok());
        assert!(durable
            .check_command(&Command::Migrate { scope: "session".to_string() })
            .is_err());
        assert!(durable
            .check_command(&Command::Migrate { scope: "local".to_string() })
            .is_ok());
        assert!(durable
            .check_command(&Command::Migrate { scope: "cookie".to_string() })
            .is_err());
    }

    #[test]
    fn test_request_subcommand() {
        let parsed = args(&["request", "/users", "-X", "POST", "--data", "{}", "--no-auth"]);
        match parsed.command {
            Command::Request {
                target,
                method,
                data,
                no_auth,
            } => {
                assert_eq!(target, "/users");
                assert_eq!(method, "POST");
                assert_eq!(data.as_deref(), Some("{}"));
                assert!(no_auth);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
