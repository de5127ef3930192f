use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use reqwest::Method;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;

use bearer_session::auth::{CredentialStore, IssuedTokens, SessionManager};
use bearer_session::config::{parse_scope, Command, Config, LogFormat};
use bearer_session::http_client::{RequestBody, RequestOptions, SessionHttpClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;
    config.check_command(&command)?;

    init_logging(&config);
    tracing::debug!("Configuration: {:?}", config);

    let store = CredentialStore::open(&config.db_file).with_context(|| {
        format!(
            "Failed to open credential store: {}",
            config.db_file.display()
        )
    })?;

    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(config.http_connect_timeout))
        .timeout(std::time::Duration::from_secs(config.http_request_timeout))
        .build()
        .context("Failed to create HTTP client")?;

    let session = SessionManager::new(store, client.clone(), config.renewal_url()?);
    let expired = Arc::new(Notify::new());
    let on_expired = Arc::clone(&expired);
    session.set_unauthorized_handler(Some(Arc::new(move || {
        on_expired.notify_one();
        tracing::error!("❌ Session expired and could not be renewed");
        tracing::error!("   Import a new token pair:");
        tracing::error!("      bearer-session import --access-token .. --refresh-token .. --expires-in ..");
    })));

    match command {
        Command::Import {
            access_token,
            refresh_token,
            expires_in,
        } => {
            let tokens = IssuedTokens::new(access_token, refresh_token, expires_in);
            let pair = session.store().save(tokens, Some(config.storage_scope))?;
            println!(
                "✅ Stored token pair ({}), expires {}",
                config.storage_scope,
                format_expiry(pair.expires_at)
            );
        }

        Command::Status => print_status(&session),

        Command::Renew => {
            if session.renew().await.is_renewed() {
                println!("✅ Token pair renewed");
                print_status(&session);
            } else {
                anyhow::bail!("Token renewal failed");
            }
        }

        Command::Request {
            target,
            method,
            data,
            no_auth,
        } => {
            let http = SessionHttpClient::with_client(client, session.clone(), config.base_url()?);
            let options = build_request_options(&method, data.as_deref(), no_auth)?;

            match http.execute(&target, options).await {
                Ok(body) => println!("{}", body),
                Err(e) => {
                    if let Some(body) = e.body() {
                        eprintln!("{}", body);
                    }
                    return Err(e.into());
                }
            }
        }

        Command::Watch => keep_alive(&session, &expired, shutdown_signal()).await?,

        Command::Migrate { scope } => {
            let scope = parse_scope(&scope)?;
            session.store().migrate(scope)?;
            println!("✅ Session stored in {} scope", scope);
        }

        Command::Logout => {
            session.logout();
            println!("✅ Logged out");
        }
    }

    Ok(())
}

/// Keep the session renewed until `shutdown` resolves or renewal fails
async fn keep_alive(
    session: &SessionManager,
    expired: &Notify,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    if !session.resume() {
        anyhow::bail!("No stored session to keep alive");
    }
    // An already-expired pair arms no timer
    if session.store().is_expired(0) && !session.renew().await.is_renewed() {
        anyhow::bail!("Session could not be renewed");
    }

    tracing::info!("👀 Keeping session alive, press Ctrl+C to stop");
    tokio::select! {
        _ = shutdown => {
            session.scheduler().cancel();
            tracing::info!("👋 Stopped");
            Ok(())
        }
        _ = expired.notified() => anyhow::bail!("Session could not be renewed"),
    }
}

/// Initialize logging with the configured level and format
fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn build_request_options(method: &str, data: Option<&str>, no_auth: bool) -> Result<RequestOptions> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;

    let body = match data {
        Some(raw) => RequestBody::Json(
            serde_json::from_str(raw).context("Request data must be valid JSON")?,
        ),
        None => RequestBody::None,
    };

    let options = RequestOptions::default().method(method).body(body);
    Ok(if no_auth { options.without_auth() } else { options })
}

fn print_status(session: &SessionManager) {
    let store = session.store();
    match store.current() {
        Some(pair) => {
            let scope = store
                .active_scope()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!("Scope:         {}", scope);
            println!(
                "Access token:  {}...",
                pair.access_token.chars().take(12).collect::<String>()
            );
            println!("Expires:       {}", format_expiry(pair.expires_at));
            println!(
                "State:         {}",
                if store.is_expired(0) { "expired" } else { "valid" }
            );
        }
        None => println!("No stored session (preferred scope: {})", store.preferred_scope()),
    }
}

fn format_expiry(expires_at: i64) -> String {
    Utc.timestamp_millis_opt(expires_at)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| expires_at.to_string())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    async fn failing_session(server: &mut mockito::Server) -> (SessionManager, Arc<Notify>) {
        server
            .mock("POST", "/auth/refresh")
            .with_status(500)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/auth/refresh", server.url())).unwrap();
        let session = SessionManager::new(CredentialStore::in_memory(), reqwest::Client::new(), url);
        let expired = Arc::new(Notify::new());
        let on_expired = Arc::clone(&expired);
        session.set_unauthorized_handler(Some(Arc::new(move || on_expired.notify_one())));
        (session, expired)
    }

    #[tokio::test]
    async fn test_keep_alive_without_session() {
        let mut server = mockito::Server::new_async().await;
        let (session, expired) = failing_session(&mut server).await;

        let result = keep_alive(&session, &expired, std::future::ready(())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_keep_alive_stops_on_shutdown() {
        let mut server = mockito::Server::new_async().await;
        let (session, expired) = failing_session(&mut server).await;
        session
            .start_session(IssuedTokens::new("A1", "R1", 3600), None)
            .unwrap();

        let result = keep_alive(&session, &expired, std::future::ready(())).await;
        assert!(result.is_ok());
        assert!(!session.scheduler().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_exits_when_renewal_fails() {
        let mut server = mockito::Server::new_async().await;
        let (session, expired) = failing_session(&mut server).await;
        session
            .start_session(IssuedTokens::new("A1", "R1", 10), None)
            .unwrap();

        let result = keep_alive(&session, &expired, std::future::pending()).await;
        assert!(result.is_err());
        assert!(session.store().current().is_none());
    }

    #[tokio::test]
    async fn test_keep_alive_renews_expired_pair_first() {
        let mut server = mockito::Server::new_async().await;
        let (session, expired) = failing_session(&mut server).await;
        session
            .start_session(IssuedTokens::new("A1", "R1", -5), None)
            .unwrap();

        let result = keep_alive(&session, &expired, std::future::pending()).await;
        assert!(result.is_err());
        assert!(session.store().current().is_none());
    }
}
