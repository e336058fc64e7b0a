//! Summon bot credential and chat service
//!
//! Single-binary Rust service that:
//! 1. Keeps App, User and Chat tokens fresh ahead of expiry
//! 2. Keeps the bot joined to its Twitch channel across token rotations and
//!    dropped connections
//! 3. Reports persistent failures to a Discord error webhook
//! 4. Serves an operator API for status, manual refresh and reconnect

mod api;
mod config;
mod discord;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chat_supervisor::{
    ChatMessage, ChatTokenSource, ConnectionSupervisor, IrcTransport, SupervisorConfig,
    spawn_health_probe,
};
use common::{LogSink, NotificationSink};
use credential_store::{CredentialStore, SystemClock, spawn_monitor_task};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use twitch_auth::{
    ClientCredentials, CredentialClass, Endpoints, OAuthClient, RecordStore, RequestLimiter,
};

use crate::api::{AppState, build_router};
use crate::config::Config;
use crate::discord::DiscordSink;

/// How long in-flight API requests get to finish after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting summon-bot");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        channel = %config.bot.channel,
        bot_username = %config.bot.username,
        token_dir = %config.storage.token_dir.display(),
        discord = config.discord.error_webhook_url.is_some(),
        "configuration loaded"
    );

    let http = reqwest::Client::new();
    let sink: Arc<dyn NotificationSink> = match &config.discord.error_webhook_url {
        Some(url) => Arc::new(DiscordSink::new(http.clone(), url.clone())),
        None => {
            warn!("no discord error webhook configured, notifications go to the log only");
            Arc::new(LogSink)
        }
    };

    // --- Credentials ---
    let records = RecordStore::new(&config.storage.token_dir);
    let oauth = oauth_client(&config, &records).await?;
    info!(
        token_url = %oauth.endpoints().token_url,
        app = oauth.is_configured(CredentialClass::App),
        user = oauth.is_configured(CredentialClass::User),
        chat = oauth.is_configured(CredentialClass::Chat),
        "identity client ready"
    );

    let tokens = &config.tokens;
    let store = CredentialStore::new(Arc::new(oauth), sink.clone(), Arc::new(SystemClock))
        .with_records(records)
        .with_seed(
            CredentialClass::User,
            tokens.user_access_token.as_ref().map(|s| s.expose().clone()),
            tokens.user_refresh_token.as_ref().map(|s| s.expose().clone()),
        )
        .with_seed(
            CredentialClass::Chat,
            tokens.chat_access_token.as_ref().map(|s| s.expose().clone()),
            tokens.chat_refresh_token.as_ref().map(|s| s.expose().clone()),
        );
    store.load_persisted().await;
    let store = Arc::new(store);

    let mut background: Vec<JoinHandle<()>> = CredentialClass::ALL
        .into_iter()
        .filter(|class| store.is_configured(*class))
        .map(|class| spawn_monitor_task(store.clone(), class, class.monitor_interval()))
        .collect();

    // --- Chat ---
    let transport = Arc::new(IrcTransport::new(config.bot.irc_url.clone()));
    background.push(spawn_chat_log(transport.subscribe()));

    let mut supervisor_config =
        SupervisorConfig::new(config.bot.channel.clone(), config.bot.username.clone());
    supervisor_config.max_attempts = config.bot.max_reconnect_attempts;
    supervisor_config.connect_timeout = Duration::from_secs(config.bot.connect_timeout_secs);

    let chat_tokens: Arc<dyn ChatTokenSource> = store.clone();
    let chat = ConnectionSupervisor::spawn(supervisor_config, transport, chat_tokens, sink);
    if store.is_configured(CredentialClass::Chat) {
        chat.start().await.context("chat supervisor failed to start")?;
        background.push(spawn_health_probe(
            chat.clone(),
            Duration::from_secs(config.bot.health_probe_secs),
        ));
    } else {
        warn!("no chat credentials configured, staying out of chat");
    }

    // --- Operator API ---
    let app_state = AppState {
        store,
        chat: chat.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Background work stops before the API drains
    for task in &background {
        task.abort();
    }
    chat.shutdown().await;

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Build the identity client and register credentials for every class that
/// can actually mint tokens.
///
/// App needs the broadcaster client secret. User and Chat also need a
/// refresh token, from configuration or from a record saved by a previous
/// run. Chat uses the bot application when one is configured.
async fn oauth_client(config: &Config, records: &RecordStore) -> Result<OAuthClient> {
    let endpoints = Endpoints {
        token_url: config.twitch.token_url.clone(),
        validate_url: config.twitch.validate_url.clone(),
    };
    let limiter = Arc::new(RequestLimiter::new(config.min_request_spacing()));
    let mut client =
        OAuthClient::with_limiter(endpoints, limiter).context("failed to build identity client")?;

    let broadcaster = config
        .twitch
        .client_secret
        .as_ref()
        .map(|secret| ClientCredentials::new(config.twitch.client_id.clone(), secret.clone()));
    let bot = match (&config.twitch.bot_client_id, &config.twitch.bot_client_secret) {
        (Some(id), Some(secret)) => Some(ClientCredentials::new(id.clone(), secret.clone())),
        (Some(_), None) | (None, Some(_)) => {
            warn!("bot client id and secret must be set together, using broadcaster app for chat");
            broadcaster.clone()
        }
        (None, None) => broadcaster.clone(),
    };

    match &broadcaster {
        Some(creds) => client = client.with_credentials(CredentialClass::App, creds.clone()),
        None => warn!("TWITCH_CLIENT_SECRET not set, app and user tokens disabled"),
    }

    let tokens = &config.tokens;
    if let Some(creds) = broadcaster {
        let seeded = tokens.user_refresh_token.is_some();
        if has_refresh_source(seeded, records, CredentialClass::User).await {
            client = client.with_credentials(CredentialClass::User, creds);
        } else {
            warn!("no user refresh token configured or persisted, user token disabled");
        }
    }
    if let Some(creds) = bot {
        let seeded = tokens.chat_refresh_token.is_some();
        if has_refresh_source(seeded, records, CredentialClass::Chat).await {
            client = client.with_credentials(CredentialClass::Chat, creds);
        } else {
            warn!("no chat refresh token configured or persisted, chat token disabled");
        }
    }

    Ok(client)
}

async fn has_refresh_source(
    configured: bool,
    records: &RecordStore,
    class: CredentialClass,
) -> bool {
    configured
        || tokio::fs::try_exists(records.path_for(class))
            .await
            .unwrap_or(false)
}

/// Log chat lines seen in the channel. Command handling lives with the
/// collaborators that subscribe to the same feed.
fn spawn_chat_log(mut messages: broadcast::Receiver<ChatMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(msg) => debug!(
                    user = %msg.username,
                    moderator = msg.is_moderator,
                    broadcaster = msg.is_broadcaster,
                    text = %msg.text,
                    "chat message"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "chat log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
