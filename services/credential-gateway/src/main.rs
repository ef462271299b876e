//! Credential Gateway
//!
//! Single-binary service that:
//! 1. Authenticates a pool of sessions as one configured identity
//! 2. Exposes password change and login verification over HTTP
//! 3. Keeps idle sessions alive and persists rotated pool passwords
//! 4. Logs off every session on shutdown

mod api;
mod config;
mod error;
mod metrics;

use anyhow::{Context, Result};
use endpoint::{HttpEndpoint, MemoryEndpoint, ServerEndpoint};
use session::{Identity, IdentityStore};
use session_pool::{RotationEvent, SessionPool, spawn_keepalive_task};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{AdminSession, AppState, build_router};
use crate::config::{Config, EndpointKind, IdentityConfig};

/// How long in-flight requests may take to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

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

    info!("starting credential-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

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
        listen_addr = %config.gateway.listen_addr,
        endpoint = ?config.endpoint.kind,
        user = %config.identity.user,
        admin = config.admin.is_some(),
        pool_min = config.pool.min,
        pool_max = config.pool.max,
        "configuration loaded"
    );

    let store = match &config.identity_store {
        Some(path) => Some(Arc::new(
            IdentityStore::load(path.clone())
                .await
                .with_context(|| format!("failed to load identity store {}", path.display()))?,
        )),
        None => None,
    };

    let identity = resolve_identity(&config.identity, "GATEWAY_PASSWORD", store.as_deref()).await?;
    let admin_identity = match &config.admin {
        Some(admin) => Some(resolve_identity(admin, "ADMIN_PASSWORD", None).await?),
        None => None,
    };

    let endpoint = build_endpoint(&config, &identity, admin_identity.as_ref()).await?;
    let connect_string = config.endpoint.connect_string.clone();

    let pool = SessionPool::create(
        Arc::clone(&endpoint),
        identity,
        connect_string.clone(),
        config.pool.clone(),
    )
    .await
    .context("failed to create session pool")?;

    let admin = match &admin_identity {
        Some(identity) => Some(Arc::new(
            AdminSession::connect(Arc::clone(&endpoint), identity, &connect_string)
                .await
                .context("failed to establish administrator session")?,
        )),
        None => None,
    };

    let keepalive = spawn_keepalive_task(pool.clone(), config.pool.keepalive_interval);
    let persister = store
        .clone()
        .map(|store| spawn_persist_task(pool.subscribe(), store));

    let app_state = AppState {
        pool: pool.clone(),
        endpoint,
        connect_string,
        admin: admin.clone(),
        store,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.gateway.max_connections);
    let listen_addr = config.gateway.listen_addr;

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
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

    keepalive.abort();
    let _ = keepalive.await;
    if let Some(admin) = admin {
        admin.close().await;
    }
    if let Err(e) = pool.close().await {
        warn!(error = %e, "session pool close failed");
    }
    // The persist task ends once the last pool handle is gone
    drop(pool);
    if let Some(persister) = persister {
        let _ = tokio::time::timeout(Duration::from_secs(5), persister).await;
    }

    info!("shutdown complete");
    Ok(())
}

/// Resolve the password for a configured identity.
///
/// A password recorded in the identity store is newer than the configured one
/// and wins. A configured identity missing from the store is added to it.
async fn resolve_identity(
    config: &IdentityConfig,
    env_var: &'static str,
    store: Option<&IdentityStore>,
) -> error::Result<Identity> {
    if let Some(store) = store {
        if let Some(stored) = store.get(&config.user).await {
            info!(user = %config.user, "using password from identity store");
            return Ok(stored);
        }
    }

    let password = config
        .password
        .clone()
        .ok_or_else(|| {
            common::Error::MissingSecret(format!(
                "password for {}: set {env_var} or password_file",
                config.user
            ))
        })?;
    let identity = Identity::new(config.user.clone(), password);

    if let Some(store) = store {
        store.put(&identity).await?;
    }
    Ok(identity)
}

/// Construct the configured endpoint.
///
/// The memory endpoint starts empty, so the configured identities are created
/// in it (the administrator with administrator privilege).
async fn build_endpoint(
    config: &Config,
    identity: &Identity,
    admin: Option<&Identity>,
) -> error::Result<Arc<dyn ServerEndpoint>> {
    match config.endpoint.kind {
        EndpointKind::Memory => {
            let endpoint = MemoryEndpoint::new();
            endpoint
                .create_account(&identity.user, identity.password.expose())
                .await;
            if let Some(admin) = admin {
                endpoint
                    .create_account(&admin.user, admin.password.expose())
                    .await;
                endpoint.grant_administrator(&admin.user).await?;
            }
            warn!("using in-memory credential endpoint; accounts are not persisted");
            Ok(Arc::new(endpoint))
        }
        EndpointKind::Http => {
            let url = config.endpoint.url.clone().unwrap_or_default();
            let timeout = Duration::from_secs(config.endpoint.timeout_secs);
            info!(
                url = %url,
                timeout_secs = config.endpoint.timeout_secs,
                "using HTTP credential endpoint"
            );
            Ok(Arc::new(HttpEndpoint::new(reqwest::Client::new(), url, timeout)))
        }
    }
}

/// Persist every rotation the pool adopts to the identity store.
///
/// Ends when the pool is dropped and the channel closes.
fn spawn_persist_task(
    mut events: broadcast::Receiver<RotationEvent>,
    store: Arc<IdentityStore>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match store.update_password(&event.user, &event.password).await {
                    Ok(()) => debug!(
                        user = %event.user,
                        policy = event.policy.label(),
                        "persisted rotated password"
                    ),
                    Err(e) => warn!(
                        user = %event.user,
                        error = %e,
                        "failed to persist rotated password"
                    ),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "rotation events dropped before they could be persisted");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
