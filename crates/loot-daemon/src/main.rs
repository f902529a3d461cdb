//! loot-daemon entry point.
//!
//! Sets up tracing, resolves config and secrets, picks the store, wires
//! middleware and starts the HTTP server. All route handlers live in
//! `routes.rs`; all shared state types live in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use loot_config::{report_unused_keys, secrets, ConfigMode, UnusedKeyPolicy};
use loot_daemon::{routes, state};
use loot_db::{MemStore, PgStore, Store};
use loot_schemas::SystemClock;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

/// Dev-only switch: `LOOT_STORE=memory` runs without Postgres.
const ENV_STORE: &str = "LOOT_STORE";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience).
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let loaded = loot_config::load_from_env().context("load config")?;
    let cfg = loaded.typed()?;
    let unused = report_unused_keys(ConfigMode::Daemon, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !unused.is_clean() {
        warn!(keys = ?unused.unused_leaf_pointers, "config keys not consumed by the daemon");
    }

    let memory_store = std::env::var(ENV_STORE).is_ok_and(|v| v.trim() == "memory");
    let secrets =
        secrets::resolve_secrets_for_mode(&loaded.config_json, ConfigMode::Daemon, memory_store)?;
    if secrets.admin_token.is_none() {
        warn!(
            env = %secrets.admin_token_env,
            "admin token not set; /v1/admin/* will refuse every call"
        );
    }

    let store: Arc<dyn Store> = match secrets.database_url.as_deref() {
        Some(url) if !memory_store => {
            let pool = loot_db::connect(url).await?;
            loot_db::migrate(&pool).await?;
            Arc::new(PgStore::new(pool))
        }
        _ => {
            warn!("LOOT_STORE=memory: state is process-local and lost on exit");
            Arc::new(MemStore::new())
        }
    };

    info!(
        config_hash = %loaded.config_hash,
        store = store.kind(),
        direction = cfg.reconcile.direction.as_str(),
        "loot-daemon starting"
    );

    let shared = Arc::new(state::AppState::new(
        store,
        Arc::new(SystemClock),
        &cfg,
        secrets,
    ));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    if cfg.reconcile.interval_secs > 0 {
        state::spawn_maintenance(
            Arc::clone(&shared),
            Duration::from_secs(cfg.reconcile.interval_secs),
        );
    }

    let app = routes::build_router(Arc::clone(&shared))
        .layer(TimeoutLayer::new(Duration::from_millis(
            cfg.daemon.request_timeout_ms,
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("loot-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("LOOT_DAEMON_ADDR").ok()?.parse().ok()
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
