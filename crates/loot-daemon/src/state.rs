//! Shared runtime state for loot-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. Nothing here holds
//! cross-request coordination state: nonces, claim keys and rate-limit
//! buckets all live in the store, so several daemons can share one database.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use loot_claims::ClaimEngine;
use loot_config::{LootConfig, RateLimits};
use loot_config::secrets::ResolvedSecrets;
use loot_db::{Store, StoreError};
use loot_reconcile::{BatchReport, Reconciler, TrustDirection};
use loot_schemas::{Clock, Identity};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// BusMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat {
        ts_millis: i64,
    },
    ClaimApplied {
        identity: Identity,
        claim_key: String,
        duplicate: bool,
    },
    ReconcileFinished(ReconcileSummary),
    LogLine {
        level: String,
        msg: String,
    },
}

impl BusMsg {
    pub fn event_name(&self) -> &'static str {
        match self {
            BusMsg::Heartbeat { .. } => "heartbeat",
            BusMsg::ClaimApplied { .. } => "claim_applied",
            BusMsg::ReconcileFinished(_) => "reconcile_finished",
            BusMsg::LogLine { .. } => "log",
        }
    }
}

// ---------------------------------------------------------------------------
// BuildInfo / StatusSnapshot
// ---------------------------------------------------------------------------

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Totals of the most recent reconciliation pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub direction: TrustDirection,
    pub finished_at: DateTime<Utc>,
    pub accounts: usize,
    pub failures: usize,
    pub added: usize,
    pub removed: usize,
}

impl From<&BatchReport> for ReconcileSummary {
    fn from(r: &BatchReport) -> Self {
        Self {
            direction: r.direction,
            finished_at: r.finished_at,
            accounts: r.accounts(),
            failures: r.failures(),
            added: r.total_added(),
            removed: r.total_removed(),
        }
    }
}

/// Returned by GET /v1/status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_uptime_secs: u64,
    /// "postgres" | "memory"
    pub store: String,
    pub store_ok: bool,
    pub reconcile_direction: TrustDirection,
    pub last_reconcile: Option<ReconcileSummary>,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub claims: ClaimEngine,
    pub reconciler: Reconciler,
    pub rate_limits: RateLimits,
    pub store_timeout: Duration,
    secrets: ResolvedSecrets,
    last_reconcile: RwLock<Option<ReconcileSummary>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        cfg: &LootConfig,
        secrets: ResolvedSecrets,
    ) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        let claims = ClaimEngine::from_config(store.clone(), clock.clone(), cfg);
        let reconciler = Reconciler::new(
            store.clone(),
            clock.clone(),
            cfg.reconcile.direction,
            cfg.reconcile.concurrency,
            cfg.claims.store_timeout(),
        );
        Self {
            bus,
            build: BuildInfo {
                service: "loot-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            store,
            clock,
            claims,
            reconciler,
            rate_limits: cfg.rate_limits.clone(),
            store_timeout: cfg.claims.store_timeout(),
            secrets,
            last_reconcile: RwLock::new(None),
        }
    }

    pub fn admin_token_matches(&self, presented: &str) -> bool {
        self.secrets.admin_token_matches(presented)
    }

    pub async fn last_reconcile(&self) -> Option<ReconcileSummary> {
        self.last_reconcile.read().await.clone()
    }

    /// Run one reconciliation pass, record its summary and announce it on
    /// the bus. `direction` overrides the configured one for this pass.
    pub async fn run_reconcile(
        &self,
        filter: &[Identity],
        direction: Option<TrustDirection>,
    ) -> Result<BatchReport, StoreError> {
        let report = match direction {
            Some(d) if d != self.reconciler.direction() => {
                self.reconciler.with_direction(d).reconcile_all(filter).await?
            }
            _ => self.reconciler.reconcile_all(filter).await?,
        };
        let summary = ReconcileSummary::from(&report);
        *self.last_reconcile.write().await = Some(summary.clone());
        let _ = self.bus.send(BusMsg::ReconcileFinished(summary));
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// One scheduled maintenance tick: a fleet-wide reconciliation pass, then a
/// purge of nonces that expired before this tick and of rate-limit buckets
/// older than the longest configured window.
pub async fn maintenance_tick(state: &AppState) {
    match state.run_reconcile(&[], None).await {
        Ok(report) if report.failures() > 0 => {
            let _ = state.bus.send(BusMsg::LogLine {
                level: "WARN".to_string(),
                msg: format!(
                    "scheduled reconcile: {} of {} accounts failed",
                    report.failures(),
                    report.accounts()
                ),
            });
        }
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "scheduled reconcile could not list accounts");
            let _ = state.bus.send(BusMsg::LogLine {
                level: "ERROR".to_string(),
                msg: format!("scheduled reconcile failed: {e}"),
            });
        }
    }

    let before = state.clock.now();
    match tokio::time::timeout(state.store_timeout, state.store.purge_expired_nonces(before)).await
    {
        Ok(Ok(n)) if n > 0 => info!(purged = n, "expired nonces purged"),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "nonce purge failed"),
        Err(_) => warn!("nonce purge timed out"),
    }

    let stale = before - chrono::Duration::seconds(i64::from(state.rate_limits.longest_window_secs()));
    match tokio::time::timeout(state.store_timeout, state.store.purge_stale_buckets(stale)).await {
        Ok(Ok(n)) if n > 0 => info!(purged = n, "stale rate-limit buckets purged"),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "bucket purge failed"),
        Err(_) => warn!("bucket purge timed out"),
    }
}

/// Spawn the scheduled maintenance loop. The first tick runs one interval
/// after startup.
pub fn spawn_maintenance(state: Arc<AppState>, interval: Duration) {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            maintenance_tick(&state).await;
        }
    });
}
