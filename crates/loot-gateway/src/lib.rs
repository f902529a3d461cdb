//! loot-gateway
//!
//! Client side of the claim protocol. [`MutationGateway`] keeps one player's
//! client from resending the same mutation while it is in flight or just
//! completed; [`ClaimClient`] runs nonce-then-claim with backoff;
//! [`HttpTransport`] talks to loot-daemon.
//!
//! Suppression here is best-effort. Exactly-once is the server ledger's job.

use std::path::PathBuf;
use std::sync::Arc;

use loot_config::GatewaySettings;
use loot_schemas::SystemClock;

mod client;
mod gateway;
mod guard;
mod transport;

pub use client::ClaimClient;
pub use gateway::{Mutation, MutationGateway, MutationResult, SkipReason, Submission};
pub use guard::{FileGuardStore, GuardState, GuardStore, MemGuardStore, PendingMutationGuard};
pub use transport::{HttpTransport, Transport, TransportError};

/// Gateway over HTTP with a file-backed guard store shared by every client
/// instance pointed at `guard_file`.
pub fn http_gateway(
    base_url: &str,
    guard_file: impl Into<PathBuf>,
    settings: &GatewaySettings,
) -> anyhow::Result<MutationGateway> {
    let transport = HttpTransport::new(
        base_url,
        std::time::Duration::from_millis(settings.request_timeout_ms),
    )?;
    Ok(MutationGateway::new(
        Arc::new(transport),
        Arc::new(FileGuardStore::new(guard_file)),
        Arc::new(SystemClock),
        settings,
    ))
}
