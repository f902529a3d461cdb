//! loot-claims
//!
//! The server side of the reward-claim protocol:
//!
//! - [`RateLimiter`]  fixed-window counters per (identity, endpoint)
//! - [`NonceIssuer`]  single-use, time-boxed challenge tokens
//! - [`ClaimLedger`]  the exactly-once gate, atomic with the reward mutation
//! - [`ClaimApplier`] the full `apply` flow and its rejection taxonomy
//!
//! All cross-request coordination lives in the store. Nothing here keeps
//! mutable state between calls, so any number of service instances can run
//! side by side.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use loot_config::LootConfig;
use loot_db::{Store, StoreError};
use loot_schemas::{Clock, RejectReason};

mod applier;
mod ledger;
mod nonce;
mod rate_limit;

pub use applier::{ClaimApplier, MAX_CLAIM_KEY_LEN};
pub use loot_schemas::ClaimRequest;
pub use ledger::ClaimLedger;
pub use nonce::{NonceError, NonceIssuer};
pub use rate_limit::RateLimiter;

/// Run a store call under a deadline. Expiry is reported as
/// [`StoreError::Timeout`].
pub(crate) async fn within<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(StoreError::Timeout),
    }
}

/// Map a store failure to the wire taxonomy.
pub fn reject_reason_for(err: &StoreError) -> RejectReason {
    match err {
        StoreError::Timeout => RejectReason::Timeout,
        StoreError::NotFound(_) => RejectReason::IdentityUnverified,
        StoreError::Transient(_) | StoreError::Constraint(_) | StoreError::Corrupt(_) => {
            RejectReason::TransientStoreError
        }
    }
}

/// Everything the claim endpoints need, wired from one config.
#[derive(Clone)]
pub struct ClaimEngine {
    pub limiter: Arc<RateLimiter>,
    pub nonces: Arc<NonceIssuer>,
    pub ledger: Arc<ClaimLedger>,
    pub applier: Arc<ClaimApplier>,
}

impl ClaimEngine {
    pub fn from_config(store: Arc<dyn Store>, clock: Arc<dyn Clock>, cfg: &LootConfig) -> Self {
        let timeout = cfg.claims.store_timeout();
        let limiter = Arc::new(RateLimiter::new(store.clone(), clock.clone(), timeout));
        let nonces = Arc::new(NonceIssuer::new(
            store.clone(),
            clock.clone(),
            limiter.clone(),
            chrono::Duration::seconds(i64::from(cfg.nonce.ttl_secs)),
            cfg.rate_limits.nonce_issue,
            timeout,
        ));
        let ledger = Arc::new(ClaimLedger::new(store.clone(), timeout));
        let applier = Arc::new(ClaimApplier::new(
            store,
            limiter.clone(),
            nonces.clone(),
            ledger.clone(),
            clock,
            cfg.rate_limits.claim_submit,
            cfg.claims.reward_limits(),
            timeout,
        ));
        Self {
            limiter,
            nonces,
            ledger,
            applier,
        }
    }
}
