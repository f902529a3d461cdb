use std::sync::Arc;
use std::time::Duration;

use loot_db::{BucketHit, Store};
use loot_schemas::{Clock, EndpointClass, Identity, RateLimitPolicy};
use tracing::{debug, warn};

use crate::within;

/// Fixed-window request counter keyed by (identity, endpoint).
///
/// The counting itself is one conditional upsert in the store. When the
/// store cannot answer, `Mutating` endpoints are denied and `Read` endpoints
/// are allowed.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    pub async fn check(&self, identity: &Identity, endpoint: &str, policy: &RateLimitPolicy) -> bool {
        let now = self.clock.now();
        let hit = within(
            self.timeout,
            self.store.rate_limit_hit(identity, endpoint, policy, now),
        )
        .await;

        match hit {
            Ok(BucketHit::Counted { count }) => {
                debug!(%identity, endpoint, count, max = policy.max_requests, "rate limit counted");
                true
            }
            Ok(BucketHit::Exhausted) => {
                warn!(%identity, endpoint, max = policy.max_requests, window_secs = policy.window_secs, "rate limited");
                false
            }
            Err(e) => match policy.class {
                EndpointClass::Mutating => {
                    warn!(%identity, endpoint, error = %e, "rate limit store unavailable; failing closed");
                    false
                }
                EndpointClass::Read => {
                    warn!(%identity, endpoint, error = %e, "rate limit store unavailable; failing open");
                    true
                }
            },
        }
    }
}
