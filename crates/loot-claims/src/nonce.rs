use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use loot_db::{NonceConsume, NonceRejection, Store, StoreError};
use loot_schemas::{endpoints, ClaimNonce, Clock, Identity, IssuedNonce, RateLimitPolicy, RejectReason};
use tracing::{info, warn};

use crate::{reject_reason_for, within, RateLimiter};

const TOKEN_BYTES: usize = 32;
const MAX_SESSION_REF_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonceError {
    Rejected(NonceRejection),
    Store(StoreError),
}

impl fmt::Display for NonceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NonceError::Rejected(r) => write!(f, "nonce rejected: {r}"),
            NonceError::Store(e) => write!(f, "nonce store error: {e}"),
        }
    }
}

impl std::error::Error for NonceError {}

/// Issues and consumes claim nonces.
pub struct NonceIssuer {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    ttl: chrono::Duration,
    issue_policy: RateLimitPolicy,
    timeout: Duration,
}

impl NonceIssuer {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        limiter: Arc<RateLimiter>,
        ttl: chrono::Duration,
        issue_policy: RateLimitPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            limiter,
            ttl,
            issue_policy,
            timeout,
        }
    }

    /// Issue a fresh nonce for a registered identity.
    ///
    /// Gated by the `nonce.issue` rate limit. Unregistered identities get
    /// `IDENTITY_UNVERIFIED`.
    pub async fn issue(
        &self,
        identity: &Identity,
        session_ref: &str,
    ) -> Result<IssuedNonce, RejectReason> {
        let session_ref = session_ref.trim();
        if session_ref.is_empty() || session_ref.len() > MAX_SESSION_REF_LEN {
            return Err(RejectReason::InvalidPayload);
        }

        if !self
            .limiter
            .check(identity, endpoints::NONCE_ISSUE, &self.issue_policy)
            .await
        {
            return Err(RejectReason::RateLimited);
        }

        let account = within(self.timeout, self.store.fetch_account(identity))
            .await
            .map_err(|e| {
                warn!(%identity, error = %e, "nonce issue: account lookup failed");
                reject_reason_for(&e)
            })?;
        if account.is_none() {
            warn!(%identity, "nonce issue refused: identity not registered");
            return Err(RejectReason::IdentityUnverified);
        }

        let token = new_token().map_err(|e| {
            warn!(error = %e, "nonce token generation failed");
            RejectReason::TransientStoreError
        })?;
        let issued_at = self.clock.now();
        let nonce = ClaimNonce {
            token,
            identity: identity.clone(),
            session_ref: session_ref.to_string(),
            issued_at,
            expires_at: issued_at + self.ttl,
            consumed: false,
        };

        within(self.timeout, self.store.insert_nonce(&nonce))
            .await
            .map_err(|e| {
                warn!(%identity, error = %e, "nonce insert failed");
                reject_reason_for(&e)
            })?;

        info!(%identity, expires_at = %nonce.expires_at, "nonce issued");
        Ok(IssuedNonce {
            nonce: nonce.token,
            expires_at: nonce.expires_at,
        })
    }

    /// Atomically consume `token` for `identity`.
    ///
    /// Returns the record as it was before consumption. Safe under
    /// concurrent calls with the same token: exactly one succeeds.
    pub async fn consume(&self, token: &str, identity: &Identity) -> Result<ClaimNonce, NonceError> {
        let now = self.clock.now();
        match within(self.timeout, self.store.consume_nonce(token, identity, now)).await {
            Ok(NonceConsume::Consumed(n)) => Ok(n),
            Ok(NonceConsume::Rejected(r)) => {
                warn!(%identity, rejection = %r, "nonce consume rejected");
                Err(NonceError::Rejected(r))
            }
            Err(e) => Err(NonceError::Store(e)),
        }
    }
}

/// 256 bits from the OS CSPRNG, hex encoded.
fn new_token() -> Result<String, getrandom::Error> {
    let mut buf = [0u8; TOKEN_BYTES];
    getrandom::getrandom(&mut buf)?;
    Ok(hex::encode(buf))
}
