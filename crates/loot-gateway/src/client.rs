use std::sync::Arc;
use std::time::Duration;

use loot_schemas::{ClaimOutcome, ClaimRequest, Identity, RewardPayload};
use tracing::{info, warn};

use crate::transport::{Transport, TransportError};

/// Nonce-then-claim with retry.
///
/// Every attempt asks for a fresh nonce, so a retry never trips over the
/// nonce its predecessor already spent. Retrying is safe because the server
/// settles each claim key at most once.
#[derive(Clone)]
pub struct ClaimClient {
    transport: Arc<dyn Transport>,
    backoff: Vec<Duration>,
}

impl ClaimClient {
    /// `backoff[i]` is the sleep before retry `i + 1`; its length caps the
    /// number of retries.
    pub fn new(transport: Arc<dyn Transport>, backoff: Vec<Duration>) -> Self {
        Self { transport, backoff }
    }

    pub async fn claim(
        &self,
        identity: &Identity,
        session_ref: &str,
        claim_key: &str,
        reward: &RewardPayload,
    ) -> Result<ClaimOutcome, TransportError> {
        let mut retries = 0usize;
        loop {
            let res = self.attempt(identity, session_ref, claim_key, reward).await;
            let retryable = match &res {
                Ok(out) => out.reject_reason().is_some_and(|r| r.is_retryable()),
                Err(e) => e.is_retryable(),
            };
            if !retryable {
                if let Ok(ClaimOutcome::Applied { duplicate, .. }) = &res {
                    info!(%identity, claim_key, duplicate, attempts = retries + 1, "claim settled");
                }
                return res;
            }

            let Some(delay) = self.backoff.get(retries).copied() else {
                warn!(%identity, claim_key, attempts = retries + 1, "claim retries exhausted");
                return res;
            };
            retries += 1;
            warn!(
                %identity,
                claim_key,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                "claim attempt failed; backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(
        &self,
        identity: &Identity,
        session_ref: &str,
        claim_key: &str,
        reward: &RewardPayload,
    ) -> Result<ClaimOutcome, TransportError> {
        let issued = match self.transport.request_nonce(identity, session_ref).await {
            Ok(n) => n,
            Err(TransportError::Rejected(reason)) => return Ok(ClaimOutcome::Rejected { reason }),
            Err(e) => return Err(e),
        };
        self.transport
            .submit_claim(&ClaimRequest {
                identity: identity.clone(),
                claim_key: claim_key.to_string(),
                nonce: issued.nonce,
                session_ref: session_ref.to_string(),
                reward: reward.clone(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use loot_schemas::{Account, BatchOutcome, ClaimResult, IssuedNonce, ItemOp, RejectReason};

    /// Answers claims from a script and counts calls.
    struct Scripted {
        claims: Mutex<VecDeque<Result<ClaimOutcome, TransportError>>>,
        nonces_issued: Mutex<Vec<String>>,
        nonces_seen: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(script: Vec<Result<ClaimOutcome, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                claims: Mutex::new(script.into()),
                nonces_issued: Mutex::new(Vec::new()),
                nonces_seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn register(&self, _identity: &Identity) -> Result<Account, TransportError> {
            Err(TransportError::Http {
                status: 404,
                body: String::new(),
            })
        }

        async fn request_nonce(
            &self,
            _identity: &Identity,
            _session_ref: &str,
        ) -> Result<IssuedNonce, TransportError> {
            let mut issued = self.nonces_issued.lock().unwrap();
            let nonce = format!("n{}", issued.len());
            issued.push(nonce.clone());
            Ok(IssuedNonce {
                nonce,
                expires_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            })
        }

        async fn submit_claim(&self, req: &ClaimRequest) -> Result<ClaimOutcome, TransportError> {
            self.nonces_seen.lock().unwrap().push(req.nonce.clone());
            self.claims
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::Network("script exhausted".into())))
        }

        async fn batch_items(
            &self,
            _identity: &Identity,
            _ops: &[ItemOp],
        ) -> Result<BatchOutcome, TransportError> {
            Ok(BatchOutcome::default())
        }
    }

    fn applied() -> ClaimOutcome {
        ClaimOutcome::Applied {
            result: ClaimResult {
                claim_key: "k".into(),
                currency_granted: 10,
                experience_granted: 0,
                item_types: vec![],
                instance_ids: vec![],
                balance_after: 10,
                experience_after: 0,
                applied_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            },
            duplicate: false,
        }
    }

    fn transient() -> Result<ClaimOutcome, TransportError> {
        Ok(ClaimOutcome::Rejected {
            reason: RejectReason::TransientStoreError,
        })
    }

    fn reward() -> RewardPayload {
        RewardPayload {
            currency_delta: 10,
            experience_delta: 0,
            items: vec![],
        }
    }

    fn backoff() -> Vec<Duration> {
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(3),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_fresh_nonces() {
        let t = Scripted::new(vec![transient(), Err(TransportError::Timeout), Ok(applied())]);
        let client = ClaimClient::new(t.clone(), backoff());
        let who = Identity::new("p1").unwrap();

        let started = tokio::time::Instant::now();
        let out = client.claim(&who, "s", "k", &reward()).await.unwrap();

        assert!(out.is_applied());
        assert_eq!(*t.nonces_seen.lock().unwrap(), vec!["n0", "n1", "n2"]);
        // 1s + 2s of backoff
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_rejection_is_not_retried() {
        let t = Scripted::new(vec![Ok(ClaimOutcome::Rejected {
            reason: RejectReason::NonceExpired,
        })]);
        let client = ClaimClient::new(t.clone(), backoff());
        let who = Identity::new("p1").unwrap();

        let out = client.claim(&who, "s", "k", &reward()).await.unwrap();
        assert_eq!(out.reject_reason(), Some(RejectReason::NonceExpired));
        assert_eq!(t.nonces_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_backoff_schedule() {
        let t = Scripted::new(vec![transient(), transient(), transient(), transient(), Ok(applied())]);
        let client = ClaimClient::new(t.clone(), backoff());
        let who = Identity::new("p1").unwrap();

        let out = client.claim(&who, "s", "k", &reward()).await.unwrap();
        assert_eq!(out.reject_reason(), Some(RejectReason::TransientStoreError));
        assert_eq!(t.nonces_seen.lock().unwrap().len(), 4);
    }
}
