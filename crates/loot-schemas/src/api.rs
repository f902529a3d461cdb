//! HTTP request/response bodies shared by the daemon and its clients.

use serde::{Deserialize, Serialize};

use crate::{Identity, ItemOp, RejectReason, RewardPayload, TrustDirection};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRequest {
    pub identity: Identity,
    pub session_ref: String,
}

/// One claim submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub identity: Identity,
    /// Deterministic per game event, so client retries reuse it.
    pub claim_key: String,
    pub nonce: String,
    pub session_ref: String,
    pub reward: RewardPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemBatchRequest {
    pub identity: Identity,
    pub ops: Vec<ItemOp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub identity: Identity,
}

/// Operator-triggered reconciliation. An empty identity list means every
/// account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileRequest {
    #[serde(default)]
    pub identities: Vec<Identity>,
    #[serde(default)]
    pub direction: Option<TrustDirection>,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl ErrorBody {
    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            error: reason.as_str().to_string(),
            reason: Some(reason),
        }
    }

    pub fn other(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: None,
        }
    }
}
