use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One element of a batch item mutation.
///
/// The same primitive serves client gameplay mutations and reconciliation,
/// so both go through the same lock and ownership checks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ItemOp {
    Add {
        item_type: String,
        /// Set for perishables; reconciliation prefers expired ones when trimming.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },
    Remove {
        instance_id: Uuid,
    },
}

impl ItemOp {
    pub fn add(item_type: impl Into<String>) -> Self {
        ItemOp::Add {
            item_type: item_type.into(),
            expires_at: None,
        }
    }

    pub fn add_perishable(item_type: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        ItemOp::Add {
            item_type: item_type.into(),
            expires_at: Some(expires_at),
        }
    }

    pub fn remove(instance_id: Uuid) -> Self {
        ItemOp::Remove { instance_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefusalReason {
    /// Instance is reserved (e.g. listed on the marketplace).
    Locked,
    /// Instance does not exist or belongs to someone else.
    NotOwned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRefusal {
    pub instance_id: Uuid,
    pub reason: RefusalReason,
}

/// What a batch mutation actually did. Refused removals are reported, not
/// raised: a locked instance is a normal state, not a fault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub added: Vec<Uuid>,
    pub removed: Vec<Uuid>,
    pub refused: Vec<RemoveRefusal>,
}

impl BatchOutcome {
    pub fn added_count(&self) -> usize {
        self.added.len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    pub fn is_fully_applied(&self) -> bool {
        self.refused.is_empty()
    }
}
