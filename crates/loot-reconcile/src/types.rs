use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use loot_schemas::{Identity, ItemInstance, TrustDirection, PARTIAL_RECONCILIATION_FAILURE};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Both representations of one account's holdings, as read from the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryView {
    pub identity: Identity,
    /// Item-type keys, duplicates allowed.
    pub snapshot: Vec<String>,
    pub instances: Vec<ItemInstance>,
}

/// What reconciliation intends to do to one account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Unlocked instances to destroy.
    pub removals: Vec<Uuid>,
    /// Item-type keys to create one instance each for.
    pub additions: Vec<String>,
    /// Per type: excess that only locked instances could have covered.
    pub shortfall: BTreeMap<String, usize>,
    /// Replacement snapshot (instance-trusting direction only).
    pub snapshot_rewrite: Option<Vec<String>>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.removals.is_empty() && self.additions.is_empty() && self.snapshot_rewrite.is_none()
    }
}

/// What reconciliation did to one account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountReport {
    pub identity: Identity,
    pub direction: TrustDirection,
    pub added: usize,
    pub removed: usize,
    /// Excess left in place because the remaining instances are locked.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shortfall: BTreeMap<String, usize>,
    #[serde(default)]
    pub snapshot_rewritten: bool,
}

impl AccountReport {
    pub fn converged(&self) -> bool {
        self.shortfall.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFailure {
    pub identity: Identity,
    /// Always `PARTIAL_RECONCILIATION_FAILURE`.
    pub code: String,
    pub error: String,
}

impl AccountFailure {
    pub fn new(identity: Identity, error: impl Into<String>) -> Self {
        Self {
            identity,
            code: PARTIAL_RECONCILIATION_FAILURE.to_string(),
            error: error.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PerAccountResult {
    Reconciled(AccountReport),
    Failed(AccountFailure),
}

impl PerAccountResult {
    pub fn identity(&self) -> &Identity {
        match self {
            PerAccountResult::Reconciled(r) => &r.identity,
            PerAccountResult::Failed(f) => &f.identity,
        }
    }
}

/// Summary of one `reconcile_all` pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub direction: TrustDirection,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Sorted by identity.
    pub results: Vec<PerAccountResult>,
}

impl BatchReport {
    pub fn accounts(&self) -> usize {
        self.results.len()
    }

    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, PerAccountResult::Failed(_)))
            .count()
    }

    pub fn total_added(&self) -> usize {
        self.reports().map(|r| r.added).sum()
    }

    pub fn total_removed(&self) -> usize {
        self.reports().map(|r| r.removed).sum()
    }

    pub fn reports(&self) -> impl Iterator<Item = &AccountReport> {
        self.results.iter().filter_map(|r| match r {
            PerAccountResult::Reconciled(rep) => Some(rep),
            PerAccountResult::Failed(_) => None,
        })
    }
}
