use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on identity length. Wallet addresses are well under this.
pub const MAX_IDENTITY_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable opaque string identifying a player account.
///
/// Construction trims surrounding whitespace and rejects empty or oversized
/// values; deserialization goes through the same check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    Empty,
    TooLong { len: usize },
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Empty => write!(f, "identity must not be empty"),
            IdentityError::TooLong { len } => {
                write!(f, "identity too long: {len} > {MAX_IDENTITY_LEN}")
            }
        }
    }
}

impl std::error::Error for IdentityError {}

impl Identity {
    pub fn new(raw: impl Into<String>) -> Result<Self, IdentityError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }
        if trimmed.len() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong { len: trimmed.len() });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identity::new(value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// A player account as the store sees it.
///
/// `snapshot` is the denormalized list of item-type keys the player is meant
/// to hold. Duplicates are expected: three potions are three entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub identity: Identity,
    pub balance: i64,
    pub experience: i64,
    pub snapshot: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Fresh account with zero balance and an empty snapshot.
    pub fn new(identity: Identity, created_at: DateTime<Utc>) -> Self {
        Self {
            identity,
            balance: 0,
            experience: 0,
            snapshot: Vec::new(),
            created_at,
        }
    }

    /// Snapshot grouped by item-type key.
    pub fn desired_counts(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for key in &self.snapshot {
            *out.entry(key.clone()).or_insert(0) += 1;
        }
        out
    }
}

// ---------------------------------------------------------------------------
// ItemInstance
// ---------------------------------------------------------------------------

/// An individually addressable owned item.
///
/// Owned by exactly one account. A `locked` instance (e.g. reserved by a
/// marketplace listing) cannot be destroyed until it is unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInstance {
    pub instance_id: Uuid,
    pub item_type: String,
    pub owner: Identity,
    pub created_at: DateTime<Utc>,
    /// Perishable instances carry an expiry; `None` means permanent.
    pub expires_at: Option<DateTime<Utc>>,
    pub locked: bool,
}

impl ItemInstance {
    pub fn new(item_type: impl Into<String>, owner: Identity, created_at: DateTime<Utc>) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            item_type: item_type.into(),
            owner,
            created_at,
            expires_at: None,
            locked: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}
