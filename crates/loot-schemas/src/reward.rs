//! Reward payloads.
//!
//! The wire shape is `{ currency_delta, experience_delta, items }` where each
//! item is a closed tagged variant. [`RewardPayload::validate`] is the only
//! way to obtain a [`ValidatedReward`], and only validated rewards reach the
//! transactional apply step.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::fingerprint::fingerprint_value;

const MAX_CARD_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumableKind {
    Potion,
    Elixir,
    Scroll,
    Bomb,
}

impl ConsumableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumableKind::Potion => "potion",
            ConsumableKind::Elixir => "elixir",
            ConsumableKind::Scroll => "scroll",
            ConsumableKind::Bomb => "bomb",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChestTier {
    Common,
    Rare,
    Epic,
    Legendary,
}

impl ChestTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChestTier::Common => "common",
            ChestTier::Rare => "rare",
            ChestTier::Epic => "epic",
            ChestTier::Legendary => "legendary",
        }
    }
}

/// One granted item line, tagged by category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum RewardItem {
    Card { card_id: String, quantity: u32 },
    Consumable { kind: ConsumableKind, quantity: u32 },
    Chest { tier: ChestTier, quantity: u32 },
}

impl RewardItem {
    /// Stable item-type key shared by snapshots and instances.
    pub fn type_key(&self) -> String {
        match self {
            RewardItem::Card { card_id, .. } => format!("card:{}", card_id.trim()),
            RewardItem::Consumable { kind, .. } => format!("consumable:{}", kind.as_str()),
            RewardItem::Chest { tier, .. } => format!("chest:{}", tier.as_str()),
        }
    }

    pub fn quantity(&self) -> u32 {
        match self {
            RewardItem::Card { quantity, .. }
            | RewardItem::Consumable { quantity, .. }
            | RewardItem::Chest { quantity, .. } => *quantity,
        }
    }
}

/// Caps applied during validation. Sourced from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardLimits {
    pub max_currency_delta: u64,
    pub max_experience_delta: u64,
    pub max_items_per_claim: u32,
}

impl Default for RewardLimits {
    fn default() -> Self {
        Self {
            max_currency_delta: 1_000_000,
            max_experience_delta: 1_000_000,
            max_items_per_claim: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    Empty,
    ZeroQuantity { item_type: String },
    BlankCardId,
    CardIdTooLong { len: usize },
    CurrencyOverCap { got: u64, cap: u64 },
    ExperienceOverCap { got: u64, cap: u64 },
    TooManyItems { got: u64, cap: u32 },
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::Empty => write!(f, "reward payload grants nothing"),
            PayloadError::ZeroQuantity { item_type } => {
                write!(f, "item {item_type} has zero quantity")
            }
            PayloadError::BlankCardId => write!(f, "card reward with blank card_id"),
            PayloadError::CardIdTooLong { len } => {
                write!(f, "card_id too long: {len} > {MAX_CARD_ID_LEN}")
            }
            PayloadError::CurrencyOverCap { got, cap } => {
                write!(f, "currency_delta {got} exceeds cap {cap}")
            }
            PayloadError::ExperienceOverCap { got, cap } => {
                write!(f, "experience_delta {got} exceeds cap {cap}")
            }
            PayloadError::TooManyItems { got, cap } => {
                write!(f, "reward grants {got} items, cap is {cap}")
            }
        }
    }
}

impl std::error::Error for PayloadError {}

/// Reward as submitted by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardPayload {
    #[serde(default)]
    pub currency_delta: u64,
    #[serde(default)]
    pub experience_delta: u64,
    #[serde(default)]
    pub items: Vec<RewardItem>,
}

impl RewardPayload {
    /// Item units grouped by type key. Lines naming the same type merge.
    pub fn item_counts(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for item in &self.items {
            *out.entry(item.type_key()).or_insert(0) += u64::from(item.quantity());
        }
        out
    }

    /// Canonical form used for fingerprinting: item lines merged by type key
    /// and sorted, so `[potion x1, potion x1]` and `[potion x2]` agree.
    pub fn canonical(&self) -> serde_json::Value {
        json!({
            "currency_delta": self.currency_delta,
            "experience_delta": self.experience_delta,
            "items": self.item_counts(),
        })
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_value(&self.canonical())
    }

    pub fn validate(&self, limits: &RewardLimits) -> Result<ValidatedReward, PayloadError> {
        if self.currency_delta > limits.max_currency_delta {
            return Err(PayloadError::CurrencyOverCap {
                got: self.currency_delta,
                cap: limits.max_currency_delta,
            });
        }
        if self.experience_delta > limits.max_experience_delta {
            return Err(PayloadError::ExperienceOverCap {
                got: self.experience_delta,
                cap: limits.max_experience_delta,
            });
        }

        let mut total: u64 = 0;
        for item in &self.items {
            if let RewardItem::Card { card_id, .. } = item {
                let trimmed = card_id.trim();
                if trimmed.is_empty() {
                    return Err(PayloadError::BlankCardId);
                }
                if trimmed.len() > MAX_CARD_ID_LEN {
                    return Err(PayloadError::CardIdTooLong { len: trimmed.len() });
                }
            }
            if item.quantity() == 0 {
                return Err(PayloadError::ZeroQuantity {
                    item_type: item.type_key(),
                });
            }
            total += u64::from(item.quantity());
        }
        if total > u64::from(limits.max_items_per_claim) {
            return Err(PayloadError::TooManyItems {
                got: total,
                cap: limits.max_items_per_claim,
            });
        }
        if self.currency_delta == 0 && self.experience_delta == 0 && total == 0 {
            return Err(PayloadError::Empty);
        }

        let mut item_types = Vec::with_capacity(total as usize);
        for (key, n) in self.item_counts() {
            for _ in 0..n {
                item_types.push(key.clone());
            }
        }

        let currency_delta = i64::try_from(self.currency_delta).map_err(|_| {
            PayloadError::CurrencyOverCap {
                got: self.currency_delta,
                cap: limits.max_currency_delta,
            }
        })?;
        let experience_delta = i64::try_from(self.experience_delta).map_err(|_| {
            PayloadError::ExperienceOverCap {
                got: self.experience_delta,
                cap: limits.max_experience_delta,
            }
        })?;

        Ok(ValidatedReward {
            currency_delta,
            experience_delta,
            item_types,
            fingerprint: self.fingerprint(),
        })
    }
}

/// A reward that passed [`RewardPayload::validate`].
///
/// Fields are private so it cannot be built outside this module; the store's
/// apply step only accepts this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedReward {
    currency_delta: i64,
    experience_delta: i64,
    item_types: Vec<String>,
    fingerprint: String,
}

impl ValidatedReward {
    pub fn currency_delta(&self) -> i64 {
        self.currency_delta
    }

    pub fn experience_delta(&self) -> i64 {
        self.experience_delta
    }

    /// One entry per granted unit, sorted by type key.
    pub fn item_types(&self) -> &[String] {
        &self.item_types
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn potion(q: u32) -> RewardItem {
        RewardItem::Consumable {
            kind: ConsumableKind::Potion,
            quantity: q,
        }
    }

    #[test]
    fn tagged_items_deserialize_from_wire() {
        let raw = r#"{
            "currency_delta": 50,
            "items": [
                {"category": "card", "card_id": "fire_drake", "quantity": 1},
                {"category": "consumable", "kind": "potion", "quantity": 2},
                {"category": "chest", "tier": "rare", "quantity": 1}
            ]
        }"#;
        let p: RewardPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(p.experience_delta, 0);
        let keys: Vec<String> = p.items.iter().map(|i| i.type_key()).collect();
        assert_eq!(keys, vec!["card:fire_drake", "consumable:potion", "chest:rare"]);
    }

    #[test]
    fn unknown_category_is_rejected_at_parse() {
        let raw = r#"{"items": [{"category": "pet", "quantity": 1}]}"#;
        assert!(serde_json::from_str::<RewardPayload>(raw).is_err());
    }

    #[test]
    fn validate_expands_units_and_sorts() {
        let p = RewardPayload {
            currency_delta: 10,
            experience_delta: 5,
            items: vec![
                potion(2),
                RewardItem::Card {
                    card_id: "drake".into(),
                    quantity: 1,
                },
            ],
        };
        let v = p.validate(&RewardLimits::default()).unwrap();
        assert_eq!(
            v.item_types(),
            &["card:drake", "consumable:potion", "consumable:potion"]
        );
        assert_eq!(v.currency_delta(), 10);
        assert_eq!(v.fingerprint(), p.fingerprint());
    }

    #[test]
    fn validate_rejects_bad_payloads() {
        let lim = RewardLimits {
            max_currency_delta: 100,
            max_experience_delta: 100,
            max_items_per_claim: 3,
        };
        assert_eq!(
            RewardPayload::default().validate(&lim),
            Err(PayloadError::Empty)
        );
        let over = RewardPayload {
            currency_delta: 101,
            ..Default::default()
        };
        assert!(matches!(
            over.validate(&lim),
            Err(PayloadError::CurrencyOverCap { .. })
        ));
        let zero = RewardPayload {
            items: vec![potion(0)],
            ..Default::default()
        };
        assert!(matches!(
            zero.validate(&lim),
            Err(PayloadError::ZeroQuantity { .. })
        ));
        let many = RewardPayload {
            items: vec![potion(2), potion(2)],
            ..Default::default()
        };
        assert!(matches!(
            many.validate(&lim),
            Err(PayloadError::TooManyItems { got: 4, cap: 3 })
        ));
        let blank = RewardPayload {
            items: vec![RewardItem::Card {
                card_id: "  ".into(),
                quantity: 1,
            }],
            ..Default::default()
        };
        assert_eq!(blank.validate(&lim), Err(PayloadError::BlankCardId));
    }

    #[test]
    fn split_and_merged_lines_fingerprint_the_same() {
        let split = RewardPayload {
            items: vec![potion(1), potion(1)],
            ..Default::default()
        };
        let merged = RewardPayload {
            items: vec![potion(2)],
            ..Default::default()
        };
        assert_eq!(split.fingerprint(), merged.fingerprint());
    }
}
