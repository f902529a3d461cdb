use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use loot_schemas::{ItemInstance, TrustDirection};

use crate::{InventoryView, ReconcilePlan};

fn count_types<'a>(keys: impl Iterator<Item = &'a str>) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for k in keys {
        *out.entry(k.to_string()).or_insert(0) += 1;
    }
    out
}

fn group_instances(instances: &[ItemInstance]) -> BTreeMap<&str, Vec<&ItemInstance>> {
    let mut out: BTreeMap<&str, Vec<&ItemInstance>> = BTreeMap::new();
    for inst in instances {
        out.entry(inst.item_type.as_str()).or_default().push(inst);
    }
    out
}

/// Order in which excess instances are removed: expired perishables first,
/// then newest, then by id so the choice is deterministic.
fn removal_order(candidates: &mut [&ItemInstance], now: DateTime<Utc>) {
    candidates.sort_by_key(|i| (!i.is_expired(now), Reverse(i.created_at), i.instance_id));
}

/// Pure reconciliation planning. No IO.
///
/// `Snapshot` trusts the snapshot list: surplus unlocked instances are
/// removed, missing ones are created. Locked instances are never selected;
/// any excess they hold is reported as shortfall.
///
/// `Instances` trusts the owned instances: the snapshot is rewritten to match
/// them and no instance is touched.
pub fn plan(view: &InventoryView, direction: TrustDirection, now: DateTime<Utc>) -> ReconcilePlan {
    match direction {
        TrustDirection::Snapshot => plan_from_snapshot(view, now),
        TrustDirection::Instances => plan_from_instances(view),
    }
}

fn plan_from_snapshot(view: &InventoryView, now: DateTime<Utc>) -> ReconcilePlan {
    let desired = count_types(view.snapshot.iter().map(String::as_str));
    let actual = group_instances(&view.instances);

    let mut types: BTreeSet<&str> = BTreeSet::new();
    types.extend(desired.keys().map(String::as_str));
    types.extend(actual.keys().copied());

    let mut out = ReconcilePlan::default();
    for ty in types {
        let want = desired.get(ty).copied().unwrap_or(0);
        let have = actual.get(ty).map(Vec::as_slice).unwrap_or(&[]);

        if have.len() > want {
            let excess = have.len() - want;
            let mut unlocked: Vec<&ItemInstance> = have.iter().copied().filter(|i| !i.locked).collect();
            removal_order(&mut unlocked, now);
            let take = excess.min(unlocked.len());
            out.removals
                .extend(unlocked.iter().take(take).map(|i| i.instance_id));
            if take < excess {
                out.shortfall.insert(ty.to_string(), excess - take);
            }
        } else if have.len() < want {
            out.additions
                .extend(std::iter::repeat(ty.to_string()).take(want - have.len()));
        }
    }
    out
}

fn plan_from_instances(view: &InventoryView) -> ReconcilePlan {
    let current = count_types(view.snapshot.iter().map(String::as_str));
    let owned = count_types(view.instances.iter().map(|i| i.item_type.as_str()));
    if current == owned {
        return ReconcilePlan::default();
    }

    // Keep surviving snapshot entries in place, then append what only the
    // instances know about in creation order.
    let mut remaining = owned;
    let mut rewritten = Vec::with_capacity(view.instances.len());
    for key in &view.snapshot {
        if let Some(n) = remaining.get_mut(key) {
            if *n > 0 {
                *n -= 1;
                rewritten.push(key.clone());
            }
        }
    }
    let mut by_age: Vec<&ItemInstance> = view.instances.iter().collect();
    by_age.sort_by_key(|i| (i.created_at, i.instance_id));
    for inst in by_age {
        if let Some(n) = remaining.get_mut(&inst.item_type) {
            if *n > 0 {
                *n -= 1;
                rewritten.push(inst.item_type.clone());
            }
        }
    }

    ReconcilePlan {
        snapshot_rewrite: Some(rewritten),
        ..ReconcilePlan::default()
    }
}
