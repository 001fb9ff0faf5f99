//! Merge helpers for claim conditions.
//!
//! Conditions are keyed by their type.  Updating replaces the listed types
//! and leaves every other type, including ones this crate does not know,
//! exactly as it was.  Output is ordered by type.

use std::collections::BTreeMap;

use crate::types::{ClaimCondition, ClaimConditionType};

/// Merge `updates` into `existing`.  An update whose status matches the
/// existing condition of the same type keeps the old transition time.
pub fn merge_conditions(
    existing: &[ClaimCondition],
    updates: impl IntoIterator<Item = ClaimCondition>,
) -> Vec<ClaimCondition> {
    let mut by_type: BTreeMap<ClaimConditionType, ClaimCondition> = existing
        .iter()
        .map(|c| (c.type_.clone(), c.clone()))
        .collect();

    for mut update in updates {
        if let Some(old) = by_type.get(&update.type_)
            && old.status == update.status
        {
            update.last_transition_time = old.last_transition_time;
        }
        by_type.insert(update.type_.clone(), update);
    }

    by_type.into_values().collect()
}

/// Drop every condition whose type is in `types`.
pub fn remove_conditions(
    existing: &[ClaimCondition],
    types: &[ClaimConditionType],
) -> Vec<ClaimCondition> {
    existing
        .iter()
        .filter(|c| !types.contains(&c.type_))
        .cloned()
        .collect()
}

/// Remove `remove` and then merge `add` in one step.
pub fn replace_conditions(
    existing: &[ClaimCondition],
    remove: &[ClaimConditionType],
    add: impl IntoIterator<Item = ClaimCondition>,
) -> Vec<ClaimCondition> {
    merge_conditions(&remove_conditions(existing, remove), add)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn cond(type_: ClaimConditionType, message: &str) -> ClaimCondition {
        ClaimCondition::new(type_, "Test", message)
    }

    #[test]
    fn merge_replaces_known_and_keeps_unknown() {
        let existing = vec![
            cond(ClaimConditionType::Other("Backup".into()), "nightly"),
            cond(ClaimConditionType::ModifyVolumeError, "old failure"),
        ];
        let merged = merge_conditions(
            &existing,
            [cond(ClaimConditionType::ModifyVolumeError, "new failure")],
        );
        assert_eq!(merged.len(), 2);
        let err = merged
            .iter()
            .find(|c| c.type_ == ClaimConditionType::ModifyVolumeError)
            .unwrap();
        assert_eq!(err.message, "new failure");
        assert!(
            merged
                .iter()
                .any(|c| c.type_ == ClaimConditionType::Other("Backup".into()))
        );
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let mut old = cond(ClaimConditionType::Resizing, "first");
        old.last_transition_time = SystemTime::UNIX_EPOCH + Duration::from_secs(5);
        let merged = merge_conditions(
            std::slice::from_ref(&old),
            [cond(ClaimConditionType::Resizing, "second")],
        );
        assert_eq!(merged[0].last_transition_time, old.last_transition_time);
        assert_eq!(merged[0].message, "second");
    }

    #[test]
    fn remove_only_listed_types() {
        let existing = vec![
            cond(ClaimConditionType::Resizing, ""),
            cond(ClaimConditionType::FileSystemResizePending, ""),
            cond(ClaimConditionType::ModifyingVolume, ""),
        ];
        let left = remove_conditions(&existing, &ClaimConditionType::RESIZE);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].type_, ClaimConditionType::ModifyingVolume);
    }

    #[test]
    fn replace_swaps_types() {
        let existing = vec![cond(ClaimConditionType::Resizing, "")];
        let out = replace_conditions(
            &existing,
            &[ClaimConditionType::Resizing],
            [cond(ClaimConditionType::FileSystemResizePending, "waiting")],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].type_, ClaimConditionType::FileSystemResizePending);
    }
}
