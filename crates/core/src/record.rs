//! Applied-item records - what the engine last applied to a target.

use crate::bundle::{Action, ApplyPolicy, Category, Fingerprint, PreferenceItem};
use crate::id::{BundleId, TargetId};
use crate::Time;
use serde::{Deserialize, Serialize};

/// Identity of a record: one per target and managed resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Target the resource lives on
    pub target: TargetId,
    /// Resource category
    pub category: Category,
    /// Resource key within the category
    pub resource_key: String,
}

impl RecordKey {
    /// Create a record key.
    pub fn new(target: TargetId, category: Category, resource_key: impl Into<String>) -> Self {
        Self {
            target,
            category,
            resource_key: resource_key.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.target, self.category, self.resource_key)
    }
}

/// Persisted proof that an item was applied successfully.
///
/// Only written after the handler reported success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedItemRecord {
    /// Target the item was applied to
    pub target_id: TargetId,

    /// Resource category
    pub category: Category,

    /// Resource key within the category
    pub resource_key: String,

    /// Fingerprint of the applied desired state
    pub fingerprint: Fingerprint,

    /// When the apply finished
    pub applied_at: Time,

    /// Bundle the winning item came from
    pub source_bundle_id: BundleId,

    /// Action that was applied
    pub action: Action,

    /// Reapply policy of the applied item
    pub apply_policy: ApplyPolicy,

    /// Whether to undo the item once it stops applying
    pub remove_on_unlink: bool,
}

impl AppliedItemRecord {
    /// Build a record for an item that was just applied.
    pub fn for_item(target_id: TargetId, source_bundle_id: BundleId, item: &PreferenceItem) -> Self {
        Self {
            target_id,
            category: item.category,
            resource_key: item.resource_key.clone(),
            fingerprint: item.fingerprint(),
            applied_at: chrono::Utc::now(),
            source_bundle_id,
            action: item.action,
            apply_policy: item.apply_policy,
            remove_on_unlink: item.remove_on_unlink,
        }
    }

    /// Key identifying this record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.target_id.clone(), self.category, self.resource_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_for_item_copies_policy() {
        let item = PreferenceItem::new(Category::Share, "docs", Action::Create, json!({"path": "/srv/docs"}))
            .apply_once()
            .with_remove_on_unlink();
        let record = AppliedItemRecord::for_item(
            TargetId::new("pc-1").unwrap(),
            BundleId::new("shares").unwrap(),
            &item,
        );

        assert_eq!(record.fingerprint, item.fingerprint());
        assert_eq!(record.apply_policy, ApplyPolicy::ApplyOnceThenIgnore);
        assert!(record.remove_on_unlink);
        assert_eq!(record.key().to_string(), "pc-1/share:docs");
    }
}
