//! Policy bundles and preference items - the desired state.

use crate::expr::{Expr, PredicateError};
use crate::id::BundleId;
use serde::{Deserialize, Serialize};

/// Resource category; each category is owned by exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Hierarchical key/value settings
    Registry,
    /// Files under a managed root
    File,
    /// Shared folders / mounts
    Share,
    /// Scheduled jobs
    ScheduledTask,
    /// Service start state
    Service,
}

impl Category {
    /// All categories, in declaration order.
    pub const ALL: [Category; 5] = [
        Category::Registry,
        Category::File,
        Category::Share,
        Category::ScheduledTask,
        Category::Service,
    ];

    /// Stable lowercase name (matches the serde form).
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Registry => "registry",
            Category::File => "file",
            Category::Share => "share",
            Category::ScheduledTask => "scheduled_task",
            Category::Service => "service",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown category: {}", s))
    }
}

/// What an item does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Create if absent; leave an existing resource alone
    Create,
    /// Overwrite wholesale
    Replace,
    /// Merge payload fields into the existing resource
    Update,
    /// Remove if present
    Delete,
}

impl Action {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Replace => "replace",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an item is re-applied every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPolicy {
    /// Apply on every cycle
    #[default]
    AlwaysReapply,
    /// Apply once per fingerprint, then leave the resource to the user
    ApplyOnceThenIgnore,
}

impl ApplyPolicy {
    /// Serde name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyPolicy::AlwaysReapply => "always_reapply",
            ApplyPolicy::ApplyOnceThenIgnore => "apply_once_then_ignore",
        }
    }
}

/// SHA-256 fingerprint of an item's desired state, `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Prefix for SHA-256 fingerprints
    pub const PREFIX: &'static str = "sha256:";

    /// Hash arbitrary canonical text.
    pub fn from_canonical(text: &str) -> Self {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(text.as_bytes());
        Self(format!("{}{:x}", Self::PREFIX, hash))
    }

    /// Full fingerprint string including prefix.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize JSON with object keys sorted so equal values hash equally.
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// The atomic unit of desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceItem {
    /// Resource category
    pub category: Category,

    /// Identifies the resource within its category (path, key, name)
    #[serde(alias = "key")]
    pub resource_key: String,

    /// Action to converge with
    pub action: Action,

    /// Category-specific desired value
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Item-level targeting; empty matches every target
    #[serde(default)]
    pub targeting: Expr,

    /// Reapply policy
    #[serde(default)]
    pub apply_policy: ApplyPolicy,

    /// Undo the item when its bundle stops applying
    #[serde(default)]
    pub remove_on_unlink: bool,

    /// Disabled items are ignored during resolution
    #[serde(default)]
    pub disabled: bool,
}

impl PreferenceItem {
    /// Create an item that always applies.
    pub fn new(
        category: Category,
        resource_key: impl Into<String>,
        action: Action,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            category,
            resource_key: resource_key.into(),
            action,
            payload,
            targeting: Expr::always(),
            apply_policy: ApplyPolicy::AlwaysReapply,
            remove_on_unlink: false,
            disabled: false,
        }
    }

    /// Synthesize the delete used to undo an unlinked item.
    pub fn delete_of(category: Category, resource_key: impl Into<String>) -> Self {
        Self::new(category, resource_key, Action::Delete, serde_json::Value::Null)
    }

    /// Set item-level targeting.
    pub fn with_targeting(mut self, targeting: Expr) -> Self {
        self.targeting = targeting;
        self
    }

    /// Apply once per fingerprint.
    pub fn apply_once(mut self) -> Self {
        self.apply_policy = ApplyPolicy::ApplyOnceThenIgnore;
        self
    }

    /// Undo this item when it stops applying.
    pub fn with_remove_on_unlink(mut self) -> Self {
        self.remove_on_unlink = true;
        self
    }

    /// Fingerprint of `(category, resource_key, action, payload)`.
    pub fn fingerprint(&self) -> Fingerprint {
        let doc = serde_json::json!({
            "category": self.category.as_str(),
            "resource_key": self.resource_key,
            "action": self.action.as_str(),
            "payload": self.payload,
        });
        let mut canonical = String::new();
        write_canonical(&doc, &mut canonical);
        Fingerprint::from_canonical(&canonical)
    }
}

/// Structural problem in a single bundle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BundleError {
    /// Item with an empty resource key
    #[error("bundle {bundle}: item {index} has an empty resource key")]
    EmptyResourceKey {
        /// Owning bundle
        bundle: BundleId,
        /// Item position
        index: usize,
    },

    /// Invalid scope or item targeting expression
    #[error("bundle {bundle}: {}: {source}", predicate_site(.index))]
    Predicate {
        /// Owning bundle
        bundle: BundleId,
        /// Item position; `None` for the bundle scope
        index: Option<usize>,
        /// Underlying predicate error
        source: PredicateError,
    },
}

fn predicate_site(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!("item {} targeting", i),
        None => "scope".to_string(),
    }
}

/// A named, precedence-ranked collection of preference items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBundle {
    /// Unique identifier
    pub id: BundleId,

    /// Higher precedence wins conflicts
    #[serde(default)]
    pub precedence: i64,

    /// A disabled bundle applies to no target
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Which targets the bundle applies to at all
    #[serde(default)]
    pub scope: Expr,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// Items, in processing order
    #[serde(default)]
    pub items: Vec<PreferenceItem>,
}

fn default_enabled() -> bool {
    true
}

impl PolicyBundle {
    /// Create an empty, enabled, unscoped bundle.
    pub fn new(id: BundleId, precedence: i64) -> Self {
        Self {
            id,
            precedence,
            enabled: true,
            scope: Expr::always(),
            description: String::new(),
            items: Vec::new(),
        }
    }

    /// Set the scope predicate.
    pub fn with_scope(mut self, scope: Expr) -> Self {
        self.scope = scope;
        self
    }

    /// Append an item.
    pub fn with_item(mut self, item: PreferenceItem) -> Self {
        self.items.push(item);
        self
    }

    /// Check expressions and keys. Run before any cycle uses the bundle.
    pub fn validate(&self) -> Result<(), BundleError> {
        self.scope.validate().map_err(|source| BundleError::Predicate {
            bundle: self.id.clone(),
            index: None,
            source,
        })?;
        for (index, item) in self.items.iter().enumerate() {
            if item.resource_key.trim().is_empty() {
                return Err(BundleError::EmptyResourceKey {
                    bundle: self.id.clone(),
                    index,
                });
            }
            item.targeting.validate().map_err(|source| BundleError::Predicate {
                bundle: self.id.clone(),
                index: Some(index),
                source,
            })?;
        }
        Ok(())
    }
}
