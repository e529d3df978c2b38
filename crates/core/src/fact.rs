//! Target facts and the immutable per-cycle evaluation context.

use crate::id::TargetId;
use crate::Time;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A single fact value reported by a fact provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    /// Boolean fact (`on_battery`)
    Bool(bool),
    /// Numeric fact (`memory_gb`)
    Number(f64),
    /// Text fact (`os.version`, `site`)
    Text(String),
    /// Set-valued fact (`groups`, `tags`)
    List(Vec<String>),
}

impl FactValue {
    /// Human-readable type name, used in evaluation errors.
    pub fn kind(&self) -> &'static str {
        match self {
            FactValue::Bool(_) => "bool",
            FactValue::Number(_) => "number",
            FactValue::Text(_) => "text",
            FactValue::List(_) => "list",
        }
    }
}

impl From<bool> for FactValue {
    fn from(v: bool) -> Self {
        FactValue::Bool(v)
    }
}

impl From<f64> for FactValue {
    fn from(v: f64) -> Self {
        FactValue::Number(v)
    }
}

impl From<&str> for FactValue {
    fn from(v: &str) -> Self {
        FactValue::Text(v.to_string())
    }
}

impl From<String> for FactValue {
    fn from(v: String) -> Self {
        FactValue::Text(v)
    }
}

impl From<Vec<&str>> for FactValue {
    fn from(v: Vec<&str>) -> Self {
        FactValue::List(v.into_iter().map(str::to_string).collect())
    }
}

/// Map of fact name to value.
pub type Facts = BTreeMap<String, FactValue>;

/// Dotted numeric version (`10.0.19041`).
///
/// Missing trailing components compare as zero, so `10.0 == 10.0.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version(Vec<u64>);

impl Version {
    /// Parse a dotted version. Returns `None` if any component is not numeric.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        s.split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()
            .map(Version)
    }

    /// Version components.
    pub fn components(&self) -> &[u64] {
        &self.0
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// Immutable snapshot of one target's facts for a single convergence cycle.
///
/// Built once at cycle start; there is no API to change it afterwards, so
/// every predicate evaluated during the cycle sees the same world.
#[derive(Debug, Clone, Serialize)]
pub struct TargetContext {
    target: TargetId,
    facts: Facts,
    captured_at: Time,
}

impl TargetContext {
    /// Capture a context for `target`.
    pub fn new(target: TargetId, facts: Facts) -> Self {
        Self {
            target,
            facts,
            captured_at: chrono::Utc::now(),
        }
    }

    /// The target this snapshot describes.
    pub fn target(&self) -> &TargetId {
        &self.target
    }

    /// Look up a fact by name.
    pub fn fact(&self, name: &str) -> Option<&FactValue> {
        self.facts.get(name)
    }

    /// All facts.
    pub fn facts(&self) -> &Facts {
        &self.facts
    }

    /// When the snapshot was taken.
    pub fn captured_at(&self) -> Time {
        self.captured_at
    }
}
