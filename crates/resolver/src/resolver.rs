//! Bundle resolver.
//!
//! Winner selection per `(category, resource_key)`:
//! 1. highest bundle precedence;
//! 2. on equal precedence, the lexicographically smallest bundle id;
//! 3. within one bundle, the later item.

use converge_core::{
    BundleError, BundleId, Category, Conflict, Fingerprint, PolicyBundle, PreferenceItem,
    TargetContext,
};
use converge_targeting::evaluate;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

/// Fatal resolution errors. The cycle aborts before applying anything.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolverError {
    /// Two bundles share an id
    #[error("duplicate bundle id: {0}")]
    DuplicateBundle(BundleId),

    /// A bundle is structurally invalid
    #[error(transparent)]
    Bundle(#[from] BundleError),
}

/// Non-fatal problem found while resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionWarning {
    /// Bundle concerned
    pub bundle_id: BundleId,
    /// Item position, `None` for the bundle scope
    pub position: Option<usize>,
    /// What happened
    pub message: String,
}

impl std::fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.position {
            Some(pos) => write!(f, "bundle {} item {}: {}", self.bundle_id, pos, self.message),
            None => write!(f, "bundle {} scope: {}", self.bundle_id, self.message),
        }
    }
}

/// A winning item.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedItem {
    /// Bundle the item came from
    pub bundle_id: BundleId,
    /// Precedence of that bundle
    pub precedence: i64,
    /// Position within the bundle
    pub position: usize,
    /// The item itself
    pub item: PreferenceItem,
    /// Fingerprint of the item's desired state
    pub fingerprint: Fingerprint,
}

impl ResolvedItem {
    /// Category of the item.
    pub fn category(&self) -> Category {
        self.item.category
    }

    /// Resource key of the item.
    pub fn resource_key(&self) -> &str {
        &self.item.resource_key
    }
}

/// Result of resolving bundles against one target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Winning items in bundle order, then position
    pub items: Vec<ResolvedItem>,
    /// Resources declared by more than one bundle
    pub conflicts: Vec<Conflict>,
    /// Targeting problems; affected items were treated as non-matching
    pub warnings: Vec<ResolutionWarning>,
}

impl Resolution {
    /// Whether `(category, key)` is among the winners.
    pub fn contains(&self, category: Category, resource_key: &str) -> bool {
        self.items
            .iter()
            .any(|r| r.item.category == category && r.item.resource_key == resource_key)
    }
}

/// Structural checks on a whole bundle set.
pub fn validate_bundles(bundles: &[PolicyBundle]) -> Result<(), ResolverError> {
    let mut seen = HashSet::new();
    for bundle in bundles {
        if !seen.insert(&bundle.id) {
            return Err(ResolverError::DuplicateBundle(bundle.id.clone()));
        }
        bundle.validate()?;
    }
    Ok(())
}

/// Resolve `bundles` for the target described by `ctx`.
pub fn resolve(bundles: &[PolicyBundle], ctx: &TargetContext) -> Result<Resolution, ResolverError> {
    validate_bundles(bundles)?;

    let mut resolution = Resolution::default();

    let mut active: Vec<&PolicyBundle> = Vec::new();
    for bundle in bundles.iter().filter(|b| b.enabled) {
        match evaluate(&bundle.scope, ctx) {
            Ok(true) => active.push(bundle),
            Ok(false) => {
                tracing::debug!(bundle = %bundle.id, target_id = %ctx.target(), "bundle out of scope");
            }
            Err(e) => resolution.warnings.push(ResolutionWarning {
                bundle_id: bundle.id.clone(),
                position: None,
                message: e.to_string(),
            }),
        }
    }
    active.sort_by(|a, b| (Reverse(a.precedence), &a.id).cmp(&(Reverse(b.precedence), &b.id)));

    // Candidates in bundle order, then position.
    let mut candidates: Vec<(&PolicyBundle, usize, &PreferenceItem)> = Vec::new();
    for bundle in &active {
        for (position, item) in bundle.items.iter().enumerate() {
            if item.disabled {
                continue;
            }
            match evaluate(&item.targeting, ctx) {
                Ok(true) => candidates.push((bundle, position, item)),
                Ok(false) => {}
                Err(e) => resolution.warnings.push(ResolutionWarning {
                    bundle_id: bundle.id.clone(),
                    position: Some(position),
                    message: e.to_string(),
                }),
            }
        }
    }

    let mut groups: BTreeMap<(Category, &str), Vec<usize>> = BTreeMap::new();
    for (index, (_, _, item)) in candidates.iter().enumerate() {
        groups
            .entry((item.category, item.resource_key.as_str()))
            .or_default()
            .push(index);
    }

    let mut winners: Vec<usize> = Vec::with_capacity(groups.len());
    let mut conflicts: Vec<(usize, Conflict)> = Vec::new();
    for ((category, key), indices) in &groups {
        // Candidates are already ordered, so the first entry names the
        // winning bundle; the winner is that bundle's last item for the key.
        let winning_bundle = &candidates[indices[0]].0.id;
        let winner = indices
            .iter()
            .copied()
            .filter(|&i| &candidates[i].0.id == winning_bundle)
            .last()
            .unwrap_or(indices[0]);
        winners.push(winner);

        let in_winner = indices
            .iter()
            .filter(|&&i| &candidates[i].0.id == winning_bundle)
            .count();
        if in_winner > 1 {
            resolution.warnings.push(ResolutionWarning {
                bundle_id: winning_bundle.clone(),
                position: Some(candidates[winner].1),
                message: format!("{}:{} declared {} times, last one wins", category, key, in_winner),
            });
        }

        let mut shadowed: Vec<BundleId> = Vec::new();
        for &i in indices {
            let id = &candidates[i].0.id;
            if id != winning_bundle && !shadowed.contains(id) {
                shadowed.push(id.clone());
            }
        }
        if !shadowed.is_empty() {
            let conflict = Conflict {
                category: *category,
                resource_key: key.to_string(),
                winner: winning_bundle.clone(),
                shadowed,
            };
            tracing::warn!(target_id = %ctx.target(), %conflict, "resolution conflict");
            conflicts.push((winner, conflict));
        }
    }

    winners.sort_unstable();
    conflicts.sort_by_key(|(winner, _)| *winner);

    resolution.items = winners
        .into_iter()
        .map(|i| {
            let (bundle, position, item) = candidates[i];
            ResolvedItem {
                bundle_id: bundle.id.clone(),
                precedence: bundle.precedence,
                position,
                item: item.clone(),
                fingerprint: item.fingerprint(),
            }
        })
        .collect();
    resolution.conflicts = conflicts.into_iter().map(|(_, c)| c).collect();

    tracing::debug!(
        target_id = %ctx.target(),
        items = resolution.items.len(),
        conflicts = resolution.conflicts.len(),
        warnings = resolution.warnings.len(),
        "resolved bundles"
    );
    Ok(resolution)
}
