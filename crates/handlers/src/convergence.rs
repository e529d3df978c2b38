//! Shared action semantics.
//!
//! Every handler decides what to do with [`plan_change`] and then carries
//! out the returned [`Plan`], so Create/Replace/Update/Delete behave the
//! same across categories.

use crate::r#trait::{HandlerError, ResourceState};
use converge_core::{Action, Change, PreferenceItem};
use serde_json::Value;

/// What a handler must do to converge a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Write `value` wholesale
    Write {
        /// New value
        value: Value,
        /// Change to report
        change: Change,
    },
    /// Remove the resource
    Remove,
    /// Leave the resource alone
    Noop,
}

impl Plan {
    /// Change reported once the plan has been carried out.
    pub fn change(&self) -> Change {
        match self {
            Plan::Write { change, .. } => *change,
            Plan::Remove => Change::Deleted,
            Plan::Noop => Change::Unchanged,
        }
    }
}

/// Decide how to converge `current` towards `item`.
///
/// - Create: write if absent, otherwise leave as is.
/// - Replace: write wholesale unless already equal.
/// - Update: shallow-merge the payload object into the current object.
/// - Delete: remove if present.
pub fn plan_change(
    item: &PreferenceItem,
    current: Option<&ResourceState>,
    supports_update: bool,
) -> Result<Plan, HandlerError> {
    let plan = match (item.action, current) {
        (Action::Create, None) => Plan::Write {
            value: item.payload.clone(),
            change: Change::Created,
        },
        (Action::Create, Some(_)) => Plan::Noop,

        (Action::Replace, Some(cur)) if cur.value == item.payload => Plan::Noop,
        (Action::Replace, Some(_)) => Plan::Write {
            value: item.payload.clone(),
            change: Change::Replaced,
        },
        (Action::Replace, None) => Plan::Write {
            value: item.payload.clone(),
            change: Change::Created,
        },

        (Action::Update, current) => {
            if !supports_update {
                return Err(HandlerError::UnsupportedMerge {
                    category: item.category,
                });
            }
            let Value::Object(fields) = &item.payload else {
                return Err(HandlerError::MalformedPayload(format!(
                    "update of {} needs an object payload",
                    item.resource_key
                )));
            };
            match current {
                None => Plan::Write {
                    value: item.payload.clone(),
                    change: Change::Created,
                },
                Some(cur) => {
                    let Value::Object(existing) = &cur.value else {
                        return Err(HandlerError::MalformedPayload(format!(
                            "current value of {} is not an object",
                            item.resource_key
                        )));
                    };
                    let mut merged = existing.clone();
                    for (k, v) in fields {
                        merged.insert(k.clone(), v.clone());
                    }
                    if &merged == existing {
                        Plan::Noop
                    } else {
                        Plan::Write {
                            value: Value::Object(merged),
                            change: Change::Updated,
                        }
                    }
                }
            }
        }

        (Action::Delete, Some(_)) => Plan::Remove,
        (Action::Delete, None) => Plan::Noop,
    };
    Ok(plan)
}
