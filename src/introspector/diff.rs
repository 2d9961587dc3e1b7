//! Diffs two [`ToolContract`]s and classifies each change by severity, so an
//! embedding application can decide whether a drifted tool needs a human
//! look before it's re-exposed to a model.

use serde::{Deserialize, Serialize};

use super::contract::ToolContract;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Benign,
    Risky,
    Breaking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractChange {
    pub severity: Severity,
    pub description: String,
}

fn became_more_dangerous(old: &str, new: &str) -> bool {
    // `destructive`/`idempotent` flags getting asserted (from unset/false to
    // true) make an action more dangerous than before; the reverse does not.
    old != "true" && new == "true"
}

fn became_less_safe_read_only(old: &str, new: &str) -> bool {
    old == "true" && new != "true"
}

/// Compares `old` against `new`, returning every detected change. An action
/// present in `old` but absent from `new` is `Breaking`; a brand-new
/// non-destructive action is `Benign`; everything else falls out of the
/// per-field comparison rules below.
pub fn diff(old: &ToolContract, new: &ToolContract) -> Vec<ContractChange> {
    let mut changes = Vec::new();

    if old.schema_digest != new.schema_digest {
        for old_action in &old.action_keys {
            if !new.action_keys.contains(old_action) {
                changes.push(ContractChange {
                    severity: Severity::Breaking,
                    description: format!("action '{old_action}' was removed"),
                });
            }
        }

        for new_action in &new.action_keys {
            if !old.action_keys.contains(new_action) {
                let destructive = new
                    .behavior_for(new_action)
                    .is_some_and(|b| b.destructive == "true");
                changes.push(ContractChange {
                    severity: if destructive { Severity::Risky } else { Severity::Benign },
                    description: format!("action '{new_action}' was added"),
                });
            }
        }
    }

    for old_behavior in &old.behavior {
        let Some(new_behavior) = new.behavior_for(&old_behavior.action) else {
            continue; // already reported as removed above
        };

        if became_more_dangerous(&old_behavior.destructive, &new_behavior.destructive) {
            changes.push(ContractChange {
                severity: Severity::Breaking,
                description: format!("action '{}' became destructive", old_behavior.action),
            });
        }
        if became_less_safe_read_only(&old_behavior.read_only, &new_behavior.read_only) {
            changes.push(ContractChange {
                severity: Severity::Risky,
                description: format!("action '{}' is no longer read-only", old_behavior.action),
            });
        }
        if old_behavior.idempotent == "true" && new_behavior.idempotent != "true" {
            changes.push(ContractChange {
                severity: Severity::Risky,
                description: format!("action '{}' is no longer idempotent", old_behavior.action),
            });
        }
    }

    if old.token_economics.total_field_count != new.token_economics.total_field_count {
        changes.push(ContractChange {
            severity: Severity::Benign,
            description: format!(
                "field count changed from {} to {}",
                old.token_economics.total_field_count, new.token_economics.total_field_count
            ),
        });
    }

    changes.extend(entitlement_category_changes(old, new));

    changes
}

/// A newly-asserted entitlement category (filesystem, network, subprocess,
/// crypto, code evaluation) is `Breaking` — the tool can now do something a
/// caller that trusted the previous contract did not sign up for.
fn entitlement_category_changes(old: &ToolContract, new: &ToolContract) -> Vec<ContractChange> {
    let categories: [(&str, fn(&crate::entitlement::Entitlements) -> bool); 5] = [
        ("filesystem", |e| e.filesystem),
        ("network", |e| e.network),
        ("subprocess", |e| e.subprocess),
        ("crypto", |e| e.crypto),
        ("code evaluation", |e| e.code_evaluation),
    ];

    categories
        .iter()
        .filter_map(|(name, get)| {
            let was_present = get(&old.entitlements);
            let is_present = get(&new.entitlements);
            (!was_present && is_present).then(|| ContractChange {
                severity: Severity::Breaking,
                description: format!("new entitlement category enabled: {name}"),
            })
        })
        .collect()
}

/// Filters to `Breaking`/`Risky` changes and truncates to the top `limit`,
/// for surfacing in a self-healing `<contract_awareness>` hook without
/// flooding the caller.
pub fn top_actionable(changes: &[ContractChange], limit: usize) -> Vec<&ContractChange> {
    changes
        .iter()
        .filter(|c| c.severity >= Severity::Risky)
        .take(limit)
        .collect()
}
