//! Generates and checks a lockfile: an alphabetically sorted snapshot of
//! every registered tool's contract plus a top-level integrity digest,
//! serialized deterministically (2-space indent, trailing newline) so it
//! diffs cleanly in version control.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::compiler::canonical_json;
use crate::introspector::contract::ToolContract;

pub const LOCKFILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockfile {
    #[serde(rename = "lockfileVersion")]
    pub lockfile_version: u32,
    #[serde(rename = "serverName")]
    pub server_name: String,
    #[serde(rename = "frameworkVersion")]
    pub framework_version: String,
    #[serde(rename = "generatedAt")]
    pub generated_at: DateTime<Utc>,
    pub tools: Vec<ToolContract>,
    pub integrity: String,
}

/// The outcome of comparing a persisted lockfile against freshly derived
/// contracts, suitable for gating CI on drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub ok: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
    pub message: String,
}

impl Lockfile {
    /// Builds a lockfile from a set of contracts, sorting them by tool name
    /// and computing the top-level integrity digest over the sorted set.
    /// `generated_at` is excluded from the integrity digest so re-generating
    /// at a later instant from identical contracts is still recognized as
    /// unchanged by [`Self::check`].
    pub fn generate(mut tools: Vec<ToolContract>, server_name: impl Into<String>, framework_version: impl Into<String>, generated_at: DateTime<Utc>) -> Self {
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        let integrity = Self::compute_integrity(&tools);
        Self {
            lockfile_version: LOCKFILE_VERSION,
            server_name: server_name.into(),
            framework_version: framework_version.into(),
            generated_at,
            tools,
            integrity,
        }
    }

    fn compute_integrity(tools: &[ToolContract]) -> String {
        let value = serde_json::to_value(tools).unwrap_or(serde_json::Value::Null);
        let digest = Sha256::digest(canonical_json(&value).as_bytes());
        hex::encode(digest)
    }

    /// Re-derives the integrity digest and compares it against the stored
    /// one, detecting hand-edited or corrupted lockfiles independent of any
    /// single tool's contract drift.
    pub fn is_internally_consistent(&self) -> bool {
        Self::compute_integrity(&self.tools) == self.integrity
    }

    /// Serializes with 2-space indentation and a trailing newline.
    pub fn to_pretty_string(&self) -> serde_json::Result<String> {
        let mut s = serde_json::to_string_pretty(self)?;
        s.push('\n');
        Ok(s)
    }

    /// Parses a persisted lockfile. Rejects anything but
    /// `lockfileVersion == 1` the way the spec's parser does, rather than
    /// attempting forward/backward compatibility this crate doesn't define.
    pub fn from_str(s: &str) -> serde_json::Result<Self> {
        let lock: Self = serde_json::from_str(s)?;
        if lock.lockfile_version != LOCKFILE_VERSION {
            return Err(serde::de::Error::custom(format!(
                "unsupported lockfileVersion {}; expected {LOCKFILE_VERSION}",
                lock.lockfile_version
            )));
        }
        Ok(lock)
    }

    /// Looks up a tool's previously locked contract by name.
    pub fn get(&self, name: &str) -> Option<&ToolContract> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Compares this (persisted) lockfile against a freshly derived set of
    /// contracts, classifying every tool as added, removed, changed, or
    /// unchanged. Suitable for a CI gate: `ok` is false whenever anything
    /// other than an addition is detected, since removed or changed tools
    /// mean the surface a prior commit locked no longer matches reality.
    pub fn check(&self, current: &[ToolContract]) -> CheckResult {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();
        let mut unchanged = Vec::new();

        for tool in current {
            match self.get(&tool.name) {
                None => added.push(tool.name.clone()),
                Some(locked) if locked.integrity == tool.integrity => unchanged.push(tool.name.clone()),
                Some(_) => changed.push(tool.name.clone()),
            }
        }

        let current_names: Vec<&str> = current.iter().map(|t| t.name.as_str()).collect();
        for locked in &self.tools {
            if !current_names.contains(&locked.name.as_str()) {
                removed.push(locked.name.clone());
            }
        }

        added.sort();
        removed.sort();
        changed.sort();
        unchanged.sort();

        let ok = removed.is_empty() && changed.is_empty();
        let message = if ok {
            "fusion lock matches the current tool surface".to_string()
        } else {
            format!(
                "fusion lock is out of date: {} removed, {} changed (run the generator to refresh it)",
                removed.len(),
                changed.len()
            )
        };

        CheckResult {
            ok,
            added,
            removed,
            changed,
            unchanged,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspector::contract::TokenEconomics;

    fn contract(name: &str) -> ToolContract {
        ToolContract {
            name: name.into(),
            tags: vec![],
            fingerprint: "f".into(),
            action_keys: vec!["a".into()],
            schema_digest: "d".into(),
            behavior: vec![],
            token_economics: TokenEconomics {
                total_field_count: 0,
                total_description_chars: 0,
            },
            entitlements: Default::default(),
            integrity: "i".into(),
        }
    }

    fn generate(tools: Vec<ToolContract>) -> Lockfile {
        Lockfile::generate(tools, "test-server", "0.1.0", Utc::now())
    }

    #[test]
    fn generate_sorts_tools_alphabetically() {
        let lock = generate(vec![contract("zeta"), contract("alpha")]);
        assert_eq!(lock.tools[0].name, "alpha");
        assert_eq!(lock.tools[1].name, "zeta");
    }

    #[test]
    fn pretty_string_ends_with_newline_and_two_space_indent() {
        let lock = generate(vec![contract("billing")]);
        let s = lock.to_pretty_string().unwrap();
        assert!(s.ends_with('\n'));
        assert!(s.contains("\n  \""));
    }

    #[test]
    fn tampering_with_a_tool_breaks_integrity_check() {
        let mut lock = generate(vec![contract("billing")]);
        assert!(lock.is_internally_consistent());
        lock.tools[0].integrity = "tampered".into();
        assert!(!lock.is_internally_consistent());
    }

    #[test]
    fn round_trips_through_string_serialization() {
        let lock = generate(vec![contract("billing")]);
        let s = lock.to_pretty_string().unwrap();
        let parsed = Lockfile::from_str(&s).unwrap();
        assert_eq!(parsed.integrity, lock.integrity);
    }

    #[test]
    fn rejects_unsupported_lockfile_version() {
        let mut lock = generate(vec![contract("billing")]);
        lock.lockfile_version = 2;
        let s = lock.to_pretty_string().unwrap();
        assert!(Lockfile::from_str(&s).is_err());
    }

    #[test]
    fn check_flags_a_changed_tool() {
        let lock = generate(vec![contract("users")]);
        let mut drifted = contract("users");
        drifted.integrity = "new-integrity".into();

        let result = lock.check(&[drifted]);
        assert!(!result.ok);
        assert_eq!(result.changed, vec!["users".to_string()]);
        assert!(result.message.contains("fusion lock"));
    }

    #[test]
    fn check_flags_a_tool_whose_schema_is_unchanged_but_entitlements_grew() {
        let mut locked = contract("users");
        locked.entitlements.filesystem = false;
        let lock = Lockfile::generate(vec![locked.clone()], "test-server", "0.1.0", Utc::now());

        let mut drifted = locked.clone();
        drifted.entitlements.filesystem = true;
        drifted.integrity = "users-with-filesystem".into();

        let result = lock.check(&[drifted]);
        assert!(!result.ok);
        assert_eq!(result.changed, vec!["users".to_string()]);
    }

    #[test]
    fn check_flags_a_removed_tool() {
        let lock = generate(vec![contract("users"), contract("billing")]);
        let result = lock.check(&[contract("billing")]);
        assert!(!result.ok);
        assert_eq!(result.removed, vec!["users".to_string()]);
    }

    #[test]
    fn check_is_ok_for_an_added_tool_only() {
        let lock = generate(vec![contract("billing")]);
        let result = lock.check(&[contract("billing"), contract("new_tool")]);
        assert!(result.ok);
        assert_eq!(result.added, vec!["new_tool".to_string()]);
    }
}
