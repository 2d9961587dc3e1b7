//! Decorates successful tool responses with a `<cache_invalidation>` hint
//! and emits debounced `resources/updated`-style notifications, driven by
//! the state-sync hints accumulated on the [`crate::builder::ToolBuilder`].
//! Glob policy matching uses `globset`, the same crate `casparianflow` and
//! several retrieved examples reach for when they need shell-style path
//! matching rather than full regex.

use std::panic::AssertUnwindSafe;

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use indexmap::IndexMap;

use crate::builder::{CacheControl, StateSyncHint};
use crate::compiler::CompiledTool;
use crate::response::{ContentBlock, ToolResponse};

#[cfg(test)]
mod tests;

/// Receives `resources/updated`-shaped notifications. Implementations must
/// not assume they run on any particular executor; the decorator invokes
/// this synchronously and swallows panics so a misbehaving sink can never
/// take down a dispatch call.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, resource_uri: &str);
}

/// A sink that records every URI it receives; mainly useful for tests and
/// for embedders building their own fan-out on top.
#[derive(Default)]
pub struct RecordingSink {
    seen: std::sync::Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, resource_uri: &str) {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(resource_uri.to_string());
    }
}

/// Compiles a single `.`-separated pattern into a glob matcher with `/` as
/// the literal path separator, so `*` matches exactly one segment and `**`
/// is required to cross segments — the dialect spec'd for state-sync and
/// cache-invalidation patterns.
fn build_glob(pattern: &str) -> Result<Glob, globset::Error> {
    GlobBuilder::new(&pattern.replace('.', "/")).literal_separator(true).build()
}

/// Resolves the effective hint for an action key: every hint whose match
/// pattern (an action name, a `group.*`-style glob, or the bare `*`
/// wildcard) matches `action_key` is merged in, least-specific first, so
/// that a more specific pattern's `cacheControl` wins last-write-wins over a
/// broader one registered earlier. `invalidates` patterns accumulate across
/// every matching hint.
fn effective_hint(hints: &IndexMap<String, StateSyncHint>, action_key: &str) -> StateSyncHint {
    let path = action_key.replace('.', "/");
    let mut merged = StateSyncHint::default();
    for (pattern, hint) in hints {
        let is_match = pattern == "*" || pattern == action_key || build_glob(pattern).is_ok_and(|g| g.compile_matcher().is_match(&path));
        if !is_match {
            continue;
        }
        merged.invalidates.extend(hint.invalidates.iter().cloned());
        if hint.cache_control.is_some() {
            merged.cache_control = hint.cache_control;
        }
    }
    merged
}

pub(crate) fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn cache_invalidation_block(cause: &str, patterns: &[String]) -> ContentBlock {
    let items = patterns
        .iter()
        .map(|p| format!("  <pattern>{}</pattern>", xml_escape(p)))
        .collect::<Vec<_>>()
        .join("\n");
    let text = format!("<cache_invalidation cause=\"{}\">\n{}\n</cache_invalidation>", xml_escape(cause), items);
    ContentBlock::text(text)
}

/// Applies state-sync decoration to a dispatch outcome for `action_key`.
/// Error responses bypass decoration entirely and pass through unchanged —
/// a failed call invalidated nothing.
pub fn decorate(
    compiled: &CompiledTool,
    action_key: &str,
    sink: &dyn NotificationSink,
    mut response: ToolResponse,
) -> ToolResponse {
    if response.is_error() {
        return response;
    }

    let hint = effective_hint(&compiled.state_sync, action_key);
    if hint.invalidates.is_empty() {
        return response;
    }

    for pattern in &hint.invalidates {
        let uri = format!("fusion://stale/{pattern}");
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| sink.notify(&uri)));
        if outcome.is_err() {
            tracing::warn!(pattern = %pattern, "state-sync notification sink panicked; ignoring");
        }
    }

    response.content.push(cache_invalidation_block(action_key, &hint.invalidates));
    response
}

/// Whether `cache_control` marks a resource immutable for client-side
/// caching purposes.
pub fn is_immutable(hints: &IndexMap<String, StateSyncHint>, action_key: &str) -> bool {
    matches!(effective_hint(hints, action_key).cache_control, Some(CacheControl::Immutable))
}

/// Compiles a set of glob patterns (`*` matches one path segment, `**`
/// matches zero or more, `.` is the separator) into a matcher usable
/// against resource identifiers.
pub fn compile_patterns(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(build_glob(pattern)?);
    }
    builder.build()
}

/// Detects pattern pairs where one subsumes the other (e.g. `invoices.*`
/// subsumes `invoices.created`), which the embedding application may want
/// to flag as redundant policy. A pattern is considered to subsume another
/// distinct pattern if matching the broader pattern against the narrower
/// pattern's literal text succeeds.
pub fn detect_overlaps(patterns: &[String]) -> Vec<(String, String)> {
    let mut overlaps = Vec::new();
    for broad in patterns {
        let Ok(glob) = build_glob(broad) else {
            continue;
        };
        let matcher = glob.compile_matcher();
        for narrow in patterns {
            if broad == narrow {
                continue;
            }
            if matcher.is_match(narrow.replace('.', "/")) {
                overlaps.push((broad.clone(), narrow.clone()));
            }
        }
    }
    overlaps
}
