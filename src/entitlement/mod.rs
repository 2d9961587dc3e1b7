//! Scans handler source (or any text surface attached to a tool) for
//! undeclared I/O capabilities and obfuscation attempts, generalizing
//! `oxicrab::safety::leak_detector::LeakDetector`'s compiled named-regex
//! table from "known secret" detection to "capability identifier"
//! detection.

use std::sync::LazyLock;

use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum Capability {
    Filesystem,
    Network,
    Subprocess,
    Crypto,
    CodeEval,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::Subprocess => "subprocess",
            Self::Crypto => "crypto",
            Self::CodeEval => "code_eval",
        }
    }
}

struct Pattern {
    capability: Capability,
    name: &'static str,
    regex: &'static str,
}

const PATTERNS: &[Pattern] = &[
    Pattern { capability: Capability::Filesystem, name: "fs-open", regex: r"(?i)\b(?:std::fs::|fs\.(?:readFile|writeFile|open)|File::(?:open|create)|readFileSync|writeFileSync|unlinkSync)\b" },
    Pattern { capability: Capability::Filesystem, name: "path-traversal", regex: r"\.\./" },
    Pattern { capability: Capability::Network, name: "http-client", regex: r"(?i)\b(?:reqwest|fetch\(|http\.(?:get|post)|TcpStream::connect)\b" },
    Pattern { capability: Capability::Network, name: "raw-socket", regex: r"(?i)\bsocket\.(?:connect|bind)\b" },
    Pattern { capability: Capability::Subprocess, name: "shell-exec", regex: r"(?i)\b(?:std::process::Command|child_process|subprocess\.(?:run|Popen)|os\.system)\b" },
    Pattern { capability: Capability::Crypto, name: "keygen", regex: r"(?i)\b(?:generate_key|Rng::gen|OsRng|crypto\.randomBytes)\b" },
    Pattern { capability: Capability::CodeEval, name: "dynamic-eval", regex: r"(?i)\b(?:eval\(|Function\(|exec\(|compile\()" },
];

static COMPILED: LazyLock<Vec<(Capability, &'static str, Regex)>> = LazyLock::new(|| {
    PATTERNS
        .iter()
        .filter_map(|p| match Regex::new(p.regex) {
            Ok(re) => Some((p.capability, p.name, re)),
            Err(e) => {
                tracing::warn!(pattern = p.name, error = %e, "entitlement pattern failed to compile; skipping");
                None
            }
        })
        .collect()
});

/// A capability detected in source text, with the name of the pattern that
/// fired and its 1-based line number for debuggability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub capability: Capability,
    pub pattern: String,
    pub line: usize,
}

/// Precomputed newline offsets for O(log n) line-number resolution, rather
/// than rescanning from the start of the source for every match.
struct LineIndex {
    offsets: Vec<usize>,
}

impl LineIndex {
    fn build(source: &str) -> Self {
        let mut offsets = vec![0];
        offsets.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { offsets }
    }

    /// 1-based line number containing byte offset `pos`.
    fn line_at(&self, pos: usize) -> usize {
        match self.offsets.binary_search(&pos) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }
}

fn shannon_entropy(s: &str) -> f64 {
    let mut counts = [0usize; 256];
    for b in s.bytes() {
        counts[b as usize] += 1;
    }
    let len = s.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

const ENTROPY_THRESHOLD: f64 = 5.0;
const ENTROPY_MIN_LEN: usize = 64;

/// How confident the evasion layer is that a detected pattern is an
/// intentional static-analysis bypass rather than an innocent false
/// positive (e.g. a UUID that happens to look hex-decodable). Only `High`
/// confidence indicators count against the [`SafetyVerdict::safe`] and
/// [`ClaimVerdict::safe`] flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    Low,
    High,
}

/// Heuristics for code trying to hide what it's doing: unusually dense
/// base64/hex runs, high-entropy string literals, and bracket-notation or
/// dynamic-import indirection that a plain regex scan of known symbol names
/// would miss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvasionSignal {
    pub description: String,
    pub confidence: Confidence,
}

static STRING_LITERAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"\\]|\\.)*""#).expect("valid literal regex"));
static BRACKET_ACCESS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"\[\s*["'][A-Za-z_]+["']\s*\]"#).expect("valid bracket regex"));
static DYNAMIC_IMPORT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(?:import\(|require\(\s*[A-Za-z_]\w*\s*\))").expect("valid import regex"));
static BASE64_CANDIDATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/]{32,}={0,2}").expect("valid base64 regex"));
static HEX_CANDIDATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:0x)?[0-9a-fA-F]{32,}").expect("valid hex regex"));
static ESCAPE_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\\x[0-9a-fA-F]{2}|\\u\{?[0-9a-fA-F]{4,6}\}?").expect("valid escape regex"));

const DENSITY_MIN_LEN: usize = 32;
const ESCAPE_DENSITY_THRESHOLD: f64 = 0.15;

/// Flags base64/hex-looking runs dense enough (and long enough) to plausibly
/// be an encoded payload rather than an incidental token like a UUID or a
/// commit hash — mirrors `LeakDetector`'s base64/hex candidate pre-scan,
/// generalized from "probably a secret" to "probably an encoded capability
/// string". Runtime decoding of a literal is a bypass mechanism in its own
/// right, so a confirmed decode is `High` confidence.
fn detect_encoding_density(source: &str) -> Vec<EvasionSignal> {
    let mut signals = Vec::new();

    for m in BASE64_CANDIDATE.find_iter(source) {
        let candidate = m.as_str();
        if candidate.len() >= DENSITY_MIN_LEN && base64::engine::general_purpose::STANDARD.decode(candidate.trim_end_matches('=')).is_ok() {
            signals.push(EvasionSignal {
                description: format!("base64-decodable run of {} characters", candidate.len()),
                confidence: Confidence::High,
            });
        }
    }

    for m in HEX_CANDIDATE.find_iter(source) {
        let candidate = m.as_str().trim_start_matches("0x");
        if candidate.len() >= DENSITY_MIN_LEN && hex::decode(candidate).is_ok() {
            signals.push(EvasionSignal {
                description: format!("hex-decodable run of {} characters", candidate.len()),
                confidence: Confidence::High,
            });
        }
    }

    signals
}

/// Flags source where hex (`\xNN`) or unicode (`\uNNNN`) escape sequences
/// make up more than 15% of the total length — a density real code rarely
/// needs, but obfuscated identifier/string construction reaches for often.
fn detect_escape_density(source: &str) -> Option<EvasionSignal> {
    if source.is_empty() {
        return None;
    }
    let escaped_chars: usize = ESCAPE_SEQUENCE.find_iter(source).map(|m| m.len()).sum();
    let density = escaped_chars as f64 / source.len() as f64;
    if density > ESCAPE_DENSITY_THRESHOLD {
        Some(EvasionSignal {
            description: format!("hex/unicode escape density of {:.0}% exceeds the 15% threshold", density * 100.0),
            confidence: Confidence::High,
        })
    } else {
        None
    }
}

fn detect_evasion(source: &str) -> Vec<EvasionSignal> {
    let mut signals = Vec::new();

    for m in STRING_LITERAL.find_iter(source) {
        let literal = m.as_str();
        let inner = &literal[1..literal.len().saturating_sub(1)];
        if inner.len() >= ENTROPY_MIN_LEN && shannon_entropy(inner) > ENTROPY_THRESHOLD {
            signals.push(EvasionSignal {
                description: format!("high-entropy string literal ({:.1} bits/char, {} chars)", shannon_entropy(inner), inner.len()),
                confidence: Confidence::High,
            });
        }
    }

    if BRACKET_ACCESS.is_match(source) {
        signals.push(EvasionSignal {
            description: "bracket-notation property access found (possible identifier obfuscation)".into(),
            confidence: Confidence::High,
        });
    }

    if DYNAMIC_IMPORT.is_match(source) {
        signals.push(EvasionSignal {
            description: "dynamic import/require with a non-literal specifier".into(),
            confidence: Confidence::High,
        });
    }

    signals.extend(detect_encoding_density(source));
    signals.extend(detect_escape_density(source));

    signals
}

fn scan_capabilities(source: &str) -> Vec<Finding> {
    let lines = LineIndex::build(source);
    COMPILED
        .iter()
        .flat_map(|(capability, name, re)| {
            re.find_iter(source).map(move |m| Finding {
                capability: *capability,
                pattern: (*name).to_string(),
                line: lines.line_at(m.start()),
            })
        })
        .collect()
}

/// The outcome of scanning one handler's source against its declared
/// entitlements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub detected: Vec<Finding>,
    pub undeclared: Vec<Finding>,
    pub evasion_signals: Vec<EvasionSignal>,
    pub safe: bool,
}

/// Scans `source` and compares detected capabilities against `declared`.
/// Any detected capability not present in `declared`, or any `High`
/// confidence evasion signal, makes the verdict unsafe.
pub fn scan(source: &str, declared: &[Capability]) -> SafetyVerdict {
    let detected = scan_capabilities(source);
    let undeclared: Vec<Finding> = detected.iter().filter(|f| !declared.contains(&f.capability)).cloned().collect();
    let evasion_signals = detect_evasion(source);

    let safe = undeclared.is_empty() && !evasion_signals.iter().any(|s| s.confidence == Confidence::High);

    SafetyVerdict {
        safe,
        detected,
        undeclared,
        evasion_signals,
    }
}

/// What a tool author declares about an action's intended behavior, used to
/// validate the handler source actually matches its stated flags (spec
/// §4.5.3 "claim validation").
#[derive(Debug, Clone, Default)]
pub struct Claims {
    pub read_only: bool,
    pub destructive: bool,
    pub allowed: Vec<Capability>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    Error,
    Warning,
}

/// A single claim/behavior mismatch, e.g. a `readOnly` action whose source
/// touches the filesystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Violation {
    pub rule: &'static str,
    pub severity: ViolationSeverity,
    pub message: String,
}

/// The I/O-capability summary attached to a [`crate::introspector::ToolContract`]:
/// one boolean per category plus the raw pattern names that fired.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entitlements {
    pub filesystem: bool,
    pub network: bool,
    pub subprocess: bool,
    pub crypto: bool,
    pub code_evaluation: bool,
    pub raw: Vec<String>,
}

impl Entitlements {
    fn from_findings(findings: &[Finding]) -> Self {
        let has = |cap: Capability| findings.iter().any(|f| f.capability == cap);
        let mut raw: Vec<String> = findings.iter().map(|f| f.pattern.clone()).collect();
        raw.sort();
        raw.dedup();
        Self {
            filesystem: has(Capability::Filesystem),
            network: has(Capability::Network),
            subprocess: has(Capability::Subprocess),
            crypto: has(Capability::Crypto),
            code_evaluation: has(Capability::CodeEval),
            raw,
        }
    }
}

/// Applies the spec's five claim-validation policy rules against detected
/// capabilities. Conservative in the over-reporting direction: a detected
/// `Filesystem` finding is treated as write-capable for rule 1, since the
/// pattern layer does not itself distinguish read from write access.
fn validate_claims(findings: &[Finding], claims: &Claims) -> Vec<Violation> {
    let mut violations = Vec::new();
    let has = |cap: Capability| findings.iter().any(|f| f.capability == cap);

    if claims.read_only && has(Capability::Filesystem) {
        violations.push(Violation {
            rule: "read_only_filesystem",
            severity: ViolationSeverity::Error,
            message: "action declares readOnly but its source touches the filesystem".into(),
        });
    }
    if claims.read_only && has(Capability::Subprocess) {
        violations.push(Violation {
            rule: "read_only_subprocess",
            severity: ViolationSeverity::Error,
            message: "action declares readOnly but its source spawns a subprocess".into(),
        });
    }
    if claims.read_only && has(Capability::Network) {
        violations.push(Violation {
            rule: "read_only_network",
            severity: ViolationSeverity::Warning,
            message: "action declares readOnly but its source performs network I/O".into(),
        });
    }
    if !claims.destructive && has(Capability::Subprocess) {
        violations.push(Violation {
            rule: "non_destructive_subprocess",
            severity: ViolationSeverity::Warning,
            message: "action is not marked destructive but its source spawns a subprocess".into(),
        });
    }
    if has(Capability::CodeEval) && !claims.allowed.contains(&Capability::CodeEval) {
        violations.push(Violation {
            rule: "undeclared_code_evaluation",
            severity: ViolationSeverity::Error,
            message: "source evaluates code dynamically and code evaluation is not in the allowed list".into(),
        });
    }

    violations
}

/// The outcome of scanning a handler's source text against its declared
/// claims: detected capabilities, evasion signals, policy violations, a
/// rolled-up [`Entitlements`] summary, and a final safety verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimVerdict {
    pub detected: Vec<Finding>,
    pub evasion_signals: Vec<EvasionSignal>,
    pub violations: Vec<Violation>,
    pub entitlements: Entitlements,
    pub safe: bool,
}

/// Scans `source` and validates it against `claims`. `safe` holds iff no
/// violation has `Error` severity and no evasion indicator has `High`
/// confidence.
pub fn scan_and_validate(source: &str, claims: &Claims) -> ClaimVerdict {
    let detected = scan_capabilities(source);
    let evasion_signals = detect_evasion(source);
    let violations = validate_claims(&detected, claims);
    let entitlements = Entitlements::from_findings(&detected);

    let safe = !violations.iter().any(|v| v.severity == ViolationSeverity::Error)
        && !evasion_signals.iter().any(|s| s.confidence == Confidence::High);

    ClaimVerdict {
        detected,
        evasion_signals,
        violations,
        entitlements,
        safe,
    }
}
