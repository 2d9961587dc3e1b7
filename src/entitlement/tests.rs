use super::*;

#[test]
fn detects_filesystem_capability() {
    let verdict = scan("std::fs::read_to_string(path)?;", &[]);
    assert!(verdict.detected.iter().any(|f| f.capability == Capability::Filesystem));
    assert!(!verdict.safe);
}

#[test]
fn declared_capability_is_not_flagged_as_undeclared() {
    let verdict = scan("reqwest::get(url).await?;", &[Capability::Network]);
    assert!(verdict.detected.iter().any(|f| f.capability == Capability::Network));
    assert!(verdict.undeclared.is_empty());
    assert!(verdict.safe);
}

#[test]
fn undeclared_capability_fails_the_verdict() {
    let verdict = scan("std::process::Command::new(\"sh\")", &[]);
    assert!(!verdict.undeclared.is_empty());
    assert!(!verdict.safe);
}

#[test]
fn high_entropy_literal_is_an_evasion_signal() {
    let noisy = "x9F2qL0zWm7pYv1TcRaEoKdUsBgNhJiXz8Q4rT6wMnC3l";
    let source = format!("let key = \"{noisy}{noisy}\";");
    let verdict = scan(&source, &[]);
    assert!(!verdict.evasion_signals.is_empty());
}

#[test]
fn plain_code_with_no_capabilities_is_safe() {
    let verdict = scan("let total = a + b; return total;", &[]);
    assert!(verdict.safe);
    assert!(verdict.detected.is_empty());
}

#[test]
fn bracket_notation_access_is_flagged() {
    let verdict = scan(r#"globalThis["fetch"]("https://x")"#, &[]);
    assert!(verdict.evasion_signals.iter().any(|s| s.description.contains("bracket")));
}

#[test]
fn base64_decodable_run_is_flagged() {
    let payload = base64::engine::general_purpose::STANDARD.encode(b"this is a long enough secret payload to flag");
    let source = format!("let blob = \"{payload}\";");
    let verdict = scan(&source, &[]);
    assert!(verdict.evasion_signals.iter().any(|s| s.description.contains("base64")));
}

#[test]
fn shannon_entropy_of_repeated_char_is_zero() {
    assert_eq!(shannon_entropy("aaaaaaaa"), 0.0);
}

#[test]
fn findings_carry_one_based_line_numbers() {
    let source = "let a = 1;\nlet b = 2;\nstd::fs::read_to_string(path)?;\n";
    let verdict = scan(source, &[]);
    let finding = verdict.detected.iter().find(|f| f.capability == Capability::Filesystem).unwrap();
    assert_eq!(finding.line, 3);
}

#[test]
fn read_only_claim_with_filesystem_write_is_an_error() {
    let source = "import fs from 'fs'; writeFileSync('/tmp/x','data');";
    let claims = Claims {
        read_only: true,
        destructive: false,
        allowed: vec![],
    };
    let verdict = scan_and_validate(source, &claims);
    assert!(!verdict.safe);
    assert!(verdict.violations.iter().any(|v| v.severity == ViolationSeverity::Error));
    assert!(verdict.entitlements.filesystem);
}

#[test]
fn read_only_claim_with_network_is_only_a_warning() {
    let source = "reqwest::get(url).await?;";
    let claims = Claims {
        read_only: true,
        destructive: false,
        allowed: vec![],
    };
    let verdict = scan_and_validate(source, &claims);
    assert!(verdict.safe);
    assert!(verdict.violations.iter().any(|v| v.severity == ViolationSeverity::Warning));
}

#[test]
fn code_evaluation_is_an_error_regardless_of_other_claims() {
    let source = "eval(user_input)";
    let claims = Claims {
        read_only: false,
        destructive: true,
        allowed: vec![],
    };
    let verdict = scan_and_validate(source, &claims);
    assert!(!verdict.safe);
    assert!(verdict.entitlements.code_evaluation);
}

#[test]
fn code_evaluation_in_allowed_list_is_not_a_violation() {
    let source = "eval(user_input)";
    let claims = Claims {
        read_only: false,
        destructive: false,
        allowed: vec![Capability::CodeEval],
    };
    let verdict = scan_and_validate(source, &claims);
    assert!(verdict.violations.iter().all(|v| v.rule != "undeclared_code_evaluation"));
}
