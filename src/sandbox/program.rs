//! Verification Programs
//!
//! The closed set of checks a verification payload may run, plus the
//! line interpreter for dynamic `Script` payloads. Everything here
//! operates on a detached value snapshot: no store handle, no
//! filesystem, no network. A check can fail; it cannot reach out.

use regex::Regex;

use crate::types::{CheckResult, StoreSnapshot, Verdict, VerifyCheck};

/// Evaluate a list of checks against a read-only snapshot.
pub fn evaluate_checks(checks: &[VerifyCheck], snapshot: &StoreSnapshot) -> Verdict {
    let mut results = Vec::new();
    let mut output = Vec::new();
    let mut errors = Vec::new();

    for check in checks {
        match check {
            VerifyCheck::Script { source } => {
                let script_verdict = run_script(source, snapshot);
                results.extend(script_verdict.results);
                output.extend(script_verdict.output);
                errors.extend(script_verdict.errors);
            }
            typed => results.push(evaluate_typed(typed, snapshot)),
        }
    }

    let success = errors.is_empty() && results.iter().all(|r| r.passed);
    Verdict {
        success,
        results,
        output,
        errors,
    }
}

fn evaluate_typed(check: &VerifyCheck, snapshot: &StoreSnapshot) -> CheckResult {
    match check {
        VerifyCheck::Exists { path } => CheckResult {
            name: format!("exists:{path}"),
            passed: snapshot.get(path).is_some(),
            detail: None,
        },
        VerifyCheck::Equals { path, expected } => match snapshot.text(path) {
            Some(actual) if actual == *expected => CheckResult {
                name: format!("equals:{path}"),
                passed: true,
                detail: None,
            },
            Some(actual) => CheckResult {
                name: format!("equals:{path}"),
                passed: false,
                detail: Some(format!("expected {expected:?}, got {actual:?}")),
            },
            None => missing(format!("equals:{path}"), path),
        },
        VerifyCheck::Contains { path, needle } => match snapshot.text(path) {
            Some(actual) => CheckResult {
                name: format!("contains:{path}"),
                passed: actual.contains(needle),
                detail: (!actual.contains(needle)).then(|| format!("missing {needle:?}")),
            },
            None => missing(format!("contains:{path}"), path),
        },
        VerifyCheck::Matches { path, pattern } => {
            let name = format!("matches:{path}");
            let regex = match Regex::new(pattern) {
                Ok(regex) => regex,
                Err(e) => {
                    return CheckResult {
                        name,
                        passed: false,
                        detail: Some(format!("bad pattern {pattern:?}: {e}")),
                    }
                }
            };
            match snapshot.text(path) {
                Some(actual) => CheckResult {
                    name,
                    passed: regex.is_match(&actual),
                    detail: (!regex.is_match(&actual)).then(|| format!("no match for {pattern:?}")),
                },
                None => missing(name, path),
            }
        }
        VerifyCheck::ParsesJson { path } => match snapshot.text(path) {
            Some(actual) => match serde_json::from_str::<serde_json::Value>(&actual) {
                Ok(_) => CheckResult {
                    name: format!("json:{path}"),
                    passed: true,
                    detail: None,
                },
                Err(e) => CheckResult {
                    name: format!("json:{path}"),
                    passed: false,
                    detail: Some(e.to_string()),
                },
            },
            None => missing(format!("json:{path}"), path),
        },
        VerifyCheck::Script { .. } => unreachable!("scripts are expanded by evaluate_checks"),
    }
}

fn missing(name: String, path: &str) -> CheckResult {
    CheckResult {
        name,
        passed: false,
        detail: Some(format!("{path} not in snapshot")),
    }
}

// ---- Script Interpreter ----------------------------------------------------

/// Interpret a dynamic verification script, one directive per line.
///
/// Directives: `exists <path>`, `absent <path>`, `eq <path> <literal>`,
/// `contains <path> <needle>`, `matches <path> <regex>`, `json <path>`,
/// `echo <text>`. Blank lines and `#` comments are skipped. An unknown
/// directive is an error, not a silent pass.
pub fn run_script(source: &str, snapshot: &StoreSnapshot) -> Verdict {
    let mut results = Vec::new();
    let mut output = Vec::new();
    let mut errors = Vec::new();

    for (idx, raw_line) in source.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line_no = idx + 1;

        let (directive, rest) = match line.split_once(char::is_whitespace) {
            Some((d, r)) => (d, r.trim()),
            None => (line, ""),
        };

        match directive {
            "echo" => output.push(rest.to_string()),
            "exists" => results.push(named_line(
                line_no,
                evaluate_typed(
                    &VerifyCheck::Exists {
                        path: rest.to_string(),
                    },
                    snapshot,
                ),
            )),
            "absent" => {
                let present = snapshot.get(rest).is_some();
                results.push(CheckResult {
                    name: format!("L{line_no}:absent:{rest}"),
                    passed: !present,
                    detail: present.then(|| format!("{rest} unexpectedly present")),
                });
            }
            "eq" | "contains" | "matches" => {
                let Some((path, arg)) = rest.split_once(char::is_whitespace) else {
                    errors.push(format!("line {line_no}: {directive} needs a path and a value"));
                    continue;
                };
                let arg = arg.trim().to_string();
                let path = path.to_string();
                let check = match directive {
                    "eq" => VerifyCheck::Equals {
                        path,
                        expected: arg,
                    },
                    "contains" => VerifyCheck::Contains { path, needle: arg },
                    _ => VerifyCheck::Matches { path, pattern: arg },
                };
                results.push(named_line(line_no, evaluate_typed(&check, snapshot)));
            }
            "json" => results.push(named_line(
                line_no,
                evaluate_typed(
                    &VerifyCheck::ParsesJson {
                        path: rest.to_string(),
                    },
                    snapshot,
                ),
            )),
            other => errors.push(format!("line {line_no}: unknown directive {other:?}")),
        }
    }

    let success = errors.is_empty() && results.iter().all(|r| r.passed);
    Verdict {
        success,
        results,
        output,
        errors,
    }
}

fn named_line(line_no: usize, mut result: CheckResult) -> CheckResult {
    result.name = format!("L{line_no}:{}", result.name);
    result
}
