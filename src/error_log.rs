//! Interpreter error-log parsing and correlation with drift findings
//!
//! The interpreter reports a stale call as "not all input parameters are
//! defined" naming the function that failed, far from the caller that
//! actually passed too few arguments. Matching those lines against the
//! static findings points the operator at the call site to fix.
//!
//! ```text
//! Не все входные параметры означены при вызове функции Get_NDFL_Nach, строка 42
//!                                                     ^^^^^^^^^^^^^        ^^
//!                                                     function             line
//! ```

use crate::drift::DriftFinding;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A function was entered without all its input parameters bound
    ParamNotDefined,
    /// Failure while processing a document
    DocError,
    /// Failure referencing a directory entry
    DirError,
}

/// One recognized error line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub kind: ErrorKind,
    /// Function named by the message
    pub function: Option<String>,
    /// Script line reported by the interpreter
    pub script_line: Option<usize>,
    /// Document or directory id
    pub object_id: Option<u64>,
    /// 1-based line within the log text
    pub log_line: usize,
    pub message: String,
}

/// Error entry together with the findings that may explain it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Correlation {
    pub entry: ErrorLogEntry,
    pub findings: Vec<DriftFinding>,
}

struct Patterns {
    param_not_defined: Regex,
    doc_error: Regex,
    dir_error: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        param_not_defined: Regex::new(
            r"(?i)Не все входные параметры означены.*функци[ияю]\s+(\w+)(?:.*строка\s+(\d+))?",
        )
        .expect("Invalid param pattern"),
        doc_error: Regex::new(r"(?i)Ошибка.*doc_id[=:\s]+(\d+)").expect("Invalid doc pattern"),
        dir_error: Regex::new(r"(?i)dir_id[=:\s]+(\d+)").expect("Invalid dir pattern"),
    })
}

/// Extract recognized error entries from log text, first matching pattern
/// per line
pub fn parse_log(text: &str) -> Vec<ErrorLogEntry> {
    let p = patterns();
    let mut entries = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let entry = |kind, function, script_line, object_id| ErrorLogEntry {
            kind,
            function,
            script_line,
            object_id,
            log_line: idx + 1,
            message: line.trim().to_string(),
        };

        if let Some(caps) = p.param_not_defined.captures(line) {
            entries.push(entry(
                ErrorKind::ParamNotDefined,
                caps.get(1).map(|m| m.as_str().to_string()),
                caps.get(2).and_then(|m| m.as_str().parse().ok()),
                None,
            ));
        } else if let Some(caps) = p.doc_error.captures(line) {
            entries.push(entry(
                ErrorKind::DocError,
                None,
                None,
                caps.get(1).and_then(|m| m.as_str().parse().ok()),
            ));
        } else if let Some(caps) = p.dir_error.captures(line) {
            entries.push(entry(
                ErrorKind::DirError,
                None,
                None,
                caps.get(1).and_then(|m| m.as_str().parse().ok()),
            ));
        }
    }

    tracing::debug!(entries = entries.len(), "Parsed error log");
    entries
}

/// Pair every function-naming entry with findings whose callee or caller
/// has that name (case-insensitive)
///
/// Entries without a function name, or with no matching finding, are left
/// out.
pub fn correlate(entries: &[ErrorLogEntry], findings: &[DriftFinding]) -> Vec<Correlation> {
    entries
        .iter()
        .filter_map(|entry| {
            let name = entry.function.as_deref()?.to_lowercase();
            let matched: Vec<DriftFinding> = findings
                .iter()
                .filter(|f| {
                    f.callee.name.to_lowercase() == name || f.caller.name.to_lowercase() == name
                })
                .cloned()
                .collect();
            (!matched.is_empty()).then(|| Correlation {
                entry: entry.clone(),
                findings: matched,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::{Confidence, DriftKind};
    use crate::function_def::FunctionId;

    const LOG: &str = "\
2025-10-02 10:00:01 INFO start
2025-10-02 10:00:02 ERROR Не все входные параметры означены при вызове функции Get_NDFL_Nach, строка 42
2025-10-02 10:00:03 ERROR Ошибка проведения документа doc_id=1001
2025-10-02 10:00:04 WARN справочник dir_id: 77
";

    fn finding(caller: &str, callee: &str) -> DriftFinding {
        DriftFinding {
            confidence: Confidence::Definite,
            kind: DriftKind::MissingRequired,
            caller: FunctionId::new("_F_DOC", caller),
            callee: FunctionId::new("_F_NDFL", callee),
            ordinal: 0,
            line: 1,
            found: Some(8),
            required: Some(9),
            declared: Some(9),
            previous: None,
            message: String::new(),
        }
    }

    #[test]
    fn test_parse_log_recognizes_patterns() {
        let entries = parse_log(LOG);
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].kind, ErrorKind::ParamNotDefined);
        assert_eq!(entries[0].function.as_deref(), Some("Get_NDFL_Nach"));
        assert_eq!(entries[0].script_line, Some(42));
        assert_eq!(entries[0].log_line, 2);

        assert_eq!(entries[1].kind, ErrorKind::DocError);
        assert_eq!(entries[1].object_id, Some(1001));

        assert_eq!(entries[2].kind, ErrorKind::DirError);
        assert_eq!(entries[2].object_id, Some(77));
    }

    #[test]
    fn test_param_error_without_line_number() {
        let entries = parse_log("не все входные параметры означены: функция Calc_Tax");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].function.as_deref(), Some("Calc_Tax"));
        assert_eq!(entries[0].script_line, None);
    }

    #[test]
    fn test_unrelated_lines_ignored() {
        assert!(parse_log("all good\nnothing to see").is_empty());
    }

    #[test]
    fn test_correlate_matches_callee_or_caller() {
        let entries = parse_log(LOG);
        let findings = vec![
            finding("Post_Doc", "Get_NDFL_Nach"),
            finding("Get_NDFL_Nach", "Round2"),
            finding("Other", "Unrelated"),
        ];
        let correlated = correlate(&entries, &findings);
        assert_eq!(correlated.len(), 1);
        assert_eq!(correlated[0].findings.len(), 2);
        assert_eq!(correlated[0].entry.log_line, 2);
    }
}
