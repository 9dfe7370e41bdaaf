//! Function definitions as supplied by the metadata store
//!
//! A FANSY-SCRIPT function is identified by its module and name. The metadata
//! store hands out one immutable snapshot per revision; superseded revisions
//! are kept around because signature drift is judged against them.
//!
//! Stored heads follow the interpreter's comment convention:
//!
//! ```text
//! // Get_NDFL_Nach(%b_date:DATE, %e_date:DATE, %investor:INT=0) //== Accrued tax
//! ```
//!
//! A parameter carrying a default value (`=...`) is optional, every other
//! parameter is required.

use crate::extractor::split_top_level;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Identity of a piece of business logic: (module id, function name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId {
    pub module: String,
    pub name: String,
}

impl FunctionId {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}->{}", self.module, self.name)
        }
    }
}

/// A declared parameter of a function head
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub required: bool,
    /// Declared type as written in the head (`DATE`, `INT`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
}

impl Parameter {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            type_name: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            type_name: None,
        }
    }
}

/// Immutable snapshot of one revision of a function
///
/// `params` is mandatory in serialized form: an empty list means the function
/// takes no parameters, there is no "unknown" state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    #[serde(flatten)]
    pub id: FunctionId,
    pub params: Vec<Parameter>,
    #[serde(default)]
    pub body: String,
    pub revised_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FunctionDefinition {
    pub fn new(
        id: FunctionId,
        params: Vec<Parameter>,
        body: impl Into<String>,
        revised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            params,
            body: body.into(),
            revised_at,
            editor: None,
            description: None,
        }
    }

    /// Build a definition from a raw metadata-store row (head text + body)
    pub fn from_row(row: &StoredFunctionRow) -> Result<Self, HeaderParseError> {
        let header = parse_header(&row.head)?;
        Ok(Self {
            id: FunctionId::new(row.module.clone(), header.name),
            params: header.params,
            body: row.body.clone(),
            revised_at: row.revised_at,
            editor: row.editor.clone(),
            description: header.description,
        })
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn required_count(&self) -> usize {
        self.params.iter().filter(|p| p.required).count()
    }
}

/// A function row as the metadata store keeps it: unparsed head plus body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFunctionRow {
    pub module: String,
    pub head: String,
    #[serde(default)]
    pub body: String,
    pub revised_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
}

/// Parsed function head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionHeader {
    pub name: String,
    pub params: Vec<Parameter>,
    pub description: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderParseError {
    #[error("no function head found in {0:?}")]
    MissingHead(String),

    #[error("parameter list of {0} is never closed")]
    UnclosedParameters(String),

    #[error("empty parameter name at position {position} in head of {function}")]
    EmptyParameter { function: String, position: usize },
}

fn head_regex() -> &'static Regex {
    static HEAD: OnceLock<Regex> = OnceLock::new();
    HEAD.get_or_init(|| Regex::new(r"//\s*(\w+)\s*\(").expect("Invalid head pattern"))
}

/// Parse a stored function head
///
/// The parameter list may hold defaults with their own parentheses or
/// quoted commas (`%d:DATE=Today()`, `%sep:STRING=', '`); only top-level
/// commas separate parameters.
///
/// # Example
///
/// ```
/// use fansy_tracer::function_def::parse_header;
///
/// let header = parse_header("// Get_Rate(%date:DATE=Today(), %currency:STRING='RUB') //== Exchange rate").unwrap();
/// assert_eq!(header.name, "Get_Rate");
/// assert_eq!(header.params.len(), 2);
/// assert!(!header.params[0].required);
/// assert_eq!(header.description.as_deref(), Some("Exchange rate"));
/// ```
pub fn parse_header(text: &str) -> Result<FunctionHeader, HeaderParseError> {
    let mut unclosed = None;
    for caps in head_regex().captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let list = &text[whole.end()..];
        match split_top_level(list) {
            Some((segments, close)) => {
                return header_from_parts(name.as_str(), &segments, &list[close + 1..]);
            }
            None => {
                unclosed.get_or_insert_with(|| name.as_str().to_string());
            }
        }
    }
    Err(match unclosed {
        Some(function) => HeaderParseError::UnclosedParameters(function),
        None => HeaderParseError::MissingHead(text.chars().take(80).collect()),
    })
}

fn header_from_parts(
    name: &str,
    segments: &[&str],
    rest: &str,
) -> Result<FunctionHeader, HeaderParseError> {
    let description = rest
        .lines()
        .next()
        .and_then(|line| line.trim().strip_prefix("//=="))
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());

    let mut params = Vec::new();
    let empty_list = segments.len() == 1 && segments[0].trim().is_empty();
    if !empty_list {
        for (position, raw) in segments.iter().enumerate() {
            let raw = raw.trim();
            let (decl, has_default) = match raw.split_once('=') {
                Some((decl, _default)) => (decl.trim(), true),
                None => (raw, false),
            };
            let (param_name, type_name) = match decl.split_once(':') {
                Some((n, t)) => (n.trim(), Some(t.trim().to_string())),
                None => (decl, None),
            };
            let param_name = param_name.trim_start_matches('%');
            if param_name.is_empty() {
                return Err(HeaderParseError::EmptyParameter {
                    function: name.to_string(),
                    position,
                });
            }
            params.push(Parameter {
                name: param_name.to_string(),
                required: !has_default,
                type_name: type_name.filter(|t| !t.is_empty()),
            });
        }
    }

    Ok(FunctionHeader {
        name: name.to_string(),
        params,
        description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_header_with_types() {
        let header = parse_header(
            "// Get_NDFL_Nach(%b_date:DATE, %e_date:DATE, %investor:INT) //== Accrued tax",
        )
        .unwrap();
        assert_eq!(header.name, "Get_NDFL_Nach");
        assert_eq!(header.params.len(), 3);
        assert_eq!(header.params[2].name, "investor");
        assert_eq!(header.params[2].type_name.as_deref(), Some("INT"));
        assert_eq!(header.description.as_deref(), Some("Accrued tax"));
    }

    #[test]
    fn test_parse_header_without_params_is_empty_list() {
        let header = parse_header("// Today() //== current date").unwrap();
        assert!(header.params.is_empty());
    }

    #[test]
    fn test_parse_header_default_marks_optional() {
        let header = parse_header("// F(%a:INT, %b:INT=0)").unwrap();
        assert!(header.params[0].required);
        assert!(!header.params[1].required);
        assert_eq!(header.description, None);
    }

    #[test]
    fn test_parse_header_untyped_param() {
        let header = parse_header("// F(%a)").unwrap();
        assert_eq!(header.params[0].name, "a");
        assert_eq!(header.params[0].type_name, None);
    }

    #[test]
    fn test_parse_header_missing() {
        assert!(matches!(
            parse_header("var x := 1;"),
            Err(HeaderParseError::MissingHead(_))
        ));
    }

    #[test]
    fn test_parse_header_empty_param_name() {
        let err = parse_header("// F(%a, , %c)").unwrap_err();
        assert_eq!(
            err,
            HeaderParseError::EmptyParameter {
                function: "F".to_string(),
                position: 1
            }
        );
    }

    #[test]
    fn test_parse_header_default_with_call() {
        let header = parse_header("// Get_Rate(%date:DATE=Today(), %cur:STRING) //== Rate").unwrap();
        assert_eq!(header.params.len(), 2);
        assert_eq!(header.params[0].name, "date");
        assert!(!header.params[0].required);
        assert_eq!(header.params[1].name, "cur");
        assert!(header.params[1].required);
        assert_eq!(header.description.as_deref(), Some("Rate"));
    }

    #[test]
    fn test_parse_header_quoted_comma_in_default() {
        let header = parse_header("// Join(%items, %sep:STRING=', ', %close:STRING=')')").unwrap();
        let names: Vec<_> = header.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["items", "sep", "close"]);
        assert_eq!(header.params.iter().filter(|p| p.required).count(), 1);
    }

    #[test]
    fn test_parse_header_unclosed_list() {
        assert_eq!(
            parse_header("// F(%a, %b"),
            Err(HeaderParseError::UnclosedParameters("F".to_string()))
        );
    }

    #[test]
    fn test_parse_header_skips_plain_comments() {
        let header = parse_header("// helper, see docs\n// F(%a) //== real head").unwrap();
        assert_eq!(header.name, "F");
        assert_eq!(header.params.len(), 1);
    }

    #[test]
    fn test_required_count() {
        let def = FunctionDefinition::new(
            FunctionId::new("_F_BUX", "Get_Rate"),
            vec![Parameter::required("date"), Parameter::optional("currency")],
            "",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        assert_eq!(def.param_count(), 2);
        assert_eq!(def.required_count(), 1);
    }

    #[test]
    fn test_from_row() {
        let row = StoredFunctionRow {
            module: "_F_DOC".to_string(),
            head: "// GetDoc(%doc_id:INT) //== Fetch document".to_string(),
            body: "Result := 1;".to_string(),
            revised_at: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            editor: Some("ivanov".to_string()),
        };
        let def = FunctionDefinition::from_row(&row).unwrap();
        assert_eq!(def.id, FunctionId::new("_F_DOC", "GetDoc"));
        assert_eq!(def.required_count(), 1);
        assert_eq!(def.editor.as_deref(), Some("ivanov"));
    }

    #[test]
    fn test_function_id_display() {
        assert_eq!(FunctionId::new("_F_BUX", "Get_Rate").to_string(), "_F_BUX->Get_Rate");
        assert_eq!(FunctionId::new("", "Trim").to_string(), "Trim");
    }

    #[test]
    fn test_definition_json_requires_params() {
        let json = r#"{"module":"M","name":"F","body":"","revised_at":"2024-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<FunctionDefinition>(json).is_err());

        let json = r#"{"module":"M","name":"F","params":[],"revised_at":"2024-01-01T00:00:00Z"}"#;
        let def: FunctionDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.param_count(), 0);
    }
}
