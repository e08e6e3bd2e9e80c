//! Business status code extraction.
//!
//! Upstream gateways signal a policy rejection by embedding a status code in
//! the JSON payload, either in a full error body or inside a single stream
//! chunk. The code can sit at one of three places:
//!
//! ```text
//! {"code": 1400, ...}
//! {"error": {"code": 1400, ...}}
//! {"data":  {"code": 1500, ...}}
//! ```
//!
//! Lookup never fails: anything that is not one of these shapes is "no code".

use sonic_rs::{JsonValueTrait, Value};

/// Codes reserved for "upstream rejected the content for policy reasons".
pub const VIOLATION_CODES: [i64; 2] = [1400, 1500];

/// Probes `code`, `error.code`, `data.code` in that order and returns the first
/// integer found.
pub fn extract_business_code(value: &Value) -> Option<i64> {
    if !value.is_object() {
        return None;
    }

    if let Some(code) = value.get("code").and_then(|c| c.as_i64()) {
        return Some(code);
    }

    for parent in ["error", "data"] {
        if let Some(nested) = value.get(parent) {
            if nested.is_object() {
                if let Some(code) = nested.get("code").and_then(|c| c.as_i64()) {
                    return Some(code);
                }
            }
        }
    }

    None
}

/// Parses `bytes` as JSON and extracts the business code. Malformed input yields `None`.
pub fn business_code_of(bytes: &[u8]) -> Option<i64> {
    let value: Value = sonic_rs::from_slice(bytes).ok()?;
    extract_business_code(&value)
}

pub fn is_violation(code: Option<i64>) -> bool {
    matches!(code, Some(c) if VIOLATION_CODES.contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(text: &str) -> Option<i64> {
        business_code_of(text.as_bytes())
    }

    #[test]
    fn top_level_code() {
        assert_eq!(code(r#"{"code":1400}"#), Some(1400));
        assert_eq!(code(r#"{"code":0,"msg":"ok"}"#), Some(0));
    }

    #[test]
    fn nested_error_and_data_codes() {
        assert_eq!(code(r#"{"error":{"code":1500,"message":"blocked"}}"#), Some(1500));
        assert_eq!(code(r#"{"data":{"code":1400}}"#), Some(1400));
    }

    #[test]
    fn top_level_wins_over_nested() {
        assert_eq!(code(r#"{"code":200,"error":{"code":1400}}"#), Some(200));
        assert_eq!(code(r#"{"error":{"code":1500},"data":{"code":1400}}"#), Some(1500));
    }

    #[test]
    fn non_integer_code_falls_through_to_next_shape() {
        assert_eq!(code(r#"{"code":"1400","error":{"code":1500}}"#), Some(1500));
        assert_eq!(code(r#"{"code":1400.5}"#), None);
        assert_eq!(code(r#"{"error":"bad","data":{"code":7}}"#), Some(7));
        assert_eq!(code(r#"{"error":{"code":null}}"#), None);
    }

    #[test]
    fn never_fails_on_odd_input() {
        assert_eq!(code(""), None);
        assert_eq!(code("not json"), None);
        assert_eq!(code("{\"code\":"), None);
        assert_eq!(code("[1400]"), None);
        assert_eq!(code(r#"[{"code":1400}]"#), None);
        assert_eq!(code("1400"), None);
        assert_eq!(code("\"code\""), None);
        assert_eq!(code("null"), None);
    }

    #[test]
    fn violation_codes() {
        assert!(is_violation(Some(1400)));
        assert!(is_violation(Some(1500)));
        assert!(!is_violation(Some(1401)));
        assert!(!is_violation(Some(0)));
        assert!(!is_violation(None));
    }
}
