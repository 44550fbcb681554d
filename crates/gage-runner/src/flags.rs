use anyhow::Result;
use gage_core::GageError;
use serde_json::{Map, Value};

/// Parses `NAME=VALUE` assignments into a config mapping, inferring scalar
/// types from the value text.
pub fn parse_flag_assigns(assigns: &[String]) -> Result<Map<String, Value>> {
    let mut flags = Map::new();
    for assign in assigns {
        let (name, value) = assign
            .split_once('=')
            .ok_or_else(|| GageError::InvalidFlag(assign.clone()))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(GageError::InvalidFlag(assign.clone()).into());
        }
        flags.insert(name.to_string(), parse_flag_value(value));
    }
    Ok(flags)
}

/// Int, float, bool or null when the text reads as one; otherwise a string
/// with one level of matching quotes removed.
pub fn parse_flag_value(s: &str) -> Value {
    let t = s.trim();
    match t {
        "true" | "True" | "yes" => return Value::Bool(true),
        "false" | "False" | "no" => return Value::Bool(false),
        "null" | "None" | "~" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = t.parse::<i64>() {
        return Value::from(i);
    }
    if looks_numeric(t) {
        if let Ok(f) = t.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }
    for q in ['"', '\''] {
        if t.len() >= 2 && t.starts_with(q) && t.ends_with(q) {
            return Value::String(t[1..t.len() - 1].to_string());
        }
    }
    Value::String(s.to_string())
}

// Rejects words like `inf` and `nan` that f64 parsing accepts.
fn looks_numeric(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        && s.chars().any(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn infers_scalar_types() {
        let flags = parse_flag_assigns(&strs(&[
            "x=2",
            "lr=0.1",
            "name=abc",
            "on=true",
            "eps=1e-5",
            "opt=None",
            "q='2'",
            "model.layers=3",
            "empty=",
            "n=nan",
        ]))
        .expect("parse");
        assert_eq!(flags["x"], json!(2));
        assert_eq!(flags["lr"], json!(0.1));
        assert_eq!(flags["name"], json!("abc"));
        assert_eq!(flags["on"], json!(true));
        assert_eq!(flags["eps"], json!(1e-5));
        assert_eq!(flags["opt"], json!(null));
        assert_eq!(flags["q"], json!("2"));
        assert_eq!(flags["model.layers"], json!(3));
        assert_eq!(flags["empty"], json!(""));
        assert_eq!(flags["n"], json!("nan"));
    }

    #[test]
    fn malformed_assignments_are_rejected() {
        for bad in ["noequals", "=3", "a b=1"] {
            let err = parse_flag_assigns(&strs(&[bad])).expect_err(bad);
            assert_eq!(gage_core::error_kind(&err), Some("invalid-flag"));
        }
    }
}
