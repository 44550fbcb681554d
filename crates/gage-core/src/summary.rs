use anyhow::{Context, Result};
use serde_json::{Map, Value};

/// Run summary document: optional `attributes`, `metrics` and `run`
/// sections. Each entry is a scalar or an object carrying `value` plus
/// metadata such as `label` or `links`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub attributes: Map<String, Value>,
    pub metrics: Map<String, Value>,
    pub run: Map<String, Value>,
}

impl RunSummary {
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            anyhow::bail!("summary must be a JSON object");
        };
        let mut section = |name: &str| -> Result<Map<String, Value>> {
            match obj.remove(name) {
                None | Some(Value::Null) => Ok(Map::new()),
                Some(Value::Object(m)) => Ok(m),
                Some(other) => anyhow::bail!("summary '{}' must be an object, got {}", name, other),
            }
        };
        Ok(Self {
            attributes: section("attributes")?,
            metrics: section("metrics")?,
            run: section("run")?,
        })
    }

    /// Parses summary text, tolerating bare `NaN`/`Infinity` tokens by
    /// reading them as null.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(&null_non_finite(text)).context("parsing summary")?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        for (name, section) in [
            ("attributes", &self.attributes),
            ("metrics", &self.metrics),
            ("run", &self.run),
        ] {
            if !section.is_empty() {
                obj.insert(name.to_string(), Value::Object(section.clone()));
            }
        }
        Value::Object(obj)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_value())?)
    }

    pub fn run_label(&self) -> Option<String> {
        self.run
            .get("label")
            .and_then(scalar_value)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(scalar_value).and_then(|v| v.as_f64())
    }

    pub fn set_metric(&mut self, name: &str, value: f64) {
        self.metrics.insert(name.to_string(), float_value(value));
    }
}

/// The scalar behind a summary entry: the entry itself, or its `value` key.
pub fn scalar_value(entry: &Value) -> Option<&Value> {
    match entry {
        Value::Object(m) => m.get("value"),
        other => Some(other),
    }
}

/// Non-finite floats become null.
pub fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Replaces `NaN`, `Infinity` and `-Infinity` tokens outside string literals
/// with `null`.
fn null_non_finite(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            rest = &rest[c.len_utf8()..];
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            rest = &rest[1..];
            continue;
        }
        let token = ["-Infinity", "Infinity", "NaN"]
            .into_iter()
            .find(|t| rest.starts_with(t));
        if let Some(t) = token {
            out.push_str("null");
            rest = &rest[t.len()..];
        } else {
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nan_is_written_as_null() {
        let mut s = RunSummary::default();
        s.set_metric("loss", f64::NAN);
        s.set_metric("acc", 0.5);
        let v = s.to_value();
        assert_eq!(v["metrics"]["loss"], Value::Null);
        assert_eq!(v["metrics"]["acc"], json!(0.5));
        assert!(!s.to_json_pretty().expect("json").contains("NaN"));
    }

    #[test]
    fn parse_tolerates_non_finite_tokens() {
        let s = RunSummary::parse(
            r#"{"metrics": {"loss": NaN, "x": {"value": -Infinity}, "note": {"value": 1, "label": "NaN"}}}"#,
        )
        .expect("parse");
        assert_eq!(s.metrics["loss"], Value::Null);
        assert_eq!(s.metric("note"), Some(1.0));
        assert_eq!(s.metrics["note"]["label"], json!("NaN"));
    }

    #[test]
    fn run_label_reads_scalar_or_value_dict() {
        let s = RunSummary::from_value(json!({"run": {"label": "fast"}})).expect("summary");
        assert_eq!(s.run_label().as_deref(), Some("fast"));
        let s = RunSummary::from_value(json!({"run": {"label": {"value": "slow"}}}))
            .expect("summary");
        assert_eq!(s.run_label().as_deref(), Some("slow"));
        assert!(RunSummary::from_value(json!({"run": 3})).is_err());
    }
}
