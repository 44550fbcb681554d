//! In-place rewriting of assignment-style config files.
//!
//! A file is read as lines of `name = value` or `name: value`, with INI/TOML
//! style `[section]` headers prefixing the keys that follow. Each scalar
//! assignment is indexed by its dotted key and the byte span of its value, so
//! applying new values edits only those spans and leaves every other byte of
//! the file alone.

use anyhow::{Context, Result};
use gage_core::GageError;
use regex::Regex;
use serde_json::{Map, Value};
use similar::TextDiff;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Python,
    Plain,
}

impl Dialect {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("py") => Dialect::Python,
            _ => Dialect::Plain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Bare,
    Quoted(char),
    PyLiteral,
}

#[derive(Debug, Clone)]
struct Assign {
    key: String,
    value: Value,
    span: Range<usize>,
    style: Style,
}

/// Parsed config text plus the key to value-span index.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    text: String,
    dialect: Dialect,
    assigns: Vec<Assign>,
}

fn assign_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*(=|:)\s*").ok())
        .as_ref()
}

fn section_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\[\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\]\s*$").ok())
        .as_ref()
}

impl ConfigDoc {
    pub fn parse(text: &str, dialect: Dialect) -> Self {
        let mut assigns = Vec::new();
        let (Some(assign_re), Some(section_re)) = (assign_re(), section_re()) else {
            return Self {
                text: text.to_string(),
                dialect,
                assigns,
            };
        };
        let mut section: Option<String> = None;
        let mut offset = 0;
        for raw in text.split_inclusive('\n') {
            let line_start = offset;
            offset += raw.len();
            let line = raw.trim_end_matches(['\n', '\r']);
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with(['#', ';']) || trimmed.starts_with("//") {
                continue;
            }
            if let Some(caps) = section_re.captures(line) {
                section = Some(caps[1].to_string());
                continue;
            }
            let Some(caps) = assign_re.captures(line) else {
                continue;
            };
            let whole = caps.get(0).map(|m| m.end()).unwrap_or(0);
            if &caps[2] == "=" && line[whole..].starts_with('=') {
                continue;
            }
            let Some((rel, value, style)) = scan_value(&line[whole..]) else {
                continue;
            };
            let key = match &section {
                Some(s) => format!("{}.{}", s, &caps[1]),
                None => caps[1].to_string(),
            };
            let start = line_start + whole + rel.start;
            assigns.push(Assign {
                key,
                value,
                span: start..line_start + whole + rel.end,
                style,
            });
        }
        Self {
            text: text.to_string(),
            dialect,
            assigns,
        }
    }

    /// Flat mapping of the file; a repeated key keeps its last value.
    pub fn config(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for a in &self.assigns {
            map.insert(a.key.clone(), a.value.clone());
        }
        map
    }

    /// Rewrites the value spans of keys present in `values`. Keys the file
    /// does not define are ignored. Lists and maps cannot replace a scalar
    /// span and fail with `invalid-flag`.
    pub fn apply(&self, values: &Map<String, Value>) -> Result<String> {
        let mut out = String::with_capacity(self.text.len());
        let mut pos = 0;
        for a in &self.assigns {
            let Some(new) = values.get(&a.key) else {
                continue;
            };
            if *new == a.value {
                continue;
            }
            if new.is_array() || new.is_object() {
                return Err(GageError::InvalidFlag(format!("{}={}", a.key, new)).into());
            }
            out.push_str(&self.text[pos..a.span.start]);
            out.push_str(&encode_value(new, a.style, self.dialect));
            pos = a.span.end;
        }
        out.push_str(&self.text[pos..]);
        Ok(out)
    }
}

/// Locates and parses the value at the start of `rest`, returning its span
/// relative to `rest`. Only scalars are indexed.
fn scan_value(rest: &str) -> Option<(Range<usize>, Value, Style)> {
    let first = rest.chars().next()?;
    if first == '"' || first == '\'' {
        let mut escaped = false;
        let mut unescaped = String::new();
        for (i, c) in rest.char_indices().skip(1) {
            if escaped {
                unescaped.push(match c {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == first {
                return Some((0..i + 1, Value::String(unescaped), Style::Quoted(first)));
            } else {
                unescaped.push(c);
            }
        }
        return None;
    }
    if matches!(first, '[' | '{' | '(') {
        return None;
    }
    let mut end = rest.len();
    let bytes = rest.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            end = i;
            break;
        }
    }
    let token = rest[..end].trim_end();
    if token.is_empty() {
        return None;
    }
    let (value, style) = parse_bare(token)?;
    Some((0..token.len(), value, style))
}

fn parse_bare(token: &str) -> Option<(Value, Style)> {
    Some(match token {
        "True" => (Value::Bool(true), Style::PyLiteral),
        "False" => (Value::Bool(false), Style::PyLiteral),
        "None" => (Value::Null, Style::PyLiteral),
        "true" => (Value::Bool(true), Style::Bare),
        "false" => (Value::Bool(false), Style::Bare),
        "null" | "~" => (Value::Null, Style::Bare),
        _ => {
            if let Ok(i) = token.parse::<i64>() {
                (Value::from(i), Style::Bare)
            } else if let Some(n) = parse_float(token) {
                (Value::Number(n), Style::Bare)
            } else if token.contains(char::is_whitespace) || token.contains(['(', ')', ',']) {
                // Expressions such as calls or tuples are not config values.
                return None;
            } else {
                (Value::String(token.to_string()), Style::Bare)
            }
        }
    })
}

fn parse_float(token: &str) -> Option<serde_json::Number> {
    let numeric = token
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E' | '_'));
    if !numeric || !token.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    token
        .replace('_', "")
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        f.to_string()
    }
}

fn encode_value(value: &Value, style: Style, dialect: Dialect) -> String {
    let python = dialect == Dialect::Python || style == Style::PyLiteral;
    match value {
        Value::Null if python => "None".to_string(),
        Value::Null => "null".to_string(),
        Value::Bool(b) if python => if *b { "True" } else { "False" }.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) => format_float(f),
            _ => n.to_string(),
        },
        Value::String(s) => match style {
            Style::Quoted(q) => quote(s, q),
            _ if python => quote(s, '"'),
            _ if reads_back_as(s) => s.clone(),
            _ => quote(s, '"'),
        },
        // Rejected by `apply`.
        other => other.to_string(),
    }
}

fn reads_back_as(s: &str) -> bool {
    !s.is_empty()
        && !s.contains('#')
        && !s.starts_with(['"', '\''])
        && matches!(parse_bare(s), Some((Value::String(ref v), _)) if v == s)
}

fn quote(s: &str, q: char) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push(q);
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == q || c == '\\' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(q);
    out
}

/// Unified diff between two texts, labelled with `name`.
pub fn unified_diff(old: &str, new: &str, name: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", name), &format!("b/{}", name))
        .to_string()
}

/// Reads a config file's mapping.
pub fn read_config_file(path: &Path) -> Result<Map<String, Value>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(ConfigDoc::parse(&text, Dialect::for_path(path)).config())
}

/// Applies `values` to the file at `path` in place. Returns the unified diff
/// when the file changed.
pub fn apply_config_file(path: &Path, name: &str, values: &Map<String, Value>) -> Result<Option<String>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let doc = ConfigDoc::parse(&text, Dialect::for_path(path));
    let updated = doc.apply(values)?;
    if updated == text {
        return Ok(None);
    }
    gage_core::atomic_write_bytes(path, updated.as_bytes())?;
    tracing::debug!(file = name, "applied config");
    Ok(Some(unified_diff(&text, &updated, name)))
}
