use anyhow::Result;
use gage_core::GageError;

use crate::run::{Run, RunAttr, RunView};

/// How a run specifier resolves against a sorted run list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Specifier {
    /// 1-based position.
    Index(usize),
    /// `A:B` with 1-based start; negatives count from the end.
    Slice(Option<i64>, Option<i64>),
    /// Id or name prefix.
    Prefix(String),
}

impl Specifier {
    pub fn parse(spec: &str) -> Self {
        let s = spec.trim();
        if let Ok(n) = s.parse::<usize>() {
            return Specifier::Index(n);
        }
        let inner = s
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .unwrap_or(s);
        if let Some((a, b)) = inner.split_once(':') {
            if let (Some(a), Some(b)) = (parse_bound(a), parse_bound(b)) {
                return Specifier::Slice(a, b);
            }
        }
        Specifier::Prefix(s.to_string())
    }

    /// Matches in list order. Out-of-range indexes fall back to prefix
    /// matching so numeric-looking id prefixes still resolve.
    pub fn resolve<'a>(&self, runs: &'a [Run]) -> Vec<&'a Run> {
        match self {
            Specifier::Index(n) if (1..=runs.len()).contains(n) => vec![&runs[n - 1]],
            Specifier::Index(n) => prefix_matches(runs, &n.to_string()),
            Specifier::Slice(a, b) => {
                let len = runs.len() as i64;
                let start = match a {
                    None => 0,
                    Some(a) if *a > 0 => clamp_index(a - 1, len),
                    Some(a) => clamp_index(*a, len),
                };
                let end = b.map(|b| clamp_index(b, len)).unwrap_or(len);
                if start >= end {
                    return Vec::new();
                }
                runs[start as usize..end as usize].iter().collect()
            }
            Specifier::Prefix(p) => prefix_matches(runs, p),
        }
    }
}

fn parse_bound(s: &str) -> Option<Option<i64>> {
    let s = s.trim();
    if s.is_empty() {
        return Some(None);
    }
    s.parse::<i64>().ok().map(Some)
}

fn clamp_index(i: i64, len: i64) -> i64 {
    if i < 0 {
        (i + len).max(0)
    } else {
        i.min(len)
    }
}

fn prefix_matches<'a>(runs: &'a [Run], prefix: &str) -> Vec<&'a Run> {
    if prefix.is_empty() {
        return Vec::new();
    }
    runs.iter()
        .filter(|r| r.id.starts_with(prefix) || r.name.starts_with(prefix))
        .collect()
}

/// Union of all specifier matches, keeping list order. No specifiers selects
/// every run. A specifier that matches nothing is an error.
pub fn select_runs(runs: &[Run], specs: &[String]) -> Result<Vec<Run>> {
    if specs.is_empty() {
        return Ok(runs.to_vec());
    }
    let mut picked = vec![false; runs.len()];
    for spec in specs {
        let matches = Specifier::parse(spec).resolve(runs);
        if matches.is_empty() {
            return Err(GageError::RunNotFound(spec.clone()).into());
        }
        for m in matches {
            if let Some(i) = runs.iter().position(|r| std::ptr::eq(r, m)) {
                picked[i] = true;
            }
        }
    }
    Ok(runs
        .iter()
        .zip(picked)
        .filter_map(|(r, p)| p.then(|| r.clone()))
        .collect())
}

/// Exactly one run for `spec`.
pub fn select_one(runs: &[Run], spec: &str) -> Result<Run> {
    let matches = Specifier::parse(spec).resolve(runs);
    match matches.as_slice() {
        [] => Err(GageError::RunNotFound(spec.to_string()).into()),
        [one] => Ok((*one).clone()),
        many => Err(GageError::AmbiguousSpec {
            spec: spec.to_string(),
            count: many.len(),
        }
        .into()),
    }
}

/// Compiled string-match filter: op name, status, label, or summary label.
#[derive(Debug, Clone)]
pub struct RunFilter {
    needle: String,
}

impl RunFilter {
    pub fn compile(s: &str) -> Result<Self> {
        let needle = s.trim();
        if needle.is_empty() {
            return Err(GageError::EmptyFilter.into());
        }
        Ok(Self {
            needle: needle.to_string(),
        })
    }

    pub fn matches(&self, view: &RunView) -> Result<bool> {
        let contains = |v: serde_json::Value| {
            v.as_str().map(|s| s.contains(&self.needle)).unwrap_or(false)
        };
        if contains(view.attr(RunAttr::OpName)?) {
            return Ok(true);
        }
        if view.attr(RunAttr::Status)?.as_str() == Some(self.needle.as_str()) {
            return Ok(true);
        }
        if contains(view.attr(RunAttr::Label)?) {
            return Ok(true);
        }
        let summary_label = view
            .attr(RunAttr::Summary)?
            .pointer("/run/label")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Ok(contains(summary_label))
    }
}

/// Runs matching every filter.
pub fn filter_runs(runs: Vec<Run>, filters: &[RunFilter]) -> Result<Vec<Run>> {
    if filters.is_empty() {
        return Ok(runs);
    }
    let mut kept = Vec::new();
    for run in runs {
        let view = RunView::new(run);
        let mut keep = true;
        for f in filters {
            if !f.matches(&view)? {
                keep = false;
                break;
            }
        }
        if keep {
            kept.push(view.into_run());
        }
    }
    Ok(kept)
}
