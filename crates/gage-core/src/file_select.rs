//! Composable include/exclude rules over a source tree.
//!
//! A [`FileSelect`] is an ordered list of [`SelectRule`]s. For files, every
//! non-dir rule is tested and the last one with a verdict decides; a file no
//! rule speaks for is not selected. Dir rules prune subdirectories from the
//! walk.
//!
//! Glob syntax: `*` and `?` never cross `/`, `**/` matches zero or more
//! directories, and `**` elsewhere matches anything. Patterns without `/`
//! match the entry's base name at any depth; patterns with `/` are anchored
//! at the walk root.

use anyhow::{Context, Result};
use regex::Regex;
use std::cell::Cell;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::GageError;
use crate::file_type::{classify, FileType};
use crate::util::{ensure_dir, slash_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Include,
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Text,
    Binary,
    Dir,
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Glob {
        source: String,
        regex: Regex,
        basename: bool,
    },
    Regex(Regex),
}

impl Pattern {
    pub fn glob(source: &str) -> Result<Self> {
        let trimmed = source.trim_end_matches('/');
        let anchored = trimmed.trim_start_matches('/');
        let basename = !trimmed.contains('/');
        let regex = Regex::new(&glob_to_regex(anchored))
            .map_err(|_| GageError::InvalidSelectRule(source.to_string()))?;
        Ok(Pattern::Glob {
            source: source.to_string(),
            regex,
            basename,
        })
    }

    pub fn regex(source: &str) -> Result<Self> {
        let regex =
            Regex::new(source).map_err(|_| GageError::InvalidSelectRule(source.to_string()))?;
        Ok(Pattern::Regex(regex))
    }

    pub fn matches(&self, relpath: &str) -> bool {
        match self {
            Pattern::Glob {
                regex, basename, ..
            } => {
                if *basename {
                    let name = relpath.rsplit('/').next().unwrap_or(relpath);
                    regex.is_match(name)
                } else {
                    regex.is_match(relpath)
                }
            }
            Pattern::Regex(regex) => regex.is_match(relpath),
        }
    }

    fn is_match_all(&self) -> bool {
        matches!(self, Pattern::Glob { source, .. } if source == "*" || source == "**")
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Glob { source, .. } => write!(f, "{}", source),
            Pattern::Regex(r) => write!(f, "{}", r.as_str()),
        }
    }
}

/// Anchored regex for a glob.
pub fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => match chars[i + 1..].iter().position(|c| *c == ']') {
                Some(end) if end > 0 => {
                    let class: String = chars[i + 1..i + 1 + end].iter().collect();
                    let class = match class.strip_prefix('!') {
                        Some(rest) => format!("^{}", rest),
                        None => class,
                    };
                    out.push('[');
                    out.push_str(&class.replace('\\', "\\\\"));
                    out.push(']');
                    i += end + 2;
                    continue;
                }
                _ => out.push_str("\\["),
            },
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}

/// One include or exclude rule. The match counter is interior-mutable, so a
/// rule is not `Sync` and must not be shared across concurrent selects.
#[derive(Debug, Clone)]
pub struct SelectRule {
    pub polarity: Polarity,
    pub patterns: Vec<Pattern>,
    pub rule_type: Option<RuleType>,
    pub sentinel: Option<String>,
    pub size_gt: Option<u64>,
    pub size_lt: Option<u64>,
    pub max_matches: Option<usize>,
    matches: Cell<usize>,
}

impl SelectRule {
    pub fn new(polarity: Polarity, patterns: Vec<Pattern>) -> Self {
        Self {
            polarity,
            patterns,
            rule_type: None,
            sentinel: None,
            size_gt: None,
            size_lt: None,
            max_matches: None,
            matches: Cell::new(0),
        }
    }

    pub fn include(globs: &[&str]) -> Result<Self> {
        Ok(Self::new(Polarity::Include, globs_to_patterns(globs)?))
    }

    pub fn exclude(globs: &[&str]) -> Result<Self> {
        Ok(Self::new(Polarity::Exclude, globs_to_patterns(globs)?))
    }

    pub fn with_type(mut self, rule_type: RuleType) -> Self {
        self.rule_type = Some(rule_type);
        self
    }

    pub fn with_sentinel(mut self, sentinel: &str) -> Self {
        self.sentinel = Some(sentinel.to_string());
        self
    }

    pub fn with_size_lt(mut self, n: u64) -> Self {
        self.size_lt = Some(n);
        self
    }

    pub fn with_size_gt(mut self, n: u64) -> Self {
        self.size_gt = Some(n);
        self
    }

    pub fn with_max_matches(mut self, n: usize) -> Self {
        self.max_matches = Some(n);
        self
    }

    pub fn matches(&self) -> usize {
        self.matches.get()
    }

    fn exhausted(&self) -> bool {
        self.max_matches.is_some_and(|max| self.matches.get() >= max)
    }

    fn record_match(&self) {
        self.matches.set(self.matches.get() + 1);
    }

    fn verdict(&self) -> bool {
        self.polarity == Polarity::Include
    }

    fn pattern_match(&self, relpath: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(relpath))
    }

    /// Verdict for a regular file, or `None` when the rule does not apply.
    pub fn test_file(&self, src_root: &Path, relpath: &str) -> Result<Option<bool>> {
        if self.rule_type == Some(RuleType::Dir) || self.exhausted() {
            return Ok(None);
        }
        if !self.pattern_match(relpath) {
            return Ok(None);
        }
        let path = src_root.join(relpath);
        if self.size_gt.is_some() || self.size_lt.is_some() {
            let size = fs::metadata(&path)
                .with_context(|| format!("reading {}", path.display()))?
                .len();
            if self.size_gt.is_some_and(|n| size <= n) || self.size_lt.is_some_and(|n| size >= n)
            {
                return Ok(None);
            }
        }
        let wanted = match self.rule_type {
            Some(RuleType::Text) => Some(FileType::Text),
            Some(RuleType::Binary) => Some(FileType::Binary),
            _ => None,
        };
        if let Some(wanted) = wanted {
            if classify(&path)? != wanted {
                return Ok(None);
            }
        }
        Ok(Some(self.verdict()))
    }

    /// Verdict for a directory; only dir rules apply.
    pub fn test_dir(&self, src_root: &Path, relpath: &str) -> Result<Option<bool>> {
        if self.rule_type != Some(RuleType::Dir) || !self.pattern_match(relpath) {
            return Ok(None);
        }
        if let Some(sentinel) = &self.sentinel {
            if !sentinel_exists(&src_root.join(relpath), sentinel)? {
                return Ok(None);
            }
        }
        Ok(Some(self.verdict()))
    }
}

impl fmt::Display for SelectRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.polarity == Polarity::Exclude {
            write!(f, "-")?;
        }
        let pats: Vec<String> = self.patterns.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", pats.join(","))?;
        match self.rule_type {
            Some(RuleType::Text) => write!(f, " text")?,
            Some(RuleType::Binary) => write!(f, " binary")?,
            Some(RuleType::Dir) => write!(f, " dir")?,
            None => {}
        }
        if let Some(n) = self.size_gt {
            write!(f, " size>{}", n)?;
        }
        if let Some(n) = self.size_lt {
            write!(f, " size<{}", n)?;
        }
        if let Some(s) = &self.sentinel {
            write!(f, " sentinel={}", s)?;
        }
        if let Some(n) = self.max_matches {
            write!(f, " max-matches={}", n)?;
        }
        Ok(())
    }
}

fn globs_to_patterns(globs: &[&str]) -> Result<Vec<Pattern>> {
    globs.iter().map(|g| Pattern::glob(g)).collect()
}

fn sentinel_exists(dir: &Path, sentinel: &str) -> Result<bool> {
    if !sentinel.contains(['*', '?', '[']) {
        return Ok(dir.join(sentinel).exists());
    }
    let pattern = Pattern::glob(&format!("/{}", sentinel.trim_start_matches('/')))?;
    let max_depth = if sentinel.contains("**") {
        usize::MAX
    } else {
        sentinel.split('/').count()
    };
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(max_depth) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        if pattern.matches(&slash_path(rel)) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Parses the textual rule form: an optional leading `-` (exclude; `\-`
/// escapes a literal dash), a glob, then predicate tokens `dir`, `text`,
/// `binary`, `size<N`, `size>N`, `sentinel=<glob>`, `max-matches=N`.
pub fn parse_rule(spec: &str) -> Result<SelectRule> {
    let invalid = || GageError::InvalidSelectRule(spec.to_string());
    let trimmed = spec.trim();
    let (polarity, body) = if let Some(rest) = trimmed.strip_prefix("\\-") {
        (Polarity::Include, format!("-{}", rest))
    } else if let Some(rest) = trimmed.strip_prefix('-') {
        (Polarity::Exclude, rest.trim_start().to_string())
    } else {
        (Polarity::Include, trimmed.to_string())
    };
    let mut tokens = body.split_whitespace();
    let pattern = tokens.next().ok_or_else(invalid)?;
    let mut rule = SelectRule::new(polarity, vec![Pattern::glob(pattern)?]);
    for token in tokens {
        if token == "dir" {
            rule.rule_type = Some(RuleType::Dir);
        } else if token == "text" {
            rule.rule_type = Some(RuleType::Text);
        } else if token == "binary" {
            rule.rule_type = Some(RuleType::Binary);
        } else if let Some(n) = token.strip_prefix("size<") {
            rule.size_lt = Some(n.parse().map_err(|_| invalid())?);
        } else if let Some(n) = token.strip_prefix("size>") {
            rule.size_gt = Some(n.parse().map_err(|_| invalid())?);
        } else if let Some(s) = token.strip_prefix("sentinel=") {
            rule.sentinel = Some(s.to_string());
        } else if let Some(n) = token.strip_prefix("max-matches=") {
            rule.max_matches = Some(n.parse().map_err(|_| invalid())?);
        } else {
            return Err(invalid().into());
        }
    }
    Ok(rule)
}

/// Outcome of testing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectResult {
    pub selected: bool,
    pub rule: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FileSelect {
    pub rules: Vec<SelectRule>,
}

impl FileSelect {
    pub fn new(rules: Vec<SelectRule>) -> Self {
        Self { rules }
    }

    pub fn parse(specs: &[String]) -> Result<Self> {
        let rules = specs.iter().map(|s| parse_rule(s)).collect::<Result<_>>()?;
        Ok(Self { rules })
    }

    /// True when the final rule is an untyped exclude of everything.
    pub fn disabled(&self) -> bool {
        self.rules.last().is_some_and(|r| {
            r.polarity == Polarity::Exclude
                && r.rule_type.is_none()
                && r.patterns.iter().any(Pattern::is_match_all)
        })
    }

    pub fn select_file(&self, src_root: &Path, relpath: &str) -> Result<SelectResult> {
        let mut decided: Option<(bool, usize)> = None;
        for (i, rule) in self.rules.iter().enumerate() {
            if let Some(verdict) = rule.test_file(src_root, relpath)? {
                decided = Some((verdict, i));
            }
        }
        Ok(match decided {
            Some((selected, i)) => {
                self.rules[i].record_match();
                SelectResult {
                    selected,
                    rule: Some(self.rules[i].to_string()),
                }
            }
            None => SelectResult {
                selected: false,
                rule: None,
            },
        })
    }

    /// Rule text of the last dir rule excluding `relpath`, if it is pruned.
    pub fn prune_dir(&self, src_root: &Path, relpath: &str) -> Result<Option<String>> {
        let mut decided: Option<(bool, usize)> = None;
        for (i, rule) in self.rules.iter().enumerate() {
            if let Some(verdict) = rule.test_dir(src_root, relpath)? {
                decided = Some((verdict, i));
            }
        }
        Ok(match decided {
            Some((false, i)) => Some(self.rules[i].to_string()),
            _ => None,
        })
    }
}

/// Callbacks for [`copy_tree`].
pub trait CopyHandler {
    fn copy(&mut self, src: &Path, dst: &Path, _result: &SelectResult) -> Result<()> {
        copy_file(src, dst)
    }

    fn ignore(&mut self, _src: &Path, _result: &SelectResult) {}

    fn ignore_dir(&mut self, _src: &Path, _rule: &str) {}

    /// Called when `copy` fails; returning `Ok` skips the file.
    fn copy_error(&mut self, err: anyhow::Error, _src: &Path, _dst: &Path) -> Result<()> {
        Err(err)
    }
}

/// Handler that copies and otherwise does nothing.
pub struct DefaultCopyHandler;

impl CopyHandler for DefaultCopyHandler {}

/// Copies a file, preserving its permission bits.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).with_context(|| format!("copying {}", src.display()))?;
    Ok(())
}

/// Walks `src_root` in name order and yields selected relative paths,
/// routing skipped entries to `on_skip`.
pub fn walk_selected(
    src_root: &Path,
    select: &FileSelect,
    mut on_skip: impl FnMut(&Path, Skip<'_>),
) -> Result<Vec<(PathBuf, SelectResult)>> {
    let mut selected = Vec::new();
    if select.disabled() {
        return Ok(selected);
    }
    let mut walker = walkdir::WalkDir::new(src_root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src_root).unwrap_or(entry.path());
        let rel_str = slash_path(rel);
        if entry.file_type().is_dir() {
            if let Some(rule) = select.prune_dir(src_root, &rel_str)? {
                on_skip(entry.path(), Skip::Dir(&rule));
                walker.skip_current_dir();
            }
            continue;
        }
        if !entry.path().is_file() {
            continue;
        }
        let result = select.select_file(src_root, &rel_str)?;
        if result.selected {
            selected.push((rel.to_path_buf(), result));
        } else {
            on_skip(entry.path(), Skip::File(&result));
        }
    }
    Ok(selected)
}

pub enum Skip<'a> {
    Dir(&'a str),
    File(&'a SelectResult),
}

/// Copies every selected file under `src_root` to the same relative path
/// under `dst_root`. Returns the copied relative paths.
pub fn copy_tree(
    src_root: &Path,
    dst_root: &Path,
    select: &FileSelect,
    handler: &mut dyn CopyHandler,
) -> Result<Vec<PathBuf>> {
    let selected = walk_selected(src_root, select, |path, skip| match skip {
        Skip::Dir(rule) => handler.ignore_dir(path, rule),
        Skip::File(result) => handler.ignore(path, result),
    })?;
    let mut copied = Vec::with_capacity(selected.len());
    for (rel, result) in selected {
        let src = src_root.join(&rel);
        let dst = dst_root.join(&rel);
        match handler.copy(&src, &dst, &result) {
            Ok(()) => copied.push(rel),
            Err(err) => handler.copy_error(err, &src, &dst)?,
        }
    }
    Ok(copied)
}
