//! Append-only attribute log.
//!
//! Each append is one read-only JSON file named by a time-ordered id, so the
//! sorted file names give the append order and folding them in that order
//! yields the current attributes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::ids::timestamp_uuid;
use crate::util::{ensure_dir, make_readonly, safe_list_dir};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrLogEntry {
    pub author: String,
    #[serde(default)]
    pub set: Map<String, Value>,
    #[serde(default)]
    pub delete: Vec<String>,
}

impl AttrLogEntry {
    pub fn set(author: &str, key: &str, value: Value) -> Self {
        let mut set = Map::new();
        set.insert(key.to_string(), value);
        Self {
            author: author.to_string(),
            set,
            delete: Vec::new(),
        }
    }

    pub fn delete(author: &str, key: &str) -> Self {
        Self {
            author: author.to_string(),
            set: Map::new(),
            delete: vec![key.to_string()],
        }
    }

    fn apply(&self, attrs: &mut Map<String, Value>) {
        for (k, v) in &self.set {
            attrs.insert(k.clone(), v.clone());
        }
        for k in &self.delete {
            attrs.remove(k);
        }
    }
}

/// Appends `entry` to the log in `dir` and returns the new file's path.
pub fn append(dir: &Path, entry: &AttrLogEntry) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let bytes = serde_json::to_vec(entry)?;
    let path = dir.join(format!("{}.json", timestamp_uuid().hyphenated()));
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|s| s.to_str()).unwrap_or("entry")
    ));
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .with_context(|| format!("writing {}", tmp.display()))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    make_readonly(&path)?;
    Ok(path)
}

/// Entries in name order. Non-`.json` names are ignored; unreadable or
/// malformed entries are skipped with a warning.
pub fn entries(dir: &Path) -> Result<Vec<(String, AttrLogEntry)>> {
    let mut out = Vec::new();
    for name in safe_list_dir(dir)? {
        if !name.ends_with(".json") || name.starts_with('.') {
            continue;
        }
        let path = dir.join(&name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        match serde_json::from_slice::<AttrLogEntry>(&bytes) {
            Ok(entry) => out.push((name, entry)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping malformed attribute log entry");
            }
        }
    }
    Ok(out)
}

/// Current attributes: every entry's `set` then `delete`, in name order.
pub fn fold(dir: &Path) -> Result<Map<String, Value>> {
    let mut attrs = Map::new();
    for (_, entry) in entries(dir)? {
        entry.apply(&mut attrs);
    }
    Ok(attrs)
}

pub fn fold_by_author(dir: &Path) -> Result<BTreeMap<String, Map<String, Value>>> {
    let mut by_author: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    for (_, entry) in entries(dir)? {
        entry.apply(by_author.entry(entry.author.clone()).or_default());
    }
    Ok(by_author)
}

/// Copies entries from `src` into `dst` without replacing any existing
/// destination file. Returns the number of entries copied.
pub fn merge(src: &Path, dst: &Path) -> Result<usize> {
    let names = safe_list_dir(src)?;
    if names.is_empty() {
        return Ok(0);
    }
    ensure_dir(dst)?;
    let mut copied = 0;
    for name in names {
        let from = src.join(&name);
        if !from.is_file() {
            continue;
        }
        let to = dst.join(&name);
        if to.exists() {
            continue;
        }
        fs::copy(&from, &to).with_context(|| format!("copying {}", from.display()))?;
        make_readonly(&to)?;
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::make_writable;
    use chrono::Utc;
    use serde_json::json;
    use std::thread;

    fn scratch(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gage_attrlog_{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    fn cleanup(dir: &Path) {
        for entry in walkdir::WalkDir::new(dir).into_iter().flatten() {
            if entry.file_type().is_file() {
                let _ = make_writable(entry.path());
            }
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_dir_folds_to_empty_map() {
        let dir = scratch("empty");
        assert!(fold(&dir).expect("fold").is_empty());
        assert!(fold(&dir.join("missing")).expect("fold").is_empty());
        cleanup(&dir);
    }

    #[test]
    fn fold_applies_set_then_delete_in_order() {
        let dir = scratch("fold");
        append(&dir, &AttrLogEntry::set("a", "label", json!("first"))).expect("append");
        append(&dir, &AttrLogEntry::set("b", "label", json!("second"))).expect("append");
        let path = append(&dir, &AttrLogEntry::set("a", "tag", json!(1))).expect("append");
        assert!(path.metadata().expect("meta").permissions().readonly());
        fs::write(dir.join("notes.txt"), "ignored").expect("write");

        let attrs = fold(&dir).expect("fold");
        assert_eq!(attrs.get("label"), Some(&json!("second")));
        assert_eq!(attrs.get("tag"), Some(&json!(1)));

        append(&dir, &AttrLogEntry::delete("a", "label")).expect("append");
        let attrs = fold(&dir).expect("fold");
        assert!(!attrs.contains_key("label"));

        let by_author = fold_by_author(&dir).expect("fold");
        assert_eq!(by_author["a"].get("tag"), Some(&json!(1)));
        assert!(!by_author["a"].contains_key("label"));
        assert_eq!(by_author["b"].get("label"), Some(&json!("second")));
        cleanup(&dir);
    }

    #[test]
    fn merge_is_idempotent_and_never_replaces() {
        let a = scratch("merge_a");
        let b = scratch("merge_b");
        append(&a, &AttrLogEntry::set("x", "k", json!(1))).expect("append");
        append(&b, &AttrLogEntry::set("y", "k", json!(2))).expect("append");
        let shared = append(&a, &AttrLogEntry::set("x", "j", json!(3))).expect("append");
        let name = shared.file_name().expect("name");
        fs::copy(&shared, b.join(name)).expect("share");

        let before = fold(&a).expect("fold");
        assert_eq!(merge(&b, &a).expect("merge"), 1);
        let merged = fold(&a).expect("fold");
        assert_eq!(merge(&b, &a).expect("merge again"), 0);
        assert_eq!(fold(&a).expect("fold"), merged);
        assert_eq!(merged.get("j"), before.get("j"));
        assert_eq!(merged.len(), 2);
        cleanup(&a);
        cleanup(&b);
    }

    #[test]
    fn concurrent_appends_keep_order_and_counts() {
        let dir = scratch("concurrent");
        let handles: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|author| {
                let dir = dir.clone();
                thread::spawn(move || {
                    let mut names = Vec::new();
                    for i in 0..1000 {
                        let key = format!("{}-{}", author, i);
                        let path = append(&dir, &AttrLogEntry::set(author, &key, json!(i)))
                            .expect("append");
                        names.push(path.file_name().unwrap().to_string_lossy().to_string());
                    }
                    names
                })
            })
            .collect();
        let per_thread: Vec<Vec<String>> =
            handles.into_iter().map(|h| h.join().expect("join")).collect();
        for names in &per_thread {
            let mut sorted = names.clone();
            sorted.sort();
            assert_eq!(names, &sorted);
        }
        let listed = entries(&dir).expect("entries");
        assert_eq!(listed.len(), 2000);
        assert_eq!(fold(&dir).expect("fold").len(), 2000);
        let by_author = fold_by_author(&dir).expect("fold");
        assert_eq!(by_author["alice"].len(), 1000);
        assert_eq!(by_author["bob"].len(), 1000);
        cleanup(&dir);
    }
}
