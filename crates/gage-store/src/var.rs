use anyhow::{anyhow, Context, Result};
use gage_core::ids::{is_run_id, timestamp_uuid};
use gage_core::util::{ensure_dir, safe_list_dir, safe_rmtree};
use gage_core::{GageError, Settings};
use serde_json::Value;
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::Archive;
use crate::run::{Run, RunAttr, RunView, DELETED_SUFFIX};

pub const DEFAULT_SORT: &str = "-timestamp";
pub const ACTIVE_CONTAINER: &str = "active";
pub const DELETED_CONTAINER: &str = "deleted";
const META_SUFFIX: &str = ".meta";
const MOVE_SUFFIX: &str = ".move";

/// Which container of runs to enumerate.
#[derive(Debug, Clone)]
pub enum View {
    Active,
    Deleted,
    Archive(Archive),
}

/// One `<ts-uuid>-<container>` marker from a run's move log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveMarker {
    pub stamp: String,
    pub container: String,
}

/// Filesystem run store rooted at the runs home.
#[derive(Debug, Clone)]
pub struct VarStore {
    root: PathBuf,
}

impl VarStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.runs_home.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.root.join(".archives")
    }

    fn view_root(&self, view: &View) -> PathBuf {
        match view {
            View::Active | View::Deleted => self.root.clone(),
            View::Archive(a) => a.runs_dir(),
        }
    }

    /// Runs in `view`, in directory order.
    pub fn enumerate(&self, view: &View) -> Result<Vec<Run>> {
        let root = self.view_root(view);
        let suffix = match view {
            View::Deleted => format!("{}{}", META_SUFFIX, DELETED_SUFFIX),
            _ => META_SUFFIX.to_string(),
        };
        let mut runs = Vec::new();
        for name in safe_list_dir(&root)? {
            let Some(id) = name.strip_suffix(&suffix) else {
                continue;
            };
            if !is_run_id(id) {
                continue;
            }
            runs.push(match view {
                View::Deleted => Run::deleted(&root, id),
                _ => Run::new(&root, id),
            });
        }
        Ok(runs)
    }

    /// Runs in `view` ordered by `sort` keys (see [`sort_runs`]).
    pub fn list(&self, view: &View, sort: &[String]) -> Result<Vec<Run>> {
        let runs = self.enumerate(view)?;
        sort_runs(runs, sort)
    }

    /// Active run with exactly this id.
    pub fn get(&self, id: &str) -> Result<Run> {
        let run = Run::new(&self.root, id);
        if run.meta_dir().exists() {
            Ok(run)
        } else {
            Err(GageError::RunNotFound(id.to_string()).into())
        }
    }

    /// Moves runs to the deleted overlay, or removes them when `permanent`.
    /// Runs that are already gone or already deleted are skipped.
    pub fn delete(&self, runs: &[Run], permanent: bool) -> Result<Vec<Run>> {
        let mut deleted = Vec::new();
        for run in runs {
            if permanent {
                self.remove_run(run)?;
                deleted.push(run.clone());
                continue;
            }
            if run.is_deleted() || !run.meta_dir().exists() {
                tracing::debug!(run = %run.id, "nothing to delete");
                continue;
            }
            let target = Run::deleted(run.root(), &run.id);
            move_run_paths(run, &target)?;
            self.append_move_marker(run, DELETED_CONTAINER)?;
            tracing::info!(run = %run.id, "deleted run");
            deleted.push(target);
        }
        Ok(deleted)
    }

    /// Moves deleted runs back into their container.
    pub fn restore(&self, runs: &[Run]) -> Result<Vec<Run>> {
        let mut restored = Vec::new();
        for run in runs {
            let source = Run::deleted(run.root(), &run.id);
            if !source.meta_dir().exists() {
                return Err(GageError::RunNotFound(run.id.clone()).into());
            }
            let target = Run::new(run.root(), &run.id);
            move_run_paths(&source, &target)?;
            let container = if run.root() == self.root {
                ACTIVE_CONTAINER.to_string()
            } else {
                self.container_for_root(run.root())
            };
            self.append_move_marker(&target, &container)?;
            tracing::info!(run = %run.id, "restored run");
            restored.push(target);
        }
        Ok(restored)
    }

    /// Permanently removes runs from the deleted overlay.
    pub fn purge(&self, runs: &[Run]) -> Result<Vec<Run>> {
        let mut purged = Vec::new();
        for run in runs {
            let deleted = Run::deleted(run.root(), &run.id);
            if !deleted.meta_dir().exists() {
                return Err(GageError::RunNotFound(run.id.clone()).into());
            }
            for path in deleted.all_paths() {
                remove_path(&path)?;
            }
            remove_path(&self.move_dir(&run.id))?;
            tracing::info!(run = %run.id, "purged run");
            purged.push(deleted);
        }
        Ok(purged)
    }

    fn remove_run(&self, run: &Run) -> Result<()> {
        let active = Run::new(run.root(), &run.id);
        let deleted = Run::deleted(run.root(), &run.id);
        for path in active.all_paths().into_iter().chain(deleted.all_paths()) {
            remove_path(&path)?;
        }
        remove_path(&self.move_dir(&run.id))?;
        tracing::info!(run = %run.id, "permanently deleted run");
        Ok(())
    }

    // -- move log ------------------------------------------------------------

    pub fn move_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("{}{}", run_id, MOVE_SUFFIX))
    }

    pub fn append_move_marker(&self, run: &Run, container: &str) -> Result<PathBuf> {
        let dir = self.move_dir(&run.id);
        ensure_dir(&dir)?;
        let path = dir.join(format!("{}-{}", timestamp_uuid().hyphenated(), container));
        fs::File::create(&path).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub fn move_log(&self, run_id: &str) -> Result<Vec<MoveMarker>> {
        Ok(safe_list_dir(&self.move_dir(run_id))?
            .into_iter()
            .filter_map(|name| parse_move_marker(&name))
            .collect())
    }

    /// Container named by the latest move marker, if any.
    pub fn container_of(&self, run_id: &str) -> Result<Option<String>> {
        Ok(self.move_log(run_id)?.pop().map(|m| m.container))
    }

    fn container_for_root(&self, root: &Path) -> String {
        root.parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| ACTIVE_CONTAINER.to_string())
    }
}

fn parse_move_marker(name: &str) -> Option<MoveMarker> {
    // A hyphenated uuid is 36 characters.
    if name.len() < 38 || name.as_bytes()[36] != b'-' {
        return None;
    }
    let (stamp, rest) = name.split_at(36);
    Some(MoveMarker {
        stamp: stamp.to_string(),
        container: rest[1..].to_string(),
    })
}

/// Renames every existing path of `from` onto the matching path of `to`.
/// A stale target is removed first.
pub(crate) fn move_run_paths(from: &Run, to: &Run) -> Result<()> {
    if let Some(parent) = to.meta_dir().parent() {
        ensure_dir(parent)?;
    }
    for (src, dst) in from.all_paths().into_iter().zip(to.all_paths()) {
        if fs::symlink_metadata(&src).is_err() {
            continue;
        }
        remove_path(&dst)?;
        fs::rename(&src, &dst)
            .with_context(|| format!("moving {} to {}", src.display(), dst.display()))?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(());
    }
    safe_rmtree(path)
}

// -- sorting -----------------------------------------------------------------

/// Orders runs by attribute keys. Each key may be prefixed with `-` for
/// descending order; `timestamp` is the most advanced lifecycle marker.
/// Ties fall back to the run id in the direction of the first key.
pub fn sort_runs(runs: Vec<Run>, keys: &[String]) -> Result<Vec<Run>> {
    let default = [DEFAULT_SORT.to_string()];
    let keys = if keys.is_empty() { &default[..] } else { keys };
    let mut parsed = Vec::with_capacity(keys.len());
    for key in keys {
        let (desc, name) = match key.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, key.as_str()),
        };
        let attr = RunAttr::from_name(name)
            .ok_or_else(|| anyhow!("unknown sort attribute '{}'", name))?;
        parsed.push((attr, desc));
    }
    let mut rows = Vec::with_capacity(runs.len());
    for run in runs {
        let view = RunView::new(run);
        let mut values = Vec::with_capacity(parsed.len());
        for (attr, _) in &parsed {
            values.push(view.attr(*attr)?);
        }
        rows.push((values, view.into_run()));
    }
    let id_desc = parsed.first().map(|(_, d)| *d).unwrap_or(true);
    rows.sort_by(|(va, ra), (vb, rb)| {
        for (i, (_, desc)) in parsed.iter().enumerate() {
            let ord = cmp_values(&va[i], &vb[i]);
            let ord = if *desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        let ord = ra.id.cmp(&rb.id);
        if id_desc {
            ord.reverse()
        } else {
            ord
        }
    });
    Ok(rows.into_iter().map(|(_, r)| r).collect())
}

/// Total order over attribute values: null < bool < number < string < other.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ if rank(a) != rank(b) => rank(a).cmp(&rank(b)),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{init_meta_dir, write_marker, Marker};
    use gage_core::ids::make_run_id;
    use serde_json::json;

    fn scratch(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gage_var_{}_{}_{}",
            prefix,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    fn make_run(root: &Path) -> Run {
        let run = Run::new(root, &make_run_id());
        init_meta_dir(&run.meta_dir()).expect("init");
        write_marker(&run.meta_dir(), Marker::Initialized).expect("marker");
        ensure_dir(&run.run_dir()).expect("run dir");
        run
    }

    fn ids(runs: &[Run]) -> Vec<String> {
        runs.iter().map(|r| r.id.clone()).collect()
    }

    #[test]
    fn enumerate_ignores_non_run_siblings() {
        let root = scratch("enum");
        let run = make_run(&root);
        ensure_dir(&root.join("not-a-run.meta")).expect("dir");
        fs::write(root.join("README"), "x").expect("file");
        let store = VarStore::new(&root);
        assert_eq!(ids(&store.enumerate(&View::Active).expect("enum")), vec![run.id]);
        assert!(store.enumerate(&View::Deleted).expect("enum").is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn delete_restore_purge_cycle() {
        let root = scratch("cycle");
        let store = VarStore::new(&root);
        let a = make_run(&root);
        let b = make_run(&root);
        let c = make_run(&root);

        store.delete(std::slice::from_ref(&b), false).expect("delete");
        assert_eq!(
            ids(&store.list(&View::Active, &[]).expect("list")),
            vec![c.id.clone(), a.id.clone()]
        );
        let deleted = store.list(&View::Deleted, &[]).expect("list");
        assert_eq!(ids(&deleted), vec![b.id.clone()]);
        assert!(root.join(format!("{}.deleted", b.id)).is_dir());
        assert_eq!(store.container_of(&b.id).expect("log").as_deref(), Some("deleted"));

        // Deleting again is a no-op.
        assert!(store.delete(&deleted, false).expect("delete").is_empty());
        assert!(store.delete(std::slice::from_ref(&b), false).expect("delete").is_empty());

        store.restore(&deleted).expect("restore");
        assert_eq!(
            ids(&store.list(&View::Active, &[]).expect("list")),
            vec![c.id.clone(), b.id.clone(), a.id.clone()]
        );
        assert_eq!(store.container_of(&b.id).expect("log").as_deref(), Some("active"));
        let err = store.restore(std::slice::from_ref(&a)).expect_err("not deleted");
        assert_eq!(gage_core::error_kind(&err), Some("run-not-found"));

        store.delete(std::slice::from_ref(&b), true).expect("permanent");
        assert_eq!(
            ids(&store.list(&View::Active, &[]).expect("list")),
            vec![c.id.clone(), a.id.clone()]
        );
        assert!(!b.meta_dir().exists());
        assert!(!store.move_dir(&b.id).exists());

        store.delete(std::slice::from_ref(&a), false).expect("delete");
        store.purge(std::slice::from_ref(&a)).expect("purge");
        assert!(store.list(&View::Deleted, &[]).expect("list").is_empty());
        assert!(!root.join(format!("{}.meta.deleted", a.id)).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn sort_supports_ascending_and_attributes() {
        let root = scratch("sort");
        let store = VarStore::new(&root);
        let a = make_run(&root);
        let b = make_run(&root);
        let asc = store
            .list(&View::Active, &["timestamp".to_string()])
            .expect("list");
        assert_eq!(ids(&asc), vec![a.id.clone(), b.id.clone()]);
        b.set_label("me", Some("aaa")).expect("label");
        a.set_label("me", Some("zzz")).expect("label");
        let by_label = store.list(&View::Active, &["label".to_string()]).expect("list");
        assert_eq!(ids(&by_label), vec![b.id.clone(), a.id.clone()]);
        assert!(store.list(&View::Active, &["bogus".to_string()]).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn values_order_by_type_then_content() {
        assert_eq!(cmp_values(&json!(null), &json!(1)), Ordering::Less);
        assert_eq!(cmp_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(cmp_values(&json!(1.5), &json!(1)), Ordering::Greater);
        assert_eq!(cmp_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(cmp_values(&json!("a"), &json!([1])), Ordering::Less);
    }

    #[test]
    fn move_markers_parse() {
        let name = format!("{}-archive-x", timestamp_uuid().hyphenated());
        let marker = parse_move_marker(&name).expect("marker");
        assert_eq!(marker.container, "archive-x");
        assert!(parse_move_marker("short-name").is_none());
    }
}
