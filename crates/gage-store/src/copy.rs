use anyhow::{Context, Result};
use gage_core::attr_log;
use gage_core::util::ensure_dir;
use gage_core::GageError;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::run::Run;

const TAIL_LINES: usize = 5;

/// Copies runs into the runs directory `dest_root`.
///
/// An existing destination meta dir is left untouched; run dir files that
/// already exist are kept; user dirs are merged without replacing entries.
/// Failures are reported as a copy error carrying the tail of the cause.
pub fn copy_runs(runs: &[Run], dest_root: &Path) -> Result<Vec<Run>> {
    let mut copied = Vec::new();
    for run in runs {
        let target = Run::new(dest_root, &run.id);
        copy_run(run, &target).map_err(|e| {
            anyhow::Error::new(GageError::Copy {
                tail: error_tail(&e),
            })
        })?;
        tracing::info!(run = %run.id, dest = %dest_root.display(), "copied run");
        copied.push(target);
    }
    Ok(copied)
}

fn copy_run(src: &Run, dst: &Run) -> Result<()> {
    if !src.meta_dir().exists() {
        return Err(GageError::RunNotFound(src.id.clone()).into());
    }
    ensure_dir(dst.root())?;
    if dst.meta_dir().exists() {
        tracing::debug!(run = %src.id, "destination meta exists, leaving it");
    } else {
        copy_path(&src.meta_dir(), &dst.meta_dir(), true)?;
    }
    if src.run_dir().exists() {
        copy_path(&src.run_dir(), &dst.run_dir(), false)?;
    }
    if src.user_dir().exists() {
        attr_log::merge(&src.user_dir(), &dst.user_dir())?;
    }
    if !dst.project_ref_path().exists() {
        if let Some(project) = src.project_dir()? {
            dst.repoint_project(&project)?;
        }
    }
    Ok(())
}

/// Copies a file or directory tree. Existing files are replaced only when
/// `replace` is set.
fn copy_path(src: &Path, dst: &Path, replace: bool) -> Result<()> {
    if src.is_file() {
        if replace || !dst.exists() {
            fs::copy(src, dst)
                .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
        }
        return Ok(());
    }
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() && (replace || !target.exists()) {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("copying {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

fn error_tail(err: &anyhow::Error) -> String {
    let text = format!("{:#}", err);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(TAIL_LINES)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{init_meta_dir, write_marker, Marker};
    use gage_core::attr_log::AttrLogEntry;
    use gage_core::ids::make_run_id;
    use gage_core::util::safe_rmtree;
    use serde_json::json;

    #[test]
    fn copy_merges_user_dirs_and_keeps_existing_meta() {
        let root = std::env::temp_dir().join(format!(
            "gage_copy_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let src_root = root.join("src");
        let dst_root = root.join("dst");
        let run = Run::new(&src_root, &make_run_id());
        init_meta_dir(&run.meta_dir()).expect("init");
        write_marker(&run.meta_dir(), Marker::Initialized).expect("marker");
        ensure_dir(&run.run_dir().join("sub")).expect("run dir");
        fs::write(run.run_dir().join("sub/out.txt"), "result").expect("write");
        run.set_label("ann", Some("first")).expect("label");

        let copied = copy_runs(std::slice::from_ref(&run), &dst_root).expect("copy");
        let dst = &copied[0];
        assert!(dst.meta_dir().join("initialized").is_file());
        assert_eq!(
            fs::read_to_string(dst.run_dir().join("sub/out.txt")).expect("read"),
            "result"
        );
        assert_eq!(dst.label().expect("label").as_deref(), Some("first"));

        attr_log::append(&dst.user_dir(), &AttrLogEntry::set("bo", "note", json!("x")))
            .expect("append");
        copy_runs(std::slice::from_ref(&run), &dst_root).expect("copy again");
        let attrs = dst.user_attrs().expect("attrs");
        assert_eq!(attrs.get("note"), Some(&json!("x")));
        assert_eq!(attrs.get("label"), Some(&json!("first")));

        let missing = Run::new(&src_root, &make_run_id());
        let err = copy_runs(&[missing], &dst_root).expect_err("missing");
        assert_eq!(gage_core::error_kind(&err), Some("copy-error"));
        safe_rmtree(&root).expect("cleanup");
    }

    #[test]
    fn copy_rebases_project_ref_for_the_destination_root() {
        let root = std::env::temp_dir().join(format!(
            "gage_copy_proj_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let project = root.join("project");
        ensure_dir(&project).expect("project");
        let src_root = root.join("runs");
        let dst_root = root.join("backup/deep/runs");
        let run = Run::new(&src_root, &make_run_id());
        init_meta_dir(&run.meta_dir()).expect("init");
        run.set_project_dir(Some(&project)).expect("set project");

        let copied = copy_runs(std::slice::from_ref(&run), &dst_root).expect("copy");
        let expected = project.canonicalize().expect("canonical");
        assert_eq!(copied[0].project_dir().expect("read"), Some(expected.clone()));
        assert_eq!(run.project_dir().expect("read"), Some(expected));
        assert_ne!(
            fs::read_to_string(copied[0].project_ref_path()).expect("ref"),
            fs::read_to_string(run.project_ref_path()).expect("ref")
        );
        safe_rmtree(&root).expect("cleanup");
    }
}
