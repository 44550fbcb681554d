use anyhow::{Context, Result};
use chrono::Utc;
use gage_core::ids::timestamp_uuid;
use gage_core::util::{atomic_write_bytes, ensure_dir, make_readonly, safe_list_dir, safe_rmtree};
use gage_core::GageError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::meta::zip_meta_dir;
use crate::run::{Run, DELETED_SUFFIX};
use crate::var::{move_run_paths, VarStore, View, ACTIVE_CONTAINER};

const RUNS_SUBDIR: &str = "runs";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchiveEntry {
    id: String,
    name: String,
    date: i64,
}

/// A named run container under `<runs-root>/.archives/<uuid>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub id: String,
    pub name: String,
    pub date: i64,
    path: PathBuf,
}

impl Archive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.path.join(RUNS_SUBDIR)
    }

    /// Latest entry file that has no `.deleted` tombstone.
    fn load(dir: &Path) -> Result<Option<Self>> {
        let names = safe_list_dir(dir)?;
        let latest = names.iter().rev().find(|n| {
            n.ends_with(".json") && !names.contains(&format!("{}{}", n, DELETED_SUFFIX))
        });
        let Some(name) = latest else {
            return Ok(None);
        };
        let path = dir.join(name);
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_slice::<ArchiveEntry>(&bytes) {
            Ok(entry) => Ok(Some(Archive {
                id: entry.id,
                name: entry.name,
                date: entry.date,
                path: dir.to_path_buf(),
            })),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping malformed archive entry");
                Ok(None)
            }
        }
    }

    fn write_entry(&self) -> Result<()> {
        let entry = ArchiveEntry {
            id: self.id.clone(),
            name: self.name.clone(),
            date: self.date,
        };
        let path = self
            .path
            .join(format!("{}.json", timestamp_uuid().hyphenated()));
        atomic_write_bytes(&path, &serde_json::to_vec_pretty(&entry)?)
    }
}

impl VarStore {
    /// Live archives ordered by name.
    pub fn archives(&self) -> Result<Vec<Archive>> {
        let dir = self.archives_dir();
        let mut archives = Vec::new();
        for name in safe_list_dir(&dir)? {
            if name.ends_with(DELETED_SUFFIX) {
                continue;
            }
            let path = dir.join(&name);
            if !path.is_dir() {
                continue;
            }
            if let Some(a) = Archive::load(&path)? {
                archives.push(a);
            }
        }
        archives.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(archives)
    }

    pub fn create_archive(&self, name: &str) -> Result<Archive> {
        self.check_archive_name(name)?;
        let id = timestamp_uuid().hyphenated().to_string();
        let archive = Archive {
            path: self.archives_dir().join(&id),
            id,
            name: name.to_string(),
            date: Utc::now().timestamp(),
        };
        ensure_dir(&archive.runs_dir())?;
        archive.write_entry()?;
        tracing::info!(archive = %archive.name, id = %archive.id, "created archive");
        Ok(archive)
    }

    /// Archive by exact name, else by unique id prefix.
    pub fn find_archive(&self, spec: &str) -> Result<Archive> {
        let archives = self.archives()?;
        if let Some(a) = archives.iter().find(|a| a.name == spec) {
            return Ok(a.clone());
        }
        let mut by_id = archives.into_iter().filter(|a| a.id.starts_with(spec));
        match (by_id.next(), by_id.next()) {
            (Some(a), None) if !spec.is_empty() => Ok(a),
            _ => Err(GageError::ArchiveNotFound(spec.to_string()).into()),
        }
    }

    pub fn rename_archive(&self, archive: &Archive, new_name: &str) -> Result<Archive> {
        if archive.name == new_name {
            return Ok(archive.clone());
        }
        self.check_archive_name(new_name)?;
        let renamed = Archive {
            name: new_name.to_string(),
            ..archive.clone()
        };
        renamed.write_entry()?;
        tracing::info!(from = %archive.name, to = %new_name, "renamed archive");
        Ok(renamed)
    }

    /// Tombstones the archive by renaming its directory with the `.deleted`
    /// suffix. Runs inside travel with it.
    pub fn delete_archive(&self, archive: &Archive) -> Result<()> {
        let target = PathBuf::from(format!("{}{}", archive.path.display(), DELETED_SUFFIX));
        let runs = self.enumerate(&View::Archive(archive.clone()))?;
        if !runs.is_empty() {
            tracing::warn!(archive = %archive.name, runs = runs.len(), "deleting archive that still holds runs");
        }
        fs::rename(&archive.path, &target)
            .with_context(|| format!("deleting archive {}", archive.name))?;
        tracing::info!(archive = %archive.name, "deleted archive");
        Ok(())
    }

    /// Archive a run currently lives in, per its move log.
    pub fn run_archive(&self, run_id: &str) -> Result<Option<Archive>> {
        let Some(container) = self.container_of(run_id)? else {
            return Ok(None);
        };
        Ok(self.archives()?.into_iter().find(|a| a.id == container))
    }

    /// Moves active runs into `archive`.
    pub fn archive_runs(&self, runs: &[Run], archive: &Archive) -> Result<Vec<Run>> {
        let dest = archive.runs_dir();
        let mut moved = Vec::new();
        for run in runs {
            let target = Run::new(&dest, &run.id);
            relocate(run, &target)?;
            self.append_move_marker(&target, &archive.id)?;
            tracing::info!(run = %run.id, archive = %archive.name, "archived run");
            moved.push(target);
        }
        Ok(moved)
    }

    /// Moves archived runs back to the active view.
    pub fn unarchive_runs(&self, runs: &[Run]) -> Result<Vec<Run>> {
        let mut moved = Vec::new();
        for run in runs {
            let target = Run::new(self.root(), &run.id);
            relocate(run, &target)?;
            self.append_move_marker(&target, ACTIVE_CONTAINER)?;
            tracing::info!(run = %run.id, "restored run from archive");
            moved.push(target);
        }
        Ok(moved)
    }

    /// Replaces the meta dirs of archived runs with zip files at the same
    /// path. Runs already packed are left as they are.
    pub fn pack_runs(&self, runs: &[Run]) -> Result<usize> {
        let mut packed = 0;
        for run in runs {
            let Some(archive) = self.run_archive(&run.id)? else {
                return Err(anyhow::anyhow!("run {} is not archived", run.id));
            };
            let meta_dir = run.meta_dir();
            if !meta_dir.is_dir() {
                continue;
            }
            let tmp = meta_dir.with_file_name(format!(".{}.meta.zip", run.id));
            zip_meta_dir(&meta_dir, &tmp)?;
            safe_rmtree(&meta_dir)?;
            fs::rename(&tmp, &meta_dir)
                .with_context(|| format!("packing {}", meta_dir.display()))?;
            make_readonly(&meta_dir)?;
            tracing::info!(run = %run.id, archive = %archive.name, "packed run meta");
            packed += 1;
        }
        Ok(packed)
    }

    fn check_archive_name(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(anyhow::anyhow!("archive name cannot be empty"));
        }
        if self.archives()?.iter().any(|a| a.name == name) {
            return Err(GageError::ArchiveNameConflict(name.to_string()).into());
        }
        Ok(())
    }
}

/// Moves a run and rewrites its project reference, which is relative to the
/// directory holding it.
fn relocate(from: &Run, to: &Run) -> Result<()> {
    if !from.meta_dir().exists() {
        return Err(GageError::RunNotFound(from.id.clone()).into());
    }
    if to.meta_dir().exists() {
        return Err(GageError::AlreadyExists(to.meta_dir().display().to_string()).into());
    }
    let project = from.project_dir()?;
    move_run_paths(from, to)?;
    if let Some(project) = project {
        to.repoint_project(&project)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{init_meta_dir, write_marker, Marker};
    use gage_core::ids::make_run_id;

    fn scratch(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gage_archive_{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    fn make_run(root: &Path) -> Run {
        let run = Run::new(root, &make_run_id());
        init_meta_dir(&run.meta_dir()).expect("init");
        write_marker(&run.meta_dir(), Marker::Initialized).expect("marker");
        run
    }

    #[test]
    fn create_find_rename_delete() {
        let root = scratch("crud");
        let store = VarStore::new(&root);
        let a = store.create_archive("baseline").expect("create");
        let err = store.create_archive("baseline").expect_err("conflict");
        assert_eq!(gage_core::error_kind(&err), Some("archive-name-conflict"));
        store.create_archive("other").expect("create");

        assert_eq!(store.find_archive("baseline").expect("by name").id, a.id);
        assert_eq!(store.find_archive(&a.id[..12]).expect("by id").name, "baseline");
        let err = store.find_archive("missing").expect_err("missing");
        assert_eq!(gage_core::error_kind(&err), Some("archive-not-found"));

        let renamed = store.rename_archive(&a, "v1").expect("rename");
        assert_eq!(store.find_archive("v1").expect("renamed").id, a.id);
        assert!(store.find_archive("baseline").is_err());

        store.delete_archive(&renamed).expect("delete");
        let names: Vec<String> = store.archives().expect("list").into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["other".to_string()]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn runs_move_in_and_out_with_project_ref() {
        let root = scratch("move");
        let runs_root = root.join("runs");
        let project = root.join("proj");
        ensure_dir(&project).expect("proj");
        let store = VarStore::new(&runs_root);
        let run = make_run(&runs_root);
        run.set_project_dir(Some(&project)).expect("project");
        let archive = store.create_archive("keep").expect("create");

        let archived = store
            .archive_runs(std::slice::from_ref(&run), &archive)
            .expect("archive");
        assert!(store.enumerate(&View::Active).expect("active").is_empty());
        assert_eq!(
            store.enumerate(&View::Archive(archive.clone())).expect("archived").len(),
            1
        );
        assert_eq!(store.run_archive(&run.id).expect("container"), Some(archive.clone()));
        assert_eq!(
            archived[0].project_dir().expect("project"),
            Some(project.canonicalize().expect("canon"))
        );

        let restored = store.unarchive_runs(&archived).expect("unarchive");
        assert_eq!(store.enumerate(&View::Active).expect("active").len(), 1);
        assert_eq!(store.run_archive(&run.id).expect("container"), None);
        assert_eq!(
            restored[0].project_dir().expect("project"),
            Some(project.canonicalize().expect("canon"))
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn packed_runs_keep_reading_and_move_back() {
        let root = scratch("pack");
        let store = VarStore::new(&root);
        let run = make_run(&root);
        crate::meta::write_exit_code(&run.meta_dir(), 0).expect("exit");
        let status = run.status().expect("status");
        let err = store.pack_runs(std::slice::from_ref(&run)).expect_err("active run");
        assert!(format!("{:#}", err).contains("not archived"));

        let archive = store.create_archive("cold").expect("create");
        let archived = store
            .archive_runs(std::slice::from_ref(&run), &archive)
            .expect("archive");
        assert_eq!(store.pack_runs(&archived).expect("pack"), 1);
        assert!(archived[0].meta_dir().is_file());
        assert!(matches!(archived[0].meta(), crate::meta::MetaSource::Zip(_)));
        assert_eq!(archived[0].status().expect("status"), status);
        assert_eq!(archived[0].exit_code().expect("exit"), Some(0));
        assert_eq!(store.pack_runs(&archived).expect("repack"), 0);

        let restored = store.unarchive_runs(&archived).expect("unarchive");
        assert_eq!(restored[0].exit_code().expect("exit"), Some(0));
        assert_eq!(store.enumerate(&View::Active).expect("active").len(), 1);
        let _ = fs::remove_dir_all(root);
    }
}
