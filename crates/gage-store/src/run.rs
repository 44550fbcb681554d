use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gage_core::attr_log::{self, AttrLogEntry};
use gage_core::ids::{run_name_for_id, timestamp_uuid};
use gage_core::util::{atomic_write_bytes, normalize_path, relpath, slash_path};
use gage_core::{OpRef, RunSummary};
use serde_json::{json, Map, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::meta::{
    self, read_exit_code, read_json, read_lock, read_marker, read_opref, Marker, MetaSource,
};

pub const DELETED_SUFFIX: &str = ".deleted";
pub const LABEL_ATTR: &str = "label";
pub const COMMENT_PREFIX: &str = "comment:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Pending,
    Staged,
    Running,
    Completed,
    Error,
    Terminated,
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Staged => "staged",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
            RunStatus::Terminated => "terminated",
            RunStatus::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "pending" => RunStatus::Pending,
            "staged" => RunStatus::Staged,
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "error" => RunStatus::Error,
            "terminated" => RunStatus::Terminated,
            "unknown" => RunStatus::Unknown,
            _ => return None,
        })
    }

    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => RunStatus::Completed,
            c if c < 0 => RunStatus::Terminated,
            _ => RunStatus::Error,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status as a pure function of meta dir contents. A present lock reads as
/// running; no liveness check is made on the recorded pid.
pub fn derive_status(meta: &MetaSource) -> Result<RunStatus> {
    if let Some(code) = read_exit_code(meta)? {
        return Ok(RunStatus::from_exit_code(code));
    }
    if read_lock(meta).unwrap_or(None).is_some() {
        return Ok(RunStatus::Running);
    }
    if meta.contains(Marker::Staged.name())? {
        return Ok(RunStatus::Staged);
    }
    if meta.contains(Marker::Initialized.name())? {
        return Ok(RunStatus::Pending);
    }
    Ok(RunStatus::Unknown)
}

/// A stored run: its id, derived name, and the directory it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub id: String,
    pub name: String,
    root: PathBuf,
    deleted: bool,
}

impl Run {
    pub fn new(root: &Path, id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: run_name_for_id(id),
            root: root.to_path_buf(),
            deleted: false,
        }
    }

    pub fn deleted(root: &Path, id: &str) -> Self {
        Self {
            deleted: true,
            ..Self::new(root, id)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let deleted = if self.deleted { DELETED_SUFFIX } else { "" };
        self.root.join(format!("{}{}{}", self.id, suffix, deleted))
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.sibling(".meta")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.sibling("")
    }

    pub fn user_dir(&self) -> PathBuf {
        self.sibling(".user")
    }

    pub fn project_ref_path(&self) -> PathBuf {
        self.sibling(".project")
    }

    /// All paths that make up the run, whether present or not.
    pub fn all_paths(&self) -> Vec<PathBuf> {
        vec![
            self.meta_dir(),
            self.run_dir(),
            self.user_dir(),
            self.project_ref_path(),
        ]
    }

    pub fn meta(&self) -> MetaSource {
        MetaSource::open(&self.meta_dir())
    }

    pub fn status(&self) -> Result<RunStatus> {
        derive_status(&self.meta())
    }

    pub fn opref(&self) -> Result<Option<OpRef>> {
        read_opref(&self.meta())
    }

    pub fn opdef(&self) -> Result<Option<Value>> {
        read_json(&self.meta(), meta::OPDEF)
    }

    pub fn config(&self) -> Result<Map<String, Value>> {
        Ok(match read_json(&self.meta(), meta::CONFIG)? {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        })
    }

    /// Files digest of the source code as staged, before config was applied.
    pub fn sourcecode_digest(&self) -> Result<Option<String>> {
        Ok(self
            .meta()
            .read_string(meta::SOURCECODE_DIGEST)?
            .map(|s| s.trim().to_string()))
    }

    pub fn exit_code(&self) -> Result<Option<i32>> {
        read_exit_code(&self.meta())
    }

    pub fn summary(&self) -> Result<Option<RunSummary>> {
        match self.meta().read_string(meta::SUMMARY)? {
            Some(text) => match RunSummary::parse(&text) {
                Ok(s) => Ok(Some(s)),
                Err(e) => {
                    tracing::debug!(run = %self.id, error = %e, "ignoring unreadable summary");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Marker time, or `default` when the marker has not been written.
    pub fn timestamp(
        &self,
        marker: Marker,
        default: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(read_marker(&self.meta(), marker)?
            .and_then(meta::micros_to_datetime)
            .or(default))
    }

    /// Most advanced of started, staged, initialized.
    pub fn sort_timestamp(&self) -> Result<Option<i64>> {
        let meta = self.meta();
        for marker in [Marker::Started, Marker::Staged, Marker::Initialized] {
            if let Some(ts) = read_marker(&meta, marker)? {
                return Ok(Some(ts));
            }
        }
        Ok(None)
    }

    pub fn user_attrs(&self) -> Result<Map<String, Value>> {
        attr_log::fold(&self.user_dir())
    }

    /// User label, falling back to the summary's `run.label`.
    pub fn label(&self) -> Result<Option<String>> {
        if let Some(Value::String(s)) = self.user_attrs()?.get(LABEL_ATTR) {
            return Ok(Some(s.clone()));
        }
        Ok(self.summary()?.and_then(|s| s.run_label()))
    }

    pub fn set_label(&self, author: &str, label: Option<&str>) -> Result<()> {
        let entry = match label {
            Some(l) => AttrLogEntry::set(author, LABEL_ATTR, json!(l)),
            None => AttrLogEntry::delete(author, LABEL_ATTR),
        };
        attr_log::append(&self.user_dir(), &entry)?;
        Ok(())
    }

    pub fn comments(&self) -> Result<Vec<Comment>> {
        let mut comments: Vec<Comment> = self
            .user_attrs()?
            .into_iter()
            .filter_map(|(k, v)| {
                let id = k.strip_prefix(COMMENT_PREFIX)?.to_string();
                Some(Comment {
                    id,
                    author: v.get("author")?.as_str()?.to_string(),
                    date: v.get("date")?.as_i64()?,
                    msg: v.get("msg")?.as_str()?.to_string(),
                })
            })
            .collect();
        comments.sort_by(|a, b| (a.date, &a.id).cmp(&(b.date, &b.id)));
        Ok(comments)
    }

    pub fn add_comment(&self, author: &str, msg: &str) -> Result<Comment> {
        let id = timestamp_uuid().hyphenated().to_string();
        let comment = Comment {
            id,
            author: author.to_string(),
            date: Utc::now().timestamp(),
            msg: msg.to_string(),
        };
        self.write_comment(author, &comment)?;
        Ok(comment)
    }

    pub fn edit_comment(&self, author: &str, comment_id: &str, msg: &str) -> Result<Comment> {
        let existing = self.find_comment(comment_id)?;
        let comment = Comment {
            msg: msg.to_string(),
            ..existing
        };
        self.write_comment(author, &comment)?;
        Ok(comment)
    }

    pub fn delete_comment(&self, author: &str, comment_id: &str) -> Result<()> {
        let existing = self.find_comment(comment_id)?;
        attr_log::append(
            &self.user_dir(),
            &AttrLogEntry::delete(author, &format!("{}{}", COMMENT_PREFIX, existing.id)),
        )?;
        Ok(())
    }

    fn find_comment(&self, comment_id: &str) -> Result<Comment> {
        self.comments()?
            .into_iter()
            .find(|c| c.id == comment_id || c.id.starts_with(comment_id))
            .ok_or_else(|| anyhow::anyhow!("comment '{}' not found for run {}", comment_id, self.id))
    }

    fn write_comment(&self, author: &str, comment: &Comment) -> Result<()> {
        let value = json!({
            "author": comment.author,
            "date": comment.date,
            "msg": comment.msg,
        });
        attr_log::append(
            &self.user_dir(),
            &AttrLogEntry::set(author, &format!("{}{}", COMMENT_PREFIX, comment.id), value),
        )?;
        Ok(())
    }

    /// Absolute project dir from `<id>.project` (`file:<path>`, relative to
    /// the directory holding the reference).
    pub fn project_dir(&self) -> Result<Option<PathBuf>> {
        let Some(text) = gage_core::read_trimmed(&self.project_ref_path())? else {
            return Ok(None);
        };
        let Some(path) = text.lines().next().and_then(|l| l.strip_prefix("file:")) else {
            return Ok(None);
        };
        let path = Path::new(path);
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        Ok(Some(abs.canonicalize().unwrap_or_else(|_| normalize_path(&abs))))
    }

    /// Points `<id>.project` at a resolved project dir, relative to this
    /// run's root. A dir that no longer exists is recorded absolute.
    pub fn repoint_project(&self, project: &Path) -> Result<()> {
        if project.exists() {
            self.set_project_dir(Some(project))
        } else {
            atomic_write_bytes(
                &self.project_ref_path(),
                format!("file:{}\n", project.display()).as_bytes(),
            )
        }
    }

    /// Points `<id>.project` at `project_dir`, or removes it.
    pub fn set_project_dir(&self, project_dir: Option<&Path>) -> Result<()> {
        let path = self.project_ref_path();
        match project_dir {
            Some(dir) => {
                let dir = dir
                    .canonicalize()
                    .with_context(|| format!("resolving {}", dir.display()))?;
                let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
                let rel = slash_path(&relpath(&dir, &root));
                atomic_write_bytes(&path, format!("file:{}\n", rel).as_bytes())
            }
            None => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub date: i64,
    pub msg: String,
}

/// Named run attributes readable through [`RunView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunAttr {
    Id,
    Name,
    OpRef,
    OpName,
    OpDef,
    Status,
    ExitCode,
    Label,
    Comments,
    Config,
    Summary,
    Cmd,
    Env,
    Sys,
    Initialized,
    Staged,
    Started,
    Stopped,
    Timestamp,
    ProjectDir,
}

impl RunAttr {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "id" => RunAttr::Id,
            "name" => RunAttr::Name,
            "opref" => RunAttr::OpRef,
            "op_name" | "operation" => RunAttr::OpName,
            "opdef" => RunAttr::OpDef,
            "status" => RunAttr::Status,
            "exit_code" => RunAttr::ExitCode,
            "label" => RunAttr::Label,
            "comments" => RunAttr::Comments,
            "config" => RunAttr::Config,
            "summary" => RunAttr::Summary,
            "cmd" => RunAttr::Cmd,
            "env" => RunAttr::Env,
            "sys" => RunAttr::Sys,
            "initialized" => RunAttr::Initialized,
            "staged" => RunAttr::Staged,
            "started" => RunAttr::Started,
            "stopped" => RunAttr::Stopped,
            "timestamp" => RunAttr::Timestamp,
            "project_dir" => RunAttr::ProjectDir,
            _ => return None,
        })
    }

    fn read(&self, run: &Run) -> Result<Value> {
        let meta = run.meta();
        let opt = |v: Option<Value>| v.unwrap_or(Value::Null);
        Ok(match self {
            RunAttr::Id => json!(run.id),
            RunAttr::Name => json!(run.name),
            RunAttr::OpRef => opt(run.opref()?.map(|o| json!(o.to_string()))),
            RunAttr::OpName => opt(run.opref()?.map(|o| json!(o.op_name))),
            RunAttr::OpDef => opt(run.opdef()?),
            RunAttr::Status => json!(run.status()?.as_str()),
            RunAttr::ExitCode => opt(run.exit_code()?.map(|c| json!(c))),
            RunAttr::Label => opt(run.label()?.map(Value::String)),
            RunAttr::Comments => serde_json::to_value(
                run.comments()?
                    .into_iter()
                    .map(|c| json!({"id": c.id, "author": c.author, "date": c.date, "msg": c.msg}))
                    .collect::<Vec<_>>(),
            )?,
            RunAttr::Config => Value::Object(run.config()?),
            RunAttr::Summary => opt(run.summary()?.map(|s| s.to_value())),
            RunAttr::Cmd => opt(meta::read_proc_cmd(&meta)?.map(|c| json!(c))),
            RunAttr::Env => json!(meta::read_proc_env(&meta)?),
            RunAttr::Sys => json!(meta::read_sys_attrs(&meta)?),
            RunAttr::Initialized => opt(read_marker(&meta, Marker::Initialized)?.map(|t| json!(t))),
            RunAttr::Staged => opt(read_marker(&meta, Marker::Staged)?.map(|t| json!(t))),
            RunAttr::Started => opt(read_marker(&meta, Marker::Started)?.map(|t| json!(t))),
            RunAttr::Stopped => opt(read_marker(&meta, Marker::Stopped)?.map(|t| json!(t))),
            RunAttr::Timestamp => opt(run.sort_timestamp()?.map(|t| json!(t))),
            RunAttr::ProjectDir => opt(
                run.project_dir()?
                    .map(|p| json!(p.to_string_lossy().to_string())),
            ),
        })
    }
}

/// A run plus a per-instance cache of attribute reads.
pub struct RunView {
    pub run: Run,
    cache: RefCell<HashMap<RunAttr, Value>>,
}

impl RunView {
    pub fn new(run: Run) -> Self {
        Self {
            run,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn attr(&self, attr: RunAttr) -> Result<Value> {
        if let Some(v) = self.cache.borrow().get(&attr) {
            return Ok(v.clone());
        }
        let value = attr.read(&self.run)?;
        self.cache.borrow_mut().insert(attr, value.clone());
        Ok(value)
    }

    pub fn attr_by_name(&self, name: &str) -> Result<Value> {
        let attr = RunAttr::from_name(name)
            .ok_or_else(|| anyhow::anyhow!("unknown run attribute '{}'", name))?;
        self.attr(attr)
    }

    pub fn status(&self) -> Result<RunStatus> {
        let value = self.attr(RunAttr::Status)?;
        Ok(value
            .as_str()
            .and_then(RunStatus::from_name)
            .unwrap_or(RunStatus::Unknown))
    }

    pub fn into_run(self) -> Run {
        self.run
    }
}
