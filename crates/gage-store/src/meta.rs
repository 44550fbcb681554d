//! Run meta directory I/O.
//!
//! Writers always produce the directory form. Readers go through
//! [`MetaSource`], which also reads meta dirs that archive workflows have
//! zipped in place.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use gage_core::ids::monotonic_micros;
use gage_core::util::{
    atomic_write_bytes, atomic_write_json_pretty, ensure_dir, safe_list_dir, slash_path,
};
use gage_core::OpRef;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Cursor, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

pub const OPREF: &str = "opref";
pub const OPDEF: &str = "opdef.json";
pub const CONFIG: &str = "config.json";
pub const PROC_CMD: &str = "proc/cmd";
pub const PROC_ENV: &str = "proc/env";
pub const PROC_EXIT: &str = "proc/exit";
pub const PROC_LOCK: &str = "proc/lock";
pub const MANIFEST: &str = "manifest";
pub const SUMMARY: &str = "summary.json";
pub const PATCHED: &str = "patched";
pub const FILES_LOG: &str = "files-log";
pub const SOURCECODE_DIGEST: &str = "sourcecode-digest";
pub const SYS_DIR: &str = "sys";
pub const OUTPUT_DIR: &str = "output";

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Marker {
    Initialized,
    Staged,
    Started,
    Stopped,
}

impl Marker {
    pub fn name(&self) -> &'static str {
        match self {
            Marker::Initialized => "initialized",
            Marker::Staged => "staged",
            Marker::Started => "started",
            Marker::Stopped => "stopped",
        }
    }
}

/// Lifecycle phases, each with its own output pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    SourceCode,
    Runtime,
    Dependencies,
    Run,
    Finalize,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::SourceCode,
        Phase::Runtime,
        Phase::Dependencies,
        Phase::Run,
        Phase::Finalize,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::SourceCode => "sourcecode",
            Phase::Runtime => "runtime",
            Phase::Dependencies => "dependencies",
            Phase::Run => "run",
            Phase::Finalize => "finalize",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Phase::ALL.into_iter().find(|p| p.name() == name)
    }
}

/// Read access to a meta dir in directory or zip form.
#[derive(Debug, Clone)]
pub enum MetaSource {
    Dir(PathBuf),
    Zip(PathBuf),
}

impl MetaSource {
    /// Sniffs `path`: a regular file with zip magic is read as an archive,
    /// anything else as a directory.
    pub fn open(path: &Path) -> Self {
        if path.is_file() && has_zip_magic(path) {
            MetaSource::Zip(path.to_path_buf())
        } else {
            MetaSource::Dir(path.to_path_buf())
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            MetaSource::Dir(p) | MetaSource::Zip(p) => p,
        }
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self {
            MetaSource::Dir(dir) => match fs::read(dir.join(name)) {
                Ok(b) => Ok(Some(b)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e).with_context(|| format!("reading {}/{}", dir.display(), name)),
            },
            MetaSource::Zip(path) => {
                let mut archive = open_zip(path)?;
                let Some(entry_name) = zip_entry_name(&archive, path, name) else {
                    return Ok(None);
                };
                let mut entry = archive.by_name(&entry_name)?;
                let mut buf = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut buf)?;
                Ok(Some(buf))
            }
        }
    }

    pub fn read_string(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .read(name)?
            .map(|b| String::from_utf8_lossy(&b).to_string()))
    }

    /// Buffered reader over a member; zip members are read into memory.
    pub fn open_reader(&self, name: &str) -> Result<Option<Box<dyn BufRead + Send>>> {
        match self {
            MetaSource::Dir(dir) => match fs::File::open(dir.join(name)) {
                Ok(f) => Ok(Some(Box::new(BufReader::new(f)))),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
            MetaSource::Zip(_) => Ok(self
                .read(name)?
                .map(|b| Box::new(Cursor::new(b)) as Box<dyn BufRead + Send>)),
        }
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        match self {
            MetaSource::Dir(dir) => Ok(dir.join(name).exists()),
            MetaSource::Zip(path) => {
                let archive = open_zip(path)?;
                Ok(zip_entry_name(&archive, path, name).is_some())
            }
        }
    }

    /// Names directly under `subdir`.
    pub fn list(&self, subdir: &str) -> Result<Vec<String>> {
        match self {
            MetaSource::Dir(dir) => safe_list_dir(&dir.join(subdir)),
            MetaSource::Zip(path) => {
                let archive = open_zip(path)?;
                let prefix = format!("{}/", subdir.trim_end_matches('/'));
                let stem_prefix = format!("{}/{}", zip_stem(path), prefix);
                let mut names: Vec<String> = archive
                    .file_names()
                    .filter_map(|n| {
                        n.strip_prefix(&prefix)
                            .or_else(|| n.strip_prefix(&stem_prefix))
                            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
                    })
                    .filter(|n| !n.is_empty())
                    .collect();
                names.sort();
                names.dedup();
                Ok(names)
            }
        }
    }
}

fn has_zip_magic(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    match fs::File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => &magic == ZIP_MAGIC,
        Err(_) => false,
    }
}

fn open_zip(path: &Path) -> Result<zip::ZipArchive<fs::File>> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    zip::ZipArchive::new(file).with_context(|| format!("reading zip {}", path.display()))
}

fn zip_stem(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn zip_entry_name(archive: &zip::ZipArchive<fs::File>, path: &Path, name: &str) -> Option<String> {
    let nested = format!("{}/{}", zip_stem(path), name);
    archive
        .file_names()
        .find(|n| *n == name || *n == nested)
        .map(str::to_string)
}

/// Packs a meta dir into a zip file at `dest`. Entry names are relative to
/// the meta dir.
pub fn zip_meta_dir(meta_dir: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();
    for entry in walkdir::WalkDir::new(meta_dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(meta_dir).unwrap_or(entry.path());
        writer.start_file(slash_path(rel), options)?;
        writer.write_all(&fs::read(entry.path())?)?;
    }
    writer.finish()?;
    Ok(())
}

// -- writers -----------------------------------------------------------------

pub fn init_meta_dir(meta_dir: &Path) -> Result<()> {
    if meta_dir.exists() {
        return Err(gage_core::GageError::AlreadyExists(meta_dir.display().to_string()).into());
    }
    if let Some(parent) = meta_dir.parent() {
        ensure_dir(parent)?;
    }
    fs::create_dir(meta_dir).map_err(|e| {
        if e.kind() == ErrorKind::AlreadyExists {
            anyhow::Error::new(gage_core::GageError::AlreadyExists(
                meta_dir.display().to_string(),
            ))
        } else {
            anyhow::Error::new(e).context(format!("creating {}", meta_dir.display()))
        }
    })?;
    Ok(())
}

pub fn write_opref(meta_dir: &Path, opref: &OpRef) -> Result<()> {
    atomic_write_bytes(&meta_dir.join(OPREF), opref.encode()?.as_bytes())
}

pub fn write_json(meta_dir: &Path, name: &str, value: &Value) -> Result<()> {
    atomic_write_json_pretty(&meta_dir.join(name), value)
}

pub fn write_sys_attrs(meta_dir: &Path, attrs: &BTreeMap<String, String>) -> Result<()> {
    for (name, val) in attrs {
        atomic_write_bytes(&meta_dir.join(SYS_DIR).join(name), val.as_bytes())?;
    }
    Ok(())
}

pub fn write_proc_cmd(meta_dir: &Path, argv: &[String]) -> Result<()> {
    atomic_write_bytes(&meta_dir.join(PROC_CMD), &serde_json::to_vec(argv)?)
}

pub fn write_proc_env(meta_dir: &Path, env: &BTreeMap<String, String>) -> Result<()> {
    atomic_write_bytes(&meta_dir.join(PROC_ENV), &serde_json::to_vec_pretty(env)?)
}

/// Writes a marker stamped with a process-unique microsecond timestamp.
pub fn write_marker(meta_dir: &Path, marker: Marker) -> Result<i64> {
    let ts = monotonic_micros();
    atomic_write_bytes(&meta_dir.join(marker.name()), ts.to_string().as_bytes())?;
    Ok(ts)
}

pub fn write_exit_code(meta_dir: &Path, code: i32) -> Result<()> {
    atomic_write_bytes(&meta_dir.join(PROC_EXIT), code.to_string().as_bytes())
}

pub const LOCK_MARKER: &str = "gage-supervisor";

pub fn write_lock(meta_dir: &Path, pid: u32, marker: &str) -> Result<()> {
    atomic_write_bytes(
        &meta_dir.join(PROC_LOCK),
        format!("{} {}\n", pid, marker).as_bytes(),
    )
}

pub fn append_text(meta_dir: &Path, name: &str, text: &str) -> Result<()> {
    let path = meta_dir.join(name);
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    f.write_all(text.as_bytes())?;
    Ok(())
}

// -- readers -----------------------------------------------------------------

pub fn read_opref(meta: &MetaSource) -> Result<Option<OpRef>> {
    match meta.read_string(OPREF)? {
        Some(s) => Ok(Some(OpRef::decode(&s)?)),
        None => Ok(None),
    }
}

/// JSON member, or `None` when missing or not yet parseable.
pub fn read_json(meta: &MetaSource, name: &str) -> Result<Option<Value>> {
    let Some(bytes) = meta.read(name)? else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(v) => Ok(Some(v)),
        Err(e) => {
            tracing::debug!(member = name, error = %e, "treating malformed meta file as absent");
            Ok(None)
        }
    }
}

pub fn read_int(meta: &MetaSource, name: &str) -> Result<Option<i64>> {
    Ok(meta
        .read_string(name)?
        .and_then(|s| s.trim().parse::<i64>().ok()))
}

pub fn read_marker(meta: &MetaSource, marker: Marker) -> Result<Option<i64>> {
    read_int(meta, marker.name())
}

pub fn micros_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_micros(micros).single()
}

pub fn read_exit_code(meta: &MetaSource) -> Result<Option<i32>> {
    Ok(read_int(meta, PROC_EXIT)?.and_then(|v| i32::try_from(v).ok()))
}

/// `(pid, marker)` from `proc/lock`.
pub fn read_lock(meta: &MetaSource) -> Result<Option<(u32, String)>> {
    let Some(text) = meta.read_string(PROC_LOCK)? else {
        return Ok(None);
    };
    let mut parts = text.split_whitespace();
    let pid = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(|| anyhow!("malformed lock file in {}", meta.path().display()))?;
    let marker = parts.collect::<Vec<_>>().join(" ");
    Ok(Some((pid, marker)))
}

pub fn read_proc_cmd(meta: &MetaSource) -> Result<Option<Vec<String>>> {
    match read_json(meta, PROC_CMD)? {
        Some(v) => Ok(Some(serde_json::from_value(v).context("parsing proc/cmd")?)),
        None => Ok(None),
    }
}

pub fn read_proc_env(meta: &MetaSource) -> Result<BTreeMap<String, String>> {
    match read_json(meta, PROC_ENV)? {
        Some(v) => Ok(serde_json::from_value(v).context("parsing proc/env")?),
        None => Ok(BTreeMap::new()),
    }
}

pub fn read_sys_attrs(meta: &MetaSource) -> Result<BTreeMap<String, String>> {
    let mut attrs = BTreeMap::new();
    for name in meta.list(SYS_DIR)? {
        if let Some(v) = meta.read_string(&format!("{}/{}", SYS_DIR, name))? {
            attrs.insert(name, v);
        }
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gage_meta_{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn writers_and_readers_agree() {
        let root = scratch("rw");
        let meta_dir = root.join("abc.meta");
        init_meta_dir(&meta_dir).expect("init");
        assert!(init_meta_dir(&meta_dir).is_err());
        let opref = OpRef::new("proj", "train", None).expect("opref");
        write_opref(&meta_dir, &opref).expect("opref");
        write_proc_cmd(&meta_dir, &["echo".to_string(), "hi".to_string()]).expect("cmd");
        let ts = write_marker(&meta_dir, Marker::Staged).expect("marker");
        write_exit_code(&meta_dir, -9).expect("exit");
        write_lock(&meta_dir, 42, LOCK_MARKER).expect("lock");
        let mut sys = BTreeMap::new();
        sys.insert("platform".to_string(), "linux".to_string());
        write_sys_attrs(&meta_dir, &sys).expect("sys");

        let meta = MetaSource::open(&meta_dir);
        assert!(matches!(meta, MetaSource::Dir(_)));
        assert_eq!(read_opref(&meta).expect("read"), Some(opref));
        assert_eq!(
            read_proc_cmd(&meta).expect("read"),
            Some(vec!["echo".to_string(), "hi".to_string()])
        );
        assert_eq!(read_marker(&meta, Marker::Staged).expect("read"), Some(ts));
        assert_eq!(read_marker(&meta, Marker::Started).expect("read"), None);
        assert_eq!(read_exit_code(&meta).expect("read"), Some(-9));
        assert_eq!(
            read_lock(&meta).expect("read"),
            Some((42, LOCK_MARKER.to_string()))
        );
        assert_eq!(read_sys_attrs(&meta).expect("read"), sys);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn zipped_meta_reads_like_directory() {
        let root = scratch("zip");
        let meta_dir = root.join("src.meta");
        init_meta_dir(&meta_dir).expect("init");
        write_opref(&meta_dir, &OpRef::new("p", "op", Some("2")).expect("opref")).expect("w");
        write_exit_code(&meta_dir, 0).expect("exit");
        let zipped = root.join("abc.meta");
        zip_meta_dir(&meta_dir, &zipped).expect("zip");

        let meta = MetaSource::open(&zipped);
        assert!(matches!(meta, MetaSource::Zip(_)));
        assert_eq!(
            read_opref(&meta).expect("read").map(|o| o.op_version),
            Some(Some("2".to_string()))
        );
        assert_eq!(read_exit_code(&meta).expect("read"), Some(0));
        assert_eq!(meta.list("proc").expect("list"), vec!["exit"]);
        assert!(meta.read("missing").expect("read").is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn malformed_json_reads_as_absent() {
        let root = scratch("malformed");
        let meta_dir = root.join("x.meta");
        init_meta_dir(&meta_dir).expect("init");
        fs::write(meta_dir.join(CONFIG), "{\"a\": ").expect("write");
        let meta = MetaSource::open(&meta_dir);
        assert!(read_json(&meta, CONFIG).expect("read").is_none());
        fs::write(meta_dir.join("stopped"), "12x").expect("write");
        assert!(read_marker(&meta, Marker::Stopped).expect("read").is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn phases_round_trip_names() {
        for p in Phase::ALL {
            assert_eq!(Phase::from_name(p.name()), Some(p));
        }
        assert_eq!(Phase::from_name("bogus"), None);
    }
}
