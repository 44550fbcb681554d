use anyhow::{Context, Result};
use chrono::Utc;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::error::GageError;
use crate::settings::home_dir;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))?;
    Ok(())
}

/// Creates `path` if absent and bumps its modification time.
pub fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("touching {}", path.display()))?;
    file.set_modified(SystemTime::now())?;
    Ok(())
}

/// Writes `bytes` to a temp sibling and renames it over `path`.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &serde_json::Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Reads a whole file as UTF-8, trimmed. Missing files read as `None`.
pub fn read_trimmed(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

pub fn make_readonly(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)?;
    Ok(())
}

pub fn make_writable(path: &Path) -> Result<()> {
    let meta = fs::metadata(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode() | 0o200;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let mut perms = meta.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

pub fn is_readonly(path: &Path) -> Result<bool> {
    Ok(fs::metadata(path)?.permissions().readonly())
}

/// Marks every regular file under `dir` read-only. Directories stay writable
/// so the tree can still be renamed or removed.
pub fn make_tree_readonly(dir: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file() {
            make_readonly(entry.path())?;
        }
    }
    Ok(())
}

/// Sorted entry names of `dir`; a missing directory lists as empty.
pub fn safe_list_dir(dir: &Path) -> Result<Vec<String>> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };
    let mut names = Vec::new();
    for entry in rd {
        let entry = entry?;
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

/// Slash-normalized form of a relative path.
pub fn slash_path(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect();
    parts.join("/")
}

/// MD5 over each relpath (slash-normalized, UTF-8), a NUL, the file
/// contents, and a NUL, in the order given.
pub fn files_digest(root: &Path, relpaths: &[PathBuf]) -> Result<String> {
    let mut hasher = Md5::new();
    let mut buf = Vec::new();
    for rel in relpaths {
        hasher.update(slash_path(rel).as_bytes());
        hasher.update([0u8]);
        buf.clear();
        fs::File::open(root.join(rel))
            .with_context(|| format!("reading {}", rel.display()))?
            .read_to_end(&mut buf)?;
        hasher.update(&buf);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn sha_cache_path(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy().to_string();
    Some(path.with_file_name(format!(".gage-cache-{}.sha", name)))
}

/// Whether `path` names a digest sidecar written by `file_sha256_cached`.
pub fn is_sha_cache(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(".gage-cache-") && n.ends_with(".sha"))
}

/// SHA-256 of `path`, served from the adjacent `.gage-cache-<name>.sha`
/// sidecar when it is at least as new as the file.
pub fn file_sha256_cached(path: &Path) -> Result<String> {
    let Some(cache) = sha_cache_path(path) else {
        return sha256_file(path);
    };
    let file_mtime = fs::metadata(path)?.modified()?;
    if let Ok(cache_meta) = fs::metadata(&cache) {
        if cache_meta.modified()? >= file_mtime {
            if let Some(digest) = read_trimmed(&cache)? {
                if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Ok(digest);
                }
            }
        }
    }
    let digest = sha256_file(path)?;
    if let Err(e) = fs::write(&cache, &digest) {
        tracing::debug!(path = %cache.display(), error = %e, "unable to write sha cache");
    }
    Ok(digest)
}

/// Refuses paths whose absolute form is too shallow to be a plausible delete
/// target, and the user's home directory.
pub fn check_safe_rmtree(path: &Path) -> Result<()> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let abs = normalize_path(&abs);
    let leaves = abs
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    let has_prefix = abs.components().any(|c| matches!(c, Component::Prefix(_)));
    let min_leaves = if has_prefix { 2 } else { 1 };
    if leaves <= min_leaves {
        return Err(GageError::UnsafeDelete(abs.display().to_string()).into());
    }
    if let Some(home) = home_dir() {
        if normalize_path(&home) == abs {
            return Err(GageError::UnsafeDelete(abs.display().to_string()).into());
        }
    }
    Ok(())
}

/// Removes `path` recursively after [`check_safe_rmtree`]. Read-only files are
/// made writable first.
pub fn safe_rmtree(path: &Path) -> Result<()> {
    check_safe_rmtree(path)?;
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        for entry in walkdir::WalkDir::new(path) {
            let entry = entry?;
            if entry.file_type().is_file() && entry.metadata()?.permissions().readonly() {
                make_writable(entry.path())?;
            }
        }
        fs::remove_dir_all(path).with_context(|| format!("removing {}", path.display()))?;
    } else {
        fs::remove_file(path).with_context(|| format!("removing {}", path.display()))?;
    }
    Ok(())
}

/// Lexical normalization: drops `.` and folds `..` without touching the
/// filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Relative path from `base` to `target`, both absolute.
pub fn relpath(target: &Path, base: &Path) -> PathBuf {
    let target = normalize_path(target);
    let base = normalize_path(base);
    let t: Vec<Component> = target.components().collect();
    let b: Vec<Component> = base.components().collect();
    let common = t.iter().zip(b.iter()).take_while(|(a, b)| a == b).count();
    let mut out = PathBuf::new();
    for _ in common..b.len() {
        out.push("..");
    }
    for c in &t[common..] {
        out.push(c.as_os_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gage_util_{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn safe_list_dir_tolerates_missing() {
        let root = scratch("list");
        assert!(safe_list_dir(&root.join("nope")).expect("list").is_empty());
        fs::write(root.join("b"), "").expect("write");
        fs::write(root.join("a"), "").expect("write");
        assert_eq!(safe_list_dir(&root).expect("list"), vec!["a", "b"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn files_digest_is_order_sensitive_and_stable() {
        let root = scratch("digest");
        fs::write(root.join("a.txt"), "alpha").expect("write");
        ensure_dir(&root.join("sub")).expect("sub");
        fs::write(root.join("sub").join("b.txt"), "beta").expect("write");
        let ab = files_digest(&root, &[PathBuf::from("a.txt"), PathBuf::from("sub/b.txt")])
            .expect("digest");
        let ab2 = files_digest(&root, &[PathBuf::from("a.txt"), PathBuf::from("sub/b.txt")])
            .expect("digest");
        let ba = files_digest(&root, &[PathBuf::from("sub/b.txt"), PathBuf::from("a.txt")])
            .expect("digest");
        assert_eq!(ab, ab2);
        assert_ne!(ab, ba);
        assert_eq!(ab.len(), 32);

        let mut expected = Md5::new();
        expected.update(b"a.txt\0alpha\0sub/b.txt\0beta\0");
        assert_eq!(ab, hex::encode(expected.finalize()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn sha_cache_sidecar_is_written_and_reused() {
        let root = scratch("sha");
        let f = root.join("data.bin");
        fs::write(&f, b"hello").expect("write");
        let d1 = file_sha256_cached(&f).expect("sha");
        assert_eq!(d1, sha256_bytes(b"hello"));
        assert!(root.join(".gage-cache-data.bin.sha").exists());
        assert!(is_sha_cache(&root.join(".gage-cache-data.bin.sha")));
        assert!(!is_sha_cache(&f));
        assert_eq!(file_sha256_cached(&f).expect("sha"), d1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn readonly_round_trip() {
        let root = scratch("ro");
        let f = root.join("x");
        fs::write(&f, "x").expect("write");
        assert!(!is_readonly(&f).expect("stat"));
        make_readonly(&f).expect("ro");
        assert!(is_readonly(&f).expect("stat"));
        make_writable(&f).expect("rw");
        assert!(!is_readonly(&f).expect("stat"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rmtree_guard_refuses_shallow_paths() {
        assert!(check_safe_rmtree(Path::new("/")).is_err());
        assert!(check_safe_rmtree(Path::new("/tmp")).is_err());
        assert!(check_safe_rmtree(Path::new("/tmp/some/run")).is_ok());
        if let Some(home) = home_dir() {
            assert!(check_safe_rmtree(&home).is_err());
        }
    }

    #[test]
    fn safe_rmtree_removes_readonly_files() {
        let root = scratch("rm");
        let target = root.join("tree");
        ensure_dir(&target.join("a")).expect("dirs");
        fs::write(target.join("a").join("f"), "f").expect("write");
        make_tree_readonly(&target).expect("ro");
        safe_rmtree(&target).expect("rm");
        assert!(!target.exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn relpath_walks_up_and_down() {
        assert_eq!(
            relpath(Path::new("/a/b/proj"), Path::new("/a/runs")),
            PathBuf::from("../b/proj")
        );
        assert_eq!(relpath(Path::new("/a/b"), Path::new("/a/b")), PathBuf::new());
    }

    #[test]
    fn touch_creates_missing_file() {
        let root = scratch("touch");
        let f = root.join("nested").join("marker");
        touch(&f).expect("touch");
        assert!(f.exists());
        touch(&f).expect("touch again");
        let _ = fs::remove_dir_all(root);
    }
}
