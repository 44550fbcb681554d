use anyhow::Result;
use gage_core::file_select::FileSelect;

use crate::gagefile::{OpDef, SourceCode};

/// Default source code rules: text files under 10 KiB, at most 500 of them,
/// skipping dot dirs and dirs that hold a virtualenv or a `.nocopy` marker.
pub const DEFAULT_PATTERNS: [&str; 4] = [
    "* text size<10240 max-matches=500",
    "-.* dir",
    "-* dir sentinel=bin/activate",
    "-* dir sentinel=.nocopy",
];

pub fn default_patterns() -> Vec<String> {
    DEFAULT_PATTERNS.iter().map(|s| s.to_string()).collect()
}

fn is_include(pattern: &str) -> bool {
    let t = pattern.trim();
    t.starts_with("\\-") || !t.starts_with('-')
}

/// Patterns in effect for an operation. A list with at least one include is
/// used as given; a list of only excludes extends the defaults.
pub fn sourcecode_patterns(opdef: &OpDef) -> Vec<String> {
    match &opdef.sourcecode {
        None | Some(SourceCode::Enabled(true)) => default_patterns(),
        Some(SourceCode::Enabled(false)) => vec!["-*".to_string()],
        Some(SourceCode::Patterns(list)) if list.iter().any(|p| is_include(p)) => list.clone(),
        Some(SourceCode::Patterns(list)) => {
            let mut patterns = default_patterns();
            patterns.extend(list.iter().cloned());
            patterns
        }
    }
}

/// A fresh select for the operation; match counters start at zero.
pub fn sourcecode_select(opdef: &OpDef) -> Result<FileSelect> {
    FileSelect::parse(&sourcecode_patterns(opdef))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gage_core::file_select::walk_selected;
    use gage_core::util::{ensure_dir, slash_path};
    use std::fs;
    use std::path::{Path, PathBuf};

    fn op(sourcecode: Option<SourceCode>) -> OpDef {
        OpDef {
            name: "op".to_string(),
            sourcecode,
            ..OpDef::default()
        }
    }

    fn write(root: &Path, rel: &str, contents: &[u8]) {
        let p = root.join(rel);
        ensure_dir(p.parent().expect("parent")).expect("dir");
        fs::write(p, contents).expect("write");
    }

    #[test]
    fn pattern_merge_rules() {
        assert_eq!(sourcecode_patterns(&op(None)), default_patterns());
        assert_eq!(
            sourcecode_patterns(&op(Some(SourceCode::Enabled(true)))),
            default_patterns()
        );
        let list = vec!["**/*.py".to_string(), "-tests".to_string()];
        assert_eq!(
            sourcecode_patterns(&op(Some(SourceCode::Patterns(list.clone())))),
            list
        );
        let excludes = vec!["-data".to_string()];
        let merged = sourcecode_patterns(&op(Some(SourceCode::Patterns(excludes))));
        assert_eq!(merged.len(), DEFAULT_PATTERNS.len() + 1);
        assert_eq!(merged.last().map(String::as_str), Some("-data"));
        assert!(sourcecode_select(&op(Some(SourceCode::Enabled(false))))
            .expect("select")
            .disabled());
    }

    #[test]
    fn defaults_skip_binaries_large_files_and_envs() {
        let root: PathBuf = std::env::temp_dir().join(format!(
            "gage_sourcecode_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        write(&root, "main.txt", b"print('hello from main file')\n");
        write(&root, "big.txt", &vec![b'a'; 20_000]);
        write(&root, "blob.bin", &[0u8, 1, 2, 3]);
        write(&root, ".git/config", b"[core]\n");
        write(&root, "venv/bin/activate", b"# env\n");
        write(&root, "venv/lib.py", b"x = 1\n");
        write(&root, "pkg/util.py", b"y = 2\n");
        let select = sourcecode_select(&op(None)).expect("select");
        let picked: Vec<String> = walk_selected(&root, &select, |_, _| {})
            .expect("walk")
            .into_iter()
            .map(|(p, _)| slash_path(&p))
            .collect();
        assert_eq!(picked, vec!["main.txt".to_string(), "pkg/util.py".to_string()]);
        let _ = fs::remove_dir_all(root);
    }
}
