use anyhow::{anyhow, Result};
use std::fmt;
use std::io::BufRead;
use std::path::Path;

use crate::meta::{append_text, MetaSource, MANIFEST};

/// Origin of a file in the run dir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestKind {
    SourceCode,
    Dependency,
    Runtime,
    Generated,
}

impl ManifestKind {
    pub fn code(&self) -> char {
        match self {
            ManifestKind::SourceCode => 's',
            ManifestKind::Dependency => 'd',
            ManifestKind::Runtime => 'r',
            ManifestKind::Generated => 'g',
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "s" => Some(ManifestKind::SourceCode),
            "d" => Some(ManifestKind::Dependency),
            "r" => Some(ManifestKind::Runtime),
            "g" => Some(ManifestKind::Generated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub kind: ManifestKind,
    pub digest: String,
    pub path: String,
}

impl ManifestEntry {
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let (Some(code), Some(digest), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(anyhow!("malformed manifest line: {}", line));
        };
        let kind = ManifestKind::from_code(code)
            .ok_or_else(|| anyhow!("unknown manifest type '{}'", code))?;
        Ok(Self {
            kind,
            digest: digest.to_string(),
            path: path.to_string(),
        })
    }
}

impl fmt::Display for ManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.kind.code(), self.digest, self.path)
    }
}

pub fn append_manifest(meta_dir: &Path, entries: &[ManifestEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut text = String::new();
    for e in entries {
        text.push_str(&e.to_string());
        text.push('\n');
    }
    append_text(meta_dir, MANIFEST, &text)
}

/// Lazy iterator over manifest lines. Drop or [`ManifestReader::close`]
/// releases the underlying file.
pub struct ManifestReader {
    lines: Option<std::io::Lines<Box<dyn BufRead + Send>>>,
}

impl ManifestReader {
    pub fn open(meta: &MetaSource) -> Result<Self> {
        Ok(Self {
            lines: meta.open_reader(MANIFEST)?.map(BufRead::lines),
        })
    }

    pub fn close(mut self) {
        self.lines = None;
    }
}

impl Iterator for ManifestReader {
    type Item = Result<ManifestEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            match lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(ManifestEntry::parse(&line)),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

pub fn read_manifest(meta: &MetaSource) -> Result<Vec<ManifestEntry>> {
    ManifestReader::open(meta)?.collect()
}
