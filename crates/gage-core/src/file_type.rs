//! Text/binary classification for source-code selection.
//!
//! Known extensions decide immediately. Everything else is sniffed from a
//! 1 KiB prefix: NUL bytes mean binary, otherwise the ratios of control bytes
//! and high bytes are weighed against how confidently the prefix decodes as
//! UTF-8.

use anyhow::{Context, Result};
use std::fs;
use std::io::Read;
use std::path::Path;

const SNIFF_LEN: usize = 1024;
const MAX_LOW_RATIO: f64 = 0.3;
const MAX_HIGH_RATIO: f64 = 0.3;
const MIN_ENCODING_CONFIDENCE: f64 = 0.5;

const TEXT_EXTENSIONS: &[&str] = &[
    "c", "cc", "cfg", "conf", "cpp", "cs", "css", "csv", "go", "h", "hpp", "htm", "html", "ini",
    "ipynb", "java", "js", "json", "jsx", "kt", "lua", "md", "mjs", "php", "pl", "py", "r", "rb",
    "rs", "rst", "scala", "sh", "sql", "svg", "swift", "toml", "ts", "tsx", "tsv", "txt", "xml",
    "yaml", "yml",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "7z", "a", "bin", "bmp", "bz2", "class", "dll", "dylib", "exe", "gif", "gz", "h5", "ico",
    "jar", "jpeg", "jpg", "mp3", "mp4", "npy", "npz", "o", "pdf", "pkl", "png", "pt", "pyc",
    "pyo", "so", "tar", "tgz", "wav", "webp", "whl", "xz", "zip",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Text,
    Binary,
}

pub fn classify(path: &Path) -> Result<FileType> {
    if let Some(ft) = classify_by_extension(path) {
        return Ok(ft);
    }
    let mut prefix = Vec::with_capacity(SNIFF_LEN);
    fs::File::open(path)
        .with_context(|| format!("reading {}", path.display()))?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut prefix)?;
    Ok(classify_prefix(&prefix))
}

pub fn is_text_file(path: &Path) -> Result<bool> {
    Ok(classify(path)? == FileType::Text)
}

fn classify_by_extension(path: &Path) -> Option<FileType> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        Some(FileType::Text)
    } else if BINARY_EXTENSIONS.contains(&ext.as_str()) {
        Some(FileType::Binary)
    } else {
        None
    }
}

pub fn classify_prefix(prefix: &[u8]) -> FileType {
    if prefix.is_empty() {
        return FileType::Text;
    }
    if prefix.contains(&0) {
        return FileType::Binary;
    }
    let total = prefix.len() as f64;
    let low = prefix.iter().filter(|b| is_nonprintable_low(**b)).count() as f64;
    let high = prefix.iter().filter(|b| **b >= 0x80).count() as f64;
    let low_ratio = low / total;
    let high_ratio = high / total;
    if low_ratio > MAX_LOW_RATIO {
        return FileType::Binary;
    }
    if high_ratio <= MAX_HIGH_RATIO {
        return FileType::Text;
    }
    if utf8_confidence(prefix) >= MIN_ENCODING_CONFIDENCE {
        FileType::Text
    } else {
        FileType::Binary
    }
}

fn is_nonprintable_low(b: u8) -> bool {
    (b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x08 | 0x1b)) || b == 0x7f
}

/// Fraction of the prefix that decodes as UTF-8. A multi-byte sequence cut
/// off at the end of the prefix does not count against it.
fn utf8_confidence(prefix: &[u8]) -> f64 {
    let mut valid = 0usize;
    let mut rest = prefix;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                valid += s.len();
                break;
            }
            Err(e) => {
                valid += e.valid_up_to();
                match e.error_len() {
                    Some(n) => rest = &rest[e.valid_up_to() + n..],
                    None => {
                        valid += rest.len() - e.valid_up_to();
                        break;
                    }
                }
            }
        }
    }
    valid as f64 / prefix.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_tables_win() {
        assert_eq!(classify_by_extension(Path::new("a.py")), Some(FileType::Text));
        assert_eq!(classify_by_extension(Path::new("a.PNG")), Some(FileType::Binary));
        assert_eq!(classify_by_extension(Path::new("Makefile")), None);
    }

    #[test]
    fn nul_bytes_are_binary() {
        assert_eq!(classify_prefix(b"abc\0def"), FileType::Binary);
    }

    #[test]
    fn plain_ascii_is_text() {
        assert_eq!(classify_prefix(b"hello world\nsecond line\n"), FileType::Text);
        assert_eq!(classify_prefix(b""), FileType::Text);
    }

    #[test]
    fn control_heavy_prefix_is_binary() {
        let data: Vec<u8> = (1u8..20).cycle().take(200).collect();
        assert_eq!(classify_prefix(&data), FileType::Binary);
    }

    #[test]
    fn utf8_heavy_prefix_is_text() {
        let s = "日本語のテキストです。".repeat(20);
        assert_eq!(classify_prefix(s.as_bytes()), FileType::Text);
    }

    #[test]
    fn invalid_high_bytes_are_binary() {
        let data: Vec<u8> = (0x80u8..0xff).cycle().take(300).collect();
        assert_eq!(classify_prefix(&data), FileType::Binary);
    }
}
