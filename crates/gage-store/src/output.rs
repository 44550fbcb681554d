//! Phase output capture.
//!
//! `output/<phase>` holds the line bytes of stdout and stderr combined.
//! `output/<phase>.index` holds one 9-byte big-endian record per line
//! (epoch milliseconds, stream id). Record N describes line N; both files are
//! appended under one lock.
//!
//! Every stored line ends in `\n`. A stream whose last line has no
//! terminator is stored with one appended, so its final byte differs from
//! what the process wrote. Line endings that are present, including `\r\n`,
//! are stored as written.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use gage_core::util::ensure_dir;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::meta::{MetaSource, Phase, OUTPUT_DIR};

pub const INDEX_RECORD_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout = 0,
    Stderr = 1,
}

impl OutputStream {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(OutputStream::Stdout),
            1 => Some(OutputStream::Stderr),
            _ => None,
        }
    }
}

/// Turns a raw output line into the bytes to persist plus an optional
/// completion ratio.
pub trait ProgressParser: Send + Sync {
    fn parse(&self, line: &[u8]) -> (Vec<u8>, Option<f64>);
}

pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

pub fn encode_index_record(time_ms: u64, stream: OutputStream) -> [u8; INDEX_RECORD_LEN] {
    let mut rec = [0u8; INDEX_RECORD_LEN];
    rec[..8].copy_from_slice(&time_ms.to_be_bytes());
    rec[8] = stream as u8;
    rec
}

pub fn decode_index_record(rec: &[u8; INDEX_RECORD_LEN]) -> Result<(u64, OutputStream)> {
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&rec[..8]);
    let stream = OutputStream::from_id(rec[8])
        .ok_or_else(|| anyhow!("invalid output stream id {}", rec[8]))?;
    Ok((u64::from_be_bytes(ts), stream))
}

pub fn output_paths(meta_dir: &Path, phase: Phase) -> (PathBuf, PathBuf) {
    let dir = meta_dir.join(OUTPUT_DIR);
    (
        dir.join(phase.name()),
        dir.join(format!("{}.index", phase.name())),
    )
}

struct OutputFiles {
    data: fs::File,
    index: fs::File,
    last_ms: u64,
}

impl OutputFiles {
    fn append(&mut self, line: &[u8], stream: OutputStream) -> io::Result<()> {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        // Index timestamps never go backwards even if the wall clock does.
        let ts = now.max(self.last_ms);
        self.last_ms = ts;
        self.data.write_all(line)?;
        self.index.write_all(&encode_index_record(ts, stream))?;
        Ok(())
    }
}

struct Shared {
    files: Mutex<OutputFiles>,
    echo: bool,
    progress: Option<(Arc<dyn ProgressParser>, ProgressCallback)>,
}

impl Shared {
    fn handle_line(&self, raw: &[u8], stream: OutputStream) -> Result<()> {
        let (mut line, ratio) = match &self.progress {
            Some((parser, _)) => parser.parse(raw),
            None => (raw.to_vec(), None),
        };
        if !line.is_empty() && !line.ends_with(b"\n") {
            line.push(b'\n');
        }
        if !line.is_empty() {
            let mut files = self
                .files
                .lock()
                .map_err(|_| anyhow!("output lock poisoned"))?;
            files.append(&line, stream)?;
            drop(files);
            if self.echo {
                match stream {
                    OutputStream::Stdout => {
                        let _ = io::stdout().write_all(&line);
                    }
                    OutputStream::Stderr => {
                        let _ = io::stderr().write_all(&line);
                    }
                }
            }
        }
        if let (Some(ratio), Some((_, callback))) = (ratio, &self.progress) {
            callback(ratio);
        }
        Ok(())
    }
}

/// Appends a phase's output, one reader thread per attached stream.
pub struct OutputWriter {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<Result<()>>>,
}

impl OutputWriter {
    pub fn open(meta_dir: &Path, phase: Phase) -> Result<Self> {
        Self::open_with(meta_dir, phase, false, None)
    }

    pub fn open_with(
        meta_dir: &Path,
        phase: Phase,
        echo: bool,
        progress: Option<(Arc<dyn ProgressParser>, ProgressCallback)>,
    ) -> Result<Self> {
        let (data_path, index_path) = output_paths(meta_dir, phase);
        ensure_dir(&meta_dir.join(OUTPUT_DIR))?;
        let open = |p: &Path| {
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("opening {}", p.display()))
        };
        let files = OutputFiles {
            data: open(&data_path)?,
            index: open(&index_path)?,
            last_ms: 0,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                files: Mutex::new(files),
                echo,
                progress,
            }),
            threads: Vec::new(),
        })
    }

    /// Starts a thread copying `reader` line by line into the output.
    pub fn attach<R: Read + Send + 'static>(&mut self, stream: OutputStream, reader: R) {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || -> Result<()> {
            let mut reader = BufReader::new(reader);
            let mut line = Vec::new();
            loop {
                line.clear();
                let n = reader.read_until(b'\n', &mut line)?;
                if n == 0 {
                    break;
                }
                shared.handle_line(&line, stream)?;
            }
            Ok(())
        });
        self.threads.push(handle);
    }

    /// Writes a line produced by the supervisor itself.
    pub fn write_line(&self, stream: OutputStream, line: &str) -> Result<()> {
        let mut bytes = line.as_bytes().to_vec();
        if !bytes.ends_with(b"\n") {
            bytes.push(b'\n');
        }
        self.shared.handle_line(&bytes, stream)
    }

    /// Joins the reader threads, returning the first error any of them hit.
    pub fn wait_and_close(self) -> Result<()> {
        let mut first_err = None;
        for t in self.threads {
            let res = t
                .join()
                .map_err(|_| anyhow!("output reader thread panicked"))
                .and_then(|r| r);
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub time_ms: u64,
    pub stream: OutputStream,
    pub text: String,
}

/// Streams `(time, stream, text)` lines of a phase's output. Stops at the
/// first line without a matching index record, so it can follow a file
/// that is still being written.
pub struct OutputReader {
    data: Option<Box<dyn BufRead + Send>>,
    index: Option<Box<dyn BufRead + Send>>,
}

impl OutputReader {
    pub fn open(meta: &MetaSource, phase: Phase) -> Result<Self> {
        let data_name = format!("{}/{}", OUTPUT_DIR, phase.name());
        let index_name = format!("{}/{}.index", OUTPUT_DIR, phase.name());
        Ok(Self {
            data: meta.open_reader(&data_name)?,
            index: meta.open_reader(&index_name)?,
        })
    }

    /// Opens the reader positioned at line `offset`.
    pub fn open_at(meta: &MetaSource, phase: Phase, offset: usize) -> Result<Self> {
        let mut reader = Self::open(meta, phase)?;
        reader.skip_lines(offset)?;
        Ok(reader)
    }

    pub fn skip_lines(&mut self, n: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < n {
            match self.next_record()? {
                Some(_) => skipped += 1,
                None => break,
            }
        }
        Ok(skipped)
    }

    fn next_record(&mut self) -> Result<Option<OutputLine>> {
        let (Some(data), Some(index)) = (self.data.as_mut(), self.index.as_mut()) else {
            return Ok(None);
        };
        let mut rec = [0u8; INDEX_RECORD_LEN];
        match index.read_exact(&mut rec) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let (time_ms, stream) = decode_index_record(&rec)?;
        let mut line = Vec::new();
        if data.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if line.ends_with(b"\n") {
            line.pop();
        }
        Ok(Some(OutputLine {
            time_ms,
            stream,
            text: String::from_utf8_lossy(&line).to_string(),
        }))
    }

    pub fn close(mut self) {
        self.data = None;
        self.index = None;
    }
}

impl Iterator for OutputReader {
    type Item = Result<OutputLine>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Parses tqdm-style progress bars. Carriage-return segments that look like
/// a bar (`NN%|`) are dropped from the persisted output and reported as a
/// ratio. Lines without a bar are kept byte for byte.
pub struct TqdmProgress;

impl ProgressParser for TqdmProgress {
    fn parse(&self, line: &[u8]) -> (Vec<u8>, Option<f64>) {
        let text = String::from_utf8_lossy(line);
        let (body, eol) = if let Some(b) = text.strip_suffix("\r\n") {
            (b, "\r\n")
        } else if let Some(b) = text.strip_suffix('\n') {
            (b, "\n")
        } else {
            (&*text, "")
        };
        let mut kept = String::new();
        let mut ratio = None;
        for seg in body.split('\r') {
            match tqdm_ratio(seg) {
                Some(r) => ratio = Some(r),
                None => kept.push_str(seg),
            }
        }
        if ratio.is_none() {
            return (line.to_vec(), None);
        }
        if kept.trim().is_empty() {
            return (Vec::new(), ratio);
        }
        kept.push_str(eol);
        (kept.into_bytes(), ratio)
    }
}

fn tqdm_ratio(seg: &str) -> Option<f64> {
    let bar = seg.find("%|")?;
    let digits: String = seg[..bar]
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let pct: f64 = digits.parse().ok()?;
    Some((pct / 100.0).clamp(0.0, 1.0))
}
