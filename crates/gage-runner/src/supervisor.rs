//! Child process supervision: spawn in its own process group, tee output
//! into the phase output files, and kill the group on cancel or timeout.

use anyhow::{anyhow, Context, Result};
use gage_store::output::{OutputStream, OutputWriter, ProgressCallback, ProgressParser};
use gage_store::Phase;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Cloneable cancellation flag checked by the supervisor's wait loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ProcSpec {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

#[derive(Clone, Default)]
pub struct SuperviseOpts {
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
    pub echo: bool,
    pub progress: Option<(Arc<dyn ProgressParser>, ProgressCallback)>,
}

/// Why the child stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcOutcome {
    pub exit_code: i32,
    pub termination: Termination,
}

/// Runs `spec` to completion with output captured for `phase` in
/// `meta_dir`. Spawn failures are returned as errors; any exit, including
/// death by signal, is an outcome.
pub fn supervise(meta_dir: &Path, phase: Phase, spec: &ProcSpec, opts: &SuperviseOpts) -> Result<ProcOutcome> {
    let program = spec
        .argv
        .first()
        .ok_or_else(|| anyhow!("empty command for {} phase", phase.name()))?;
    let mut cmd = Command::new(program);
    cmd.args(&spec.argv[1..])
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let mut writer = OutputWriter::open_with(meta_dir, phase, opts.echo, opts.progress.clone())?;
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = writer.write_line(
                OutputStream::Stderr,
                &format!("cannot run '{}': {}", program, e),
            );
            writer.wait_and_close()?;
            return Err(anyhow::Error::new(e).context(format!("spawning {}", program)));
        }
    };
    tracing::debug!(pid = child.id(), phase = phase.name(), argv = ?spec.argv, "spawned process");
    if let Some(out) = child.stdout.take() {
        writer.attach(OutputStream::Stdout, out);
    }
    if let Some(err) = child.stderr.take() {
        writer.attach(OutputStream::Stderr, err);
    }

    let deadline = opts.timeout.map(|t| Instant::now() + t);
    let (status, termination) = loop {
        if let Some(status) = child.try_wait().context("waiting for process")? {
            break (status, Termination::Exited);
        }
        let why = if opts.cancel.is_cancelled() {
            Some(Termination::Cancelled)
        } else if deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Termination::TimedOut)
        } else {
            None
        };
        if let Some(why) = why {
            tracing::warn!(pid = child.id(), reason = ?why, "killing process group");
            kill_group(&mut child)?;
            break (child.wait()?, why);
        }
        std::thread::sleep(POLL_INTERVAL);
    };
    writer.wait_and_close()?;
    Ok(ProcOutcome {
        exit_code: exit_code(status),
        termination,
    })
}

#[cfg(unix)]
fn kill_group(child: &mut Child) -> Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        tracing::debug!(error = %e, "killpg failed, killing child only");
        child.kill().or_else(ignore_exited)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) -> Result<()> {
    child.kill().or_else(ignore_exited)?;
    Ok(())
}

fn ignore_exited(e: std::io::Error) -> std::io::Result<()> {
    if e.kind() == std::io::ErrorKind::InvalidInput {
        Ok(())
    } else {
        Err(e)
    }
}

/// Exit status as a code; death by signal N is `-N`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return -sig;
        }
    }
    1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use gage_core::util::ensure_dir;
    use gage_store::output::output_paths;
    use std::fs;

    fn scratch(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gage_supervisor_{}_{}_{}",
            prefix,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    fn spec(argv: &[&str], cwd: &Path) -> ProcSpec {
        ProcSpec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env: std::env::vars().collect(),
            cwd: cwd.to_path_buf(),
        }
    }

    #[test]
    fn captures_both_streams() {
        let dir = scratch("streams");
        let out = supervise(
            &dir,
            Phase::Run,
            &spec(&["sh", "-c", "echo out; echo err 1>&2; exit 3"], &dir),
            &SuperviseOpts::default(),
        )
        .expect("supervise");
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.termination, Termination::Exited);
        let (data, index) = output_paths(&dir, Phase::Run);
        let text = fs::read_to_string(data).expect("data");
        assert!(text.contains("out\n") && text.contains("err\n"));
        assert_eq!(fs::read(index).expect("index").len(), 18);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn timeout_kills_with_signal() {
        let dir = scratch("timeout");
        let opts = SuperviseOpts {
            timeout: Some(Duration::from_millis(100)),
            ..SuperviseOpts::default()
        };
        let started = Instant::now();
        let out = supervise(&dir, Phase::Run, &spec(&["sleep", "60"], &dir), &opts)
            .expect("supervise");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(out.exit_code, -9);
        assert_eq!(out.termination, Termination::TimedOut);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let dir = scratch("spawn");
        let err = supervise(
            &dir,
            Phase::Run,
            &spec(&["/nonexistent/gage-test-binary"], &dir),
            &SuperviseOpts::default(),
        )
        .expect_err("spawn");
        assert!(format!("{:#}", err).contains("spawning"));
        let (data, _) = output_paths(&dir, Phase::Run);
        assert!(fs::read_to_string(data).expect("data").contains("cannot run"));
        let _ = fs::remove_dir_all(dir);
    }
}
