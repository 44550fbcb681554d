//! Run lifecycle: stage a run from a project, start its process, finalize.

use anyhow::{Context, Result};
use gage_core::file_select::{copy_file, copy_tree, walk_selected, CopyHandler, FileSelect, SelectResult};
use gage_core::ids::make_run_id;
use gage_core::file_type::is_text_file;
use gage_core::util::{
    atomic_write_bytes, ensure_dir, file_sha256_cached, files_digest, is_sha_cache,
    make_tree_readonly, slash_path,
};
use gage_core::{GageError, OpRef, RunSummary};
use gage_store::manifest::{append_manifest, read_manifest, ManifestEntry, ManifestKind};
use gage_store::meta::{
    self, append_text, init_meta_dir, read_json, read_proc_cmd, read_proc_env, write_exit_code,
    write_json, write_lock, write_marker, write_opref, write_proc_cmd, write_proc_env,
    write_sys_attrs, LOCK_MARKER,
};
use gage_store::output::{
    OutputStream, OutputWriter, ProgressCallback, ProgressParser, TqdmProgress,
};
use gage_store::{Marker, Phase, Run, RunStatus, VarStore, View};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config_apply::{apply_config_file, read_config_file};
use crate::gagefile::{split_command, Gagefile, OpDef};
use crate::phases::{PhaseBus, PhaseEvent};
use crate::sourcecode::sourcecode_select;
use crate::supervisor::{supervise, CancelToken, ProcSpec, SuperviseOpts};

/// Process exit code reserved for a run skipped in favor of a comparable one.
pub const EXIT_SKIPPED: i32 = 3;
/// Exit code recorded when the operation process cannot be spawned.
pub const EXIT_SPAWN_FAILED: i32 = 127;
pub const RUN_DIR_ENV: &str = "RUN_DIR";
pub const OPREF_NS: &str = "gagefile";
const ENV_DENYLIST: [&str; 1] = ["_"];

/// A resolved operation ready to stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub runs_root: PathBuf,
    pub project_dir: PathBuf,
    pub opdef: OpDef,
    pub opref: OpRef,
}

impl RunContext {
    pub fn new(runs_root: &Path, project_dir: &Path, opdef: OpDef) -> Result<Self> {
        let opref = OpRef::new(OPREF_NS, &opdef.name, None)?;
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("resolving project {}", project_dir.display()))?;
        Ok(Self {
            runs_root: runs_root.to_path_buf(),
            project_dir,
            opdef,
            opref,
        })
    }

    /// Loads the project's gagefile and resolves `op_name` in it.
    pub fn resolve(runs_root: &Path, project_dir: &Path, op_name: &str) -> Result<Self> {
        let gagefile = Gagefile::load(project_dir)?;
        let opdef = gagefile.opdef(op_name)?.clone();
        Self::new(runs_root, project_dir, opdef)
    }

    pub fn store(&self) -> VarStore {
        VarStore::new(&self.runs_root)
    }
}

#[derive(Clone, Default)]
pub struct RunOptions {
    /// User flag assignments applied to config files.
    pub flags: Map<String, Value>,
    /// Extra environment for the operation process.
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
    pub bus: Option<PhaseBus>,
    pub echo: bool,
    /// Stage even when a comparable completed run exists.
    pub force: bool,
}

impl RunOptions {
    fn publish(&self, event: PhaseEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed { run: Run, exit_code: i32 },
    Skipped { run: Run },
}

impl RunOutcome {
    pub fn run(&self) -> &Run {
        match self {
            RunOutcome::Completed { run, .. } | RunOutcome::Skipped { run } => run,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed { exit_code, .. } => *exit_code,
            RunOutcome::Skipped { .. } => EXIT_SKIPPED,
        }
    }
}

/// What staging would do, computed without writing anything.
#[derive(Debug, Clone)]
pub struct Preview {
    pub opref: OpRef,
    pub config: Map<String, Value>,
    pub sourcecode: Vec<String>,
    pub argv: Vec<String>,
}

pub fn preview(ctx: &RunContext, flags: &Map<String, Value>) -> Result<Preview> {
    let argv = split_command(&ctx.opdef.run_exec()?)?;
    let files = selected_sourcecode(ctx)?;
    let config = applied_config(&ctx.project_dir, &files, &ctx.opdef.config, flags)?;
    Ok(Preview {
        opref: ctx.opref.clone(),
        config,
        sourcecode: files.iter().map(|p| slash_path(p)).collect(),
        argv,
    })
}

/// Stages and starts a run, unless the operation is `needed`-gated and a
/// comparable completed run exists.
pub fn run(ctx: &RunContext, opts: &RunOptions) -> Result<RunOutcome> {
    if ctx.opdef.needed && !opts.force {
        if let Some(prev) = find_comparable(ctx, &opts.flags)? {
            tracing::info!(run = %prev.id, op = %ctx.opref, "skipping, comparable run exists");
            return Ok(RunOutcome::Skipped { run: prev });
        }
    }
    let run = stage(ctx, opts)?;
    let exit_code = start(&run, opts)?;
    Ok(RunOutcome::Completed { run, exit_code })
}

fn find_comparable(ctx: &RunContext, flags: &Map<String, Value>) -> Result<Option<Run>> {
    let files = selected_sourcecode(ctx)?;
    let config = applied_config(&ctx.project_dir, &files, &ctx.opdef.config, flags)?;
    let runs = ctx.store().list(&View::Active, &[])?;
    for run in runs {
        if run.status()? != RunStatus::Completed {
            continue;
        }
        if run.opref()?.as_ref() != Some(&ctx.opref) {
            continue;
        }
        if run.config()? == config {
            return Ok(Some(run));
        }
    }
    Ok(None)
}

fn selected_sourcecode(ctx: &RunContext) -> Result<Vec<PathBuf>> {
    let select = sourcecode_select(&ctx.opdef)?;
    Ok(walk_selected(&ctx.project_dir, &select, |_, _| {})?
        .into_iter()
        .map(|(p, _)| p)
        .collect())
}

/// Config read from the files among `files` that match `patterns` (earlier
/// files win on shared keys), overlaid with `flags`.
fn applied_config(
    root: &Path,
    files: &[PathBuf],
    patterns: &[String],
    flags: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut config = Map::new();
    for rel in config_files(root, files, patterns)? {
        for (k, v) in read_config_file(&root.join(&rel))? {
            config.entry(k).or_insert(v);
        }
    }
    for (k, v) in flags {
        config.insert(k.clone(), v.clone());
    }
    Ok(config)
}

fn config_files(root: &Path, files: &[PathBuf], patterns: &[String]) -> Result<Vec<PathBuf>> {
    if patterns.is_empty() {
        return Ok(Vec::new());
    }
    let select = FileSelect::parse(patterns)?;
    let mut matched = Vec::new();
    for rel in files {
        if select.select_file(root, &slash_path(rel))?.selected
            && is_text_file(&root.join(rel))?
        {
            matched.push(rel.clone());
        }
    }
    Ok(matched)
}

// -- stage -------------------------------------------------------------------

/// Creates a run for `ctx`: meta dir, run dir with source code, runtime and
/// dependency files, and applied config. Leaves the run `staged`.
pub fn stage(ctx: &RunContext, opts: &RunOptions) -> Result<Run> {
    let argv = split_command(&ctx.opdef.run_exec()?)?;
    let run = Run::new(&ctx.runs_root, &make_run_id());
    let meta_dir = run.meta_dir();
    init_meta_dir(&meta_dir)?;
    write_marker(&meta_dir, Marker::Initialized)?;
    write_opref(&meta_dir, &ctx.opref)?;
    write_json(&meta_dir, meta::OPDEF, &ctx.opdef.to_json()?)?;
    write_sys_attrs(&meta_dir, &sys_attrs())?;
    write_proc_cmd(&meta_dir, &argv)?;
    write_proc_env(&meta_dir, &run_env(ctx, opts))?;
    run.set_project_dir(Some(ctx.project_dir.as_path()))?;
    ensure_dir(&run.run_dir())?;
    tracing::debug!(run = %run.id, op = %ctx.opref, "initialized run");

    if let Err(e) = stage_phases(ctx, opts, &run) {
        let code = match e.downcast_ref::<GageError>() {
            Some(GageError::RunExec { exit_code, .. }) => *exit_code,
            _ => 1,
        };
        tracing::error!(run = %run.id, error = %format!("{:#}", e), "staging failed");
        write_exit_code(&meta_dir, code)?;
        write_marker(&meta_dir, Marker::Stopped)?;
        return Err(e);
    }
    write_marker(&meta_dir, Marker::Staged)?;
    tracing::info!(run = %run.id, op = %ctx.opref, "staged run");
    Ok(run)
}

fn stage_phases(ctx: &RunContext, opts: &RunOptions, run: &Run) -> Result<()> {
    let execs = ctx.opdef.phase_execs();
    let run_dir = run.run_dir();
    let mut tagged: Vec<(ManifestKind, PathBuf)> = Vec::new();
    let mut log = FilesLog::new(&ctx.project_dir);

    // sourcecode
    opts.publish(started(run, Phase::SourceCode));
    let select = sourcecode_select(&ctx.opdef)?;
    log.kind = ManifestKind::SourceCode;
    let sourcecode = copy_tree(&ctx.project_dir, &run_dir, &select, &mut log)?;
    write_phase_output(run, Phase::SourceCode, &copied_lines(&sourcecode))?;
    atomic_write_bytes(
        &run.meta_dir().join(meta::SOURCECODE_DIGEST),
        files_digest(&run_dir, &sourcecode)?.as_bytes(),
    )?;
    tagged.extend(sourcecode.iter().map(|p| (ManifestKind::SourceCode, p.clone())));
    if let Some(cmd) = &execs.stage_sourcecode {
        let created = run_phase_exec(run, Phase::SourceCode, cmd, opts)?;
        tagged.extend(created.into_iter().map(|p| (ManifestKind::SourceCode, p)));
    }
    opts.publish(finished(run, Phase::SourceCode, None));

    // runtime
    write_phase_output(run, Phase::Runtime, &[])?;
    if let Some(cmd) = &execs.stage_runtime {
        let created = run_phase_exec(run, Phase::Runtime, cmd, opts)?;
        tagged.extend(created.into_iter().map(|p| (ManifestKind::Runtime, p)));
    }

    // dependencies
    write_phase_output(run, Phase::Dependencies, &[])?;
    if !ctx.opdef.depends.is_empty() {
        opts.publish(started(run, Phase::Dependencies));
        let select = FileSelect::parse(&ctx.opdef.depends)?;
        log.kind = ManifestKind::Dependency;
        let copied = copy_tree(&ctx.project_dir, &run_dir, &select, &mut log)?;
        write_phase_output(run, Phase::Dependencies, &copied_lines(&copied))?;
        tagged.extend(copied.into_iter().map(|p| (ManifestKind::Dependency, p)));
        opts.publish(finished(run, Phase::Dependencies, None));
    }
    if let Some(cmd) = &execs.stage_dependencies {
        let created = run_phase_exec(run, Phase::Dependencies, cmd, opts)?;
        tagged.extend(created.into_iter().map(|p| (ManifestKind::Dependency, p)));
    }

    // config
    let applied = applied_config(&run_dir, &sourcecode, &ctx.opdef.config, &opts.flags)?;
    if !opts.flags.is_empty() {
        for rel in config_files(&run_dir, &sourcecode, &ctx.opdef.config)? {
            let name = slash_path(&rel);
            if let Some(diff) = apply_config_file(&run_dir.join(&rel), &name, &opts.flags)? {
                append_text(&run.meta_dir(), meta::PATCHED, &diff)?;
            }
        }
    }
    write_json(&run.meta_dir(), meta::CONFIG, &Value::Object(applied))?;

    if !log.text.is_empty() {
        append_text(&run.meta_dir(), meta::FILES_LOG, &log.text)?;
    }
    append_manifest(&run.meta_dir(), &manifest_entries(&run_dir, tagged)?)
}

/// Appends `lines` to a phase's stdout output, creating the output pair.
fn write_phase_output(run: &Run, phase: Phase, lines: &[String]) -> Result<()> {
    let writer = OutputWriter::open(&run.meta_dir(), phase)?;
    for line in lines {
        writer.write_line(OutputStream::Stdout, line)?;
    }
    writer.wait_and_close()
}

fn copied_lines(files: &[PathBuf]) -> Vec<String> {
    files
        .iter()
        .map(|p| format!("copied {}", slash_path(p)))
        .collect()
}

/// Records per-file staging events for `files-log`.
struct FilesLog {
    root: PathBuf,
    kind: ManifestKind,
    text: String,
}

impl FilesLog {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            kind: ManifestKind::SourceCode,
            text: String::new(),
        }
    }

    fn record(&mut self, event: &str, src: &Path, detail: Option<&str>) {
        let rel = slash_path(src.strip_prefix(&self.root).unwrap_or(src));
        self.text.push_str(&format!("{} {} {}", self.kind.code(), event, rel));
        if let Some(d) = detail {
            self.text.push_str(&format!(" [{}]", d));
        }
        self.text.push('\n');
    }
}

impl CopyHandler for FilesLog {
    fn copy(&mut self, src: &Path, dst: &Path, result: &SelectResult) -> Result<()> {
        copy_file(src, dst)?;
        self.record("copy", src, result.rule.as_deref());
        Ok(())
    }

    fn ignore(&mut self, src: &Path, result: &SelectResult) {
        self.record("skip", src, result.rule.as_deref());
    }

    fn ignore_dir(&mut self, src: &Path, rule: &str) {
        self.record("skip-dir", src, Some(rule));
    }
}

fn manifest_entries(run_dir: &Path, tagged: Vec<(ManifestKind, PathBuf)>) -> Result<Vec<ManifestEntry>> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for (kind, rel) in tagged {
        let path = slash_path(&rel);
        if !seen.insert(path.clone()) {
            continue;
        }
        let abs = run_dir.join(&rel);
        if !abs.is_file() {
            continue;
        }
        entries.push(ManifestEntry {
            kind,
            digest: file_sha256_cached(&abs)?,
            path,
        });
    }
    Ok(entries)
}

fn list_files(dir: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1) {
        let entry = entry?;
        if entry.file_type().is_file() && !is_sha_cache(entry.path()) {
            files.insert(entry.path().strip_prefix(dir)?.to_path_buf());
        }
    }
    Ok(files)
}

/// Runs a phase command in the run dir and returns the files it created.
fn run_phase_exec(run: &Run, phase: Phase, cmd: &str, opts: &RunOptions) -> Result<Vec<PathBuf>> {
    let before = list_files(&run.run_dir())?;
    let spec = ProcSpec {
        argv: split_command(cmd)?,
        env: spawn_env(run)?,
        cwd: run.run_dir(),
    };
    opts.publish(started(run, phase));
    let outcome = supervise(&run.meta_dir(), phase, &spec, &supervise_opts(opts, run, phase, None));
    let exit_code = match outcome {
        Ok(o) => o.exit_code,
        Err(e) => {
            tracing::error!(run = %run.id, phase = phase.name(), error = %format!("{:#}", e), "phase exec failed to start");
            EXIT_SPAWN_FAILED
        }
    };
    opts.publish(finished(run, phase, Some(exit_code)));
    if exit_code != 0 {
        return Err(GageError::RunExec {
            phase: phase.name().to_string(),
            exit_code,
        }
        .into());
    }
    let after = list_files(&run.run_dir())?;
    Ok(after.difference(&before).cloned().collect())
}

fn sys_attrs() -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    attrs.insert("platform".to_string(), std::env::consts::OS.to_string());
    attrs.insert("arch".to_string(), std::env::consts::ARCH.to_string());
    if let Ok(cwd) = std::env::current_dir() {
        attrs.insert("cwd".to_string(), cwd.display().to_string());
    }
    attrs.insert("gage_version".to_string(), env!("CARGO_PKG_VERSION").to_string());
    attrs
}

/// Parent environment minus the denylist, then opdef env, then user env.
fn run_env(ctx: &RunContext, opts: &RunOptions) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars()
        .filter(|(k, _)| !ENV_DENYLIST.contains(&k.as_str()))
        .collect();
    env.extend(ctx.opdef.env.clone());
    env.extend(opts.env.clone());
    env
}

fn spawn_env(run: &Run) -> Result<BTreeMap<String, String>> {
    let mut env = read_proc_env(&run.meta())?;
    let run_dir = run.run_dir();
    let abs = run_dir.canonicalize().unwrap_or(run_dir);
    env.insert(RUN_DIR_ENV.to_string(), abs.display().to_string());
    Ok(env)
}

fn started(run: &Run, phase: Phase) -> PhaseEvent {
    PhaseEvent::Started {
        run_id: run.id.clone(),
        phase,
    }
}

fn finished(run: &Run, phase: Phase, exit_code: Option<i32>) -> PhaseEvent {
    PhaseEvent::Finished {
        run_id: run.id.clone(),
        phase,
        exit_code,
    }
}

fn supervise_opts(
    opts: &RunOptions,
    run: &Run,
    phase: Phase,
    progress: Option<&str>,
) -> SuperviseOpts {
    let progress = match progress {
        Some("tqdm") => {
            let parser: Arc<dyn ProgressParser> = Arc::new(TqdmProgress);
            let bus = opts.bus.clone();
            let run_id = run.id.clone();
            let callback: ProgressCallback = Arc::new(move |ratio: f64| {
                if let Some(bus) = &bus {
                    bus.publish(PhaseEvent::Progress {
                        run_id: run_id.clone(),
                        phase,
                        ratio,
                    });
                }
            });
            Some((parser, callback))
        }
        _ => None,
    };
    SuperviseOpts {
        timeout: opts.timeout,
        cancel: opts.cancel.clone(),
        echo: opts.echo,
        progress,
    }
}

// -- start -------------------------------------------------------------------

fn stored_opdef(run: &Run) -> Result<Option<OpDef>> {
    Ok(read_json(&run.meta(), meta::OPDEF)?.and_then(|v| serde_json::from_value(v).ok()))
}

/// Runs a staged run's process to completion and finalizes it. Returns the
/// recorded exit code.
pub fn start(run: &Run, opts: &RunOptions) -> Result<i32> {
    let status = run.status()?;
    if status != RunStatus::Staged {
        return Err(GageError::NotStaged(run.id.clone()).into());
    }
    let meta_dir = run.meta_dir();
    write_lock(&meta_dir, std::process::id(), LOCK_MARKER)?;
    write_marker(&meta_dir, Marker::Started)?;
    let opdef = stored_opdef(run)?;
    let spec = ProcSpec {
        argv: read_proc_cmd(&run.meta())?.unwrap_or_default(),
        env: spawn_env(run)?,
        cwd: run.run_dir(),
    };
    let mut sup = supervise_opts(
        opts,
        run,
        Phase::Run,
        opdef.as_ref().and_then(|o| o.progress.as_deref()),
    );
    if sup.timeout.is_none() {
        sup.timeout = opdef
            .as_ref()
            .and_then(|o| o.timeout)
            .map(Duration::from_secs_f64);
    }
    tracing::info!(run = %run.id, "starting run");
    opts.publish(started(run, Phase::Run));
    let exit_code = match supervise(&meta_dir, Phase::Run, &spec, &sup) {
        Ok(outcome) => outcome.exit_code,
        Err(e) => {
            tracing::error!(run = %run.id, error = %format!("{:#}", e), "cannot start run");
            opts.publish(finished(run, Phase::Run, Some(EXIT_SPAWN_FAILED)));
            finalize(run, EXIT_SPAWN_FAILED, opts)?;
            return Err(e.context(GageError::RunExec {
                phase: Phase::Run.name().to_string(),
                exit_code: EXIT_SPAWN_FAILED,
            }));
        }
    };
    opts.publish(finished(run, Phase::Run, Some(exit_code)));
    finalize(run, exit_code, opts)?;
    Ok(exit_code)
}

// -- finalize ----------------------------------------------------------------

/// Records the exit, classifies new run dir files as generated, persists the
/// run's summary, and makes the run read-only.
pub fn finalize(run: &Run, exit_code: i32, opts: &RunOptions) -> Result<()> {
    let meta_dir = run.meta_dir();
    let run_dir = run.run_dir();
    let mut code = exit_code;
    let finalize_exec = stored_opdef(run)?.and_then(|o| o.phase_execs().finalize);
    write_phase_output(run, Phase::Finalize, &[])?;
    if let Some(cmd) = finalize_exec.filter(|_| run_dir.is_dir()) {
        if let Err(e) = run_phase_exec(run, Phase::Finalize, &cmd, opts) {
            tracing::warn!(run = %run.id, error = %e, "finalize exec failed");
            if code == 0 {
                code = match e.downcast_ref::<GageError>() {
                    Some(GageError::RunExec { exit_code, .. }) => *exit_code,
                    _ => 1,
                };
            }
        }
    }
    write_exit_code(&meta_dir, code)?;
    write_marker(&meta_dir, Marker::Stopped)?;
    match fs::remove_file(meta_dir.join(meta::PROC_LOCK)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }

    if run_dir.is_dir() {
        let known: HashSet<String> = read_manifest(&run.meta())?
            .into_iter()
            .map(|e| e.path)
            .collect();
        let generated: Vec<(ManifestKind, PathBuf)> = list_files(&run_dir)?
            .into_iter()
            .filter(|p| !known.contains(&slash_path(p)))
            .map(|p| (ManifestKind::Generated, p))
            .collect();
        append_manifest(&meta_dir, &manifest_entries(&run_dir, generated)?)?;
        persist_summary(run)?;
        make_tree_readonly(&run_dir)?;
    }
    make_tree_readonly(&meta_dir)?;
    tracing::info!(run = %run.id, exit_code = code, "finalized run");
    Ok(())
}

fn persist_summary(run: &Run) -> Result<()> {
    let path = run.run_dir().join(meta::SUMMARY);
    let Ok(text) = fs::read_to_string(&path) else {
        return Ok(());
    };
    match RunSummary::parse(&text) {
        Ok(summary) => atomic_write_bytes(
            &run.meta_dir().join(meta::SUMMARY),
            summary.to_json_pretty()?.as_bytes(),
        ),
        Err(e) => {
            tracing::warn!(run = %run.id, error = %e, "ignoring malformed summary");
            Ok(())
        }
    }
}


#[cfg(all(test, unix))]
mod process_tests {
    use super::*;
    use crate::gagefile::{Exec, SourceCode};
    use gage_store::output::output_paths;
    use serde_json::json;

    fn scratch(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gage_lifecycle_proc_{}_{}_{}",
            prefix,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir.join("project")).expect("scratch dir");
        dir
    }

    fn op(name: &str, exec: &str) -> OpDef {
        OpDef {
            name: name.to_string(),
            exec: Some(Exec::Run(exec.to_string())),
            ..OpDef::default()
        }
    }

    #[test]
    fn stage_and_start_without_config() {
        let root = scratch("hello");
        let project = root.join("project");
        fs::write(project.join("main.txt"), "hello world, this is main.txt\n").expect("write");
        let ctx = RunContext::new(&root.join("runs"), &project, op("hello", "echo hi")).expect("ctx");
        let outcome = run(&ctx, &RunOptions::default()).expect("run");
        assert_eq!(outcome.exit_code(), 0);

        let runs = ctx.store().list(&View::Active, &[]).expect("list");
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.status().expect("status"), RunStatus::Completed);
        assert_eq!(run.exit_code().expect("exit"), Some(0));
        assert!(!run.meta_dir().join(meta::PROC_LOCK).exists());

        let (data, index) = output_paths(&run.meta_dir(), Phase::Run);
        assert_eq!(fs::read_to_string(data).expect("output"), "hi\n");
        let index = fs::read(index).expect("index");
        assert_eq!(index.len(), 9);
        assert_eq!(index[8], 0);

        let manifest = read_manifest(&run.meta()).expect("manifest");
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].kind, ManifestKind::SourceCode);
        assert_eq!(manifest[0].path, "main.txt");
        assert!(run.run_dir().join("main.txt").is_file());
        assert!(run.run_dir().join(".gage-cache-main.txt.sha").is_file());
        assert_eq!(
            run.sourcecode_digest().expect("digest"),
            Some(files_digest(&project, &[PathBuf::from("main.txt")]).expect("digest"))
        );
        assert!(gage_core::util::is_readonly(&run.meta_dir().join(meta::OPREF)).expect("mode"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn every_phase_has_an_output_pair() {
        let root = scratch("outputs");
        let project = root.join("project");
        fs::write(project.join("a.txt"), "a\n").expect("write");
        ensure_dir(&project.join("sub")).expect("sub");
        fs::write(project.join("sub/b.txt"), "b\n").expect("write");
        let ctx = RunContext::new(&root.join("runs"), &project, op("list", "ls")).expect("ctx");
        let outcome = run(&ctx, &RunOptions::default()).expect("run");
        let run = outcome.run();
        for phase in Phase::ALL {
            let (data, index) = output_paths(&run.meta_dir(), phase);
            assert!(data.is_file(), "{} output", phase.name());
            assert!(index.is_file(), "{} index", phase.name());
        }
        let (data, index) = output_paths(&run.meta_dir(), Phase::SourceCode);
        assert_eq!(
            fs::read_to_string(data).expect("sourcecode output"),
            "copied a.txt\ncopied sub/b.txt\n"
        );
        assert_eq!(fs::read(index).expect("index").len(), 18);
        let (runtime, _) = output_paths(&run.meta_dir(), Phase::Runtime);
        assert_eq!(fs::read(runtime).expect("runtime output").len(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn flags_patch_config_files() {
        let root = scratch("config");
        let project = root.join("project");
        fs::write(project.join("m.py"), "x = 1\n").expect("write");
        let opdef = OpDef {
            sourcecode: Some(SourceCode::Patterns(vec!["**/*.py".to_string()])),
            config: vec!["**/*.py".to_string()],
            ..op("train", "true")
        };
        let ctx = RunContext::new(&root.join("runs"), &project, opdef).expect("ctx");
        let opts = RunOptions {
            flags: crate::flags::parse_flag_assigns(&["x=2".to_string()]).expect("flags"),
            ..RunOptions::default()
        };
        let run = stage(&ctx, &opts).expect("stage");
        assert_eq!(run.status().expect("status"), RunStatus::Staged);
        assert_eq!(fs::read_to_string(run.run_dir().join("m.py")).expect("m.py"), "x = 2\n");
        assert_eq!(fs::read_to_string(project.join("m.py")).expect("m.py"), "x = 1\n");
        let patched = fs::read_to_string(run.meta_dir().join(meta::PATCHED)).expect("patched");
        assert!(patched.contains("-x = 1"));
        assert!(patched.contains("+x = 2"));
        assert_eq!(run.config().expect("config").get("x"), Some(&json!(2)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn cancel_kills_run_and_records_signal() {
        let root = scratch("cancel");
        let ctx = RunContext::new(&root.join("runs"), &root.join("project"), op("sleep", "sleep 60"))
            .expect("ctx");
        let opts = RunOptions::default();
        let cancel = opts.cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        let outcome = run(&ctx, &opts).expect("run");
        canceller.join().expect("join");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(outcome.exit_code() < 0);
        let run = outcome.run();
        assert_eq!(run.status().expect("status"), RunStatus::Terminated);
        assert!(read_marker_present(run, Marker::Stopped));
        let _ = fs::remove_dir_all(root);
    }

    fn read_marker_present(run: &Run, marker: Marker) -> bool {
        gage_store::meta::read_marker(&run.meta(), marker)
            .expect("marker")
            .is_some()
    }

    #[test]
    fn failing_phase_exec_stops_staging() {
        let root = scratch("phase");
        let opdef = OpDef {
            exec: Some(Exec::Phases(crate::gagefile::PhaseExecs {
                run: Some("true".to_string()),
                stage_runtime: Some("sh -c 'exit 4'".to_string()),
                ..Default::default()
            })),
            ..op("setup", "true")
        };
        let ctx = RunContext::new(&root.join("runs"), &root.join("project"), opdef).expect("ctx");
        let err = stage(&ctx, &RunOptions::default()).expect_err("runtime phase");
        assert_eq!(gage_core::error_kind(&err), Some("run-exec-error"));
        let runs = ctx.store().list(&View::Active, &[]).expect("list");
        assert_eq!(runs[0].status().expect("status"), RunStatus::Error);
        assert_eq!(runs[0].exit_code().expect("exit"), Some(4));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn needed_op_skips_comparable_run() {
        let root = scratch("needed");
        fs::write(root.join("project").join("a.txt"), "data\n").expect("write");
        let opdef = OpDef {
            needed: true,
            ..op("prepare", "true")
        };
        let ctx = RunContext::new(&root.join("runs"), &root.join("project"), opdef).expect("ctx");
        let first = run(&ctx, &RunOptions::default()).expect("first");
        assert!(matches!(first, RunOutcome::Completed { .. }));
        let second = run(&ctx, &RunOptions::default()).expect("second");
        assert!(matches!(second, RunOutcome::Skipped { .. }));
        assert_eq!(second.exit_code(), EXIT_SKIPPED);
        assert_eq!(second.run().id, first.run().id);
        let forced = RunOptions {
            force: true,
            ..RunOptions::default()
        };
        assert!(matches!(run(&ctx, &forced).expect("forced"), RunOutcome::Completed { .. }));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn generated_files_and_summary_are_recorded() {
        let root = scratch("summary");
        let project = root.join("project");
        fs::write(
            project.join("fit.sh"),
            "printf '{\"metrics\": {\"loss\": 0.5}}' > summary.json\n",
        )
        .expect("write");
        let ctx = RunContext::new(&root.join("runs"), &project, op("fit", "sh fit.sh")).expect("ctx");
        let outcome = run(&ctx, &RunOptions::default()).expect("run");
        assert_eq!(outcome.exit_code(), 0);
        let run = outcome.run();
        let manifest = read_manifest(&run.meta()).expect("manifest");
        assert!(manifest
            .iter()
            .any(|e| e.kind == ManifestKind::Generated && e.path == "summary.json"));
        let summary = run.summary().expect("summary").expect("present");
        assert_eq!(summary.metric("loss"), Some(0.5));
        let _ = fs::remove_dir_all(root);
    }
}
