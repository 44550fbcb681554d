use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use gage_core::{GageError, Settings};
use gage_runner::lifecycle::{self, RunContext, RunOptions, RunOutcome};
use gage_runner::Gagefile;
use gage_store::meta::micros_to_datetime;
use gage_store::var::DEFAULT_SORT;
use gage_store::{filter_runs, select_one, select_runs, Run, RunAttr, RunFilter, RunView, VarStore, View};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_LIST_LIMIT: usize = 20;

#[derive(Parser)]
#[command(name = "gage", version, about = "Run store and run lifecycle for gage operations")]
struct Cli {
    /// Runs root; defaults to GAGE_RUNS, RUNS_HOME, then ~/.gage/runs.
    #[arg(long, global = true)]
    runs_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct ViewArgs {
    #[arg(long)]
    deleted: bool,
    #[arg(long, conflicts_with = "deleted")]
    archive: Option<String>,
    /// Filter runs by operation, status, or label.
    #[arg(long = "where")]
    filters: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    List {
        #[command(flatten)]
        view: ViewArgs,
        #[arg(long, short = 'n')]
        limit: Option<usize>,
        #[arg(long, short = 'a')]
        all: bool,
    },
    Delete {
        #[arg(required = true)]
        runs: Vec<String>,
        #[arg(long, short = 'p')]
        permanent: bool,
        #[arg(long = "where")]
        filters: Vec<String>,
    },
    Restore {
        #[arg(required = true)]
        runs: Vec<String>,
    },
    Purge {
        #[arg(required = true)]
        runs: Vec<String>,
    },
    Label {
        #[arg(required = true)]
        runs: Vec<String>,
        #[arg(long, conflicts_with = "clear")]
        set: Option<String>,
        #[arg(long)]
        clear: bool,
    },
    Comment {
        run: String,
        #[arg(long, conflicts_with_all = ["edit", "delete"])]
        add: Option<String>,
        #[arg(long, requires = "msg", conflicts_with = "delete")]
        edit: Option<String>,
        #[arg(long)]
        msg: Option<String>,
        #[arg(long)]
        delete: Option<String>,
    },
    Run {
        operation: Option<String>,
        /// Flag assignments as NAME=VALUE.
        flags: Vec<String>,
        #[arg(long, default_value = ".")]
        project: PathBuf,
        #[arg(long, conflicts_with = "start")]
        stage: bool,
        /// Start a previously staged run.
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        preview: bool,
        /// Seconds before the run is killed.
        #[arg(long)]
        timeout: Option<f64>,
        #[arg(long)]
        force: bool,
        #[arg(long, short = 'q')]
        quiet: bool,
    },
    Select {
        #[arg(default_value = "1")]
        run: String,
        #[arg(long, default_value = "id")]
        attr: String,
        #[command(flatten)]
        view: ViewArgs,
    },
    Archive {
        #[command(subcommand)]
        action: ArchiveCommands,
    },
    Check {
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
    Associate {
        run: String,
        project: Option<PathBuf>,
        #[arg(long, conflicts_with = "project")]
        remove: bool,
    },
    Copy {
        #[arg(required = true)]
        runs: Vec<String>,
        #[arg(long, conflicts_with = "from", required_unless_present = "from")]
        to: Option<PathBuf>,
        #[arg(long)]
        from: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ArchiveCommands {
    Create { name: String },
    List,
    Rename { archive: String, name: String },
    Delete { archive: String },
    Add {
        archive: String,
        #[arg(required = true)]
        runs: Vec<String>,
    },
    Remove {
        archive: String,
        #[arg(required = true)]
        runs: Vec<String>,
    },
    /// Zip the meta dirs of archived runs.
    Pack {
        archive: String,
        #[arg(required = true)]
        runs: Vec<String>,
    },
}

/// What a command prints in JSON mode plus the process exit code.
struct Output {
    payload: Value,
    exit_code: i32,
}

impl Output {
    fn ok(payload: Value) -> Self {
        Self {
            payload,
            exit_code: 0,
        }
    }
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    let json_mode = cli.json;
    match run_command(cli) {
        Ok(out) => {
            if json_mode {
                emit_json(&out.payload);
            }
            std::process::exit(out.exit_code);
        }
        Err(err) => {
            report_error(&err, json_mode);
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    let filter = std::env::var("GAGE_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(cli: Cli) -> Result<Output> {
    let store = match &cli.runs_dir {
        Some(dir) => VarStore::new(dir),
        None => VarStore::from_settings(&Settings::from_env()),
    };
    tracing::debug!(root = %store.root().display(), "runs root");
    let json_mode = cli.json;
    match cli.command {
        Commands::List { view, limit, all } => {
            let runs = view_runs(&store, &view)?;
            let total = runs.len();
            let shown = if all {
                total
            } else {
                limit.unwrap_or(DEFAULT_LIST_LIMIT).min(total)
            };
            let mut rows = Vec::with_capacity(shown);
            for (i, run) in runs.into_iter().take(shown).enumerate() {
                rows.push(run_row(i + 1, RunView::new(run))?);
            }
            if !json_mode {
                for row in &rows {
                    print_row(row);
                }
                if shown < total {
                    println!("[{} more, use --all to show]", total - shown);
                }
            }
            Ok(Output::ok(json!({"ok": true, "command": "list", "runs": rows})))
        }
        Commands::Delete {
            runs,
            permanent,
            filters,
        } => {
            let view = ViewArgs {
                deleted: false,
                archive: None,
                filters,
            };
            let selected = select_runs(&view_runs(&store, &view)?, &runs)?;
            let deleted = store.delete(&selected, permanent)?;
            let verb = if permanent { "Permanently deleted" } else { "Deleted" };
            say(json_mode, &format!("{} {} run(s)", verb, deleted.len()));
            Ok(Output::ok(json!({"ok": true, "command": "delete", "runs": ids(&deleted)})))
        }
        Commands::Restore { runs } => {
            let selected = select_runs(&store.list(&View::Deleted, &default_sort())?, &runs)?;
            let restored = store.restore(&selected)?;
            say(json_mode, &format!("Restored {} run(s)", restored.len()));
            Ok(Output::ok(json!({"ok": true, "command": "restore", "runs": ids(&restored)})))
        }
        Commands::Purge { runs } => {
            let selected = select_runs(&store.list(&View::Deleted, &default_sort())?, &runs)?;
            let purged = store.purge(&selected)?;
            say(json_mode, &format!("Purged {} run(s)", purged.len()));
            Ok(Output::ok(json!({"ok": true, "command": "purge", "runs": ids(&purged)})))
        }
        Commands::Label { runs, set, clear } => {
            let selected = select_runs(&store.list(&View::Active, &default_sort())?, &runs)?;
            let author = author();
            let mut labels = Vec::new();
            for run in &selected {
                if clear {
                    run.set_label(&author, None)?;
                } else if let Some(label) = &set {
                    run.set_label(&author, Some(label.as_str()))?;
                }
                let label = run.label()?;
                if !json_mode {
                    println!("{}  {}", short_id(&run.id), label.as_deref().unwrap_or(""));
                }
                labels.push(json!({"id": run.id, "label": label}));
            }
            Ok(Output::ok(json!({"ok": true, "command": "label", "runs": labels})))
        }
        Commands::Comment {
            run,
            add,
            edit,
            msg,
            delete,
        } => {
            let run = select_one(&store.list(&View::Active, &default_sort())?, &run)?;
            let author = author();
            if let Some(text) = add {
                let c = run.add_comment(&author, &text)?;
                say(json_mode, &format!("Added comment {}", short_id(&c.id)));
            } else if let Some(id) = edit {
                let text = msg.ok_or_else(|| anyhow!("--edit requires --msg"))?;
                run.edit_comment(&author, &id, &text)?;
            } else if let Some(id) = delete {
                run.delete_comment(&author, &id)?;
            }
            let comments = run.comments()?;
            if !json_mode {
                for c in &comments {
                    println!("{}  {}  {}", short_id(&c.id), c.author, format_micros(c.date));
                    println!("  {}", c.msg);
                }
            }
            let comments: Vec<Value> = comments
                .iter()
                .map(|c| json!({"id": c.id, "author": c.author, "date": c.date, "msg": c.msg}))
                .collect();
            Ok(Output::ok(json!({"ok": true, "command": "comment", "comments": comments})))
        }
        Commands::Run {
            operation,
            flags,
            project,
            stage,
            start,
            preview,
            timeout,
            force,
            quiet,
        } => {
            let opts = RunOptions {
                flags: gage_runner::parse_flag_assigns(&flags)?,
                timeout: timeout.map(Duration::from_secs_f64),
                echo: !quiet && !json_mode,
                force,
                ..RunOptions::default()
            };
            if let Some(spec) = start {
                let run = select_one(&store.list(&View::Active, &default_sort())?, &spec)?;
                let exit_code = lifecycle::start(&run, &opts)?;
                return Ok(run_output(&run, exit_code, "completed"));
            }
            let operation =
                operation.ok_or_else(|| anyhow!("specify an operation to run"))?;
            let ctx = RunContext::resolve(store.root(), &project, &operation)?;
            if preview {
                let p = lifecycle::preview(&ctx, &opts.flags)?;
                if !json_mode {
                    println!("You are about to run {}", p.opref);
                    for (k, v) in &p.config {
                        println!("  {}: {}", k, v);
                    }
                    println!("command: {}", p.argv.join(" "));
                    println!("source code: {} file(s)", p.sourcecode.len());
                }
                return Ok(Output::ok(json!({
                    "ok": true,
                    "command": "run",
                    "preview": {
                        "opref": p.opref.to_string(),
                        "config": p.config,
                        "sourcecode": p.sourcecode,
                        "argv": p.argv,
                    }
                })));
            }
            if stage {
                let run = lifecycle::stage(&ctx, &opts)?;
                say(json_mode, &format!("Staged run {}", run.id));
                return Ok(run_output(&run, 0, "staged"));
            }
            match lifecycle::run(&ctx, &opts)? {
                RunOutcome::Completed { run, exit_code } => Ok(run_output(&run, exit_code, "completed")),
                outcome @ RunOutcome::Skipped { .. } => {
                    say(
                        json_mode,
                        &format!("Skipped: run {} is comparable", short_id(&outcome.run().id)),
                    );
                    Ok(run_output(outcome.run(), outcome.exit_code(), "skipped"))
                }
            }
        }
        Commands::Select { run, attr, view } => {
            let run = select_one(&view_runs(&store, &view)?, &run)?;
            let value = RunView::new(run).attr_by_name(&attr)?;
            if !json_mode {
                match &value {
                    Value::String(s) => println!("{}", s),
                    Value::Null => {}
                    other => println!("{}", other),
                }
            }
            Ok(Output::ok(json!({"ok": true, "command": "select", "value": value})))
        }
        Commands::Archive { action } => archive_command(&store, action, json_mode),
        Commands::Check { project } => {
            let gagefile = Gagefile::load(&project)?;
            if !json_mode {
                println!("gagefile: {}", gagefile.path.display());
                for (name, op) in &gagefile.ops {
                    match &op.description {
                        Some(d) => println!("  {}  {}", name, d),
                        None => println!("  {}", name),
                    }
                }
            }
            let ops: Vec<&String> = gagefile.ops.keys().collect();
            Ok(Output::ok(json!({
                "ok": true,
                "command": "check",
                "gagefile": gagefile.path.display().to_string(),
                "operations": ops,
            })))
        }
        Commands::Associate {
            run,
            project,
            remove,
        } => {
            let run = select_one(&store.list(&View::Active, &default_sort())?, &run)?;
            if remove {
                run.set_project_dir(None)?;
            } else {
                let dir = project.unwrap_or_else(|| PathBuf::from("."));
                run.set_project_dir(Some(dir.as_path()))?;
            }
            let project = run.project_dir()?;
            if let Some(p) = &project {
                say(json_mode, &format!("Associated {} with {}", short_id(&run.id), p.display()));
            }
            Ok(Output::ok(json!({
                "ok": true,
                "command": "associate",
                "id": run.id,
                "project": project.map(|p| p.display().to_string()),
            })))
        }
        Commands::Copy { runs, to, from } => {
            let (source, dest) = match (to, from) {
                (Some(to), _) => (store.clone(), to),
                (None, Some(from)) => (VarStore::new(from), store.root().to_path_buf()),
                (None, None) => return Err(anyhow!("specify --to or --from")),
            };
            let selected = select_runs(&source.list(&View::Active, &default_sort())?, &runs)?;
            let copied = gage_store::copy::copy_runs(&selected, &dest)?;
            say(json_mode, &format!("Copied {} run(s) to {}", copied.len(), dest.display()));
            Ok(Output::ok(json!({"ok": true, "command": "copy", "runs": ids(&copied)})))
        }
    }
}

fn archive_command(store: &VarStore, action: ArchiveCommands, json_mode: bool) -> Result<Output> {
    match action {
        ArchiveCommands::Create { name } => {
            let a = store.create_archive(&name)?;
            say(json_mode, &format!("Created archive {} ({})", a.name, short_id(&a.id)));
            Ok(Output::ok(json!({"ok": true, "command": "archive", "archive": a.id})))
        }
        ArchiveCommands::List => {
            let archives = store.archives()?;
            let mut rows = Vec::new();
            for a in &archives {
                let count = store.list(&View::Archive(a.clone()), &[])?.len();
                if !json_mode {
                    println!("{}  {}  {}  {} run(s)", short_id(&a.id), a.name, format_micros(a.date), count);
                }
                rows.push(json!({"id": a.id, "name": a.name, "date": a.date, "runs": count}));
            }
            Ok(Output::ok(json!({"ok": true, "command": "archive", "archives": rows})))
        }
        ArchiveCommands::Rename { archive, name } => {
            let a = store.find_archive(&archive)?;
            let renamed = store.rename_archive(&a, &name)?;
            say(json_mode, &format!("Renamed archive {} to {}", a.name, renamed.name));
            Ok(Output::ok(json!({"ok": true, "command": "archive", "archive": renamed.id})))
        }
        ArchiveCommands::Delete { archive } => {
            let a = store.find_archive(&archive)?;
            store.delete_archive(&a)?;
            say(json_mode, &format!("Deleted archive {}", a.name));
            Ok(Output::ok(json!({"ok": true, "command": "archive", "archive": a.id})))
        }
        ArchiveCommands::Add { archive, runs } => {
            let a = store.find_archive(&archive)?;
            let selected = select_runs(&store.list(&View::Active, &default_sort())?, &runs)?;
            let moved = store.archive_runs(&selected, &a)?;
            say(json_mode, &format!("Archived {} run(s) in {}", moved.len(), a.name));
            Ok(Output::ok(json!({"ok": true, "command": "archive", "runs": ids(&moved)})))
        }
        ArchiveCommands::Remove { archive, runs } => {
            let a = store.find_archive(&archive)?;
            let selected = select_runs(&store.list(&View::Archive(a), &default_sort())?, &runs)?;
            let moved = store.unarchive_runs(&selected)?;
            say(json_mode, &format!("Restored {} run(s) from archive", moved.len()));
            Ok(Output::ok(json!({"ok": true, "command": "archive", "runs": ids(&moved)})))
        }
        ArchiveCommands::Pack { archive, runs } => {
            let a = store.find_archive(&archive)?;
            let listed = store.list(&View::Archive(a.clone()), &default_sort())?;
            let selected = select_runs(&listed, &runs)?;
            let packed = store.pack_runs(&selected)?;
            say(json_mode, &format!("Packed {} run(s) in {}", packed, a.name));
            Ok(Output::ok(json!({"ok": true, "command": "archive", "packed": packed})))
        }
    }
}

fn default_sort() -> Vec<String> {
    vec![DEFAULT_SORT.to_string()]
}

fn view_runs(store: &VarStore, args: &ViewArgs) -> Result<Vec<Run>> {
    let view = if args.deleted {
        View::Deleted
    } else if let Some(spec) = &args.archive {
        View::Archive(store.find_archive(spec)?)
    } else {
        View::Active
    };
    let filters = args
        .filters
        .iter()
        .map(|f| RunFilter::compile(f))
        .collect::<Result<Vec<_>>>()?;
    filter_runs(store.list(&view, &default_sort())?, &filters)
}

fn run_row(index: usize, view: RunView) -> Result<Value> {
    Ok(json!({
        "index": index,
        "id": view.run.id,
        "operation": view.attr(RunAttr::OpName)?,
        "started": view.attr(RunAttr::Started)?,
        "status": view.attr(RunAttr::Status)?,
        "label": view.attr(RunAttr::Label)?,
    }))
}

fn print_row(row: &Value) {
    let text = |key: &str| row[key].as_str().unwrap_or("").to_string();
    let started = row["started"].as_i64().map(format_micros).unwrap_or_default();
    println!(
        "[{}] {}  {}  {}  {}  {}",
        row["index"],
        short_id(&text("id")),
        text("operation"),
        started,
        text("status"),
        text("label")
    );
}

fn run_output(run: &Run, exit_code: i32, state: &str) -> Output {
    Output {
        payload: json!({
            "ok": exit_code == 0,
            "command": "run",
            "id": run.id,
            "state": state,
            "exit_code": exit_code,
        }),
        exit_code,
    }
}

fn ids(runs: &[Run]) -> Vec<&str> {
    runs.iter().map(|r| r.id.as_str()).collect()
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn format_micros(micros: i64) -> String {
    micros_to_datetime(micros)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_default()
}

fn author() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "gage".to_string())
}

fn say(json_mode: bool, msg: &str) {
    if !json_mode {
        println!("{}", msg);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"kind\":\"serialization-error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn report_error(err: &anyhow::Error, json_mode: bool) {
    let gage = err.downcast_ref::<GageError>();
    let violations: Vec<String> = gage
        .map(|e| e.violations().iter().map(|v| v.to_string()).collect())
        .unwrap_or_default();
    let hint = gage.and_then(GageError::hint);
    if json_mode {
        emit_json(&json!({
            "ok": false,
            "error": {
                "kind": gage.map(GageError::kind).unwrap_or("error"),
                "message": format!("{:#}", err),
                "hint": hint,
                "violations": violations,
            }
        }));
        return;
    }
    eprintln!("gage: {:#}", err);
    for v in &violations {
        eprintln!("  {}", v);
    }
    if let Some(hint) = hint {
        eprintln!("{}", hint);
    }
}
