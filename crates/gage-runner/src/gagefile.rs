//! Gagefile loading and operation definitions.

use anyhow::{anyhow, Result};
use gage_core::{GageError, Violation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const GAGEFILE_NAMES: [&str; 3] = ["gage.json", "gage.yaml", "gage.yml"];

const OP_KEYS: [&str; 9] = [
    "description",
    "exec",
    "sourcecode",
    "config",
    "depends",
    "env",
    "progress",
    "needed",
    "timeout",
];
const EXEC_KEYS: [&str; 5] = [
    "stage-sourcecode",
    "stage-runtime",
    "stage-dependencies",
    "run",
    "finalize",
];

/// Per-phase commands of an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseExecs {
    #[serde(rename = "stage-sourcecode", default, skip_serializing_if = "Option::is_none")]
    pub stage_sourcecode: Option<String>,
    #[serde(rename = "stage-runtime", default, skip_serializing_if = "Option::is_none")]
    pub stage_runtime: Option<String>,
    #[serde(rename = "stage-dependencies", default, skip_serializing_if = "Option::is_none")]
    pub stage_dependencies: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Exec {
    Run(String),
    Phases(PhaseExecs),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceCode {
    Enabled(bool),
    Patterns(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpDef {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<Exec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sourcecode: Option<SourceCode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default)]
    pub needed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl OpDef {
    pub fn phase_execs(&self) -> PhaseExecs {
        match &self.exec {
            Some(Exec::Run(cmd)) => PhaseExecs {
                run: Some(cmd.clone()),
                ..PhaseExecs::default()
            },
            Some(Exec::Phases(p)) => p.clone(),
            None => PhaseExecs::default(),
        }
    }

    pub fn run_exec(&self) -> Result<String> {
        self.phase_execs()
            .run
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| GageError::MissingExec(self.name.clone()).into())
    }

    pub fn to_json(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(m) = &mut value {
            m.insert("name".to_string(), Value::String(self.name.clone()));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone)]
pub struct Gagefile {
    pub path: PathBuf,
    pub ops: BTreeMap<String, OpDef>,
}

impl Gagefile {
    /// Loads the first gagefile found in `project_dir`.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = find_gagefile(project_dir)
            .ok_or_else(|| GageError::GagefileNotFound(project_dir.display().to_string()))?;
        Self::load_path(&path)
    }

    pub fn load_path(path: &Path) -> Result<Self> {
        let load_err = |reason: String| GageError::GagefileLoad {
            path: path.display().to_string(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let data: Value = match ext.as_str() {
            "json" => serde_json::from_str(&text).map_err(|e| load_err(e.to_string()))?,
            "yaml" | "yml" => serde_yaml::from_str(&text).map_err(|e| load_err(e.to_string()))?,
            other => return Err(load_err(format!("unsupported format '{}'", other)).into()),
        };
        let violations = validate(&data);
        if !violations.is_empty() {
            return Err(GageError::GagefileValidation {
                path: path.display().to_string(),
                violations,
            }
            .into());
        }
        let mut ops = BTreeMap::new();
        if let Value::Object(map) = data {
            for (name, op) in map {
                let mut opdef: OpDef = serde_json::from_value(op)
                    .map_err(|e| load_err(format!("operation '{}': {}", name, e)))?;
                opdef.name = name.clone();
                ops.insert(name, opdef);
            }
        }
        tracing::debug!(path = %path.display(), ops = ops.len(), "loaded gagefile");
        Ok(Self {
            path: path.to_path_buf(),
            ops,
        })
    }

    pub fn opdef(&self, name: &str) -> Result<&OpDef> {
        self.ops
            .get(name)
            .ok_or_else(|| GageError::OpDefNotFound(name.to_string()).into())
    }
}

pub fn find_gagefile(project_dir: &Path) -> Option<PathBuf> {
    GAGEFILE_NAMES
        .iter()
        .map(|n| project_dir.join(n))
        .find(|p| p.is_file())
}

fn pointer_token(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

/// Shape check of a parsed gagefile. Violations are keyed by JSON pointer.
pub fn validate(data: &Value) -> Vec<Violation> {
    let mut out = Vec::new();
    let Value::Object(ops) = data else {
        out.push(Violation::new("", "expected an object of operations"));
        return out;
    };
    for (name, op) in ops {
        let base = format!("/{}", pointer_token(name));
        if name.trim().is_empty() || name.contains(char::is_whitespace) {
            out.push(Violation::new(&base, "operation names cannot contain whitespace"));
        }
        let Value::Object(fields) = op else {
            out.push(Violation::new(&base, "expected an object"));
            continue;
        };
        validate_op(&base, fields, &mut out);
    }
    out
}

fn validate_op(base: &str, fields: &Map<String, Value>, out: &mut Vec<Violation>) {
    for (key, value) in fields {
        let ptr = format!("{}/{}", base, pointer_token(key));
        if !OP_KEYS.contains(&key.as_str()) {
            out.push(Violation::new(&ptr, format!("unknown attribute '{}'", key)));
            continue;
        }
        let problem = match key.as_str() {
            "description" | "progress" if !value.is_string() => Some("expected a string"),
            "needed" if !value.is_boolean() => Some("expected a boolean"),
            "timeout" if !value.as_f64().is_some_and(|t| t > 0.0) => {
                Some("expected a positive number of seconds")
            }
            "config" | "depends" if !is_string_list(value) => Some("expected a list of strings"),
            "sourcecode" if !(value.is_boolean() || is_string_list(value)) => {
                Some("expected a boolean or a list of strings")
            }
            "env" => {
                validate_env(&ptr, value, out);
                None
            }
            "exec" => {
                validate_exec(&ptr, value, out);
                None
            }
            _ => None,
        };
        if let Some(msg) = problem {
            out.push(Violation::new(&ptr, msg));
        }
    }
    if let Some(Value::String(p)) = fields.get("progress") {
        if p != "tqdm" {
            out.push(Violation::new(
                format!("{}/progress", base),
                format!("unsupported progress parser '{}'", p),
            ));
        }
    }
}

fn validate_env(ptr: &str, value: &Value, out: &mut Vec<Violation>) {
    let Value::Object(env) = value else {
        out.push(Violation::new(ptr, "expected an object"));
        return;
    };
    for (k, v) in env {
        if !v.is_string() {
            out.push(Violation::new(
                format!("{}/{}", ptr, pointer_token(k)),
                "expected a string",
            ));
        }
    }
}

fn validate_exec(ptr: &str, value: &Value, out: &mut Vec<Violation>) {
    match value {
        Value::String(_) => {}
        Value::Object(phases) => {
            for (k, v) in phases {
                let p = format!("{}/{}", ptr, pointer_token(k));
                if !EXEC_KEYS.contains(&k.as_str()) {
                    out.push(Violation::new(&p, format!("unknown phase '{}'", k)));
                } else if !v.is_string() {
                    out.push(Violation::new(&p, "expected a string"));
                }
            }
        }
        _ => out.push(Violation::new(ptr, "expected a string or an object")),
    }
}

fn is_string_list(v: &Value) -> bool {
    v.as_array().is_some_and(|a| a.iter().all(Value::is_string))
}

/// Splits a command line into argv with POSIX shell quoting rules. No
/// shell is involved.
pub fn split_command(cmd: &str) -> Result<Vec<String>> {
    shlex::split(cmd).ok_or_else(|| anyhow!("invalid quoting in command: {}", cmd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gage_gagefile_{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn loads_yaml_and_resolves_execs() {
        let dir = scratch("yaml");
        fs::write(
            dir.join("gage.yaml"),
            "train:\n  exec:\n    stage-runtime: pip install -r reqs.txt\n    run: python train.py\n  config: ['*.py']\n  needed: true\nhello:\n  exec: echo hi\n",
        )
        .expect("write");
        let gf = Gagefile::load(&dir).expect("load");
        assert_eq!(gf.ops.len(), 2);
        let train = gf.opdef("train").expect("train");
        assert_eq!(train.run_exec().expect("run"), "python train.py");
        assert_eq!(
            train.phase_execs().stage_runtime.as_deref(),
            Some("pip install -r reqs.txt")
        );
        assert!(train.needed);
        assert_eq!(gf.opdef("hello").expect("hello").run_exec().expect("run"), "echo hi");
        let err = gf.opdef("missing").expect_err("missing");
        assert_eq!(gage_core::error_kind(&err), Some("opdef-not-found"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn validation_reports_pointers() {
        let dir = scratch("invalid");
        let path = dir.join("gage.json");
        fs::write(
            &path,
            r#"{"a/b": {"exec": {"runn": "x"}, "needed": "yes", "bogus": 1}, "c": 3}"#,
        )
        .expect("write");
        let err = Gagefile::load_path(&path).expect_err("invalid");
        let ge = err.downcast_ref::<GageError>().expect("gage error");
        assert_eq!(ge.kind(), "gagefile-validation-error");
        let ptrs: Vec<&str> = ge.violations().iter().map(|v| v.pointer.as_str()).collect();
        assert!(ptrs.contains(&"/a~1b/exec/runn"));
        assert!(ptrs.contains(&"/a~1b/needed"));
        assert!(ptrs.contains(&"/a~1b/bogus"));
        assert!(ptrs.contains(&"/c"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_and_unsupported_gagefiles() {
        let dir = scratch("missing");
        let err = Gagefile::load(&dir).expect_err("missing");
        assert_eq!(gage_core::error_kind(&err), Some("gagefile-not-found"));
        let toml = dir.join("gage.toml");
        fs::write(&toml, "[train]\nexec = 'x'\n").expect("write");
        let err = Gagefile::load_path(&toml).expect_err("toml");
        assert_eq!(gage_core::error_kind(&err), Some("gagefile-load-error"));
        fs::write(dir.join("gage.json"), r#"{"noexec": {"description": "d"}}"#).expect("write");
        let gf = Gagefile::load(&dir).expect("load");
        let err = gf.opdef("noexec").expect("op").run_exec().expect_err("no exec");
        assert_eq!(gage_core::error_kind(&err), Some("missing-exec"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn split_command_handles_quotes() {
        assert_eq!(split_command("echo hi").expect("split"), vec!["echo", "hi"]);
        assert_eq!(
            split_command(r#"python -c "print('a b')"  x\ y"#).expect("split"),
            vec!["python", "-c", "print('a b')", "x y"]
        );
        assert_eq!(split_command("say ''").expect("split"), vec!["say", ""]);
        assert!(split_command("echo 'open").is_err());
        assert_eq!(
            split_command(r#"echo "a\b" "c\"d""#).expect("split"),
            vec!["echo", "a\\b", "c\"d"]
        );
    }
}
