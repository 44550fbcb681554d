use std::fmt;

/// A single gagefile violation, keyed by JSON pointer into the loaded document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub pointer: String,
    pub message: String,
}

impl Violation {
    pub fn new(pointer: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pointer.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.pointer, self.message)
        }
    }
}

/// Stable error taxonomy. Functions return `anyhow::Result`; callers classify
/// failures with `err.downcast_ref::<GageError>()`.
#[derive(Debug, thiserror::Error)]
pub enum GageError {
    #[error("gagefile not found in {0}")]
    GagefileNotFound(String),
    #[error("error loading gagefile {path}: {reason}")]
    GagefileLoad { path: String, reason: String },
    #[error("gagefile {path} has {} error(s)", violations.len())]
    GagefileValidation {
        path: String,
        violations: Vec<Violation>,
    },
    #[error("operation '{0}' is not defined")]
    OpDefNotFound(String),
    #[error("operation '{0}' does not define an exec for run")]
    MissingExec(String),
    #[error("{phase} phase failed with exit code {exit_code}")]
    RunExec { phase: String, exit_code: i32 },
    #[error("invalid opref: {0}")]
    OpRefInvalid(String),
    #[error("archive '{0}' does not exist")]
    ArchiveNotFound(String),
    #[error("an archive named '{0}' already exists")]
    ArchiveNameConflict(String),
    #[error("no runs matching '{0}'")]
    RunNotFound(String),
    #[error("'{spec}' matches {count} runs")]
    AmbiguousSpec { spec: String, count: usize },
    #[error("copy failed: {tail}")]
    Copy { tail: String },
    #[error("run {0} is not staged")]
    NotStaged(String),
    #[error("filter cannot be empty")]
    EmptyFilter,
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("refusing to delete {0}")]
    UnsafeDelete(String),
    #[error("invalid select rule '{0}'")]
    InvalidSelectRule(String),
    #[error("invalid flag assignment '{0}'")]
    InvalidFlag(String),
}

impl GageError {
    pub fn kind(&self) -> &'static str {
        match self {
            GageError::GagefileNotFound(_) => "gagefile-not-found",
            GageError::GagefileLoad { .. } => "gagefile-load-error",
            GageError::GagefileValidation { .. } => "gagefile-validation-error",
            GageError::OpDefNotFound(_) => "opdef-not-found",
            GageError::MissingExec(_) => "missing-exec",
            GageError::RunExec { .. } => "run-exec-error",
            GageError::OpRefInvalid(_) => "opref-invalid",
            GageError::ArchiveNotFound(_) => "archive-not-found",
            GageError::ArchiveNameConflict(_) => "archive-name-conflict",
            GageError::RunNotFound(_) => "run-not-found",
            GageError::AmbiguousSpec { .. } => "ambiguous-spec",
            GageError::Copy { .. } => "copy-error",
            GageError::NotStaged(_) => "not-staged",
            GageError::EmptyFilter => "empty-filter",
            GageError::AlreadyExists(_) => "already-exists",
            GageError::UnsafeDelete(_) => "unsafe-delete",
            GageError::InvalidSelectRule(_) => "invalid-select-rule",
            GageError::InvalidFlag(_) => "invalid-flag",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            GageError::GagefileNotFound(_) => {
                Some("Create gage.json or gage.yaml in the project directory")
            }
            GageError::OpDefNotFound(_) => Some("Run 'gage check' to list defined operations"),
            GageError::MissingExec(_) => Some("Add an 'exec' entry to the operation"),
            GageError::RunNotFound(_) => Some("Run 'gage list' to show available runs"),
            GageError::AmbiguousSpec { .. } => Some("Use a longer id prefix or an index"),
            GageError::ArchiveNotFound(_) => Some("Run 'gage archive --list' to show archives"),
            GageError::NotStaged(_) => Some("Only staged runs can be started"),
            _ => None,
        }
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            GageError::GagefileValidation { violations, .. } => violations,
            _ => &[],
        }
    }
}

/// Returns the stable kind name of `err` if it carries a [`GageError`].
pub fn error_kind(err: &anyhow::Error) -> Option<&'static str> {
    err.downcast_ref::<GageError>().map(GageError::kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_survive_anyhow_context() {
        let err = anyhow::Error::new(GageError::RunNotFound("abc".into())).context("selecting");
        assert_eq!(error_kind(&err), Some("run-not-found"));
    }

    #[test]
    fn validation_error_reports_count_and_violations() {
        let err = GageError::GagefileValidation {
            path: "gage.json".into(),
            violations: vec![
                Violation::new("/train/exec", "expected string or object"),
                Violation::new("/train/sourcecode/0", "expected string"),
            ],
        };
        assert_eq!(err.to_string(), "gagefile gage.json has 2 error(s)");
        assert_eq!(err.violations().len(), 2);
        assert_eq!(err.violations()[0].to_string(), "/train/exec: expected string or object");
    }

    #[test]
    fn run_exec_error_names_phase() {
        let err = GageError::RunExec {
            phase: "runtime".into(),
            exit_code: 3,
        };
        assert_eq!(err.kind(), "run-exec-error");
        assert!(err.to_string().contains("runtime"));
    }
}
