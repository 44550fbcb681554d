use std::collections::BTreeMap;
use std::path::PathBuf;

pub const RUNS_ENV: &str = "GAGE_RUNS";
pub const RUNS_HOME_ENV: &str = "RUNS_HOME";

/// Process-level settings read once from the environment and passed to the
/// store and runner explicitly.
#[derive(Debug, Clone)]
pub struct Settings {
    pub runs_home: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        let vars: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &BTreeMap<String, String>) -> Self {
        Self {
            runs_home: runs_home_from(vars),
        }
    }
}

fn runs_home_from(vars: &BTreeMap<String, String>) -> PathBuf {
    for key in [RUNS_ENV, RUNS_HOME_ENV] {
        if let Some(val) = vars.get(key).filter(|v| !v.is_empty()) {
            return PathBuf::from(val);
        }
    }
    user_home(vars).join(".gage").join("runs")
}

fn user_home(vars: &BTreeMap<String, String>) -> PathBuf {
    vars.get("HOME")
        .or_else(|| vars.get("USERPROFILE"))
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Home directory of the current user, if it can be determined.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn gage_runs_takes_precedence() {
        let s = Settings::from_vars(&vars(&[
            ("GAGE_RUNS", "/a"),
            ("RUNS_HOME", "/b"),
            ("HOME", "/h"),
        ]));
        assert_eq!(s.runs_home, PathBuf::from("/a"));
    }

    #[test]
    fn runs_home_used_when_gage_runs_missing() {
        let s = Settings::from_vars(&vars(&[("RUNS_HOME", "/b"), ("HOME", "/h")]));
        assert_eq!(s.runs_home, PathBuf::from("/b"));
    }

    #[test]
    fn defaults_under_user_home() {
        let s = Settings::from_vars(&vars(&[("HOME", "/h"), ("GAGE_RUNS", "")]));
        assert_eq!(s.runs_home, PathBuf::from("/h/.gage/runs"));
    }
}
