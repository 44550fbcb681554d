use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GageError;

pub const OPREF_SCHEMA: &str = "2";

/// Stable reference to an operation: namespace, name, optional version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpRef {
    pub op_ns: String,
    pub op_name: String,
    pub op_version: Option<String>,
}

impl OpRef {
    pub fn new(op_ns: &str, op_name: &str, op_version: Option<&str>) -> Result<Self> {
        let opref = Self {
            op_ns: op_ns.to_string(),
            op_name: op_name.to_string(),
            op_version: op_version.map(str::to_string),
        };
        opref.validate()?;
        Ok(opref)
    }

    fn validate(&self) -> Result<()> {
        if self.op_ns.is_empty() || self.op_name.is_empty() {
            return Err(GageError::OpRefInvalid(format!(
                "namespace and name must be non-empty ({:?})",
                self
            ))
            .into());
        }
        let parts = [
            Some(self.op_ns.as_str()),
            Some(self.op_name.as_str()),
            self.op_version.as_deref(),
        ];
        for part in parts.into_iter().flatten() {
            if part.chars().any(char::is_whitespace) {
                return Err(
                    GageError::OpRefInvalid(format!("'{}' contains whitespace", part)).into(),
                );
            }
        }
        if self.op_version.as_deref() == Some("") {
            return Err(GageError::OpRefInvalid("empty version".into()).into());
        }
        Ok(())
    }

    /// Schema-prefixed single-line encoding, newline included.
    pub fn encode(&self) -> Result<String> {
        self.validate()?;
        let mut line = format!("{} {} {}", OPREF_SCHEMA, self.op_ns, self.op_name);
        if let Some(v) = &self.op_version {
            line.push(' ');
            line.push_str(v);
        }
        line.push('\n');
        Ok(line)
    }

    /// Decodes schema 2 (`2 ns name [version]`) and legacy schema 1
    /// (`1 name [version]`, namespace implied).
    pub fn decode(encoded: &str) -> Result<Self> {
        let parts: Vec<&str> = encoded.split_whitespace().collect();
        match parts.as_slice() {
            ["2", ns, name] => Self::new(ns, name, None),
            ["2", ns, name, version] => Self::new(ns, name, Some(version)),
            ["1", name] => Self::new("gage", name, None),
            ["1", name, version] => Self::new("gage", name, Some(version)),
            _ => Err(GageError::OpRefInvalid(encoded.trim().to_string()).into()),
        }
    }
}

impl fmt::Display for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op_version {
            Some(v) => write!(f, "{}:{}@{}", self.op_ns, self.op_name, v),
            None => write!(f, "{}:{}", self.op_ns, self.op_name),
        }
    }
}
