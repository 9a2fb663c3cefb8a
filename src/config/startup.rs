//! Worker pools to launch per module.
//!
//! ```json
//! {
//!     "Entry": {"module": "pipequeue", "args": ["worker"], "processes": 4},
//!     "Dispatch": {"module": "./bin/dispatch"}
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Worker entrypoint for one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProgram {
    /// Program to execute.
    pub module: String,
    /// Arguments placed before the `-r <runtime> -i <id>` pair.
    #[serde(default)]
    pub args: Vec<String>,
    /// Configured process count. Zero or absent means one.
    #[serde(default)]
    pub processes: Option<usize>,
}

impl WorkerProgram {
    /// Creates a worker entrypoint.
    pub fn new(module: impl Into<String>, processes: usize) -> Self {
        Self {
            module: module.into(),
            args: Vec::new(),
            processes: Some(processes),
        }
    }

    /// Sets the leading arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Number of workers to keep alive.
    pub fn process_count(&self) -> usize {
        match self.processes {
            Some(n) if n > 0 => n,
            _ => 1,
        }
    }
}

/// Mapping of module name to worker entrypoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartupConfig {
    modules: BTreeMap<String, WorkerProgram>,
}

impl StartupConfig {
    /// Loads the startup configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = super::read_json(path.as_ref())?;
        for (name, program) in &config.modules {
            if program.module.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "module '{}' has an empty worker entrypoint",
                    name
                )));
            }
        }
        Ok(config)
    }

    /// Builds a configuration from `(name, program)` pairs.
    pub fn from_programs<I, S>(programs: I) -> Self
    where
        I: IntoIterator<Item = (S, WorkerProgram)>,
        S: Into<String>,
    {
        Self {
            modules: programs.into_iter().map(|(n, p)| (n.into(), p)).collect(),
        }
    }

    /// Iterates over all worker programs in module-name order.
    pub fn programs(&self) -> impl Iterator<Item = (&str, &WorkerProgram)> {
        self.modules.iter().map(|(n, p)| (n.as_str(), p))
    }
}
