//! Configuration for pipequeue processes.
//!
//! Three JSON files describe a deployment, all read once at startup:
//!
//! - **pipeline**: module name -> `source-queue` / `destination-queues`
//! - **runtime**: per-channel broker connection parameters, a `Default`
//!   fallback and an optional `Log` sink
//! - **startup**: module name -> worker entrypoint and process count
//!
//! Timing knobs live in [`Settings`], which reads `PIPEQUEUE_*` environment
//! variables.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::ConfigError;

pub mod pipeline;
pub mod runtime;
pub mod settings;
pub mod startup;

pub use pipeline::{ModuleConfig, PipelineConfig};
pub use runtime::{ConnectionParams, LogParams, RuntimeConfig};
pub use settings::Settings;
pub use startup::{StartupConfig, WorkerProgram};

/// Reads and deserializes a JSON configuration file.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}
