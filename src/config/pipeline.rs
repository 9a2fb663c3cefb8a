//! Pipeline graph: which channel feeds each module and where its results go.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One stage of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Channel the inbound relay subscribes to. `None` for an entry point fed
    /// directly into its ready set.
    #[serde(rename = "source-queue", default)]
    pub source: Option<String>,
    /// Channels the outbound relay publishes to, in order.
    #[serde(rename = "destination-queues", default)]
    destinations: Option<Vec<String>>,
}

impl ModuleConfig {
    /// Creates a module definition.
    pub fn new(source: Option<&str>, destinations: &[&str]) -> Self {
        Self {
            source: source.map(str::to_string),
            destinations: Some(destinations.iter().map(|d| d.to_string()).collect()),
        }
    }

    /// Destination channels in publish order. Empty for a pipeline exit.
    pub fn destinations(&self) -> &[String] {
        self.destinations.as_deref().unwrap_or_default()
    }

    /// Returns true when the module is a terminal exit of the pipeline.
    pub fn is_exit(&self) -> bool {
        self.destinations().is_empty()
    }
}

/// Immutable mapping of module name to module definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineConfig {
    modules: BTreeMap<String, ModuleConfig>,
}

impl PipelineConfig {
    /// Loads the pipeline configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = super::read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from `(name, module)` pairs.
    pub fn from_modules<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = (S, ModuleConfig)>,
        S: Into<String>,
    {
        Self {
            modules: modules.into_iter().map(|(n, m)| (n.into(), m)).collect(),
        }
    }

    /// Validates module names and channel names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, module) in &self.modules {
            if name.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "module name cannot be empty".to_string(),
                ));
            }
            if module.source.as_deref() == Some("") {
                return Err(ConfigError::ValidationFailed(format!(
                    "module '{}' has an empty source-queue",
                    name
                )));
            }
            if module.destinations().iter().any(String::is_empty) {
                return Err(ConfigError::ValidationFailed(format!(
                    "module '{}' has an empty destination queue name",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Looks up a module by name.
    pub fn module(&self, name: &str) -> Result<&ModuleConfig, ConfigError> {
        self.modules
            .get(name)
            .ok_or_else(|| ConfigError::UnknownModule(name.to_string()))
    }

    /// Iterates over all modules in name order.
    pub fn modules(&self) -> impl Iterator<Item = (&str, &ModuleConfig)> {
        self.modules.iter().map(|(n, m)| (n.as_str(), m))
    }

    /// Module names in name order.
    pub fn module_names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_pipeline() {
        let json = r#"{
            "Entry": {"source-queue": "entry", "destination-queues": ["dispatch"]},
            "Dispatch": {"source-queue": "dispatch", "destination-queues": ["a", "b"]},
            "Sink": {"source-queue": "a"}
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).expect("valid pipeline");

        let entry = config.module("Entry").expect("Entry defined");
        assert_eq!(entry.source.as_deref(), Some("entry"));
        assert_eq!(entry.destinations(), ["dispatch".to_string()]);

        let dispatch = config.module("Dispatch").expect("Dispatch defined");
        assert_eq!(dispatch.destinations(), ["a".to_string(), "b".to_string()]);

        let sink = config.module("Sink").expect("Sink defined");
        assert!(sink.is_exit());
    }

    #[test]
    fn test_null_destinations_is_exit() {
        let json = r#"{"Sink": {"source-queue": "a", "destination-queues": null}}"#;
        let config: PipelineConfig = serde_json::from_str(json).expect("valid pipeline");
        assert!(config.module("Sink").expect("Sink defined").is_exit());
    }

    #[test]
    fn test_unknown_module() {
        let config = PipelineConfig::default();
        let err = config.module("Missing").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModule(name) if name == "Missing"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"Entry": {{"source-queue": "entry", "destination-queues": ["next"]}}}}"#
        )
        .expect("write config");

        let config = PipelineConfig::load(file.path()).expect("config loads");
        assert_eq!(config.module_names(), vec!["Entry".to_string()]);
    }

    #[test]
    fn test_load_rejects_empty_destination() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"Entry": {{"destination-queues": [""]}}}}"#).expect("write config");

        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = PipelineConfig::load("/nonexistent/pipeline.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
