use anyhow::Context;
use conductor_core::Payload;
use conductor_orchestrator::{OrchestratorConfig, StepKind, WorkerSpec, WorkflowDefinition};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

/// Contents of `conductor.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
    /// In-process workers to start for `run`.
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
}

impl CliConfig {
    /// Read the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: CliConfig = toml::from_str(text)?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    /// Workers to start for `definition`. Without configured workers a single
    /// local worker is started that offers every capability the workflow asks
    /// for.
    pub fn workers_for(&self, definition: &WorkflowDefinition) -> Vec<WorkerSpec> {
        if !self.workers.is_empty() {
            return self.workers.clone();
        }
        let capabilities: BTreeSet<&str> = definition
            .steps
            .iter()
            .filter_map(|step| match &step.kind {
                StepKind::Task { task } => Some(task.required_capabilities.iter()),
                _ => None,
            })
            .flatten()
            .map(String::as_str)
            .collect();
        vec![WorkerSpec::new(
            "local",
            capabilities,
            self.orchestrator.engine.max_parallel_steps,
        )]
    }
}

/// Load a workflow from TOML, or JSON when the file ends in `.json`.
pub fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file '{}'", path.display()))?;
    let definition = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&text)?
    } else {
        WorkflowDefinition::from_toml(&text)?
    };
    Ok(definition)
}

/// Turn `key=value` pairs into run inputs. Values that parse as JSON keep
/// their type; anything else is taken as a string.
pub fn parse_inputs(pairs: &[String]) -> anyhow::Result<Payload> {
    let mut inputs = Payload::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("Input '{pair}' is not of the form key=value"))?;
        let key = key.trim();
        anyhow::ensure!(!key.is_empty(), "Input '{pair}' has an empty key");
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::TaskDefinition;
    use conductor_orchestrator::{WorkflowBuilder, NO_DEPS};
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.orchestrator, OrchestratorConfig::default());
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_load_with_workers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
pump_interval_ms = 50

[engine]
max_parallel_steps = 2

[[workers]]
id = "builder"
capabilities = ["rust"]
capacity = 2

[[workers]]
id = "tester"
task_types = ["test"]
"#
        )
        .unwrap();

        let config = CliConfig::load(file.path()).unwrap();
        assert_eq!(config.orchestrator.pump_interval_ms, 50);
        assert_eq!(config.orchestrator.engine.max_parallel_steps, 2);
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[0].capabilities, vec!["rust"]);
        assert_eq!(config.workers[1].capacity, 1);
        assert_eq!(config.workers[1].task_types, vec!["test"]);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pump_interval_ms = 0").unwrap();
        let err = CliConfig::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("loop intervals"));
    }

    #[test]
    fn test_default_worker_covers_capabilities() {
        let wf = WorkflowBuilder::new("caps")
            .task("a", TaskDefinition::new("a", "x").with_capabilities(["gpu"]), NO_DEPS)
            .task("b", TaskDefinition::new("b", "x").with_capabilities(["rust", "gpu"]), NO_DEPS)
            .build()
            .unwrap();
        let workers = CliConfig::default().workers_for(&wf);
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].capabilities, vec!["gpu", "rust"]);
    }

    #[test]
    fn test_parse_inputs() {
        let inputs = parse_inputs(&[
            "env=prod".to_string(),
            "replicas=3".to_string(),
            "flags=[\"a\"]".to_string(),
        ])
        .unwrap();
        assert_eq!(inputs["env"], serde_json::json!("prod"));
        assert_eq!(inputs["replicas"], serde_json::json!(3));
        assert_eq!(inputs["flags"], serde_json::json!(["a"]));
        assert!(parse_inputs(&["novalue".to_string()]).is_err());
        assert!(parse_inputs(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_load_workflow_by_extension() {
        let wf = WorkflowBuilder::new("io")
            .task("a", TaskDefinition::new("a", "x"), NO_DEPS)
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("wf.json");
        std::fs::write(&json_path, serde_json::to_string(&wf).unwrap()).unwrap();
        assert_eq!(load_workflow(&json_path).unwrap(), wf);

        let toml_path = dir.path().join("wf.toml");
        std::fs::write(&toml_path, toml::to_string(&wf).unwrap()).unwrap();
        assert_eq!(load_workflow(&toml_path).unwrap(), wf);
    }
}
