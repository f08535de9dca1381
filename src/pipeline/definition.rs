/// Pipeline definition files (TOML)
///
/// ```toml
/// [params]
/// arch = "amd64"
///
/// [[step]]
/// id = "install-neovim"
/// run = "curl -fsSLO https://example.invalid/nvim-{{version}}-{{arch}}.tar.gz"
/// outputs = ["opt/nvim"]
///
/// [[stage]]
/// name = "dev-deps"
/// steps = [{ use = "install-neovim", with = { version = "0.10.4" } }]
/// ```
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::descriptor::{DescriptorStore, Params, ResultMarker, StepDescriptor};
use super::orchestrator::Pipeline;
use super::stage::Stage;
use crate::error::{Result, StrataError};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    /// Pipeline-wide parameter defaults
    #[serde(default)]
    pub params: BTreeMap<String, toml::Value>,

    #[serde(default, rename = "step")]
    pub steps: Vec<StepDefinition>,

    #[serde(default, rename = "stage")]
    pub stages: Vec<StageDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    pub id: String,
    pub run: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    pub expect: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDefinition {
    pub name: String,
    pub extends: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepRef>,
}

/// A stage entry: a bare step id, or a step id with stage-level bindings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StepRef {
    Id(String),
    Bound {
        #[serde(rename = "use")]
        id: String,
        #[serde(default)]
        with: BTreeMap<String, toml::Value>,
    },
}

impl StepRef {
    pub fn id(&self) -> &str {
        match self {
            StepRef::Id(id) => id,
            StepRef::Bound { id, .. } => id,
        }
    }
}

/// Descriptors plus the resolved pipeline built from a definition
#[derive(Debug)]
pub struct LoadedPipeline {
    pub path: PathBuf,
    pub store: DescriptorStore,
    pub pipeline: Pipeline,
}

impl PipelineDefinition {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| StrataError::Definition {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| StrataError::Definition {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Register descriptors and resolve every stage entry
    ///
    /// Parameter precedence, lowest first: `[params]`, the stage entry's
    /// `with`, then `overrides` (config file, environment and CLI).
    pub fn build(&self, path: &Path, overrides: &Params) -> Result<LoadedPipeline> {
        let malformed = |message: String| StrataError::Definition {
            path: path.to_path_buf(),
            message,
        };

        if self.stages.is_empty() {
            return Err(malformed("no stages defined".to_string()));
        }

        let mut store = DescriptorStore::new();
        for step in &self.steps {
            let expect = match &step.expect {
                Some(spec) => Some(ResultMarker::parse(spec).ok_or_else(|| {
                    malformed(format!(
                        "step '{}': expect must look like sha256:<hex>:<path>, got '{}'",
                        step.id, spec
                    ))
                })?),
                None => None,
            };

            store.register(
                StepDescriptor::new(&step.id, &step.run)
                    .with_params(step.params.iter().cloned())
                    .with_env(step.env.clone())
                    .with_outputs(step.outputs.clone())
                    .with_expect(expect),
            )?;
        }

        let defaults = normalize_params(&self.params).map_err(&malformed)?;

        let mut stages = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let mut steps = Vec::with_capacity(stage.steps.len());

            for entry in &stage.steps {
                let mut params = defaults.clone();
                if let StepRef::Bound { with, .. } = entry {
                    params.extend(normalize_params(with).map_err(&malformed)?);
                }
                params.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

                steps.push(store.resolve(entry.id(), &params)?);
            }

            stages.push(Stage::new(&stage.name, stage.extends.clone(), steps));
        }

        let pipeline = Pipeline::new(stages)?;

        Ok(LoadedPipeline {
            path: path.to_path_buf(),
            store,
            pipeline,
        })
    }
}

/// Load and build a pipeline definition in one go
pub fn load_pipeline(path: &Path, overrides: &Params) -> Result<LoadedPipeline> {
    PipelineDefinition::from_file(path)?.build(path, overrides)
}

/// Normalize parameter values to strings so `16` and `"16"` bind identically
pub fn normalize_params(
    values: &BTreeMap<String, toml::Value>,
) -> std::result::Result<Params, String> {
    values
        .iter()
        .map(|(name, value)| {
            normalize_value(value)
                .map(|v| (name.clone(), v))
                .ok_or_else(|| {
                    format!(
                        "parameter '{}' must be a string, number or boolean, got {}",
                        name,
                        value.type_str()
                    )
                })
        })
        .collect()
}

pub fn normalize_value(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVCONTAINER: &str = r#"
[params]
arch = "amd64"

[[step]]
id = "install-base-packages"
run = "apt-get install -y curl git"

[[step]]
id = "install-neovim"
run = "fetch nvim-{{version}}-{{arch}}"
outputs = ["opt/nvim"]

[[step]]
id = "install-node-tools"
run = "npm install -g typescript@{{ts}}"
env = { NODE_ENV = "production" }

[[stage]]
name = "override"
steps = ["install-base-packages"]

[[stage]]
name = "dev-deps"
extends = "override"
steps = [
  { use = "install-neovim", with = { version = "0.10.4" } },
  { use = "install-node-tools", with = { ts = 5 } },
]

[[stage]]
name = "final"
extends = "dev-deps"
"#;

    fn build(content: &str, overrides: &[(&str, &str)]) -> Result<LoadedPipeline> {
        let path = Path::new("pipeline.toml");
        let overrides: Params = overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineDefinition::parse(content, path)?.build(path, &overrides)
    }

    #[test]
    fn test_build_devcontainer_pipeline() {
        let loaded = build(DEVCONTAINER, &[]).unwrap();
        let stages = loaded.pipeline.stages();

        assert_eq!(stages.len(), 3);
        assert_eq!(stages[1].name, "dev-deps");
        assert_eq!(loaded.pipeline.step_count(), 3);

        let neovim = &stages[1].steps[0];
        assert_eq!(neovim.command(), "fetch nvim-0.10.4-amd64");
        assert_eq!(neovim.descriptor().outputs(), ["opt/nvim".to_string()]);

        // Integer binding normalized to a string
        let node = &stages[1].steps[1];
        assert_eq!(node.params()["ts"], "5");
        assert_eq!(node.command(), "npm install -g typescript@5");
    }

    #[test]
    fn test_overrides_beat_stage_bindings_and_defaults() {
        let loaded = build(DEVCONTAINER, &[("version", "0.9.5"), ("arch", "arm64")]).unwrap();
        let neovim = &loaded.pipeline.stages()[1].steps[0];
        assert_eq!(neovim.command(), "fetch nvim-0.9.5-arm64");
    }

    #[test]
    fn test_integer_and_string_bind_to_same_key() {
        let as_int = build(&DEVCONTAINER.replace("ts = 5", "ts = 16"), &[]).unwrap();
        let as_str = build(&DEVCONTAINER.replace("ts = 5", "ts = \"16\""), &[]).unwrap();

        assert_eq!(
            as_int.pipeline.stages()[1].steps[1].cache_key(),
            as_str.pipeline.stages()[1].steps[1].cache_key()
        );
    }

    #[test]
    fn test_missing_parameter() {
        let content = DEVCONTAINER.replace(", with = { version = \"0.10.4\" }", "");
        let err = build(&content, &[]).unwrap_err();
        assert!(matches!(
            err,
            StrataError::MissingParameter { ref step_id, ref parameter }
                if step_id == "install-neovim" && parameter == "version"
        ));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_duplicate_step_id() {
        let content = format!(
            "{}\n[[step]]\nid = \"install-neovim\"\nrun = \"true\"\n",
            DEVCONTAINER
        );
        let err = build(&content, &[]).unwrap_err();
        assert!(matches!(err, StrataError::DuplicateId(ref id) if id == "install-neovim"));
    }

    #[test]
    fn test_unknown_step_and_bad_ordering() {
        let err = build(
            &DEVCONTAINER.replace("steps = [\"install-base-packages\"]", "steps = [\"nope\"]"),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::UnknownStep(_)));

        let err = build(
            &DEVCONTAINER.replace("extends = \"dev-deps\"", "extends = \"override\""),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::StageOrdering(_)));
    }

    #[test]
    fn test_malformed_definitions() {
        for content in [
            "this is not toml",
            "[[stage]]\nname = \"a\"\nunknown = 1\n",
            "[params]\narch = [\"amd64\"]\n[[stage]]\nname = \"a\"\n",
            "",
        ] {
            let err = build(content, &[]).unwrap_err();
            assert!(
                matches!(err, StrataError::Definition { .. }),
                "expected definition error for {:?}, got {}",
                content,
                err
            );
            assert_eq!(err.exit_code(), 2);
        }
    }

    #[test]
    fn test_bad_expect_marker() {
        let content = DEVCONTAINER.replace(
            "outputs = [\"opt/nvim\"]",
            "outputs = [\"opt/nvim\"]\nexpect = \"md5:abc\"",
        );
        let err = build(&content, &[]).unwrap_err();
        assert!(err.to_string().contains("expect must look like"));
    }
}
