/// Configuration merger: CLI args > Env vars > Config file > Defaults
///
/// Parameters are layered on top of the pipeline's own `[params]` and stage
/// `with` bindings, lowest first:
/// 1. Config file `[params]`
/// 2. `STRATA_PARAM_<NAME>` environment variables
/// 3. `--arch` / `--version` (or `STRATA_ARCH` / `STRATA_VERSION`, handled by clap)
/// 4. `--param KEY=VALUE`
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::RunArgs;
use strata::config::StrataConfig;
use strata::pipeline::Params;
use strata::xdg;

/// Prefix of environment variables that bind parameters
pub const PARAM_ENV_PREFIX: &str = "STRATA_PARAM_";

/// Merged configuration for the run command
#[derive(Debug, Clone)]
pub struct MergedRunConfig {
    pub cache_dir: PathBuf,
    pub cache_enabled: bool,
    pub params: Params,
    pub shell: String,
    pub step_timeout: Option<Duration>,
    pub root: PathBuf,
}

impl MergedRunConfig {
    /// Merge configuration from CLI args, environment parameters and config file
    /// Precedence: CLI > env > config file > defaults
    pub fn merge(
        args: &RunArgs,
        file_config: Option<StrataConfig>,
        env_params: Params,
    ) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let mut params = file.params().context("Invalid [params] in config file")?;
        params.extend(env_params);
        if let Some(arch) = &args.arch {
            params.insert("arch".to_string(), arch.clone());
        }
        if let Some(version) = &args.version {
            params.insert("version".to_string(), version.clone());
        }
        params.extend(args.params.iter().cloned());

        Ok(Self {
            cache_dir: merged_cache_dir(args.cache_dir.as_ref(), &file),
            cache_enabled: !args.no_cache && file.cache.enabled,
            params,
            shell: file.execution.shell.clone(),
            step_timeout: file.step_timeout()?,
            root: args.root.clone(),
        })
    }
}

/// Cache directory for the cache maintenance commands
pub fn merged_cache_dir(cli: Option<&PathBuf>, file: &StrataConfig) -> PathBuf {
    cli.cloned()
        .or_else(|| file.cache.dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(xdg::cache_dir)
}

/// Collect `STRATA_PARAM_<NAME>` variables as lowercase parameter names
pub fn env_params<I>(vars: I) -> Params
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(PARAM_ENV_PREFIX)?;
            (!name.is_empty()).then(|| (name.to_lowercase(), value))
        })
        .collect()
}
