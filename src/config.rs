use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::pipeline::definition::normalize_params;
use crate::pipeline::Params;

/// Strata configuration (loaded from TOML file)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StrataConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    /// Parameter values applied to every run (override pipeline defaults)
    #[serde(default)]
    pub params: BTreeMap<String, toml::Value>,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Step cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache directory path (defaults to the XDG cache dir)
    pub dir: Option<String>,

    /// Set to false to run without reading or writing the cache
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            enabled: true,
        }
    }
}

/// Step execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Shell used as `<shell> -c <command>`
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Per-step timeout (e.g., "30s", "10m", "1h")
    pub step_timeout: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            step_timeout: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_shell() -> String {
    "sh".to_string()
}

impl StrataConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: StrataConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.execution.shell.trim().is_empty() {
            anyhow::bail!("execution.shell must not be empty");
        }

        if let Some(timeout) = &self.execution.step_timeout {
            parse_duration(timeout).context("execution.step_timeout is invalid")?;
        }

        normalize_params(&self.params).map_err(|e| anyhow!(e))?;

        Ok(())
    }

    /// Config-file parameters, normalized to strings
    pub fn params(&self) -> Result<Params> {
        normalize_params(&self.params).map_err(|e| anyhow!(e))
    }

    pub fn step_timeout(&self) -> Result<Option<Duration>> {
        self.execution
            .step_timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
    }
}

/// Parse duration string (e.g., "30s", "10m", "1h", "1d")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let Some(unit) = s.chars().last() else {
        return Err(anyhow!("Empty duration string"));
    };

    let num: u64 = s[..s.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| anyhow!("Invalid duration: {}", s))?;

    let multiplier: u64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        _ => return Err(anyhow!("Invalid duration unit: {}. Use: s, m, h, d", unit)),
    };
    let seconds = num
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("Duration too large: {}", s))?;

    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = StrataConfig::default();
        assert!(config.cache.enabled);
        assert!(config.cache.dir.is_none());
        assert_eq!(config.execution.shell, "sh");
        assert!(config.validate().is_ok());
        assert_eq!(config.step_timeout().unwrap(), None);
    }

    #[test]
    fn test_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("strata.toml");
        fs::write(
            &path,
            r#"
[cache]
dir = "/var/cache/strata"

[params]
arch = "arm64"
node = 20

[execution]
shell = "bash"
step_timeout = "10m"
"#,
        )
        .unwrap();

        let config = StrataConfig::from_file(&path).unwrap();
        assert_eq!(config.cache.dir.as_deref(), Some("/var/cache/strata"));
        assert_eq!(config.execution.shell, "bash");
        assert_eq!(
            config.step_timeout().unwrap(),
            Some(Duration::from_secs(600))
        );

        let params = config.params().unwrap();
        assert_eq!(params["arch"], "arm64");
        assert_eq!(params["node"], "20");
    }

    #[test]
    fn test_invalid_config() {
        let mut config = StrataConfig::default();
        config.execution.step_timeout = Some("soon".to_string());
        assert!(config.validate().is_err());

        let mut config = StrataConfig::default();
        config.execution.shell = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5w").is_err());
        assert!(parse_duration("é").is_err());
    }

    #[test]
    fn test_parse_duration_overflow_is_an_error() {
        assert!(parse_duration("999999999999999d").is_err());
        assert!(parse_duration("18446744073709551615m").is_err());

        let mut config = StrataConfig::default();
        config.execution.step_timeout = Some("999999999999999d".to_string());
        assert!(config.validate().is_err());
    }
}
