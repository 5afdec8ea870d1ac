//! Run configuration helpers.
//!
//! A run is driven by a JSON document (`restcov.json`) whose omitted fields
//! take defaults; CLI flags override individual values after loading.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const TOOL_COMMAND_ENV: &str = "RESTCOV_TOOL_COMMAND";
pub const LM_COMMAND_ENV: &str = "RESTCOV_LM_COMMAND";
pub const DEFAULT_TOOL_COMMAND: &str =
    "java -Dalgo={algo} -Ddoi={strength} -Doutput=csv -jar acts.jar {input} {output}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub schema_version: u32,
    /// Server under test; falls back to the description's first server.
    pub base_url: Option<String>,
    pub sequence_strength: usize,
    pub ca_strength: usize,
    pub budget_seconds: u64,
    pub request_timeout_ms: u64,
    /// Response chains tried per operation.
    pub chain_retries: usize,
    /// Response chains kept per sequence prefix.
    pub chain_capacity: usize,
    pub tool_command: String,
    pub lm_command: Option<String>,
    pub oracle_max_calls: usize,
    /// Sent with every request (auth tokens and the like).
    pub headers: BTreeMap<String, String>,
    pub seed: Option<u64>,
    pub cleanup: bool,
    pub match_accept: f64,
    pub match_reject: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        default_config()
    }
}

impl RunConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Fill unset commands from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(command) = std::env::var(TOOL_COMMAND_ENV) {
            if !command.trim().is_empty() && self.tool_command == DEFAULT_TOOL_COMMAND {
                self.tool_command = command;
            }
        }
        if self.lm_command.is_none() {
            self.lm_command = std::env::var(LM_COMMAND_ENV)
                .ok()
                .filter(|command| !command.trim().is_empty());
        }
    }
}

/// Defaults used when a config file omits a field (or none is given).
pub fn default_config() -> RunConfig {
    RunConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        base_url: None,
        sequence_strength: 2,
        ca_strength: 2,
        budget_seconds: 3600,
        request_timeout_ms: 10_000,
        chain_retries: 3,
        chain_capacity: 10,
        tool_command: DEFAULT_TOOL_COMMAND.to_string(),
        lm_command: None,
        oracle_max_calls: 20,
        headers: BTreeMap::new(),
        seed: None,
        cleanup: false,
        match_accept: 0.9,
        match_reject: 0.5,
    }
}

/// Starting point written by `init-config`.
pub fn stub_config() -> RunConfig {
    let mut config = default_config();
    config.base_url = Some("http://localhost:8080".to_string());
    config
}

pub fn load_config(path: &Path) -> Result<RunConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: RunConfig = serde_json::from_slice(&bytes).context("parse run config JSON")?;
    Ok(config)
}

/// Persist a config in a stable JSON format.
pub fn write_config(path: &Path, config: &RunConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(config).context("serialize run config")?;
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Validate ranges and the tool binary. `check_tool` is off for commands
/// that never reach the covering-array tool.
pub fn validate_config(config: &RunConfig, check_tool: bool) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported run config schema_version {}",
            config.schema_version
        ));
    }
    if config.sequence_strength == 0 || config.ca_strength == 0 {
        return Err(anyhow!("strengths must be at least 1"));
    }
    if config.budget_seconds == 0 {
        return Err(anyhow!("budget_seconds must be positive"));
    }
    if config.request_timeout_ms == 0 {
        return Err(anyhow!("request_timeout_ms must be positive"));
    }
    if config.chain_retries == 0 || config.chain_capacity == 0 {
        return Err(anyhow!("chain_retries and chain_capacity must be positive"));
    }
    if !(0.0..=1.0).contains(&config.match_reject)
        || !(0.0..=1.0).contains(&config.match_accept)
        || config.match_reject > config.match_accept
    {
        return Err(anyhow!(
            "thresholds must satisfy 0 <= match_reject <= match_accept <= 1 (got {} and {})",
            config.match_reject,
            config.match_accept
        ));
    }
    if let Some(base_url) = config.base_url.as_deref() {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(anyhow!("base_url must be an http(s) URL (got {base_url:?})"));
        }
    }
    if check_tool {
        let args = shell_words::split(&config.tool_command)
            .with_context(|| format!("parse tool_command: {}", config.tool_command))?;
        let program = args
            .first()
            .ok_or_else(|| anyhow!("tool_command must be non-empty"))?;
        which::which(program)
            .with_context(|| format!("covering-array tool {program:?} not found on PATH"))?;
    }
    Ok(())
}

/// Default output directory for a run titled `title`.
pub fn default_out_dir(title: &str) -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .ok_or_else(|| anyhow!("no local data directory; pass --out"))?;
    Ok(base.join("restcov").join("runs").join(title))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
