//! Diagnosis configuration stored as TOML (default `rca.toml`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default sandbox setup: pandas with a wide, column-bounded display.
pub const DEFAULT_SETUP_CODE: &str = "import pandas as pd\n\
pd.set_option('display.width', 427)\n\
pd.set_option('display.max_columns', 10)\n";

/// Diagnosis configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values the
/// batch driver runs with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RcaConfig {
    /// Loop iterations before a final answer is forced.
    pub max_step: u32,

    /// Sampling temperature for every reasoning-engine call.
    pub temperature: f32,

    pub engine: EngineConfig,
    pub executor: ExecutorConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// OpenAI-compatible API root; `/chat/completions` is appended.
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Code generation attempts per instruction, including self-corrections.
    pub max_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter used for the persistent sandbox process.
    pub python: String,
    pub cell_timeout_secs: u64,
    /// Captured output beyond this many bytes per cell is dropped.
    pub output_limit_bytes: usize,
    pub setup_code: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            cell_timeout_secs: 300,
            output_limit_bytes: 20_000,
            setup_code: DEFAULT_SETUP_CODE.to_string(),
        }
    }
}

impl Default for RcaConfig {
    fn default() -> Self {
        Self {
            max_step: 25,
            temperature: 0.0,
            engine: EngineConfig::default(),
            executor: ExecutorConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RcaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_step == 0 {
            return Err(anyhow!("max_step must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(anyhow!("temperature must be within 0.0..=2.0"));
        }
        if self.engine.base_url.trim().is_empty() {
            return Err(anyhow!("engine.base_url must be non-empty"));
        }
        if self.engine.model.trim().is_empty() {
            return Err(anyhow!("engine.model must be non-empty"));
        }
        if self.engine.api_key_env.trim().is_empty() {
            return Err(anyhow!("engine.api_key_env must be non-empty"));
        }
        if self.engine.request_timeout_secs == 0 {
            return Err(anyhow!("engine.request_timeout_secs must be > 0"));
        }
        if self.executor.max_attempts == 0 {
            return Err(anyhow!("executor.max_attempts must be > 0"));
        }
        if self.sandbox.python.trim().is_empty() {
            return Err(anyhow!("sandbox.python must be non-empty"));
        }
        if self.sandbox.cell_timeout_secs == 0 {
            return Err(anyhow!("sandbox.cell_timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RcaConfig::default()`.
pub fn load_config(path: &Path) -> Result<RcaConfig> {
    if !path.exists() {
        let cfg = RcaConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RcaConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RcaConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
