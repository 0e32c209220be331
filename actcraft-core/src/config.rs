//! Configuration for actcraft agents
//!
//! Loaded from a TOML file (`actcraft.toml` by default). Every field has a
//! default, so a missing or partial file is fine.

use crate::error::{self, Error, Result};
use crate::event::BudgetUnit;
use crate::optimizer::OptimizerConfig;
use crate::program::DEFAULT_INSTRUCTION;
use crate::provider::ProviderConfig;
use crate::reducer::{Budget, OverflowPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "actcraft.toml";
pub const DEFAULT_MAX_PARSE_RETRIES: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// Where programs and history are persisted
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// System instruction of the default program
    #[serde(default = "default_instruction")]
    pub instruction: String,

    #[serde(default)]
    pub reducer: ReducerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub provider: ProviderSettings,

    #[serde(default)]
    pub optimizer: OptimizerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReducerConfig {
    #[serde(default = "default_budget")]
    pub budget: usize,
    #[serde(default)]
    pub unit: BudgetUnit,
    #[serde(default)]
    pub policy: OverflowPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Corrective re-prompts after an unparseable completion
    #[serde(default = "default_max_parse_retries")]
    pub max_parse_retries: u32,
    /// Retries of transient provider failures
    #[serde(default = "default_max_provider_retries")]
    pub max_provider_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_max_demos")]
    pub max_demos: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<usize>,
    #[serde(default = "default_demo_counts")]
    pub demo_counts: Vec<usize>,
}

// Default value providers
fn default_agent_id() -> String {
    "default".to_string()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".actcraft")
}

fn default_instruction() -> String {
    DEFAULT_INSTRUCTION.to_string()
}

fn default_budget() -> usize {
    20
}

fn default_max_parse_retries() -> u32 {
    DEFAULT_MAX_PARSE_RETRIES
}

fn default_max_provider_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_demos() -> usize {
    4
}

fn default_demo_counts() -> Vec<usize> {
    vec![2, 4]
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            storage_dir: default_storage_dir(),
            instruction: default_instruction(),
            reducer: ReducerConfig::default(),
            retry: RetryConfig::default(),
            provider: ProviderSettings::default(),
            optimizer: OptimizerSettings::default(),
        }
    }
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            budget: default_budget(),
            unit: BudgetUnit::default(),
            policy: OverflowPolicy::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_parse_retries: default_max_parse_retries(),
            max_provider_retries: default_max_provider_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            temperature: None,
        }
    }
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            max_demos: default_max_demos(),
            min_score: None,
            sample_size: None,
            demo_counts: default_demo_counts(),
        }
    }
}

impl ReducerConfig {
    pub fn budget(&self) -> Budget {
        Budget {
            limit: self.budget,
            unit: self.unit,
        }
    }
}

impl RetryConfig {
    /// Capped exponential delay before provider retry `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}

impl ProviderSettings {
    /// Resolve into a provider configuration, reading the key from the environment
    pub fn to_provider_config(&self) -> ProviderConfig {
        let config = ProviderConfig::openai_compatible(&self.base_url, &self.model)
            .with_timeout(self.timeout_secs)
            .with_temperature(self.temperature);
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.is_empty() => config.with_api_key(key),
            _ => config,
        }
    }
}

impl AgentConfig {
    /// Load configuration from `path`, or use defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).with_context("path", path.display().to_string()))?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            Error::config_invalid(format!("failed to parse config file: {}", e))
                .with_context("path", path.display().to_string())
                .set_source(e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| error::serialization_error(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let id_ok = !self.agent_id.is_empty()
            && self
                .agent_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        if !id_ok {
            return Err(error::config_invalid(
                "agent_id",
                "agent_id must be non-empty and use only letters, digits, '-' or '_'",
            ));
        }
        if self.instruction.trim().is_empty() {
            return Err(error::config_invalid("instruction", "instruction must not be blank"));
        }
        if self.provider.base_url.trim().is_empty() {
            return Err(error::config_invalid("provider.base_url", "base_url must not be empty"));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(error::config_invalid(
                "retry.backoff_base_ms",
                "backoff_base_ms must not exceed backoff_max_ms",
            ));
        }
        if let Some(t) = self.provider.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(error::config_invalid("provider.temperature", "temperature must be within 0.0..=2.0"));
            }
        }
        if self.optimizer.min_score.is_some_and(|s| !s.is_finite()) {
            return Err(error::config_invalid("optimizer.min_score", "min_score must be finite"));
        }
        Ok(())
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            seed: self.optimizer.seed,
            budget: self.reducer.budget(),
            policy: self.reducer.policy,
            sample_size: self.optimizer.sample_size,
            max_demos: self.optimizer.max_demos,
            min_score: self.optimizer.min_score,
            demo_counts: self.optimizer.demo_counts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_or_default(&dir.path().join("actcraft.toml")).unwrap();
        assert_eq!(config.agent_id, "default");
        assert_eq!(config.retry.max_parse_retries, DEFAULT_MAX_PARSE_RETRIES);
        assert_eq!(config.reducer.budget(), Budget::items(20));
    }

    #[test]
    fn test_write_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("actcraft.toml");
        AgentConfig::write_default(&path).unwrap();

        let config = AgentConfig::load_or_default(&path).unwrap();
        assert_eq!(config.provider.model, "gpt-4o");
        assert_eq!(config.optimizer.demo_counts, vec![2, 4]);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actcraft.toml");
        std::fs::write(
            &path,
            "agent_id = \"bench-7\"\n[reducer]\nbudget = 4000\nunit = \"tokens\"\npolicy = \"summarize\"\n",
        )
        .unwrap();

        let config = AgentConfig::load_or_default(&path).unwrap();
        assert_eq!(config.agent_id, "bench-7");
        assert_eq!(config.reducer.budget(), Budget::tokens(4000));
        assert_eq!(config.reducer.policy, OverflowPolicy::Summarize);
        assert_eq!(config.retry.max_provider_retries, 3);
    }

    #[test]
    fn test_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actcraft.toml");
        std::fs::write(&path, "agent_id = \"../etc\"\n").unwrap();

        let err = AgentConfig::load_or_default(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert_eq!(err.context_value("field"), Some("agent_id"));

        std::fs::write(&path, "[reducer]\nbudget = \"lots\"\n").unwrap();
        let err = AgentConfig::load_or_default(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryConfig {
            backoff_base_ms: 500,
            backoff_max_ms: 3_000,
            ..Default::default()
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(500));
        assert_eq!(retry.backoff(2), Duration::from_millis(1_000));
        assert_eq!(retry.backoff(3), Duration::from_millis(2_000));
        assert_eq!(retry.backoff(4), Duration::from_millis(3_000));
        assert_eq!(retry.backoff(80), Duration::from_millis(3_000));
    }

    #[test]
    fn test_provider_settings_without_key() {
        let settings = ProviderSettings {
            api_key_env: "ACTCRAFT_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..Default::default()
        };
        let config = settings.to_provider_config();
        assert!(config.api_key.is_none());
        assert_eq!(config.base_url, "https://api.openai.com/v1");
    }
}
