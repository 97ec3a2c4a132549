use crate::agent::{AgentConfig, LoopDetectionConfig, ServiceSettings};
use crate::browser::{ExecutorConfig, ObservationConfig};
use crate::emitter::EmitterConfig;
use crate::providers::{ClientOptions, ModelRegistry, ModelSpec};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "WEBPILOT_CONFIG";

const MAX_STEPS_BOUND: u32 = 100;
const MAX_PROVIDER_RETRIES: u32 = 10;

#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where this config was read from. Computed, never serialized.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
    /// Provider key used when a request carries none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Model id used by the CLI when `--model` is omitted.
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub observation: ObservationConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub loop_detection: LoopDetectionConfig,
    #[serde(default)]
    pub emitter: EmitterConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    /// Extra registry entries, merged over the built-in ones.
    #[serde(default)]
    pub models: Vec<ModelSpec>,
}

fn default_model() -> String {
    "claude-sonnet-4".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: None,
            api_key: None,
            default_model: default_model(),
            agent: AgentConfig::default(),
            reliability: ReliabilityConfig::default(),
            observation: ObservationConfig::default(),
            executor: ExecutorConfig::default(),
            loop_detection: LoopDetectionConfig::default(),
            emitter: EmitterConfig::default(),
            browser: BrowserConfig::default(),
            models: Vec::new(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("config_path", &self.config_path)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("default_model", &self.default_model)
            .field("agent", &self.agent)
            .field("reliability", &self.reliability)
            .field("observation", &self.observation)
            .field("executor", &self.executor)
            .field("loop_detection", &self.loop_detection)
            .field("emitter", &self.emitter)
            .field("browser", &self.browser)
            .field("models", &self.models)
            .finish()
    }
}

/// `[reliability]` section: provider retries and request timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Retries after the first attempt for retryable provider errors.
    #[serde(default = "default_provider_retries")]
    pub provider_retries: u32,
    /// Base backoff (ms); doubles per attempt.
    #[serde(default = "default_provider_backoff_ms")]
    pub provider_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_provider_retries() -> u32 {
    2
}

fn default_provider_backoff_ms() -> u64 {
    1_000
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            provider_retries: default_provider_retries(),
            provider_backoff_ms: default_provider_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// `[browser]` section for the WebDriver backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    #[serde(default = "default_true")]
    pub headless: bool,
}

fn default_webdriver_url() -> String {
    "http://127.0.0.1:9515".into()
}

fn default_true() -> bool {
    true
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: default_webdriver_url(),
            headless: true,
        }
    }
}

fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "webpilot", "webpilot")
        .context("Could not determine the user config directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}

/// Explicit path first, then `WEBPILOT_CONFIG`, then the per-user default.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    default_config_path()
}

impl Config {
    /// Load, apply environment overrides and validate. A missing file is not
    /// an error; defaults are used instead.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = resolve_config_path(explicit)?;
        let mut config = Self::load_file(&path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Read one file without env overrides or validation.
    pub async fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = fs::metadata(path).await {
                if meta.permissions().mode() & 0o004 != 0 {
                    tracing::warn!(
                        "Config file {:?} is world-readable (mode {:o}). \
                         Consider restricting with: chmod 600 {:?}",
                        path,
                        meta.permissions().mode() & 0o777,
                        path,
                    );
                }
            }
        }

        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_model.trim().is_empty() {
            anyhow::bail!("default_model must not be empty");
        }

        // Agent
        if self.agent.max_steps == 0 || self.agent.max_steps > MAX_STEPS_BOUND {
            anyhow::bail!(
                "agent.max_steps must be between 1 and {MAX_STEPS_BOUND}, got {}",
                self.agent.max_steps
            );
        }
        if self.agent.max_history_messages < 4 {
            anyhow::bail!("agent.max_history_messages must be at least 4");
        }

        // Reliability
        if self.reliability.provider_retries > MAX_PROVIDER_RETRIES {
            anyhow::bail!("reliability.provider_retries must be at most {MAX_PROVIDER_RETRIES}");
        }
        if self.reliability.request_timeout_secs == 0 {
            anyhow::bail!("reliability.request_timeout_secs must be greater than 0");
        }

        // Executor
        let fraction = self.executor.scroll_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            anyhow::bail!("executor.scroll_fraction must be in (0, 1], got {fraction}");
        }

        if self.executor.action_timeout_ms == 0 {
            anyhow::bail!("executor.action_timeout_ms must be greater than 0");
        }

        // Observation
        if self.observation.max_elements == 0 {
            anyhow::bail!("observation.max_elements must be greater than 0");
        }
        if self.observation.action_timeout_ms == 0 {
            anyhow::bail!("observation.action_timeout_ms must be greater than 0");
        }

        // Emitter
        if self.emitter.max_attempts == 0 {
            anyhow::bail!("emitter.max_attempts must be at least 1");
        }

        for (i, model) in self.models.iter().enumerate() {
            if model.id.trim().is_empty() {
                anyhow::bail!("models[{i}].id must not be empty");
            }
            if model.api_model.trim().is_empty() {
                anyhow::bail!("models[{i}].api_model must not be empty");
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("WEBPILOT_API_KEY") {
            if !key.is_empty() {
                self.api_key = Some(key);
            }
        }

        if let Ok(model) = std::env::var("WEBPILOT_MODEL") {
            if !model.is_empty() {
                self.default_model = model;
            }
        }

        if let Ok(steps) = std::env::var("WEBPILOT_MAX_STEPS") {
            match steps.trim().parse::<u32>() {
                Ok(steps) => self.agent.max_steps = steps,
                Err(_) if steps.is_empty() => {}
                Err(_) => tracing::warn!(value = %steps, "Ignoring invalid WEBPILOT_MAX_STEPS"),
            }
        }

        if let Ok(url) = std::env::var("WEBPILOT_WEBDRIVER_URL") {
            if !url.is_empty() {
                self.browser.webdriver_url = url;
            }
        }

        if let Ok(headless) = std::env::var("WEBPILOT_HEADLESS") {
            match headless.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.browser.headless = true,
                "0" | "false" | "no" | "off" => self.browser.headless = false,
                _ => {}
            }
        }
    }

    /// Built-in registry with this config's `[[models]]` merged in.
    pub fn registry(&self) -> ModelRegistry {
        ModelRegistry::builtin().with_models(self.models.iter().cloned())
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            api_key: self.api_key.clone().unwrap_or_default(),
            request_timeout_secs: self.reliability.request_timeout_secs,
            max_retries: self.reliability.provider_retries,
            base_backoff_ms: self.reliability.provider_backoff_ms,
            ..ClientOptions::default()
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            agent: self.agent.clone(),
            executor: self.executor.clone(),
            observation: self.observation.clone(),
            loop_detection: self.loop_detection.clone(),
            emitter: self.emitter.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.agent.max_steps, 30);
        assert_eq!(config.reliability.provider_retries, 2);
        assert_eq!(config.browser.webdriver_url, "http://127.0.0.1:9515");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
default_model = "gpt-4o"

[agent]
max_steps = 12

[loop_detection]
scroll_threshold = 5

[[models]]
id = "local-vision"
api_model = "llava"
provider = "openai"
input_cost_per_mtok = 0.0
output_cost_per_mtok = 0.0
max_context_tokens = 32000
base_url = "http://localhost:8000/v1"
"#,
        )
        .unwrap();

        assert_eq!(config.default_model, "gpt-4o");
        assert_eq!(config.agent.max_steps, 12);
        assert_eq!(config.agent.max_history_messages, 20);
        assert_eq!(config.loop_detection.scroll_threshold, 5);
        assert_eq!(config.loop_detection.click_threshold, 3);
        assert_eq!(config.executor.scroll_fraction, 0.8);

        let registry = config.registry();
        let custom = registry.get("local-vision").unwrap();
        assert_eq!(custom.provider, ProviderKind::OpenAi);
        assert!(custom.supports_element_labels);
        assert!(registry.get("claude-sonnet-4").is_some());
    }

    #[test]
    fn validate_rejects_out_of_bounds() {
        let mut config = Config::default();
        config.agent.max_steps = 101;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.executor.scroll_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.emitter.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.executor.action_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.observation.action_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reliability.provider_retries = 11;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_file(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.default_model, "claude-sonnet-4");
        assert!(config.config_path.is_none());
    }

    #[tokio::test]
    async fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webpilot.toml");
        std::fs::write(&path, "[emitter]\nmax_attempts = 5\n").unwrap();

        let config = Config::load_file(&path).await.unwrap();
        assert_eq!(config.emitter.max_attempts, 5);
        assert_eq!(config.emitter.backoff_ms, 500);
        assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[agent\nmax_steps = ").unwrap();
        let err = Config::load_file(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn explicit_path_wins() {
        let path = resolve_config_path(Some(Path::new("/tmp/custom.toml"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = Config {
            api_key: Some("sk-secret-value".into()),
            ..Config::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret-value"));
        assert!(rendered.contains("<redacted>"));
    }
}
