//! Configuration types.
//!
//! Everything is read from the environment once at startup. Tests build
//! configs through `from_lookup` with a map instead of mutating the process
//! environment.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::LlmBackend;

/// Which pipeline stages this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Decomposer,
    Executor,
    Gateway,
    All,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "decomposer" => Some(Self::Decomposer),
            "executor" => Some(Self::Executor),
            "gateway" => Some(Self::Gateway),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    pub fn runs_decomposer(&self) -> bool {
        matches!(self, Self::Decomposer | Self::All)
    }

    pub fn runs_executor(&self) -> bool {
        matches!(self, Self::Executor | Self::All)
    }

    pub fn runs_gateway(&self) -> bool {
        matches!(self, Self::Gateway | Self::All)
    }
}

/// Poll-loop backoff after a caught fault.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// Fraction of the delay added as random jitter (0.0 disables).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            jitter: 0.1,
        }
    }
}

/// Limits and defaults used by the action handlers.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub navigate_timeout: Duration,
    /// Base URL of the search view; the query goes in `q`.
    pub search_url: String,
    /// How long to wait for result markers to render.
    pub search_wait: Duration,
    pub search_selector: String,
    pub search_result_cap: usize,
    pub extract_default_selector: String,
    pub extract_max_chars: usize,
    pub summarize_max_chars: usize,
    pub summarize_timeout: Duration,
    /// Hard ceiling on any one subtask, enforced by the executor.
    pub subtask_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            navigate_timeout: Duration::from_secs(15),
            search_url: "https://www.google.com/search".to_string(),
            search_wait: Duration::from_secs(5),
            search_selector: "h3".to_string(),
            search_result_cap: 5,
            extract_default_selector: "body".to_string(),
            extract_max_chars: 2000,
            summarize_max_chars: 3000,
            summarize_timeout: Duration::from_secs(30),
            subtask_timeout: Duration::from_secs(60),
        }
    }
}

/// LLM access settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub backend: LlmBackend,
    pub api_key: Option<SecretString>,
    pub model: String,
    /// Remote summarization engine; executors call it instead of the LLM.
    pub engine_url: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            backend: LlmBackend::OpenAi,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            engine_url: None,
        }
    }
}

/// Headless Chromium launch settings.
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    /// Chromium binary; auto-detected when unset.
    pub executable: Option<String>,
    /// Download Chromium here when no executable is given.
    pub download_dir: Option<String>,
    /// Bound on any single DevTools command other than navigation.
    pub command_timeout: Duration,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            executable: None,
            download_dir: None,
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub role: Role,
    /// Shared store address; `None` runs on the in-process store.
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub poll_timeout: Duration,
    pub backoff: BackoffConfig,
    pub decomposers: usize,
    pub executors: usize,
    pub llm: LlmSettings,
    pub browser: BrowserSettings,
    pub handlers: HandlerConfig,
    pub http_port: u16,
    pub log_dir: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            role: Role::All,
            redis_url: None,
            key_prefix: String::new(),
            poll_timeout: Duration::from_secs(2),
            backoff: BackoffConfig::default(),
            decomposers: 1,
            executors: 1,
            llm: LlmSettings::default(),
            browser: BrowserSettings::default(),
            handlers: HandlerConfig::default(),
            http_port: 8001,
            log_dir: None,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset and empty values take the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let role = match get("TASK_RELAY_ROLE") {
            Some(raw) => Role::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "TASK_RELAY_ROLE".to_string(),
                message: format!("expected decomposer, executor, gateway or all, got {raw:?}"),
            })?,
            None => defaults.role,
        };

        let backend = match get("LLM_BACKEND") {
            Some(raw) => LlmBackend::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "LLM_BACKEND".to_string(),
                message: format!("expected openai or anthropic, got {raw:?}"),
            })?,
            None => defaults.llm.backend,
        };
        let api_key = get("LLM_API_KEY")
            .or_else(|| get(backend.key_env_var()))
            .map(SecretString::from);

        let backoff = BackoffConfig {
            initial: Duration::from_millis(parse_or(
                &get,
                "TASK_RELAY_BACKOFF_INITIAL_MS",
                1000,
            )?),
            max: Duration::from_millis(parse_or(&get, "TASK_RELAY_BACKOFF_MAX_MS", 30_000)?),
            ..defaults.backoff
        };
        if backoff.max < backoff.initial {
            return Err(ConfigError::InvalidValue {
                key: "TASK_RELAY_BACKOFF_MAX_MS".to_string(),
                message: "must not be smaller than TASK_RELAY_BACKOFF_INITIAL_MS".to_string(),
            });
        }

        let handlers = HandlerConfig {
            search_url: get("TASK_RELAY_SEARCH_URL").unwrap_or(defaults.handlers.search_url),
            ..HandlerConfig::default()
        };

        Ok(Self {
            role,
            redis_url: get("REDIS_URL"),
            key_prefix: get("TASK_RELAY_KEY_PREFIX").unwrap_or_default(),
            poll_timeout: Duration::from_secs(parse_or(&get, "TASK_RELAY_POLL_TIMEOUT_SECS", 2)?),
            backoff,
            decomposers: parse_or(&get, "TASK_RELAY_DECOMPOSERS", 1)?,
            executors: parse_or(&get, "TASK_RELAY_EXECUTORS", 1)?,
            llm: LlmSettings {
                backend,
                api_key,
                model: get("LLM_MODEL").unwrap_or(defaults.llm.model),
                engine_url: get("LLM_ENGINE_URL"),
            },
            browser: BrowserSettings {
                executable: get("CHROME_EXECUTABLE"),
                download_dir: get("TASK_RELAY_CHROMIUM_DIR"),
                command_timeout: Duration::from_secs(parse_or(
                    &get,
                    "TASK_RELAY_BROWSER_TIMEOUT_SECS",
                    30,
                )?),
            },
            handlers,
            http_port: parse_or(&get, "TASK_RELAY_HTTP_PORT", 8001)?,
            log_dir: get("TASK_RELAY_LOG_DIR"),
        })
    }

    /// Whether this process needs direct LLM access. The gateway only
    /// uses it for `/summarize` and serves 503 there without one.
    pub fn needs_llm(&self) -> bool {
        self.role.runs_decomposer() || (self.role.runs_executor() && self.llm.engine_url.is_none())
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<RelayConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.role, Role::All);
        assert!(config.redis_url.is_none());
        assert_eq!(config.poll_timeout, Duration::from_secs(2));
        assert_eq!(config.backoff.initial, Duration::from_secs(1));
        assert_eq!(config.backoff.max, Duration::from_secs(30));
        assert_eq!(config.http_port, 8001);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert!(config.llm.api_key.is_none());
        assert_eq!(config.handlers.extract_max_chars, 2000);
        assert_eq!(config.handlers.summarize_max_chars, 3000);
    }

    #[test]
    fn reads_overrides() {
        let config = from_pairs(&[
            ("TASK_RELAY_ROLE", "executor"),
            ("REDIS_URL", "redis://cache:6379"),
            ("TASK_RELAY_EXECUTORS", "4"),
            ("LLM_ENGINE_URL", "http://engine:8001"),
            ("TASK_RELAY_SEARCH_URL", "https://duckduckgo.com/html/"),
            ("CHROME_EXECUTABLE", "/usr/bin/chromium"),
            ("TASK_RELAY_BROWSER_TIMEOUT_SECS", "10"),
        ])
        .unwrap();
        assert_eq!(config.browser.executable.as_deref(), Some("/usr/bin/chromium"));
        assert!(config.browser.download_dir.is_none());
        assert_eq!(config.browser.command_timeout, Duration::from_secs(10));
        assert_eq!(config.role, Role::Executor);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.executors, 4);
        assert_eq!(config.handlers.search_url, "https://duckduckgo.com/html/");
        assert!(!config.needs_llm());
    }

    #[test]
    fn api_key_falls_back_to_backend_variable() {
        let config = from_pairs(&[
            ("LLM_BACKEND", "anthropic"),
            ("ANTHROPIC_API_KEY", "sk-ant-test"),
        ])
        .unwrap();
        assert_eq!(config.llm.backend, LlmBackend::Anthropic);
        assert_eq!(
            config.llm.api_key.as_ref().unwrap().expose_secret(),
            "sk-ant-test"
        );
    }

    #[test]
    fn missing_key_is_not_a_parse_error() {
        let config = from_pairs(&[]).unwrap();
        assert!(config.needs_llm());
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn gateway_runs_without_llm_key() {
        let config = from_pairs(&[("TASK_RELAY_ROLE", "gateway")]).unwrap();
        assert!(config.role.runs_gateway());
        assert!(!config.needs_llm());
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(matches!(
            from_pairs(&[("TASK_RELAY_ROLE", "scheduler")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            from_pairs(&[("TASK_RELAY_HTTP_PORT", "eighty")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            from_pairs(&[
                ("TASK_RELAY_BACKOFF_INITIAL_MS", "5000"),
                ("TASK_RELAY_BACKOFF_MAX_MS", "100"),
            ]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
