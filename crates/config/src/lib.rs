pub mod credentials;

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use credentials::{CredentialStore, normalize_credential_name};

/// Id of the distinguished decision model in the model registry.
pub const MASTER_MODEL_ID: &str = "masterModel";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Conductor".to_string(),
        }
    }
}

// ── LLM config ───────────────────────────────────────────────────────────────

/// Base model configuration.  Every entry in `[models.*]` is merged over
/// this, and it is the fallback when a request names no (or an unknown) model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    /// Credential pool used for this provider.  Empty means "no credential"
    /// (e.g. a local Ollama server).
    pub credential_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    pub system_prompt: Option<String>,
    /// `"json"` asks the provider for a JSON object response where supported.
    pub response_format: Option<String>,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    pub openai_base_url: String,
    pub openrouter_base_url: String,
    pub anthropic_base_url: String,
    /// Per-request timeout applied by every provider adapter.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            credential_name: "OPENAI_API_KEY".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
            top_p: None,
            system_prompt: None,
            response_format: None,
            ollama_base_url: "http://localhost:11434".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openrouter_base_url: "https://openrouter.ai/api/v1".to_string(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// A `[models.<id>]` table.  Unset fields inherit from `[llm]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelEntry {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub credential_name: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub system_prompt: Option<String>,
    pub response_format: Option<String>,
}

// ── Master model ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Route non-internal events through the decision model.
    pub enabled: bool,
    /// Custom decision prompt.  When unset the prompt is generated from the
    /// registered capability names and regenerated as capabilities change.
    pub system_prompt: Option<String>,
    /// Maximum simultaneous decision-model calls.  `0` means unbounded.
    pub max_concurrent: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            system_prompt: None,
            max_concurrent: 8,
        }
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub enabled: bool,
    /// Number of worker tasks pulling from the queue.
    pub concurrency: usize,
    /// Attempts per job when the submitter does not say otherwise.
    pub default_attempts: u32,
    pub backoff: BackoffKind,
    /// Base backoff delay between attempts.
    pub backoff_ms: u64,
    /// Completed and failed jobs kept for `job:status` / `job:result`
    /// lookups.  The oldest are forgotten first.
    pub retain_finished: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 2,
            default_attempts: 1,
            backoff: BackoffKind::Exponential,
            backoff_ms: 500,
            retain_finished: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// How many recently acknowledged event ids are remembered so a
    /// redelivered event is acknowledged again instead of re-executed.
    /// `0` disables deduplication.
    pub dedup_window: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { dedup_window: 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub socket_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/conductor.sock".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub models: BTreeMap<String, ModelEntry>,
    pub master: MasterConfig,
    /// Credential pools: pool name → keys.  A key written as `env:VAR` is
    /// read from the environment at startup.
    pub credentials: BTreeMap<String, Vec<String>>,
    pub jobs: JobsConfig,
    pub dispatch: DispatchConfig,
    pub gateway: GatewayConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.ollama_base_url = value;
            }
        }

        if let Ok(value) = env::var("CONDUCTOR_SOCKET") {
            if !value.is_empty() {
                config.gateway.socket_path = value;
            }
        }

        if let Ok(value) = env::var("CONDUCTOR_MASTER_ENABLED") {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.master.enabled = true,
                "0" | "false" | "no" | "off" => config.master.enabled = false,
                other => tracing::warn!(value = other, "ignoring unrecognised CONDUCTOR_MASTER_ENABLED"),
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Credential store built from `[credentials]` with `env:` references
    /// resolved.  Pools not listed here are still discovered from the
    /// environment on first use.
    pub fn credential_store(&self) -> CredentialStore {
        let mut store = CredentialStore::default();
        for (name, keys) in &self.credentials {
            let resolved = keys
                .iter()
                .filter_map(|key| match key.strip_prefix("env:") {
                    Some(var) => env::var(var).ok().filter(|v| !v.trim().is_empty()),
                    None => Some(key.clone()),
                })
                .collect::<Vec<_>>();
            store.insert_pool(name, resolved);
        }
        store
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.name, "Conductor");
        assert_eq!(cfg.llm.provider, "openai");
        assert_eq!(cfg.llm.credential_name, "OPENAI_API_KEY");
        assert_eq!(cfg.llm.ollama_base_url, "http://localhost:11434");
        assert!(cfg.master.enabled);
        assert_eq!(cfg.master.max_concurrent, 8);
        assert!(cfg.master.system_prompt.is_none());
        assert_eq!(cfg.jobs.backoff, BackoffKind::Exponential);
        assert_eq!(cfg.dispatch.dedup_window, 1024);
        assert_eq!(cfg.gateway.socket_path, "/tmp/conductor.sock");
        assert_eq!(cfg.telemetry.log_level, "info");
        assert!(cfg.models.is_empty());
    }

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.agent.name, "Conductor");
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[agent]
name = "Switchboard"

[llm]
provider = "anthropic"
model = "claude-3-5-haiku-latest"
credential_name = "ANTHROPIC_API_KEY"
temperature = 0.2

[models.summarizer]
model = "gpt-4o"
max_tokens = 256

[models.masterModel]
temperature = 0.0

[master]
max_concurrent = 2

[credentials]
BRAVE_SEARCH = ["key-a", "key-b"]

[jobs]
concurrency = 4
backoff = "fixed"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.agent.name, "Switchboard");
        assert_eq!(cfg.llm.provider, "anthropic");
        assert!((cfg.llm.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(cfg.models.len(), 2);
        let summarizer = &cfg.models["summarizer"];
        assert_eq!(summarizer.model.as_deref(), Some("gpt-4o"));
        assert_eq!(summarizer.max_tokens, Some(256));
        assert!(summarizer.provider.is_none());
        assert_eq!(cfg.models[MASTER_MODEL_ID].temperature, Some(0.0));
        assert_eq!(cfg.master.max_concurrent, 2);
        assert!(cfg.master.enabled);
        assert_eq!(cfg.credentials["BRAVE_SEARCH"], vec!["key-a", "key-b"]);
        assert_eq!(cfg.jobs.concurrency, 4);
        assert_eq!(cfg.jobs.backoff, BackoffKind::Fixed);
        // Unspecified sections keep their defaults.
        assert_eq!(cfg.dispatch.dedup_window, 1024);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.agent.name = "RoundTrip".to_string();
        cfg.master.system_prompt = Some("decide".to_string());
        cfg.models.insert(
            "fast".to_string(),
            ModelEntry {
                model: Some("gpt-4o-mini".to_string()),
                ..Default::default()
            },
        );

        cfg.save_to(&path).unwrap();
        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.agent.name, "RoundTrip");
        assert_eq!(loaded.master.system_prompt.as_deref(), Some("decide"));
        assert_eq!(loaded.models["fast"], cfg.models["fast"]);
    }

    #[test]
    fn backoff_kind_serde() {
        assert_eq!(serde_json::to_string(&BackoffKind::Fixed).unwrap(), "\"fixed\"");
        let back: BackoffKind = serde_json::from_str("\"exponential\"").unwrap();
        assert_eq!(back, BackoffKind::Exponential);
    }

    #[test]
    fn credential_store_resolves_env_references() {
        let mut cfg = AppConfig::default();
        cfg.credentials.insert(
            "search".to_string(),
            vec!["literal".to_string(), "env:CONDUCTOR_TEST_CRED_REF".to_string()],
        );

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("CONDUCTOR_TEST_CRED_REF", "from-env") };
        let store = cfg.credential_store();
        unsafe { env::remove_var("CONDUCTOR_TEST_CRED_REF") };

        assert_eq!(store.next("search").as_deref(), Some("literal"));
        assert_eq!(store.next("search").as_deref(), Some("from-env"));
        assert_eq!(store.next("search").as_deref(), Some("literal"));
    }

    #[test]
    fn env_socket_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(&path, "[gateway]\nsocket_path = \"/tmp/a.sock\"\n").unwrap();

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("CONDUCTOR_SOCKET", "/tmp/b.sock") };
        let cfg = AppConfig::load_from(&path).unwrap();
        unsafe { env::remove_var("CONDUCTOR_SOCKET") };
        assert_eq!(cfg.gateway.socket_path, "/tmp/b.sock");
    }
}
