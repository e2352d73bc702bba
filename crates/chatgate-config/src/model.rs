use chatgate_common::{ModelDescriptor, ProviderFamily};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.chatgate/config.yml` (or `.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub defaults: ConversationDefaults,

    /// Named role prompts selectable as a conversation's system prompt.
    #[serde(default)]
    pub roles: HashMap<String, String>,

    /// Credentials keyed by provider family tag (`openai`, `anthropic`, `aws`, ...).
    #[serde(default)]
    pub providers: HashMap<String, ProviderCredentials>,

    #[serde(default = "default_models")]
    pub models: Vec<ModelDescriptor>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log: LogConfig::default(),
            engine: EngineConfig::default(),
            defaults: ConversationDefaults::default(),
            roles: HashMap::new(),
            providers: HashMap::new(),
            models: default_models(),
        }
    }
}

impl AppConfig {
    pub fn model(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn role_prompt(&self, name: &str) -> Option<&str> {
        self.roles.get(name).map(String::as_str)
    }

    /// Credentials for a provider family, empty when none are configured.
    pub fn provider(&self, family: ProviderFamily) -> ProviderCredentials {
        self.providers
            .get(family.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Families referenced by at least one catalog entry.
    pub fn families_in_use(&self) -> Vec<ProviderFamily> {
        ProviderFamily::ALL
            .into_iter()
            .filter(|family| self.models.iter().any(|m| m.family == *family))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Knobs of the answer engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,

    /// Progress is pushed to the transport every N received text fragments.
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Newest live entries never folded into a summary.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,

    /// Catalog name of the cheap model used for summaries.
    #[serde(default = "default_model_name")]
    pub summary_model: String,

    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            progress_every: default_progress_every(),
            provider_timeout_secs: default_provider_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
            keep_recent: default_keep_recent(),
            summary_model: default_model_name(),
            summary_max_tokens: default_summary_max_tokens(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// Settings applied to newly created conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationDefaults {
    #[serde(default = "default_model_name")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default)]
    pub master_prompt: Option<String>,
}

impl Default for ConversationDefaults {
    fn default() -> Self {
        Self {
            model: default_model_name(),
            temperature: default_temperature(),
            retention_days: default_retention_days(),
            context_limit: default_context_limit(),
            streaming: true,
            master_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCredentials {
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl ProviderCredentials {
    /// Explicit key first, then the configured or conventional environment variable.
    pub fn resolve_api_key(&self, family: ProviderFamily) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        let var = self
            .api_key_env
            .clone()
            .or_else(|| default_key_env(family).map(str::to_string))?;
        std::env::var(var).ok().filter(|k| !k.is_empty())
    }
}

fn default_key_env(family: ProviderFamily) -> Option<&'static str> {
    match family {
        ProviderFamily::OpenAi | ProviderFamily::OpenAiResponses => Some("OPENAI_API_KEY"),
        ProviderFamily::Anthropic => Some("ANTHROPIC_API_KEY"),
        ProviderFamily::Aws => Some("AWS_BEARER_TOKEN_BEDROCK"),
        ProviderFamily::Local => None,
    }
}

fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatgate")
        .join("chatgate.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_tool_iterations() -> usize {
    10
}

fn default_progress_every() -> usize {
    10
}

fn default_provider_timeout_secs() -> u64 {
    300
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_keep_recent() -> usize {
    3
}

fn default_model_name() -> String {
    "gpt-4o-mini".to_string()
}

fn default_summary_max_tokens() -> u32 {
    500
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_temperature() -> f64 {
    0.7
}

fn default_retention_days() -> u32 {
    30
}

fn default_context_limit() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_models() -> Vec<ModelDescriptor> {
    let mut gpt_4o = ModelDescriptor::new("gpt-4o", "gpt-4o", ProviderFamily::OpenAiResponses);
    gpt_4o.search = Some("web_search_preview".to_string());

    let mut o3 = ModelDescriptor::new("o3", "o3", ProviderFamily::OpenAiResponses);
    o3.reasoning = true;

    let mut sonnet = ModelDescriptor::new(
        "sonnet",
        "claude-sonnet-4-20250514",
        ProviderFamily::Anthropic,
    );
    sonnet.search = Some("web_search_20250305".to_string());

    vec![
        ModelDescriptor::new("gpt-4o-mini", "gpt-4o-mini", ProviderFamily::OpenAi),
        gpt_4o,
        o3,
        sonnet,
        ModelDescriptor::new(
            "haiku",
            "claude-3-5-haiku-latest",
            ProviderFamily::Anthropic,
        ),
        ModelDescriptor::new("nova-pro", "amazon.nova-pro-v1:0", ProviderFamily::Aws),
        ModelDescriptor::new("llama3.1", "llama3.1", ProviderFamily::Local),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_policy() {
        let config = AppConfig::default();
        assert_eq!(config.engine.max_tool_iterations, 10);
        assert_eq!(config.engine.progress_every, 10);
        assert_eq!(config.defaults.context_limit, 100);
        assert!(config.model(&config.defaults.model).is_some());
        assert!(config.model(&config.engine.summary_model).is_some());
    }

    #[test]
    fn provider_lookup_falls_back_to_empty_credentials() {
        let mut config = AppConfig::default();
        config.providers.insert(
            "anthropic".to_string(),
            ProviderCredentials {
                api_key: Some("sk-ant".to_string()),
                ..ProviderCredentials::default()
            },
        );

        assert_eq!(
            config.provider(ProviderFamily::Anthropic).api_key.as_deref(),
            Some("sk-ant")
        );
        assert!(config.provider(ProviderFamily::Aws).api_key.is_none());
    }

    #[test]
    fn explicit_api_key_wins_over_env() {
        let creds = ProviderCredentials {
            api_key: Some("inline".to_string()),
            api_key_env: Some("CHATGATE_TEST_UNSET_KEY".to_string()),
            ..ProviderCredentials::default()
        };
        assert_eq!(
            creds.resolve_api_key(ProviderFamily::OpenAi).as_deref(),
            Some("inline")
        );

        let missing = ProviderCredentials {
            api_key_env: Some("CHATGATE_TEST_UNSET_KEY".to_string()),
            ..ProviderCredentials::default()
        };
        assert!(missing.resolve_api_key(ProviderFamily::OpenAi).is_none());
        assert!(
            ProviderCredentials::default()
                .resolve_api_key(ProviderFamily::Local)
                .is_none()
        );
    }

    #[test]
    fn families_in_use_follow_catalog() {
        let mut config = AppConfig::default();
        config.models = vec![ModelDescriptor::new(
            "llama",
            "llama3.1",
            ProviderFamily::Local,
        )];
        assert_eq!(config.families_in_use(), vec![ProviderFamily::Local]);
    }
}
