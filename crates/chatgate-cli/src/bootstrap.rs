use anyhow::{Context, Result};
use chatgate_agents::providers::{
    AnthropicAdapter, BedrockAdapter, OllamaAdapter, OpenAiAdapter, OpenAiResponsesAdapter,
};
use chatgate_agents::tools::CurrentTime;
use chatgate_agents::{
    AnswerOrchestrator, ContextWindowManager, ConversationRegistry, ConversationTemplate,
    EngineSettings, ProviderAdapter, ProviderRegistry, SummarySettings, ToolRegistry,
};
use chatgate_common::{ProviderFamily, SystemPrompt};
use chatgate_config::{AppConfig, ConfigLoader};
use chatgate_db::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Everything a command needs, wired from one config.
pub struct Engine {
    pub config: AppConfig,
    pub store: Arc<SqliteStore>,
    pub providers: Arc<ProviderRegistry>,
    pub conversations: ConversationRegistry,
    pub orchestrator: Arc<AnswerOrchestrator>,
}

impl Engine {
    pub fn build(config: AppConfig) -> Result<Self> {
        let db_path = if config.database_path.is_absolute() {
            config.database_path.clone()
        } else {
            ConfigLoader::config_dir().join(&config.database_path)
        };
        let store = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("failed to open database {}", db_path.display()))?,
        );

        let providers = Arc::new(build_providers(&config));

        let mut tools = ToolRegistry::new(Duration::from_secs(config.engine.tool_timeout_secs));
        tools.register(Arc::new(CurrentTime));

        let context = ContextWindowManager::new(
            store.clone(),
            Arc::clone(&providers),
            SummarySettings {
                model: config.engine.summary_model.clone(),
                keep_recent: config.engine.keep_recent,
                max_tokens: config.engine.summary_max_tokens,
                timeout: Duration::from_secs(config.engine.provider_timeout_secs),
            },
        );

        let settings = EngineSettings {
            max_tool_iterations: config.engine.max_tool_iterations,
            progress_every: config.engine.progress_every,
            provider_timeout: Duration::from_secs(config.engine.provider_timeout_secs),
            max_output_tokens: config.engine.max_output_tokens,
        };
        let orchestrator = Arc::new(AnswerOrchestrator::new(
            Arc::clone(&providers),
            Arc::new(tools),
            Arc::new(context),
            store.clone(),
            settings,
        ));

        let conversations = ConversationRegistry::new(store.clone(), template(&config));

        Ok(Self {
            config,
            store,
            providers,
            conversations,
            orchestrator,
        })
    }
}

fn template(config: &AppConfig) -> ConversationTemplate {
    let defaults = &config.defaults;
    ConversationTemplate {
        model: defaults.model.clone(),
        temperature: defaults.temperature,
        retention_days: defaults.retention_days,
        context_limit: defaults.context_limit,
        streaming: defaults.streaming,
        system_prompt: defaults
            .master_prompt
            .clone()
            .map(|prompt| SystemPrompt::Master { prompt }),
    }
}

/// Register one adapter per family the catalog uses. Families without
/// credentials are skipped; their models then fail with `ProviderUnavailable`.
fn build_providers(config: &AppConfig) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new(config.models.clone());

    for family in config.families_in_use() {
        let creds = config.provider(family);
        let adapter: Option<Arc<dyn ProviderAdapter>> = match family {
            ProviderFamily::Local => Some(Arc::new(OllamaAdapter::new(creds.base_url.clone()))),
            ProviderFamily::OpenAi => creds.resolve_api_key(family).map(|key| {
                Arc::new(OpenAiAdapter::new(key, creds.base_url.clone())) as Arc<dyn ProviderAdapter>
            }),
            ProviderFamily::OpenAiResponses => creds.resolve_api_key(family).map(|key| {
                Arc::new(OpenAiResponsesAdapter::new(key, creds.base_url.clone()))
                    as Arc<dyn ProviderAdapter>
            }),
            ProviderFamily::Anthropic => creds.resolve_api_key(family).map(|key| {
                let adapter = AnthropicAdapter::new(key);
                let adapter = match creds.base_url.clone() {
                    Some(url) => adapter.with_base_url(url),
                    None => adapter,
                };
                Arc::new(adapter) as Arc<dyn ProviderAdapter>
            }),
            ProviderFamily::Aws => creds.resolve_api_key(family).map(|token| {
                Arc::new(BedrockAdapter::new(
                    token,
                    creds.region.clone(),
                    creds.base_url.clone(),
                )) as Arc<dyn ProviderAdapter>
            }),
        };

        match adapter {
            Some(adapter) => {
                info!(family = %family, "registered provider");
                registry.register(adapter);
            }
            None => warn!(
                family = %family,
                "no credentials configured, models of this family are unavailable"
            ),
        }
    }
    registry
}
