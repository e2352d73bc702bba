use chatgate_common::{Error, ModelDescriptor, ProviderFamily, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::providers::ProviderAdapter;

/// Model catalog plus one adapter per provider family. The single dispatch point
/// from a conversation's model name to the adapter that serves it.
pub struct ProviderRegistry {
    models: Vec<ModelDescriptor>,
    adapters: HashMap<ProviderFamily, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        Self {
            models,
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter, replacing any earlier one for the same family.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        let family = adapter.family();
        info!("registered provider adapter: {family}");
        self.adapters.insert(family, adapter);
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn model(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn has_adapter(&self, family: ProviderFamily) -> bool {
        self.adapters.contains_key(&family)
    }

    pub fn resolve(&self, model_name: &str) -> Result<(ModelDescriptor, Arc<dyn ProviderAdapter>)> {
        let model = self
            .model(model_name)
            .ok_or_else(|| Error::NotFound(format!("model '{model_name}' is not in the catalog")))?;
        let adapter = self.adapters.get(&model.family).ok_or_else(|| {
            Error::ProviderUnavailable(format!(
                "no adapter configured for provider family '{}'",
                model.family
            ))
        })?;
        Ok((model.clone(), Arc::clone(adapter)))
    }

    /// Health-check every registered adapter concurrently.
    pub async fn health_check_all(&self) -> Vec<(ProviderFamily, bool)> {
        let checks = self.adapters.iter().map(|(family, adapter)| async move {
            let ok = adapter.health_check().await.unwrap_or(false);
            (*family, ok)
        });

        let mut results = join_all(checks).await;
        results.sort_by_key(|(family, _)| family.as_str());
        results
    }
}
