use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Wire protocol family a model is served through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderFamily {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "aws")]
    Aws,
    #[serde(rename = "local")]
    Local,
}

impl ProviderFamily {
    pub const ALL: [ProviderFamily; 5] = [
        ProviderFamily::OpenAi,
        ProviderFamily::OpenAiResponses,
        ProviderFamily::Anthropic,
        ProviderFamily::Aws,
        ProviderFamily::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::OpenAi => "openai",
            ProviderFamily::OpenAiResponses => "openai-responses",
            ProviderFamily::Anthropic => "anthropic",
            ProviderFamily::Aws => "aws",
            ProviderFamily::Local => "local",
        }
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderFamily::ALL
            .into_iter()
            .find(|family| family.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown provider family '{s}'")))
    }
}

/// Static catalog record describing one selectable model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Name users select the model by.
    pub name: String,
    /// Identifier sent to the provider API.
    pub id: String,
    pub family: ProviderFamily,
    /// Built-in search tool tag understood by the provider, if any.
    #[serde(default)]
    pub search: Option<String>,
    /// Reasoning models reject a sampling temperature.
    #[serde(default)]
    pub reasoning: bool,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, id: impl Into<String>, family: ProviderFamily) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            family,
            search: None,
            reasoning: false,
        }
    }

    /// Temperature to send, or `None` when the model does not accept one.
    pub fn effective_temperature(&self, requested: f64) -> Option<f64> {
        if self.reasoning { None } else { Some(requested) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_tags_round_trip_through_from_str() {
        for family in ProviderFamily::ALL {
            assert_eq!(family.as_str().parse::<ProviderFamily>().unwrap(), family);
        }
        assert!("vertex".parse::<ProviderFamily>().is_err());
    }

    #[test]
    fn reasoning_models_suppress_temperature() {
        let mut model = ModelDescriptor::new("o3", "o3", ProviderFamily::OpenAiResponses);
        assert_eq!(model.effective_temperature(0.4), Some(0.4));
        model.reasoning = true;
        assert_eq!(model.effective_temperature(0.4), None);
    }

    #[test]
    fn descriptor_deserializes_family_tag() {
        let model: ModelDescriptor = serde_json::from_str(
            r#"{"name":"haiku","id":"claude-3-5-haiku-latest","family":"anthropic"}"#,
        )
        .expect("descriptor should parse");
        assert_eq!(model.family, ProviderFamily::Anthropic);
        assert!(model.search.is_none());
        assert!(!model.reasoning);
    }
}
