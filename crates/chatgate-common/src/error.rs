use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("agent error: {0}")]
    Agent(String),

    /// Network, auth, or HTTP-status failure talking to a provider.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider did not finish before the turn deadline.
    #[error("provider timed out after {}s", .0.as_secs())]
    ProviderTimeout(Duration),

    #[error("malformed arguments for tool '{name}': {reason}")]
    MalformedToolCall { name: String, reason: String },

    #[error("tool '{name}' failed: {reason}")]
    ToolExecutionFailed { name: String, reason: String },

    #[error("summarization failed: {0}")]
    SummarizationFailed(String),

    #[error("tool loop exceeded maximum of {0} iterations")]
    IterationLimitExceeded(usize),
}

impl Error {
    /// Whether this error came from a provider deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ProviderTimeout(_))
    }

    /// Human-readable text handed to the transport layer.
    pub fn user_message(&self) -> String {
        match self {
            Error::ProviderTimeout(after) => format!(
                "The model did not finish answering in time (timed out after {}s). Please try again.",
                after.as_secs()
            ),
            Error::ProviderUnavailable(reason) => format!(
                "The model provider is unavailable right now ({reason}). Your message was saved, you can retry."
            ),
            Error::IterationLimitExceeded(max) => format!(
                "Stopped after {max} rounds of tool calls without a final answer."
            ),
            other => format!("Something went wrong: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_iteration_limit_have_distinct_messages() {
        let timeout = Error::ProviderTimeout(Duration::from_secs(300));
        let limit = Error::IterationLimitExceeded(10);
        let unavailable = Error::ProviderUnavailable("status=503".to_string());

        assert!(timeout.is_timeout());
        assert!(timeout.user_message().contains("timed out after 300s"));
        assert!(limit.user_message().contains("10 rounds"));
        assert!(!unavailable.is_timeout());
        assert_ne!(timeout.user_message(), unavailable.user_message());
    }

    #[test]
    fn display_includes_tool_name() {
        let err = Error::MalformedToolCall {
            name: "lookup".to_string(),
            reason: "EOF while parsing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "malformed arguments for tool 'lookup': EOF while parsing"
        );
    }
}
