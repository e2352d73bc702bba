use chatgate_common::{Error, Result, ToolCallRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Tool, ToolContext, ToolOutput};
use crate::providers::ToolDefinition;

/// Name to tool lookup plus dispatch. Holds no state of its own beyond the table.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: HashMap::new(),
            timeout,
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        debug!("registered tool: {}", tool.name());
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unknown tool: {name}")))
    }

    /// Definitions sent to the model, sorted by name for stable requests.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Run one requested call. Never fails: unknown tools, malformed arguments,
    /// handler errors, and timeouts all come back as error results for the model.
    pub async fn invoke(&self, context: &ToolContext, call: &ToolCallRequest) -> ToolOutput {
        match self.try_invoke(context, call).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, "tool call failed: {e}");
                ToolOutput::error(format!("Error: {e}"))
            }
        }
    }

    async fn try_invoke(&self, context: &ToolContext, call: &ToolCallRequest) -> Result<ToolOutput> {
        let tool = self.resolve(&call.name)?;

        let raw = if call.arguments.trim().is_empty() {
            "{}"
        } else {
            call.arguments.as_str()
        };
        let args: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| Error::MalformedToolCall {
                name: call.name.clone(),
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(self.timeout, tool.execute(context, args)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(Error::ToolExecutionFailed {
                name: call.name.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ToolExecutionFailed {
                name: call.name.clone(),
                reason: format!("timed out after {}s", self.timeout.as_secs_f64()),
            }),
        }
    }
}
