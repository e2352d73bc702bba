use chatgate_common::{Error, Result, ToolCallRequest};
use std::collections::BTreeMap;

/// Tool calls whose argument JSON arrives in fragments, keyed by stream index.
#[derive(Debug, Default)]
pub(crate) struct PartialToolCalls {
    calls: BTreeMap<u64, PartialCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl PartialToolCalls {
    pub(crate) fn start(&mut self, index: u64, id: &str, name: &str) {
        let call = self.calls.entry(index).or_default();
        call.id = id.to_string();
        call.name = name.to_string();
    }

    pub(crate) fn push_arguments(&mut self, index: u64, fragment: &str) {
        self.calls
            .entry(index)
            .or_default()
            .arguments
            .push_str(fragment);
    }

    /// Chat-completions style delta: any of id, name, and argument text may be present.
    pub(crate) fn merge(
        &mut self,
        index: u64,
        id: Option<&str>,
        name: Option<&str>,
        fragment: Option<&str>,
    ) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            call.id = id.to_string();
        }
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            call.name.push_str(name);
        }
        if let Some(fragment) = fragment {
            call.arguments.push_str(fragment);
        }
    }

    /// Replace buffered arguments with the provider's final rendition.
    pub(crate) fn set_arguments(&mut self, index: u64, arguments: &str) {
        self.calls.entry(index).or_default().arguments = arguments.to_string();
    }

    /// Complete one call. `None` when nothing was buffered at that index.
    pub(crate) fn finish_one(&mut self, index: u64) -> Option<Result<ToolCallRequest>> {
        self.calls.remove(&index).map(PartialCall::complete)
    }

    /// Complete every buffered call in index order.
    pub(crate) fn finish(&mut self) -> Result<Vec<ToolCallRequest>> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(PartialCall::complete)
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl PartialCall {
    fn complete(self) -> Result<ToolCallRequest> {
        if self.name.is_empty() {
            return Err(Error::MalformedToolCall {
                name: "<unnamed>".to_string(),
                reason: "tool call without a name".to_string(),
            });
        }
        let arguments = if self.arguments.trim().is_empty() {
            "{}".to_string()
        } else {
            self.arguments
        };
        if let Err(e) = serde_json::from_str::<serde_json::Value>(&arguments) {
            return Err(Error::MalformedToolCall {
                name: self.name,
                reason: format!("incomplete argument JSON at end of stream: {e}"),
            });
        }
        let id = if self.id.is_empty() {
            generated_call_id()
        } else {
            self.id
        };
        Ok(ToolCallRequest {
            id,
            name: self.name,
            arguments,
        })
    }
}

pub(crate) fn generated_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_are_joined_per_index() {
        let mut calls = PartialToolCalls::default();
        calls.merge(1, Some("call_b"), Some("second"), Some("{\"n\":"));
        calls.merge(0, Some("call_a"), Some("first"), Some(""));
        calls.merge(1, None, None, Some("2}"));
        calls.merge(0, None, None, Some("{}"));

        let done = calls.finish().unwrap();
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].id, "call_a");
        assert_eq!(done[1].arguments, "{\"n\":2}");
        assert!(calls.is_empty());
    }

    #[test]
    fn truncated_arguments_are_malformed() {
        let mut calls = PartialToolCalls::default();
        calls.start(0, "toolu_1", "lookup");
        calls.push_arguments(0, "{\"q\": \"ru");

        match calls.finish_one(0) {
            Some(Err(Error::MalformedToolCall { name, .. })) => assert_eq!(name, "lookup"),
            other => panic!("expected malformed tool call, got {other:?}"),
        }
    }

    #[test]
    fn empty_arguments_default_to_object_and_missing_id_is_generated() {
        let mut calls = PartialToolCalls::default();
        calls.start(3, "", "current_time");
        let call = calls.finish_one(3).unwrap().unwrap();
        assert_eq!(call.arguments, "{}");
        assert!(call.id.starts_with("call_"));
        assert!(calls.finish_one(3).is_none());
    }
}
