pub mod anthropic;
pub mod bedrock;
pub mod chat;
pub mod gemini;
pub mod responses;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::PruneError;
use crate::types::{Slot, ToolCallRef, ToolOutputRef};

pub use anthropic::AnthropicFormat;
pub use bedrock::BedrockFormat;
pub use chat::ChatFormat;
pub use gemini::GeminiFormat;
pub use responses::ResponsesFormat;

/// Closed set of wire formats the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    OpenAiChat,
    OpenAiResponses,
    Anthropic,
    Gemini,
    Bedrock,
    Mistral,
    Cohere,
    OpenAiCompatible,
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WireFormat::OpenAiChat => "openai-chat",
            WireFormat::OpenAiResponses => "openai-responses",
            WireFormat::Anthropic => "anthropic",
            WireFormat::Gemini => "gemini",
            WireFormat::Bedrock => "bedrock",
            WireFormat::Mistral => "mistral",
            WireFormat::Cohere => "cohere",
            WireFormat::OpenAiCompatible => "openai-compatible",
        };
        f.write_str(s)
    }
}

/// Where auxiliary (instructional / status) text goes in the outgoing list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxPlacement {
    /// Append to the end of the last user turn.
    AppendToLastUser,
    /// Add as (or append to) a trailing assistant turn, for routes that
    /// reject trailing user-role text.
    SyntheticAssistant,
}

/// Per-format capability table. Stateless: one static instance per format.
///
/// Reads never fail; malformed entries are skipped. Writes return whether the
/// target was found and written.
pub trait FormatDescriptor: Send + Sync {
    fn format(&self) -> WireFormat;

    /// True if `body` has this format's shape.
    fn detect(&self, body: &Value) -> bool;

    /// The ordered list of turn containers (messages / contents / input items).
    fn data_array<'a>(&self, body: &'a Value) -> Option<&'a Vec<Value>>;

    fn data_array_mut<'a>(&self, body: &'a mut Value) -> Option<&'a mut Vec<Value>>;

    /// True if the item was produced by the model. A run of consecutive
    /// assistant items is one step.
    fn is_assistant_turn(&self, item: &Value) -> bool;

    /// Every tool call in order, with its correlation key and parsed arguments.
    fn tool_calls(&self, data: &[Value]) -> Vec<ToolCallRef>;

    /// Every tool result in order.
    fn extract_tool_outputs(&self, data: &[Value]) -> Vec<ToolOutputRef>;

    fn locate_call(&self, data: &[Value], key: &str) -> Option<Slot>;

    fn locate_result(&self, data: &[Value], key: &str) -> Option<Slot>;

    /// Rewrite only the result content at `key`.
    fn replace_tool_output(&self, data: &mut [Value], key: &str, text: &str) -> bool;

    /// Rewrite only the call arguments at `key`.
    fn replace_tool_input(&self, data: &mut [Value], key: &str, input: &Value) -> bool;

    fn inject_auxiliary_content(&self, data: &mut Vec<Value>, text: &str, placement: AuxPlacement);

    /// Placement used unless configuration overrides it for the model.
    fn default_placement(&self) -> AuxPlacement {
        AuxPlacement::AppendToLastUser
    }

    /// True when calls and results are matched by position, not identifier.
    fn is_positional(&self) -> bool {
        false
    }

    /// Positional formats check that the call/result pair at `key` lines up.
    fn verify_pairing(&self, _data: &[Value], _key: &str) -> Result<(), PruneError> {
        Ok(())
    }

    fn cache_marker_count(&self, _data: &[Value]) -> usize {
        0
    }

    fn max_cache_breakpoints(&self) -> usize {
        0
    }
}

pub static OPENAI_RESPONSES: ResponsesFormat = ResponsesFormat;
pub static GEMINI: GeminiFormat = GeminiFormat;
pub static BEDROCK: BedrockFormat = BedrockFormat;
pub static ANTHROPIC: AnthropicFormat = AnthropicFormat;
pub static COHERE: ChatFormat = ChatFormat::new(WireFormat::Cohere);
pub static MISTRAL: ChatFormat = ChatFormat::new(WireFormat::Mistral);
pub static OPENAI_CHAT: ChatFormat = ChatFormat::new(WireFormat::OpenAiChat);
pub static OPENAI_COMPATIBLE: ChatFormat = ChatFormat::new(WireFormat::OpenAiCompatible);

/// All descriptors in detection order: most specific shape first, generic
/// OpenAI-compatible last as the fallback.
pub fn descriptors() -> [&'static dyn FormatDescriptor; 8] {
    [
        &OPENAI_RESPONSES,
        &GEMINI,
        &BEDROCK,
        &ANTHROPIC,
        &COHERE,
        &MISTRAL,
        &OPENAI_CHAT,
        &OPENAI_COMPATIBLE,
    ]
}

/// First descriptor whose predicate matches the body.
pub fn detect(body: &Value) -> Option<&'static dyn FormatDescriptor> {
    descriptors().into_iter().find(|d| d.detect(body))
}

/// Placement for a request: the descriptor's default unless the model id
/// matches one of `assistant_models`.
pub fn resolve_placement(
    descriptor: &dyn FormatDescriptor,
    model: Option<&str>,
    assistant_models: &[String],
) -> AuxPlacement {
    let forced = model
        .map(|m| m.to_ascii_lowercase())
        .map(|m| {
            assistant_models
                .iter()
                .any(|p| !p.is_empty() && m.contains(&p.to_ascii_lowercase()))
        })
        .unwrap_or(false);
    if forced {
        AuxPlacement::SyntheticAssistant
    } else {
        descriptor.default_placement()
    }
}

/// Step ordinal (1-based) of the assistant run each item belongs to or
/// follows, and the total number of steps. Items before the first assistant
/// turn get step 0.
pub fn assistant_steps(descriptor: &dyn FormatDescriptor, data: &[Value]) -> (Vec<u64>, u64) {
    let mut steps = Vec::with_capacity(data.len());
    let mut current = 0u64;
    let mut prev_assistant = false;
    for item in data {
        let assistant = descriptor.is_assistant_turn(item);
        if assistant && !prev_assistant {
            current += 1;
        }
        prev_assistant = assistant;
        steps.push(current);
    }
    (steps, current)
}

/// Correlation key → tool name, for formats whose results don't carry names.
pub(crate) fn call_names(calls: &[ToolCallRef]) -> HashMap<&str, &str> {
    calls
        .iter()
        .map(|c| (c.correlation_key.as_str(), c.tool_name.as_str()))
        .collect()
}

/// Arguments arrive either as a JSON string (OpenAI-style) or an object.
pub(crate) fn parse_arguments(raw: &Value) -> Result<Value, String> {
    match raw {
        Value::String(s) if s.trim().is_empty() => Ok(json!({})),
        Value::String(s) => serde_json::from_str(s).map_err(|e| e.to_string()),
        Value::Null => Ok(json!({})),
        other => Ok(other.clone()),
    }
}

/// Serialized byte size of result content.
pub(crate) fn content_size(content: &Value) -> usize {
    match content {
        Value::String(s) => s.len(),
        Value::Null => 0,
        other => other.to_string().len(),
    }
}

/// Append text to a chat-style `content`, which is a string or an array of
/// blocks built by `block`.
pub(crate) fn append_text(content: &mut Value, text: &str, block: impl Fn(&str) -> Value) {
    match content {
        Value::String(s) if s.is_empty() => *s = text.to_string(),
        Value::String(s) => {
            s.push_str("\n\n");
            s.push_str(text);
        }
        Value::Array(blocks) => blocks.push(block(text)),
        other => *other = Value::String(text.to_string()),
    }
}
