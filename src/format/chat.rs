use serde_json::{json, Value};

use super::{
    append_text, call_names, content_size, parse_arguments, AuxPlacement, FormatDescriptor,
    WireFormat,
};
use crate::types::{Slot, ToolCallRef, ToolOutputRef};

const MISTRAL_FAMILIES: &[&str] = &[
    "mistral", "codestral", "magistral", "devstral", "ministral", "pixtral",
];
const MISTRAL_KEYS: &[&str] = &["safe_prompt", "random_seed", "prompt_mode"];

const OPENAI_PREFIXES: &[&str] = &["gpt-", "chatgpt-", "o1", "o3", "o4"];
const OPENAI_KEYS: &[&str] = &[
    "max_completion_tokens",
    "reasoning_effort",
    "parallel_tool_calls",
    "service_tier",
];

const COHERE_KEYS: &[&str] = &["safety_mode", "citation_options", "documents"];

/// Chat-completions shaped formats: a `messages` array, assistant
/// `tool_calls[].function`, and `role: "tool"` results keyed by `tool_call_id`.
///
/// OpenAI chat, Mistral, Cohere v2 and the generic OpenAI-compatible fallback
/// share this shape. Their differences are detection and result encoding:
/// Cohere results are document blocks.
pub struct ChatFormat {
    format: WireFormat,
}

impl ChatFormat {
    pub const fn new(format: WireFormat) -> Self {
        Self { format }
    }

    fn model_name(body: &Value) -> Option<String> {
        let model = body.get("model")?.as_str()?;
        // Router ids look like "openai/gpt-4o".
        let name = model.rsplit('/').next().unwrap_or(model);
        Some(name.to_ascii_lowercase())
    }

    fn has_any_key(body: &Value, keys: &[&str]) -> bool {
        keys.iter().any(|k| body.get(*k).is_some())
    }

    fn is_cohere(body: &Value, messages: &[Value]) -> bool {
        if Self::has_any_key(body, COHERE_KEYS) {
            return true;
        }
        if Self::model_name(body).is_some_and(|m| m.starts_with("command")) {
            return true;
        }
        messages.iter().any(|m| {
            m.get("tool_plan").is_some()
                || (m["role"] == "tool"
                    && m["content"]
                        .as_array()
                        .is_some_and(|blocks| blocks.iter().any(|b| b["type"] == "document")))
        })
    }

    fn is_mistral(body: &Value) -> bool {
        Self::has_any_key(body, MISTRAL_KEYS)
            || Self::model_name(body)
                .is_some_and(|m| MISTRAL_FAMILIES.iter().any(|f| m.contains(f)))
    }

    fn is_openai(body: &Value) -> bool {
        Self::has_any_key(body, OPENAI_KEYS)
            || Self::model_name(body)
                .is_some_and(|m| OPENAI_PREFIXES.iter().any(|p| m.starts_with(p)))
    }

    fn result_content(&self, text: &str, previous: &Value) -> Value {
        match self.format {
            WireFormat::Cohere if previous.is_array() => json!([
                {"type": "document", "document": {"data": text}}
            ]),
            _ if previous.is_array() => json!([{"type": "text", "text": text}]),
            _ => Value::String(text.to_string()),
        }
    }
}

impl FormatDescriptor for ChatFormat {
    fn format(&self) -> WireFormat {
        self.format
    }

    fn detect(&self, body: &Value) -> bool {
        let Some(messages) = body.get("messages").and_then(Value::as_array) else {
            return false;
        };
        match self.format {
            WireFormat::Cohere => Self::is_cohere(body, messages),
            WireFormat::Mistral => Self::is_mistral(body),
            WireFormat::OpenAiChat => Self::is_openai(body),
            _ => true,
        }
    }

    fn data_array<'a>(&self, body: &'a Value) -> Option<&'a Vec<Value>> {
        body.get("messages")?.as_array()
    }

    fn data_array_mut<'a>(&self, body: &'a mut Value) -> Option<&'a mut Vec<Value>> {
        body.get_mut("messages")?.as_array_mut()
    }

    fn is_assistant_turn(&self, item: &Value) -> bool {
        item["role"] == "assistant"
    }

    fn tool_calls(&self, data: &[Value]) -> Vec<ToolCallRef> {
        let mut calls = Vec::new();
        for (msg_idx, msg) in data.iter().enumerate() {
            if msg["role"] != "assistant" {
                continue;
            }
            let Some(tool_calls) = msg["tool_calls"].as_array() else {
                continue;
            };
            for call in tool_calls {
                let Some(id) = call["id"].as_str() else {
                    continue;
                };
                let name = call["function"]["name"].as_str().unwrap_or("unknown");
                calls.push(ToolCallRef {
                    correlation_key: id.to_string(),
                    tool_name: name.to_string(),
                    parameters: parse_arguments(&call["function"]["arguments"]),
                    message_index: msg_idx,
                });
            }
        }
        calls
    }

    fn extract_tool_outputs(&self, data: &[Value]) -> Vec<ToolOutputRef> {
        let calls = self.tool_calls(data);
        let names = call_names(&calls);
        data.iter()
            .enumerate()
            .filter(|(_, msg)| msg["role"] == "tool")
            .filter_map(|(msg_idx, msg)| {
                let key = msg["tool_call_id"].as_str()?;
                let tool_name = msg["name"]
                    .as_str()
                    .or_else(|| names.get(key).copied())
                    .unwrap_or("unknown");
                Some(ToolOutputRef {
                    correlation_key: key.to_string(),
                    tool_name: tool_name.to_string(),
                    message_index: msg_idx,
                    size: content_size(&msg["content"]),
                    is_error: false,
                })
            })
            .collect()
    }

    fn locate_call(&self, data: &[Value], key: &str) -> Option<Slot> {
        data.iter().enumerate().find_map(|(msg_idx, msg)| {
            if msg["role"] != "assistant" {
                return None;
            }
            let part = msg["tool_calls"]
                .as_array()?
                .iter()
                .position(|c| c["id"] == key)?;
            Some(Slot {
                message: msg_idx,
                part,
            })
        })
    }

    fn locate_result(&self, data: &[Value], key: &str) -> Option<Slot> {
        data.iter()
            .position(|msg| msg["role"] == "tool" && msg["tool_call_id"] == key)
            .map(|message| Slot { message, part: 0 })
    }

    fn replace_tool_output(&self, data: &mut [Value], key: &str, text: &str) -> bool {
        let Some(slot) = self.locate_result(data, key) else {
            return false;
        };
        let msg = &mut data[slot.message];
        msg["content"] = self.result_content(text, &msg["content"]);
        true
    }

    fn replace_tool_input(&self, data: &mut [Value], key: &str, input: &Value) -> bool {
        let Some(slot) = self.locate_call(data, key) else {
            return false;
        };
        let function = &mut data[slot.message]["tool_calls"][slot.part]["function"];
        // Keep whatever encoding the host used for arguments.
        function["arguments"] = if function["arguments"].is_string() {
            Value::String(input.to_string())
        } else {
            input.clone()
        };
        true
    }

    fn inject_auxiliary_content(&self, data: &mut Vec<Value>, text: &str, placement: AuxPlacement) {
        match placement {
            AuxPlacement::AppendToLastUser => {
                match data.iter_mut().rev().find(|m| m["role"] == "user") {
                    Some(msg) => {
                        append_text(&mut msg["content"], text, |t| {
                            json!({"type": "text", "text": t})
                        });
                    }
                    None => data.push(json!({"role": "user", "content": text})),
                }
            }
            AuxPlacement::SyntheticAssistant => {
                let merge = data
                    .last()
                    .is_some_and(|m| m["role"] == "assistant" && m.get("tool_calls").is_none());
                if !merge {
                    data.push(json!({"role": "assistant", "content": text}));
                } else if let Some(last) = data.last_mut() {
                    append_text(&mut last["content"], text, |t| {
                        json!({"type": "text", "text": t})
                    });
                }
            }
        }
    }
}
