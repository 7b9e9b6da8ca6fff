use serde_json::{json, Value};

use super::{
    append_text, call_names, content_size, parse_arguments, AuxPlacement, FormatDescriptor,
    WireFormat,
};
use crate::types::{Slot, ToolCallRef, ToolOutputRef};

/// Anthropic allows at most four `cache_control` breakpoints per request.
const MAX_CACHE_BREAKPOINTS: usize = 4;

/// Anthropic Messages API: top-level `system`, `tool_use` blocks in assistant
/// content, `tool_result` blocks in user content keyed by `tool_use_id`.
pub struct AnthropicFormat;

impl AnthropicFormat {
    fn blocks(msg: &Value) -> impl Iterator<Item = (usize, &Value)> {
        msg["content"]
            .as_array()
            .map(|a| a.as_slice())
            .unwrap_or_default()
            .iter()
            .enumerate()
    }

    fn find_block(data: &[Value], role: &str, kind: &str, id_field: &str, key: &str) -> Option<Slot> {
        data.iter().enumerate().find_map(|(msg_idx, msg)| {
            if msg["role"] != role {
                return None;
            }
            Self::blocks(msg)
                .find(|(_, b)| b["type"] == kind && b[id_field] == key)
                .map(|(part, _)| Slot {
                    message: msg_idx,
                    part,
                })
        })
    }
}

impl FormatDescriptor for AnthropicFormat {
    fn format(&self) -> WireFormat {
        WireFormat::Anthropic
    }

    fn detect(&self, body: &Value) -> bool {
        let Some(messages) = body.get("messages").and_then(Value::as_array) else {
            return false;
        };
        if body.get("anthropic_version").is_some() || body.get("system").is_some() {
            return true;
        }
        messages.iter().any(|m| {
            Self::blocks(m).any(|(_, b)| {
                matches!(
                    b["type"].as_str(),
                    Some("tool_use" | "tool_result" | "thinking" | "redacted_thinking")
                )
            })
        })
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
            for (_, block) in Self::blocks(msg) {
                if block["type"] != "tool_use" {
                    continue;
                }
                let Some(id) = block["id"].as_str() else {
                    continue;
                };
                calls.push(ToolCallRef {
                    correlation_key: id.to_string(),
                    tool_name: block["name"].as_str().unwrap_or("unknown").to_string(),
                    parameters: parse_arguments(&block["input"]),
                    message_index: msg_idx,
                });
            }
        }
        calls
    }

    fn extract_tool_outputs(&self, data: &[Value]) -> Vec<ToolOutputRef> {
        let calls = self.tool_calls(data);
        let names = call_names(&calls);
        let mut outputs = Vec::new();
        for (msg_idx, msg) in data.iter().enumerate() {
            if msg["role"] != "user" {
                continue;
            }
            for (_, block) in Self::blocks(msg) {
                if block["type"] != "tool_result" {
                    continue;
                }
                let Some(key) = block["tool_use_id"].as_str() else {
                    continue;
                };
                outputs.push(ToolOutputRef {
                    correlation_key: key.to_string(),
                    tool_name: names.get(key).copied().unwrap_or("unknown").to_string(),
                    message_index: msg_idx,
                    size: content_size(&block["content"]),
                    is_error: block["is_error"].as_bool().unwrap_or(false),
                });
            }
        }
        outputs
    }

    fn locate_call(&self, data: &[Value], key: &str) -> Option<Slot> {
        Self::find_block(data, "assistant", "tool_use", "id", key)
    }

    fn locate_result(&self, data: &[Value], key: &str) -> Option<Slot> {
        Self::find_block(data, "user", "tool_result", "tool_use_id", key)
    }

    fn replace_tool_output(&self, data: &mut [Value], key: &str, text: &str) -> bool {
        let Some(slot) = self.locate_result(data, key) else {
            return false;
        };
        // Only `content` changes; cache_control and is_error stay on the block.
        data[slot.message]["content"][slot.part]["content"] = Value::String(text.to_string());
        true
    }

    fn replace_tool_input(&self, data: &mut [Value], key: &str, input: &Value) -> bool {
        let Some(slot) = self.locate_call(data, key) else {
            return false;
        };
        data[slot.message]["content"][slot.part]["input"] = input.clone();
        true
    }

    fn inject_auxiliary_content(&self, data: &mut Vec<Value>, text: &str, placement: AuxPlacement) {
        let block = |t: &str| json!({"type": "text", "text": t});
        match placement {
            AuxPlacement::AppendToLastUser => {
                match data.iter_mut().rev().find(|m| m["role"] == "user") {
                    Some(msg) => append_text(&mut msg["content"], text, block),
                    None => data.push(json!({"role": "user", "content": [block(text)]})),
                }
            }
            AuxPlacement::SyntheticAssistant => {
                // Assistant prefill must not end with whitespace.
                let text = text.trim_end();
                let merge = data.last().is_some_and(|m| m["role"] == "assistant");
                if !merge {
                    data.push(json!({"role": "assistant", "content": [block(text)]}));
                } else if let Some(last) = data.last_mut() {
                    append_text(&mut last["content"], text, block);
                }
            }
        }
    }

    fn cache_marker_count(&self, data: &[Value]) -> usize {
        data.iter()
            .flat_map(|m| Self::blocks(m).map(|(_, b)| b))
            .filter(|b| b.get("cache_control").is_some())
            .count()
    }

    fn max_cache_breakpoints(&self) -> usize {
        MAX_CACHE_BREAKPOINTS
    }
}
