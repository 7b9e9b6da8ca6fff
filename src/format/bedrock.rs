use serde_json::{json, Value};

use super::{call_names, content_size, parse_arguments, AuxPlacement, FormatDescriptor, WireFormat};
use crate::types::{Slot, ToolCallRef, ToolOutputRef};

const MAX_CACHE_POINTS: usize = 4;
const BEDROCK_KEYS: &[&str] = &["inferenceConfig", "toolConfig", "additionalModelRequestFields"];

/// Bedrock Converse: untyped content blocks keyed by their single field
/// (`text`, `toolUse`, `toolResult`, `cachePoint`).
pub struct BedrockFormat;

impl BedrockFormat {
    fn blocks(msg: &Value) -> impl Iterator<Item = (usize, &Value)> {
        msg["content"]
            .as_array()
            .map(|a| a.as_slice())
            .unwrap_or_default()
            .iter()
            .enumerate()
    }

    fn is_bedrock_block(block: &Value) -> bool {
        let Some(obj) = block.as_object() else {
            return false;
        };
        if obj.contains_key("type") {
            return false;
        }
        ["toolUse", "toolResult", "cachePoint", "text", "image", "document"]
            .iter()
            .any(|k| obj.contains_key(*k))
    }

    fn find_block(data: &[Value], field: &str, key: &str) -> Option<Slot> {
        data.iter().enumerate().find_map(|(msg_idx, msg)| {
            Self::blocks(msg)
                .find(|(_, b)| b[field]["toolUseId"] == key)
                .map(|(part, _)| Slot {
                    message: msg_idx,
                    part,
                })
        })
    }
}

impl FormatDescriptor for BedrockFormat {
    fn format(&self) -> WireFormat {
        WireFormat::Bedrock
    }

    fn detect(&self, body: &Value) -> bool {
        let Some(messages) = body.get("messages").and_then(Value::as_array) else {
            return false;
        };
        if BEDROCK_KEYS.iter().any(|k| body.get(*k).is_some()) {
            return true;
        }
        messages
            .iter()
            .any(|m| Self::blocks(m).any(|(_, b)| Self::is_bedrock_block(b)))
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
            for (_, block) in Self::blocks(msg) {
                let tool_use = &block["toolUse"];
                let Some(id) = tool_use["toolUseId"].as_str() else {
                    continue;
                };
                calls.push(ToolCallRef {
                    correlation_key: id.to_string(),
                    tool_name: tool_use["name"].as_str().unwrap_or("unknown").to_string(),
                    parameters: parse_arguments(&tool_use["input"]),
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
            for (_, block) in Self::blocks(msg) {
                let result = &block["toolResult"];
                let Some(key) = result["toolUseId"].as_str() else {
                    continue;
                };
                outputs.push(ToolOutputRef {
                    correlation_key: key.to_string(),
                    tool_name: names.get(key).copied().unwrap_or("unknown").to_string(),
                    message_index: msg_idx,
                    size: content_size(&result["content"]),
                    is_error: result["status"] == "error",
                });
            }
        }
        outputs
    }

    fn locate_call(&self, data: &[Value], key: &str) -> Option<Slot> {
        Self::find_block(data, "toolUse", key)
    }

    fn locate_result(&self, data: &[Value], key: &str) -> Option<Slot> {
        Self::find_block(data, "toolResult", key)
    }

    fn replace_tool_output(&self, data: &mut [Value], key: &str, text: &str) -> bool {
        let Some(slot) = self.locate_result(data, key) else {
            return false;
        };
        data[slot.message]["content"][slot.part]["toolResult"]["content"] =
            json!([{"text": text}]);
        true
    }

    fn replace_tool_input(&self, data: &mut [Value], key: &str, input: &Value) -> bool {
        let Some(slot) = self.locate_call(data, key) else {
            return false;
        };
        data[slot.message]["content"][slot.part]["toolUse"]["input"] = input.clone();
        true
    }

    fn inject_auxiliary_content(&self, data: &mut Vec<Value>, text: &str, placement: AuxPlacement) {
        let role = match placement {
            AuxPlacement::AppendToLastUser => "user",
            AuxPlacement::SyntheticAssistant => "assistant",
        };
        let target = match placement {
            AuxPlacement::AppendToLastUser => data.iter().rposition(|m| m["role"] == "user"),
            AuxPlacement::SyntheticAssistant => data
                .len()
                .checked_sub(1)
                .filter(|&i| data[i]["role"] == "assistant"),
        };
        let text = if role == "assistant" { text.trim_end() } else { text };
        match target.and_then(|i| data[i]["content"].as_array_mut()) {
            // Appended after any trailing cachePoint so the marker stays with its block.
            Some(blocks) => blocks.push(json!({"text": text})),
            None => data.push(json!({"role": role, "content": [{"text": text}]})),
        }
    }

    fn cache_marker_count(&self, data: &[Value]) -> usize {
        data.iter()
            .flat_map(|m| Self::blocks(m).map(|(_, b)| b))
            .filter(|b| b.get("cachePoint").is_some())
            .count()
    }

    fn max_cache_breakpoints(&self) -> usize {
        MAX_CACHE_POINTS
    }
}
