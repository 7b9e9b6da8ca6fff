use serde_json::{json, Value};

use super::{
    append_text, call_names, content_size, parse_arguments, AuxPlacement, FormatDescriptor,
    WireFormat,
};
use crate::types::{Slot, ToolCallRef, ToolOutputRef};

/// OpenAI Responses API: a flat `input` item list where calls and outputs are
/// separate `function_call` / `function_call_output` items joined by `call_id`.
pub struct ResponsesFormat;

impl ResponsesFormat {
    fn item_type(item: &Value) -> &str {
        item["type"].as_str().unwrap_or("message")
    }

    fn find_item(data: &[Value], kind: &str, key: &str) -> Option<Slot> {
        data.iter()
            .position(|item| Self::item_type(item) == kind && item["call_id"] == key)
            .map(|message| Slot { message, part: 0 })
    }
}

impl FormatDescriptor for ResponsesFormat {
    fn format(&self) -> WireFormat {
        WireFormat::OpenAiResponses
    }

    fn detect(&self, body: &Value) -> bool {
        body.get("input").is_some_and(Value::is_array)
            && body.get("messages").is_none()
            && body.get("contents").is_none()
    }

    fn data_array<'a>(&self, body: &'a Value) -> Option<&'a Vec<Value>> {
        body.get("input")?.as_array()
    }

    fn data_array_mut<'a>(&self, body: &'a mut Value) -> Option<&'a mut Vec<Value>> {
        body.get_mut("input")?.as_array_mut()
    }

    fn is_assistant_turn(&self, item: &Value) -> bool {
        match Self::item_type(item) {
            "function_call" | "reasoning" => true,
            "message" => item["role"] == "assistant",
            _ => false,
        }
    }

    fn tool_calls(&self, data: &[Value]) -> Vec<ToolCallRef> {
        data.iter()
            .enumerate()
            .filter(|(_, item)| Self::item_type(item) == "function_call")
            .filter_map(|(idx, item)| {
                Some(ToolCallRef {
                    correlation_key: item["call_id"].as_str()?.to_string(),
                    tool_name: item["name"].as_str().unwrap_or("unknown").to_string(),
                    parameters: parse_arguments(&item["arguments"]),
                    message_index: idx,
                })
            })
            .collect()
    }

    fn extract_tool_outputs(&self, data: &[Value]) -> Vec<ToolOutputRef> {
        let calls = self.tool_calls(data);
        let names = call_names(&calls);
        data.iter()
            .enumerate()
            .filter(|(_, item)| Self::item_type(item) == "function_call_output")
            .filter_map(|(idx, item)| {
                let key = item["call_id"].as_str()?;
                Some(ToolOutputRef {
                    correlation_key: key.to_string(),
                    tool_name: names.get(key).copied().unwrap_or("unknown").to_string(),
                    message_index: idx,
                    size: content_size(&item["output"]),
                    is_error: false,
                })
            })
            .collect()
    }

    fn locate_call(&self, data: &[Value], key: &str) -> Option<Slot> {
        Self::find_item(data, "function_call", key)
    }

    fn locate_result(&self, data: &[Value], key: &str) -> Option<Slot> {
        Self::find_item(data, "function_call_output", key)
    }

    fn replace_tool_output(&self, data: &mut [Value], key: &str, text: &str) -> bool {
        let Some(slot) = self.locate_result(data, key) else {
            return false;
        };
        data[slot.message]["output"] = Value::String(text.to_string());
        true
    }

    fn replace_tool_input(&self, data: &mut [Value], key: &str, input: &Value) -> bool {
        let Some(slot) = self.locate_call(data, key) else {
            return false;
        };
        data[slot.message]["arguments"] = Value::String(input.to_string());
        true
    }

    fn inject_auxiliary_content(&self, data: &mut Vec<Value>, text: &str, placement: AuxPlacement) {
        match placement {
            AuxPlacement::AppendToLastUser => {
                let last_user = data
                    .iter()
                    .rposition(|i| Self::item_type(i) == "message" && i["role"] == "user");
                match last_user {
                    Some(idx) => append_text(&mut data[idx]["content"], text, |t| {
                        json!({"type": "input_text", "text": t})
                    }),
                    None => data.push(json!({
                        "role": "user",
                        "content": [{"type": "input_text", "text": text}],
                    })),
                }
            }
            AuxPlacement::SyntheticAssistant => {
                let merge = data.last().is_some_and(|i| {
                    Self::item_type(i) == "message" && i["role"] == "assistant"
                });
                if !merge {
                    data.push(json!({
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": text}],
                    }));
                } else if let Some(last) = data.last_mut() {
                    append_text(&mut last["content"], text, |t| {
                        json!({"type": "output_text", "text": t})
                    });
                }
            }
        }
    }
}
