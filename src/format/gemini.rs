use serde_json::{json, Value};
use tracing::warn;

use super::{content_size, parse_arguments, AuxPlacement, FormatDescriptor, WireFormat};
use crate::error::PruneError;
use crate::types::{Slot, ToolCallRef, ToolOutputRef};

/// Gemini `generateContent`: no tool-call identifiers. A call is matched to
/// its response purely by ordinal position: the j-th `functionCall` part of a
/// model turn pairs with the j-th `functionResponse` part of the turn right
/// after it.
///
/// Correlation keys are synthesized as `"{turn}:{ordinal}"`, where `turn` is
/// the 1-based ordinal of the model content and `ordinal` the 0-based position
/// of the call inside it.
pub struct GeminiFormat;

/// Parsed positional key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PositionalKey {
    turn: usize,
    ordinal: usize,
}

impl PositionalKey {
    fn parse(key: &str) -> Option<Self> {
        let (turn, ordinal) = key.split_once(':')?;
        Some(Self {
            turn: turn.parse().ok()?,
            ordinal: ordinal.parse().ok()?,
        })
    }

    fn render(turn: usize, ordinal: usize) -> String {
        format!("{turn}:{ordinal}")
    }
}

impl GeminiFormat {
    fn parts(content: &Value) -> &[Value] {
        content["parts"]
            .as_array()
            .map(|a| a.as_slice())
            .unwrap_or_default()
    }

    fn is_model(content: &Value) -> bool {
        content["role"] == "model"
    }

    /// Part indices holding `field` ("functionCall" / "functionResponse").
    fn part_indices(content: &Value, field: &str) -> Vec<usize> {
        Self::parts(content)
            .iter()
            .enumerate()
            .filter(|(_, p)| p.get(field).is_some())
            .map(|(i, _)| i)
            .collect()
    }

    /// Data index of the `turn`-th (1-based) model content.
    fn model_index(data: &[Value], turn: usize) -> Option<usize> {
        data.iter()
            .enumerate()
            .filter(|(_, c)| Self::is_model(c))
            .nth(turn.checked_sub(1)?)
            .map(|(i, _)| i)
    }

    /// The content answering the model turn at `model_idx`, if it has arrived.
    fn response_index(data: &[Value], model_idx: usize) -> Option<usize> {
        let next = model_idx + 1;
        let content = data.get(next)?;
        if Self::is_model(content) || Self::part_indices(content, "functionResponse").is_empty() {
            return None;
        }
        Some(next)
    }

    fn name_at(content: &Value, part: usize, field: &str) -> Option<String> {
        Self::parts(content)
            .get(part)?
            .get(field)?
            .get("name")?
            .as_str()
            .map(String::from)
    }

    /// Check that every call and response in the turn lines up by position:
    /// equal counts and pairwise equal names.
    fn check_turn(data: &[Value], model_idx: usize) -> Result<(), PruneError> {
        let Some(resp_idx) = Self::response_index(data, model_idx) else {
            return Ok(());
        };
        let calls = Self::part_indices(&data[model_idx], "functionCall");
        let responses = Self::part_indices(&data[resp_idx], "functionResponse");
        if calls.len() != responses.len() {
            return Err(PruneError::Structural(format!(
                "positional turn at index {model_idx} has {} calls but {} responses",
                calls.len(),
                responses.len()
            )));
        }
        for (ordinal, (&c, &r)) in calls.iter().zip(responses.iter()).enumerate() {
            let call_name = Self::name_at(&data[model_idx], c, "functionCall");
            let resp_name = Self::name_at(&data[resp_idx], r, "functionResponse");
            if call_name != resp_name {
                return Err(PruneError::Structural(format!(
                    "positional pair {ordinal} at index {model_idx} is out of order: call {:?}, response {:?}",
                    call_name, resp_name
                )));
            }
        }
        Ok(())
    }
}

impl FormatDescriptor for GeminiFormat {
    fn format(&self) -> WireFormat {
        WireFormat::Gemini
    }

    fn detect(&self, body: &Value) -> bool {
        body.get("contents").is_some_and(Value::is_array) && body.get("messages").is_none()
    }

    fn data_array<'a>(&self, body: &'a Value) -> Option<&'a Vec<Value>> {
        body.get("contents")?.as_array()
    }

    fn data_array_mut<'a>(&self, body: &'a mut Value) -> Option<&'a mut Vec<Value>> {
        body.get_mut("contents")?.as_array_mut()
    }

    fn is_assistant_turn(&self, item: &Value) -> bool {
        Self::is_model(item)
    }

    fn tool_calls(&self, data: &[Value]) -> Vec<ToolCallRef> {
        let mut calls = Vec::new();
        let mut turn = 0;
        for (idx, content) in data.iter().enumerate() {
            if !Self::is_model(content) {
                continue;
            }
            turn += 1;
            let parts = Self::parts(content);
            for (ordinal, part_idx) in Self::part_indices(content, "functionCall")
                .into_iter()
                .enumerate()
            {
                let call = &parts[part_idx]["functionCall"];
                calls.push(ToolCallRef {
                    correlation_key: PositionalKey::render(turn, ordinal),
                    tool_name: call["name"].as_str().unwrap_or("unknown").to_string(),
                    parameters: parse_arguments(&call["args"]),
                    message_index: idx,
                });
            }
        }
        calls
    }

    fn extract_tool_outputs(&self, data: &[Value]) -> Vec<ToolOutputRef> {
        let mut outputs = Vec::new();
        let mut turn = 0;
        for (idx, content) in data.iter().enumerate() {
            if !Self::is_model(content) {
                continue;
            }
            turn += 1;
            let Some(resp_idx) = Self::response_index(data, idx) else {
                continue;
            };
            let parts = Self::parts(&data[resp_idx]);
            for (ordinal, part_idx) in Self::part_indices(&data[resp_idx], "functionResponse")
                .into_iter()
                .enumerate()
            {
                let resp = &parts[part_idx]["functionResponse"];
                outputs.push(ToolOutputRef {
                    correlation_key: PositionalKey::render(turn, ordinal),
                    tool_name: resp["name"].as_str().unwrap_or("unknown").to_string(),
                    message_index: resp_idx,
                    size: content_size(&resp["response"]),
                    is_error: resp["response"].get("error").is_some(),
                });
            }
        }
        outputs
    }

    fn locate_call(&self, data: &[Value], key: &str) -> Option<Slot> {
        let pos = PositionalKey::parse(key)?;
        let model_idx = Self::model_index(data, pos.turn)?;
        let part = *Self::part_indices(&data[model_idx], "functionCall").get(pos.ordinal)?;
        Some(Slot {
            message: model_idx,
            part,
        })
    }

    fn locate_result(&self, data: &[Value], key: &str) -> Option<Slot> {
        let pos = PositionalKey::parse(key)?;
        let model_idx = Self::model_index(data, pos.turn)?;
        let resp_idx = Self::response_index(data, model_idx)?;
        let part = *Self::part_indices(&data[resp_idx], "functionResponse").get(pos.ordinal)?;
        Some(Slot {
            message: resp_idx,
            part,
        })
    }

    fn replace_tool_output(&self, data: &mut [Value], key: &str, text: &str) -> bool {
        if let Err(e) = self.verify_pairing(data, key) {
            warn!(key, error = %e, "refusing positional rewrite");
            return false;
        }
        let Some(slot) = self.locate_result(data, key) else {
            return false;
        };
        data[slot.message]["parts"][slot.part]["functionResponse"]["response"] =
            json!({"output": text});
        true
    }

    fn replace_tool_input(&self, data: &mut [Value], key: &str, input: &Value) -> bool {
        if let Err(e) = self.verify_pairing(data, key) {
            warn!(key, error = %e, "refusing positional rewrite");
            return false;
        }
        let Some(slot) = self.locate_call(data, key) else {
            return false;
        };
        data[slot.message]["parts"][slot.part]["functionCall"]["args"] = input.clone();
        true
    }

    fn inject_auxiliary_content(&self, data: &mut Vec<Value>, text: &str, placement: AuxPlacement) {
        let (role, target) = match placement {
            AuxPlacement::AppendToLastUser => {
                ("user", data.iter().rposition(|c| c["role"] == "user"))
            }
            AuxPlacement::SyntheticAssistant => (
                "model",
                data.len().checked_sub(1).filter(|&i| Self::is_model(&data[i])),
            ),
        };
        // Text parts go after every functionResponse part, so ordinals are unchanged.
        match target.and_then(|i| data[i]["parts"].as_array_mut()) {
            Some(parts) => parts.push(json!({"text": text})),
            None => data.push(json!({"role": role, "parts": [{"text": text}]})),
        }
    }

    fn is_positional(&self) -> bool {
        true
    }

    fn verify_pairing(&self, data: &[Value], key: &str) -> Result<(), PruneError> {
        let pos = PositionalKey::parse(key)
            .ok_or_else(|| PruneError::Structural(format!("not a positional key: {key}")))?;
        let model_idx = Self::model_index(data, pos.turn).ok_or_else(|| {
            PruneError::Structural(format!("no model turn {} for key {key}", pos.turn))
        })?;
        Self::check_turn(data, model_idx)
    }
}
