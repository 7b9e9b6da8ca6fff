use std::collections::HashSet;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use crate::config::ToolsConfig;
use crate::error::PruneError;
use crate::guard::target_path;
use crate::state::ConversationState;
use crate::types::{PruneMark, PruneReason};

pub const DISCARD_TOOL: &str = "discard";
pub const EXTRACT_TOOL: &str = "extract";
pub const PIN_TOOL: &str = "pin";

/// Why the LLM is discarding outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// Irrelevant or unhelpful output.
    Noise,
    /// The task the output served is finished.
    Completion,
}

impl From<DiscardReason> for PruneReason {
    fn from(reason: DiscardReason) -> Self {
        match reason {
            DiscardReason::Noise => PruneReason::Noise,
            DiscardReason::Completion => PruneReason::Completion,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscardArgs {
    #[serde(deserialize_with = "id_list")]
    pub ids: Vec<String>,
    pub reason: DiscardReason,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractArgs {
    #[serde(deserialize_with = "id_list")]
    pub ids: Vec<String>,
    pub distillation: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PinArgs {
    #[serde(deserialize_with = "id_list")]
    pub ids: Vec<String>,
    #[serde(default, alias = "durationTurns")]
    pub duration_turns: Option<i64>,
}

/// Models send ids as strings or bare numbers.
fn id_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Vec::<Value>::deserialize(deserializer)?
        .into_iter()
        .map(|v| match v {
            Value::String(s) => Ok(s.trim().to_string()),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(D::Error::custom(format!("invalid id: {other}"))),
        })
        .collect()
}

/// A parsed, validated call to one of the prune tools.
#[derive(Debug, Clone)]
pub enum PruneToolCall {
    Discard(DiscardArgs),
    Extract(ExtractArgs),
    Pin(PinArgs),
}

/// Result of applying a tool call to conversation state.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    /// Text returned to the LLM as the tool result.
    pub message: String,
    /// Correlation keys newly marked or pinned.
    pub keys: Vec<String>,
}

impl PruneToolCall {
    /// Parse and validate. Disabled tools are unknown.
    pub fn parse(name: &str, input: &Value, config: &ToolsConfig) -> Result<Self, PruneError> {
        let invalid = |e: serde_json::Error| PruneError::Validation(format!("{name}: {e}"));
        let call = match name {
            DISCARD_TOOL if config.discard => {
                Self::Discard(serde_json::from_value(input.clone()).map_err(invalid)?)
            }
            EXTRACT_TOOL if config.extract => {
                Self::Extract(serde_json::from_value(input.clone()).map_err(invalid)?)
            }
            PIN_TOOL if config.pin => Self::Pin(serde_json::from_value(input.clone()).map_err(invalid)?),
            other => return Err(PruneError::UnknownTool(other.to_string())),
        };
        call.validate()?;
        Ok(call)
    }

    fn validate(&self) -> Result<(), PruneError> {
        let ids = self.ids();
        if ids.is_empty() {
            return Err(PruneError::Validation("ids must not be empty".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(PruneError::Validation(format!("id {dup} listed twice")));
        }
        match self {
            Self::Extract(args) => {
                if args.distillation.len() != args.ids.len() {
                    return Err(PruneError::Validation(format!(
                        "extract needs one distillation per id: got {} ids and {} distillations",
                        args.ids.len(),
                        args.distillation.len()
                    )));
                }
                if let Some(pos) = args.distillation.iter().position(|d| d.trim().is_empty()) {
                    return Err(PruneError::Validation(format!(
                        "distillation for id {} is empty",
                        args.ids[pos]
                    )));
                }
            }
            Self::Pin(PinArgs {
                duration_turns: Some(turns),
                ..
            }) if *turns <= 0 => {
                return Err(PruneError::Validation(format!(
                    "durationTurns must be positive, got {turns}"
                )));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Discard(_) => DISCARD_TOOL,
            Self::Extract(_) => EXTRACT_TOOL,
            Self::Pin(_) => PIN_TOOL,
        }
    }

    pub fn ids(&self) -> &[String] {
        match self {
            Self::Discard(a) => &a.ids,
            Self::Extract(a) => &a.ids,
            Self::Pin(a) => &a.ids,
        }
    }

    /// Discard and extract remove content; pin only protects it.
    pub fn removes_content(&self) -> bool {
        !matches!(self, Self::Pin(_))
    }

    /// One-line description for confirmation prompts. Ids must resolve.
    pub fn describe(&self, state: &ConversationState) -> Result<String, PruneError> {
        let keys = state.resolve_ids(self.ids())?;
        let targets = describe_targets(state, self.ids(), &keys);
        Ok(format!("{} {targets}", self.name()))
    }

    /// Apply to state. Every id is resolved before anything changes, so a
    /// stale reference leaves the state untouched.
    pub fn apply(
        &self,
        state: &mut ConversationState,
        default_pin_turns: u64,
    ) -> Result<ToolOutcome, PruneError> {
        let keys = state.resolve_ids(self.ids())?;
        let targets = describe_targets(state, self.ids(), &keys);
        let message = match self {
            Self::Discard(args) => {
                let reason = PruneReason::from(args.reason);
                for key in &keys {
                    state.mark(PruneMark::new(key.clone(), reason));
                }
                format!("Discarded {} tool output(s) as {reason}: {targets}", keys.len())
            }
            Self::Extract(args) => {
                for (key, text) in keys.iter().zip(&args.distillation) {
                    state.mark(
                        PruneMark::new(key.clone(), PruneReason::UserDirected)
                            .with_replacement(text.clone()),
                    );
                }
                format!("Extracted {} tool output(s): {targets}", keys.len())
            }
            Self::Pin(args) => {
                let turns = args
                    .duration_turns
                    .and_then(|t| u64::try_from(t).ok())
                    .unwrap_or(default_pin_turns);
                let expiries: Vec<_> = keys
                    .iter()
                    .zip(self.ids())
                    .map(|(key, id)| format!("#{id} until turn {}", state.pin(key, turns)))
                    .collect();
                format!("Pinned {}", expiries.join(", "))
            }
        };
        Ok(ToolOutcome { message, keys })
    }
}

fn describe_targets(state: &ConversationState, ids: &[String], keys: &[String]) -> String {
    ids.iter()
        .zip(keys)
        .map(|(id, key)| match state.record(key) {
            Some(r) => match target_path(&r.parameters) {
                Some(path) => format!("#{id} {}({path})", r.tool_name),
                None => format!("#{id} {}", r.tool_name),
            },
            None => format!("#{id}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Tool definitions (name, description, input_schema) for the enabled tools.
pub fn schemas(config: &ToolsConfig) -> Vec<Value> {
    let ids = json!({
        "type": "array",
        "items": {"type": "string"},
        "description": "Ids from the <prunable-tools> list"
    });
    let mut out = Vec::new();
    if config.discard {
        out.push(json!({
            "name": DISCARD_TOOL,
            "description": "Remove tool outputs you no longer need from the conversation context. Use ids from the <prunable-tools> list.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "ids": ids,
                    "reason": {
                        "type": "string",
                        "enum": ["noise", "completion"],
                        "description": "noise: output was irrelevant. completion: the task it served is done."
                    }
                },
                "required": ["ids", "reason"]
            }
        }));
    }
    if config.extract {
        out.push(json!({
            "name": EXTRACT_TOOL,
            "description": "Replace tool outputs with your own condensed summary. distillation[i] replaces the output of ids[i].",
            "input_schema": {
                "type": "object",
                "properties": {
                    "ids": ids,
                    "distillation": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "One summary per id, in the same order"
                    }
                },
                "required": ["ids", "distillation"]
            }
        }));
    }
    if config.pin {
        out.push(json!({
            "name": PIN_TOOL,
            "description": "Keep tool outputs from being pruned automatically for a number of turns.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "ids": ids,
                    "durationTurns": {
                        "type": "integer",
                        "minimum": 1,
                        "description": format!("Turns to keep the outputs (default {})", config.default_pin_turns)
                    }
                },
                "required": ["ids"]
            }
        }));
    }
    out
}

/// Short `key=value` summary of call arguments.
pub fn summarize_args(parameters: &Value, max_len: usize) -> String {
    let summary = match parameters.as_object() {
        Some(obj) => obj
            .iter()
            .take(3)
            .map(|(k, v)| {
                let val = match v {
                    Value::String(s) => format!("\"{}\"", truncate_chars(s, 40)),
                    other => truncate_chars(&other.to_string(), 40),
                };
                format!("{k}={val}")
            })
            .collect::<Vec<_>>()
            .join(", "),
        None => parameters.to_string(),
    };
    truncate_chars(&summary, max_len)
}

/// Cut at `max` characters, marking the cut with `...`.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// The `<prunable-tools>` block injected into each request, or `None` when
/// nothing is prunable or every prune tool is disabled.
pub fn render_prunable_list(state: &ConversationState, config: &ToolsConfig) -> Option<String> {
    let keys = state.canonical_keys();
    if keys.is_empty() {
        return None;
    }
    let verbs: Vec<&str> = [
        (config.discard, DISCARD_TOOL),
        (config.extract, EXTRACT_TOOL),
        (config.pin, PIN_TOOL),
    ]
    .iter()
    .filter(|(on, _)| *on)
    .map(|(_, name)| *name)
    .collect();
    if verbs.is_empty() {
        return None;
    }

    let mut lines = vec![
        "<prunable-tools>".to_string(),
        format!(
            "Tool outputs available to {} by id (turn {}):",
            verbs.join("/"),
            state.turn_counter()
        ),
    ];
    for (i, key) in keys.iter().enumerate() {
        let Some(record) = state.record(key) else {
            continue;
        };
        let mut line = format!(
            "{}: {}({})",
            i + 1,
            record.tool_name,
            summarize_args(&record.parameters, 80)
        );
        if let Some(expiry) = state.pin_expiry(key).filter(|_| state.is_pinned(key)) {
            line.push_str(&format!(" [pinned until turn {expiry}]"));
        }
        lines.push(line);
    }
    lines.push("</prunable-tools>".to_string());
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::ProtectionGuard;
    use crate::strategy::testing::{history, synced};

    fn state() -> ConversationState {
        let body = history(&[
            ("call_x", "bash", json!({"command": "ls"}), true),
            ("call_abc", "read", json!({"filePath": "/a.ts"}), true),
            ("call_def", "read", json!({"filePath": "/b.ts"}), true),
        ]);
        synced(&body, &ProtectionGuard::default())
    }

    fn parse(name: &str, input: Value) -> Result<PruneToolCall, PruneError> {
        PruneToolCall::parse(name, &input, &ToolsConfig::default())
    }

    #[test]
    fn extract_pairs_ids_with_distillations() {
        let mut state = state();
        let call = parse(EXTRACT_TOOL, json!({"ids": ["2", 3], "distillation": ["summary A", "summary B"]})).unwrap();
        let outcome = call.apply(&mut state, 5).unwrap();
        assert_eq!(outcome.keys, vec!["call_abc", "call_def"]);
        let mark = state.mark_for("call_abc").unwrap();
        assert_eq!(mark.reason, PruneReason::UserDirected);
        assert_eq!(mark.replacement.as_deref(), Some("summary A"));
        assert_eq!(
            state.mark_for("call_def").unwrap().replacement.as_deref(),
            Some("summary B")
        );
    }

    #[test]
    fn stale_id_rejects_whole_call_without_mutation() {
        let mut state = state();
        let call = parse(EXTRACT_TOOL, json!({"ids": ["1", "99"], "distillation": ["a", "x"]})).unwrap();
        let err = call.apply(&mut state, 5).unwrap_err();
        assert!(matches!(err, PruneError::StaleReference { ref ids } if ids == &["99".to_string()]));
        assert!(err.is_rejection());
        assert!(!state.is_marked("call_x"));
    }

    #[test]
    fn mismatched_lengths_are_invalid() {
        let err = parse(EXTRACT_TOOL, json!({"ids": ["1", "2"], "distillation": ["only one"]})).unwrap_err();
        assert!(matches!(err, PruneError::Validation(_)));
    }

    #[test]
    fn discard_validates_reason_and_ids() {
        assert!(matches!(
            parse(DISCARD_TOOL, json!({"ids": ["1"], "reason": "boredom"})),
            Err(PruneError::Validation(_))
        ));
        assert!(matches!(
            parse(DISCARD_TOOL, json!({"ids": [], "reason": "noise"})),
            Err(PruneError::Validation(_))
        ));
        assert!(matches!(
            parse(DISCARD_TOOL, json!({"ids": ["1", "1"], "reason": "noise"})),
            Err(PruneError::Validation(_))
        ));
    }

    #[test]
    fn discard_marks_with_reason() {
        let mut state = state();
        let outcome = parse(DISCARD_TOOL, json!({"ids": ["1"], "reason": "completion"}))
            .unwrap()
            .apply(&mut state, 5)
            .unwrap();
        assert_eq!(state.mark_for("call_x").unwrap().reason, PruneReason::Completion);
        assert!(state.mark_for("call_x").unwrap().replacement.is_none());
        assert!(outcome.message.contains("#1 bash"));
    }

    #[test]
    fn pin_sets_expiry_from_turn_counter() {
        let mut state = state();
        assert_eq!(state.turn_counter(), 3);
        let outcome = parse(PIN_TOOL, json!({"ids": ["2"], "durationTurns": 4}))
            .unwrap()
            .apply(&mut state, 5)
            .unwrap();
        assert_eq!(state.pin_expiry("call_abc"), Some(7));
        assert_eq!(outcome.message, "Pinned #2 until turn 7");

        parse(PIN_TOOL, json!({"ids": ["3"]})).unwrap().apply(&mut state, 5).unwrap();
        assert_eq!(state.pin_expiry("call_def"), Some(8));

        assert!(matches!(
            parse(PIN_TOOL, json!({"ids": ["1"], "durationTurns": 0})),
            Err(PruneError::Validation(_))
        ));
    }

    #[test]
    fn disabled_tool_is_unknown() {
        let config = ToolsConfig {
            extract: false,
            ..ToolsConfig::default()
        };
        let err = PruneToolCall::parse(EXTRACT_TOOL, &json!({}), &config).unwrap_err();
        assert!(matches!(err, PruneError::UnknownTool(_)));
        assert_eq!(schemas(&config).len(), 2);
    }

    #[test]
    fn prunable_list_shows_ids_args_and_pins() {
        let mut state = state();
        state.pin("call_abc", 2);
        let text = render_prunable_list(&state, &ToolsConfig::default()).unwrap();
        assert!(text.starts_with("<prunable-tools>"));
        assert!(text.contains("1: bash(command=\"ls\")"));
        assert!(text.contains("2: read(filePath=\"/a.ts\") [pinned until turn 5]"));
        assert!(text.ends_with("</prunable-tools>"));
    }

    #[test]
    fn long_arguments_are_cut_on_char_boundaries() {
        let summary = summarize_args(&json!({"content": "é".repeat(100)}), 30);
        assert_eq!(summary.chars().count(), 30);
        assert!(summary.ends_with("..."));
    }
}
