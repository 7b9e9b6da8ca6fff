use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::budget::bytes_to_tokens;
use crate::error::PruneError;
use crate::format::FormatDescriptor;
use crate::state::ConversationState;
use crate::tools::truncate_chars;
use crate::types::{PruneReason, ToolCallRef, ToolInvocationRecord};

/// String arguments longer than this are collapsed to a preview when their
/// call is rewritten.
pub const INPUT_PREVIEW_THRESHOLD: usize = 200;
const INPUT_PREVIEW_CHARS: usize = 80;

/// A mark rewritten for the first time.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedPrune {
    pub correlation_key: String,
    pub tool_name: String,
    pub reason: PruneReason,
    pub bytes_saved: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RewriteReport {
    /// Marks applied for the first time; savings are credited for these only.
    pub applied: Vec<AppliedPrune>,
    /// Pairs rewritten in this pass, including re-applications.
    pub rewritten: usize,
    /// Marked calls still waiting for their result.
    pub pending: usize,
    /// Keys whose rewrite was refused to keep the list intact.
    pub refused: Vec<String>,
}

impl RewriteReport {
    pub fn bytes_saved(&self) -> u64 {
        self.applied.iter().map(|a| a.bytes_saved).sum()
    }

    pub fn tokens_saved(&self) -> u64 {
        bytes_to_tokens(self.bytes_saved())
    }
}

enum PairOutcome {
    Rewritten { bytes_saved: u64 },
    Pending,
    Absent,
}

/// Replacement arguments for a rewritten call. Superseded writes lose their
/// input entirely; otherwise long strings become previews.
pub fn compact_input(reason: PruneReason, parameters: &Value) -> Value {
    if reason == PruneReason::Superseded {
        return Value::Object(Map::new());
    }
    compact_value(parameters)
}

fn compact_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > INPUT_PREVIEW_THRESHOLD => Value::String(format!(
            "{} [{} chars pruned]",
            truncate_chars(s, INPUT_PREVIEW_CHARS),
            s.chars().count()
        )),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), compact_value(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(compact_value).collect()),
        other => other.clone(),
    }
}

fn serialized_len(data: &[Value], indices: &[usize]) -> u64 {
    indices
        .iter()
        .map(|&i| data[i].to_string().len() as u64)
        .sum()
}

/// The live call at a record's key must still be that record's call. Its
/// arguments are either the originals or what a previous rewrite wrote.
fn check_identity(
    live: Option<&ToolCallRef>,
    record: &ToolInvocationRecord,
    input: &Value,
) -> Result<(), PruneError> {
    let Some(call) = live else {
        return Ok(());
    };
    let matches = call.tool_name == record.tool_name
        && call
            .parameters
            .as_ref()
            .is_ok_and(|p| *p == record.parameters || p == input);
    if matches {
        Ok(())
    } else {
        Err(PruneError::Structural(format!(
            "call at {} is {}, not the cached {}",
            record.correlation_key, call.tool_name, record.tool_name
        )))
    }
}

/// Rewrite one call/result pair, or nothing. Both halves are located before
/// either is touched, and any failure after that restores the touched turns.
fn apply_pair(
    descriptor: &dyn FormatDescriptor,
    data: &mut [Value],
    key: &str,
    output: &str,
    input: &Value,
) -> Result<PairOutcome, PruneError> {
    if descriptor.is_positional() {
        descriptor.verify_pairing(data, key)?;
    }
    let (call, result) = match (
        descriptor.locate_call(data, key),
        descriptor.locate_result(data, key),
    ) {
        (Some(call), Some(result)) => (call, result),
        (Some(_), None) => return Ok(PairOutcome::Pending),
        (None, None) => return Ok(PairOutcome::Absent),
        (None, Some(_)) => {
            return Err(PruneError::Structural(format!(
                "result {key} has no matching call"
            )))
        }
    };

    let mut touched = vec![call.message, result.message];
    touched.sort_unstable();
    touched.dedup();
    let backup: Vec<(usize, Value)> = touched.iter().map(|&i| (i, data[i].clone())).collect();
    let before = serialized_len(data, &touched);
    let markers = descriptor.cache_marker_count(data);

    let written = descriptor.replace_tool_output(data, key, output)
        && descriptor.replace_tool_input(data, key, input);
    let markers_after = descriptor.cache_marker_count(data);
    let max_markers = descriptor.max_cache_breakpoints();
    let failure = if !written {
        Some(format!("rewrite of {key} could not write both halves"))
    } else if markers_after != markers {
        Some(format!(
            "rewrite of {key} changed cache markers from {markers} to {markers_after}"
        ))
    } else if max_markers > 0 && markers_after > max_markers {
        Some(format!(
            "{markers_after} cache markers exceed the limit of {max_markers}"
        ))
    } else {
        None
    };
    if let Some(message) = failure {
        for (i, original) in backup {
            data[i] = original;
        }
        return Err(PruneError::Structural(message));
    }

    let after = serialized_len(data, &touched);
    Ok(PairOutcome::Rewritten {
        bytes_saved: before.saturating_sub(after),
    })
}

/// Apply every mark whose pair is present in `data`.
///
/// Re-applying a mark produces the same content, so running this on every
/// transform is safe. Savings are credited to the state only the first time
/// a key is applied.
pub fn apply_marks(
    descriptor: &dyn FormatDescriptor,
    data: &mut [Value],
    state: &mut ConversationState,
    placeholder: &str,
) -> RewriteReport {
    let mut report = RewriteReport::default();
    let marks = state.marks_in_order();
    if marks.is_empty() {
        return report;
    }
    let live_calls: HashMap<String, ToolCallRef> = descriptor
        .tool_calls(data)
        .into_iter()
        .map(|c| (c.correlation_key.clone(), c))
        .collect();
    for mark in marks {
        let key = mark.correlation_key.as_str();
        let Some(record) = state.record(key) else {
            continue;
        };
        let tool_name = record.tool_name.clone();
        let input = compact_input(mark.reason, &record.parameters);
        let output = mark.replacement.as_deref().unwrap_or(placeholder);

        let outcome = check_identity(live_calls.get(key), record, &input)
            .and_then(|()| apply_pair(descriptor, data, key, output, &input));
        match outcome {
            Ok(PairOutcome::Rewritten { bytes_saved }) => {
                report.rewritten += 1;
                if state.record_applied(key, bytes_saved) {
                    info!(
                        conversation = %state.conversation_id(),
                        key,
                        tool = %tool_name,
                        reason = %mark.reason,
                        saved_tokens = bytes_to_tokens(bytes_saved),
                        "pruned tool output"
                    );
                    report.applied.push(AppliedPrune {
                        correlation_key: key.to_string(),
                        tool_name,
                        reason: mark.reason,
                        bytes_saved,
                    });
                }
            }
            Ok(PairOutcome::Pending) => {
                debug!(key, "marked call has no result yet");
                report.pending += 1;
            }
            Ok(PairOutcome::Absent) => {}
            Err(e) => {
                warn!(
                    conversation = %state.conversation_id(),
                    key,
                    tool = %tool_name,
                    error = %e,
                    "refusing rewrite"
                );
                report.refused.push(key.to_string());
            }
        }
    }
    report
}
