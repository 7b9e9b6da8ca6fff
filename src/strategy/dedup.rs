use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use super::PruneStrategy;
use crate::guard::ProtectionGuard;
use crate::state::ConversationState;
use crate::types::{PruneMark, PruneReason, ToolInvocationRecord};

/// Marks repeated identical calls: same tool, same arguments. The most
/// recent call in each group keeps its output.
pub struct Deduplication {
    protected_tools: Vec<String>,
}

impl Deduplication {
    pub fn new(protected_tools: Vec<String>) -> Self {
        Self {
            protected_tools: protected_tools
                .into_iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
        }
    }

    fn exempt(&self, tool_name: &str) -> bool {
        let name = tool_name.to_ascii_lowercase();
        self.protected_tools.iter().any(|t| *t == name)
    }
}

impl Default for Deduplication {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Serialization with object keys sorted at every level, so argument order
/// never splits a group.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}

impl PruneStrategy for Deduplication {
    fn name(&self) -> &str {
        "deduplication"
    }

    fn evaluate(&self, state: &ConversationState, guard: &ProtectionGuard) -> Vec<PruneMark> {
        let mut groups: HashMap<(String, String), Vec<&ToolInvocationRecord>> = HashMap::new();
        let mut group_order = Vec::new();
        for record in state.live_records() {
            let signature = (record.tool_name.clone(), canonical_json(&record.parameters));
            let group = groups.entry(signature.clone()).or_default();
            if group.is_empty() {
                group_order.push(signature);
            }
            group.push(record);
        }

        let mut marks = Vec::new();
        for signature in group_order {
            let Some(group) = groups.get(&signature) else {
                continue;
            };
            if group.len() < 2 {
                continue;
            }
            let tool = &signature.0;
            if self.exempt(tool) || guard.protects(group[0]) {
                continue;
            }
            if group.iter().any(|r| r.status.is_in_flight()) {
                debug!(tool = %tool, "duplicate group has an in-flight call, skipping");
                continue;
            }
            let older = &group[..group.len() - 1];
            for record in older {
                if state.is_auto_prunable(&record.correlation_key, guard) {
                    debug!(
                        key = %record.correlation_key,
                        tool = %record.tool_name,
                        "marking duplicate"
                    );
                    marks.push(PruneMark::new(
                        record.correlation_key.clone(),
                        PruneReason::Duplicate,
                    ));
                }
            }
        }
        marks
    }
}
