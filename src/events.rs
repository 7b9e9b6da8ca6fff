use crate::compaction::CompactionPhase;
use crate::types::PruneReason;

/// Events emitted by the engine, for the notification / UI layer.
#[derive(Debug, Clone)]
pub enum PruneEvent {
    Pruned {
        conversation_id: String,
        items: Vec<PrunedItem>,
        tokens_saved: u64,
        total_tokens_saved: u64,
    },
    CompactionTriggered {
        conversation_id: String,
        usage_ratio: f64,
    },
    CompactionFinished {
        conversation_id: String,
        phases: Vec<CompactionPhase>,
        usage_ratio: f64,
    },
    ConfirmationRequested {
        conversation_id: String,
        request_id: String,
        summary: String,
    },
    Error {
        conversation_id: String,
        message: String,
    },
}

/// One newly pruned invocation, as shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct PrunedItem {
    pub tool_name: String,
    pub reason: PruneReason,
}

impl PruneEvent {
    /// Human-readable one-liner for toasts and status lines.
    pub fn summary(&self) -> String {
        match self {
            PruneEvent::Pruned {
                items,
                tokens_saved,
                total_tokens_saved,
                ..
            } => {
                let tools = items
                    .iter()
                    .map(|i| format!("{} ({})", i.tool_name, i.reason))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "pruned {} tool output(s): {tools}; saved ~{tokens_saved} tokens (~{total_tokens_saved} total)",
                    items.len()
                )
            }
            PruneEvent::CompactionTriggered { usage_ratio, .. } => {
                format!("context at {:.0}%, compacting", usage_ratio * 100.0)
            }
            PruneEvent::CompactionFinished {
                phases,
                usage_ratio,
                ..
            } => {
                let last = phases
                    .last()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "idle".into());
                format!("compaction {last}, context at {:.0}%", usage_ratio * 100.0)
            }
            PruneEvent::ConfirmationRequested { summary, .. } => {
                format!("confirm pruning: {summary}")
            }
            PruneEvent::Error { message, .. } => format!("pruning error: {message}"),
        }
    }
}
