use std::collections::HashMap;

use tracing::debug;

use super::PruneStrategy;
use crate::guard::{target_path, ProtectionGuard};
use crate::state::ConversationState;
use crate::types::{PruneMark, PruneReason, ToolStatus};

/// A write whose target file was later read back successfully carries
/// redundant arguments: the read shows the current content. The write is
/// marked `superseded`; the read is never touched.
pub struct SupersedeWrites {
    write_tools: Vec<String>,
    read_tools: Vec<String>,
}

impl SupersedeWrites {
    pub fn new(write_tools: Vec<String>, read_tools: Vec<String>) -> Self {
        let lower = |v: Vec<String>| v.into_iter().map(|t| t.to_ascii_lowercase()).collect();
        Self {
            write_tools: lower(write_tools),
            read_tools: lower(read_tools),
        }
    }

    fn is_write(&self, tool: &str) -> bool {
        self.write_tools.contains(&tool.to_ascii_lowercase())
    }

    fn is_read(&self, tool: &str) -> bool {
        self.read_tools.contains(&tool.to_ascii_lowercase())
    }
}

impl PruneStrategy for SupersedeWrites {
    fn name(&self) -> &str {
        "supersede_writes"
    }

    fn evaluate(&self, state: &ConversationState, guard: &ProtectionGuard) -> Vec<PruneMark> {
        let records: Vec<_> = state.live_records().collect();

        // Position of the last successful read per path.
        let mut last_read: HashMap<&str, usize> = HashMap::new();
        for (pos, record) in records.iter().enumerate() {
            if !self.is_read(&record.tool_name) || record.status != ToolStatus::Completed {
                continue;
            }
            if let Some(path) = target_path(&record.parameters) {
                last_read.insert(path, pos);
            }
        }

        let mut marks = Vec::new();
        for (pos, record) in records.iter().enumerate() {
            if !self.is_write(&record.tool_name) {
                continue;
            }
            let Some(path) = target_path(&record.parameters) else {
                continue;
            };
            let read_later = last_read.get(path).is_some_and(|&read_pos| read_pos > pos);
            if read_later && state.is_auto_prunable(&record.correlation_key, guard) {
                debug!(key = %record.correlation_key, path, "write superseded by later read");
                marks.push(PruneMark::new(
                    record.correlation_key.clone(),
                    PruneReason::Superseded,
                ));
            }
        }
        marks
    }
}
