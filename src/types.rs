use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a tool invocation as observed in the message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    /// A call whose result has not arrived yet. Never pruned.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ToolStatus::Pending | ToolStatus::Running)
    }
}

/// Why an invocation became prunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    Noise,
    Completion,
    Duplicate,
    Superseded,
    Size,
    UserDirected,
}

impl PruneReason {
    /// Reasons produced without the LLM asking for them.
    pub fn is_automatic(self) -> bool {
        matches!(
            self,
            PruneReason::Duplicate | PruneReason::Superseded | PruneReason::Size
        )
    }
}

impl std::fmt::Display for PruneReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PruneReason::Noise => "noise",
            PruneReason::Completion => "completion",
            PruneReason::Duplicate => "duplicate",
            PruneReason::Superseded => "superseded",
            PruneReason::Size => "size",
            PruneReason::UserDirected => "user-directed",
        };
        f.write_str(s)
    }
}

/// One tool call ever seen in a conversation. Never deleted, only flagged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub correlation_key: String,
    pub tool_name: String,
    pub parameters: Value,
    pub status: ToolStatus,
    /// Ordinal of the assistant step that produced the call.
    pub turn_index: u64,
}

/// A decision that an invocation's content may be rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneMark {
    pub correlation_key: String,
    pub reason: PruneReason,
    /// Custom result text (from `extract`). `None` means the generic placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
}

impl PruneMark {
    pub fn new(key: impl Into<String>, reason: PruneReason) -> Self {
        Self {
            correlation_key: key.into(),
            reason,
            replacement: None,
        }
    }

    pub fn with_replacement(mut self, text: impl Into<String>) -> Self {
        self.replacement = Some(text.into());
        self
    }
}

/// Location of a tool call or result inside a format's data array.
/// `part` indexes the block/part/tool_call entry; whole-message results use 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub message: usize,
    pub part: usize,
}

/// A tool call read from the live message list.
#[derive(Debug, Clone)]
pub struct ToolCallRef {
    pub correlation_key: String,
    pub tool_name: String,
    /// Parsed arguments, or the parse error for malformed payloads.
    pub parameters: Result<Value, String>,
    pub message_index: usize,
}

/// A tool result read from the live message list.
#[derive(Debug, Clone)]
pub struct ToolOutputRef {
    pub correlation_key: String,
    pub tool_name: String,
    pub message_index: usize,
    /// Serialized size of the result content in bytes.
    pub size: usize,
    pub is_error: bool,
}

/// Token usage reported by the provider for the last inference call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        // Counts come from untrusted provider JSON.
        self.input_tokens
            .saturating_add(self.cache_read_tokens)
            .saturating_add(self.output_tokens)
    }
}

/// Cumulative savings for a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneStats {
    pub pruned_count: u64,
    pub tokens_saved: u64,
    pub bytes_saved: u64,
}
