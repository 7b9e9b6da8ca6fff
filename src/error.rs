#[derive(Debug, thiserror::Error)]
pub enum PruneError {
    #[error("malformed tool arguments: {0}")]
    Parse(String),
    #[error("unknown or stale tool ids: {}", .ids.join(", "))]
    StaleReference { ids: Vec<String> },
    #[error("invalid tool input: {0}")]
    Validation(String),
    #[error("structural integrity: {0}")]
    Structural(String),
    #[error("unknown prune tool: {0}")]
    UnknownTool(String),
    #[error("summarization failed: {0}")]
    Summarization(String),
    #[error("session error: {0}")]
    Session(String),
    #[error("notification failed: {0}")]
    Notification(String),
    #[error("confirmation error: {0}")]
    Confirmation(String),
}

impl PruneError {
    /// True for errors caused by the caller's input, which the LLM can fix and retry.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PruneError::StaleReference { .. }
                | PruneError::Validation(_)
                | PruneError::UnknownTool(_)
        )
    }
}
