use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::PruneError;
use crate::state::ConversationState;

/// Persists conversation state so counting resumes after a restart.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Save the current state of a conversation.
    async fn save(&self, conversation_id: &str, state: &ConversationState) -> Result<(), PruneError>;

    /// Load the saved state, if any.
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>, PruneError>;

    /// Remove the saved state. Missing state is not an error.
    async fn delete(&self, conversation_id: &str) -> Result<(), PruneError>;
}

// --- NoSessionStore ---

/// No persistence. State lives as long as the engine.
pub struct NoSessionStore;

#[async_trait]
impl SessionStore for NoSessionStore {
    async fn save(&self, _: &str, _: &ConversationState) -> Result<(), PruneError> {
        Ok(())
    }

    async fn load(&self, _: &str) -> Result<Option<ConversationState>, PruneError> {
        Ok(None)
    }

    async fn delete(&self, _: &str) -> Result<(), PruneError> {
        Ok(())
    }
}

// --- FileSessionStore ---

/// Saves conversation state to disk as JSON, one file per conversation.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Conversation ids come from the host; keep them to one path segment.
    fn path(&self, conversation_id: &str) -> PathBuf {
        let name: String = conversation_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, conversation_id: &str, state: &ConversationState) -> Result<(), PruneError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PruneError::Session(e.to_string()))?;
        let json =
            serde_json::to_string_pretty(state).map_err(|e| PruneError::Session(e.to_string()))?;
        tokio::fs::write(self.path(conversation_id), json)
            .await
            .map_err(|e| PruneError::Session(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>, PruneError> {
        match tokio::fs::read_to_string(self.path(conversation_id)).await {
            Ok(json) => {
                let state: ConversationState =
                    serde_json::from_str(&json).map_err(|e| PruneError::Session(e.to_string()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PruneError::Session(e.to_string())),
        }
    }

    async fn delete(&self, conversation_id: &str) -> Result<(), PruneError> {
        match tokio::fs::remove_file(self.path(conversation_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PruneError::Session(e.to_string())),
        }
    }
}
