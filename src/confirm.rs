use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::error::PruneError;

/// An outstanding request for the user to approve a prune. Returned by
/// [`ConfirmationBroker::request`] and completed by
/// [`ConfirmationBroker::resolve`] with the same request id.
#[derive(Debug)]
pub struct PendingConfirmation {
    pub request_id: String,
    pub conversation_id: String,
    pub summary: String,
    receiver: oneshot::Receiver<bool>,
}

impl PendingConfirmation {
    /// Wait for the user's answer. A request cancelled or dropped by the
    /// broker is an error, not a denial.
    pub async fn wait(self) -> Result<bool, PruneError> {
        self.receiver.await.map_err(|_| {
            PruneError::Confirmation(format!("request {} was cancelled", self.request_id))
        })
    }
}

struct Waiting {
    conversation_id: String,
    reply: oneshot::Sender<bool>,
}

/// Routes confirmation answers to their requests. At most one request may
/// be outstanding per conversation.
#[derive(Default)]
pub struct ConfirmationBroker {
    pending: Mutex<HashMap<String, Waiting>>,
}

impl ConfirmationBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn request(
        &self,
        conversation_id: &str,
        summary: impl Into<String>,
    ) -> Result<PendingConfirmation, PruneError> {
        let mut pending = self.pending.lock().await;
        // A request whose waiter went away no longer blocks the conversation.
        pending.retain(|_, w| !w.reply.is_closed());
        if pending.values().any(|w| w.conversation_id == conversation_id) {
            return Err(PruneError::Confirmation(format!(
                "conversation {conversation_id} already has a pending confirmation"
            )));
        }
        let request_id = Uuid::new_v4().to_string();
        let (reply, receiver) = oneshot::channel();
        pending.insert(
            request_id.clone(),
            Waiting {
                conversation_id: conversation_id.to_string(),
                reply,
            },
        );
        debug!(conversation = conversation_id, request_id = %request_id, "confirmation requested");
        Ok(PendingConfirmation {
            request_id,
            conversation_id: conversation_id.to_string(),
            summary: summary.into(),
            receiver,
        })
    }

    /// Answer a request.
    pub async fn resolve(&self, request_id: &str, approved: bool) -> Result<(), PruneError> {
        let waiting = self
            .pending
            .lock()
            .await
            .remove(request_id)
            .ok_or_else(|| PruneError::Confirmation(format!("unknown request {request_id}")))?;
        waiting.reply.send(approved).map_err(|_| {
            PruneError::Confirmation(format!("request {request_id} is no longer waiting"))
        })
    }

    /// Drop any request outstanding for the conversation; its waiter sees
    /// an error.
    pub async fn cancel(&self, conversation_id: &str) {
        self.pending
            .lock()
            .await
            .retain(|_, w| w.conversation_id != conversation_id);
    }

    pub async fn pending_request(&self, conversation_id: &str) -> Option<String> {
        self.pending
            .lock()
            .await
            .iter()
            .find(|(_, w)| w.conversation_id == conversation_id)
            .map(|(id, _)| id.clone())
    }
}
