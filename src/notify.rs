use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::PruneError;
use crate::events::PruneEvent;

/// Delivers engine events to the host's UI or notification layer.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: PruneEvent) -> Result<(), PruneError>;
}

/// Drops every event.
pub struct NoNotifier;

#[async_trait]
impl Notifier for NoNotifier {
    async fn notify(&self, _: PruneEvent) -> Result<(), PruneError> {
        Ok(())
    }
}

/// Forwards events over a bounded channel. Never waits for the receiver:
/// a full or closed channel drops the event and reports an error.
pub struct ChannelNotifier {
    tx: mpsc::Sender<PruneEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<PruneEvent>) -> Self {
        Self { tx }
    }

    /// A notifier and the receiving end of its channel.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<PruneEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: PruneEvent) -> Result<(), PruneError> {
        self.tx
            .try_send(event)
            .map_err(|e| PruneError::Notification(e.to_string()))
    }
}
