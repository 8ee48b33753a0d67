use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use uatz_types::events::GatewayEvent;
use uatz_types::models::StoredMessage;

use crate::error::Result;

/// Destination for every normalized inbound message, independent of
/// webhook delivery.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn publish(&self, device_id: i64, message: StoredMessage) -> Result<()>;
}

/// Fans messages out to every connected `/gateway` consumer.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<GatewayEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn consumer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageSink for BroadcastSink {
    async fn publish(&self, device_id: i64, message: StoredMessage) -> Result<()> {
        let message_id = message.message_id.clone();
        // No consumers is not an error; the message is simply not streamed.
        if self
            .tx
            .send(GatewayEvent::MessageReceived { device_id, message })
            .is_err()
        {
            trace!("No gateway consumers for message {} of device {}", message_id, device_id);
        }
        Ok(())
    }
}
