//! Capability traits over the WhatsApp protocol layer. The gateway never
//! speaks the wire protocol itself; it drives whatever implements these.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use uatz_types::events::{
    ClientEvent, DeviceIdentity, MediaKind, MediaRef, NumberLookup, OutgoingContent,
    PairingEvent, SendReceipt, UploadRef,
};

use crate::error::ProtocolError;

/// Server part of one-to-one chat JIDs.
pub const USER_SERVER: &str = "s.whatsapp.net";
/// Server part of group chat JIDs.
pub const GROUP_SERVER: &str = "g.us";

/// Callback invoked by a client for every event it receives. Runs on the
/// client's own task, so it must hand real work off instead of blocking.
pub type EventHandler = Arc<dyn Fn(ClientEvent) + Send + Sync>;

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn connect(&self) -> Result<(), ProtocolError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// `None` until the session has been paired.
    fn identity(&self) -> Option<DeviceIdentity>;

    /// Registers a handler and returns an id usable with `remove_event_handler`.
    fn add_event_handler(&self, handler: EventHandler) -> Result<u32, ProtocolError>;

    fn remove_event_handler(&self, id: u32) -> bool;

    async fn send_message(
        &self,
        to: &str,
        content: OutgoingContent,
    ) -> Result<SendReceipt, ProtocolError>;

    async fn download(&self, media: &MediaRef) -> Result<Vec<u8>, ProtocolError>;

    async fn upload(&self, data: Vec<u8>, kind: MediaKind) -> Result<UploadRef, ProtocolError>;

    async fn is_on_whatsapp(&self, numbers: &[String]) -> Result<Vec<NumberLookup>, ProtocolError>;
}

/// A client that has started pairing, plus its pairing progress.
pub struct Pairing {
    pub client: Arc<dyn ProtocolClient>,
    pub events: mpsc::Receiver<PairingEvent>,
}

/// Hands out live clients per session.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Returns a connected client for an already-paired session.
    async fn client_for(&self, jid: &str) -> Result<Arc<dyn ProtocolClient>, ProtocolError>;

    /// Starts pairing a brand-new session.
    async fn pair(&self) -> Result<Pairing, ProtocolError>;

    /// Drops whatever is cached for `jid`. Called once a session has logged
    /// out for good.
    async fn forget(&self, jid: &str);
}

/// Builds a chat JID from a bare number or group id.
pub fn chat_jid(user: &str, is_group: bool) -> String {
    if user.contains('@') {
        return user.to_string();
    }
    let server = if is_group { GROUP_SERVER } else { USER_SERVER };
    format!("{}@{}", user, server)
}

/// Resolves a phone number to its WhatsApp JID, failing if it is not
/// registered.
pub async fn resolve_number(
    client: &dyn ProtocolClient,
    number: &str,
) -> Result<String, ProtocolError> {
    let lookups = client.is_on_whatsapp(&[number.to_string()]).await?;
    match lookups.into_iter().next() {
        Some(NumberLookup { is_in: true, jid: Some(jid), .. }) => Ok(jid),
        Some(NumberLookup { is_in: true, jid: None, .. }) => Ok(chat_jid(number, false)),
        _ => Err(ProtocolError::Rejected(format!(
            "number is not registered in WhatsApp: {}",
            number
        ))),
    }
}
