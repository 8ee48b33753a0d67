use thiserror::Error;

/// Failures surfaced by a protocol client implementation.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("session {0} is unknown to the protocol layer")]
    UnknownSession(String),

    #[error("client is not connected")]
    NotConnected,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("protocol layer rejected the request: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device already exists: {0}")]
    DeviceExists(String),

    #[error("could not resolve a client for {jid}: {source}")]
    ClientResolution {
        jid: String,
        #[source]
        source: ProtocolError,
    },

    #[error("listener registration failed for {jid}: {source}")]
    Listener {
        jid: String,
        #[source]
        source: ProtocolError,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("media download failed: {0}")]
    Download(#[source] ProtocolError),

    #[error("message type not recognized")]
    UnrecognizedMessage,

    #[error("webhook delivery to {url} failed: {reason}")]
    Webhook { url: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
