use std::sync::Arc;
use std::time::Duration;

use uatz_gateway::listener::ListenerManager;
use uatz_gateway::registry::DeviceRegistry;
use uatz_gateway::sink::BroadcastSink;

pub struct AppStateInner {
    pub listeners: ListenerManager,
    pub sink: BroadcastSink,
    /// Shared secret expected in `X-Api-Key`.
    pub api_key: String,
    /// How long `/connect` waits for the first pairing code.
    pub pairing_timeout: Duration,
}

impl AppStateInner {
    pub fn registry(&self) -> &DeviceRegistry {
        self.listeners.registry()
    }
}

pub type AppState = Arc<AppStateInner>;
