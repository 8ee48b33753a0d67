//! Protocol client backed by an external WhatsApp sidecar.
//!
//! Commands go over HTTP; events arrive on a per-session WebSocket. The
//! sidecar addresses a session by the key it handed out when pairing
//! started or, once paired, by its JID.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use uatz_types::events::{
    ClientEvent, DeviceIdentity, MediaKind, MediaRef, MessageEvent, NumberLookup,
    OutgoingContent, PairingEvent, SendReceipt, UploadRef,
};

use crate::client::{ClientProvider, EventHandler, Pairing, ProtocolClient};
use crate::error::ProtocolError;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Frames pushed by the sidecar on a session's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BridgeFrame {
    Qr { code: String },
    PairSuccess { identity: DeviceIdentity },
    PairTimeout,
    Connected {
        #[serde(default)]
        identity: Option<DeviceIdentity>,
    },
    Disconnected,
    LoggedOut {
        #[serde(default)]
        reason: Option<String>,
    },
    Message(Box<MessageEvent>),
}

#[derive(Debug, Deserialize)]
struct NewSession {
    session: String,
}

#[derive(Serialize)]
struct SendBody<'a> {
    to: &'a str,
    content: OutgoingContent,
}

#[derive(Serialize)]
struct LookupBody<'a> {
    numbers: &'a [String],
}

fn transport(e: reqwest::Error) -> ProtocolError {
    ProtocolError::Transport(e.to_string())
}

pub struct BridgeClient {
    http: reqwest::Client,
    base_url: String,
    session: String,
    send_timeout: Duration,
    identity: std::sync::Mutex<Option<DeviceIdentity>>,
    connected: AtomicBool,
    handlers: std::sync::Mutex<Vec<(u32, EventHandler)>>,
    next_handler: AtomicU32,
    pairing: std::sync::Mutex<Option<mpsc::Sender<PairingEvent>>>,
    logged_out: AtomicBool,
    stream: CancellationToken,
}

impl BridgeClient {
    fn start(
        http: reqwest::Client,
        base_url: &str,
        session: String,
        identity: Option<DeviceIdentity>,
        send_timeout: Duration,
        pairing: Option<mpsc::Sender<PairingEvent>>,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
            send_timeout,
            identity: std::sync::Mutex::new(identity),
            connected: AtomicBool::new(false),
            handlers: std::sync::Mutex::new(Vec::new()),
            next_handler: AtomicU32::new(1),
            pairing: std::sync::Mutex::new(pairing),
            logged_out: AtomicBool::new(false),
            stream: CancellationToken::new(),
        });
        client.spawn_event_stream();
        client
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}/sessions/{}{}", self.base_url, self.session, path)
    }

    fn events_url(&self) -> String {
        self.url("/events").replacen("http", "ws", 1)
    }

    fn spawn_event_stream(self: &Arc<Self>) {
        tokio::spawn(run_event_stream(
            Arc::downgrade(self),
            self.events_url(),
            self.stream.clone(),
        ));
    }

    async fn checked(&self, resp: reqwest::Response) -> Result<reqwest::Response, ProtocolError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match status {
            StatusCode::NOT_FOUND => Err(ProtocolError::UnknownSession(self.session.clone())),
            StatusCode::CONFLICT => Err(ProtocolError::NotConnected),
            _ => {
                let body = resp.text().await.unwrap_or_default();
                Err(ProtocolError::Rejected(format!("HTTP {}: {}", status.as_u16(), body)))
            }
        }
    }

    async fn fetch_identity(&self) -> Result<DeviceIdentity, ProtocolError> {
        let resp = self.http.get(self.url("")).send().await.map_err(transport)?;
        self.checked(resp).await?.json().await.map_err(transport)
    }

    fn emit(&self, event: ClientEvent) {
        let handlers: Vec<EventHandler> = match self.handlers.lock() {
            Ok(h) => h.iter().map(|(_, h)| h.clone()).collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(event.clone());
        }
    }

    fn pairing_sender(&self, finished: bool) -> Option<mpsc::Sender<PairingEvent>> {
        let mut slot = self.pairing.lock().ok()?;
        if finished { slot.take() } else { slot.clone() }
    }

    fn set_identity(&self, identity: DeviceIdentity) {
        if let Ok(mut slot) = self.identity.lock() {
            *slot = Some(identity);
        }
    }

    async fn apply_frame(&self, frame: BridgeFrame) {
        match frame {
            BridgeFrame::Qr { code } => {
                if let Some(tx) = self.pairing_sender(false) {
                    let _ = tx.send(PairingEvent::Code { code }).await;
                }
            }
            BridgeFrame::PairSuccess { identity } => {
                info!("Session {} paired as {}", self.session, identity.jid);
                let jid = identity.jid.clone();
                self.set_identity(identity);
                if let Some(tx) = self.pairing_sender(true) {
                    let _ = tx.send(PairingEvent::Success { jid }).await;
                }
            }
            BridgeFrame::PairTimeout => {
                warn!("Pairing timed out for session {}", self.session);
                if let Some(tx) = self.pairing_sender(true) {
                    let _ = tx.send(PairingEvent::Timeout).await;
                }
            }
            BridgeFrame::Connected { identity } => {
                if let Some(identity) = identity {
                    self.set_identity(identity);
                }
                self.connected.store(true, Ordering::SeqCst);
                self.emit(ClientEvent::Connected);
            }
            BridgeFrame::Disconnected => {
                self.connected.store(false, Ordering::SeqCst);
                self.emit(ClientEvent::Disconnected);
            }
            BridgeFrame::LoggedOut { reason } => {
                info!("Session {} logged out, closing its event stream", self.session);
                self.connected.store(false, Ordering::SeqCst);
                self.logged_out.store(true, Ordering::SeqCst);
                self.stream.cancel();
                self.emit(ClientEvent::LoggedOut { reason });
            }
            BridgeFrame::Message(event) => self.emit(ClientEvent::Message(event)),
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.stream.cancel();
    }
}

/// Reads the session's event stream until cancelled or the client is gone,
/// reconnecting after transport failures.
async fn run_event_stream(client: Weak<BridgeClient>, url: String, cancel: CancellationToken) {
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            res = connect_async(url.as_str()) => res,
        };

        match connected {
            Ok((mut ws, _)) => {
                debug!("Event stream open: {}", url);
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => return,
                        msg = ws.next() => msg,
                    };
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            let Some(client) = client.upgrade() else {
                                return;
                            };
                            let text = text.as_str();
                            match serde_json::from_str::<BridgeFrame>(text) {
                                Ok(frame) => client.apply_frame(frame).await,
                                Err(e) => warn!(
                                    "Bad frame on {}: {} -- raw: {}",
                                    url,
                                    e,
                                    crate::excerpt(&text, 200)
                                ),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Event stream error on {}: {}", url, e);
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("Failed to open event stream {}: {}", url, e),
        }

        if client.strong_count() == 0 {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn connect(&self) -> Result<(), ProtocolError> {
        let resp = self.http.post(self.url("/connect")).send().await.map_err(transport)?;
        self.checked(resp).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        match self.http.post(self.url("/disconnect")).send().await {
            Ok(resp) => {
                if let Err(e) = self.checked(resp).await {
                    warn!("Sidecar refused disconnect for {}: {}", self.session, e);
                }
            }
            Err(e) => warn!("Disconnect request for {} failed: {}", self.session, e),
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn identity(&self) -> Option<DeviceIdentity> {
        self.identity.lock().ok().and_then(|i| i.clone())
    }

    fn add_event_handler(&self, handler: EventHandler) -> Result<u32, ProtocolError> {
        if self.logged_out.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        let id = self.next_handler.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .lock()
            .map_err(|_| ProtocolError::Transport("handler registry poisoned".into()))?
            .push((id, handler));
        Ok(id)
    }

    fn remove_event_handler(&self, id: u32) -> bool {
        let Ok(mut handlers) = self.handlers.lock() else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    async fn send_message(
        &self,
        to: &str,
        content: OutgoingContent,
    ) -> Result<SendReceipt, ProtocolError> {
        let request = async {
            let resp = self
                .http
                .post(self.url("/messages"))
                .json(&SendBody { to, content })
                .send()
                .await
                .map_err(transport)?;
            self.checked(resp).await?.json::<SendReceipt>().await.map_err(transport)
        };
        tokio::time::timeout(self.send_timeout, request)
            .await
            .map_err(|_| ProtocolError::Timeout(self.send_timeout))?
    }

    async fn download(&self, media: &MediaRef) -> Result<Vec<u8>, ProtocolError> {
        let resp = self
            .http
            .post(self.url("/media/download"))
            .json(media)
            .send()
            .await
            .map_err(transport)?;
        let bytes = self.checked(resp).await?.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }

    async fn upload(&self, data: Vec<u8>, kind: MediaKind) -> Result<UploadRef, ProtocolError> {
        let resp = self
            .http
            .post(self.url("/media/upload"))
            .query(&[("kind", kind)])
            .body(data)
            .send()
            .await
            .map_err(transport)?;
        self.checked(resp).await?.json().await.map_err(transport)
    }

    async fn is_on_whatsapp(&self, numbers: &[String]) -> Result<Vec<NumberLookup>, ProtocolError> {
        let resp = self
            .http
            .post(self.url("/lookup"))
            .json(&LookupBody { numbers })
            .send()
            .await
            .map_err(transport)?;
        self.checked(resp).await?.json().await.map_err(transport)
    }
}

/// Caches one connected client per session.
pub struct BridgeProvider {
    http: reqwest::Client,
    base_url: String,
    send_timeout: Duration,
    /// Guards construction and connection as one step, so two callers
    /// never connect the same session twice.
    clients: Arc<Mutex<HashMap<String, Arc<BridgeClient>>>>,
}

impl BridgeProvider {
    pub fn new(http: reqwest::Client, base_url: &str, send_timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            send_timeout,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ClientProvider for BridgeProvider {
    async fn client_for(&self, jid: &str) -> Result<Arc<dyn ProtocolClient>, ProtocolError> {
        let mut clients = self.clients.lock().await;
        if clients.get(jid).is_some_and(|c| c.logged_out.load(Ordering::SeqCst)) {
            debug!("Dropping logged-out client for {}", jid);
            clients.remove(jid);
        }
        if let Some(client) = clients.get(jid) {
            return Ok(client.clone() as Arc<dyn ProtocolClient>);
        }

        let client = BridgeClient::start(
            self.http.clone(),
            &self.base_url,
            jid.to_string(),
            None,
            self.send_timeout,
            None,
        );
        let identity = client.fetch_identity().await?;
        client.set_identity(identity);
        client.connect().await?;

        info!("Connected sidecar session {}", jid);
        clients.insert(jid.to_string(), client.clone());
        Ok(client as Arc<dyn ProtocolClient>)
    }

    async fn pair(&self) -> Result<Pairing, ProtocolError> {
        let resp = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProtocolError::Rejected(format!("HTTP {}: {}", status, body)));
        }
        let NewSession { session } = resp.json().await.map_err(transport)?;
        debug!("Pairing session {} started", session);

        let (inner_tx, mut inner_rx) = mpsc::channel(8);
        let (tx, rx) = mpsc::channel(8);
        let client = BridgeClient::start(
            self.http.clone(),
            &self.base_url,
            session,
            None,
            self.send_timeout,
            Some(inner_tx),
        );

        // A paired client becomes reachable by its JID.
        let clients = self.clients.clone();
        let pending = Arc::downgrade(&client);
        tokio::spawn(async move {
            while let Some(event) = inner_rx.recv().await {
                if let PairingEvent::Success { jid } = &event {
                    if let Some(client) = pending.upgrade() {
                        clients.lock().await.insert(jid.clone(), client);
                    }
                }
                let _ = tx.send(event).await;
            }
        });

        Ok(Pairing {
            client: client as Arc<dyn ProtocolClient>,
            events: rx,
        })
    }

    async fn forget(&self, jid: &str) {
        if let Some(client) = self.clients.lock().await.remove(jid) {
            client.stream.cancel();
            debug!("Forgot sidecar session {}", jid);
        }
    }
}
