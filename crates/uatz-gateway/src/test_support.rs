//! In-memory protocol fakes for tests, here and (via `test-util`) downstream.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{Router, http::StatusCode, routing::post};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Notify, mpsc};

use uatz_db::Database;
use uatz_types::events::{
    ClientEvent, DeviceIdentity, MediaKind, MediaRef, MessageEvent, MessageInfo,
    MessagePayload, NumberLookup, OutgoingContent, PairingEvent, SendReceipt, UploadRef,
};

use crate::client::{ClientProvider, EventHandler, Pairing, ProtocolClient};
use crate::error::ProtocolError;
use crate::health::Clock;
use crate::registry::DeviceRegistry;

pub struct FakeClient {
    identity: Mutex<Option<DeviceIdentity>>,
    connected: AtomicBool,
    handlers: Mutex<Vec<(u32, EventHandler)>>,
    next_handler: AtomicU32,
    sent: Mutex<Vec<(String, OutgoingContent)>>,
    numbers: Mutex<HashMap<String, String>>,
    media: Mutex<HashMap<String, Vec<u8>>>,
    reject_handlers: AtomicBool,
}

impl FakeClient {
    fn build(identity: Option<DeviceIdentity>) -> Arc<Self> {
        Arc::new(Self {
            identity: Mutex::new(identity),
            connected: AtomicBool::new(true),
            handlers: Mutex::new(Vec::new()),
            next_handler: AtomicU32::new(1),
            sent: Mutex::new(Vec::new()),
            numbers: Mutex::new(HashMap::new()),
            media: Mutex::new(HashMap::new()),
            reject_handlers: AtomicBool::new(false),
        })
    }

    pub fn paired(jid: &str) -> Arc<Self> {
        Self::build(Some(DeviceIdentity {
            jid: jid.to_string(),
            push_name: "Fake".into(),
            business_name: None,
        }))
    }

    pub fn unpaired() -> Arc<Self> {
        Self::build(None)
    }

    pub fn set_identity(&self, identity: DeviceIdentity) {
        *self.identity.lock().unwrap() = Some(identity);
    }

    pub fn register_number(&self, number: &str, jid: &str) {
        self.numbers.lock().unwrap().insert(number.to_string(), jid.to_string());
    }

    pub fn put_media(&self, direct_path: &str, data: &[u8]) {
        self.media.lock().unwrap().insert(direct_path.to_string(), data.to_vec());
    }

    pub fn reject_handlers(&self) {
        self.reject_handlers.store(true, Ordering::SeqCst);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<(String, OutgoingContent)> {
        self.sent.lock().unwrap().clone()
    }

    /// Delivers an event to every registered handler, like the protocol
    /// layer would.
    pub fn emit(&self, event: ClientEvent) {
        let handlers: Vec<EventHandler> =
            self.handlers.lock().unwrap().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(event.clone());
        }
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn connect(&self) -> Result<(), ProtocolError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn identity(&self) -> Option<DeviceIdentity> {
        self.identity.lock().unwrap().clone()
    }

    fn add_event_handler(&self, handler: EventHandler) -> Result<u32, ProtocolError> {
        if self.reject_handlers.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        let id = self.next_handler.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().unwrap().push((id, handler));
        Ok(id)
    }

    fn remove_event_handler(&self, id: u32) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    async fn send_message(
        &self,
        to: &str,
        content: OutgoingContent,
    ) -> Result<SendReceipt, ProtocolError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), content));
        Ok(SendReceipt {
            id: format!("SENT{}", sent.len()),
            timestamp: Utc::now(),
        })
    }

    async fn download(&self, media: &MediaRef) -> Result<Vec<u8>, ProtocolError> {
        self.media
            .lock()
            .unwrap()
            .get(&media.direct_path)
            .cloned()
            .ok_or_else(|| ProtocolError::Transport(format!("no media at {}", media.direct_path)))
    }

    async fn upload(&self, data: Vec<u8>, _kind: MediaKind) -> Result<UploadRef, ProtocolError> {
        Ok(UploadRef {
            url: "https://mmg.fake/upload".into(),
            direct_path: "/v/upload".into(),
            media_key: "key".into(),
            file_enc_sha256: "enc".into(),
            file_sha256: "sha".into(),
            file_length: data.len() as u64,
        })
    }

    async fn is_on_whatsapp(&self, numbers: &[String]) -> Result<Vec<NumberLookup>, ProtocolError> {
        let known = self.numbers.lock().unwrap();
        Ok(numbers
            .iter()
            .map(|n| NumberLookup {
                query: n.clone(),
                is_in: known.contains_key(n),
                jid: known.get(n).cloned(),
            })
            .collect())
    }
}

#[derive(Default)]
pub struct FakeProvider {
    clients: Mutex<HashMap<String, Arc<FakeClient>>>,
    failing: Mutex<HashSet<String>>,
    pairings: Mutex<Vec<Arc<FakeClient>>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, jid: &str) -> Arc<FakeClient> {
        let client = FakeClient::paired(jid);
        self.clients.lock().unwrap().insert(jid.to_string(), client.clone());
        client
    }

    /// Makes an existing client (e.g. one that just paired) reachable by `jid`.
    pub fn put(&self, jid: &str, client: Arc<FakeClient>) {
        self.clients.lock().unwrap().insert(jid.to_string(), client);
    }

    pub fn fail(&self, jid: &str) {
        self.failing.lock().unwrap().insert(jid.to_string());
    }

    /// Holds `client_for(jid)` until the returned gate is notified.
    pub fn gate(&self, jid: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(jid.to_string(), gate.clone());
        gate
    }

    pub fn last_pairing(&self) -> Option<Arc<FakeClient>> {
        self.pairings.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ClientProvider for FakeProvider {
    async fn client_for(&self, jid: &str) -> Result<Arc<dyn ProtocolClient>, ProtocolError> {
        let gate = self.gates.lock().unwrap().remove(jid);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.failing.lock().unwrap().contains(jid) {
            return Err(ProtocolError::UnknownSession(jid.to_string()));
        }
        let client = self
            .clients
            .lock()
            .unwrap()
            .get(jid)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownSession(jid.to_string()))?;
        Ok(client as Arc<dyn ProtocolClient>)
    }

    async fn pair(&self) -> Result<Pairing, ProtocolError> {
        let client = FakeClient::unpaired();
        self.pairings.lock().unwrap().push(client.clone());

        let (tx, rx) = mpsc::channel(4);
        let _ = tx.try_send(PairingEvent::Code { code: "2@fake-qr-ref".into() });

        Ok(Pairing {
            client: client as Arc<dyn ProtocolClient>,
            events: rx,
        })
    }

    async fn forget(&self, jid: &str) {
        self.clients.lock().unwrap().remove(jid);
    }
}

pub fn registry() -> DeviceRegistry {
    DeviceRegistry::new(Arc::new(Database::open_in_memory().unwrap()))
}

/// A clock frozen at the given minute of an arbitrary hour.
pub fn clock_at_minute(minute: u32) -> Clock {
    let at: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap();
    Arc::new(move || at)
}

pub fn text_event(id: &str, chat: &str, text: &str) -> MessageEvent {
    MessageEvent {
        info: info(id, chat),
        message: Some(MessagePayload {
            conversation: Some(text.to_string()),
            ..Default::default()
        }),
    }
}

pub fn info(id: &str, chat: &str) -> MessageInfo {
    MessageInfo {
        id: id.to_string(),
        chat: chat.to_string(),
        sender: format!("{}@s.whatsapp.net", chat),
        is_from_me: false,
        is_group: false,
        push_name: "Maria".into(),
        timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 1, 0).unwrap(),
    }
}

pub struct WebhookServer {
    pub url: String,
    pub received: Arc<Mutex<Vec<String>>>,
}

impl WebhookServer {
    pub fn hits(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

/// Spawns a subscriber on an ephemeral port that answers every POST with
/// the given status and body.
pub async fn spawn_webhook_server(status: u16, reply: &'static str) -> WebhookServer {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let app = Router::new().route(
        "/hook",
        post(move |body: String| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(body);
                (StatusCode::from_u16(status).unwrap(), reply)
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    WebhookServer {
        url: format!("http://{}/hook", addr),
        received,
    }
}
