//! Listener lifecycle: one live event subscription per device, with the
//! handler-interval audit trail kept in step.
//!
//! Attach attempts are claimed per session identifier before any I/O, so
//! concurrent attaches for one device collapse into one. Every inbound
//! message spawns tracked delivery tasks (sink and webhook) whose results
//! are published as [`DeliveryReport`]s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;
use tokio::sync::{RwLock, Semaphore, broadcast};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use uatz_types::events::{ClientEvent, MessageEvent};
use uatz_types::models::{Device, DeviceHandler};

use crate::client::{ClientProvider, EventHandler, ProtocolClient};
use crate::error::{GatewayError, Result};
use crate::ingest::convert_event;
use crate::registry::DeviceRegistry;
use crate::sink::MessageSink;
use crate::webhook::{DeliveryOutcome, WebhookDispatcher, WebhookTarget};

const REPORT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStage {
    Ingest,
    Sink,
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Done,
    Webhook(DeliveryOutcome),
    Failed(String),
}

/// Result of one background task spawned for an inbound message.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub device_id: i64,
    pub message_id: String,
    pub stage: DeliveryStage,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttachOutcome {
    Started(DeviceHandler),
    AlreadyListening,
}

#[derive(Debug, Default)]
pub struct BootstrapSummary {
    pub attached: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub orphans_closed: usize,
}

struct Listener {
    device_id: i64,
    client: Arc<dyn ProtocolClient>,
    handler_id: u32,
}

enum Claim {
    Attaching,
    Listening(Listener),
}

struct ManagerInner {
    registry: DeviceRegistry,
    provider: Arc<dyn ClientProvider>,
    webhooks: WebhookDispatcher,
    sink: Arc<dyn MessageSink>,
    claims: Mutex<HashMap<String, Claim>>,
    tasks: TaskTracker,
    reports: broadcast::Sender<DeliveryReport>,
    webhook_inflight: usize,
    /// Shared by attaches, which may open handler rows; exclusive while
    /// orphaned rows are finalized.
    handler_rows: RwLock<()>,
}

#[derive(Clone)]
pub struct ListenerManager {
    inner: Arc<ManagerInner>,
}

/// Releases an `Attaching` claim if the attach never completes, including
/// when the attaching future is dropped.
struct ClaimGuard<'a> {
    inner: &'a ManagerInner,
    jid: String,
    armed: bool,
}

impl ClaimGuard<'_> {
    fn complete(mut self, listener: Listener) {
        self.armed = false;
        if let Ok(mut claims) = self.inner.claims.lock() {
            claims.insert(self.jid.clone(), Claim::Listening(listener));
        }
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut claims) = self.inner.claims.lock() {
            if matches!(claims.get(&self.jid), Some(Claim::Attaching)) {
                claims.remove(&self.jid);
            }
        }
    }
}

impl ListenerManager {
    pub fn new(
        registry: DeviceRegistry,
        provider: Arc<dyn ClientProvider>,
        webhooks: WebhookDispatcher,
        sink: Arc<dyn MessageSink>,
        webhook_inflight: usize,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                provider,
                webhooks,
                sink,
                claims: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
                reports,
                webhook_inflight: webhook_inflight.max(1),
                handler_rows: RwLock::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn provider(&self) -> Arc<dyn ClientProvider> {
        self.inner.provider.clone()
    }

    pub fn reports(&self) -> broadcast::Receiver<DeliveryReport> {
        self.inner.reports.subscribe()
    }

    /// Session identifiers with a live listener.
    pub fn listening(&self) -> Vec<String> {
        let Ok(claims) = self.inner.claims.lock() else {
            return Vec::new();
        };
        let mut jids: Vec<String> = claims
            .iter()
            .filter(|(_, c)| matches!(c, Claim::Listening(_)))
            .map(|(jid, _)| jid.clone())
            .collect();
        jids.sort();
        jids
    }

    pub fn is_listening(&self, jid: &str) -> bool {
        self.inner
            .claims
            .lock()
            .map(|c| matches!(c.get(jid), Some(Claim::Listening(_))))
            .unwrap_or(false)
    }

    pub fn live_device_ids(&self) -> Vec<i64> {
        let Ok(claims) = self.inner.claims.lock() else {
            return Vec::new();
        };
        claims
            .values()
            .filter_map(|c| match c {
                Claim::Listening(l) => Some(l.device_id),
                Claim::Attaching => None,
            })
            .collect()
    }

    /// Starts listening for a registered device. Only once the callback is
    /// registered is a new handler interval opened, superseding the device's
    /// previous one; if that write fails the callback is removed again.
    pub async fn attach(&self, jid: &str) -> Result<AttachOutcome> {
        let inner = self.inner.as_ref();
        let _rows = inner.handler_rows.read().await;
        {
            let mut claims = inner
                .claims
                .lock()
                .map_err(|_| GatewayError::Storage(anyhow::anyhow!("listener claims poisoned")))?;
            if claims.contains_key(jid) {
                debug!("Listener for {} already claimed", jid);
                return Ok(AttachOutcome::AlreadyListening);
            }
            claims.insert(jid.to_string(), Claim::Attaching);
        }
        let guard = ClaimGuard { inner, jid: jid.to_string(), armed: true };

        let client = inner
            .provider
            .client_for(jid)
            .await
            .map_err(|source| GatewayError::ClientResolution { jid: jid.to_string(), source })?;
        let device = inner.registry.device_by_jid(jid).await?;
        let target = inner.registry.webhook_target(device.id).await?;

        let handler = self.message_handler(device.clone(), target, Arc::downgrade(&client));
        let handler_id = client
            .add_event_handler(handler)
            .map_err(|source| GatewayError::Listener { jid: jid.to_string(), source })?;

        let row = match inner.registry.open_handler(device.id).await {
            Ok(row) => row,
            Err(e) => {
                client.remove_event_handler(handler_id);
                return Err(e);
            }
        };

        info!("Listener attached for device {} ({})", device.id, jid);
        guard.complete(Listener { device_id: device.id, client, handler_id });
        Ok(AttachOutcome::Started(row))
    }

    /// Stops listening for `jid` and closes its handler interval. Returns
    /// false when no listener was running.
    pub async fn detach(&self, jid: &str) -> Result<bool> {
        let listener = {
            let mut claims = self
                .inner
                .claims
                .lock()
                .map_err(|_| GatewayError::Storage(anyhow::anyhow!("listener claims poisoned")))?;
            match claims.remove(jid) {
                Some(Claim::Listening(l)) => l,
                Some(Claim::Attaching) => {
                    // Still attaching; that attempt owns the claim.
                    claims.insert(jid.to_string(), Claim::Attaching);
                    return Ok(false);
                }
                None => return Ok(false),
            }
        };

        listener.client.remove_event_handler(listener.handler_id);
        self.inner.registry.close_handlers(listener.device_id).await?;
        info!("Listener detached for device {} ({})", listener.device_id, jid);
        Ok(true)
    }

    /// Re-attaches every registered device. One device failing never stops
    /// the others. Afterwards, handler rows still active for devices that
    /// did not come up are closed as orphans of an earlier run.
    pub async fn bootstrap(&self) -> Result<BootstrapSummary> {
        let jids = self.inner.registry.device_jids().await?;
        info!("Bootstrapping listeners for {} devices", jids.len());

        let mut summary = BootstrapSummary::default();
        for jid in jids {
            match self.attach(&jid).await {
                Ok(_) => summary.attached.push(jid),
                Err(e) => {
                    error!("Failed to attach listener for {}: {}", jid, e);
                    summary.failed.push((jid, e.to_string()));
                }
            }
        }

        // Waits out attaches still in flight, so their fresh rows count as live.
        let finalized = {
            let _rows = self.inner.handler_rows.write().await;
            self.inner
                .registry
                .finalize_orphaned_handlers(self.live_device_ids())
                .await
        };
        match finalized {
            Ok(n) => summary.orphans_closed = n,
            Err(e) => error!("Failed to finalize orphaned handler rows: {}", e),
        }

        info!(
            "Bootstrap finished: {} listening, {} failed, {} orphaned intervals closed",
            summary.attached.len(),
            summary.failed.len(),
            summary.orphans_closed
        );
        Ok(summary)
    }

    /// Callback for a client that is still pairing. On a successful
    /// connection the device is registered and attached; a connection for
    /// an already-registered device (a reconnect) changes nothing.
    pub fn session_handler(&self, client: &Arc<dyn ProtocolClient>) -> EventHandler {
        let manager = Arc::downgrade(&self.inner);
        let client = Arc::downgrade(client);
        let handle = Handle::current();

        Arc::new(move |event: ClientEvent| {
            if !matches!(event, ClientEvent::Connected) {
                return;
            }
            let (Some(inner), Some(client)) = (manager.upgrade(), client.upgrade()) else {
                return;
            };
            let manager = ListenerManager { inner };
            let tasks = manager.inner.tasks.clone();
            tasks.spawn_on(async move { manager.register_session(client).await }, &handle);
        })
    }

    async fn register_session(&self, client: Arc<dyn ProtocolClient>) {
        let Some(identity) = client.identity() else {
            warn!("Connected event from a client without identity, ignoring");
            return;
        };

        match self.inner.registry.insert_device_if_not_exists(&identity).await {
            Ok(device) => {
                info!("Device {} paired as {}", device.id, device.jid);
                if let Err(e) = self.attach(&device.jid).await {
                    error!("Failed to attach listener for new device {}: {}", device.jid, e);
                }
            }
            Err(GatewayError::DeviceExists(jid)) => {
                debug!("Reconnect for registered device {}, keeping current listener", jid);
            }
            Err(e) => error!("Failed to register device {}: {}", identity.jid, e),
        }
    }

    fn message_handler(
        &self,
        device: Device,
        target: WebhookTarget,
        client: Weak<dyn ProtocolClient>,
    ) -> EventHandler {
        let manager = Arc::downgrade(&self.inner);
        let handle = Handle::current();
        let deliveries = Arc::new(Semaphore::new(self.inner.webhook_inflight));

        Arc::new(move |event: ClientEvent| {
            let Some(inner) = manager.upgrade() else {
                return;
            };
            let manager = ListenerManager { inner };
            match event {
                ClientEvent::Message(evt) => {
                    let job = manager.clone().ingest(
                        *evt,
                        device.clone(),
                        target.clone(),
                        client.clone(),
                        deliveries.clone(),
                    );
                    manager.inner.tasks.spawn_on(job, &handle);
                }
                ClientEvent::LoggedOut { reason } => {
                    warn!(
                        "Device {} ({}) logged out: {}",
                        device.id,
                        device.jid,
                        reason.as_deref().unwrap_or("no reason given")
                    );
                    let jid = device.jid.clone();
                    let device_id = device.id;
                    let tasks = manager.inner.tasks.clone();
                    tasks.spawn_on(async move { manager.remove_device(&jid, device_id).await }, &handle);
                }
                ClientEvent::Connected | ClientEvent::Disconnected => {}
            }
        })
    }

    async fn ingest(
        self,
        event: MessageEvent,
        device: Device,
        target: WebhookTarget,
        client: Weak<dyn ProtocolClient>,
        deliveries: Arc<Semaphore>,
    ) {
        let message_id = event.info.id.clone();
        let Some(client) = client.upgrade() else {
            return;
        };

        let message = match convert_event(&event, client.as_ref()).await {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to convert message {} for device {}: {}", message_id, device.id, e);
                self.report(device.id, &message_id, DeliveryStage::Ingest, DeliveryStatus::Failed(e.to_string()));
                return;
            }
        };

        let sink = self.inner.sink.clone();
        let sink_manager = self.clone();
        let sink_message = message.clone();
        let sink_id = message_id.clone();
        let device_id = device.id;
        self.inner.tasks.spawn(async move {
            let status = match sink.publish(device_id, sink_message).await {
                Ok(()) => DeliveryStatus::Done,
                Err(e) => {
                    error!("Failed to publish message {} for device {}: {}", sink_id, device_id, e);
                    DeliveryStatus::Failed(e.to_string())
                }
            };
            sink_manager.report(device_id, &sink_id, DeliveryStage::Sink, status);
        });

        let webhooks = self.inner.webhooks.clone();
        let manager = self.clone();
        self.inner.tasks.spawn(async move {
            let status = match deliveries.acquire_owned().await {
                Ok(_permit) => match webhooks.send(message, &device, &target, client.as_ref()).await {
                    Ok(outcome) => DeliveryStatus::Webhook(outcome),
                    Err(e) => {
                        error!("Webhook delivery of {} for device {} failed: {}", message_id, device.id, e);
                        DeliveryStatus::Failed(e.to_string())
                    }
                },
                Err(e) => DeliveryStatus::Failed(e.to_string()),
            };
            manager.report(device.id, &message_id, DeliveryStage::Webhook, status);
        });
    }

    async fn remove_device(&self, jid: &str, device_id: i64) {
        if let Err(e) = self.detach(jid).await {
            error!("Failed to detach listener for {}: {}", jid, e);
        }
        self.inner.provider.forget(jid).await;
        match self.inner.registry.remove_device(device_id).await {
            Ok(true) => info!("Device {} ({}) removed after logout", device_id, jid),
            Ok(false) => debug!("Device {} was already removed", device_id),
            Err(e) => error!("Failed to remove device {}: {}", device_id, e),
        }
    }

    fn report(&self, device_id: i64, message_id: &str, stage: DeliveryStage, status: DeliveryStatus) {
        // Nobody listening for reports is fine.
        let _ = self.inner.reports.send(DeliveryReport {
            device_id,
            message_id: message_id.to_string(),
            stage,
            status,
        });
    }

    /// Stops every listener, waits for in-flight deliveries and closes all
    /// handler intervals.
    pub async fn shutdown(&self) -> Result<()> {
        let listeners: Vec<Listener> = match self.inner.claims.lock() {
            Ok(mut claims) => claims
                .drain()
                .filter_map(|(_, c)| match c {
                    Claim::Listening(l) => Some(l),
                    Claim::Attaching => None,
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        for listener in &listeners {
            listener.client.remove_event_handler(listener.handler_id);
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let closed = self.inner.registry.deactivate_all_handlers().await?;
        info!(
            "Listener manager stopped: {} listeners detached, {} intervals closed",
            listeners.len(),
            closed
        );
        Ok(())
    }
}

/// Logs every failed delivery report until the manager goes away.
pub async fn log_delivery_failures(mut reports: broadcast::Receiver<DeliveryReport>) {
    loop {
        match reports.recv().await {
            Ok(DeliveryReport { status: DeliveryStatus::Failed(reason), device_id, message_id, stage }) => {
                warn!(
                    "Delivery stage {:?} failed for message {} of device {}: {}",
                    stage, message_id, device_id, reason
                );
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Delivery report logger lagged by {} reports", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::time::Duration;

    use super::*;
    use crate::health::HealthTracker;
    use crate::sink::BroadcastSink;
    use crate::test_support::{
        FakeClient, FakeProvider, clock_at_minute, registry, spawn_webhook_server, text_event,
    };
    use uatz_db::Database;
    use uatz_types::events::{DeviceIdentity, GatewayEvent, OutgoingContent};

    struct Harness {
        registry: DeviceRegistry,
        provider: Arc<FakeProvider>,
        sink: BroadcastSink,
        manager: ListenerManager,
    }

    fn harness() -> Harness {
        harness_with(registry())
    }

    fn harness_with(registry: DeviceRegistry) -> Harness {
        let provider = FakeProvider::new();
        let sink = BroadcastSink::default();
        let health = HealthTracker::new(registry.clone(), clock_at_minute(1));
        let webhooks = WebhookDispatcher::new(reqwest::Client::new(), health, None);
        let manager = ListenerManager::new(
            registry.clone(),
            provider.clone(),
            webhooks,
            Arc::new(sink.clone()),
            4,
        );
        Harness { registry, provider, sink, manager }
    }

    fn identity(jid: &str) -> DeviceIdentity {
        DeviceIdentity {
            jid: jid.to_string(),
            push_name: "Store".into(),
            business_name: None,
        }
    }

    async fn register(h: &Harness, jid: &str) -> Device {
        h.registry.insert_device_if_not_exists(&identity(jid)).await.unwrap()
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn next_report(rx: &mut broadcast::Receiver<DeliveryReport>) -> DeliveryReport {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no delivery report")
            .unwrap()
    }

    #[tokio::test]
    async fn bootstrap_survives_a_failing_device() {
        let h = harness();
        let a = register(&h, "5501@s.whatsapp.net").await;
        let b = register(&h, "5502@s.whatsapp.net").await;
        let c = register(&h, "5503@s.whatsapp.net").await;
        h.provider.add(&a.jid);
        h.provider.add(&b.jid);
        h.provider.fail(&c.jid);

        // Left active by a previous run.
        h.registry.open_handler(c.id).await.unwrap();
        h.registry.open_handler(a.id).await.unwrap();

        let summary = h.manager.bootstrap().await.unwrap();
        assert_eq!(summary.attached.len(), 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, c.jid);
        assert_eq!(summary.orphans_closed, 1);

        let mut active: Vec<i64> = h
            .registry
            .active_handlers()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.device_id)
            .collect();
        active.sort();
        assert_eq!(active, vec![a.id, b.id]);
        assert_eq!(h.manager.listening(), vec![a.jid.clone(), b.jid.clone()]);
    }

    #[tokio::test]
    async fn duplicate_attach_collapses() {
        let h = harness();
        let device = register(&h, "5510@s.whatsapp.net").await;
        let client = h.provider.add(&device.jid);

        let (first, second) = tokio::join!(h.manager.attach(&device.jid), h.manager.attach(&device.jid));
        let outcomes = [first.unwrap(), second.unwrap()];
        assert_eq!(
            outcomes.iter().filter(|o| matches!(o, AttachOutcome::Started(_))).count(),
            1
        );
        assert!(outcomes.contains(&AttachOutcome::AlreadyListening));

        let again = h.manager.attach(&device.jid).await.unwrap();
        assert_eq!(again, AttachOutcome::AlreadyListening);
        assert_eq!(client.handler_count(), 1);
        assert_eq!(h.registry.active_handlers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_registration_leaves_no_trace() {
        let h = harness();
        let device = register(&h, "5520@s.whatsapp.net").await;
        let client = h.provider.add(&device.jid);
        client.reject_handlers();

        let err = h.manager.attach(&device.jid).await.unwrap_err();
        assert!(matches!(err, GatewayError::Listener { .. }));
        assert!(h.registry.active_handlers().await.unwrap().is_empty());
        assert!(h.manager.listening().is_empty());
        assert!(!h.manager.is_listening(&device.jid));
    }

    #[tokio::test]
    async fn unresolvable_client_releases_claim() {
        let h = harness();
        let device = register(&h, "5521@s.whatsapp.net").await;
        h.provider.fail(&device.jid);

        let err = h.manager.attach(&device.jid).await.unwrap_err();
        assert!(matches!(err, GatewayError::ClientResolution { .. }));

        h.provider.add(&device.jid);
        // Still failing: the fail list wins. The claim must still be free.
        assert!(h.manager.attach(&device.jid).await.is_err());
        assert!(h.manager.live_device_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_interval_write_removes_callback() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let h = harness_with(DeviceRegistry::new(db.clone()));
        let device = register(&h, "5525@s.whatsapp.net").await;
        let client = h.provider.add(&device.jid);
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER refuse_handlers BEFORE INSERT ON device_handlers
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )?;
            Ok(())
        })
        .unwrap();

        let err = h.manager.attach(&device.jid).await.unwrap_err();
        assert!(matches!(err, GatewayError::Storage(_)));
        assert_eq!(client.handler_count(), 0);
        assert!(!h.manager.is_listening(&device.jid));
        assert!(h.manager.live_device_ids().is_empty());
        assert!(h.registry.active_handlers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_waits_for_in_flight_attach() {
        let h = harness();
        let device = register(&h, "5527@s.whatsapp.net").await;
        h.provider.add(&device.jid);
        let gate = h.provider.gate(&device.jid);

        let manager = h.manager.clone();
        let jid = device.jid.clone();
        let pending = tokio::spawn(async move { manager.attach(&jid).await });
        for _ in 0..200 {
            if h.manager.inner.claims.lock().unwrap().contains_key(&device.jid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut bootstrap = Box::pin(h.manager.bootstrap());
        assert!(
            tokio::time::timeout(Duration::from_millis(100), &mut bootstrap)
                .await
                .is_err()
        );

        gate.notify_one();
        let summary = bootstrap.await.unwrap();
        assert!(matches!(pending.await.unwrap().unwrap(), AttachOutcome::Started(_)));
        assert_eq!(summary.orphans_closed, 0);

        let active = h.registry.active_handlers().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].device_id, device.id);
        assert!(h.manager.is_listening(&device.jid));
    }

    #[tokio::test]
    async fn reattach_supersedes_previous_interval() {
        let h = harness();
        let device = register(&h, "5530@s.whatsapp.net").await;
        h.provider.add(&device.jid);

        h.manager.attach(&device.jid).await.unwrap();
        assert!(h.manager.detach(&device.jid).await.unwrap());
        assert!(h.registry.active_handlers().await.unwrap().is_empty());
        assert!(!h.manager.detach(&device.jid).await.unwrap());

        let outcome = h.manager.attach(&device.jid).await.unwrap();
        assert!(matches!(outcome, AttachOutcome::Started(ref row) if row.active));
        assert_eq!(h.registry.active_handlers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn message_reaches_sink_and_webhook() {
        let h = harness();
        let device = register(&h, "5540@s.whatsapp.net").await;
        let client = h.provider.add(&device.jid);
        let server =
            spawn_webhook_server(200, r#"{"status":"ok","response_text":"got it"}"#).await;
        h.registry.create_webhook(device.id, &server.url).await.unwrap();

        h.manager.attach(&device.jid).await.unwrap();
        let mut stream = h.sink.subscribe();
        let mut reports = h.manager.reports();

        client.emit(ClientEvent::Message(Box::new(text_event("IN1", "5511777", "hello"))));

        let mut stages = Vec::new();
        for _ in 0..2 {
            let report = next_report(&mut reports).await;
            assert_eq!(report.message_id, "IN1");
            stages.push((report.stage, report.status));
        }
        assert!(stages.contains(&(DeliveryStage::Sink, DeliveryStatus::Done)));
        assert!(stages.iter().any(|(stage, status)| *stage == DeliveryStage::Webhook
            && matches!(status, DeliveryStatus::Webhook(DeliveryOutcome::Delivered { status: 200, replied: true, .. }))));

        match stream.recv().await.unwrap() {
            GatewayEvent::MessageReceived { device_id, message } => {
                assert_eq!(device_id, device.id);
                assert_eq!(message.text, "hello");
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(server.hits(), 1);
        let sent = client.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "5511777@s.whatsapp.net");
        assert!(matches!(&sent[0].1, OutgoingContent::Text(t) if t == "got it"));
    }

    #[tokio::test]
    async fn webhook_snapshot_is_taken_at_attach() {
        let h = harness();
        let device = register(&h, "5541@s.whatsapp.net").await;
        let client = h.provider.add(&device.jid);
        let server = spawn_webhook_server(200, r#"{"status":"ok"}"#).await;

        h.manager.attach(&device.jid).await.unwrap();
        h.registry.create_webhook(device.id, &server.url).await.unwrap();

        let mut reports = h.manager.reports();
        client.emit(ClientEvent::Message(Box::new(text_event("IN2", "5511", "hi"))));

        loop {
            let report = next_report(&mut reports).await;
            if report.stage == DeliveryStage::Webhook {
                assert_eq!(report.status, DeliveryStatus::Webhook(DeliveryOutcome::Skipped));
                break;
            }
        }
        assert_eq!(server.hits(), 0);
    }

    #[tokio::test]
    async fn failed_download_is_reported() {
        let h = harness();
        let device = register(&h, "5542@s.whatsapp.net").await;
        let client = h.provider.add(&device.jid);
        h.manager.attach(&device.jid).await.unwrap();

        let mut event = text_event("IN3", "5511", "");
        if let Some(payload) = event.message.as_mut() {
            payload.conversation = None;
            payload.image_message = Some(Default::default());
        }

        let mut reports = h.manager.reports();
        client.emit(ClientEvent::Message(Box::new(event)));

        let report = next_report(&mut reports).await;
        assert_eq!(report.stage, DeliveryStage::Ingest);
        assert!(matches!(report.status, DeliveryStatus::Failed(_)));
    }

    #[tokio::test]
    async fn logout_removes_device() {
        let h = harness();
        let device = register(&h, "5550@s.whatsapp.net").await;
        let client = h.provider.add(&device.jid);
        h.manager.attach(&device.jid).await.unwrap();

        client.emit(ClientEvent::LoggedOut { reason: Some("unlinked from phone".into()) });

        let registry = h.registry.clone();
        let jid = device.jid.clone();
        eventually(|| {
            let registry = registry.clone();
            let jid = jid.clone();
            async move { registry.find_device_by_jid(&jid).await.unwrap().is_none() }
        })
        .await;

        assert!(!h.manager.is_listening(&device.jid));
        assert_eq!(client.handler_count(), 0);
        assert!(h.registry.active_handlers().await.unwrap().is_empty());
        assert!(h.provider.client_for(&device.jid).await.is_err());
    }

    #[tokio::test]
    async fn first_connection_registers_and_attaches() {
        let h = harness();
        let pairing = FakeClient::unpaired();
        let as_dyn: Arc<dyn ProtocolClient> = pairing.clone();
        pairing
            .add_event_handler(h.manager.session_handler(&as_dyn))
            .unwrap();

        let jid = "5560@s.whatsapp.net";
        pairing.set_identity(identity(jid));
        h.provider.put(jid, pairing.clone());

        pairing.emit(ClientEvent::Connected);
        let manager = h.manager.clone();
        eventually(|| {
            let manager = manager.clone();
            async move { manager.is_listening(jid) }
        })
        .await;
        assert_eq!(h.registry.list_devices().await.unwrap().len(), 1);
        assert_eq!(pairing.handler_count(), 2);

        // A reconnect neither re-registers nor re-attaches.
        pairing.emit(ClientEvent::Connected);
        h.manager.inner.tasks.close();
        h.manager.inner.tasks.wait().await;
        assert_eq!(h.registry.list_devices().await.unwrap().len(), 1);
        assert_eq!(h.registry.active_handlers().await.unwrap().len(), 1);
        assert_eq!(pairing.handler_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_every_interval() {
        let h = harness();
        let a = register(&h, "5570@s.whatsapp.net").await;
        let b = register(&h, "5571@s.whatsapp.net").await;
        let client_a = h.provider.add(&a.jid);
        h.provider.add(&b.jid);
        h.manager.bootstrap().await.unwrap();

        h.manager.shutdown().await.unwrap();
        assert!(h.registry.active_handlers().await.unwrap().is_empty());
        assert!(h.manager.listening().is_empty());
        assert_eq!(client_a.handler_count(), 0);
    }
}
