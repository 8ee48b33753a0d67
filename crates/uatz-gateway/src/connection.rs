use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

use uatz_types::events::{GatewayCommand, GatewayEvent};

use crate::sink::BroadcastSink;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

type Subscriptions = Arc<RwLock<HashSet<i64>>>;

/// Serves one `/gateway` consumer. The key was checked at the HTTP upgrade,
/// so the socket goes straight to Ready and then the event loop. Messages
/// are forwarded only for devices named in the latest `Subscribe`.
pub async fn handle_connection(socket: WebSocket, sink: BroadcastSink, version: String) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = Uuid::new_v4();
    info!("Gateway consumer {} connected", conn_id);

    let ready = GatewayEvent::Ready { version };
    let Ok(ready) = serde_json::to_string(&ready) else {
        return;
    };
    if sender.send(Message::Text(ready.into())).await.is_err() {
        return;
    }

    let mut events = sink.subscribe();
    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = events.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(RecvError::Lagged(n)) => {
                            warn!("Gateway consumer {} lagged by {} messages", conn_id, n);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };

                    if !is_subscribed(&send_subscriptions, &event) {
                        continue;
                    }

                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode gateway event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping consumer {}", missed_heartbeats, conn_id);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => apply_command(&subscriptions, conn_id, cmd),
                    Err(e) => {
                        warn!(
                            "Consumer {} bad command: {} -- raw: {}",
                            conn_id,
                            e,
                            crate::excerpt(&text, 200)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("Gateway consumer {} disconnected", conn_id);
}

fn apply_command(subscriptions: &Subscriptions, conn_id: Uuid, cmd: GatewayCommand) {
    match cmd {
        GatewayCommand::Subscribe { device_ids } => {
            info!("Consumer {} subscribing to {} devices", conn_id, device_ids.len());
            if let Ok(mut subs) = subscriptions.write() {
                *subs = device_ids.into_iter().collect();
            }
        }
    }
}

fn is_subscribed(subscriptions: &Subscriptions, event: &GatewayEvent) -> bool {
    match event.device_id() {
        Some(device_id) => subscriptions
            .read()
            .map(|subs| subs.contains(&device_id))
            .unwrap_or(false),
        None => true,
    }
}
