//! Per-connection hub tasks. Each websocket gets a reader loop (this
//! module) plus a writer task fed from the session's bounded outbox; the
//! only state shared between connections is the [`Registry`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use manifest::protocol::HubMessage;
use crate::registry::{Registry, SessionHandle, OUTBOX_CAPACITY};

/// Drive one slave connection until it closes, then clean up its
/// registration (and target-table entry, if any).
pub async fn handle_slave(socket: WebSocket, addr: SocketAddr, registry: Arc<Registry>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
    let id = Uuid::new_v4();

    info!("Slave connected: {}", addr);
    registry.register_slave(SessionHandle::new(id, addr, tx));

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Slave {} transport error: {}", addr, e);
                break;
            }
        };
        match frame {
            Message::Text(text) => match HubMessage::parse(&text) {
                Ok(HubMessage::Report { data, .. }) => {
                    registry.slave_report(id, addr, data);
                }
                Ok(other) => {
                    debug!("Ignoring unexpected {} message from slave {}", other.kind(), addr);
                }
                Err(e) => {
                    // Malformed frame: drop it, keep the connection.
                    warn!("Dropping malformed message from slave {}: {}", addr, e);
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!("Slave disconnected: {}", addr);
    registry.deregister(id);
    writer.abort();
}

/// Drive one master connection until it closes.
pub async fn handle_master(socket: WebSocket, addr: SocketAddr, registry: Arc<Registry>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
    let id = Uuid::new_v4();

    info!("Master connected: {}", addr);
    registry.register_master(SessionHandle::new(id, addr, tx));

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Master {} transport error: {}", addr, e);
                break;
            }
        };
        match frame {
            Message::Text(text) => match HubMessage::parse(&text) {
                Ok(HubMessage::Command { target, data, .. }) => {
                    registry.master_command(addr, &target, data);
                }
                Ok(other) => {
                    debug!("Ignoring unexpected {} message from master {}", other.kind(), addr);
                }
                Err(e) => {
                    warn!("Dropping malformed message from master {}: {}", addr, e);
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!("Master disconnected: {}", addr);
    registry.deregister(id);
    writer.abort();
}
