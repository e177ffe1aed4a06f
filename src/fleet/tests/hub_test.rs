//! Hub behavior over real websockets: connection greetings, report relay
//! with enrichment, the target table lifecycle, and command routing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet::server::AppState;
use fleet::Registry;
use futures::{SinkExt, StreamExt};
use manifest::HubMessage;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn spawn_hub(image_types: Vec<String>) -> (SocketAddr, Arc<Registry>, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = Arc::new(Registry::new(image_types));
    let state = AppState {
        registry: registry.clone(),
        image_path: root.path().to_path_buf(),
    };
    tokio::spawn(async move {
        fleet::server::serve_on_listener(listener, state).await.unwrap();
    });
    (addr, registry, root)
}

async fn connect(addr: SocketAddr, role: &str) -> Socket {
    let url = format!("ws://{}/ws/{}", addr, role);
    let (socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    socket
}

/// Next text frame, decoded; panics if none arrives in time.
async fn recv(socket: &mut Socket) -> HubMessage {
    let deadline = Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout(deadline, socket.next())
            .await
            .expect("timed out waiting for hub frame")
            .expect("connection closed")
            .unwrap();
        match frame {
            Message::Text(text) => return HubMessage::parse(&text).unwrap(),
            _ => continue,
        }
    }
}

async fn expect_silence(socket: &mut Socket) {
    let outcome = tokio::time::timeout(Duration::from_millis(300), socket.next()).await;
    assert!(outcome.is_err(), "expected no frame, got {:?}", outcome);
}

async fn send(socket: &mut Socket, msg: &HubMessage) {
    socket.send(Message::Text(msg.to_json())).await.unwrap();
}

/// Wait until the hub's target table matches, so a master connecting
/// afterwards sees it in the opening snapshot.
async fn wait_for_targets(registry: &Registry, expected: &[&str]) {
    for _ in 0..100 {
        if registry.targets() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("targets never became {:?}, got {:?}", expected, registry.targets());
}

#[tokio::test]
async fn every_connection_is_greeted_with_image_types() {
    let (addr, _registry, _root) = spawn_hub(vec!["mytype".into(), "other".into()]);

    for role in ["slave", "master"] {
        let mut socket = connect(addr, role).await;
        match recv(&mut socket).await {
            HubMessage::ImageTypes { data } => {
                assert_eq!(data.image_types, vec!["mytype", "other"]);
            }
            other => panic!("expected image_types, got {}", other.kind()),
        }
    }
}

#[tokio::test]
async fn master_gets_target_snapshot_on_open() {
    let (addr, registry, _root) = spawn_hub(vec!["mytype".into()]);

    let mut slave = connect(addr, "slave").await;
    recv(&mut slave).await;
    send(
        &mut slave,
        &HubMessage::Report {
            relay: None,
            data: serde_json::json!({"hostname": "node7"}),
        },
    )
    .await;
    wait_for_targets(&registry, &["node7"]).await;

    let mut master = connect(addr, "master").await;
    recv(&mut master).await;
    match recv(&mut master).await {
        HubMessage::Targets { data } => assert_eq!(data.targets, vec!["node7"]),
        other => panic!("expected targets, got {}", other.kind()),
    }
}

#[tokio::test]
async fn report_reaches_masters_enriched() {
    let (addr, _registry, _root) = spawn_hub(vec!["mytype".into()]);

    let mut master = connect(addr, "master").await;
    recv(&mut master).await;
    recv(&mut master).await;

    let mut slave = connect(addr, "slave").await;
    recv(&mut slave).await;
    send(
        &mut slave,
        &HubMessage::Report {
            relay: None,
            data: serde_json::json!({"hostname": "node7", "uptime_seconds": 12}),
        },
    )
    .await;

    match recv(&mut master).await {
        HubMessage::Report { relay, data } => {
            let relay = relay.expect("relayed report must carry enrichment");
            assert!(!relay.id.is_empty());
            assert!(relay.received > 0);
            assert!(relay.client.starts_with("127.0.0.1:"));
            assert_eq!(data["hostname"], "node7");
            assert_eq!(data["uptime_seconds"], 12);
        }
        other => panic!("expected report, got {}", other.kind()),
    }

    // The hostname binding follows the relay.
    match recv(&mut master).await {
        HubMessage::Targets { data } => assert_eq!(data.targets, vec!["node7"]),
        other => panic!("expected targets, got {}", other.kind()),
    }
}

#[tokio::test]
async fn command_routes_to_named_slave_only() {
    let (addr, registry, _root) = spawn_hub(vec!["mytype".into()]);

    let mut seven = connect(addr, "slave").await;
    recv(&mut seven).await;
    send(
        &mut seven,
        &HubMessage::Report { relay: None, data: serde_json::json!({"hostname": "node7"}) },
    )
    .await;

    let mut eight = connect(addr, "slave").await;
    recv(&mut eight).await;
    send(
        &mut eight,
        &HubMessage::Report { relay: None, data: serde_json::json!({"hostname": "node8"}) },
    )
    .await;
    wait_for_targets(&registry, &["node7", "node8"]).await;

    let mut master = connect(addr, "master").await;
    recv(&mut master).await;
    recv(&mut master).await;
    send(
        &mut master,
        &HubMessage::Command {
            target: "node7".into(),
            relay: None,
            data: serde_json::json!({"command": "fetch"}),
        },
    )
    .await;

    match recv(&mut seven).await {
        HubMessage::Command { target, relay, data } => {
            assert_eq!(target, "node7");
            assert!(relay.is_some());
            assert_eq!(data["command"], "fetch");
        }
        other => panic!("expected command, got {}", other.kind()),
    }
    expect_silence(&mut eight).await;
}

#[tokio::test]
async fn unknown_target_command_yields_no_feedback() {
    let (addr, _registry, _root) = spawn_hub(vec!["mytype".into()]);

    let mut master = connect(addr, "master").await;
    recv(&mut master).await;
    recv(&mut master).await;
    send(
        &mut master,
        &HubMessage::Command {
            target: "ghost".into(),
            relay: None,
            data: serde_json::json!({"command": "reboot"}),
        },
    )
    .await;

    expect_silence(&mut master).await;
}

#[tokio::test]
async fn slave_disconnect_prunes_target_table() {
    let (addr, registry, _root) = spawn_hub(vec!["mytype".into()]);

    let mut slave = connect(addr, "slave").await;
    recv(&mut slave).await;
    send(
        &mut slave,
        &HubMessage::Report { relay: None, data: serde_json::json!({"hostname": "node7"}) },
    )
    .await;
    wait_for_targets(&registry, &["node7"]).await;

    let mut master = connect(addr, "master").await;
    recv(&mut master).await;
    match recv(&mut master).await {
        HubMessage::Targets { data } => assert_eq!(data.targets, vec!["node7"]),
        other => panic!("expected targets, got {}", other.kind()),
    }

    slave.close(None).await.unwrap();
    match recv(&mut master).await {
        HubMessage::Targets { data } => assert!(data.targets.is_empty()),
        other => panic!("expected targets, got {}", other.kind()),
    }
    assert_eq!(registry.slave_count(), 0);
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_connection() {
    let (addr, _registry, _root) = spawn_hub(vec!["mytype".into()]);

    let mut master = connect(addr, "master").await;
    recv(&mut master).await;
    recv(&mut master).await;

    let mut slave = connect(addr, "slave").await;
    recv(&mut slave).await;
    slave
        .send(Message::Text("this is not json".into()))
        .await
        .unwrap();
    slave
        .send(Message::Text(r#"{"type":"mystery"}"#.into()))
        .await
        .unwrap();
    send(
        &mut slave,
        &HubMessage::Report { relay: None, data: serde_json::json!({"hostname": "node7"}) },
    )
    .await;

    // The good report still comes through after the garbage.
    match recv(&mut master).await {
        HubMessage::Report { data, .. } => assert_eq!(data["hostname"], "node7"),
        other => panic!("expected report, got {}", other.kind()),
    }
}
