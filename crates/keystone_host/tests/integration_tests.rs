//! Real WebSocket clients against the host server.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use keystone_core::*;
use keystone_host::*;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Sends every forwarded inbound message straight back.
struct EchoTerminal;

#[async_trait]
impl TerminalStage for EchoTerminal {
    async fn on_message(
        &self,
        _client: ClientId,
        packet: Packet,
        pipeline: &WsPipeline,
    ) -> Result<(), HostError> {
        pipeline
            .queue(packet)
            .map_err(|e| HostError::Network(e.to_string()))
    }
}

fn boot() -> Arc<Core> {
    let scheduler = Arc::new(TickLoop::spawn(Duration::from_millis(5)).unwrap());
    let mut catalog = ImplementationCatalog::new();
    variants::install_builtin(&mut catalog);
    Arc::new(
        Core::bootstrap(
            BuildIdentity::new("git-Paper-196 (MC: 1.20.4)"),
            scheduler,
            catalog,
            CoreConfig::default(),
        )
        .unwrap(),
    )
}

async fn start(
    server: HostServer,
) -> (Arc<HostServer>, SocketAddr, JoinHandle<Result<(), HostError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(server);
    let running = server.clone();
    let task = tokio::spawn(async move { running.serve(listener).await });
    (server, addr, task)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    client
}

async fn next_text(client: &mut Client) -> String {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no reply within 5s")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = message {
            return text.as_str().to_string();
        }
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_inbound_never_reaches_terminal() {
    let core = boot();
    core.on_event(
        Some(Direction::Inbound),
        |event| event.is_kind("Chat"),
        |event| {
            event.cancel();
            Ok(())
        },
    );
    let server = HostServer::with_terminal(HostConfig::default(), core.clone(), Arc::new(EchoTerminal));
    let (_server, addr, _task) = start(server).await;

    let mut client = connect(addr).await;
    client
        .send(Message::text(r#"{"type":"Chat","text":"hi"}"#))
        .await
        .unwrap();
    client
        .send(Message::text(r#"{"type":"Move","x":1}"#))
        .await
        .unwrap();

    assert_eq!(next_text(&mut client).await, r#"{"type":"Move","x":1}"#);
    assert_eq!(core.dispatch_stats().cancelled, 1);
    assert_eq!(core.connections().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_outbound_replies_are_intercepted() {
    let core = boot();
    core.on_event(
        Some(Direction::Outbound),
        |event| event.field_as::<String>("secret").is_ok(),
        |event| {
            event.cancel();
            Ok(())
        },
    );
    let server = HostServer::with_terminal(HostConfig::default(), core.clone(), Arc::new(EchoTerminal));
    let (_server, addr, _task) = start(server).await;

    let mut client = connect(addr).await;
    client
        .send(Message::text(r#"{"type":"Note","secret":"x"}"#))
        .await
        .unwrap();
    client
        .send(Message::text(r#"{"type":"Note","public":"y"}"#))
        .await
        .unwrap();

    assert_eq!(next_text(&mut client).await, r#"{"type":"Note","public":"y"}"#);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_order_holds_within_each_direction() {
    let core = boot();
    let seen: Arc<Mutex<Vec<(Direction, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    core.on_event(None, |_| true, move |event| {
        let seq: u64 = event.field_as("seq")?;
        log.lock().push((event.direction(), seq));
        Ok(())
    });
    let server = HostServer::with_terminal(HostConfig::default(), core.clone(), Arc::new(EchoTerminal));
    let (_server, addr, _task) = start(server).await;

    let mut client = connect(addr).await;
    for seq in 0..20u64 {
        client
            .send(Message::text(format!(r#"{{"type":"Move","seq":{seq}}}"#)))
            .await
            .unwrap();
    }
    for seq in 0..20u64 {
        assert_eq!(
            next_text(&mut client).await,
            format!(r#"{{"type":"Move","seq":{seq}}}"#)
        );
    }

    let seen = seen.lock();
    for direction in [Direction::Inbound, Direction::Outbound] {
        let order: Vec<u64> = seen
            .iter()
            .filter(|(d, _)| *d == direction)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_logging_terminal_answers_ping() {
    let core = boot();
    let (_server, addr, _task) = start(HostServer::new(HostConfig::default(), core)).await;

    let mut client = connect(addr).await;
    client.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();

    let reply: serde_json::Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(reply["type"], "pong");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_core_send_reaches_client_without_interception() {
    let core = boot();
    core.on_event(None, |_| true, |event| {
        event.cancel();
        Ok(())
    });
    let (_server, addr, _task) = start(HostServer::new(HostConfig::default(), core.clone())).await;

    let mut client = connect(addr).await;
    wait_for(|| core.connections().len() == 1).await;
    let id = core.connections().clients()[0];

    let title = core.feature::<TitleFeature>().unwrap();
    let sent = core.send(id, title.show("Hello", "", TitleTimes::default())).unwrap();
    assert_eq!(sent, 3);

    let first: serde_json::Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(first["type"], "set_titles_animation");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connections_over_limit_are_refused() {
    let core = boot();
    let config = HostConfig {
        max_connections: 1,
        ..Default::default()
    };
    let (server, addr, _task) = start(HostServer::new(config, core.clone())).await;

    let _first = connect(addr).await;
    wait_for(|| server.active_connections() == 1).await;

    assert!(connect_async(format!("ws://{addr}")).await.is_err());
    assert_eq!(core.connections().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_releases_every_connection() {
    let core = boot();
    let (server, addr, task) = start(HostServer::new(HostConfig::default(), core.clone())).await;

    let mut client = connect(addr).await;
    wait_for(|| core.connections().len() == 1).await;

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(core.connections().is_empty());

    // The client sees the connection close.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_unregisters_client() {
    let core = boot();
    let (server, addr, _task) = start(HostServer::new(HostConfig::default(), core.clone())).await;

    let mut client = connect(addr).await;
    wait_for(|| core.connections().len() == 1).await;
    client.close(None).await.unwrap();

    wait_for(|| core.connections().is_empty()).await;
    wait_for(|| server.active_connections() == 0).await;
}
