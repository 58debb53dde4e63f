//! Per-connection handling: handshake, registration with the core, the
//! inbound read loop and the outbound writer task.

use crate::error::HostError;
use crate::pipeline::{to_message, Outbound, WsPipeline};
use crate::terminal::TerminalStage;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use keystone_core::{ClientId, Core, Direction, Packet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<TcpStream>;
type WsSink = SplitSink<WsStream, Message>;
type WsReceiver = SplitStream<WsStream>;

/// Serves one client from handshake to disconnect.
///
/// The interceptor is installed before the first message is read and
/// uninstalled after the last one, so every message of the connection's
/// lifetime crosses it. Inbound messages are intercepted one at a time in
/// arrival order; outbound ones in queue order by the writer task.
///
/// The two directions are dispatched by separate tasks, so an inbound and
/// an outbound message of the same connection may reach listeners in
/// either order. Only the order within each direction is guaranteed.
///
/// # Errors
///
/// Returns an error if the handshake fails or times out, or if the core
/// refuses to register the client.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    core: Arc<Core>,
    terminal: Arc<dyn TerminalStage>,
    handshake_timeout_ms: u64,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), HostError> {
    let ws_stream = timeout(Duration::from_millis(handshake_timeout_ms), accept_async(stream))
        .await
        .map_err(|_| HostError::HandshakeTimeout(handshake_timeout_ms))?
        .map_err(|e| HostError::Network(format!("WebSocket handshake failed for {addr}: {e}")))?;

    let (ws_sink, mut ws_receiver) = ws_stream.split();
    let client = ClientId::new();
    let (pipeline, outbound) = WsPipeline::new(client);

    let handle = core.connected(client, pipeline.clone())?;
    info!("👋 Client {} connected from {}", client, addr);
    debug!("Pipeline for {}: {:?}", client, handle);

    let writer = tokio::spawn(write_outbound(client, ws_sink, outbound, pipeline.clone()));
    terminal.on_connect(client, &pipeline).await;

    loop {
        tokio::select! {
            message = ws_receiver.next() => {
                if !handle_frame(client, message, &pipeline, terminal.as_ref()).await {
                    break;
                }
            }
            _ = shutdown.recv() => {
                debug!("Closing client {} for shutdown", client);
                break;
            }
        }
    }

    pipeline.close();
    core.disconnected(client);
    terminal.on_disconnect(client).await;
    drain(ws_receiver);

    if let Err(e) = writer.await {
        warn!("Writer task for client {} ended abnormally: {}", client, e);
    }
    info!("Connection {} from {} closed", client, addr);
    Ok(())
}

/// Processes one read result. Returns false when the connection is done.
async fn handle_frame(
    client: ClientId,
    message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    pipeline: &WsPipeline,
    terminal: &dyn TerminalStage,
) -> bool {
    let packet = match message {
        Some(Ok(Message::Text(text))) => Packet::new(text.as_bytes().to_vec()),
        Some(Ok(Message::Binary(data))) => Packet::new(data.to_vec()),
        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
            // tungstenite queues the pong reply itself
            return true;
        }
        Some(Ok(Message::Close(_))) => {
            info!("Client {} requested close", client);
            return false;
        }
        Some(Ok(Message::Frame(_))) => {
            warn!("Received unsupported frame from {}", client);
            return true;
        }
        Some(Err(e)) => {
            error!("WebSocket error for client {}: {}", client, e);
            return false;
        }
        None => return false,
    };

    let packet = match pipeline.interceptor() {
        Some(interceptor) => match interceptor.intercept(Direction::Inbound, packet).await {
            Some(packet) => packet,
            None => return true,
        },
        None => packet,
    };

    if let Err(e) = terminal.on_message(client, packet, pipeline).await {
        warn!("Terminal stage failed for client {}: {}", client, e);
    }
    true
}

/// Drains a connection's outbound queue onto the socket.
async fn write_outbound(
    client: ClientId,
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    pipeline: Arc<WsPipeline>,
) {
    while let Some(item) = outbound.recv().await {
        let message = match item {
            Outbound::Packet(packet) => match pipeline.interceptor() {
                Some(interceptor) => {
                    match interceptor.intercept(Direction::Outbound, packet).await {
                        Some(packet) => to_message(packet),
                        None => continue,
                    }
                }
                None => to_message(packet),
            },
            Outbound::Raw(packet) => to_message(packet),
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };

        if let Err(e) = sink.send(message).await {
            debug!("Write to client {} failed: {}", client, e);
            pipeline.close();
            break;
        }
    }

    if let Err(e) = sink.close().await {
        trace!("Closing sink for {}: {}", client, e);
    }
}

/// Keeps reading in the background until the peer finishes the close
/// handshake, so the writer's close frame is acknowledged.
fn drain(mut receiver: WsReceiver) {
    tokio::spawn(async move {
        let _ = timeout(Duration::from_secs(5), async {
            while let Some(Ok(_)) = receiver.next().await {}
        })
        .await;
    });
}
