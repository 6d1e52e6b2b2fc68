//! WebSocket transport for the bidirectional client stream
//!
//! JSON text frames in both directions. The protocol itself lives in
//! `StreamSession`; this module only adapts the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{future, stream::SplitSink, SinkExt, StreamExt};
use gatehub_cluster::{connection::StreamSession, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::extract::ClientAddr;
use super::{AppError, AppResult, AppState};

/// Inbound frames above this size are rejected by the socket
const MAX_FRAME_SIZE: usize = 256 * 1024;

/// `GET /api/v1/stream`
pub async fn stream_handler(
    State(state): State<AppState>,
    ClientAddr(client_ip): ClientAddr,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let (tx, outbound) = mpsc::channel::<ServerMessage>(state.outbound_buffer);
    let session = StreamSession::open(
        state.cluster.connections.clone(),
        state.cluster.registry.clone(),
        state.cluster.notifier.clone(),
        Box::new(tx),
        &client_ip,
    )
    .map_err(|e| AppError::service_unavailable("CONNECTION_REJECTED", e.to_string()))?;

    let connection_id = session.connection().id().to_string();
    let manager = state.cluster.connections.clone();

    Ok(ws
        .max_message_size(MAX_FRAME_SIZE)
        .on_failed_upgrade(move |e| {
            warn!(connection_id = %connection_id, error = %e, "WebSocket upgrade failed");
            manager.remove_connection(&connection_id);
        })
        .on_upgrade(move |socket| handle_socket(socket, session, outbound)))
}

async fn handle_socket(
    socket: WebSocket,
    session: StreamSession,
    mut outbound: mpsc::Receiver<ServerMessage>,
) {
    let connection = session.connection().clone();
    info!(
        connection_id = %connection.id(),
        client_ip = %connection.client_ip(),
        "Stream connection established"
    );

    let (mut sink, receiver) = socket.split();

    // Writer: flushes queued messages (a SERVER_CLOSE included) before
    // honouring the connection's cancellation
    let writer_connection = connection.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                message = outbound.recv() => match message {
                    Some(message) => {
                        if write_frame(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                () = writer_connection.closed() => {
                    while let Ok(message) = outbound.try_recv() {
                        if write_frame(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        if let Err(e) = sink.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
    });

    let inbound = receiver
        .take_while(|frame| {
            future::ready(matches!(frame, Ok(message) if !matches!(message, Message::Close(_))))
        })
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        });

    session.run(inbound).await;

    if let Err(e) = writer.await {
        warn!(error = %e, "Stream writer task failed");
    }
    info!(connection_id = %connection.id(), "Stream connection closed");
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(message_type = message.kind(), error = %e, "Failed to encode server message");
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await
}
