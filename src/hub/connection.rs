//! Per-connection reader and writer tasks
//!
//! The reader forwards every text frame to `user_query`; the writer drains
//! the outbound queue and pings the peer on an idle timer. Either side
//! stopping tears the whole connection down, after which a `del` request
//! for the session goes out on `db_ops`.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::server::HubState;
use crate::bus::payload::DbOp;
use crate::bus::{publish_json, Envelope};
use crate::config::HubConfig;
use crate::session::SessionKey;

/// Session ids a client may put in its message body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutingIds {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    chat_id: Option<String>,
}

/// Runs one connection until the peer leaves or it is evicted
pub async fn serve(socket: WebSocket, key: SessionKey, state: HubState) {
    let registration = state.hub.register(&key);
    let conn_id = registration.conn_id;
    let span = crate::session_span!("connection", key, conn_id);

    async {
        tracing::info!("Connection opened");
        let (sink, stream) = socket.split();
        let closed = registration.closed.clone();

        let writer = tokio::spawn(
            write_loop(sink, registration.outbound, closed.clone(), state.config.clone())
                .in_current_span(),
        );
        read_loop(stream, &key, &state, &closed).await;

        closed.cancel();
        state.hub.unregister(&key, conn_id);
        if let Err(e) = writer.await {
            tracing::warn!("Writer task failed: {}", e);
        }
        tracing::info!("Connection closed");

        request_delete(&state, key.clone());
    }
    .instrument(span)
    .await
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    key: &SessionKey,
    state: &HubState,
    closed: &CancellationToken,
) {
    let pong_wait = state.config.pong_wait();
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => {
                tracing::debug!("Connection closed by hub");
                return;
            }
            frame = timeout(pong_wait, stream.next()) => frame,
        };

        let message = match frame {
            Err(_) => {
                tracing::info!("Peer silent for {:?}, closing", pong_wait);
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                tracing::debug!("Read failed: {}", e);
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => forward(state, key, text).await,
            Message::Binary(_) => tracing::debug!("Ignoring binary frame"),
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// Publishes an inbound message verbatim on `user_query`
async fn forward(state: &HubState, key: &SessionKey, text: String) {
    let ids: RoutingIds = match serde_json::from_str(&text) {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!("Dropping inbound message that is not JSON: {}", e);
            return;
        }
    };
    let foreign = ids.user_id.is_some_and(|id| id != key.user_id)
        || ids.chat_id.is_some_and(|id| id != key.chat_id);
    if foreign {
        tracing::warn!("Dropping inbound message addressed to another session");
        return;
    }

    let envelope = Envelope::raw(&state.topics.user_query, &key.token(), text.into_bytes());
    if let Err(e) = state.publisher.publish(envelope).await {
        tracing::error!("Failed to publish user query: {:#}", e);
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    closed: CancellationToken,
    config: HubConfig,
) {
    let write_wait = config.write_wait();
    let mut ping = interval_at(Instant::now() + config.ping_period(), config.ping_period());

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            payload = outbound.recv() => match payload {
                Some(payload) => Message::Text(payload),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match timeout(write_wait, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("Write failed: {}", e);
                break;
            }
            Err(_) => {
                tracing::info!("Write exceeded {:?}, closing", write_wait);
                break;
            }
        }
    }

    let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
    closed.cancel();
}

/// Asks the synchronizer to persist and drop the session's buffer
fn request_delete(state: &HubState, key: SessionKey) {
    let publisher = state.publisher.clone();
    let topic = state.topics.db_ops.clone();
    tokio::spawn(
        async move {
            match publish_json(publisher.as_ref(), &topic, &key.token(), &DbOp::delete(&key)).await {
                Ok(()) => tracing::debug!("Requested buffer delete"),
                Err(e) => tracing::error!("Failed to request buffer delete: {:#}", e),
            }
        }
        .in_current_span(),
    );
}
