//! HTTP surface of the hub: `GET /ws?userId=..&chatId=..` and `GET /health`

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{connection, Hub};
use crate::bus::Publisher;
use crate::config::{HubConfig, TopicsConfig};
use crate::error::{ChatRelayError, Result};
use crate::session::SessionKey;

/// State shared by every connection
#[derive(Clone)]
pub struct HubState {
    pub hub: Arc<Hub>,
    pub publisher: Arc<dyn Publisher>,
    pub topics: TopicsConfig,
    pub config: HubConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Handshake {
    user_id: Option<String>,
    chat_id: Option<String>,
}

impl Handshake {
    fn session(self) -> Option<SessionKey> {
        let key = SessionKey::new(self.user_id?, self.chat_id?);
        key.is_valid().then_some(key)
    }
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .route("/health", get(health))
        .with_state(state)
}

async fn upgrade(
    Query(handshake): Query<Handshake>,
    State(state): State<HubState>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(key) = handshake.session() else {
        return (StatusCode::BAD_REQUEST, "a valid userId and chatId are required").into_response();
    };

    ws.max_message_size(state.config.max_message_bytes)
        .on_upgrade(move |socket| connection::serve(socket, key, state))
        .into_response()
}

async fn health() -> &'static str {
    "ok"
}

/// Serves the hub on `listener` until `shutdown` fires
pub async fn serve(listener: TcpListener, state: HubState, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "Hub listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ChatRelayError::Io(e).into())
}
