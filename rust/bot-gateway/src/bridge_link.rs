/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Live add-on connections. Each Jira Server add-on opens one long-lived
//! SSE stream against `/addon/stream`; requests from the bridge are pushed
//! down that stream and the add-on answers out-of-band via
//! `/addon/callback`. The registry doubles as the bridge's
//! [`ConnectionDirectory`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use jiralink_bridge::{BridgeCallback, BridgeError, BridgeRequest, ConnectionDirectory};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;

const REQUEST_CHANNEL_CAPACITY: usize = 32;

struct LiveConnection {
    connection_id: String,
    tx: mpsc::Sender<BridgeRequest>,
}

/// server id → live connection. One connection per server; a reconnect
/// replaces the previous entry, which closes the old stream's channel.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, LiveConnection>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh connection for `server_id`, returning the generated
    /// connection id and the request stream for the SSE response.
    pub async fn register(&self, server_id: &str) -> (String, mpsc::Receiver<BridgeRequest>) {
        let connection_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let mut connections = self.connections.write().await;
        if let Some(previous) = connections.insert(
            server_id.to_string(),
            LiveConnection {
                connection_id: connection_id.clone(),
                tx,
            },
        ) {
            info!(
                server_id,
                previous_connection = %previous.connection_id,
                "add-on reconnected, dropping previous stream"
            );
        }
        (connection_id, rx)
    }

    /// Drop the registration, but only if it still belongs to this
    /// connection — a reconnect may already have replaced it.
    pub async fn unregister(&self, server_id: &str, connection_id: &str) {
        let mut connections = self.connections.write().await;
        if connections
            .get(server_id)
            .is_some_and(|c| c.connection_id == connection_id)
        {
            connections.remove(server_id);
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[async_trait::async_trait]
impl ConnectionDirectory for ConnectionRegistry {
    async fn resolve_connection(&self, peer_id: &str) -> Option<String> {
        self.connections
            .read()
            .await
            .get(peer_id)
            .map(|c| c.connection_id.clone())
    }

    async fn send(&self, connection_id: &str, request: BridgeRequest) -> Result<(), BridgeError> {
        let entry = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .find(|(_, c)| c.connection_id == connection_id)
                .map(|(server_id, c)| (server_id.clone(), c.tx.clone()))
        };
        let Some((server_id, tx)) = entry else {
            return Err(BridgeError::Transport(format!(
                "connection {connection_id} vanished"
            )));
        };
        if tx.send(request).await.is_err() {
            // The stream closed without unregistering; prune the entry so
            // the next request fails fast as peer-not-connected.
            self.unregister(&server_id, connection_id).await;
            return Err(BridgeError::Transport(format!(
                "connection {connection_id} closed mid-send"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct StreamQuery {
    pub server_id: Option<String>,
}

/// Shared API-key gate for the add-on and admin endpoints. With no key
/// configured (dev mode) everything is allowed; the startup log warns
/// about it.
pub(crate) fn check_addon_key(
    headers: &HeaderMap,
    expected: &Option<String>,
) -> Result<(), StatusCode> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let provided = headers
        .get("X-Jiralink-Api-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided == expected {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

/// GET /addon/stream?server_id=… — the add-on's persistent connection.
pub async fn addon_stream_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = check_addon_key(&headers, &state.addon_api_key) {
        return (status, "invalid api key").into_response();
    }
    let Some(server_id) = query.server_id.filter(|s| !s.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "server_id is required").into_response();
    };

    let (connection_id, rx) = state.connections.register(&server_id).await;
    info!(server_id = %server_id, connection_id = %connection_id, "add-on stream opened");

    let stream = ReceiverStream::new(rx).map(|request| {
        Ok::<Event, std::convert::Infallible>(
            Event::default()
                .event("request")
                .data(serde_json::to_string(&request).unwrap_or_default()),
        )
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// POST /addon/callback — the add-on's asynchronous reply.
pub async fn addon_callback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(callback): Json<BridgeCallback>,
) -> Response {
    if let Err(status) = check_addon_key(&headers, &state.addon_api_key) {
        return (status, "invalid api key").into_response();
    }
    if callback.correlation_id.is_empty() {
        warn!("callback without correlation id");
        return (StatusCode::BAD_REQUEST, "correlation_id is required").into_response();
    }
    state.bridge.resolve_callback(callback).await;
    StatusCode::OK.into_response()
}

// ===========================================================================
// Tests
// ===========================================================================
