/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

//! Request/response correlation bridge to a remote Jira Server add-on.
//!
//! Server and data-center Jira sites sit behind the customer's firewall, so
//! the bot cannot call them directly. Instead a locally-installed add-on
//! holds a persistent connection open to the gateway; the bridge relays each
//! HTTP-shaped request to that connection tagged with a fresh correlation
//! id, then waits for the add-on's asynchronous callback bearing the same
//! id, racing it against a configured timeout and the caller's cancellation
//! signal.
//!
//! The [`CorrelationTable`] is the only concurrently-mutated shared state:
//! waiters insert, callbacks remove-and-send, timeouts remove. All three go
//! through the table's write lock, so a timeout removal and a callback
//! resolution can never both succeed for the same entry.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, RwLock};
use tracing::{error, trace, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    /// The peer id resolved to no live connection. Reported immediately,
    /// without creating a correlation entry.
    #[error("no live connection for Jira server {0}; is the add-on installed and running?")]
    PeerNotConnected(String),
    /// No callback arrived within the configured window.
    #[error("Jira server {peer_id} is not responding (correlation {correlation_id})")]
    NotResponding {
        peer_id: String,
        correlation_id: String,
    },
    #[error("request cancelled before a response arrived")]
    Cancelled,
    #[error("transport failure: {0}")]
    Transport(String),
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// Request relayed to the add-on. The payload is an opaque string; its
/// schema belongs to the Jira client on both ends.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BridgeRequest {
    pub correlation_id: String,
    pub payload: String,
}

/// Callback body posted back by the add-on.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BridgeCallback {
    pub correlation_id: String,
    pub payload: String,
}

// ---------------------------------------------------------------------------
// Connection directory
// ---------------------------------------------------------------------------

/// Resolves stable peer ids to live connections and delivers requests to
/// them. Implemented by the gateway's add-on connection registry; tests use
/// in-memory fakes.
#[async_trait::async_trait]
pub trait ConnectionDirectory: Send + Sync {
    /// The live connection id for a peer, or `None` when the peer has no
    /// connection open right now.
    async fn resolve_connection(&self, peer_id: &str) -> Option<String>;

    /// Deliver a request down a live connection.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] when the connection is gone.
    async fn send(&self, connection_id: &str, request: BridgeRequest) -> Result<(), BridgeError>;
}

// ---------------------------------------------------------------------------
// Correlation table
// ---------------------------------------------------------------------------

struct PendingEntry {
    sender: oneshot::Sender<String>,
    created_at: Instant,
}

/// Pending waiters keyed by correlation id. Ids are UUID v4 and globally
/// unique, not client-scoped, so callbacks can be relayed through any
/// intermediary transport without extra addressing.
#[derive(Default)]
pub struct CorrelationTable {
    entries: RwLock<HashMap<String, PendingEntry>>,
}

impl CorrelationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, correlation_id: String, sender: oneshot::Sender<String>) {
        let entry = PendingEntry {
            sender,
            created_at: Instant::now(),
        };
        let mut entries = self.entries.write().await;
        entries.insert(correlation_id, entry);
    }

    async fn remove(&self, correlation_id: &str) -> Option<Duration> {
        let mut entries = self.entries.write().await;
        entries
            .remove(correlation_id)
            .map(|e| e.created_at.elapsed())
    }

    /// Resolve a pending entry with the callback payload. Returns `false`
    /// for untracked ids — already completed, timed out, or never issued —
    /// which callers treat as a no-op, never an error.
    pub async fn resolve(&self, correlation_id: &str, payload: String) -> bool {
        let entry = {
            let mut entries = self.entries.write().await;
            entries.remove(correlation_id)
        };
        match entry {
            Some(e) => {
                if e.sender.send(payload).is_err() {
                    trace!(correlation_id, "waiter dropped before callback arrived");
                }
                true
            }
            None => false,
        }
    }

    /// Number of requests currently awaiting a callback.
    pub async fn pending(&self) -> usize {
        self.entries.read().await.len()
    }
}

// ---------------------------------------------------------------------------
// Request bridge
// ---------------------------------------------------------------------------

/// Relays requests to one addressed peer and awaits the correlated reply.
pub struct RequestBridge {
    directory: Arc<dyn ConnectionDirectory>,
    table: Arc<CorrelationTable>,
    response_timeout: Duration,
}

impl RequestBridge {
    #[must_use]
    pub fn new(
        directory: Arc<dyn ConnectionDirectory>,
        table: Arc<CorrelationTable>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            table,
            response_timeout,
        }
    }

    /// Send `payload` to the peer identified by `peer_id` and wait for the
    /// add-on's callback, the response timeout, or cancellation — whichever
    /// comes first. The losers of the race are abandoned without further
    /// effect.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::PeerNotConnected`] when the peer has no live
    ///   connection (no correlation entry is created).
    /// - [`BridgeError::NotResponding`] when the timeout window elapses.
    /// - [`BridgeError::Cancelled`] when the cancellation signal fires.
    /// - [`BridgeError::Transport`] when delivery to the connection fails.
    pub async fn send_request_and_wait(
        &self,
        peer_id: &str,
        payload: String,
        cancel: watch::Receiver<bool>,
    ) -> Result<String, BridgeError> {
        let Some(connection_id) = self.directory.resolve_connection(peer_id).await else {
            return Err(BridgeError::PeerNotConnected(peer_id.to_string()));
        };

        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel::<String>();
        self.table.insert(correlation_id.clone(), tx).await;

        let request = BridgeRequest {
            correlation_id: correlation_id.clone(),
            payload,
        };
        if let Err(e) = self.directory.send(&connection_id, request).await {
            self.table.remove(&correlation_id).await;
            return Err(e);
        }

        trace!(peer_id, correlation_id = %correlation_id, "request relayed, awaiting callback");

        let mut cancel = cancel;
        tokio::select! {
            result = rx => match result {
                Ok(response) => Ok(response),
                // The sender can only disappear if the entry was removed
                // underneath us, which this task alone does.
                Err(_) => {
                    self.table.remove(&correlation_id).await;
                    Err(BridgeError::Transport("reply channel closed".to_string()))
                }
            },
            () = tokio::time::sleep(self.response_timeout) => {
                let waited = self.table.remove(&correlation_id).await;
                error!(
                    peer_id,
                    correlation_id = %correlation_id,
                    waited_ms = waited.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                    "no callback from add-on within the response window"
                );
                Err(BridgeError::NotResponding {
                    peer_id: peer_id.to_string(),
                    correlation_id,
                })
            },
            () = cancelled(&mut cancel) => {
                self.table.remove(&correlation_id).await;
                Err(BridgeError::Cancelled)
            },
        }
    }

    /// Resolve an add-on callback. Untracked correlation ids are logged and
    /// ignored — a late callback after a timeout is normal, not a fault.
    pub async fn resolve_callback(&self, callback: BridgeCallback) {
        if !self
            .table
            .resolve(&callback.correlation_id, callback.payload)
            .await
        {
            warn!(
                correlation_id = %callback.correlation_id,
                "callback for untracked correlation id ignored"
            );
        }
    }
}

/// Completes once the watch signal flips to `true`. A dropped sender means
/// cancellation can no longer be requested, so the future stays pending.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Directory with one live peer; delivered requests are exposed on a
    /// channel so tests can play the add-on's side.
    struct FakeDirectory {
        peer_id: String,
        connection_id: String,
        delivered: mpsc::UnboundedSender<BridgeRequest>,
        fail_send: bool,
    }

    #[async_trait::async_trait]
    impl ConnectionDirectory for FakeDirectory {
        async fn resolve_connection(&self, peer_id: &str) -> Option<String> {
            (peer_id == self.peer_id).then(|| self.connection_id.clone())
        }

        async fn send(
            &self,
            _connection_id: &str,
            request: BridgeRequest,
        ) -> Result<(), BridgeError> {
            if self.fail_send {
                return Err(BridgeError::Transport("connection reset".to_string()));
            }
            let _ = self.delivered.send(request);
            Ok(())
        }
    }

    fn harness(
        timeout: Duration,
        fail_send: bool,
    ) -> (
        RequestBridge,
        Arc<CorrelationTable>,
        mpsc::UnboundedReceiver<BridgeRequest>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let directory = Arc::new(FakeDirectory {
            peer_id: "srv-1".to_string(),
            connection_id: "conn-1".to_string(),
            delivered: tx,
            fail_send,
        });
        let table = Arc::new(CorrelationTable::new());
        let bridge = RequestBridge::new(directory, Arc::clone(&table), timeout);
        (bridge, table, rx)
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the test's duration by leaking it;
        // a dropped sender would still never cancel, this is just explicit.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_unknown_peer_fails_immediately_without_entry() {
        let (bridge, table, _rx) = harness(Duration::from_secs(5), false);
        let result = bridge
            .send_request_and_wait("srv-unknown", "{}".to_string(), no_cancel())
            .await;
        assert!(matches!(result, Err(BridgeError::PeerNotConnected(p)) if p == "srv-unknown"));
        assert_eq!(table.pending().await, 0);
    }

    #[tokio::test]
    async fn test_callback_resolves_waiter() {
        let (bridge, table, mut delivered) = harness(Duration::from_secs(5), false);
        let bridge = Arc::new(bridge);

        let waiter = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .send_request_and_wait("srv-1", "ping".to_string(), no_cancel())
                    .await
            })
        };

        let request = delivered.recv().await.unwrap();
        assert_eq!(request.payload, "ping");

        bridge
            .resolve_callback(BridgeCallback {
                correlation_id: request.correlation_id,
                payload: "pong".to_string(),
            })
            .await;

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response, "pong");
        assert_eq!(table.pending().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_each_get_their_own_payload() {
        let (bridge, table, mut delivered) = harness(Duration::from_secs(5), false);
        let bridge = Arc::new(bridge);
        let n = 16;

        let mut waiters = Vec::new();
        for i in 0..n {
            let bridge = Arc::clone(&bridge);
            waiters.push(tokio::spawn(async move {
                bridge
                    .send_request_and_wait("srv-1", format!("req-{i}"), no_cancel())
                    .await
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..n {
            requests.push(delivered.recv().await.unwrap());
        }

        // Answer in reverse order to prove correlation, not arrival order,
        // pairs requests with responses.
        for request in requests.into_iter().rev() {
            let reply = request.payload.replace("req", "resp");
            bridge
                .resolve_callback(BridgeCallback {
                    correlation_id: request.correlation_id,
                    payload: reply,
                })
                .await;
        }

        for (i, waiter) in waiters.into_iter().enumerate() {
            let response = waiter.await.unwrap().unwrap();
            assert_eq!(response, format!("resp-{i}"));
        }
        assert_eq!(table.pending().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_fails_and_leaves_no_residual_entry() {
        let (bridge, table, _delivered) = harness(Duration::from_millis(20), false);
        let result = bridge
            .send_request_and_wait("srv-1", "ping".to_string(), no_cancel())
            .await;
        assert!(matches!(
            result,
            Err(BridgeError::NotResponding { peer_id, .. }) if peer_id == "srv-1"
        ));
        assert_eq!(table.pending().await, 0);
    }

    #[tokio::test]
    async fn test_late_callback_after_timeout_is_ignored() {
        let (bridge, table, mut delivered) = harness(Duration::from_millis(20), false);
        let result = bridge
            .send_request_and_wait("srv-1", "ping".to_string(), no_cancel())
            .await;
        assert!(result.is_err());

        let request = delivered.recv().await.unwrap();
        // Must neither panic nor resurrect the entry.
        bridge
            .resolve_callback(BridgeCallback {
                correlation_id: request.correlation_id,
                payload: "too late".to_string(),
            })
            .await;
        assert_eq!(table.pending().await, 0);
    }

    #[tokio::test]
    async fn test_unrecognized_correlation_id_never_errors() {
        let (bridge, table, _delivered) = harness(Duration::from_secs(5), false);
        bridge
            .resolve_callback(BridgeCallback {
                correlation_id: "not-a-real-id".to_string(),
                payload: "{}".to_string(),
            })
            .await;
        assert_eq!(table.pending().await, 0);
    }

    #[tokio::test]
    async fn test_send_failure_cleans_up_entry() {
        let (bridge, table, _delivered) = harness(Duration::from_secs(5), true);
        let result = bridge
            .send_request_and_wait("srv-1", "ping".to_string(), no_cancel())
            .await;
        assert!(matches!(result, Err(BridgeError::Transport(_))));
        assert_eq!(table.pending().await, 0);
    }

    #[tokio::test]
    async fn test_cancellation_wins_the_race() {
        let (bridge, table, _delivered) = harness(Duration::from_secs(30), false);
        let bridge = Arc::new(bridge);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let waiter = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .send_request_and_wait("srv-1", "ping".to_string(), cancel_rx)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel_tx.send(true).unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Cancelled)));
        assert_eq!(table.pending().await, 0);
    }

    #[tokio::test]
    async fn test_correlation_ids_are_unique_across_requests() {
        let (bridge, _table, mut delivered) = harness(Duration::from_millis(50), false);
        let bridge = Arc::new(bridge);
        for _ in 0..8 {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                let _ = bridge
                    .send_request_and_wait("srv-1", "x".to_string(), no_cancel())
                    .await;
            });
        }
        let mut seen = Vec::new();
        for _ in 0..8 {
            let request = delivered.recv().await.unwrap();
            assert!(!seen.contains(&request.correlation_id));
            seen.push(request.correlation_id);
        }
    }
}
