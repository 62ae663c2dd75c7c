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

#![allow(clippy::module_name_repetitions)]

mod activity;
mod bridge_link;
mod cache;
mod dialogs;
mod dispatch;
mod graph;
mod jira;
mod mail;
mod routes;
mod store;

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use jiralink_bridge::{CorrelationTable, RequestBridge};
use jiralink_config::Config;
use jiralink_routing::RouteTable;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, trace, warn};

use crate::activity::Activity;
use crate::bridge_link::ConnectionRegistry;
use crate::cache::TtlCache;
use crate::dispatch::Dispatcher;
use crate::graph::GraphNotifier;
use crate::jira::JiraClient;
use crate::mail::MailSender;
use crate::routes::{route_catalog, DialogRouter};
use crate::store::Store;

const SERVICE_NAME: &str = "bot-gateway";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("config error: {0}")]
    Config(String),
    #[error("routing error: {0}")]
    Routing(#[from] jiralink_routing::RoutingError),
}

/// Catalog → table → registry → router → dispatcher. Every failure in this
/// chain is a configuration error and fatal by design.
fn build_dispatcher(config: &Config) -> Result<Dispatcher, GatewayError> {
    let catalog = route_catalog(config.routing.default_threshold)?;
    let table = RouteTable::build(catalog)?;
    let registry = dialogs::build_registry()?;
    let router = DialogRouter::new(table, registry)?;
    Dispatcher::new(router)
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    /// Fronts user-connection lookups; invalidated on disconnect.
    pub conn_cache: TtlCache,
    pub jira: JiraClient,
    pub mail: Option<MailSender>,
    pub graph: Option<Arc<GraphNotifier>>,
    pub connections: Arc<ConnectionRegistry>,
    pub bridge: Arc<RequestBridge>,
    pub correlation: Arc<CorrelationTable>,
    pub dispatcher: Dispatcher,
    pub addon_api_key: Option<String>,
    /// Flipped on shutdown; honored at the bridge race point.
    pub cancel_rx: watch::Receiver<bool>,
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

fn load_dotenv() {
    match std::fs::read_to_string(".env") {
        Ok(contents) => {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, val)) = line.split_once('=') {
                    let key = key.trim();
                    let val = val.trim();
                    // SAFETY: load_dotenv() is called from main() before
                    // tokio::runtime::Builder::build(), so no other threads
                    // exist. set_var is unsafe in edition 2024 due to
                    // potential data races with concurrent getenv, but here
                    // we are strictly single-threaded.
                    unsafe {
                        std::env::set_var(key, val);
                    }
                    eprintln!(".env: loaded {key}");
                }
            }
        }
        Err(e) => {
            eprintln!(".env: not loaded ({e})");
        }
    }
}

fn main() {
    // Load .env in single-threaded context before spawning the tokio runtime
    load_dotenv();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main());
}

async fn async_main() {
    let config = match Config::load() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("fatal: failed to load config: {e}");
            process::exit(1);
        }
    };

    let _telemetry_guard = jiralink_telemetry::init_telemetry(SERVICE_NAME, &config.telemetry)
        .unwrap_or_else(|e| {
            eprintln!("fatal: telemetry init failed: {e}");
            process::exit(1);
        });

    info!(service = SERVICE_NAME, "starting");

    // Connect to Postgres
    let pg_password = match std::env::var(&config.postgres.password_env) {
        Ok(pw) => pw,
        Err(_) => {
            error!(
                key_name = %config.postgres.password_env,
                "postgres password env var not set"
            );
            process::exit(1);
        }
    };
    let pg_url = format!(
        "postgres://{}:{}@{}:{}/{}",
        config.postgres.user,
        pg_password,
        config.postgres.host,
        config.postgres.port,
        config.postgres.database,
    );
    let pg = match PgPoolOptions::new()
        .min_connections(config.postgres.min_connections)
        .max_connections(config.postgres.max_connections)
        .connect(&pg_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "failed to connect to Postgres");
            process::exit(1);
        }
    };

    let store = Store::new(pg);
    if let Err(e) = store.ensure_schema().await {
        error!(error = %e, "failed to ensure schema");
        process::exit(1);
    }

    // Add-on bridge wiring
    let addon_api_key = std::env::var(&config.bridge.api_key_name).ok();
    if addon_api_key.is_none() {
        warn!(
            key_name = %config.bridge.api_key_name,
            "add-on API key not set — add-on endpoints are unauthenticated"
        );
    }
    let connections = Arc::new(ConnectionRegistry::new());
    let correlation = Arc::new(CorrelationTable::new());
    let bridge = Arc::new(RequestBridge::new(
        Arc::clone(&connections) as Arc<dyn jiralink_bridge::ConnectionDirectory>,
        Arc::clone(&correlation),
        Duration::from_secs(config.bridge.response_timeout_secs),
    ));

    let jira = match JiraClient::new(
        Duration::from_secs(config.jira.request_timeout_secs),
        config.jira.breaker_threshold,
        config.jira.breaker_recovery_secs,
        Arc::clone(&bridge),
    ) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build jira client");
            process::exit(1);
        }
    };

    // Optional outbound adapters
    let outbound_http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to build http client");
            process::exit(1);
        });
    let mail = if config.mail.enabled {
        match std::env::var(&config.mail.api_key_env) {
            Ok(api_key) => Some(MailSender::new(
                outbound_http.clone(),
                api_key,
                config.mail.from_address.clone(),
                config.mail.support_inbox.clone(),
            )),
            Err(_) => {
                warn!(
                    key_name = %config.mail.api_key_env,
                    "mail enabled but API key env var not set — feedback mail disabled"
                );
                None
            }
        }
    } else {
        None
    };
    let graph = if config.graph.enabled {
        match std::env::var(&config.graph.client_secret_env) {
            Ok(secret) => Some(Arc::new(GraphNotifier::new(
                outbound_http,
                config.graph.tenant_id.clone(),
                config.graph.client_id.clone(),
                secret,
            ))),
            Err(_) => {
                warn!(
                    key_name = %config.graph.client_secret_env,
                    "graph enabled but client secret env var not set — notifications disabled"
                );
                None
            }
        }
    } else {
        None
    };

    let dispatcher = match build_dispatcher(&config) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "failed to build dispatcher");
            process::exit(1);
        }
    };
    info!(
        dialogs = dispatcher.registered_dialog_count(),
        "dispatcher ready"
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let state = Arc::new(AppState {
        store,
        conn_cache: TtlCache::new(Duration::from_secs(config.cache.ttl_secs)),
        jira,
        mail,
        graph,
        connections,
        bridge,
        correlation,
        dispatcher,
        addon_api_key,
        cancel_rx,
        config: Arc::clone(&config),
    });

    let cors = if config.server.cors_origins.is_empty() {
        CorsLayer::new()
    } else {
        let parsed: Vec<_> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    };

    let app = Router::new()
        .route("/api/messages", post(messages_handler))
        .route("/addon/stream", get(bridge_link::addon_stream_handler))
        .route("/addon/callback", post(bridge_link::addon_callback_handler))
        .route("/admin/connections", post(admin_put_connection_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(config.server.body_limit_bytes))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(cors)
        .with_state(state);

    let port = config.server.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    if let (Some(cert_path), Some(key_path)) =
        (config.tls.cert_path.as_deref(), config.tls.key_path.as_deref())
    {
        info!(addr = %addr, cert = cert_path, "bot gateway listening with TLS");

        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "failed to load TLS certs");
                process::exit(1);
            });

        if let Err(e) = axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await
        {
            error!(error = %e, "TLS server error");
        }
    } else {
        if config.jiralink.env != "dev" && config.jiralink.env != "local" {
            warn!("TLS is disabled in non-dev environment — traffic is unencrypted");
        }
        info!(addr = %addr, "bot gateway listening (plaintext)");

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to bind");
                process::exit(1);
            }
        };
        let shutdown = async move {
            jiralink_runtime::shutdown_signal().await;
            // Wake pending bridge waiters so in-flight turns finish fast.
            let _ = cancel_tx.send(true);
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "server error");
        }
    }

    info!("bot gateway stopped");
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

async fn security_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(
        "X-Content-Type-Options",
        header::HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "Cache-Control",
        header::HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    headers.insert("Pragma", header::HeaderValue::from_static("no-cache"));
    headers.insert(
        "Strict-Transport-Security",
        header::HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    resp
}

// ---------------------------------------------------------------------------
// POST /api/messages — inbound Teams activities
// ---------------------------------------------------------------------------

async fn messages_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    // Verify the outgoing-webhook signature if a shared secret is configured
    if let Some(ref secret) = state.config.teams.shared_secret {
        let auth = headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !activity::verify_signature(secret, &body, auth) {
            warn!("teams signature verification failed");
            return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
        }
    }

    let inbound: Activity = match serde_json::from_str(&body) {
        Ok(a) => a,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid activity: {e}")).into_response();
        }
    };

    match inbound.activity_type.as_str() {
        "message" => {
            let payload: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
            state
                .store
                .log_webhook("inbound", "teams.message", &payload, "received")
                .await;

            let reply = state.dispatcher.handle_turn(&state, &inbound).await;
            (StatusCode::OK, Json(reply)).into_response()
        }
        "conversationUpdate" => {
            let reply = inbound.reply_text(&state.config.teams.welcome_text);
            (StatusCode::OK, Json(reply)).into_response()
        }
        other => {
            trace!(activity_type = other, "ignoring activity");
            StatusCode::OK.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// POST /admin/connections — register or replace a user's Jira connection.
// The OAuth/consent flow runs in the companion web app; it lands here.
// ---------------------------------------------------------------------------

async fn admin_put_connection_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(conn): Json<store::UserConnection>,
) -> Response {
    if let Err(status) = bridge_link::check_addon_key(&headers, &state.addon_api_key) {
        return (status, "invalid api key").into_response();
    }
    if conn.teams_user_id.is_empty() || conn.site_url.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "teams_user_id and site_url are required",
        )
            .into_response();
    }

    // Validate the credentials before persisting them.
    let validated_as = match state.jira.myself(&conn, state.cancel_rx.clone()).await {
        Ok(name) => name,
        Err(e) => {
            warn!(error = %e, user = %conn.teams_user_id, "connection validation failed");
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("connection check failed: {e}"),
            )
                .into_response();
        }
    };

    if let Err(e) = state.store.put_user_connection(&conn).await {
        error!(error = %e, "failed to store user connection");
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response();
    }
    state.conn_cache.invalidate(&conn.teams_user_id).await;
    info!(user = %conn.teams_user_id, validated_as = %validated_as, "connection stored");

    (StatusCode::OK, Json(json!({ "validated_as": validated_as }))).into_response()
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pg_ok = state.store.ping().await;
    let status = if pg_ok { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "postgres": pg_ok,
        "addon_connections": state.connections.connected_count().await,
        "pending_bridge_requests": state.correlation.pending().await,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
