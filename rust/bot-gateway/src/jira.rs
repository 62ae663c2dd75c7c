/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Jira REST client. Cloud connections call the site directly with basic
//! auth; server connections serialize the same call through the add-on
//! bridge, because the site sits behind the customer's firewall. Either
//! way the response is reduced to `(status, body)` and mapped onto the
//! error taxonomy the dialogs act on.

use std::sync::Arc;
use std::time::Duration;

use jiralink_bridge::{BridgeError, RequestBridge};
use jiralink_runtime::CircuitBreaker;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::warn;

use crate::store::UserConnection;

#[derive(thiserror::Error, Debug)]
pub enum JiraError {
    /// Credentials missing or rejected — recoverable by reconnecting.
    #[error("not authorized against Jira")]
    Unauthorized,
    /// Jira refused the specific action; the message is surfaced verbatim.
    #[error("{0}")]
    Forbidden(String),
    #[error("issue {0} not found")]
    NotFound(String),
    /// Circuit breaker is open after repeated failures.
    #[error("Jira is temporarily unavailable ({0})")]
    Unavailable(String),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("Jira API error: {0}")]
    Api(String),
}

/// The issue fields the bot renders.
#[derive(Clone, Debug)]
pub struct Issue {
    pub key: String,
    pub summary: String,
    pub status: String,
    pub assignee: Option<String>,
    pub url: String,
}

pub struct JiraClient {
    http: reqwest::Client,
    breaker: CircuitBreaker,
    bridge: Arc<RequestBridge>,
}

impl JiraClient {
    /// # Errors
    ///
    /// Returns `reqwest::Error` if the HTTP client cannot be built.
    pub fn new(
        request_timeout: Duration,
        breaker_threshold: u32,
        breaker_recovery_secs: u64,
        bridge: Arc<RequestBridge>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(request_timeout).build()?,
            breaker: CircuitBreaker::new("jira", breaker_threshold, breaker_recovery_secs),
            bridge,
        })
    }

    pub async fn get_issue(
        &self,
        conn: &UserConnection,
        key: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<Issue, JiraError> {
        let path = format!("/rest/api/2/issue/{key}?fields=summary,status,assignee");
        let (status, body) = self.request(conn, "GET", &path, None, cancel).await?;
        match status {
            200 => Ok(parse_issue(&conn.site_url, key, &body)),
            404 => Err(JiraError::NotFound(key.to_string())),
            other => Err(self.api_error(other, &body)),
        }
    }

    pub async fn create_issue(
        &self,
        conn: &UserConnection,
        project_key: &str,
        summary: &str,
        description: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<String, JiraError> {
        let body = json!({
            "fields": {
                "project": { "key": project_key },
                "summary": summary,
                "description": description,
                "issuetype": { "name": "Task" },
            }
        });
        let (status, body) = self
            .request(conn, "POST", "/rest/api/2/issue", Some(body), cancel)
            .await?;
        match status {
            200 | 201 => body
                .get("key")
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| JiraError::Api("create response carried no issue key".to_string())),
            other => Err(self.api_error(other, &body)),
        }
    }

    pub async fn add_comment(
        &self,
        conn: &UserConnection,
        key: &str,
        comment: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), JiraError> {
        let path = format!("/rest/api/2/issue/{key}/comment");
        let body = json!({ "body": comment });
        let (status, resp) = self.request(conn, "POST", &path, Some(body), cancel).await?;
        match status {
            200 | 201 => Ok(()),
            404 => Err(JiraError::NotFound(key.to_string())),
            other => Err(self.api_error(other, &resp)),
        }
    }

    pub async fn assign_issue(
        &self,
        conn: &UserConnection,
        key: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), JiraError> {
        let path = format!("/rest/api/2/issue/{key}/assignee");
        // Cloud addresses users by account id, server by name.
        let body = if conn.is_server() {
            json!({ "name": conn.jira_account_id })
        } else {
            json!({ "accountId": conn.jira_account_id })
        };
        let (status, resp) = self.request(conn, "PUT", &path, Some(body), cancel).await?;
        match status {
            200 | 204 => Ok(()),
            404 => Err(JiraError::NotFound(key.to_string())),
            other => Err(self.api_error(other, &resp)),
        }
    }

    /// Validate that the stored connection still works.
    pub async fn myself(
        &self,
        conn: &UserConnection,
        cancel: watch::Receiver<bool>,
    ) -> Result<String, JiraError> {
        let (status, body) = self
            .request(conn, "GET", "/rest/api/2/myself", None, cancel)
            .await?;
        match status {
            200 => Ok(body
                .get("displayName")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()),
            other => Err(self.api_error(other, &body)),
        }
    }

    // -- shared plumbing ----------------------------------------------------

    async fn request(
        &self,
        conn: &UserConnection,
        method: &str,
        path: &str,
        body: Option<Value>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(u16, Value), JiraError> {
        self.breaker.check().map_err(JiraError::Unavailable)?;

        let result = if conn.is_server() {
            self.request_via_bridge(conn, method, path, body, cancel)
                .await
        } else {
            self.request_direct(conn, method, path, body).await
        };

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) => {
                warn!(error = %e, method, path, "jira request failed");
                self.breaker.record_failure();
            }
        }

        let (status, value) = result?;
        match status {
            401 => Err(JiraError::Unauthorized),
            403 => Err(JiraError::Forbidden(error_message(&value))),
            _ => Ok((status, value)),
        }
    }

    async fn request_direct(
        &self,
        conn: &UserConnection,
        method: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<(u16, Value), JiraError> {
        let url = format!("{}{path}", conn.site_url.trim_end_matches('/'));
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| JiraError::Api(format!("bad method {method}")))?;

        let mut request = self.http.request(method, &url).basic_auth(
            conn.email.as_deref().unwrap_or_default(),
            conn.api_token.as_deref(),
        );
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| JiraError::Api(format!("request failed: {e}")))?;
        let status = response.status().as_u16();
        let value = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, value))
    }

    async fn request_via_bridge(
        &self,
        conn: &UserConnection,
        method: &str,
        path: &str,
        body: Option<Value>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(u16, Value), JiraError> {
        let Some(server_id) = conn.server_id.as_deref() else {
            return Err(JiraError::Api(
                "server connection record carries no server id".to_string(),
            ));
        };

        let payload = json!({
            "method": method,
            "path": path,
            "body": body,
        })
        .to_string();

        let raw = self
            .bridge
            .send_request_and_wait(server_id, payload, cancel)
            .await?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| JiraError::Api(format!("malformed add-on response: {e}")))?;

        let status = value
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .ok_or_else(|| JiraError::Api("add-on response carried no status".to_string()))?;
        let body = value.get("body").cloned().unwrap_or(Value::Null);
        Ok((status, body))
    }

    fn api_error(&self, status: u16, body: &Value) -> JiraError {
        JiraError::Api(format!("status {status}: {}", error_message(body)))
    }
}

/// Jira error bodies carry either `errorMessages: [..]` or `errors: {..}`.
fn error_message(body: &Value) -> String {
    if let Some(messages) = body.get("errorMessages").and_then(Value::as_array) {
        let joined: Vec<&str> = messages.iter().filter_map(Value::as_str).collect();
        if !joined.is_empty() {
            return joined.join("; ");
        }
    }
    if let Some(errors) = body.get("errors").and_then(Value::as_object) {
        if !errors.is_empty() {
            let joined: Vec<String> = errors
                .iter()
                .map(|(field, msg)| format!("{field}: {}", msg.as_str().unwrap_or_default()))
                .collect();
            return joined.join("; ");
        }
    }
    "no detail provided".to_string()
}

fn parse_issue(site_url: &str, key: &str, body: &Value) -> Issue {
    let fields = body.get("fields").cloned().unwrap_or(Value::Null);
    let key = body
        .get("key")
        .and_then(Value::as_str)
        .unwrap_or(key)
        .to_string();
    Issue {
        url: format!("{}/browse/{key}", site_url.trim_end_matches('/')),
        key,
        summary: fields
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("(no summary)")
            .to_string(),
        status: fields
            .get("status")
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
        assignee: fields
            .get("assignee")
            .and_then(|a| a.get("displayName"))
            .and_then(Value::as_str)
            .map(ToString::to_string),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
