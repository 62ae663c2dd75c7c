/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Microsoft Graph activity-feed notifications. Client-credentials token
//! fetch with an in-memory expiry cache, then a passthrough POST to the
//! sendActivityNotification endpoint.

use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::info;

const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Refresh this long before the token's reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(120);

#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error("graph request failed: {0}")]
    Request(String),
    #[error("token endpoint returned status {0}")]
    TokenStatus(u16),
    #[error("graph returned status {0}")]
    Status(u16),
}

pub struct GraphNotifier {
    http: reqwest::Client,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<(String, Instant)>>,
}

impl GraphNotifier {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        tenant_id: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            http,
            tenant_id,
            client_id,
            client_secret,
            token: RwLock::new(None),
        }
    }

    /// Notify a user in their Teams activity feed.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] when the token fetch or the notification call
    /// fails.
    pub async fn notify_user(&self, user_id: &str, message: &str) -> Result<(), GraphError> {
        let token = self.access_token().await?;
        let url = format!("{GRAPH_BASE_URL}/users/{user_id}/teamwork/sendActivityNotification");
        let payload = notification_payload(message);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GraphError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GraphError::Status(status.as_u16()));
        }
        info!(user_id, "activity notification sent");
        Ok(())
    }

    async fn access_token(&self) -> Result<String, GraphError> {
        {
            let token = self.token.read().await;
            if let Some((value, expires_at)) = token.as_ref() {
                if *expires_at > Instant::now() {
                    return Ok(value.clone());
                }
            }
        }

        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.tenant_id
        );
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
            ])
            .send()
            .await
            .map_err(|e| GraphError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GraphError::TokenStatus(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GraphError::Request(e.to_string()))?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| GraphError::Request("token response carried no access_token".to_string()))?
            .to_string();
        let expires_in = body
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(3600);

        let expires_at = Instant::now()
            + Duration::from_secs(expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        let mut token = self.token.write().await;
        *token = Some((access_token.clone(), expires_at));
        Ok(access_token)
    }
}

fn notification_payload(message: &str) -> Value {
    json!({
        "topic": {
            "source": "text",
            "value": "Jiralink",
            "webUrl": "https://teams.microsoft.com",
        },
        "activityType": "issueUpdate",
        "previewText": { "content": message },
        "templateParameters": [
            { "name": "message", "value": message },
        ],
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_payload_shape() {
        let payload = notification_payload("DEMO-1 moved to Done");
        assert_eq!(payload["topic"]["source"], "text");
        assert_eq!(payload["activityType"], "issueUpdate");
        assert_eq!(payload["previewText"]["content"], "DEMO-1 moved to Done");
        assert_eq!(
            payload["templateParameters"][0]["value"],
            "DEMO-1 moved to Done"
        );
    }

    #[tokio::test]
    async fn test_token_cache_returns_fresh_entry() {
        let notifier = GraphNotifier::new(
            reqwest::Client::new(),
            "tenant".to_string(),
            "client".to_string(),
            "secret".to_string(),
        );
        {
            let mut token = notifier.token.write().await;
            *token = Some((
                "cached-token".to_string(),
                Instant::now() + Duration::from_secs(600),
            ));
        }
        let token = notifier.access_token().await.unwrap();
        assert_eq!(token, "cached-token");
    }
}
