/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Postgres persistence: user↔Jira connections, per-conversation dialog
//! state, and the webhook audit log. Plain CRUD passthrough — schema
//! design stays with the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;

/// A Teams user's established Jira connection. Presence of a row is the
/// "user is connected" predicate used by auth gating.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UserConnection {
    pub teams_user_id: String,
    pub jira_account_id: String,
    pub site_url: String,
    /// `cloud` or `server`; server connections go through the add-on bridge.
    pub deployment: String,
    /// Stable add-on peer id, set for server deployments only.
    pub server_id: Option<String>,
    pub email: Option<String>,
    pub api_token: Option<String>,
    pub default_project: Option<String>,
}

impl UserConnection {
    pub fn is_server(&self) -> bool {
        self.deployment == "server"
    }
}

/// Active dialog of one conversation, reloaded on the next turn.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DialogStateRecord {
    pub dialog: String,
    pub state: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Store {
    pg: PgPool,
}

impl Store {
    pub fn new(pg: PgPool) -> Self {
        Self { pg }
    }

    /// Create the tables this service owns if they are missing. Runs at
    /// startup before the listener binds.
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_connections (
                teams_user_id TEXT PRIMARY KEY,
                jira_account_id TEXT NOT NULL,
                site_url TEXT NOT NULL,
                deployment TEXT NOT NULL,
                server_id TEXT,
                email TEXT,
                api_token TEXT,
                default_project TEXT,
                connected_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pg)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_state (
                conversation_id TEXT PRIMARY KEY,
                dialog TEXT NOT NULL,
                state JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pg)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS webhook_log (
                id BIGSERIAL PRIMARY KEY,
                direction TEXT NOT NULL,
                event TEXT NOT NULL,
                payload JSONB,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pg)
        .await?;

        Ok(())
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pg).await.is_ok()
    }

    // -- user connections ---------------------------------------------------

    pub async fn get_user_connection(
        &self,
        teams_user_id: &str,
    ) -> Result<Option<UserConnection>, sqlx::Error> {
        let row = sqlx::query_as::<
            _,
            (
                String,
                String,
                String,
                String,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
            ),
        >(
            "SELECT teams_user_id, jira_account_id, site_url, deployment,
                    server_id, email, api_token, default_project
             FROM user_connections WHERE teams_user_id = $1",
        )
        .bind(teams_user_id)
        .fetch_optional(&self.pg)
        .await?;

        Ok(row.map(
            |(teams_user_id, jira_account_id, site_url, deployment, server_id, email, api_token, default_project)| {
                UserConnection {
                    teams_user_id,
                    jira_account_id,
                    site_url,
                    deployment,
                    server_id,
                    email,
                    api_token,
                    default_project,
                }
            },
        ))
    }

    pub async fn put_user_connection(&self, conn: &UserConnection) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO user_connections
                (teams_user_id, jira_account_id, site_url, deployment,
                 server_id, email, api_token, default_project)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (teams_user_id) DO UPDATE SET
                jira_account_id = EXCLUDED.jira_account_id,
                site_url = EXCLUDED.site_url,
                deployment = EXCLUDED.deployment,
                server_id = EXCLUDED.server_id,
                email = EXCLUDED.email,
                api_token = EXCLUDED.api_token,
                default_project = EXCLUDED.default_project,
                connected_at = now()",
        )
        .bind(&conn.teams_user_id)
        .bind(&conn.jira_account_id)
        .bind(&conn.site_url)
        .bind(&conn.deployment)
        .bind(&conn.server_id)
        .bind(&conn.email)
        .bind(&conn.api_token)
        .bind(&conn.default_project)
        .execute(&self.pg)
        .await?;
        Ok(())
    }

    pub async fn delete_user_connection(&self, teams_user_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM user_connections WHERE teams_user_id = $1")
            .bind(teams_user_id)
            .execute(&self.pg)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- conversation dialog state ------------------------------------------

    pub async fn get_dialog_state(
        &self,
        conversation_id: &str,
    ) -> Result<Option<DialogStateRecord>, sqlx::Error> {
        let row = sqlx::query_as::<_, (String, serde_json::Value, DateTime<Utc>)>(
            "SELECT dialog, state, updated_at
             FROM conversation_state WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pg)
        .await?;

        Ok(row.map(|(dialog, state, updated_at)| DialogStateRecord {
            dialog,
            state,
            updated_at,
        }))
    }

    pub async fn put_dialog_state(
        &self,
        conversation_id: &str,
        dialog: &str,
        state: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO conversation_state (conversation_id, dialog, state, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (conversation_id) DO UPDATE SET
                dialog = EXCLUDED.dialog,
                state = EXCLUDED.state,
                updated_at = now()",
        )
        .bind(conversation_id)
        .bind(dialog)
        .bind(state)
        .execute(&self.pg)
        .await?;
        Ok(())
    }

    pub async fn clear_dialog_state(&self, conversation_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM conversation_state WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&self.pg)
            .await?;
        Ok(())
    }

    // -- webhook audit log --------------------------------------------------

    /// Best-effort: a failed audit write is logged, never surfaced.
    pub async fn log_webhook(
        &self,
        direction: &str,
        event: &str,
        payload: &serde_json::Value,
        status: &str,
    ) {
        let result = sqlx::query(
            "INSERT INTO webhook_log (direction, event, payload, status)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(direction)
        .bind(event)
        .bind(payload)
        .bind(status)
        .execute(&self.pg)
        .await;

        if let Err(e) = result {
            warn!(error = %e, event, "webhook audit write failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_connection_deployment_flag() {
        let conn = UserConnection {
            teams_user_id: "29:user".to_string(),
            jira_account_id: "acc-1".to_string(),
            site_url: "https://jira.internal.example.com".to_string(),
            deployment: "server".to_string(),
            server_id: Some("srv-1".to_string()),
            email: None,
            api_token: None,
            default_project: None,
        };
        assert!(conn.is_server());
    }

    #[test]
    fn test_user_connection_serde_round_trip() {
        let conn = UserConnection {
            teams_user_id: "29:user".to_string(),
            jira_account_id: "acc-1".to_string(),
            site_url: "https://example.atlassian.net".to_string(),
            deployment: "cloud".to_string(),
            server_id: None,
            email: Some("dana@example.com".to_string()),
            api_token: Some("token".to_string()),
            default_project: Some("DEMO".to_string()),
        };
        let raw = serde_json::to_string(&conn).unwrap();
        let back: UserConnection = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.teams_user_id, conn.teams_user_id);
        assert_eq!(back.default_project.as_deref(), Some("DEMO"));
        assert!(!back.is_server());
    }
}
