/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Outbound email via the SendGrid v3 API. Used for the feedback dialog;
//! pure passthrough to the vendor endpoint.

use serde_json::{json, Value};
use tracing::info;

const SENDGRID_SEND_URL: &str = "https://api.sendgrid.com/v3/mail/send";

#[derive(thiserror::Error, Debug)]
pub enum MailError {
    #[error("mail request failed: {0}")]
    Request(String),
    #[error("sendgrid returned status {0}")]
    Status(u16),
}

pub struct MailSender {
    http: reqwest::Client,
    api_key: String,
    from_address: String,
    support_inbox: String,
}

impl MailSender {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        api_key: String,
        from_address: String,
        support_inbox: String,
    ) -> Self {
        Self {
            http,
            api_key,
            from_address,
            support_inbox,
        }
    }

    /// Send a user's feedback note to the support inbox.
    ///
    /// # Errors
    ///
    /// Returns [`MailError`] when the request cannot be sent or SendGrid
    /// rejects it.
    pub async fn send_feedback(&self, from_user: &str, message: &str) -> Result<(), MailError> {
        let payload = feedback_payload(
            &self.from_address,
            &self.support_inbox,
            from_user,
            message,
        );

        let response = self
            .http
            .post(SENDGRID_SEND_URL)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MailError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MailError::Status(status.as_u16()));
        }
        info!(user = from_user, "feedback mail sent");
        Ok(())
    }
}

fn feedback_payload(from_address: &str, support_inbox: &str, user: &str, message: &str) -> Value {
    json!({
        "personalizations": [{
            "to": [{ "email": support_inbox }],
        }],
        "from": { "email": from_address },
        "subject": format!("Jiralink feedback from {user}"),
        "content": [{
            "type": "text/plain",
            "value": message,
        }],
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_payload_shape() {
        let payload = feedback_payload(
            "bot@jiralink.example",
            "support@jiralink.example",
            "Dana",
            "the bot rocks",
        );
        assert_eq!(
            payload["personalizations"][0]["to"][0]["email"],
            "support@jiralink.example"
        );
        assert_eq!(payload["from"]["email"], "bot@jiralink.example");
        assert_eq!(payload["subject"], "Jiralink feedback from Dana");
        assert_eq!(payload["content"][0]["type"], "text/plain");
        assert_eq!(payload["content"][0]["value"], "the bot rocks");
    }
}
