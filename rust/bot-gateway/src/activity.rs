/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Bot Framework activity DTOs and webhook signature verification.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// `plain`, `markdown` or `xml`; `xml` marks HTML-sourced messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ChannelAccount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationAccount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAccount {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_group: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Activity {
    /// The activity text with Teams `<at>…</at>` mention tags removed and
    /// whitespace collapsed at the edges.
    pub fn clean_text(&self) -> String {
        let raw = self.text.as_deref().unwrap_or("");
        strip_mention_tags(raw).trim().to_string()
    }

    pub fn from_id(&self) -> &str {
        self.from.as_ref().map_or("", |a| a.id.as_str())
    }

    pub fn conversation_id(&self) -> &str {
        self.conversation.as_ref().map_or("", |c| c.id.as_str())
    }

    pub fn is_group(&self) -> bool {
        self.conversation
            .as_ref()
            .is_some_and(|c| c.is_group == Some(true))
    }

    /// True for messages that arrived as rendered HTML or carry a card
    /// payload rather than typed text.
    pub fn is_html_sourced(&self) -> bool {
        if self
            .text_format
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("xml") || f.eq_ignore_ascii_case("html"))
        {
            return true;
        }
        self.attachments.iter().any(|a| {
            a.content_type
                .as_deref()
                .is_some_and(|ct| ct == "text/html" || ct.starts_with("application/vnd.microsoft.card"))
        })
    }

    /// Build a text reply addressed back into this activity's conversation,
    /// with the from/recipient accounts swapped.
    pub fn reply_text(&self, text: impl Into<String>) -> Activity {
        Activity {
            activity_type: "message".to_string(),
            text: Some(text.into()),
            from: self.recipient.clone(),
            recipient: self.from.clone(),
            conversation: self.conversation.clone(),
            service_url: self.service_url.clone(),
            channel_id: self.channel_id.clone(),
            reply_to_id: self.id.clone(),
            ..Activity::default()
        }
    }

    /// Like [`reply_text`](Self::reply_text) but carrying a card attachment.
    pub fn reply_card(&self, text: impl Into<String>, card: serde_json::Value) -> Activity {
        let mut reply = self.reply_text(text);
        reply.attachments = vec![Attachment {
            content_type: Some("application/vnd.microsoft.card.hero".to_string()),
            content: Some(card),
            ..Attachment::default()
        }];
        reply
    }
}

fn strip_mention_tags(text: &str) -> String {
    // Mentions arrive as `<at>Bot Name</at> actual text`. Drop the tags and
    // the mention body; nested tags do not occur in Teams payloads.
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<at>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</at>") {
            Some(end) => rest = &rest[start + end + "</at>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Webhook signature verification
// ---------------------------------------------------------------------------

/// Verify a Teams outgoing-webhook signature.
/// Teams sends the signature in the `Authorization` header as `HMAC <base64>`,
/// computed over the raw body with the base64-decoded shared secret.
pub fn verify_signature(shared_secret: &str, body: &str, auth_header: &str) -> bool {
    let Some(sig_b64) = auth_header.strip_prefix("HMAC ") else {
        return false;
    };

    let Some(expected_sig) = base64_decode(sig_b64) else {
        return false;
    };

    let Some(key_bytes) = base64_decode(shared_secret) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(&key_bytes) else {
        return false;
    };
    mac.update(body.as_bytes());
    let computed = mac.finalize().into_bytes();
    constant_time_eq(&computed, &expected_sig)
}

fn base64_decode(input: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input).ok()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use base64::Engine;

    fn teams_message(text: &str) -> Activity {
        serde_json::from_value(serde_json::json!({
            "type": "message",
            "id": "act-1",
            "text": text,
            "from": { "id": "29:user", "name": "Dana" },
            "recipient": { "id": "28:bot", "name": "Jiralink" },
            "conversation": { "id": "a:conv", "isGroup": false },
            "serviceUrl": "https://smba.trafficmanager.net/emea/",
            "channelId": "msteams",
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_teams_payload_camel_case() {
        let activity = teams_message("help");
        assert_eq!(activity.activity_type, "message");
        assert_eq!(activity.from_id(), "29:user");
        assert_eq!(activity.conversation_id(), "a:conv");
        assert_eq!(activity.service_url.as_deref(), Some("https://smba.trafficmanager.net/emea/"));
        assert!(!activity.is_group());
    }

    #[test]
    fn test_clean_text_strips_mentions() {
        let activity = teams_message("<at>Jiralink</at> show PROJ-1");
        assert_eq!(activity.clean_text(), "show PROJ-1");

        let activity = teams_message("  plain text  ");
        assert_eq!(activity.clean_text(), "plain text");
    }

    #[test]
    fn test_reply_swaps_accounts_and_keeps_conversation() {
        let activity = teams_message("help");
        let reply = activity.reply_text("hi");
        assert_eq!(reply.activity_type, "message");
        assert_eq!(reply.text.as_deref(), Some("hi"));
        assert_eq!(reply.from.as_ref().unwrap().id, "28:bot");
        assert_eq!(reply.recipient.as_ref().unwrap().id, "29:user");
        assert_eq!(reply.conversation.as_ref().unwrap().id, "a:conv");
        assert_eq!(reply.reply_to_id.as_deref(), Some("act-1"));
    }

    #[test]
    fn test_html_sourced_detection() {
        let mut activity = teams_message("<b>PROJ-1</b>");
        assert!(!activity.is_html_sourced());
        activity.text_format = Some("xml".to_string());
        assert!(activity.is_html_sourced());

        let mut activity = teams_message("card");
        activity.attachments = vec![Attachment {
            content_type: Some("application/vnd.microsoft.card.adaptive".to_string()),
            ..Attachment::default()
        }];
        assert!(activity.is_html_sourced());
    }

    #[test]
    fn test_group_conversation_flag() {
        let mut activity = teams_message("create");
        activity.conversation = Some(ConversationAccount {
            id: "19:channel".to_string(),
            is_group: Some(true),
            conversation_type: Some("channel".to_string()),
        });
        assert!(activity.is_group());
    }

    fn sign(secret_b64: &str, body: &str) -> String {
        let key = base64::engine::general_purpose::STANDARD
            .decode(secret_b64)
            .unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(&key).unwrap();
        mac.update(body.as_bytes());
        let sig = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        format!("HMAC {sig}")
    }

    #[test]
    fn test_signature_round_trip() {
        let secret = base64::engine::general_purpose::STANDARD.encode(b"webhook-secret");
        let body = r#"{"type":"message","text":"help"}"#;
        let header = sign(&secret, body);
        assert!(verify_signature(&secret, body, &header));
    }

    #[test]
    fn test_signature_rejects_tampered_body() {
        let secret = base64::engine::general_purpose::STANDARD.encode(b"webhook-secret");
        let header = sign(&secret, r#"{"text":"help"}"#);
        assert!(!verify_signature(&secret, r#"{"text":"attack"}"#, &header));
    }

    #[test]
    fn test_signature_rejects_missing_prefix() {
        let secret = base64::engine::general_purpose::STANDARD.encode(b"webhook-secret");
        assert!(!verify_signature(&secret, "{}", "Bearer abc"));
        assert!(!verify_signature(&secret, "{}", ""));
    }

    #[test]
    fn test_signature_rejects_wrong_secret() {
        let secret = base64::engine::general_purpose::STANDARD.encode(b"webhook-secret");
        let other = base64::engine::general_purpose::STANDARD.encode(b"other-secret");
        let body = "{}";
        let header = sign(&other, body);
        assert!(!verify_signature(&secret, body, &header));
    }
}
