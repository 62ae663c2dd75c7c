/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! The conversational flows behind each route, registered in a static
//! table keyed by [`DialogKind`]. A dialog either completes in one turn or
//! returns `Waiting` with serialized step state that the dispatcher stores
//! and replays into `resume` on the next turn. Outcomes replace exception
//! control flow: auth and permission conditions travel as values.

use std::collections::HashMap;
use std::sync::Arc;

use jiralink_routing::DialogKind;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::activity::Activity;
use crate::jira::JiraError;
use crate::store::UserConnection;
use crate::{AppState, GatewayError};

/// Shape of an issue key, shared with the issue-by-key route pattern.
pub const ISSUE_KEY_PATTERN: &str = r"\b[A-Za-z][A-Za-z0-9]+-\d+\b";

// ---------------------------------------------------------------------------
// Turn context and outcomes
// ---------------------------------------------------------------------------

/// Everything a dialog may touch during one turn.
pub struct TurnContext<'a> {
    pub state: &'a AppState,
    pub activity: &'a Activity,
    /// Activity text with mention tags stripped.
    pub text: &'a str,
    pub user_id: &'a str,
    pub conversation_id: &'a str,
    /// The user's Jira connection, when established.
    pub connection: Option<&'a UserConnection>,
    /// Cancellation signal honored at the bridge race point.
    pub cancel: watch::Receiver<bool>,
}

/// What a dialog invocation produced, inspected by the dispatcher.
#[derive(Debug)]
pub enum DialogOutcome {
    /// Done; send this text and end the dialog.
    Complete(String),
    /// Mid-flow; send the prompt and replay `state` into `resume` next turn.
    Waiting { prompt: String, state: Value },
    /// The user must connect to Jira first.
    NeedsAuth,
    /// Jira refused the action; the message goes to the user verbatim.
    Forbidden(String),
    /// Unexpected failure; the dispatcher logs it and apologizes.
    Failed(String),
}

/// Map a Jira client failure onto the outcome the dispatcher acts on.
/// Timeout and configuration conditions come back as plain answers — they
/// are actionable by the user, not bugs.
pub fn jira_failure(err: JiraError) -> DialogOutcome {
    use jiralink_bridge::BridgeError;
    match err {
        JiraError::Unauthorized => DialogOutcome::NeedsAuth,
        JiraError::Forbidden(msg) => DialogOutcome::Forbidden(msg),
        JiraError::NotFound(key) => DialogOutcome::Complete(format!(
            "I couldn't find {key}. Check the key and your permissions."
        )),
        JiraError::Unavailable(name) => DialogOutcome::Complete(format!(
            "Jira looks unavailable right now ({name} circuit is open). Give it a moment and try again."
        )),
        JiraError::Bridge(BridgeError::PeerNotConnected(server)) => DialogOutcome::Complete(format!(
            "Your Jira server ({server}) has no live add-on connection. Check that the Jiralink add-on is installed and running."
        )),
        JiraError::Bridge(BridgeError::NotResponding { peer_id, .. }) => DialogOutcome::Complete(
            format!("Your Jira server ({peer_id}) is not responding. Please try again shortly."),
        ),
        other => DialogOutcome::Failed(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Dialog trait and registry
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait Dialog: Send + Sync {
    fn kind(&self) -> DialogKind;

    /// Start the dialog for a fresh turn. `options` is the winning route's
    /// payload (route options, or the conflicting pair for disambiguation).
    async fn begin(&self, ctx: &TurnContext<'_>, options: &Value) -> DialogOutcome;

    /// Continue a multi-step dialog from stored step state. Single-turn
    /// dialogs never store state, so reaching this is a bug worth surfacing.
    async fn resume(&self, ctx: &TurnContext<'_>, step_state: Value) -> DialogOutcome {
        let _ = (ctx, step_state);
        DialogOutcome::Failed(format!("dialog {} does not expect continuation", self.kind()))
    }
}

/// Build the static registration table. Every [`DialogKind`] gets exactly
/// one entry here; the router's constructor fails if a route names a kind
/// this table does not carry.
pub fn build_registry() -> Result<HashMap<DialogKind, Arc<dyn Dialog>>, GatewayError> {
    let key_re = Regex::new(ISSUE_KEY_PATTERN)
        .map_err(|e| GatewayError::Config(format!("issue key pattern: {e}")))?;

    let mut registry: HashMap<DialogKind, Arc<dyn Dialog>> = HashMap::new();
    registry.insert(DialogKind::AmbiguousAction, Arc::new(AmbiguousActionDialog));
    registry.insert(DialogKind::Cancel, Arc::new(CancelDialog));
    registry.insert(DialogKind::Connect, Arc::new(ConnectDialog));
    registry.insert(DialogKind::Disconnect, Arc::new(DisconnectDialog));
    registry.insert(DialogKind::Help, Arc::new(HelpDialog));
    registry.insert(
        DialogKind::IssueByKey,
        Arc::new(IssueByKeyDialog {
            key_re: key_re.clone(),
        }),
    );
    registry.insert(DialogKind::CreateIssue, Arc::new(CreateIssueDialog));
    registry.insert(
        DialogKind::CommentIssue,
        Arc::new(CommentIssueDialog {
            key_re: key_re.clone(),
        }),
    );
    registry.insert(DialogKind::AssignIssue, Arc::new(AssignIssueDialog { key_re }));
    registry.insert(DialogKind::Feedback, Arc::new(FeedbackDialog));
    Ok(registry)
}

// ---------------------------------------------------------------------------
// Built-in dialogs
// ---------------------------------------------------------------------------

/// Entered only through an ambiguous pattern-route match; lists the two
/// conflicting interpretations back to the user.
struct AmbiguousActionDialog;

#[async_trait::async_trait]
impl Dialog for AmbiguousActionDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::AmbiguousAction
    }

    async fn begin(&self, _ctx: &TurnContext<'_>, options: &Value) -> DialogOutcome {
        let first = options.get("first").and_then(Value::as_str).unwrap_or("?");
        let second = options.get("second").and_then(Value::as_str).unwrap_or("?");
        DialogOutcome::Complete(format!(
            "I wasn't sure what you meant — that could be \"{}\" or \"{}\". Could you rephrase?",
            describe_dialog(first),
            describe_dialog(second),
        ))
    }
}

struct CancelDialog;

#[async_trait::async_trait]
impl Dialog for CancelDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::Cancel
    }

    async fn begin(&self, ctx: &TurnContext<'_>, _options: &Value) -> DialogOutcome {
        if let Err(e) = ctx.state.store.clear_dialog_state(ctx.conversation_id).await {
            tracing::warn!(error = %e, "failed to clear dialog state on cancel");
        }
        DialogOutcome::Complete("Okay — cancelled. What would you like to do next?".to_string())
    }
}

struct ConnectDialog;

#[async_trait::async_trait]
impl Dialog for ConnectDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::Connect
    }

    async fn begin(&self, ctx: &TurnContext<'_>, _options: &Value) -> DialogOutcome {
        match ctx.connection {
            Some(conn) => DialogOutcome::Complete(format!(
                "You're already connected to {}.",
                conn.site_url
            )),
            // The dispatcher renders the connect card for NeedsAuth.
            None => DialogOutcome::NeedsAuth,
        }
    }
}

struct DisconnectDialog;

#[async_trait::async_trait]
impl Dialog for DisconnectDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::Disconnect
    }

    async fn begin(&self, ctx: &TurnContext<'_>, _options: &Value) -> DialogOutcome {
        match ctx.state.store.delete_user_connection(ctx.user_id).await {
            Ok(true) => {
                ctx.state.conn_cache.invalidate(ctx.user_id).await;
                DialogOutcome::Complete(
                    "Done — your Jira connection is removed. Say 'connect' to link it again."
                        .to_string(),
                )
            }
            Ok(false) => DialogOutcome::Complete("You aren't connected to Jira.".to_string()),
            Err(e) => DialogOutcome::Failed(format!("disconnect failed: {e}")),
        }
    }
}

struct HelpDialog;

#[async_trait::async_trait]
impl Dialog for HelpDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::Help
    }

    async fn begin(&self, _ctx: &TurnContext<'_>, _options: &Value) -> DialogOutcome {
        DialogOutcome::Complete(
            "Here's what I understand:\n\
             - paste an issue key or link (e.g. DEMO-12) and I'll show it\n\
             - 'create issue' — create a new issue (personal chat only)\n\
             - 'comment DEMO-12 your text' — add a comment\n\
             - 'assign DEMO-12' — assign the issue to yourself\n\
             - 'connect' / 'disconnect' — manage your Jira connection\n\
             - 'feedback' — send a note to the team\n\
             - 'cancel' — abort whatever we're doing"
                .to_string(),
        )
    }
}

// ---------------------------------------------------------------------------
// Issue dialogs
// ---------------------------------------------------------------------------

struct IssueByKeyDialog {
    key_re: Regex,
}

#[async_trait::async_trait]
impl Dialog for IssueByKeyDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::IssueByKey
    }

    async fn begin(&self, ctx: &TurnContext<'_>, options: &Value) -> DialogOutcome {
        let Some(conn) = ctx.connection else {
            return DialogOutcome::NeedsAuth;
        };
        // URL- and card-sourced turns carry the raw text in options.
        let haystack = options
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or(ctx.text);
        let Some(key) = self.key_re.find(haystack).map(|m| m.as_str().to_uppercase()) else {
            return DialogOutcome::Complete(
                "I didn't spot an issue key in that. Try something like DEMO-12.".to_string(),
            );
        };

        match ctx
            .state
            .jira
            .get_issue(conn, &key, ctx.cancel.clone())
            .await
        {
            Ok(issue) => {
                let assignee = issue.assignee.as_deref().unwrap_or("unassigned");
                DialogOutcome::Complete(format!(
                    "{} — {}\nStatus: {} · Assignee: {}\n{}",
                    issue.key, issue.summary, issue.status, assignee, issue.url
                ))
            }
            Err(e) => jira_failure(e),
        }
    }
}

/// Multi-step creation flow: summary → description → confirm.
struct CreateIssueDialog;

impl CreateIssueDialog {
    fn confirm_prompt(summary: &str) -> String {
        format!("Create issue \"{summary}\"? (yes/no)")
    }
}

#[async_trait::async_trait]
impl Dialog for CreateIssueDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::CreateIssue
    }

    async fn begin(&self, _ctx: &TurnContext<'_>, _options: &Value) -> DialogOutcome {
        DialogOutcome::Waiting {
            prompt: "What should the issue summary be?".to_string(),
            state: json!({ "step": "summary" }),
        }
    }

    async fn resume(&self, ctx: &TurnContext<'_>, step_state: Value) -> DialogOutcome {
        let step = step_state.get("step").and_then(Value::as_str).unwrap_or("");
        match step {
            "summary" => {
                if ctx.text.is_empty() {
                    return DialogOutcome::Waiting {
                        prompt: "I need a short summary to create the issue — what should it say?"
                            .to_string(),
                        state: step_state,
                    };
                }
                DialogOutcome::Waiting {
                    prompt: "Add a description, or say 'skip'.".to_string(),
                    state: json!({ "step": "description", "summary": ctx.text }),
                }
            }
            "description" => {
                let summary = step_state
                    .get("summary")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let description = if ctx.text.eq_ignore_ascii_case("skip") {
                    String::new()
                } else {
                    ctx.text.to_string()
                };
                DialogOutcome::Waiting {
                    prompt: Self::confirm_prompt(&summary),
                    state: json!({
                        "step": "confirm",
                        "summary": summary,
                        "description": description,
                    }),
                }
            }
            "confirm" => {
                let answer = ctx.text.to_lowercase();
                if answer == "no" || answer == "n" {
                    return DialogOutcome::Complete("Okay, I won't create it.".to_string());
                }
                if answer != "yes" && answer != "y" {
                    let summary = step_state
                        .get("summary")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    return DialogOutcome::Waiting {
                        prompt: Self::confirm_prompt(summary),
                        state: step_state,
                    };
                }

                let Some(conn) = ctx.connection else {
                    return DialogOutcome::NeedsAuth;
                };
                let Some(project) = conn.default_project.as_deref() else {
                    return DialogOutcome::Complete(
                        "Your connection has no default project configured — reconnect and pick one."
                            .to_string(),
                    );
                };
                let summary = step_state
                    .get("summary")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let description = step_state
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("");

                match ctx
                    .state
                    .jira
                    .create_issue(conn, project, summary, description, ctx.cancel.clone())
                    .await
                {
                    Ok(key) => {
                        // Activity-feed nudge is best-effort and must not
                        // hold the turn open.
                        if let Some(graph) = ctx.state.graph.as_ref().map(Arc::clone) {
                            let user_id = ctx.user_id.to_string();
                            let message = format!("{key} was created for you");
                            tokio::spawn(async move {
                                if let Err(e) = graph.notify_user(&user_id, &message).await {
                                    tracing::warn!(error = %e, "activity notification failed");
                                }
                            });
                        }
                        DialogOutcome::Complete(format!(
                            "Created {key}: {}/browse/{key}",
                            conn.site_url.trim_end_matches('/')
                        ))
                    }
                    Err(e) => jira_failure(e),
                }
            }
            other => DialogOutcome::Failed(format!("unknown create-issue step {other:?}")),
        }
    }
}

struct CommentIssueDialog {
    key_re: Regex,
}

#[async_trait::async_trait]
impl Dialog for CommentIssueDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::CommentIssue
    }

    async fn begin(&self, ctx: &TurnContext<'_>, _options: &Value) -> DialogOutcome {
        let Some(conn) = ctx.connection else {
            return DialogOutcome::NeedsAuth;
        };
        let Some((key, comment)) = split_key_and_body(&self.key_re, ctx.text) else {
            return DialogOutcome::Complete(
                "Tell me the issue and the comment in one line, e.g. 'comment DEMO-12 Looks good to me'."
                    .to_string(),
            );
        };

        match ctx
            .state
            .jira
            .add_comment(conn, &key, &comment, ctx.cancel.clone())
            .await
        {
            Ok(()) => DialogOutcome::Complete(format!("Comment added to {key}.")),
            Err(e) => jira_failure(e),
        }
    }
}

struct AssignIssueDialog {
    key_re: Regex,
}

#[async_trait::async_trait]
impl Dialog for AssignIssueDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::AssignIssue
    }

    async fn begin(&self, ctx: &TurnContext<'_>, _options: &Value) -> DialogOutcome {
        let Some(conn) = ctx.connection else {
            return DialogOutcome::NeedsAuth;
        };
        let Some(key) = self
            .key_re
            .find(ctx.text)
            .map(|m| m.as_str().to_uppercase())
        else {
            return DialogOutcome::Complete(
                "Which issue? Say e.g. 'assign DEMO-12' and I'll assign it to you.".to_string(),
            );
        };

        match ctx
            .state
            .jira
            .assign_issue(conn, &key, ctx.cancel.clone())
            .await
        {
            Ok(()) => DialogOutcome::Complete(format!("{key} is now assigned to you.")),
            Err(e) => jira_failure(e),
        }
    }
}

/// Two-step flow that mails the user's note to the support inbox.
struct FeedbackDialog;

#[async_trait::async_trait]
impl Dialog for FeedbackDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::Feedback
    }

    async fn begin(&self, _ctx: &TurnContext<'_>, _options: &Value) -> DialogOutcome {
        DialogOutcome::Waiting {
            prompt: "What would you like to tell the team?".to_string(),
            state: json!({ "step": "message" }),
        }
    }

    async fn resume(&self, ctx: &TurnContext<'_>, _step_state: Value) -> DialogOutcome {
        if ctx.text.is_empty() {
            return DialogOutcome::Complete("Nothing sent.".to_string());
        }
        let Some(mail) = ctx.state.mail.as_ref() else {
            return DialogOutcome::Complete(
                "Feedback isn't configured on this deployment, sorry.".to_string(),
            );
        };
        let from = ctx
            .activity
            .from
            .as_ref()
            .and_then(|a| a.name.as_deref())
            .unwrap_or(ctx.user_id);
        match mail.send_feedback(from, ctx.text).await {
            Ok(()) => DialogOutcome::Complete("Thanks — your feedback is on its way.".to_string()),
            Err(e) => DialogOutcome::Failed(format!("feedback mail failed: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract the first issue key and whatever text follows it.
fn split_key_and_body(key_re: &Regex, text: &str) -> Option<(String, String)> {
    let found = key_re.find(text)?;
    let key = found.as_str().to_uppercase();
    let body = text[found.end()..].trim().to_string();
    if body.is_empty() {
        return None;
    }
    Some((key, body))
}

/// Human description for a dialog name, used by the disambiguation prompt.
fn describe_dialog(name: &str) -> &str {
    match DialogKind::from_name(name) {
        Some(DialogKind::IssueByKey) => "show an issue",
        Some(DialogKind::CreateIssue) => "create an issue",
        Some(DialogKind::CommentIssue) => "comment on an issue",
        Some(DialogKind::AssignIssue) => "assign an issue",
        Some(DialogKind::Connect) => "connect to Jira",
        Some(DialogKind::Disconnect) => "disconnect from Jira",
        Some(DialogKind::Help) => "show help",
        Some(DialogKind::Feedback) => "send feedback",
        Some(DialogKind::Cancel) => "cancel",
        Some(DialogKind::AmbiguousAction) | None => name,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use jiralink_bridge::BridgeError;

    #[test]
    fn test_registry_covers_every_dialog_kind() {
        let registry = build_registry().unwrap();
        for kind in DialogKind::ALL {
            let dialog = registry.get(&kind).unwrap_or_else(|| {
                panic!("no dialog registered for {kind}");
            });
            assert_eq!(dialog.kind(), kind);
        }
    }

    #[test]
    fn test_split_key_and_body() {
        let re = Regex::new(ISSUE_KEY_PATTERN).unwrap();
        let (key, body) = split_key_and_body(&re, "comment demo-12 Looks good to me").unwrap();
        assert_eq!(key, "DEMO-12");
        assert_eq!(body, "Looks good to me");

        assert!(split_key_and_body(&re, "comment DEMO-12").is_none());
        assert!(split_key_and_body(&re, "comment on something").is_none());
    }

    #[test]
    fn test_issue_key_pattern_matches_links() {
        let re = Regex::new(ISSUE_KEY_PATTERN).unwrap();
        let found = re
            .find("https://example.atlassian.net/browse/DEMO-42")
            .unwrap();
        assert_eq!(found.as_str(), "DEMO-42");
        assert!(re.find("no key here").is_none());
    }

    #[test]
    fn test_jira_failure_mapping() {
        assert!(matches!(
            jira_failure(JiraError::Unauthorized),
            DialogOutcome::NeedsAuth
        ));
        match jira_failure(JiraError::Forbidden("You can't do that.".to_string())) {
            DialogOutcome::Forbidden(msg) => assert_eq!(msg, "You can't do that."),
            other => panic!("expected forbidden, got {other:?}"),
        }
        assert!(matches!(
            jira_failure(JiraError::NotFound("X-1".to_string())),
            DialogOutcome::Complete(_)
        ));
        assert!(matches!(
            jira_failure(JiraError::Bridge(BridgeError::NotResponding {
                peer_id: "srv-1".to_string(),
                correlation_id: "c".to_string(),
            })),
            DialogOutcome::Complete(_)
        ));
        assert!(matches!(
            jira_failure(JiraError::Api("boom".to_string())),
            DialogOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_describe_dialog_names() {
        assert_eq!(describe_dialog("CommentIssue"), "comment on an issue");
        assert_eq!(describe_dialog("AssignIssue"), "assign an issue");
        assert_eq!(describe_dialog("SomethingElse"), "SomethingElse");
    }
}
