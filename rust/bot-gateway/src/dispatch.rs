/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Per-turn dispatch: cancellation intent first, then continuation of the
//! active dialog, then route selection for a fresh dialog. Every failure is
//! absorbed here — a turn always ends with a reply, never a crash.

use jiralink_routing::{DialogKind, MatchOutcome, Route};
use regex::Regex;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::activity::Activity;
use crate::dialogs::{DialogOutcome, TurnContext};
use crate::routes::DialogRouter;
use crate::store::UserConnection;
use crate::{AppState, GatewayError};

const DIDNT_UNDERSTAND: &str =
    "Sorry, I didn't catch that. Type 'help' to see what I understand.";
const APOLOGY: &str = "Something went wrong on my side. Please try that again.";
const PERSONAL_ONLY: &str = "That command only works in a personal chat with me.";

pub struct Dispatcher {
    router: DialogRouter,
    cancel_re: Regex,
    issue_url_re: Regex,
}

impl Dispatcher {
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if a built-in pattern fails to
    /// compile.
    pub fn new(router: DialogRouter) -> Result<Self, GatewayError> {
        let cancel_re = Regex::new(r"(?i)^\s*(cancel|back|undo|reset)\s*$")
            .map_err(|e| GatewayError::Config(format!("cancel pattern: {e}")))?;
        let issue_url_re = Regex::new(r"https?://\S+/browse/[A-Za-z][A-Za-z0-9]+-\d+")
            .map_err(|e| GatewayError::Config(format!("issue url pattern: {e}")))?;
        Ok(Self {
            router,
            cancel_re,
            issue_url_re,
        })
    }

    /// True when the text is a bare cancellation command. Checked before
    /// any continuation so cancel always pre-empts in-flight dialogs.
    pub fn is_cancel_intent(&self, text: &str) -> bool {
        self.cancel_re.is_match(text)
    }

    /// Number of resolved dialog instances behind the route table.
    pub fn registered_dialog_count(&self) -> usize {
        self.router.registered_dialogs().len()
    }

    /// Handle one inbound message activity and produce the reply.
    pub async fn handle_turn(&self, state: &AppState, activity: &Activity) -> Activity {
        let text = activity.clean_text();
        let user_id = activity.from_id();
        let conversation_id = activity.conversation_id();

        let connection = lookup_connection(state, user_id).await;
        let ctx = TurnContext {
            state,
            activity,
            text: &text,
            user_id,
            conversation_id,
            connection: connection.as_ref(),
            cancel: state.cancel_rx.clone(),
        };

        // 1. Cancellation intent pre-empts whatever is in flight.
        if self.is_cancel_intent(&text) {
            if let Err(e) = state.store.clear_dialog_state(conversation_id).await {
                warn!(error = %e, conversation_id, "failed clearing state on cancel");
            }
            info!(conversation_id, "dialog cancelled by user");
            return activity.reply_text("Okay — cancelled. What would you like to do next?");
        }

        // 2. Continue the active dialog, if any. A dialog abandoned for over
        // an hour is expired rather than resumed into a stale prompt.
        match state.store.get_dialog_state(conversation_id).await {
            Ok(Some(record)) => {
                let expired = chrono::Utc::now() - record.updated_at > chrono::Duration::hours(1);
                if expired {
                    info!(dialog = %record.dialog, "expiring abandoned dialog state");
                } else if let Some((kind, dialog)) =
                    DialogKind::from_name(&record.dialog)
                        .and_then(|kind| self.router.resolve(kind).map(|dialog| (kind, dialog)))
                {
                    let outcome = dialog.resume(&ctx, record.state).await;
                    return self.apply_outcome(&ctx, kind, outcome).await;
                } else {
                    // A state row from an older build.
                    warn!(dialog = %record.dialog, "clearing unresolvable dialog state");
                }
                if let Err(e) = state.store.clear_dialog_state(conversation_id).await {
                    warn!(error = %e, "failed clearing stale dialog state");
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, conversation_id, "dialog state lookup failed");
                return activity.reply_text(APOLOGY);
            }
        }

        // 3. Pick a dialog to begin. Card-sourced messages and issue links
        // go straight to the issue-by-key dialog.
        if activity.is_html_sourced() || self.issue_url_re.is_match(&text) {
            return self
                .begin_route(&ctx, DialogKind::IssueByKey, &json!({ "text": text }))
                .await;
        }

        match self.router.find_best_match(&text) {
            MatchOutcome::NoMatch => activity.reply_text(DIDNT_UNDERSTAND),
            MatchOutcome::Ambiguous { route, first, second } => {
                let options = json!({
                    "first": first.dialog.as_str(),
                    "second": second.dialog.as_str(),
                });
                info!(
                    first = %first.dialog,
                    second = %second.dialog,
                    "ambiguous route match"
                );
                self.begin(&ctx, route, &options).await
            }
            MatchOutcome::Text { route, score } => {
                info!(dialog = %route.dialog, score, "text route selected");
                let options = route.options.clone();
                self.begin(&ctx, route, &options).await
            }
            MatchOutcome::Pattern { route } => {
                info!(dialog = %route.dialog, "pattern route selected");
                let options = route.options.clone();
                self.begin(&ctx, route, &options).await
            }
        }
    }

    async fn begin_route(
        &self,
        ctx: &TurnContext<'_>,
        kind: DialogKind,
        options: &Value,
    ) -> Activity {
        match self.router.route(kind) {
            Some(route) => self.begin(ctx, route, options).await,
            None => {
                error!(dialog = %kind, "route missing from table");
                ctx.activity.reply_text(APOLOGY)
            }
        }
    }

    async fn begin(&self, ctx: &TurnContext<'_>, route: &Route, options: &Value) -> Activity {
        if route.auth_required && ctx.connection.is_none() {
            return connect_prompt(ctx);
        }
        if route.personal_only && ctx.activity.is_group() {
            return ctx.activity.reply_text(PERSONAL_ONLY);
        }

        let Some(dialog) = self.router.resolve(route.dialog) else {
            // Construction validates the registry, so this is unreachable in
            // a running service.
            error!(dialog = %route.dialog, "route resolved to no dialog");
            return ctx.activity.reply_text(APOLOGY);
        };

        let outcome = dialog.begin(ctx, options).await;
        self.apply_outcome(ctx, route.dialog, outcome).await
    }

    /// Turn a dialog outcome into the reply activity and the matching state
    /// transition. This is the single place the error taxonomy is enforced.
    async fn apply_outcome(
        &self,
        ctx: &TurnContext<'_>,
        kind: DialogKind,
        outcome: DialogOutcome,
    ) -> Activity {
        match outcome {
            DialogOutcome::Complete(text) => {
                if let Err(e) = ctx.state.store.clear_dialog_state(ctx.conversation_id).await {
                    warn!(error = %e, "failed clearing dialog state on completion");
                }
                ctx.activity.reply_text(text)
            }
            DialogOutcome::Waiting { prompt, state } => {
                if let Err(e) = ctx
                    .state
                    .store
                    .put_dialog_state(ctx.conversation_id, kind.as_str(), &state)
                    .await
                {
                    error!(error = %e, dialog = %kind, "failed persisting dialog state");
                    return ctx.activity.reply_text(APOLOGY);
                }
                ctx.activity.reply_text(prompt)
            }
            DialogOutcome::NeedsAuth => {
                if let Err(e) = ctx.state.store.clear_dialog_state(ctx.conversation_id).await {
                    warn!(error = %e, "failed clearing dialog state on auth redirect");
                }
                connect_prompt(ctx)
            }
            DialogOutcome::Forbidden(message) => {
                if let Err(e) = ctx.state.store.clear_dialog_state(ctx.conversation_id).await {
                    warn!(error = %e, "failed clearing dialog state on forbidden");
                }
                info!(dialog = %kind, "action forbidden by Jira");
                ctx.activity.reply_text(message)
            }
            DialogOutcome::Failed(detail) => {
                error!(dialog = %kind, detail = %detail, "dialog failed");
                if let Err(e) = ctx.state.store.clear_dialog_state(ctx.conversation_id).await {
                    warn!(error = %e, "failed clearing dialog state after failure");
                }
                ctx.activity.reply_text(APOLOGY)
            }
        }
    }
}

/// The connect card shown whenever a turn needs a Jira connection that
/// isn't there.
fn connect_prompt(ctx: &TurnContext<'_>) -> Activity {
    let site = ctx
        .state
        .config
        .jira
        .default_site_url
        .clone()
        .unwrap_or_else(|| "https://id.atlassian.com".to_string());
    let card = json!({
        "title": "Connect to Jira",
        "text": "You need to connect your Jira account before I can do that.",
        "buttons": [{
            "type": "openUrl",
            "title": "Connect",
            "value": site,
        }],
    });
    ctx.activity
        .reply_card("You need to connect to Jira first.", card)
}

async fn lookup_connection(state: &AppState, user_id: &str) -> Option<UserConnection> {
    if user_id.is_empty() {
        return None;
    }
    if let Some(conn) = state.conn_cache.get::<UserConnection>(user_id).await {
        return Some(conn);
    }
    match state.store.get_user_connection(user_id).await {
        Ok(Some(conn)) => {
            state.conn_cache.put(user_id, &conn).await;
            Some(conn)
        }
        Ok(None) => None,
        Err(e) => {
            // Treated as not-connected; the worst case is a connect prompt.
            warn!(error = %e, user_id, "connection lookup failed");
            None
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
    use crate::dialogs::build_registry;
    use crate::routes::route_catalog;
    use jiralink_routing::{RouteTable, DEFAULT_THRESHOLD};

    fn dispatcher() -> Dispatcher {
        let table = RouteTable::build(route_catalog(DEFAULT_THRESHOLD).unwrap()).unwrap();
        let router = DialogRouter::new(table, build_registry().unwrap()).unwrap();
        Dispatcher::new(router).unwrap()
    }

    #[test]
    fn test_cancel_intent_words() {
        let d = dispatcher();
        for word in ["cancel", "back", "undo", "reset", "Cancel", "RESET", " cancel "] {
            assert!(d.is_cancel_intent(word), "word {word:?}");
        }
    }

    #[test]
    fn test_cancel_intent_requires_bare_command() {
        let d = dispatcher();
        for text in ["cancel the meeting", "please cancel", "undo that thing", "backlog"] {
            assert!(!d.is_cancel_intent(text), "text {text:?}");
        }
    }

    #[test]
    fn test_issue_url_detection() {
        let d = dispatcher();
        assert!(d
            .issue_url_re
            .is_match("https://example.atlassian.net/browse/DEMO-42"));
        assert!(d
            .issue_url_re
            .is_match("check http://jira.internal/browse/OPS-7 please"));
        assert!(!d.issue_url_re.is_match("DEMO-42"));
        assert!(!d.issue_url_re.is_match("https://example.com/DEMO-42"));
    }
}
