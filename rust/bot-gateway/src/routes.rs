/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! The route catalog and the router that binds routes to dialog instances.
//! Binding happens once, at startup: a route whose dialog kind has no
//! registry entry is a fatal configuration error, not something to discover
//! mid-conversation.

use std::collections::HashMap;
use std::sync::Arc;

use jiralink_routing::{DialogKind, MatchOutcome, Route, RouteTable, RoutingError};
use tracing::info;

use crate::dialogs::{Dialog, ISSUE_KEY_PATTERN};
use crate::GatewayError;

/// Every user-facing route. The cancel and disambiguation routes are
/// prepended by the table builder and need no entry here.
///
/// # Errors
///
/// Returns [`RoutingError`] if a pattern fails to compile.
pub fn route_catalog(default_threshold: f64) -> Result<Vec<Route>, RoutingError> {
    Ok(vec![
        Route::pattern(DialogKind::IssueByKey, ISSUE_KEY_PATTERN, 1)?.require_auth(),
        Route::commands(
            DialogKind::Connect,
            &["connect", "connect to jira", "login", "log in", "sign in"],
        )
        .with_threshold(default_threshold),
        Route::commands(
            DialogKind::Disconnect,
            &["disconnect", "logout", "log out", "sign out"],
        )
        .with_threshold(default_threshold)
        .require_auth(),
        Route::commands(DialogKind::Help, &["help", "what can you do"])
            .with_threshold(default_threshold),
        Route::commands(
            DialogKind::CreateIssue,
            &["create", "create issue", "new issue", "create bug", "create task"],
        )
        .with_threshold(default_threshold)
        .require_auth()
        .personal_only(),
        Route::commands(DialogKind::CommentIssue, &["comment", "add comment"])
            .with_threshold(default_threshold)
            .require_auth(),
        Route::commands(
            DialogKind::AssignIssue,
            &["assign", "assign issue", "assign to me"],
        )
        .with_threshold(default_threshold)
        .require_auth(),
        Route::commands(DialogKind::Feedback, &["feedback", "send feedback"])
            .with_threshold(default_threshold),
    ])
}

/// Route table plus the dialog instance each route resolved to.
pub struct DialogRouter {
    table: RouteTable,
    registry: HashMap<DialogKind, Arc<dyn Dialog>>,
}

impl DialogRouter {
    /// Bind every route in `table` against `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if any route's dialog kind has no
    /// registered instance — a construction-time failure by design.
    pub fn new(
        table: RouteTable,
        registry: HashMap<DialogKind, Arc<dyn Dialog>>,
    ) -> Result<Self, GatewayError> {
        for route in table.routes() {
            if !registry.contains_key(&route.dialog) {
                return Err(GatewayError::Config(format!(
                    "no dialog registered for route {}",
                    route.dialog
                )));
            }
        }
        info!(routes = table.routes().len(), "dialog router ready");
        Ok(Self { table, registry })
    }

    /// Every resolved dialog instance, in table iteration order.
    pub fn registered_dialogs(&self) -> Vec<Arc<dyn Dialog>> {
        self.table
            .routes()
            .iter()
            .filter_map(|r| self.registry.get(&r.dialog).cloned())
            .collect()
    }

    pub fn find_best_match(&self, text: &str) -> MatchOutcome<'_> {
        self.table.find_best_match(text)
    }

    pub fn route(&self, kind: DialogKind) -> Option<&Route> {
        self.table.get(kind)
    }

    /// Resolve a dialog instance. Construction guarantees this succeeds for
    /// every kind the table routes to.
    pub fn resolve(&self, kind: DialogKind) -> Option<Arc<dyn Dialog>> {
        self.registry.get(&kind).cloned()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
