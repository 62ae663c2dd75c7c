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

//! Intent routing for inbound chat turns.
//!
//! A [`RouteTable`] maps free text to the dialog that should handle it.
//! Routes match either a list of literal command strings (scored by the
//! fuzzy matcher in [`matcher`]) or a regular expression with an integer
//! priority. Two routes are always present: the cancel route (commands
//! `cancel`/`back`/`undo`/`reset`) and the disambiguation route that
//! receives the turn when two equal-priority pattern routes collide.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use regex::Regex;
use tracing::trace;

pub mod matcher;

pub use matcher::{find_all_matches, MatchOptions};

/// Commands that always abort the active dialog, matched case-insensitively.
pub const CANCEL_COMMANDS: [&str; 4] = ["cancel", "back", "undo", "reset"];

/// Floor below which a literal-text match is rejected.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

// ---------------------------------------------------------------------------
// Dialog kinds
// ---------------------------------------------------------------------------

/// Every dialog the bot can run, resolved against a static registration
/// table at startup. An unresolved kind is a construction error, not a
/// runtime one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DialogKind {
    /// Disambiguation fallback when two equal-priority pattern routes match.
    AmbiguousAction,
    /// Aborts whatever dialog is in flight.
    Cancel,
    Connect,
    Disconnect,
    Help,
    IssueByKey,
    CreateIssue,
    CommentIssue,
    AssignIssue,
    Feedback,
}

impl DialogKind {
    pub const ALL: [Self; 10] = [
        Self::AmbiguousAction,
        Self::Cancel,
        Self::Connect,
        Self::Disconnect,
        Self::Help,
        Self::IssueByKey,
        Self::CreateIssue,
        Self::CommentIssue,
        Self::AssignIssue,
        Self::Feedback,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AmbiguousAction => "AmbiguousAction",
            Self::Cancel => "Cancel",
            Self::Connect => "Connect",
            Self::Disconnect => "Disconnect",
            Self::Help => "Help",
            Self::IssueByKey => "IssueByKey",
            Self::CreateIssue => "CreateIssue",
            Self::CommentIssue => "CommentIssue",
            Self::AssignIssue => "AssignIssue",
            Self::Feedback => "Feedback",
        }
    }

    /// Inverse of [`as_str`](Self::as_str), used when reloading persisted
    /// dialog state.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }
}

impl std::fmt::Display for DialogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum RoutingError {
    #[error("duplicate route for dialog {0}")]
    DuplicateDialog(&'static str),
    #[error("invalid pattern for dialog {dialog}: {source}")]
    InvalidPattern {
        dialog: &'static str,
        source: regex::Error,
    },
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// How a route recognizes its input.
#[derive(Clone, Debug)]
pub enum RouteMatcher {
    /// Literal command strings, scored by the fuzzy matcher.
    Commands(Vec<String>),
    /// Regular expression with an integer priority. Lower `order` is more
    /// specific and wins when several pattern routes match.
    Pattern { regex: Regex, order: i32 },
}

/// One conversational entry point.
#[derive(Clone, Debug)]
pub struct Route {
    pub dialog: DialogKind,
    pub matcher: RouteMatcher,
    pub case_sensitive: bool,
    pub ignore_non_alphanumeric: bool,
    /// Hard floor for literal-text scores. A route whose threshold exceeds
    /// what the scoring formula can yield (1.0 for an exact match) is
    /// unreachable by construction.
    pub threshold: f64,
    pub auth_required: bool,
    /// Disallowed in group conversations.
    pub personal_only: bool,
    /// Free-form payload handed to the dialog when the route wins.
    pub options: serde_json::Value,
}

impl Route {
    #[must_use]
    pub fn commands<S: AsRef<str>>(dialog: DialogKind, commands: &[S]) -> Self {
        Self {
            dialog,
            matcher: RouteMatcher::Commands(
                commands.iter().map(|s| s.as_ref().to_string()).collect(),
            ),
            case_sensitive: false,
            ignore_non_alphanumeric: true,
            threshold: DEFAULT_THRESHOLD,
            auth_required: false,
            personal_only: false,
            options: serde_json::Value::Null,
        }
    }

    /// # Errors
    ///
    /// Returns [`RoutingError::InvalidPattern`] if `pattern` is not a valid
    /// regular expression.
    pub fn pattern(dialog: DialogKind, pattern: &str, order: i32) -> Result<Self, RoutingError> {
        let regex = Regex::new(pattern).map_err(|source| RoutingError::InvalidPattern {
            dialog: dialog.as_str(),
            source,
        })?;
        Ok(Self {
            dialog,
            matcher: RouteMatcher::Pattern { regex, order },
            case_sensitive: false,
            ignore_non_alphanumeric: false,
            threshold: DEFAULT_THRESHOLD,
            auth_required: false,
            personal_only: false,
            options: serde_json::Value::Null,
        })
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn require_auth(mut self) -> Self {
        self.auth_required = true;
        self
    }

    #[must_use]
    pub fn personal_only(mut self) -> Self {
        self.personal_only = true;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

// ---------------------------------------------------------------------------
// Match outcome
// ---------------------------------------------------------------------------

/// Result of scanning the table for a piece of text.
#[derive(Debug)]
pub enum MatchOutcome<'a> {
    /// A literal-command route won, with its fuzzy score.
    Text { route: &'a Route, score: f64 },
    /// A pattern route won.
    Pattern { route: &'a Route },
    /// Two equal-priority pattern routes both matched — an authoring error
    /// resolved at runtime by handing the turn to the disambiguation route,
    /// with the conflicting pair attached.
    Ambiguous {
        route: &'a Route,
        first: &'a Route,
        second: &'a Route,
    },
    NoMatch,
}

impl<'a> MatchOutcome<'a> {
    /// The route that should handle the turn, if any.
    #[must_use]
    pub fn route(&self) -> Option<&'a Route> {
        match *self {
            Self::Text { route, .. } | Self::Pattern { route } | Self::Ambiguous { route, .. } => {
                Some(route)
            }
            Self::NoMatch => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Route table
// ---------------------------------------------------------------------------

/// Priority-ordered, immutable collection of routes. Built once per process;
/// rebuilt, not mutated, when routes change.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Build the table from caller-supplied routes. The disambiguation and
    /// cancel routes are prepended before them; dialog kinds must be unique
    /// across the finished table.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::DuplicateDialog`] if two routes share a kind.
    pub fn build(user_routes: Vec<Route>) -> Result<Self, RoutingError> {
        let mut routes = Vec::with_capacity(user_routes.len() + 2);
        // The disambiguation route has no commands of its own: an empty
        // candidate set never matches, so it is only ever entered through
        // an Ambiguous outcome.
        routes.push(Route::commands::<&str>(DialogKind::AmbiguousAction, &[]));
        routes.push(Route::commands(DialogKind::Cancel, &CANCEL_COMMANDS));
        routes.extend(user_routes);

        let mut seen = Vec::with_capacity(routes.len());
        for route in &routes {
            if seen.contains(&route.dialog) {
                return Err(RoutingError::DuplicateDialog(route.dialog.as_str()));
            }
            seen.push(route.dialog);
        }

        Ok(Self { routes })
    }

    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    #[must_use]
    pub fn get(&self, kind: DialogKind) -> Option<&Route> {
        self.routes.iter().find(|r| r.dialog == kind)
    }

    /// Scan the table for the route that should handle `text`.
    ///
    /// Pattern routes are checked by match/no-match with a long-standing
    /// priority quirk: the first (lowest-order) matched pattern route is
    /// returned as soon as a higher-order pattern route is also found to
    /// match — the scan does not continue looking for an even better route
    /// past that point. Two pattern routes of equal order both
    /// matching yields the disambiguation route with the pair attached.
    /// Literal routes keep the highest fuzzy score at or above their
    /// threshold. A matched pattern route always beats a literal match once
    /// the scan completes.
    #[must_use]
    pub fn find_best_match(&self, text: &str) -> MatchOutcome<'_> {
        let mut best_text: Option<(usize, f64)> = None;
        let mut best_pattern: Option<(usize, i32)> = None;

        for idx in 0..self.routes.len() {
            let route = &self.routes[idx];
            match &route.matcher {
                RouteMatcher::Pattern { regex, order } => {
                    let probe = matcher::pattern_probe(text, route.ignore_non_alphanumeric);
                    if !regex.is_match(&probe) {
                        continue;
                    }
                    trace!(dialog = %route.dialog, order, "pattern route matched");
                    match best_pattern {
                        Some((prev_idx, prev_order)) if prev_order < *order => {
                            // The earlier match is more specific and the
                            // conflict settles it: return it immediately.
                            return MatchOutcome::Pattern {
                                route: &self.routes[prev_idx],
                            };
                        }
                        Some((prev_idx, prev_order)) if prev_order == *order => {
                            return self.ambiguous(prev_idx, idx);
                        }
                        _ => best_pattern = Some((idx, *order)),
                    }
                }
                RouteMatcher::Commands(commands) => {
                    let opts = MatchOptions {
                        case_sensitive: route.case_sensitive,
                        ignore_non_alphanumeric: route.ignore_non_alphanumeric,
                        threshold: route.threshold,
                    };
                    let Some(score) = matcher::best_score(text, commands, &opts) else {
                        continue;
                    };
                    trace!(dialog = %route.dialog, score, "text route matched");
                    if best_text.is_none_or(|(_, s)| score > s) {
                        best_text = Some((idx, score));
                    }
                }
            }
        }

        if let Some((idx, _)) = best_pattern {
            return MatchOutcome::Pattern {
                route: &self.routes[idx],
            };
        }
        if let Some((idx, score)) = best_text {
            return MatchOutcome::Text {
                route: &self.routes[idx],
                score,
            };
        }
        MatchOutcome::NoMatch
    }

    fn ambiguous(&self, first: usize, second: usize) -> MatchOutcome<'_> {
        // Build guarantees the disambiguation route exists.
        let Some(route) = self.get(DialogKind::AmbiguousAction) else {
            return MatchOutcome::NoMatch;
        };
        MatchOutcome::Ambiguous {
            route,
            first: &self.routes[first],
            second: &self.routes[second],
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

    fn table(user_routes: Vec<Route>) -> RouteTable {
        RouteTable::build(user_routes).unwrap()
    }

    #[test]
    fn test_builtins_are_prepended() {
        let t = table(vec![Route::commands(DialogKind::Help, &["help"])]);
        assert_eq!(t.routes()[0].dialog, DialogKind::AmbiguousAction);
        assert_eq!(t.routes()[1].dialog, DialogKind::Cancel);
        assert_eq!(t.routes()[2].dialog, DialogKind::Help);
    }

    #[test]
    fn test_duplicate_dialog_rejected() {
        let result = RouteTable::build(vec![
            Route::commands(DialogKind::Help, &["help"]),
            Route::commands(DialogKind::Help, &["assist"]),
        ]);
        assert!(matches!(
            result,
            Err(RoutingError::DuplicateDialog("Help"))
        ));
    }

    #[test]
    fn test_supplying_a_second_cancel_route_rejected() {
        let result = RouteTable::build(vec![Route::commands(DialogKind::Cancel, &["stop"])]);
        assert!(result.is_err(), "Cancel is built in, duplicates must fail");
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = Route::pattern(DialogKind::IssueByKey, "([A-Z", 1);
        assert!(matches!(
            result,
            Err(RoutingError::InvalidPattern { dialog: "IssueByKey", .. })
        ));
    }

    #[test]
    fn test_exact_command_routes() {
        let t = table(vec![Route::commands(DialogKind::Help, &["test"])]);
        let outcome = t.find_best_match("test");
        match outcome {
            MatchOutcome::Text { route, score } => {
                assert_eq!(route.dialog, DialogKind::Help);
                assert!((score - 1.0).abs() < f64::EPSILON);
            }
            other => panic!("expected text match, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_text_matches_nothing() {
        let t = table(vec![Route::commands(DialogKind::Help, &["test"])]);
        assert!(t.find_best_match("unknown").route().is_none());
    }

    #[test]
    fn test_cancel_words_route_to_cancel_regardless_of_other_routes() {
        let t = table(vec![
            Route::commands(DialogKind::Help, &["help", "test"]),
            Route::commands(DialogKind::CreateIssue, &["create"]),
        ]);
        for word in ["cancel", "back", "undo", "reset", "CANCEL", "Back"] {
            let route = t.find_best_match(word).route().unwrap();
            assert_eq!(route.dialog, DialogKind::Cancel, "word {word}");
        }
    }

    #[test]
    fn test_unreachable_threshold_loses_to_reachable_one() {
        // An exact match scores 1.0, so a 1.01 threshold can never be met
        // and the 0.99 route wins even though it sits later in the table.
        let t = table(vec![
            Route::commands(DialogKind::Help, &["text"]).with_threshold(1.01),
            Route::commands(DialogKind::Feedback, &["text"]).with_threshold(0.99),
        ]);
        let route = t.find_best_match("text").route().unwrap();
        assert_eq!(route.dialog, DialogKind::Feedback);
    }

    #[test]
    fn test_first_of_equal_scores_wins() {
        let t = table(vec![
            Route::commands(DialogKind::Help, &["status"]),
            Route::commands(DialogKind::Feedback, &["status"]),
        ]);
        let route = t.find_best_match("status").route().unwrap();
        assert_eq!(route.dialog, DialogKind::Help, "ties keep the earlier route");
    }

    #[test]
    fn test_pattern_route_matches() {
        let t = table(vec![Route::pattern(
            DialogKind::IssueByKey,
            r"\b[A-Za-z][A-Za-z0-9]*-\d+\b",
            1,
        )
        .unwrap()]);
        let outcome = t.find_best_match("have a look at PROJ-123 please");
        match outcome {
            MatchOutcome::Pattern { route } => assert_eq!(route.dialog, DialogKind::IssueByKey),
            other => panic!("expected pattern match, got {other:?}"),
        }
    }

    #[test]
    fn test_pattern_beats_text_after_full_scan() {
        let t = table(vec![
            Route::commands(DialogKind::Help, &["proj"]),
            Route::pattern(DialogKind::IssueByKey, r"[Pp]roj-\d+", 1).unwrap(),
        ]);
        let outcome = t.find_best_match("proj-42");
        match outcome {
            MatchOutcome::Pattern { route } => assert_eq!(route.dialog, DialogKind::IssueByKey),
            other => panic!("expected pattern to win over text, got {other:?}"),
        }
    }

    #[test]
    fn test_lower_order_pattern_wins_when_seen_first() {
        // Table order: specific (order 1) before general (order 2). The scan
        // returns the order-1 route the moment the order-2 route also
        // matches.
        let t = table(vec![
            Route::pattern(DialogKind::IssueByKey, r"issue \d+", 1).unwrap(),
            Route::pattern(DialogKind::Help, r"issue", 2).unwrap(),
        ]);
        let route = t.find_best_match("issue 42").route().unwrap();
        assert_eq!(route.dialog, DialogKind::IssueByKey);
    }

    #[test]
    fn test_lower_order_pattern_wins_when_seen_second() {
        let t = table(vec![
            Route::pattern(DialogKind::Help, r"issue", 2).unwrap(),
            Route::pattern(DialogKind::IssueByKey, r"issue \d+", 1).unwrap(),
        ]);
        let route = t.find_best_match("issue 42").route().unwrap();
        assert_eq!(route.dialog, DialogKind::IssueByKey);
    }

    #[test]
    fn test_equal_order_patterns_are_ambiguous() {
        let t = table(vec![
            Route::pattern(DialogKind::CommentIssue, r"issue", 1).unwrap(),
            Route::pattern(DialogKind::AssignIssue, r"issue \d+", 1).unwrap(),
        ]);
        match t.find_best_match("issue 42") {
            MatchOutcome::Ambiguous { route, first, second } => {
                assert_eq!(route.dialog, DialogKind::AmbiguousAction);
                assert_eq!(first.dialog, DialogKind::CommentIssue);
                assert_eq!(second.dialog, DialogKind::AssignIssue);
            }
            other => panic!("expected ambiguous outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_equal_order_ambiguity_holds_for_any_matching_input() {
        let t = table(vec![
            Route::pattern(DialogKind::CommentIssue, r"comment", 3).unwrap(),
            Route::pattern(DialogKind::AssignIssue, r"comment on", 3).unwrap(),
        ]);
        for text in ["comment on ABC-1", "please comment on this", "comment on"] {
            assert!(
                matches!(t.find_best_match(text), MatchOutcome::Ambiguous { .. }),
                "text {text:?}"
            );
        }
    }

    #[test]
    fn test_pattern_routes_never_scored_as_text() {
        // The pattern text would fuzzy-match "help" easily, but pattern
        // routes are match/no-match only.
        let t = table(vec![Route::pattern(DialogKind::Help, r"^exactly this$", 1).unwrap()]);
        assert!(t.find_best_match("help").route().is_none());
    }

    #[test]
    fn test_pattern_probe_strips_non_alphanumeric_when_flagged() {
        let mut route = Route::pattern(DialogKind::IssueByKey, r"^proj7$", 1).unwrap();
        route.ignore_non_alphanumeric = true;
        let t = table(vec![route]);
        assert!(t.find_best_match("proj-&!7").route().is_some());
        assert!(t.find_best_match("proj7!").route().is_some());
    }

    #[test]
    fn test_dialog_kind_name_round_trip() {
        for kind in DialogKind::ALL {
            assert_eq!(DialogKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(DialogKind::from_name("NoSuchDialog"), None);
    }

    #[test]
    fn test_ambiguous_route_is_not_directly_matchable() {
        let t = table(vec![]);
        assert!(t.find_best_match("ambiguous").route().is_none());
        assert!(t.find_best_match("AmbiguousAction").route().is_none());
    }
}
