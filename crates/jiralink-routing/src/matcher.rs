/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Fuzzy scoring of free text against a route's literal command strings.
//!
//! The scoring rules carry two long-standing quirks that route authors
//! have tuned thresholds against: the utterance-in-candidate ratio is not
//! clamped, and in the token branch the *last* matching token overwrites
//! earlier ones instead of keeping the best. Changing either would silently
//! change which routes win, so both are kept and pinned by tests.

/// Normalization and acceptance settings for one scoring pass.
#[derive(Clone, Copy, Debug)]
pub struct MatchOptions {
    pub case_sensitive: bool,
    /// Strip everything but letters, digits and spaces before comparing.
    pub ignore_non_alphanumeric: bool,
    /// Scores below this floor are dropped from the result entirely.
    pub threshold: f64,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            ignore_non_alphanumeric: true,
            threshold: crate::DEFAULT_THRESHOLD,
        }
    }
}

/// Score of one candidate that passed the threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CandidateScore {
    /// Index into the candidate slice handed to [`find_all_matches`].
    pub index: usize,
    pub score: f64,
}

/// Score every candidate against the utterance, keeping only those at or
/// above the threshold. Returns an empty vector when the utterance is blank
/// or no candidate qualifies.
#[must_use]
pub fn find_all_matches<S: AsRef<str>>(
    utterance: &str,
    candidates: &[S],
    opts: &MatchOptions,
) -> Vec<CandidateScore> {
    let utterance = normalize(utterance, opts);
    if utterance.is_empty() {
        return Vec::new();
    }

    let mut matches = Vec::new();
    for (index, candidate) in candidates.iter().enumerate() {
        let candidate = normalize(candidate.as_ref(), opts);
        if candidate.is_empty() {
            continue;
        }
        let score = score_candidate(&utterance, &candidate);
        if score >= opts.threshold {
            matches.push(CandidateScore { index, score });
        }
    }
    matches
}

/// The single best score across all candidates, or `None` when nothing
/// reached the threshold.
#[must_use]
pub fn best_score<S: AsRef<str>>(
    utterance: &str,
    candidates: &[S],
    opts: &MatchOptions,
) -> Option<f64> {
    find_all_matches(utterance, candidates, opts)
        .into_iter()
        .map(|m| m.score)
        .fold(None, |best, score| match best {
            Some(b) if b >= score => Some(b),
            _ => Some(score),
        })
}

/// Input normalization shared by text scoring, applied to both sides of
/// every comparison: trim, optionally strip non-alphanumerics (spaces
/// survive), optionally case-fold.
fn normalize(text: &str, opts: &MatchOptions) -> String {
    let mut text: String = if opts.ignore_non_alphanumeric {
        text.trim()
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == ' ')
            .collect()
    } else {
        text.trim().to_string()
    };
    if !opts.case_sensitive {
        text = text.to_lowercase();
    }
    text
}

/// Probe string for pattern routes: trimmed, optionally stripped of
/// non-alphanumerics. Pattern routes bypass scoring entirely.
#[must_use]
pub fn pattern_probe(text: &str, ignore_non_alphanumeric: bool) -> String {
    if ignore_non_alphanumeric {
        text.trim()
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == ' ')
            .collect()
    } else {
        text.trim().to_string()
    }
}

fn score_candidate(utterance: &str, candidate: &str) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let u_len = utterance.chars().count() as f64;
    #[allow(clippy::cast_precision_loss)]
    let c_len = candidate.chars().count() as f64;

    // Utterance inside the candidate: ratio of lengths, deliberately not
    // clamped (an exact match yields exactly 1.0).
    if candidate.contains(utterance) {
        return u_len / c_len;
    }

    // Candidate inside the utterance: partial credit, capped at 0.9 so a
    // containment can never outrank an exact match.
    if utterance.contains(candidate) {
        return (0.5 + c_len / u_len).min(0.9);
    }

    // Token scan. The last matching token overwrites any earlier score.
    let mut score = 0.0;
    for token in utterance.split(' ').filter(|t| !t.is_empty()) {
        if candidate.contains(token) {
            #[allow(clippy::cast_precision_loss)]
            let t_len = token.chars().count() as f64;
            score = t_len / c_len;
        }
    }
    score
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn opts(threshold: f64) -> MatchOptions {
        MatchOptions {
            threshold,
            ..MatchOptions::default()
        }
    }

    #[test]
    fn test_exact_match_scores_one() {
        let score = best_score("test", &["test"], &MatchOptions::default()).unwrap();
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_result_ever_below_threshold() {
        let candidates = ["create issue", "comment", "assign to me", "help"];
        let utterances = ["create", "add a comment please", "assign", "h", "xyzzy", "me"];
        for threshold in [0.1, 0.5, 0.75, 0.9] {
            for utterance in utterances {
                for m in find_all_matches(utterance, &candidates, &opts(threshold)) {
                    assert!(
                        m.score >= threshold,
                        "utterance {utterance:?} candidate #{} scored {} below {threshold}",
                        m.index,
                        m.score
                    );
                }
            }
        }
    }

    #[test]
    fn test_utterance_contained_in_candidate() {
        // "create" (6) inside "create issue" (12): 6/12
        let score = best_score("create", &["create issue"], &opts(0.4)).unwrap();
        assert!((score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_candidate_contained_in_utterance_capped() {
        // "help" (4) inside "help me with this please" (24): 0.5 + 4/24,
        // well under the 0.9 cap.
        let score = best_score("help me with this please", &["help"], &opts(0.5)).unwrap();
        assert!((score - (0.5 + 4.0 / 24.0)).abs() < 1e-9);

        // A candidate nearly as long as the utterance hits the cap.
        let score = best_score("helper", &["helpe"], &opts(0.5)).unwrap();
        assert!((score - 0.9).abs() < f64::EPSILON, "cap at 0.9, got {score}");
    }

    #[test]
    fn test_containment_never_outranks_exact_match() {
        let all = find_all_matches("connect", &["connect", "connect to jira"], &opts(0.4));
        assert_eq!(all.len(), 2);
        let exact = all.iter().find(|m| m.index == 0).unwrap();
        let partial = all.iter().find(|m| m.index == 1).unwrap();
        assert!(exact.score > partial.score);
    }

    #[test]
    fn test_last_token_overwrites_earlier_matches() {
        // Neither side contains the other, so the token branch runs.
        // "abcde" scores 5/6 against "abcdef", then "bc" overwrites it
        // with 2/6 — the historical behavior keeps the later, worse score.
        let score = best_score("abcde bc", &["abcdef"], &opts(0.1)).unwrap();
        assert!((score - 2.0 / 6.0).abs() < 1e-9);
        // At the default threshold the same input therefore matches nothing.
        assert!(best_score("abcde bc", &["abcdef"], &opts(0.5)).is_none());
    }

    #[test]
    fn test_token_match_uses_last_matching_token_not_last_token() {
        // Final token "zz" matches nothing, so the earlier "abcde" stands.
        let score = best_score("abcde zz", &["abcdef"], &opts(0.5)).unwrap();
        assert!((score - 5.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_blank_utterance_matches_nothing() {
        assert!(best_score("", &["help"], &MatchOptions::default()).is_none());
        assert!(best_score("   ", &["help"], &MatchOptions::default()).is_none());
    }

    #[test]
    fn test_empty_candidate_set_matches_nothing() {
        let candidates: [&str; 0] = [];
        assert!(best_score("help", &candidates, &MatchOptions::default()).is_none());
    }

    #[test]
    fn test_blank_candidates_are_skipped() {
        let score = best_score("help", &["", "  ", "help"], &MatchOptions::default()).unwrap();
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_case_folding_by_default() {
        let score = best_score("HELP", &["help"], &MatchOptions::default()).unwrap();
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_case_sensitive_when_requested() {
        let o = MatchOptions {
            case_sensitive: true,
            ..MatchOptions::default()
        };
        assert!(best_score("HELP", &["help"], &o).is_none());
    }

    #[test]
    fn test_non_alphanumeric_stripped_by_default() {
        let score = best_score("help!", &["help"], &MatchOptions::default()).unwrap();
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        // "create" in "create issue" scores exactly 0.5.
        assert!(best_score("create", &["create issue"], &opts(0.5)).is_some());
        assert!(best_score("create", &["create issue"], &opts(0.5000001)).is_none());
    }

    #[test]
    fn test_best_score_takes_maximum_across_candidates() {
        let score = best_score(
            "create",
            &["create issue story epic", "create issue", "create"],
            &opts(0.1),
        )
        .unwrap();
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pattern_probe_strips_only_when_asked() {
        assert_eq!(pattern_probe("  PROJ-123!  ", false), "PROJ-123!");
        assert_eq!(pattern_probe("  PROJ-123!  ", true), "PROJ123");
    }
}
