use std::fmt;

use session_store::Session;

use crate::config::AntiLoopConfig;

/// Similarity score in `0.0..=1.0` between two tool-call strings.
pub type SimilarityFn = fn(&str, &str) -> f64;

/// Why a tool chain was halted.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopTrip {
    ChainTooLong { count: u32, max: u32 },
    RepeatedCalls { window: usize, similarity: f64 },
}

impl fmt::Display for LoopTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChainTooLong { count, max } => {
                write!(f, "{count} tool calls in one chain exceeds the limit of {max}")
            }
            Self::RepeatedCalls { window, similarity } => write!(
                f,
                "the last {window} tool calls are near-identical (similarity {similarity:.2})"
            ),
        }
    }
}

/// Runaway detection applied before every model round.
#[derive(Debug, Clone)]
pub struct AntiLoopGuard {
    config: AntiLoopConfig,
    similarity: SimilarityFn,
}

impl AntiLoopGuard {
    #[must_use]
    pub fn new(config: AntiLoopConfig) -> Self {
        Self::with_similarity(config, strsim::normalized_levenshtein)
    }

    #[must_use]
    pub fn with_similarity(config: AntiLoopConfig, similarity: SimilarityFn) -> Self {
        Self { config, similarity }
    }

    /// Returns the reason to halt, or `None` when the chain may continue.
    #[must_use]
    pub fn check(&self, session: &Session) -> Option<LoopTrip> {
        if session.anti_loop_exempted() {
            return None;
        }

        let count = session.current_chain_tool_count();
        if count > self.config.max_chain_count {
            return Some(LoopTrip::ChainTooLong {
                count,
                max: self.config.max_chain_count,
            });
        }

        let window = self.config.threshold_count;
        if (count as usize) < window {
            return None;
        }

        let calls = session.tool_call_history();
        if calls.len() < window {
            return None;
        }

        let recent = &calls[calls.len() - window..];
        let latest = recent[window - 1].trim();
        let lowest = recent[..window - 1]
            .iter()
            .map(|call| (self.similarity)(call.trim(), latest))
            .fold(1.0_f64, f64::min);

        if lowest >= self.config.similarity_threshold {
            Some(LoopTrip::RepeatedCalls {
                window,
                similarity: lowest,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> AntiLoopGuard {
        AntiLoopGuard::new(AntiLoopConfig {
            threshold_count: 3,
            similarity_threshold: 0.8,
            max_chain_count: 10,
        })
    }

    fn session_with_calls(calls: &[&str]) -> Session {
        let mut session = Session::new("alice", 0);
        for call in calls {
            session.record_tool_call(*call);
            session.record_tool_success();
        }
        session
    }

    #[test]
    fn identical_calls_trip_once_window_is_full() {
        let guard = guard();
        assert_eq!(guard.check(&session_with_calls(&["#ls: .", "#ls: ."])), None);

        let trip = guard
            .check(&session_with_calls(&["#ls: .", "#ls: .", "#ls: ."]))
            .expect("three identical calls should trip");
        assert!(matches!(trip, LoopTrip::RepeatedCalls { window: 3, .. }));
    }

    #[test]
    fn near_identical_calls_trip_but_distinct_ones_do_not() {
        let guard = guard();
        assert!(guard
            .check(&session_with_calls(&[
                "#read: config/server.yml",
                "#read: config/server.yml ",
                "#read: config/server.yaml",
            ]))
            .is_some());

        assert_eq!(
            guard.check(&session_with_calls(&[
                "#ls: plugins",
                "#read: plugins/a.yml",
                "#diff: plugins/a.yml|x|y",
            ])),
            None
        );
    }

    #[test]
    fn long_chain_trips_even_without_repeats() {
        let calls: Vec<String> = (0..11)
            .map(|index| format!("#run: step-{index:02}-{}", "x".repeat(index)))
            .collect();
        let refs: Vec<&str> = calls.iter().map(String::as_str).collect();
        let session = session_with_calls(&refs);

        assert_eq!(
            guard().check(&session),
            Some(LoopTrip::ChainTooLong { count: 11, max: 10 })
        );
    }

    #[test]
    fn exemption_disables_both_checks() {
        let mut session = session_with_calls(&["#ls: .", "#ls: .", "#ls: ."]);
        session.set_anti_loop_exempted(true);

        assert_eq!(guard().check(&session), None);
    }

    #[test]
    fn reset_chain_ignores_calls_from_previous_chain() {
        let mut session = session_with_calls(&["#ls: .", "#ls: .", "#ls: ."]);
        session.reset_tool_chain();

        assert_eq!(guard().check(&session), None);
    }

    #[test]
    fn similarity_function_is_pluggable() {
        fn never_similar(_: &str, _: &str) -> f64 {
            0.0
        }
        let guard = AntiLoopGuard::with_similarity(
            AntiLoopConfig {
                threshold_count: 3,
                similarity_threshold: 0.8,
                max_chain_count: 10,
            },
            never_similar,
        );

        assert_eq!(
            guard.check(&session_with_calls(&["#ls: .", "#ls: .", "#ls: ."])),
            None
        );
    }
}
