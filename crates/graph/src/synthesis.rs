//! Synthesis strategies: combine the results of a node's structural children.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cogwheel_core::{PayloadId, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};

use crate::dag::DependencyGraph;

/// Terminal state of one child, as seen by synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildResult {
    pub id: TaskId,
    pub status: TaskStatus,
    pub result: Option<PayloadId>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ChildResult {
    fn succeeded(&self) -> Option<&PayloadId> {
        match self.status {
            TaskStatus::CompletedSuccess => self.result.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Synthesis {
    /// The parent completes with this result.
    Resolved(PayloadId),
    /// No usable child result; the parent fails.
    Unresolved(String),
    /// Wait for an external decision.
    Held,
}

pub trait SynthesisStrategy: Send + Sync {
    fn synthesize(&self, children: &[ChildResult]) -> Synthesis;
}

/// Built-in conflict policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SynthesisPolicy {
    LatestCompletedWins,
    /// Most frequent result; ties go to the most recently completed.
    MajorityVote,
    Manual,
}

impl FromStr for SynthesisPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(Self::LatestCompletedWins),
            "majority" => Ok(Self::MajorityVote),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown synthesis policy: {other}")),
        }
    }
}

impl fmt::Display for SynthesisPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LatestCompletedWins => f.write_str("latest"),
            Self::MajorityVote => f.write_str("majority"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

impl SynthesisStrategy for SynthesisPolicy {
    fn synthesize(&self, children: &[ChildResult]) -> Synthesis {
        if *self == SynthesisPolicy::Manual {
            return Synthesis::Held;
        }

        let succeeded: Vec<(&PayloadId, Option<DateTime<Utc>>)> = children
            .iter()
            .filter_map(|c| c.succeeded().map(|r| (r, c.completed_at)))
            .collect();
        if succeeded.is_empty() {
            return Synthesis::Unresolved(format!(
                "none of {} children produced a result",
                children.len()
            ));
        }

        let winner = match self {
            SynthesisPolicy::LatestCompletedWins => succeeded
                .iter()
                .max_by_key(|(_, at)| *at)
                .map(|(r, _)| *r),
            _ => {
                // result -> (votes, latest completion)
                let mut tally: HashMap<&PayloadId, (usize, Option<DateTime<Utc>>)> =
                    HashMap::new();
                for (result, at) in &succeeded {
                    let entry = tally.entry(*result).or_insert((0, None));
                    entry.0 += 1;
                    entry.1 = entry.1.max(*at);
                }
                tally
                    .into_iter()
                    .max_by_key(|(_, (votes, at))| (*votes, *at))
                    .map(|(r, _)| r)
            }
        };
        match winner {
            Some(r) => Synthesis::Resolved(r.clone()),
            None => Synthesis::Unresolved("no candidate result".into()),
        }
    }
}

impl DependencyGraph {
    /// Results of `parent`'s structural children.
    pub fn child_results(&self, parent: &TaskId) -> Vec<ChildResult> {
        self.children(parent)
            .into_iter()
            .map(|c| ChildResult {
                id: c.id(),
                status: c.status(),
                result: c.task.result.clone(),
                completed_at: c.task.completed_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(result: Option<&str>, secs: i64) -> ChildResult {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        ChildResult {
            id: TaskId::new(),
            status: if result.is_some() {
                TaskStatus::CompletedSuccess
            } else {
                TaskStatus::CompletedFailure
            },
            result: result.map(PayloadId::from),
            completed_at: Some(base + chrono::Duration::seconds(secs)),
        }
    }

    #[test]
    fn latest_completed_wins() {
        let children = [child(Some("a"), 1), child(Some("b"), 5), child(None, 9)];
        assert_eq!(
            SynthesisPolicy::LatestCompletedWins.synthesize(&children),
            Synthesis::Resolved(PayloadId::from("b"))
        );
    }

    #[test]
    fn majority_vote_counts_equal_results() {
        let children = [
            child(Some("x"), 1),
            child(Some("y"), 9),
            child(Some("x"), 2),
        ];
        assert_eq!(
            SynthesisPolicy::MajorityVote.synthesize(&children),
            Synthesis::Resolved(PayloadId::from("x"))
        );
    }

    #[test]
    fn majority_tie_goes_to_latest() {
        let children = [child(Some("x"), 1), child(Some("y"), 7)];
        assert_eq!(
            SynthesisPolicy::MajorityVote.synthesize(&children),
            Synthesis::Resolved(PayloadId::from("y"))
        );
    }

    #[test]
    fn all_failed_is_unresolved() {
        let children = [child(None, 1), child(None, 2)];
        assert!(matches!(
            SynthesisPolicy::LatestCompletedWins.synthesize(&children),
            Synthesis::Unresolved(_)
        ));
    }

    #[test]
    fn manual_holds() {
        let children = [child(Some("a"), 1)];
        assert_eq!(SynthesisPolicy::Manual.synthesize(&children), Synthesis::Held);
    }

    #[test]
    fn policy_names() {
        assert_eq!("latest".parse(), Ok(SynthesisPolicy::LatestCompletedWins));
        assert_eq!("majority".parse(), Ok(SynthesisPolicy::MajorityVote));
        assert_eq!("manual".parse(), Ok(SynthesisPolicy::Manual));
        assert!("vote".parse::<SynthesisPolicy>().is_err());
    }
}
