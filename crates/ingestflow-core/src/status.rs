// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status lifecycle shared by scenes and tiles.
//!
//! ```text
//!                 Retry (budget > 0)
//!                 ┌────────┐
//!                 ▼        │
//!   NEW ──────▶ PENDING ───┼──────────▶ DONE
//!   (unblocked)   │  ▲     │
//!                 │  │     └──────────▶ FAILED
//!   Retry         │  │ Requeue
//!   (budget = 0)  ▼  │
//!               RETRY ────────────────▶ DONE / FAILED
//! ```
//!
//! The non-forced path only leaves `PENDING` or `RETRY`. The forced path
//! (operator override) skips the guard on the current status but still runs
//! the cascade attached to the destination.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// Status of a scene or a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// Blocked: waiting for the scene or the previous tile.
    New,
    /// Queued or running on a worker.
    Pending,
    /// Terminal success.
    Done,
    /// Automatic retries exhausted; waits for an operator.
    Retry,
    /// Terminal failure.
    Failed,
}

/// Cascade selected by a legal status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Mark DONE and unblock dependents.
    Finish,
    /// Worker asked for a retry: consume budget and requeue, or park in RETRY.
    Retry,
    /// Operator retry: back to PENDING and re-publish the job.
    Requeue,
    /// Mark FAILED and repair the dependency graph.
    Fail,
    /// Plain status write, no cascade (forced path only).
    Overwrite(Status),
}

impl Status {
    /// All statuses, in declaration order.
    pub const ALL: [Status; 5] = [
        Status::New,
        Status::Pending,
        Status::Done,
        Status::Retry,
        Status::Failed,
    ];

    /// Canonical upper-case name, as stored and exchanged on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::New => "NEW",
            Status::Pending => "PENDING",
            Status::Done => "DONE",
            Status::Retry => "RETRY",
            Status::Failed => "FAILED",
        }
    }

    /// Graphviz colour used by the dependency graph rendering.
    pub fn color(&self) -> &'static str {
        match self {
            Status::New => "gray",
            Status::Pending => "blue",
            Status::Retry => "orange",
            Status::Done => "green",
            Status::Failed => "red",
        }
    }

    /// DONE and FAILED only change through the forced path.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::Failed)
    }

    /// Resolve the cascade for a requested status change.
    ///
    /// Returns `None` when the change is rejected. A rejection is never an
    /// error: it is how duplicate or stale worker results are absorbed.
    pub fn transition_to(self, requested: Status, force: bool) -> Option<Transition> {
        if force {
            return Some(match requested {
                Status::Done => Transition::Finish,
                Status::Failed => Transition::Fail,
                Status::Pending => Transition::Requeue,
                Status::New | Status::Retry => Transition::Overwrite(requested),
            });
        }

        match (self, requested) {
            (Status::Pending, Status::Done) | (Status::Retry, Status::Done) => {
                Some(Transition::Finish)
            }
            (Status::Pending, Status::Failed) | (Status::Retry, Status::Failed) => {
                Some(Transition::Fail)
            }
            (Status::Pending, Status::Retry) => Some(Transition::Retry),
            (Status::Retry, Status::Pending) => Some(Transition::Requeue),
            _ => None,
        }
    }

    /// Reduction priority for the AOI aggregate, highest first.
    pub(crate) fn aggregate_rank(&self) -> u8 {
        match self {
            Status::Retry => 4,
            Status::Pending => 3,
            Status::New => 2,
            Status::Done => 1,
            Status::Failed => 0,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Status::New),
            "PENDING" => Ok(Status::Pending),
            "DONE" => Ok(Status::Done),
            "RETRY" => Ok(Status::Retry),
            "FAILED" => Ok(Status::Failed),
            other => Err(EngineError::ValidationError {
                field: "status".to_string(),
                message: format!("unknown status '{}'", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_forced_table() {
        use Status::*;
        let expected = [
            (Pending, Done, Some(Transition::Finish)),
            (Pending, Retry, Some(Transition::Retry)),
            (Pending, Failed, Some(Transition::Fail)),
            (Pending, Pending, None),
            (Pending, New, None),
            (Retry, Done, Some(Transition::Finish)),
            (Retry, Pending, Some(Transition::Requeue)),
            (Retry, Failed, Some(Transition::Fail)),
            (Retry, Retry, None),
            (Retry, New, None),
        ];
        for (from, to, transition) in expected {
            assert_eq!(
                from.transition_to(to, false),
                transition,
                "{} -> {}",
                from,
                to
            );
        }
    }

    #[test]
    fn test_terminal_and_new_reject_everything() {
        let terminal: Vec<Status> = Status::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![Status::Done, Status::Failed]);

        for from in [Status::New, Status::Done, Status::Failed] {
            for to in Status::ALL {
                assert_eq!(
                    from.transition_to(to, false),
                    None,
                    "{} -> {} must be rejected",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_forced_ignores_current_status() {
        for from in Status::ALL {
            assert_eq!(
                from.transition_to(Status::Done, true),
                Some(Transition::Finish)
            );
            assert_eq!(
                from.transition_to(Status::Failed, true),
                Some(Transition::Fail)
            );
            assert_eq!(
                from.transition_to(Status::Pending, true),
                Some(Transition::Requeue)
            );
            assert_eq!(
                from.transition_to(Status::Retry, true),
                Some(Transition::Overwrite(Status::Retry))
            );
            assert_eq!(
                from.transition_to(Status::New, true),
                Some(Transition::Overwrite(Status::New))
            );
        }
    }

    #[test]
    fn test_parse_and_display() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
            assert_eq!(status.to_string(), status.as_str());
        }
        let err = "done".parse::<Status>().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_serde_uses_upper_case() {
        assert_eq!(serde_json::to_string(&Status::Retry).unwrap(), "\"RETRY\"");
        let parsed: Status = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(parsed, Status::Failed);
    }

    #[test]
    fn test_colors() {
        assert_eq!(Status::New.color(), "gray");
        assert_eq!(Status::Pending.color(), "blue");
        assert_eq!(Status::Retry.color(), "orange");
        assert_eq!(Status::Done.color(), "green");
        assert_eq!(Status::Failed.color(), "red");
    }
}
