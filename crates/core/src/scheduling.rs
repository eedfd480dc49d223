//! Job state machine and execution gate decisions.
//!
//! This module lives in `core` (zero internal deps) so the gate's rules can
//! be tested without a backing store. The async gate in the API crate loads
//! the records and delegates the decision to [`evaluate_gate`].

use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Job status IDs matching `job_statuses` seed data (1-based SMALLSERIAL).
///
/// Duplicated from the `db` crate's `JobStatus` enum because `core` must
/// have zero internal deps.
pub mod state_machine {
    pub const PENDING: i16 = 1;
    pub const RUNNING: i16 = 2;
    pub const COMPLETED: i16 = 3;
    pub const FAILED: i16 = 4;
    pub const CANCELLED: i16 = 5;
    pub const SCHEDULED: i16 = 6;

    /// Returns the set of valid target status IDs reachable from `from_status`.
    ///
    /// Running -> Running is allowed: a redelivered job starts a fresh
    /// attempt after a crash. Terminal states return an empty slice.
    pub fn valid_transitions(from_status: i16) -> &'static [i16] {
        match from_status {
            PENDING => &[RUNNING, SCHEDULED, CANCELLED],
            SCHEDULED => &[PENDING, RUNNING, CANCELLED],
            RUNNING => &[RUNNING, COMPLETED, FAILED, CANCELLED],
            COMPLETED | FAILED | CANCELLED => &[],
            _ => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: i16, to: i16) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Whether no further transitions are possible from `status`.
    pub fn is_terminal(status: i16) -> bool {
        matches!(status, COMPLETED | FAILED | CANCELLED)
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(from: i16, to: i16) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!(
                "Invalid transition: {} ({from}) -> {} ({to})",
                status_name(from),
                status_name(to)
            ))
        }
    }

    /// Wire name for a status ID, as sent to WebSocket clients.
    pub fn status_name(id: i16) -> &'static str {
        match id {
            PENDING => "pending",
            RUNNING => "running",
            COMPLETED => "completed",
            FAILED => "failed",
            CANCELLED => "cancelled",
            SCHEDULED => "scheduled",
            _ => "unknown",
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Outcome of checking whether a job may start executing now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// All checks passed; the caller should mark the job running.
    Proceed,
    /// The job was cancelled before it started.
    Cancelled,
    /// The job already reached completed or failed (duplicate delivery).
    AlreadyFinished(i16),
    /// At least one dependency has not completed yet.
    ///
    /// `failed` lists dependencies that failed, were cancelled, or no longer
    /// exist. They still count as a retryable wait.
    DependenciesUnmet {
        waiting: Vec<DbId>,
        failed: Vec<DbId>,
    },
    /// The job has a start time in the future.
    NotYetScheduled { at: Timestamp },
}

/// Decide whether a job may start.
///
/// Checks run in order: cancellation short-circuits, then terminal states,
/// then dependencies (each entry is a dependency id with its current status,
/// `None` when the dependency record is missing), then the scheduled start.
pub fn evaluate_gate(
    status_id: i16,
    dependencies: &[(DbId, Option<i16>)],
    scheduled_at: Option<Timestamp>,
    now: Timestamp,
) -> GateDecision {
    use state_machine::*;

    if status_id == CANCELLED {
        return GateDecision::Cancelled;
    }
    if is_terminal(status_id) {
        return GateDecision::AlreadyFinished(status_id);
    }

    let mut waiting = Vec::new();
    let mut failed = Vec::new();
    for (dep_id, dep_status) in dependencies {
        match dep_status {
            Some(COMPLETED) => {}
            Some(FAILED) | Some(CANCELLED) | None => failed.push(*dep_id),
            Some(_) => waiting.push(*dep_id),
        }
    }
    if !waiting.is_empty() || !failed.is_empty() {
        return GateDecision::DependenciesUnmet { waiting, failed };
    }

    match scheduled_at {
        Some(at) if at > now => GateDecision::NotYetScheduled { at },
        _ => GateDecision::Proceed,
    }
}

#[cfg(test)]
mod tests {
    use super::state_machine::*;
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};

    // -- state machine --------------------------------------------------------

    #[test]
    fn pending_to_running() {
        assert!(can_transition(PENDING, RUNNING));
    }

    #[test]
    fn scheduled_to_running() {
        assert!(can_transition(SCHEDULED, RUNNING));
    }

    #[test]
    fn running_to_cancelled() {
        assert!(can_transition(RUNNING, CANCELLED));
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        assert!(valid_transitions(COMPLETED).is_empty());
        assert!(valid_transitions(FAILED).is_empty());
        assert!(valid_transitions(CANCELLED).is_empty());
    }

    #[test]
    fn cancelled_to_running_invalid() {
        assert!(!can_transition(CANCELLED, RUNNING));
    }

    #[test]
    fn validate_transition_err_names_both_states() {
        let err = validate_transition(COMPLETED, RUNNING).unwrap_err();
        assert!(err.contains("completed"));
        assert!(err.contains("running"));
    }

    #[test]
    fn unknown_status_has_no_transitions() {
        assert!(valid_transitions(99).is_empty());
    }

    // -- gate -----------------------------------------------------------------

    #[test]
    fn gate_proceeds_without_dependencies_or_schedule() {
        assert_eq!(
            evaluate_gate(PENDING, &[], None, Utc::now()),
            GateDecision::Proceed
        );
    }

    #[test]
    fn gate_cancelled_short_circuits_before_dependencies() {
        let decision = evaluate_gate(CANCELLED, &[(9, Some(PENDING))], None, Utc::now());
        assert_eq!(decision, GateDecision::Cancelled);
    }

    #[test]
    fn gate_reports_finished_jobs() {
        assert_eq!(
            evaluate_gate(COMPLETED, &[], None, Utc::now()),
            GateDecision::AlreadyFinished(COMPLETED)
        );
    }

    #[test]
    fn gate_waits_on_pending_dependency() {
        let deps = [(1, Some(COMPLETED)), (2, Some(PENDING))];
        assert_matches!(
            evaluate_gate(PENDING, &deps, None, Utc::now()),
            GateDecision::DependenciesUnmet { waiting, failed } if waiting == vec![2] && failed.is_empty()
        );
    }

    #[test]
    fn gate_treats_failed_and_missing_dependencies_as_unmet() {
        let deps = [(3, Some(FAILED)), (4, None), (5, Some(RUNNING))];
        assert_matches!(
            evaluate_gate(PENDING, &deps, None, Utc::now()),
            GateDecision::DependenciesUnmet { waiting, failed } if waiting == vec![5] && failed == vec![3, 4]
        );
    }

    #[test]
    fn gate_holds_future_schedule() {
        let now = Utc::now();
        let at = now + Duration::minutes(10);
        assert_eq!(
            evaluate_gate(SCHEDULED, &[], Some(at), now),
            GateDecision::NotYetScheduled { at }
        );
    }

    #[test]
    fn gate_accepts_past_schedule() {
        let now = Utc::now();
        assert_eq!(
            evaluate_gate(SCHEDULED, &[], Some(now - Duration::seconds(1)), now),
            GateDecision::Proceed
        );
    }

    #[test]
    fn dependencies_checked_before_schedule() {
        let now = Utc::now();
        let decision = evaluate_gate(
            PENDING,
            &[(7, Some(RUNNING))],
            Some(now + Duration::hours(1)),
            now,
        );
        assert_matches!(decision, GateDecision::DependenciesUnmet { .. });
    }
}
