//! Legal status transitions for a run.

use thiserror::Error;

use crate::core::types::RunStatus;

/// Rejected status change. Always a programming error in the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal status transition {from} -> {to}")]
    Illegal { from: RunStatus, to: RunStatus },
    #[error("attempt budget exhausted ({attempts}/{max}): {from} -> {to} not allowed")]
    BudgetExhausted {
        from: RunStatus,
        to: RunStatus,
        attempts: u32,
        max: u32,
    },
}

/// True if `from -> to` is an edge of the status graph.
///
/// `failed` is reachable from every non-terminal status. Terminal statuses
/// have no outgoing edges.
pub fn is_edge(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::{Applying, Completed, Failed, Initialized, Planning, Publishing, Validating};

    if from.is_terminal() {
        return false;
    }
    if to == Failed {
        return true;
    }
    matches!(
        (from, to),
        (Initialized, Planning)
            | (Planning, Applying)
            | (Applying, Validating)
            | (Validating, Applying)
            | (Validating, Publishing)
            | (Publishing, Completed)
    )
}

/// Check a transition against both the graph and the attempt budget.
///
/// Once `attempts == max_attempts` the only legal move is to `failed`.
pub fn check_transition(
    from: RunStatus,
    to: RunStatus,
    attempts: u32,
    max_attempts: u32,
) -> Result<(), TransitionError> {
    if !is_edge(from, to) {
        return Err(TransitionError::Illegal { from, to });
    }
    if attempts >= max_attempts && to != RunStatus::Failed {
        return Err(TransitionError::BudgetExhausted {
            from,
            to,
            attempts,
            max: max_attempts,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunStatus::{Applying, Completed, Failed, Initialized, Planning, Publishing, Validating};

    #[test]
    fn happy_path_edges_are_legal() {
        let path = [
            Initialized,
            Planning,
            Applying,
            Validating,
            Publishing,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(is_edge(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn retry_back_edge_is_the_only_cycle() {
        assert!(is_edge(Validating, Applying));
        assert!(!is_edge(Applying, Planning));
        assert!(!is_edge(Publishing, Applying));
        assert!(!is_edge(Validating, Planning));
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for to in [Planning, Applying, Failed, Completed] {
            assert!(!is_edge(Completed, to));
            assert!(!is_edge(Failed, to));
        }
    }

    #[test]
    fn exhausted_budget_only_allows_failed() {
        let err = check_transition(Validating, Applying, 3, 3).expect_err("exhausted");
        assert!(matches!(err, TransitionError::BudgetExhausted { .. }));
        check_transition(Validating, Failed, 3, 3).expect("failed is always reachable");
        check_transition(Validating, Applying, 2, 3).expect("retry within budget");
    }

    #[test]
    fn skipping_stages_is_rejected() {
        let err = check_transition(Planning, Validating, 0, 3).expect_err("skip");
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: Planning,
                to: Validating
            }
        );
    }
}
