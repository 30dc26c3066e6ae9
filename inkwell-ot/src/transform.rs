//! Inclusion transformation and conflict detection.
//!
//! `transform_operation(a, b)` rebases `a` so that it can be applied after
//! `b`, where both were computed against the same content.
//!
//! ```text
//!            content
//!           /       \
//!        a /         \ b
//!         /           \
//!    content·a     content·b
//!         \           /
//!    T(b,a)\         /T(a,b)
//!           \       /
//!         converged content
//! ```
//!
//! Reference: Ellis & Gibbs — Concurrency Control in Groupware Systems (1989)

use crate::operation::{char_len, OtError, Operation};

/// Who is ordered first when two inserts land on the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// The operation being transformed arrived later: the other insert
    /// stays first and this one shifts right.
    Incoming,
    /// The operation being transformed keeps its place; the other insert
    /// is ordered after it.
    Existing,
}

/// Rebase `a` past a concurrently applied `b`.
///
/// Equal-position inserts resolve in favour of `b` going first, which is the
/// server's order: `b` has already been applied when `a` is transformed.
pub fn transform_operation(a: &Operation, b: &Operation) -> Result<Operation, OtError> {
    transform_with_priority(a, b, Priority::Incoming)
}

/// Rebase `a` past `b` with an explicit tie-break for equal-position inserts.
pub fn transform_with_priority(
    a: &Operation,
    b: &Operation,
    priority: Priority,
) -> Result<Operation, OtError> {
    match (a, b) {
        (
            Operation::Insert { position, chars },
            Operation::Insert {
                position: other,
                chars: other_chars,
            },
        ) => {
            let shift = *other < *position
                || (*other == *position && priority == Priority::Incoming);
            let position = if shift {
                position.saturating_add(char_len(other_chars))
            } else {
                *position
            };
            Ok(Operation::Insert {
                position,
                chars: chars.clone(),
            })
        }

        (
            Operation::Insert { position, chars },
            Operation::Delete {
                position: start,
                count,
            },
        ) => {
            let end = start.saturating_add(*count);
            let position = if end <= *position {
                position - count
            } else if *start < *position {
                // Landed inside the deleted range: clamp to where it began.
                *start
            } else {
                *position
            };
            Ok(Operation::Insert {
                position,
                chars: chars.clone(),
            })
        }

        (
            Operation::Delete { position, count },
            Operation::Insert {
                position: other,
                chars: other_chars,
            },
        ) => {
            let position = if *other <= *position {
                position.saturating_add(char_len(other_chars))
            } else {
                *position
            };
            Ok(Operation::Delete {
                position,
                count: *count,
            })
        }

        (
            Operation::Delete { position, count },
            Operation::Delete {
                position: other,
                count: other_count,
            },
        ) => {
            let end = position.saturating_add(*count);
            let other_end = other.saturating_add(*other_count);

            // Part of the other range lying before our start.
            let before = if *other < *position {
                other_end.min(*position) - other
            } else {
                0
            };
            let overlap = end.min(other_end).saturating_sub((*position).max(*other));

            Ok(Operation::Delete {
                position: position - before,
                count: count - overlap,
            })
        }

        (Operation::Retain { .. }, _) | (_, Operation::Retain { .. }) => {
            Err(OtError::UnsupportedTransform {
                op: a.kind(),
                against: b.kind(),
            })
        }
    }
}

/// Transform two concurrent operations against each other.
///
/// Returns `(a', b')` such that applying `a` then `b'` yields the same
/// content as applying `b` then `a'`. On tied inserts `a` is ordered first.
pub fn transform_pair(a: &Operation, b: &Operation) -> Result<(Operation, Operation), OtError> {
    let a_prime = transform_with_priority(a, b, Priority::Existing)?;
    let b_prime = transform_with_priority(b, a, Priority::Incoming)?;
    Ok((a_prime, b_prime))
}

/// Whether applying both operations without transformation would violate
/// either author's intention. Symmetric in its arguments.
pub fn check_conflict(a: &Operation, b: &Operation) -> bool {
    match (a, b) {
        (Operation::Insert { position: p, .. }, Operation::Insert { position: q, .. }) => p == q,

        (
            Operation::Delete {
                position: p,
                count: n,
            },
            Operation::Delete {
                position: q,
                count: m,
            },
        ) => *p < q.saturating_add(*m) && *q < p.saturating_add(*n),

        (
            Operation::Insert { position: p, .. },
            Operation::Delete {
                position: start,
                count,
            },
        )
        | (
            Operation::Delete {
                position: start,
                count,
            },
            Operation::Insert { position: p, .. },
        ) => *start < *p && *p < start.saturating_add(*count),

        _ => false,
    }
}
