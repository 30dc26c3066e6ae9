//! Composition of two sequential operations by the same author.

use crate::operation::{char_len, OtError, Operation};

/// Collapse `a` followed by `b` into one equivalent operation.
///
/// Returns `Ok(None)` when the pair cancels out. Only adjacent pairings with
/// an exact single-operation equivalent are defined:
///
/// | first  | second | condition                        | result            |
/// |--------|--------|----------------------------------|-------------------|
/// | Insert | Insert | `b` starts where `a` ends        | Insert (concat)   |
/// | Insert | Delete | `b` removes exactly `a`'s span   | `None`            |
/// | Delete | Insert | same position, same length       | Retain(`b.chars`) |
///
/// A Retain overwrites exactly `len(chars)` characters, so Delete then Insert
/// only collapses into one when the deleted count equals that length.
///
/// Every other pairing is a caller error and yields [`OtError::Uncomposable`].
pub fn compose_operations(a: &Operation, b: &Operation) -> Result<Option<Operation>, OtError> {
    match (a, b) {
        (
            Operation::Insert { position, chars },
            Operation::Insert {
                position: next,
                chars: more,
            },
        ) if position.checked_add(char_len(chars)) == Some(*next) => {
            let mut merged = String::with_capacity(chars.len() + more.len());
            merged.push_str(chars);
            merged.push_str(more);
            Ok(Some(Operation::Insert {
                position: *position,
                chars: merged,
            }))
        }

        (Operation::Insert { position, chars }, Operation::Delete { position: at, count })
            if at == position && *count == char_len(chars) =>
        {
            Ok(None)
        }

        (
            Operation::Delete { position, count },
            Operation::Insert {
                position: at,
                chars,
            },
        ) if at == position && *count == char_len(chars) => {
            Ok(Some(Operation::Retain {
                position: *position,
                chars: chars.clone(),
            }))
        }

        _ => Err(OtError::Uncomposable {
            first: a.kind(),
            second: b.kind(),
        }),
    }
}
