//! Text operations and their application to a buffer.
//!
//! Positions and counts are measured in Unicode scalar values (`char`s),
//! never bytes, so a position computed by one replica means the same thing
//! on every other replica regardless of how the text is encoded in memory.

use serde::{Deserialize, Serialize};

/// A single edit against a plain-text buffer.
///
/// `position` is always expressed in the coordinate space of the content
/// *before* the operation is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Splice `chars` into the buffer at `position`.
    Insert { position: usize, chars: String },
    /// Remove `count` characters starting at `position`.
    Delete { position: usize, count: usize },
    /// Overwrite the `len(chars)` span at `position` with `chars`.
    ///
    /// Only produced by composition; never transformed against remote edits.
    Retain { position: usize, chars: String },
}

/// Discriminant of an [`Operation`], used in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Delete,
    Retain,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Insert => write!(f, "insert"),
            OpKind::Delete => write!(f, "delete"),
            OpKind::Retain => write!(f, "retain"),
        }
    }
}

/// Errors raised by the operation algebra.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// Operation position lies past the end of the buffer at apply time.
    OutOfRange { position: usize, len: usize },
    /// A retain reached a transform path.
    UnsupportedTransform { op: OpKind, against: OpKind },
    /// Operation shape is invalid (e.g. a zero-length delete from a client).
    InvalidOperation(String),
    /// No single operation is equivalent to the composed pair.
    Uncomposable { first: OpKind, second: OpKind },
}

impl std::fmt::Display for OtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange { position, len } => {
                write!(f, "Position {position} out of range for buffer of length {len}")
            }
            Self::UnsupportedTransform { op, against } => {
                write!(f, "Cannot transform {op} against {against}")
            }
            Self::InvalidOperation(reason) => write!(f, "Invalid operation: {reason}"),
            Self::Uncomposable { first, second } => {
                write!(f, "No single operation is equivalent to {first} followed by {second}")
            }
        }
    }
}

impl std::error::Error for OtError {}

impl Operation {
    /// Create an insert. Any position is accepted; bounds are checked on apply.
    pub fn insert(position: usize, chars: impl Into<String>) -> Self {
        Operation::Insert {
            position,
            chars: chars.into(),
        }
    }

    /// Create a delete of `count >= 1` characters.
    pub fn delete(position: usize, count: usize) -> Result<Self, OtError> {
        if count == 0 {
            return Err(OtError::InvalidOperation(
                "delete count must be at least 1".to_string(),
            ));
        }
        Ok(Operation::Delete { position, count })
    }

    /// Create a retain (localized overwrite).
    pub fn retain(position: usize, chars: impl Into<String>) -> Self {
        Operation::Retain {
            position,
            chars: chars.into(),
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Insert { .. } => OpKind::Insert,
            Operation::Delete { .. } => OpKind::Delete,
            Operation::Retain { .. } => OpKind::Retain,
        }
    }

    pub fn position(&self) -> usize {
        match self {
            Operation::Insert { position, .. }
            | Operation::Delete { position, .. }
            | Operation::Retain { position, .. } => *position,
        }
    }

    /// True for operations that leave every buffer unchanged.
    ///
    /// Transformation can shrink a delete to zero characters when a
    /// concurrent delete already removed its whole range.
    pub fn is_noop(&self) -> bool {
        match self {
            Operation::Insert { chars, .. } => chars.is_empty(),
            Operation::Delete { count, .. } => *count == 0,
            Operation::Retain { .. } => false,
        }
    }

    /// Validate an operation received from a client.
    ///
    /// Clients may not submit empty edits or retains; retains only arise
    /// from local composition.
    pub fn validate(&self) -> Result<(), OtError> {
        match self {
            Operation::Insert { chars, .. } if chars.is_empty() => Err(
                OtError::InvalidOperation("insert must carry at least one character".to_string()),
            ),
            Operation::Delete { count: 0, .. } => Err(OtError::InvalidOperation(
                "delete count must be at least 1".to_string(),
            )),
            Operation::Retain { .. } => Err(OtError::InvalidOperation(
                "retain is not accepted from clients".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Length of `s` in characters.
#[inline]
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `char_pos`-th character, or `None` past the end.
/// `char_pos == char_len(s)` maps to `s.len()`.
fn byte_offset(s: &str, char_pos: usize) -> Option<usize> {
    s.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(s.len()))
        .nth(char_pos)
}

fn start_offset(content: &str, position: usize) -> Result<usize, OtError> {
    byte_offset(content, position).ok_or_else(|| OtError::OutOfRange {
        position,
        len: char_len(content),
    })
}

/// Apply `op` to `content`, producing the new content.
///
/// - Insert past the end fails with [`OtError::OutOfRange`].
/// - Delete truncates at the end of the buffer; only its start is checked.
/// - Retain overwrites up to the end of the buffer and appends the rest.
pub fn apply_operation(content: &str, op: &Operation) -> Result<String, OtError> {
    match op {
        Operation::Insert { position, chars } => {
            let at = start_offset(content, *position)?;
            let mut out = String::with_capacity(content.len() + chars.len());
            out.push_str(&content[..at]);
            out.push_str(chars);
            out.push_str(&content[at..]);
            Ok(out)
        }
        Operation::Delete { position, count } => {
            let start = start_offset(content, *position)?;
            let end = byte_offset(&content[start..], *count)
                .map_or(content.len(), |off| start + off);
            let mut out = String::with_capacity(content.len() - (end - start));
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            Ok(out)
        }
        Operation::Retain { position, chars } => {
            let start = start_offset(content, *position)?;
            let end = byte_offset(&content[start..], char_len(chars))
                .map_or(content.len(), |off| start + off);
            let mut out = String::with_capacity(content.len() + chars.len());
            out.push_str(&content[..start]);
            out.push_str(chars);
            out.push_str(&content[end..]);
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_middle() {
        let out = apply_operation("held", &Operation::insert(2, "l")).unwrap();
        assert_eq!(out, "helld");
    }

    #[test]
    fn test_insert_at_end() {
        let out = apply_operation("ab", &Operation::insert(2, "cd")).unwrap();
        assert_eq!(out, "abcd");
    }

    #[test]
    fn test_insert_out_of_range() {
        let err = apply_operation("ab", &Operation::insert(3, "x")).unwrap_err();
        assert_eq!(err, OtError::OutOfRange { position: 3, len: 2 });
    }

    #[test]
    fn test_delete_whole_buffer() {
        let out = apply_operation("test", &Operation::delete(0, 4).unwrap()).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn test_delete_truncates_at_tail() {
        let out = apply_operation("hello", &Operation::delete(3, 10).unwrap()).unwrap();
        assert_eq!(out, "hel");
    }

    #[test]
    fn test_delete_at_end_is_empty() {
        let out = apply_operation("abc", &Operation::delete(3, 2).unwrap()).unwrap();
        assert_eq!(out, "abc");
    }

    #[test]
    fn test_delete_start_out_of_range() {
        let err = apply_operation("abc", &Operation::delete(4, 1).unwrap()).unwrap_err();
        assert_eq!(err, OtError::OutOfRange { position: 4, len: 3 });
    }

    #[test]
    fn test_retain_overwrites_span() {
        let out = apply_operation("abcdef", &Operation::retain(1, "XY")).unwrap();
        assert_eq!(out, "aXYdef");
    }

    #[test]
    fn test_retain_extends_past_end() {
        let out = apply_operation("abc", &Operation::retain(2, "XYZ")).unwrap();
        assert_eq!(out, "abXYZ");
    }

    #[test]
    fn test_multibyte_positions_are_chars() {
        // 'é' and '世' are multi-byte in UTF-8; positions count characters.
        let out = apply_operation("é世界", &Operation::insert(2, "!")).unwrap();
        assert_eq!(out, "é世!界");

        let out = apply_operation("é世界", &Operation::delete(1, 1).unwrap()).unwrap();
        assert_eq!(out, "é界");
    }

    #[test]
    fn test_zero_delete_rejected() {
        assert!(matches!(
            Operation::delete(0, 0),
            Err(OtError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_validate_client_ops() {
        assert!(Operation::insert(0, "a").validate().is_ok());
        assert!(Operation::insert(0, "").validate().is_err());
        assert!(Operation::Delete { position: 0, count: 0 }.validate().is_err());
        assert!(Operation::retain(0, "a").validate().is_err());
    }

    #[test]
    fn test_noop_detection() {
        assert!(Operation::Delete { position: 3, count: 0 }.is_noop());
        assert!(Operation::insert(1, "").is_noop());
        assert!(!Operation::insert(1, "a").is_noop());

        let out = apply_operation("abc", &Operation::Delete { position: 1, count: 0 }).unwrap();
        assert_eq!(out, "abc");
    }

    #[test]
    fn test_json_shape() {
        let op = Operation::insert(5, "hi");
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"insert":{"position":5,"chars":"hi"}}"#);
    }
}
