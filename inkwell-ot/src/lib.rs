//! # inkwell-ot — Operational transformation for plain text
//!
//! Pure functions over three operation kinds. No state, no I/O.
//!
//! ```text
//!   Operation::{Insert, Delete, Retain}
//!        │
//!        ├── apply_operation()      content × op → content
//!        ├── transform_operation()  op × concurrent op → rebased op
//!        ├── compose_operations()   op × next op → op | cancelled
//!        └── check_conflict()       op × concurrent op → bool
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — Operation type, constructors, application
//! - [`transform`] — Inclusion transformation and conflict detection
//! - [`compose`] — Same-author composition

pub mod operation;
pub mod transform;
pub mod compose;

pub use operation::{apply_operation, char_len, OpKind, Operation, OtError};
pub use transform::{check_conflict, transform_operation, transform_pair, transform_with_priority, Priority};
pub use compose::compose_operations;
