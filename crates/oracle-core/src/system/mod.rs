//! # System Module
//!
//! Stage definitions and the static stage configuration table.
//!
//! The table is pure data: it is built once (defaults or a loaded file),
//! validated, and then only read. All movement between stages is decided by
//! the evaluator and written by the oracle's transition applier.

mod stage;

pub use stage::*;
