//! # Engine Primitives
//!
//! Hardcoded runtime constants for the Oracle engine.
//!
//! These values are compiled into the binary and are immutable at runtime.
//! Anything a deployment may want to tune lives in `OracleSettings` instead.

use crate::Level;

/// Default weight of a new observation when blending signals (0.3).
pub const DEFAULT_BLEND_RATE: Level = Level::new(300);

/// Baseline confidence of a first measurement.
pub const CONFIDENCE_BASE: u16 = 300;

/// Confidence gained per recorded measurement.
pub const CONFIDENCE_STEP: u16 = 70;

/// Composite swing (per-mille) that counts as a direction change for
/// trajectory purposes.
pub const VOLATILITY_SWING: u16 = 100;

/// Net composite rise (per-mille) over the trajectory window that counts as
/// building.
pub const BUILDING_RISE: u16 = 30;

/// Maximum number of signal snapshots kept per user by the in-memory store.
///
/// Older snapshots are dropped first.
pub const MAX_SIGNAL_HISTORY: usize = 1000;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length of a single turn's input text in bytes.
///
/// Longer input is rejected at the API boundary before it reaches the engine.
pub const MAX_INPUT_LENGTH: usize = 16 * 1024;

/// Maximum length of user, session and agent identifiers in bytes.
pub const MAX_ID_LENGTH: usize = 128;

/// Maximum `days` accepted by signal-history queries.
pub const MAX_HISTORY_DAYS: u32 = 365;
