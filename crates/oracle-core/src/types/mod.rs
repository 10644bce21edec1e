//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the Oracle engine:
//! - Identifiers (`UserId`, `SessionId`, `AgentId`)
//! - The per-mille scalar `Level` used for every 0–1 measurement
//! - Error types (`OracleError`)
//!
//! ## Determinism Guarantees
//!
//! All types in this module:
//! - Use integer arithmetic only (no floating-point)
//! - Implement `Ord` for deterministic ordering in `BTreeMap`/`BTreeSet`
//! - Use saturating arithmetic so no level ever leaves `0..=1000`

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identifier of an end user across sessions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user id.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a single conversational session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a new session id.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a conversational agent in the registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Create a new agent id.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// LEVEL (per-mille scalar)
// =============================================================================

/// A 0–1 measurement stored as parts per thousand.
///
/// `Level::new(400)` is the value written as `0.4` elsewhere. Construction
/// clamps to `0..=1000`, so a `Level` is always in range.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(from = "u16", into = "u16")]
pub struct Level(u16);

impl Level {
    /// Zero.
    pub const MIN: Level = Level(0);

    /// One (1000‰).
    pub const MAX: Level = Level(1000);

    /// Create a level, clamping to `0..=1000`.
    #[must_use]
    pub const fn new(permille: u16) -> Self {
        if permille > 1000 {
            Self(1000)
        } else {
            Self(permille)
        }
    }

    /// Raw per-mille value.
    #[must_use]
    pub const fn permille(self) -> u16 {
        self.0
    }

    /// Exponential moving average step toward `observed`.
    ///
    /// `rate` is the weight of the new observation in per-mille.
    #[must_use]
    pub fn blend(self, observed: Level, rate: Level) -> Level {
        let rate = u32::from(rate.0);
        let prior = u32::from(self.0).saturating_mul(1000u32.saturating_sub(rate));
        let fresh = u32::from(observed.0).saturating_mul(rate);
        Level::new((prior.saturating_add(fresh) / 1000) as u16)
    }

    /// Saturating addition (clamped at 1000).
    #[must_use]
    pub fn saturating_add(self, other: Level) -> Level {
        Level::new(self.0.saturating_add(other.0))
    }

    /// Saturating subtraction (clamped at 0).
    #[must_use]
    pub fn saturating_sub(self, other: Level) -> Level {
        Level(self.0.saturating_sub(other.0))
    }

    /// Absolute distance between two levels.
    #[must_use]
    pub fn abs_diff(self, other: Level) -> u16 {
        self.0.abs_diff(other.0)
    }
}

impl From<u16> for Level {
    fn from(value: u16) -> Self {
        Level::new(value)
    }
}

impl From<Level> for u16 {
    fn from(level: Level) -> Self {
        level.0
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:03}", self.0 / 1000, self.0 % 1000)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur inside the Oracle engine.
///
/// Internal operations return `Result<T, OracleError>`. The two public
/// boundaries (`Oracle::initialize_session`, `Oracle::generate_response`)
/// absorb these into fallbacks; everything else propagates them.
#[derive(Debug, Error)]
pub enum OracleError {
    /// No live session exists for the given id.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// The agent id is not present in the registry.
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// A registered agent failed to produce a reply.
    #[error("Agent failure: {0}")]
    Agent(#[from] crate::agent::AgentError),

    /// A storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A configuration value is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Caller input was rejected before reaching the engine.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// File or socket I/O failed outside the storage backends.
    #[error("I/O error: {0}")]
    Io(String),
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_clamps_on_construction() {
        assert_eq!(Level::new(1500), Level::MAX);
        assert_eq!(Level::from(2000u16).permille(), 1000);
        assert_eq!(Level::new(400).permille(), 400);
    }

    #[test]
    fn level_blend_moves_toward_observation() {
        let prior = Level::new(200);
        let blended = prior.blend(Level::new(800), Level::new(500));
        assert_eq!(blended, Level::new(500));

        // Rate zero keeps the prior, rate one takes the observation.
        assert_eq!(prior.blend(Level::new(800), Level::MIN), prior);
        assert_eq!(prior.blend(Level::new(800), Level::MAX), Level::new(800));
    }

    #[test]
    fn level_saturating_ops() {
        assert_eq!(Level::new(900).saturating_add(Level::new(300)), Level::MAX);
        assert_eq!(Level::new(100).saturating_sub(Level::new(300)), Level::MIN);
        assert_eq!(Level::new(100).abs_diff(Level::new(300)), 200);
    }

    #[test]
    fn level_display() {
        assert_eq!(Level::new(400).to_string(), "0.400");
        assert_eq!(Level::MAX.to_string(), "1.000");
        assert_eq!(Level::new(5).to_string(), "0.005");
    }

    #[test]
    fn level_deserialization_clamps() {
        let level: Level = serde_json::from_str("4000").expect("parse");
        assert_eq!(level, Level::MAX);
    }

    #[test]
    fn ids_display_raw_string() {
        assert_eq!(UserId::new("u-1").to_string(), "u-1");
        assert_eq!(SessionId::new("s-1").as_str(), "s-1");
        assert_eq!(AgentId::new("maya").to_string(), "maya");
    }
}
