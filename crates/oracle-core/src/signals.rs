//! # Capacity Signals
//!
//! Per-user measurements that drive stage eligibility.
//!
//! A `CapacitySignals` value is a snapshot: the capacity store produces a new
//! one after every measured turn and keeps the old ones as history. Nothing in
//! the engine mutates a snapshot after it has been recorded.

use crate::Level;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// DEFAULT LEVELS
// =============================================================================

/// Trust assumed for a user with no recorded signals.
pub const DEFAULT_TRUST: Level = Level::new(200);

/// Engagement depth assumed for a user with no recorded signals.
pub const DEFAULT_ENGAGEMENT: Level = Level::new(300);

/// Integration skill assumed for a user with no recorded signals.
pub const DEFAULT_INTEGRATION: Level = Level::new(100);

/// Model confidence assumed for a user with no recorded signals.
pub const DEFAULT_CONFIDENCE: Level = Level::new(300);

/// Confidence reported by the fail-safe signal set.
pub const FALLBACK_CONFIDENCE: Level = Level::new(100);

// =============================================================================
// TRAJECTORY
// =============================================================================

/// Direction of recent signal movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trajectory {
    Building,
    Stable,
    Volatile,
}

impl Trajectory {
    /// Stable machine name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Trajectory::Building => "building",
            Trajectory::Stable => "stable",
            Trajectory::Volatile => "volatile",
        }
    }
}

impl std::fmt::Display for Trajectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SIGNAL KIND
// =============================================================================

/// The tracked scalar signals that rules can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Trust,
    EngagementDepth,
    IntegrationSkill,
}

impl SignalKind {
    /// All tracked signals, in rule-evaluation order.
    pub const ALL: [SignalKind; 3] = [
        SignalKind::Trust,
        SignalKind::EngagementDepth,
        SignalKind::IntegrationSkill,
    ];

    /// Stable machine name, used in transition triggers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Trust => "trust",
            SignalKind::EngagementDepth => "engagement_depth",
            SignalKind::IntegrationSkill => "integration_skill",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CAPACITY SIGNALS
// =============================================================================

/// One measurement of a user's capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySignals {
    pub trust: Level,
    pub engagement_depth: Level,
    pub integration_skill: Level,
    /// Set when an immediate protective override is required.
    pub safety_flag: bool,
    /// How much the measurer trusts its own reading.
    pub confidence_level: Level,
    pub trajectory: Trajectory,
    pub session_count: u32,
    pub last_updated: DateTime<Utc>,
}

impl CapacitySignals {
    /// Conservative signals for a user the store knows nothing about.
    #[must_use]
    pub fn conservative(now: DateTime<Utc>) -> Self {
        Self {
            trust: DEFAULT_TRUST,
            engagement_depth: DEFAULT_ENGAGEMENT,
            integration_skill: DEFAULT_INTEGRATION,
            safety_flag: false,
            confidence_level: DEFAULT_CONFIDENCE,
            trajectory: Trajectory::Building,
            session_count: 0,
            last_updated: now,
        }
    }

    /// Flagged, low-confidence signals used by the fail-safe session.
    #[must_use]
    pub fn fail_safe(now: DateTime<Utc>) -> Self {
        Self {
            safety_flag: true,
            confidence_level: FALLBACK_CONFIDENCE,
            ..Self::conservative(now)
        }
    }

    /// Read one tracked signal.
    #[must_use]
    pub fn get(&self, kind: SignalKind) -> Level {
        match kind {
            SignalKind::Trust => self.trust,
            SignalKind::EngagementDepth => self.engagement_depth,
            SignalKind::IntegrationSkill => self.integration_skill,
        }
    }

    /// Mean of the three tracked signals.
    #[must_use]
    pub fn composite(&self) -> Level {
        let sum = u32::from(self.trust.permille())
            .saturating_add(u32::from(self.engagement_depth.permille()))
            .saturating_add(u32::from(self.integration_skill.permille()));
        Level::new((sum / 3) as u16)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    #[test]
    fn conservative_defaults() {
        let signals = CapacitySignals::conservative(epoch());
        assert_eq!(signals.trust, Level::new(200));
        assert_eq!(signals.engagement_depth, Level::new(300));
        assert_eq!(signals.integration_skill, Level::new(100));
        assert_eq!(signals.confidence_level, Level::new(300));
        assert_eq!(signals.trajectory, Trajectory::Building);
        assert!(!signals.safety_flag);
    }

    #[test]
    fn fail_safe_is_flagged() {
        let signals = CapacitySignals::fail_safe(epoch());
        assert!(signals.safety_flag);
        assert_eq!(signals.confidence_level, FALLBACK_CONFIDENCE);
    }

    #[test]
    fn composite_is_mean() {
        let mut signals = CapacitySignals::conservative(epoch());
        signals.trust = Level::new(600);
        signals.engagement_depth = Level::new(300);
        signals.integration_skill = Level::new(0);
        assert_eq!(signals.composite(), Level::new(300));
    }

    #[test]
    fn get_reads_each_signal() {
        let signals = CapacitySignals::conservative(epoch());
        assert_eq!(signals.get(SignalKind::Trust), DEFAULT_TRUST);
        assert_eq!(signals.get(SignalKind::EngagementDepth), DEFAULT_ENGAGEMENT);
        assert_eq!(signals.get(SignalKind::IntegrationSkill), DEFAULT_INTEGRATION);
    }
}
