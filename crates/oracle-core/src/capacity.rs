//! # Capacity Assessment
//!
//! The capacity store owns per-user signals. The oracle only consumes its
//! outputs through the [`CapacityStore`] trait.
//!
//! [`InMemoryCapacityStore`] is the reference implementation:
//! - a [`TurnObservation`] is derived from the turn text by marker matching
//! - the observation is blended into the prior signals with an integer EMA
//! - confidence grows with the number of measurements
//! - trajectory is read from the last three composite scores

use crate::primitives::{
    BUILDING_RISE, CONFIDENCE_BASE, CONFIDENCE_STEP, DEFAULT_BLEND_RATE, MAX_SIGNAL_HISTORY,
    VOLATILITY_SWING,
};
use crate::signals::{CapacitySignals, SignalKind, Trajectory};
use crate::system::{Stage, StageTable};
use crate::{Level, OracleError, SessionId, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// MARKERS
// =============================================================================

/// Phrases that indicate the user may be at risk.
const CRISIS_MARKERS: &[&str] = &[
    "kill myself",
    "end my life",
    "suicide",
    "hurt myself",
    "self harm",
    "can't go on",
    "cannot go on",
    "want to die",
    "no reason to live",
];

/// Phrases that indicate self-disclosure, read as growing trust.
const DISCLOSURE_MARKERS: &[&str] = &[
    "i feel",
    "honestly",
    "i'm afraid",
    "i am afraid",
    "i've never told",
    "to be honest",
    "i trust",
];

/// Phrases that indicate withdrawal or distrust.
const DISTRUST_MARKERS: &[&str] = &[
    "you don't understand",
    "this is pointless",
    "leave me alone",
    "i don't trust",
    "whatever",
];

/// Phrases that indicate reflective integration.
const REFLECTIVE_MARKERS: &[&str] = &[
    "i notice",
    "i realize",
    "i realise",
    "i learned",
    "looking back",
    "i see now",
    "pattern",
    "makes sense",
];

// =============================================================================
// OBSERVATION
// =============================================================================

/// Levels supplied by the host, overriding derived observations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedLevels {
    #[serde(default)]
    pub trust: Option<Level>,
    #[serde(default)]
    pub engagement_depth: Option<Level>,
    #[serde(default)]
    pub integration_skill: Option<Level>,
    #[serde(default)]
    pub safety_flag: Option<bool>,
}

/// Everything the store needs to measure one turn.
#[derive(Debug, Clone)]
pub struct SessionData {
    pub input: String,
    pub turn_count: u32,
    pub observed: ObservedLevels,
    /// An external safety alert is pending for this user.
    pub external_alert: bool,
    pub now: DateTime<Utc>,
}

/// Raw readings taken from a single turn, before blending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnObservation {
    pub trust: Level,
    pub engagement_depth: Level,
    pub integration_skill: Level,
    pub crisis: bool,
}

impl TurnObservation {
    /// Derive readings from turn text.
    #[must_use]
    pub fn from_input(input: &str) -> Self {
        let lowered = input.to_lowercase();
        let contains_any = |markers: &[&str]| markers.iter().any(|m| lowered.contains(m));

        let trust = if contains_any(DISTRUST_MARKERS) {
            Level::new(100)
        } else if contains_any(DISCLOSURE_MARKERS) {
            Level::new(900)
        } else {
            Level::new(600)
        };

        let words = lowered.split_whitespace().count();
        let engagement_depth = Level::new(words.saturating_mul(25).min(1000) as u16);

        let reflective = REFLECTIVE_MARKERS
            .iter()
            .filter(|m| lowered.contains(*m))
            .count();
        let integration_skill = Level::new(150u16.saturating_add((reflective as u16).saturating_mul(250)));

        Self {
            trust,
            engagement_depth,
            integration_skill,
            crisis: contains_any(CRISIS_MARKERS),
        }
    }

    /// Apply host-supplied overrides.
    #[must_use]
    pub fn with_overrides(self, observed: &ObservedLevels) -> Self {
        Self {
            trust: observed.trust.unwrap_or(self.trust),
            engagement_depth: observed.engagement_depth.unwrap_or(self.engagement_depth),
            integration_skill: observed.integration_skill.unwrap_or(self.integration_skill),
            crisis: observed.safety_flag.unwrap_or(self.crisis),
        }
    }
}

// =============================================================================
// EXPLANATION
// =============================================================================

/// Human-readable reading of a signal set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalExplanation {
    pub composite: Level,
    pub trajectory: Trajectory,
    pub lines: Vec<String>,
}

fn band(level: Level) -> &'static str {
    match level.permille() {
        0..300 => "low",
        300..600 => "moderate",
        600..800 => "strong",
        _ => "very strong",
    }
}

// =============================================================================
// STORE TRAIT
// =============================================================================

/// Owner of per-user capacity signals.
pub trait CapacityStore: Send + Sync {
    /// Latest signals for a user, if any were recorded.
    fn current_signals(&self, user: &UserId) -> Result<Option<CapacitySignals>, OracleError>;

    /// Measure a turn and record the resulting signals.
    fn measure(
        &mut self,
        user: &UserId,
        session: &SessionId,
        data: &SessionData,
    ) -> Result<CapacitySignals, OracleError>;

    /// Snapshots recorded within the last `days` days, oldest first.
    fn signal_history(
        &self,
        user: &UserId,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<CapacitySignals>, OracleError>;

    /// Stage the user's current signals classify into.
    fn determine_stage(&self, user: &UserId, table: &StageTable) -> Result<Stage, OracleError> {
        Ok(self
            .current_signals(user)?
            .map(|signals| table.classify(&signals))
            .unwrap_or(Stage::lowest()))
    }

    /// Describe a signal set in plain words.
    fn explain_signals(&self, signals: &CapacitySignals) -> SignalExplanation {
        let mut lines: Vec<String> = SignalKind::ALL
            .into_iter()
            .map(|kind| {
                let level = signals.get(kind);
                format!("{}: {} ({})", kind, level, band(level))
            })
            .collect();
        lines.push(format!(
            "confidence_level: {} ({})",
            signals.confidence_level,
            band(signals.confidence_level)
        ));
        lines.push(format!("trajectory: {}", signals.trajectory));
        if signals.safety_flag {
            lines.push("safety_flag: set, protective override active".to_string());
        }
        SignalExplanation {
            composite: signals.composite(),
            trajectory: signals.trajectory,
            lines,
        }
    }
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// Reference capacity store keeping every snapshot in memory.
#[derive(Debug, Default)]
pub struct InMemoryCapacityStore {
    blend_rate: Level,
    history: BTreeMap<UserId, Vec<CapacitySignals>>,
    sessions_seen: BTreeMap<UserId, BTreeSet<SessionId>>,
}

impl InMemoryCapacityStore {
    /// Create a store with the default blend rate.
    #[must_use]
    pub fn new() -> Self {
        Self::with_blend_rate(DEFAULT_BLEND_RATE)
    }

    /// Create a store with a custom blend rate.
    #[must_use]
    pub fn with_blend_rate(blend_rate: Level) -> Self {
        Self {
            blend_rate,
            history: BTreeMap::new(),
            sessions_seen: BTreeMap::new(),
        }
    }

    /// Record signals directly, bypassing measurement.
    ///
    /// Used to seed users imported from another system.
    pub fn seed(&mut self, user: &UserId, signals: CapacitySignals) {
        let entries = self.history.entry(user.clone()).or_default();
        entries.push(signals);
        if entries.len() > MAX_SIGNAL_HISTORY {
            entries.remove(0);
        }
    }

    fn trajectory(previous: &[CapacitySignals], latest: Level) -> Trajectory {
        let [.., a, b] = previous else {
            return Trajectory::Building;
        };
        let c0 = i32::from(a.composite().permille());
        let c1 = i32::from(b.composite().permille());
        let c2 = i32::from(latest.permille());
        let d1 = c1 - c0;
        let d2 = c2 - c1;
        let swing = i32::from(VOLATILITY_SWING);

        if d1.signum() * d2.signum() < 0 && d1.abs() >= swing && d2.abs() >= swing {
            Trajectory::Volatile
        } else if c2 - c0 >= i32::from(BUILDING_RISE) {
            Trajectory::Building
        } else {
            Trajectory::Stable
        }
    }
}

impl CapacityStore for InMemoryCapacityStore {
    fn current_signals(&self, user: &UserId) -> Result<Option<CapacitySignals>, OracleError> {
        Ok(self
            .history
            .get(user)
            .and_then(|entries| entries.last())
            .cloned())
    }

    fn measure(
        &mut self,
        user: &UserId,
        session: &SessionId,
        data: &SessionData,
    ) -> Result<CapacitySignals, OracleError> {
        let observation = TurnObservation::from_input(&data.input).with_overrides(&data.observed);
        let prior = self
            .current_signals(user)?
            .unwrap_or_else(|| CapacitySignals::conservative(data.now));

        let seen = self.sessions_seen.entry(user.clone()).or_default();
        seen.insert(session.clone());
        let session_count = seen.len() as u32;

        let previous = self.history.get(user).map(Vec::as_slice).unwrap_or(&[]);
        let measurements = previous.len().saturating_add(1) as u16;

        let mut signals = CapacitySignals {
            trust: prior.trust.blend(observation.trust, self.blend_rate),
            engagement_depth: prior
                .engagement_depth
                .blend(observation.engagement_depth, self.blend_rate),
            integration_skill: prior
                .integration_skill
                .blend(observation.integration_skill, self.blend_rate),
            safety_flag: observation.crisis || data.external_alert,
            confidence_level: Level::new(
                CONFIDENCE_BASE.saturating_add(CONFIDENCE_STEP.saturating_mul(measurements)),
            ),
            trajectory: Trajectory::Building,
            session_count,
            last_updated: data.now,
        };
        signals.trajectory = Self::trajectory(previous, signals.composite());

        self.seed(user, signals.clone());
        Ok(signals)
    }

    fn signal_history(
        &self,
        user: &UserId,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<CapacitySignals>, OracleError> {
        let since = now - Duration::days(i64::from(days));
        Ok(self
            .history
            .get(user)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|s| s.last_updated >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// =============================================================================
// TESTS
// =============================================================================
