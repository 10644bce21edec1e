//! # Session Module
//!
//! The runtime aggregate binding a user and a session to a stage.
//!
//! - A session is created by the initializer and mutated every turn
//! - `current_stage` is only written through [`PersonalOracleSession::apply_transition`]
//! - The stage configuration is never copied into the session; it is looked
//!   up in the `StageTable` by `current_stage`, so the two cannot disagree

use crate::signals::CapacitySignals;
use crate::system::{Stage, StageConfiguration, StageTable};
use crate::{AgentId, SessionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// STAGE TRANSITION
// =============================================================================

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// One stage up.
    Upgrade,
    /// One stage down after a signal fell below its floor.
    Downgrade,
    /// Straight to the lowest stage on a safety flag.
    SafetyCollapse,
}

impl TransitionKind {
    /// Whether this transition moved the user down.
    #[must_use]
    pub fn is_downgrade(&self) -> bool {
        matches!(self, TransitionKind::Downgrade | TransitionKind::SafetyCollapse)
    }
}

/// Immutable record of a stage change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from_stage: Stage,
    pub to_stage: Stage,
    pub timestamp: DateTime<Utc>,
    /// Reason string, e.g. `safety_trigger` or `capacity_decline:trust`.
    pub trigger: String,
    pub kind: TransitionKind,
    /// Signals at the moment of the decision.
    pub signals: CapacitySignals,
    /// Whether the user is told about the change.
    pub user_notified: bool,
}

// =============================================================================
// SESSION
// =============================================================================

/// A live conversational session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalOracleSession {
    pub user_id: UserId,
    pub session_id: SessionId,
    current_stage: Stage,
    stage_history: Vec<StageTransition>,
    pub signals: CapacitySignals,
    pub agent_id: AgentId,
    pub turn_count: u32,
    /// Turns since the last transition (or since start).
    pub turns_in_stage: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl PersonalOracleSession {
    /// Create a session at its initial stage.
    #[must_use]
    pub fn new(
        user_id: UserId,
        session_id: SessionId,
        stage: Stage,
        signals: CapacitySignals,
        agent_id: AgentId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            session_id,
            current_stage: stage,
            stage_history: Vec::new(),
            signals,
            agent_id,
            turn_count: 0,
            turns_in_stage: 0,
            started_at: now,
            last_activity: now,
        }
    }

    /// The stage this session is served at.
    #[must_use]
    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    /// Transitions applied during this session, oldest first.
    #[must_use]
    pub fn stage_history(&self) -> &[StageTransition] {
        &self.stage_history
    }

    /// Configuration for the current stage.
    #[must_use]
    pub fn configuration<'a>(&self, table: &'a StageTable) -> &'a StageConfiguration {
        table.get(self.current_stage)
    }

    /// Record a transition and move to its target stage.
    pub fn apply_transition(&mut self, transition: StageTransition) {
        self.current_stage = transition.to_stage;
        self.turns_in_stage = 0;
        self.stage_history.push(transition);
    }

    /// Bookkeeping for a completed turn.
    pub fn record_turn(&mut self, now: DateTime<Utc>) {
        self.turn_count = self.turn_count.saturating_add(1);
        self.turns_in_stage = self.turns_in_stage.saturating_add(1);
        self.last_activity = now;
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(stage: Stage) -> PersonalOracleSession {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        PersonalOracleSession::new(
            UserId::new("u1"),
            SessionId::new("s1"),
            stage,
            CapacitySignals::conservative(now),
            AgentId::new("maya"),
            now,
        )
    }

    fn transition(from: Stage, to: Stage, kind: TransitionKind) -> StageTransition {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        StageTransition {
            from_stage: from,
            to_stage: to,
            timestamp: now,
            trigger: "test".to_string(),
            kind,
            signals: CapacitySignals::conservative(now),
            user_notified: false,
        }
    }

    #[test]
    fn current_stage_follows_last_transition() {
        let mut session = make_session(Stage::DialogicalCompanion);
        assert!(session.stage_history().is_empty());

        session.apply_transition(transition(
            Stage::DialogicalCompanion,
            Stage::CoCreativePartner,
            TransitionKind::Upgrade,
        ));
        session.apply_transition(transition(
            Stage::CoCreativePartner,
            Stage::StructuredGuide,
            TransitionKind::SafetyCollapse,
        ));

        assert_eq!(session.current_stage(), Stage::StructuredGuide);
        assert_eq!(
            session.stage_history().last().map(|t| t.to_stage),
            Some(session.current_stage())
        );
    }

    #[test]
    fn transition_resets_turns_in_stage() {
        let mut session = make_session(Stage::StructuredGuide);
        session.record_turn(DateTime::<Utc>::UNIX_EPOCH);
        session.record_turn(DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(session.turns_in_stage, 2);

        session.apply_transition(transition(
            Stage::StructuredGuide,
            Stage::DialogicalCompanion,
            TransitionKind::Upgrade,
        ));
        assert_eq!(session.turns_in_stage, 0);
        assert_eq!(session.turn_count, 2);
    }

    #[test]
    fn configuration_matches_stage() {
        let table = StageTable::default();
        let session = make_session(Stage::CoCreativePartner);
        assert_eq!(
            session.configuration(&table),
            table.get(Stage::CoCreativePartner)
        );
    }

    #[test]
    fn downgrade_kinds() {
        assert!(TransitionKind::SafetyCollapse.is_downgrade());
        assert!(TransitionKind::Downgrade.is_downgrade());
        assert!(!TransitionKind::Upgrade.is_downgrade());
    }
}
