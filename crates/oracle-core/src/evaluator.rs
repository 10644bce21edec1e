//! # Stage-Change Evaluator
//!
//! Decides whether a session should move after a measured turn.
//!
//! ## Rules
//!
//! 1. Downgrades are checked first.
//!    - A set safety flag collapses to the lowest stage (`safety_trigger`)
//!      from any stage, independent of the table's downgrade rules.
//!    - A signal below a floor of the current stage moves one stage down
//!      (`capacity_decline:<signal>`).
//! 2. Upgrade rules are checked only when no downgrade fired. A rule fires
//!    when every threshold and the confidence requirement are met, the safety
//!    flag is clear (if required), and, for sustained rules, the user has no
//!    downgrade inside [`SUSTAINED_WINDOW_DAYS`]. Upgrades move one stage up.
//!
//! At most one transition is decided per evaluation. The evaluator is pure:
//! it never writes, it only returns a [`StageDecision`].

use crate::session::{StageTransition, TransitionKind};
use crate::signals::CapacitySignals;
use crate::system::{Stage, StageTable};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Window, in days, inside which any downgrade blocks a sustained upgrade.
pub const SUSTAINED_WINDOW_DAYS: i64 = 30;

/// Trigger recorded for safety collapses.
pub const SAFETY_TRIGGER: &str = "safety_trigger";

/// Trigger prefix recorded for floor breaches.
pub const DECLINE_TRIGGER: &str = "capacity_decline";

/// Trigger recorded for upgrades.
pub const GROWTH_TRIGGER: &str = "capacity_growth";

// =============================================================================
// DECISION
// =============================================================================

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDecision {
    pub should_change: bool,
    pub current: Stage,
    pub target: Stage,
    pub trigger: String,
    pub kind: Option<TransitionKind>,
}

impl StageDecision {
    fn unchanged(current: Stage) -> Self {
        Self {
            should_change: false,
            current,
            target: current,
            trigger: String::new(),
            kind: None,
        }
    }

    fn change(current: Stage, target: Stage, trigger: String, kind: TransitionKind) -> Self {
        // A rule that lands on the current stage is not a change.
        if target == current {
            return Self::unchanged(current);
        }
        Self {
            should_change: true,
            current,
            target,
            trigger,
            kind: Some(kind),
        }
    }

    /// The transition record for this decision, if it is a change.
    ///
    /// Upgrades are announced to the user; downgrades are applied silently.
    #[must_use]
    pub fn into_transition(
        self,
        signals: &CapacitySignals,
        now: DateTime<Utc>,
    ) -> Option<StageTransition> {
        let kind = self.kind.filter(|_| self.should_change)?;
        Some(StageTransition {
            from_stage: self.current,
            to_stage: self.target,
            timestamp: now,
            trigger: self.trigger,
            kind,
            signals: signals.clone(),
            user_notified: kind == TransitionKind::Upgrade,
        })
    }
}

// =============================================================================
// EVALUATOR
// =============================================================================

/// Evaluates stage-change rules against a stage table.
#[derive(Debug, Clone, Copy)]
pub struct StageEvaluator<'a> {
    table: &'a StageTable,
}

impl<'a> StageEvaluator<'a> {
    /// Create an evaluator over a table.
    #[must_use]
    pub fn new(table: &'a StageTable) -> Self {
        Self { table }
    }

    /// Decide the next stage for `current` given fresh signals.
    ///
    /// `user_history` is the user's full transition history across sessions.
    #[must_use]
    pub fn evaluate(
        &self,
        current: Stage,
        signals: &CapacitySignals,
        user_history: &[StageTransition],
        now: DateTime<Utc>,
    ) -> StageDecision {
        if let Some(decision) = self.check_downgrade(current, signals) {
            return decision;
        }
        self.check_upgrade(current, signals, user_history, now)
            .unwrap_or_else(|| StageDecision::unchanged(current))
    }

    fn check_downgrade(&self, current: Stage, signals: &CapacitySignals) -> Option<StageDecision> {
        // Safety has priority over every floor breach.
        if signals.safety_flag {
            return Some(StageDecision::change(
                current,
                Stage::lowest(),
                SAFETY_TRIGGER.to_string(),
                TransitionKind::SafetyCollapse,
            ));
        }

        let previous = current.previous()?;
        let rules = &self.table.get(current).downgrade_rules;
        rules.iter().find_map(|rule| {
            rule.breached(signals).map(|kind| {
                StageDecision::change(
                    current,
                    previous,
                    format!("{}:{}", DECLINE_TRIGGER, kind),
                    TransitionKind::Downgrade,
                )
            })
        })
    }

    fn check_upgrade(
        &self,
        current: Stage,
        signals: &CapacitySignals,
        user_history: &[StageTransition],
        now: DateTime<Utc>,
    ) -> Option<StageDecision> {
        let next = current.next()?;
        let fires = self.table.get(current).upgrade_rules.iter().any(|rule| {
            rule.satisfied_by(signals)
                && (rule.sustained_sessions.is_none() || !recent_downgrade(user_history, now))
        });

        fires.then(|| {
            StageDecision::change(
                current,
                next,
                GROWTH_TRIGGER.to_string(),
                TransitionKind::Upgrade,
            )
        })
    }
}

/// Whether the user was downgraded inside the sustained window.
#[must_use]
pub fn recent_downgrade(history: &[StageTransition], now: DateTime<Utc>) -> bool {
    let since = now - Duration::days(SUSTAINED_WINDOW_DAYS);
    history
        .iter()
        .any(|t| t.kind.is_downgrade() && t.timestamp >= since)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Level;
    use crate::system::DowngradeRule;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::days(365)
    }

    fn signals(trust: u16, engagement: u16, integration: u16, confidence: u16) -> CapacitySignals {
        let mut s = CapacitySignals::conservative(now());
        s.trust = Level::new(trust);
        s.engagement_depth = Level::new(engagement);
        s.integration_skill = Level::new(integration);
        s.confidence_level = Level::new(confidence);
        s
    }

    fn downgrade_at(timestamp: DateTime<Utc>) -> StageTransition {
        StageTransition {
            from_stage: Stage::CoCreativePartner,
            to_stage: Stage::DialogicalCompanion,
            timestamp,
            trigger: format!("{}:trust", DECLINE_TRIGGER),
            kind: TransitionKind::Downgrade,
            signals: signals(400, 400, 400, 700),
            user_notified: false,
        }
    }

    #[test]
    fn below_threshold_does_not_upgrade() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let decision = evaluator.evaluate(
            Stage::DialogicalCompanion,
            &signals(400, 400, 400, 700),
            &[],
            now(),
        );
        assert!(!decision.should_change);
        assert_eq!(decision.target, Stage::DialogicalCompanion);
    }

    #[test]
    fn safety_flag_collapses_to_lowest() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let mut s = signals(400, 400, 400, 700);
        s.safety_flag = true;

        let decision = evaluator.evaluate(Stage::DialogicalCompanion, &s, &[], now());
        assert!(decision.should_change);
        assert_eq!(decision.target, Stage::StructuredGuide);
        assert!(decision.trigger.contains("safety_trigger"));
        assert_eq!(decision.kind, Some(TransitionKind::SafetyCollapse));
    }

    #[test]
    fn safety_flag_beats_floor_breach() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let mut s = signals(0, 0, 0, 0);
        s.safety_flag = true;

        let decision = evaluator.evaluate(Stage::TransparentPrism, &s, &[], now());
        assert_eq!(decision.target, Stage::StructuredGuide);
        assert_eq!(decision.kind, Some(TransitionKind::SafetyCollapse));
    }

    #[test]
    fn safety_flag_collapses_without_downgrade_rules() {
        let mut table = StageTable::default();
        table.dialogical_companion.downgrade_rules = vec![DowngradeRule {
            trust_floor: Some(Level::new(300)),
            ..DowngradeRule::default()
        }];
        table.transparent_prism.downgrade_rules.clear();
        assert!(table.validate().is_ok());

        let evaluator = StageEvaluator::new(&table);
        let mut s = signals(900, 900, 900, 900);
        s.safety_flag = true;

        for stage in [Stage::DialogicalCompanion, Stage::TransparentPrism] {
            let decision = evaluator.evaluate(stage, &s, &[], now());
            assert!(decision.should_change, "{} did not collapse", stage);
            assert_eq!(decision.target, Stage::StructuredGuide);
            assert_eq!(decision.trigger, SAFETY_TRIGGER);
            assert_eq!(decision.kind, Some(TransitionKind::SafetyCollapse));
        }
    }

    #[test]
    fn floor_breach_moves_one_stage_down() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let decision = evaluator.evaluate(
            Stage::TransparentPrism,
            &signals(100, 100, 100, 900),
            &[],
            now(),
        );
        assert_eq!(decision.target, Stage::CoCreativePartner);
        assert_eq!(decision.trigger, "capacity_decline:trust");
    }

    #[test]
    fn safety_at_lowest_stage_is_no_change() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let mut s = signals(900, 900, 900, 900);
        s.safety_flag = true;
        let decision = evaluator.evaluate(Stage::StructuredGuide, &s, &[], now());
        assert!(!decision.should_change);
    }

    #[test]
    fn upgrade_moves_one_stage_up() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let decision = evaluator.evaluate(
            Stage::StructuredGuide,
            &signals(1000, 1000, 1000, 1000),
            &[],
            now(),
        );
        assert!(decision.should_change);
        assert_eq!(decision.target, Stage::DialogicalCompanion);
        assert_eq!(decision.trigger, GROWTH_TRIGGER);
    }

    #[test]
    fn low_confidence_blocks_upgrade() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let decision = evaluator.evaluate(
            Stage::StructuredGuide,
            &signals(1000, 1000, 1000, 400),
            &[],
            now(),
        );
        assert!(!decision.should_change);
    }

    #[test]
    fn recent_downgrade_blocks_sustained_upgrade() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let history = vec![downgrade_at(now() - Duration::days(10))];
        let decision = evaluator.evaluate(
            Stage::DialogicalCompanion,
            &signals(900, 900, 900, 900),
            &history,
            now(),
        );
        assert!(!decision.should_change);
    }

    #[test]
    fn old_downgrade_does_not_block_upgrade() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let history = vec![downgrade_at(now() - Duration::days(45))];
        let decision = evaluator.evaluate(
            Stage::DialogicalCompanion,
            &signals(900, 900, 900, 900),
            &history,
            now(),
        );
        assert_eq!(decision.target, Stage::CoCreativePartner);
    }

    #[test]
    fn recent_downgrade_ignored_without_sustained_rule() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let history = vec![downgrade_at(now() - Duration::days(1))];
        let decision = evaluator.evaluate(
            Stage::StructuredGuide,
            &signals(900, 900, 900, 900),
            &history,
            now(),
        );
        assert_eq!(decision.target, Stage::DialogicalCompanion);
    }

    #[test]
    fn transition_record_carries_decision() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let s = signals(1000, 1000, 1000, 1000);
        let decision = evaluator.evaluate(Stage::StructuredGuide, &s, &[], now());

        let transition = decision.into_transition(&s, now()).expect("change");
        assert_eq!(transition.from_stage, Stage::StructuredGuide);
        assert_eq!(transition.to_stage, Stage::DialogicalCompanion);
        assert_eq!(transition.signals, s);
        assert!(transition.user_notified);

        let unchanged = evaluator.evaluate(Stage::TransparentPrism, &s, &[], now());
        assert!(unchanged.into_transition(&s, now()).is_none());
    }

    #[test]
    fn downgrade_is_not_announced() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let s = signals(100, 100, 100, 900);
        let transition = evaluator
            .evaluate(Stage::CoCreativePartner, &s, &[], now())
            .into_transition(&s, now())
            .expect("change");
        assert_eq!(transition.kind, TransitionKind::Downgrade);
        assert!(!transition.user_notified);
    }

    #[test]
    fn terminal_stage_never_upgrades() {
        let table = StageTable::default();
        let evaluator = StageEvaluator::new(&table);
        let decision = evaluator.evaluate(
            Stage::TransparentPrism,
            &signals(1000, 1000, 1000, 1000),
            &[],
            now(),
        );
        assert!(!decision.should_change);
        assert_eq!(decision.target, Stage::TransparentPrism);
    }
}
