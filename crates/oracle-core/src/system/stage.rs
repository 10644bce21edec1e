//! # Stage Configuration
//!
//! The four conversational stages and the table that configures them.
//!
//! ## Stage Definitions
//!
//! | Stage | Name | Default agent | Max intensity |
//! |-------|------|---------------|---------------|
//! | S0 | Structured Guide | grounding_guide | 0.4 |
//! | S1 | Dialogical Companion | maya | 0.6 |
//! | S2 | Co-Creative Partner | maya | 0.8 |
//! | S3 | Transparent Prism | maya | 1.0 |
//!
//! Each stage carries the rules for leaving it: upgrade rules move one stage
//! up, downgrade rules move one stage down when a signal breaks a floor. A
//! safety flag collapses straight to S0 from any stage without a rule. S3 has
//! no upgrade rules and is terminal for upward movement.
//!
//! The table stores one configuration per stage in a named field, so
//! [`StageTable::get`] is a total function over [`Stage`].

use crate::signals::{CapacitySignals, SignalKind};
use crate::{AgentId, Level, OracleError};
use serde::{Deserialize, Serialize};

// =============================================================================
// STAGE ENUM
// =============================================================================

/// Conversational latitude granted to a user, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// S0: scripted, grounded guidance.
    StructuredGuide,
    /// S1: reflective dialogue.
    DialogicalCompanion,
    /// S2: shared meaning-making.
    CoCreativePartner,
    /// S3: full latitude.
    TransparentPrism,
}

impl Stage {
    /// All stages in ascending order.
    pub const ALL: [Stage; 4] = [
        Stage::StructuredGuide,
        Stage::DialogicalCompanion,
        Stage::CoCreativePartner,
        Stage::TransparentPrism,
    ];

    /// Get the stage name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Stage::StructuredGuide => "Structured Guide",
            Stage::DialogicalCompanion => "Dialogical Companion",
            Stage::CoCreativePartner => "Co-Creative Partner",
            Stage::TransparentPrism => "Transparent Prism",
        }
    }

    /// Stable machine name (matches the serde representation).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::StructuredGuide => "structured_guide",
            Stage::DialogicalCompanion => "dialogical_companion",
            Stage::CoCreativePartner => "co_creative_partner",
            Stage::TransparentPrism => "transparent_prism",
        }
    }

    /// Parse a machine name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.as_str() == s)
    }

    /// The lowest stage, target of every safety collapse.
    #[must_use]
    pub const fn lowest() -> Stage {
        Stage::StructuredGuide
    }

    /// Get the next stage, if any.
    #[must_use]
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::StructuredGuide => Some(Stage::DialogicalCompanion),
            Stage::DialogicalCompanion => Some(Stage::CoCreativePartner),
            Stage::CoCreativePartner => Some(Stage::TransparentPrism),
            Stage::TransparentPrism => None,
        }
    }

    /// Get the previous stage, if any.
    #[must_use]
    pub fn previous(&self) -> Option<Stage> {
        match self {
            Stage::StructuredGuide => None,
            Stage::DialogicalCompanion => Some(Stage::StructuredGuide),
            Stage::CoCreativePartner => Some(Stage::DialogicalCompanion),
            Stage::TransparentPrism => Some(Stage::CoCreativePartner),
        }
    }

    /// Check if this stage is terminal (S3).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::TransparentPrism)
    }

    /// Position in the total order, 0 for the lowest stage.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Stage::StructuredGuide => 0,
            Stage::DialogicalCompanion => 1,
            Stage::CoCreativePartner => 2,
            Stage::TransparentPrism => 3,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// RESPONSE STYLE & SAFETY ENVELOPE
// =============================================================================

/// How elaborate replies may be at a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStyle {
    pub complexity: Level,
    pub metaphor_density: Level,
    pub challenge_frequency: Level,
}

/// Post-processing filters applied to agent replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentFilter {
    /// Soften abstract, cosmic vocabulary.
    AbstractLanguage,
    /// Drop sentences that assert ungrounded certainty.
    UngroundedClaims,
}

/// Safety ceilings for a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyEnvelope {
    /// Replies are clamped to this intensity.
    pub max_intensity: Level,
    /// Above 0.5, grounding content is appended to every reply.
    pub grounding_frequency: Level,
    #[serde(default)]
    pub content_filters: Vec<ContentFilter>,
}

impl SafetyEnvelope {
    /// Grounding content is injected above this frequency.
    pub const GROUNDING_THRESHOLD: Level = Level::new(500);

    /// Whether replies at this stage get grounding content.
    #[must_use]
    pub fn injects_grounding(&self) -> bool {
        self.grounding_frequency > Self::GROUNDING_THRESHOLD
    }
}

// =============================================================================
// RULES
// =============================================================================

fn default_true() -> bool {
    true
}

/// Conditions for moving one stage up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRule {
    pub trust_threshold: Level,
    pub engagement_threshold: Level,
    pub integration_threshold: Level,
    #[serde(default = "default_true")]
    pub require_no_safety_flag: bool,
    pub confidence_required: Level,
    /// When set, the user must have no downgrade in the recent window.
    #[serde(default)]
    pub sustained_sessions: Option<u32>,
}

impl UpgradeRule {
    /// Threshold configured for one signal.
    #[must_use]
    pub fn threshold(&self, kind: SignalKind) -> Level {
        match kind {
            SignalKind::Trust => self.trust_threshold,
            SignalKind::EngagementDepth => self.engagement_threshold,
            SignalKind::IntegrationSkill => self.integration_threshold,
        }
    }

    /// Signals that are still below their threshold.
    #[must_use]
    pub fn unmet_signals(&self, signals: &CapacitySignals) -> Vec<SignalKind> {
        SignalKind::ALL
            .into_iter()
            .filter(|kind| signals.get(*kind) < self.threshold(*kind))
            .collect()
    }

    /// Check every signal-only condition (thresholds, safety, confidence).
    ///
    /// The sustained-sessions condition needs transition history and is
    /// checked by the evaluator.
    #[must_use]
    pub fn satisfied_by(&self, signals: &CapacitySignals) -> bool {
        if self.require_no_safety_flag && signals.safety_flag {
            return false;
        }
        if signals.confidence_level < self.confidence_required {
            return false;
        }
        self.unmet_signals(signals).is_empty()
    }
}

/// Signal floors for leaving a stage one step downward.
///
/// The safety collapse is not a rule: a set safety flag always lands on the
/// lowest stage, whatever the table lists here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowngradeRule {
    #[serde(default)]
    pub trust_floor: Option<Level>,
    #[serde(default)]
    pub engagement_floor: Option<Level>,
    #[serde(default)]
    pub integration_floor: Option<Level>,
}

impl DowngradeRule {
    /// Floor configured for one signal.
    #[must_use]
    pub fn floor(&self, kind: SignalKind) -> Option<Level> {
        match kind {
            SignalKind::Trust => self.trust_floor,
            SignalKind::EngagementDepth => self.engagement_floor,
            SignalKind::IntegrationSkill => self.integration_floor,
        }
    }

    /// First tracked signal that has fallen below its floor.
    #[must_use]
    pub fn breached(&self, signals: &CapacitySignals) -> Option<SignalKind> {
        SignalKind::ALL.into_iter().find(|kind| {
            self.floor(*kind)
                .is_some_and(|floor| signals.get(*kind) < floor)
        })
    }
}

// =============================================================================
// STAGE CONFIGURATION
// =============================================================================

/// Static configuration of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfiguration {
    /// Agents a session at this stage may be routed to.
    pub allowed_agents: Vec<AgentId>,
    /// Agents that are never eligible, even when listed as allowed.
    #[serde(default)]
    pub restricted_agents: Vec<AgentId>,
    /// First choice when the caller expresses no usable preference.
    pub default_agent: AgentId,
    pub response_style: ResponseStyle,
    pub safety: SafetyEnvelope,
    #[serde(default)]
    pub upgrade_rules: Vec<UpgradeRule>,
    #[serde(default)]
    pub downgrade_rules: Vec<DowngradeRule>,
}

impl StageConfiguration {
    /// Whether an agent may serve a session at this stage.
    #[must_use]
    pub fn is_agent_eligible(&self, agent: &AgentId) -> bool {
        self.allowed_agents.contains(agent) && !self.restricted_agents.contains(agent)
    }

    /// Whether the signals already satisfy any upgrade rule of this stage.
    ///
    /// A stage without upgrade rules is never "already satisfied".
    #[must_use]
    pub fn upgrade_satisfied_by(&self, signals: &CapacitySignals) -> bool {
        self.upgrade_rules
            .iter()
            .any(|rule| rule.satisfied_by(signals))
    }
}

fn agents(ids: &[&str]) -> Vec<AgentId> {
    ids.iter().map(|id| AgentId::new(*id)).collect()
}

// =============================================================================
// STAGE TABLE
// =============================================================================

/// One configuration per stage. Built once, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTable {
    pub structured_guide: StageConfiguration,
    pub dialogical_companion: StageConfiguration,
    pub co_creative_partner: StageConfiguration,
    pub transparent_prism: StageConfiguration,
}

impl Default for StageTable {
    fn default() -> Self {
        Self {
            structured_guide: StageConfiguration {
                allowed_agents: agents(&["grounding_guide", "earth", "water"]),
                restricted_agents: agents(&["fire", "air", "aether"]),
                default_agent: AgentId::new("grounding_guide"),
                response_style: ResponseStyle {
                    complexity: Level::new(300),
                    metaphor_density: Level::new(200),
                    challenge_frequency: Level::new(100),
                },
                safety: SafetyEnvelope {
                    max_intensity: Level::new(400),
                    grounding_frequency: Level::new(800),
                    content_filters: vec![
                        ContentFilter::AbstractLanguage,
                        ContentFilter::UngroundedClaims,
                    ],
                },
                upgrade_rules: vec![UpgradeRule {
                    trust_threshold: Level::new(400),
                    engagement_threshold: Level::new(400),
                    integration_threshold: Level::new(300),
                    require_no_safety_flag: true,
                    confidence_required: Level::new(500),
                    sustained_sessions: None,
                }],
                downgrade_rules: Vec::new(),
            },
            dialogical_companion: StageConfiguration {
                allowed_agents: agents(&["maya", "earth", "water", "air", "grounding_guide"]),
                restricted_agents: agents(&["aether"]),
                default_agent: AgentId::new("maya"),
                response_style: ResponseStyle {
                    complexity: Level::new(500),
                    metaphor_density: Level::new(400),
                    challenge_frequency: Level::new(300),
                },
                safety: SafetyEnvelope {
                    max_intensity: Level::new(600),
                    grounding_frequency: Level::new(600),
                    content_filters: vec![ContentFilter::UngroundedClaims],
                },
                upgrade_rules: vec![UpgradeRule {
                    trust_threshold: Level::new(600),
                    engagement_threshold: Level::new(600),
                    integration_threshold: Level::new(500),
                    require_no_safety_flag: true,
                    confidence_required: Level::new(600),
                    sustained_sessions: Some(3),
                }],
                downgrade_rules: vec![DowngradeRule {
                    trust_floor: Some(Level::new(300)),
                    engagement_floor: Some(Level::new(250)),
                    ..DowngradeRule::default()
                }],
            },
            co_creative_partner: StageConfiguration {
                allowed_agents: agents(&[
                    "maya",
                    "earth",
                    "water",
                    "air",
                    "fire",
                    "grounding_guide",
                ]),
                restricted_agents: agents(&["aether"]),
                default_agent: AgentId::new("maya"),
                response_style: ResponseStyle {
                    complexity: Level::new(700),
                    metaphor_density: Level::new(600),
                    challenge_frequency: Level::new(500),
                },
                safety: SafetyEnvelope {
                    max_intensity: Level::new(800),
                    grounding_frequency: Level::new(400),
                    content_filters: Vec::new(),
                },
                upgrade_rules: vec![UpgradeRule {
                    trust_threshold: Level::new(800),
                    engagement_threshold: Level::new(750),
                    integration_threshold: Level::new(700),
                    require_no_safety_flag: true,
                    confidence_required: Level::new(750),
                    sustained_sessions: Some(5),
                }],
                downgrade_rules: vec![DowngradeRule {
                    trust_floor: Some(Level::new(500)),
                    integration_floor: Some(Level::new(400)),
                    ..DowngradeRule::default()
                }],
            },
            transparent_prism: StageConfiguration {
                allowed_agents: agents(&[
                    "maya",
                    "earth",
                    "water",
                    "air",
                    "fire",
                    "aether",
                    "grounding_guide",
                ]),
                restricted_agents: Vec::new(),
                default_agent: AgentId::new("maya"),
                response_style: ResponseStyle {
                    complexity: Level::new(900),
                    metaphor_density: Level::new(800),
                    challenge_frequency: Level::new(600),
                },
                safety: SafetyEnvelope {
                    max_intensity: Level::MAX,
                    grounding_frequency: Level::new(200),
                    content_filters: Vec::new(),
                },
                upgrade_rules: Vec::new(),
                downgrade_rules: vec![DowngradeRule {
                    trust_floor: Some(Level::new(700)),
                    integration_floor: Some(Level::new(600)),
                    ..DowngradeRule::default()
                }],
            },
        }
    }
}

impl StageTable {
    /// Configuration for a stage. Total over [`Stage`].
    #[must_use]
    pub fn get(&self, stage: Stage) -> &StageConfiguration {
        match stage {
            Stage::StructuredGuide => &self.structured_guide,
            Stage::DialogicalCompanion => &self.dialogical_companion,
            Stage::CoCreativePartner => &self.co_creative_partner,
            Stage::TransparentPrism => &self.transparent_prism,
        }
    }

    /// Check the structural constraints a loaded table must meet.
    ///
    /// - The terminal stage has no upgrade rules
    /// - Every default agent is eligible at its own stage
    /// - Every stage lists at least one allowed agent
    pub fn validate(&self) -> Result<(), OracleError> {
        if !self.transparent_prism.upgrade_rules.is_empty() {
            return Err(OracleError::InvalidConfig(
                "transparent_prism is terminal and cannot have upgrade rules".to_string(),
            ));
        }
        for stage in Stage::ALL {
            let config = self.get(stage);
            if config.allowed_agents.is_empty() {
                return Err(OracleError::InvalidConfig(format!(
                    "{} has no allowed agents",
                    stage
                )));
            }
            if !config.is_agent_eligible(&config.default_agent) {
                return Err(OracleError::InvalidConfig(format!(
                    "{}: default agent '{}' is not eligible",
                    stage, config.default_agent
                )));
            }
        }
        Ok(())
    }

    /// Deterministic threshold classifier.
    ///
    /// Walks the stages from highest to lowest and returns the first one
    /// whose upgrade conditions the signals already satisfy, falling back to
    /// the lowest stage.
    #[must_use]
    pub fn classify(&self, signals: &CapacitySignals) -> Stage {
        Stage::ALL
            .into_iter()
            .rev()
            .find(|stage| self.get(*stage).upgrade_satisfied_by(signals))
            .unwrap_or(Stage::lowest())
    }

    /// Progress from `current` toward the next stage.
    #[must_use]
    pub fn progress(&self, current: Stage, signals: &CapacitySignals) -> StageProgress {
        let config = self.get(current);
        let (Some(next), Some(rule)) = (current.next(), config.upgrade_rules.first()) else {
            return StageProgress::terminal(current);
        };

        let mut total: u32 = 0;
        for kind in SignalKind::ALL {
            let threshold = u32::from(rule.threshold(kind).permille());
            let value = u32::from(signals.get(kind).permille());
            let pct = if threshold == 0 {
                100
            } else {
                (value.saturating_mul(100) / threshold).min(100)
            };
            total = total.saturating_add(pct);
        }

        let mut blocking: Vec<String> = rule
            .unmet_signals(signals)
            .into_iter()
            .map(|kind| kind.as_str().to_string())
            .collect();
        if signals.confidence_level < rule.confidence_required {
            blocking.push("confidence_level".to_string());
        }
        if rule.require_no_safety_flag && signals.safety_flag {
            blocking.push("safety_flag".to_string());
        }

        StageProgress {
            current,
            next: Some(next),
            percent: (total / SignalKind::ALL.len() as u32) as u8,
            blocking,
        }
    }
}

/// Progress information toward the next stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub current: Stage,
    pub next: Option<Stage>,
    /// Mean per-signal progress toward the upgrade thresholds, 0–100.
    pub percent: u8,
    /// Conditions that currently block the upgrade.
    pub blocking: Vec<String>,
}

impl StageProgress {
    fn terminal(current: Stage) -> Self {
        Self {
            current,
            next: None,
            percent: 100,
            blocking: Vec::new(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn signals(trust: u16, engagement: u16, integration: u16, confidence: u16) -> CapacitySignals {
        let mut s = CapacitySignals::conservative(DateTime::<Utc>::UNIX_EPOCH);
        s.trust = Level::new(trust);
        s.engagement_depth = Level::new(engagement);
        s.integration_skill = Level::new(integration);
        s.confidence_level = Level::new(confidence);
        s
    }

    #[test]
    fn stage_ordering() {
        assert!(Stage::StructuredGuide < Stage::DialogicalCompanion);
        assert!(Stage::DialogicalCompanion < Stage::CoCreativePartner);
        assert!(Stage::CoCreativePartner < Stage::TransparentPrism);
    }

    #[test]
    fn next_and_previous_are_adjacent() {
        for stage in Stage::ALL {
            if let Some(next) = stage.next() {
                assert_eq!(next.previous(), Some(stage));
                assert_eq!(next.index(), stage.index() + 1);
            }
        }
        assert!(Stage::TransparentPrism.is_terminal());
        assert_eq!(Stage::StructuredGuide.previous(), None);
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("oracle"), None);
    }

    #[test]
    fn default_table_is_valid() {
        StageTable::default().validate().expect("valid");
    }

    #[test]
    fn terminal_upgrade_rule_is_rejected() {
        let mut table = StageTable::default();
        let rule = table.structured_guide.upgrade_rules[0].clone();
        table.transparent_prism.upgrade_rules.push(rule);
        assert!(matches!(
            table.validate(),
            Err(OracleError::InvalidConfig(_))
        ));
    }

    #[test]
    fn restricted_default_agent_is_rejected() {
        let mut table = StageTable::default();
        table
            .dialogical_companion
            .restricted_agents
            .push(AgentId::new("maya"));
        assert!(table.validate().is_err());
    }

    #[test]
    fn classify_conservative_signals_is_lowest() {
        let table = StageTable::default();
        assert_eq!(
            table.classify(&CapacitySignals::conservative(DateTime::<Utc>::UNIX_EPOCH)),
            Stage::StructuredGuide
        );
    }

    #[test]
    fn classify_picks_highest_satisfied_stage() {
        let table = StageTable::default();
        assert_eq!(
            table.classify(&signals(650, 650, 550, 650)),
            Stage::DialogicalCompanion
        );
        assert_eq!(
            table.classify(&signals(900, 900, 900, 900)),
            Stage::CoCreativePartner
        );
    }

    #[test]
    fn classify_safety_flag_is_lowest() {
        let table = StageTable::default();
        let mut s = signals(900, 900, 900, 900);
        s.safety_flag = true;
        assert_eq!(table.classify(&s), Stage::StructuredGuide);
    }

    #[test]
    fn downgrade_rule_reports_first_breach() {
        let rule = DowngradeRule {
            trust_floor: Some(Level::new(300)),
            engagement_floor: Some(Level::new(250)),
            ..DowngradeRule::default()
        };
        assert_eq!(rule.breached(&signals(200, 100, 0, 0)), Some(SignalKind::Trust));
        assert_eq!(
            rule.breached(&signals(400, 100, 0, 0)),
            Some(SignalKind::EngagementDepth)
        );
        assert_eq!(rule.breached(&signals(400, 400, 0, 0)), None);
    }

    #[test]
    fn progress_reports_blocking_signals() {
        let table = StageTable::default();
        let progress = table.progress(Stage::DialogicalCompanion, &signals(300, 600, 500, 700));
        assert_eq!(progress.next, Some(Stage::CoCreativePartner));
        assert_eq!(progress.blocking, vec!["trust".to_string()]);
        // trust 50%, engagement 100%, integration 100%
        assert_eq!(progress.percent, 83);
    }

    #[test]
    fn progress_terminal_is_complete() {
        let table = StageTable::default();
        let progress = table.progress(Stage::TransparentPrism, &signals(0, 0, 0, 0));
        assert_eq!(progress.next, None);
        assert_eq!(progress.percent, 100);
    }

    #[test]
    fn grounding_threshold_is_exclusive() {
        let mut envelope = StageTable::default().structured_guide.safety;
        envelope.grounding_frequency = Level::new(500);
        assert!(!envelope.injects_grounding());
        envelope.grounding_frequency = Level::new(501);
        assert!(envelope.injects_grounding());
    }
}
