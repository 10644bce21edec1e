//! # Oracle
//!
//! The stage-gated conversation engine.
//!
//! [`Oracle`] ties the collaborators together:
//! - a [`CapacityStore`] that measures every turn
//! - a [`SessionStore`] for live sessions and transition history
//! - an [`AgentRegistry`] the turns are routed to
//! - an [`EventBus`] for host notifications and inbound safety alerts
//! - a [`Clock`] for every timestamp
//!
//! ## Fail-Safe Boundaries
//!
//! `initialize_session` and `generate_response` never return an error. A
//! failed initialization yields a protective session at the lowest stage; a
//! failed turn yields a fixed low-intensity reply. Every other operation
//! propagates `OracleError`.
//!
//! ## Turn Order
//!
//! Measure, evaluate, apply any transition, then dispatch. The reply to a
//! turn is always produced under the configuration of the stage the session
//! is in after that turn's evaluation.

use crate::agent::{AgentContext, AgentRegistry, AgentResponse, SAFE_AGENT, select_agent};
use crate::capacity::{
    CapacityStore, InMemoryCapacityStore, ObservedLevels, SessionData, SignalExplanation,
};
use crate::clock::{Clock, SystemClock};
use crate::evaluator::StageEvaluator;
use crate::events::{EventBus, OracleEvent, SubscriptionId, Topic};
use crate::postprocess::{apply_envelope, fallback_reply};
use crate::primitives::{MAX_HISTORY_DAYS, MAX_ID_LENGTH, MAX_INPUT_LENGTH};
use crate::session::{PersonalOracleSession, StageTransition};
use crate::signals::CapacitySignals;
use crate::storage::{InMemoryStore, RedbStore, SessionStore};
use crate::system::{Stage, StageProgress, StageTable};
use crate::{AgentId, OracleError, SessionId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

// =============================================================================
// SETTINGS & CONTEXTS
// =============================================================================

/// How a new session's stage is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialStagePolicy {
    /// Highest stage whose upgrade conditions the signals already meet.
    #[default]
    HighestSatisfied,
    /// Always start at the lowest stage.
    Lowest,
}

/// Tunable engine behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleSettings {
    #[serde(default)]
    pub initial_stage_policy: InitialStagePolicy,
}

/// Caller input to `initialize_session`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Agents the caller would like, in order of preference.
    #[serde(default)]
    pub preferred_agents: Vec<AgentId>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Caller input accompanying one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnContext {
    /// Host-observed levels that override derived ones.
    #[serde(default)]
    pub observed: ObservedLevels,
    /// Passed through to the agent.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Result of one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub response: AgentResponse,
    /// The session after the turn, when one exists.
    pub session: Option<PersonalOracleSession>,
    pub stage_changed: bool,
    pub transition: Option<StageTransition>,
}

/// Log an engine error and convert it to `None`.
fn log_and_convert<T>(result: Result<T, OracleError>, context: &str) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(event = "oracle_error", context, error = %e);
            None
        }
    }
}

fn check_id(kind: &str, id: &str) -> Result<(), OracleError> {
    if id.trim().is_empty() {
        return Err(OracleError::InvalidInput(format!("{kind} must not be empty")));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(OracleError::InvalidInput(format!(
            "{kind} exceeds {MAX_ID_LENGTH} bytes"
        )));
    }
    Ok(())
}

// =============================================================================
// BUILDER
// =============================================================================

/// Assembles an [`Oracle`]. Unset collaborators get in-memory defaults.
#[derive(Default)]
pub struct OracleBuilder {
    table: Option<StageTable>,
    sessions: Option<Box<dyn SessionStore>>,
    capacity: Option<Box<dyn CapacityStore>>,
    agents: Option<AgentRegistry>,
    bus: Option<EventBus>,
    clock: Option<Arc<dyn Clock>>,
    settings: OracleSettings,
}

impl OracleBuilder {
    #[must_use]
    pub fn table(mut self, table: StageTable) -> Self {
        self.table = Some(table);
        self
    }

    #[must_use]
    pub fn session_store(mut self, store: Box<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    /// Use a redb database at `path` for sessions and history.
    pub fn redb(self, path: impl AsRef<Path>) -> Result<Self, OracleError> {
        let store = RedbStore::open(path)?;
        Ok(self.session_store(Box::new(store)))
    }

    #[must_use]
    pub fn capacity_store(mut self, store: Box<dyn CapacityStore>) -> Self {
        self.capacity = Some(store);
        self
    }

    #[must_use]
    pub fn agents(mut self, registry: AgentRegistry) -> Self {
        self.agents = Some(registry);
        self
    }

    /// Share an existing bus with the host.
    #[must_use]
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: OracleSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Validate the stage table and build the engine.
    pub fn build(self) -> Result<Oracle, OracleError> {
        let table = self.table.unwrap_or_default();
        table.validate()?;

        let bus = self.bus.unwrap_or_default();
        let pending_alerts: Arc<Mutex<BTreeSet<UserId>>> = Arc::default();
        let queue = Arc::clone(&pending_alerts);
        let alert_subscription = bus.subscribe(Topic::SafetyAlert, move |event| {
            let mut pending = queue.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(event.user_id().clone());
        });

        Ok(Oracle {
            table,
            sessions: self
                .sessions
                .unwrap_or_else(|| Box::new(InMemoryStore::new())),
            capacity: self
                .capacity
                .unwrap_or_else(|| Box::new(InMemoryCapacityStore::new())),
            agents: self
                .agents
                .unwrap_or_else(AgentRegistry::with_builtin_agents),
            bus,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            settings: self.settings,
            pending_alerts,
            alert_subscription,
        })
    }
}

// =============================================================================
// ORACLE
// =============================================================================

/// The stage-gated conversation engine.
pub struct Oracle {
    table: StageTable,
    sessions: Box<dyn SessionStore>,
    capacity: Box<dyn CapacityStore>,
    agents: AgentRegistry,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    settings: OracleSettings,
    /// Users with an external safety alert not yet folded into a measurement.
    pending_alerts: Arc<Mutex<BTreeSet<UserId>>>,
    alert_subscription: SubscriptionId,
}

impl std::fmt::Debug for Oracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oracle")
            .field("agents", &self.agents)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Drop for Oracle {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.alert_subscription);
    }
}

impl Oracle {
    #[must_use]
    pub fn builder() -> OracleBuilder {
        OracleBuilder::default()
    }

    /// An engine with the default table and in-memory collaborators.
    pub fn in_memory() -> Result<Self, OracleError> {
        Self::builder().build()
    }

    #[must_use]
    pub fn table(&self) -> &StageTable {
        &self.table
    }

    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    #[must_use]
    pub fn settings(&self) -> &OracleSettings {
        &self.settings
    }

    // -------------------------------------------------------------------------
    // Session initializer
    // -------------------------------------------------------------------------

    /// Create (or replace) the session `session_id` for `user_id`.
    ///
    /// Never fails: on any internal error a protective fallback session is
    /// returned instead.
    pub fn initialize_session(
        &mut self,
        user_id: UserId,
        session_id: SessionId,
        ctx: &SessionContext,
    ) -> PersonalOracleSession {
        match self.try_initialize(&user_id, &session_id, ctx) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(
                    event = "session_init_failed",
                    user_id = %user_id,
                    session_id = %session_id,
                    error = %e,
                );
                self.fallback_session(user_id, session_id)
            }
        }
    }

    fn try_initialize(
        &mut self,
        user_id: &UserId,
        session_id: &SessionId,
        ctx: &SessionContext,
    ) -> Result<PersonalOracleSession, OracleError> {
        check_id("user_id", user_id.as_str())?;
        check_id("session_id", session_id.as_str())?;

        let now = self.clock.now();
        let signals = self
            .capacity
            .current_signals(user_id)?
            .unwrap_or_else(|| CapacitySignals::conservative(now));

        let stage = match self.settings.initial_stage_policy {
            InitialStagePolicy::HighestSatisfied => self.table.classify(&signals),
            InitialStagePolicy::Lowest => Stage::lowest(),
        };
        let agent_id = select_agent(self.table.get(stage), &self.agents, &ctx.preferred_agents);

        let session = PersonalOracleSession::new(
            user_id.clone(),
            session_id.clone(),
            stage,
            signals,
            agent_id,
            now,
        );
        self.sessions.put(session.clone())?;

        tracing::info!(
            event = "session_initialized",
            user_id = %user_id,
            session_id = %session_id,
            stage = %stage,
            agent = %session.agent_id,
        );
        self.bus.emit(&OracleEvent::SessionInitialized {
            user_id: user_id.clone(),
            session_id: session_id.clone(),
            stage,
            agent_id: session.agent_id.clone(),
            fallback: false,
        });
        Ok(session)
    }

    fn fallback_session(&mut self, user_id: UserId, session_id: SessionId) -> PersonalOracleSession {
        let now = self.clock.now();
        let session = PersonalOracleSession::new(
            user_id,
            session_id,
            Stage::lowest(),
            CapacitySignals::fail_safe(now),
            AgentId::new(SAFE_AGENT),
            now,
        );
        // Best effort: the caller gets the session even if it cannot be stored.
        let _ = log_and_convert(self.sessions.put(session.clone()), "store fallback session");
        self.bus.emit(&OracleEvent::SessionInitialized {
            user_id: session.user_id.clone(),
            session_id: session.session_id.clone(),
            stage: Stage::lowest(),
            agent_id: session.agent_id.clone(),
            fallback: true,
        });
        session
    }

    // -------------------------------------------------------------------------
    // Turn processor
    // -------------------------------------------------------------------------

    /// Process one user turn.
    ///
    /// Never fails: on any internal error the fixed fallback reply is
    /// returned together with the stored session, if there is one.
    pub fn generate_response(
        &mut self,
        session_id: &SessionId,
        input: &str,
        ctx: &TurnContext,
    ) -> TurnOutcome {
        match self.try_turn(session_id, input, ctx) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    event = "turn_failed",
                    session_id = %session_id,
                    error = %e,
                );
                TurnOutcome {
                    response: fallback_reply(),
                    session: self.sessions.get(session_id).ok().flatten(),
                    stage_changed: false,
                    transition: None,
                }
            }
        }
    }

    fn try_turn(
        &mut self,
        session_id: &SessionId,
        input: &str,
        ctx: &TurnContext,
    ) -> Result<TurnOutcome, OracleError> {
        if input.len() > MAX_INPUT_LENGTH {
            return Err(OracleError::InvalidInput(format!(
                "input exceeds {MAX_INPUT_LENGTH} bytes"
            )));
        }
        let mut session = self
            .sessions
            .get(session_id)?
            .ok_or_else(|| OracleError::SessionNotFound(session_id.clone()))?;
        let user_id = session.user_id.clone();
        let now = self.clock.now();

        // 1. Measure
        let external_alert = self.alert_pending(&user_id);
        let data = SessionData {
            input: input.to_string(),
            turn_count: session.turn_count,
            observed: ctx.observed.clone(),
            external_alert,
            now,
        };
        let signals = self.capacity.measure(&user_id, session_id, &data)?;
        if external_alert {
            self.clear_alert(&user_id);
        }
        session.signals = signals.clone();

        // 2. Evaluate
        let history = self.sessions.transitions(&user_id)?;
        let decision = StageEvaluator::new(&self.table).evaluate(
            session.current_stage(),
            &signals,
            &history,
            now,
        );

        // 3. Apply before dispatching
        let transition = match decision.into_transition(&signals, now) {
            Some(t) => {
                self.apply_transition(&mut session, t.clone())?;
                Some(t)
            }
            None => None,
        };
        let stage_changed = transition.is_some();

        // 4. Dispatch
        let stage = session.current_stage();
        let config = self.table.get(stage);
        let mut agent_ctx = AgentContext::for_stage(stage, config, &signals, session.turn_count);
        agent_ctx.metadata = ctx.metadata.clone();

        let reply = self
            .agents
            .get(&session.agent_id)
            .and_then(|agent| agent.respond(input, &agent_ctx).map_err(OracleError::from));
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                // Any transition is already committed; keep the fresh signals too.
                tracing::warn!(
                    event = "agent_failed",
                    session_id = %session_id,
                    agent = %session.agent_id,
                    error = %e,
                );
                self.sessions.put(session.clone())?;
                return Ok(TurnOutcome {
                    response: fallback_reply(),
                    session: Some(session),
                    stage_changed,
                    transition,
                });
            }
        };

        // 5. Post-process
        let response = apply_envelope(reply, &config.safety);

        // 6. Bookkeeping
        session.record_turn(now);
        self.sessions.put(session.clone())?;

        tracing::debug!(
            event = "response_generated",
            session_id = %session_id,
            stage = %stage,
            agent = %response.agent_id,
            intensity = %response.intensity,
        );
        self.bus.emit(&OracleEvent::ResponseGenerated {
            user_id,
            session_id: session_id.clone(),
            agent_id: response.agent_id.clone(),
            stage,
            intensity: response.intensity,
        });

        Ok(TurnOutcome {
            response,
            session: Some(session),
            stage_changed,
            transition,
        })
    }

    // -------------------------------------------------------------------------
    // Transition applier
    // -------------------------------------------------------------------------

    fn apply_transition(
        &mut self,
        session: &mut PersonalOracleSession,
        transition: StageTransition,
    ) -> Result<(), OracleError> {
        session.apply_transition(transition.clone());

        let selected = select_agent(self.table.get(session.current_stage()), &self.agents, &[]);
        if selected != session.agent_id {
            session.agent_id = selected;
        }
        self.sessions
            .commit_transition(session.clone(), transition.clone())?;

        tracing::info!(
            event = "stage_changed",
            user_id = %session.user_id,
            session_id = %session.session_id,
            from = %transition.from_stage,
            to = %transition.to_stage,
            trigger = %transition.trigger,
            agent = %session.agent_id,
        );
        self.bus.emit(&OracleEvent::StageChanged {
            user_id: session.user_id.clone(),
            session_id: session.session_id.clone(),
            transition,
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Safety alerts
    // -------------------------------------------------------------------------

    /// Report an external safety concern for a user.
    ///
    /// The user's next measured turn carries the safety flag.
    pub fn raise_safety_alert(&self, user_id: &UserId, reason: &str) {
        tracing::warn!(event = "safety_alert", user_id = %user_id, reason);
        self.bus.emit(&OracleEvent::SafetyAlert {
            user_id: user_id.clone(),
            reason: reason.to_string(),
            at: self.clock.now(),
        });
    }

    fn alert_pending(&self, user_id: &UserId) -> bool {
        self.pending_alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(user_id)
    }

    fn clear_alert(&self, user_id: &UserId) {
        self.pending_alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user_id);
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// The stage a user is currently served at.
    ///
    /// Uses the most recently active live session, then the last recorded
    /// transition, then the capacity store's classification.
    pub fn current_stage(&self, user_id: &UserId) -> Result<Stage, OracleError> {
        let latest = self
            .sessions
            .sessions_for(user_id)?
            .into_iter()
            .max_by_key(|s| s.last_activity);
        if let Some(session) = latest {
            return Ok(session.current_stage());
        }
        if let Some(last) = self.sessions.transitions(user_id)?.last() {
            return Ok(last.to_stage);
        }
        self.capacity.determine_stage(user_id, &self.table)
    }

    /// Every transition recorded for a user, oldest first.
    pub fn session_history(&self, user_id: &UserId) -> Result<Vec<StageTransition>, OracleError> {
        self.sessions.transitions(user_id)
    }

    pub fn active_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<PersonalOracleSession>, OracleError> {
        self.sessions.get(session_id)
    }

    /// All live sessions.
    pub fn sessions(&self) -> Result<Vec<PersonalOracleSession>, OracleError> {
        self.sessions.list()
    }

    /// Progress of a session toward its next stage.
    pub fn stage_progress(&self, session_id: &SessionId) -> Result<StageProgress, OracleError> {
        let session = self
            .sessions
            .get(session_id)?
            .ok_or_else(|| OracleError::SessionNotFound(session_id.clone()))?;
        Ok(self
            .table
            .progress(session.current_stage(), &session.signals))
    }

    /// Plain-language reading of a user's current signals.
    pub fn explain_signals(&self, user_id: &UserId) -> Result<SignalExplanation, OracleError> {
        let signals = self
            .capacity
            .current_signals(user_id)?
            .unwrap_or_else(|| CapacitySignals::conservative(self.clock.now()));
        Ok(self.capacity.explain_signals(&signals))
    }

    /// Signal snapshots recorded for a user within the last `days` days.
    pub fn signal_history(
        &self,
        user_id: &UserId,
        days: u32,
    ) -> Result<Vec<CapacitySignals>, OracleError> {
        if days > MAX_HISTORY_DAYS {
            return Err(OracleError::InvalidInput(format!(
                "days must be at most {MAX_HISTORY_DAYS}"
            )));
        }
        self.capacity
            .signal_history(user_id, days, self.clock.now())
    }

    /// Close a session. Its transitions stay in the user's history.
    pub fn end_session(
        &mut self,
        session_id: &SessionId,
    ) -> Result<PersonalOracleSession, OracleError> {
        let session = self
            .sessions
            .remove(session_id)?
            .ok_or_else(|| OracleError::SessionNotFound(session_id.clone()))?;
        tracing::info!(
            event = "session_ended",
            user_id = %session.user_id,
            session_id = %session_id,
            turns = session.turn_count,
        );
        Ok(session)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Level;
    use crate::agent::{Agent, AgentError, Tone};
    use crate::clock::FixedClock;
    use crate::postprocess::PROCESSING_ERROR_TAG;
    use crate::session::TransitionKind;
    use chrono::{DateTime, Duration, Utc};

    fn start() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::days(1000)
    }

    fn oracle_with_clock() -> (Oracle, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(start()));
        let oracle = Oracle::builder()
            .clock(clock.clone())
            .build()
            .expect("build");
        (oracle, clock)
    }

    fn strong() -> TurnContext {
        TurnContext {
            observed: ObservedLevels {
                trust: Some(Level::MAX),
                engagement_depth: Some(Level::MAX),
                integration_skill: Some(Level::MAX),
                safety_flag: None,
            },
            metadata: BTreeMap::new(),
        }
    }

    fn open(oracle: &mut Oracle, user: &str, session: &str) -> SessionId {
        let id = SessionId::new(session);
        oracle.initialize_session(UserId::new(user), id.clone(), &SessionContext::default());
        id
    }

    struct BrokenAgent(AgentId);

    impl Agent for BrokenAgent {
        fn id(&self) -> &AgentId {
            &self.0
        }

        fn respond(&self, _input: &str, _ctx: &AgentContext) -> Result<AgentResponse, AgentError> {
            Err(AgentError::Unavailable("offline".to_string()))
        }
    }

    #[test]
    fn new_user_starts_at_lowest_stage() {
        let (mut oracle, _) = oracle_with_clock();
        let session = oracle.initialize_session(
            UserId::new("u1"),
            SessionId::new("s1"),
            &SessionContext::default(),
        );
        assert_eq!(session.current_stage(), Stage::StructuredGuide);
        assert_eq!(session.agent_id, AgentId::new("grounding_guide"));
        assert_eq!(session.started_at, start());
        assert!(
            oracle
                .active_session(&SessionId::new("s1"))
                .expect("get")
                .is_some()
        );
    }

    #[test]
    fn preferred_agent_is_honoured_when_eligible() {
        let (mut oracle, _) = oracle_with_clock();
        let ctx = SessionContext {
            preferred_agents: vec![AgentId::new("aether"), AgentId::new("earth")],
            metadata: BTreeMap::new(),
        };
        let session = oracle.initialize_session(UserId::new("u1"), SessionId::new("s1"), &ctx);
        assert_eq!(session.agent_id, AgentId::new("earth"));
    }

    #[test]
    fn invalid_ids_yield_fallback_session() {
        let (mut oracle, _) = oracle_with_clock();
        let session =
            oracle.initialize_session(UserId::new(""), SessionId::new("s1"), &SessionContext::default());
        assert!(session.signals.safety_flag);
        assert_eq!(session.signals.confidence_level, Level::new(100));
        assert_eq!(session.agent_id, AgentId::new(SAFE_AGENT));
    }

    #[test]
    fn turn_on_unknown_session_returns_fallback() {
        let (mut oracle, _) = oracle_with_clock();
        let outcome =
            oracle.generate_response(&SessionId::new("missing"), "hello", &TurnContext::default());
        assert!(outcome.session.is_none());
        assert!(!outcome.stage_changed);
        assert_eq!(outcome.response.tone, Tone::Concerned);
        assert!(outcome.response.tags.iter().any(|t| t == PROCESSING_ERROR_TAG));
    }

    #[test]
    fn strong_turns_upgrade_one_stage_at_a_time() {
        let (mut oracle, _) = oracle_with_clock();
        let id = open(&mut oracle, "u1", "s1");

        let mut stages = Vec::new();
        for _ in 0..12 {
            let outcome = oracle.generate_response(&id, "hello", &strong());
            let session = outcome.session.expect("session");
            stages.push(session.current_stage());
        }
        for pair in stages.windows(2) {
            assert!(pair[1].index() <= pair[0].index() + 1);
        }
        assert_eq!(stages.last(), Some(&Stage::TransparentPrism));

        let history = oracle.session_history(&UserId::new("u1")).expect("history");
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|t| t.kind == TransitionKind::Upgrade));
        assert_eq!(oracle.current_stage(&UserId::new("u1")).expect("stage"), Stage::TransparentPrism);
    }

    #[test]
    fn transition_changes_agent_and_is_reported() {
        let (mut oracle, _) = oracle_with_clock();
        let id = open(&mut oracle, "u1", "s1");

        let mut changed = None;
        for _ in 0..10 {
            let outcome = oracle.generate_response(&id, "hello", &strong());
            if outcome.stage_changed {
                changed = Some(outcome);
                break;
            }
        }
        let outcome = changed.expect("an upgrade");
        let session = outcome.session.expect("session");
        assert_eq!(session.current_stage(), Stage::DialogicalCompanion);
        assert_eq!(session.agent_id, AgentId::new("maya"));
        assert_eq!(session.turns_in_stage, 1);
        assert_eq!(outcome.response.agent_id, AgentId::new("maya"));
        assert_eq!(
            oracle
                .session_history(&UserId::new("u1"))
                .expect("history")
                .last()
                .map(|t| t.to_stage),
            Some(Stage::DialogicalCompanion)
        );
    }

    #[test]
    fn safety_alert_collapses_on_next_turn() {
        let (mut oracle, _) = oracle_with_clock();
        let id = open(&mut oracle, "u1", "s1");
        for _ in 0..6 {
            oracle.generate_response(&id, "hello", &strong());
        }
        let before = oracle.active_session(&id).expect("get").expect("session");
        assert!(before.current_stage() > Stage::StructuredGuide);

        oracle.raise_safety_alert(&UserId::new("u1"), "external report");
        let outcome = oracle.generate_response(&id, "hello", &strong());
        let after = outcome.session.expect("session");
        assert_eq!(after.current_stage(), Stage::StructuredGuide);
        assert!(outcome.stage_changed);
        let transition = outcome.transition.expect("transition");
        assert!(transition.trigger.contains("safety_trigger"));
        assert!(!transition.user_notified);

        // The alert is consumed by one measurement.
        let next = oracle.generate_response(&id, "hello", &strong());
        assert!(!next.session.expect("session").signals.safety_flag);
    }

    #[test]
    fn crisis_language_sets_safety_flag() {
        let (mut oracle, _) = oracle_with_clock();
        let id = open(&mut oracle, "u1", "s1");
        let outcome = oracle.generate_response(&id, "I want to die", &TurnContext::default());
        let session = outcome.session.expect("session");
        assert!(session.signals.safety_flag);
        assert_eq!(session.current_stage(), Stage::StructuredGuide);
    }

    #[test]
    fn lowest_stage_replies_are_clamped_and_grounded() {
        let (mut oracle, _) = oracle_with_clock();
        let id = open(&mut oracle, "u1", "s1");
        let outcome = oracle.generate_response(&id, "hello", &TurnContext::default());
        assert!(outcome.response.intensity <= Level::new(400));
        assert!(outcome.response.tags.iter().any(|t| t == "grounding"));
    }

    #[test]
    fn agent_failure_returns_fallback_and_keeps_session() {
        let mut registry = AgentRegistry::with_builtin_agents();
        registry.register(Box::new(BrokenAgent(AgentId::new("grounding_guide"))));
        let mut oracle = Oracle::builder().agents(registry).build().expect("build");
        let id = open(&mut oracle, "u1", "s1");
        let before = oracle.active_session(&id).expect("get").expect("some");

        let ctx = TurnContext {
            observed: ObservedLevels {
                trust: Some(Level::new(350)),
                ..ObservedLevels::default()
            },
            metadata: BTreeMap::new(),
        };
        let outcome = oracle.generate_response(&id, "hello", &ctx);
        assert!(outcome.response.tags.iter().any(|t| t == PROCESSING_ERROR_TAG));

        let returned = outcome.session.expect("session");
        let stored = oracle.active_session(&id).expect("get").expect("some");
        assert_ne!(returned.signals, before.signals);
        assert_eq!(stored.signals, returned.signals);
    }

    /// Delegates to memory but refuses to commit transitions.
    struct RejectingStore {
        inner: InMemoryStore,
        commits: Arc<Mutex<usize>>,
    }

    impl SessionStore for RejectingStore {
        fn get(&self, id: &SessionId) -> Result<Option<PersonalOracleSession>, OracleError> {
            self.inner.get(id)
        }

        fn put(&mut self, session: PersonalOracleSession) -> Result<(), OracleError> {
            self.inner.put(session)
        }

        fn list(&self) -> Result<Vec<PersonalOracleSession>, OracleError> {
            self.inner.list()
        }

        fn remove(
            &mut self,
            id: &SessionId,
        ) -> Result<Option<PersonalOracleSession>, OracleError> {
            self.inner.remove(id)
        }

        fn append_transition(
            &mut self,
            user: &UserId,
            transition: StageTransition,
        ) -> Result<(), OracleError> {
            self.inner.append_transition(user, transition)
        }

        fn commit_transition(
            &mut self,
            _session: PersonalOracleSession,
            _transition: StageTransition,
        ) -> Result<(), OracleError> {
            *self.commits.lock().expect("lock") += 1;
            Err(OracleError::Storage("disk full".to_string()))
        }

        fn transitions(&self, user: &UserId) -> Result<Vec<StageTransition>, OracleError> {
            self.inner.transitions(user)
        }
    }

    #[test]
    fn failed_commit_leaves_no_partial_transition() {
        let commits = Arc::new(Mutex::new(0));
        let store = RejectingStore {
            inner: InMemoryStore::new(),
            commits: Arc::clone(&commits),
        };
        let mut oracle = Oracle::builder()
            .session_store(Box::new(store))
            .build()
            .expect("build");
        let id = open(&mut oracle, "u1", "s1");

        for _ in 0..6 {
            let outcome = oracle.generate_response(&id, "hello", &strong());
            assert!(!outcome.stage_changed);
            assert!(outcome.transition.is_none());
        }

        assert!(*commits.lock().expect("lock") > 0);
        assert!(oracle.session_history(&UserId::new("u1")).expect("history").is_empty());
        let stored = oracle.active_session(&id).expect("get").expect("some");
        assert_eq!(stored.current_stage(), Stage::StructuredGuide);
        assert!(stored.stage_history().is_empty());
    }

    #[test]
    fn oversized_input_is_rejected_with_fallback() {
        let (mut oracle, _) = oracle_with_clock();
        let id = open(&mut oracle, "u1", "s1");
        let input = "a".repeat(MAX_INPUT_LENGTH + 1);
        let outcome = oracle.generate_response(&id, &input, &TurnContext::default());
        assert_eq!(outcome.response.tone, Tone::Concerned);
        assert_eq!(outcome.session.expect("session").turn_count, 0);
    }

    #[test]
    fn returning_user_starts_at_classified_stage() {
        let (mut oracle, _) = oracle_with_clock();
        let id = open(&mut oracle, "u1", "s1");
        for _ in 0..6 {
            oracle.generate_response(&id, "hello", &strong());
        }
        oracle.end_session(&id).expect("end");

        let session = oracle.initialize_session(
            UserId::new("u1"),
            SessionId::new("s2"),
            &SessionContext::default(),
        );
        assert!(session.current_stage() > Stage::StructuredGuide);
        assert!(session.current_stage() < Stage::TransparentPrism);
    }

    #[test]
    fn lowest_policy_ignores_signals() {
        let mut oracle = Oracle::builder()
            .settings(OracleSettings {
                initial_stage_policy: InitialStagePolicy::Lowest,
            })
            .build()
            .expect("build");
        let id = open(&mut oracle, "u1", "s1");
        for _ in 0..6 {
            oracle.generate_response(&id, "hello", &strong());
        }
        let session = oracle.initialize_session(
            UserId::new("u1"),
            SessionId::new("s2"),
            &SessionContext::default(),
        );
        assert_eq!(session.current_stage(), Stage::StructuredGuide);
    }

    #[test]
    fn events_are_emitted() {
        let (mut oracle, _) = oracle_with_clock();
        let topics = Arc::new(Mutex::new(Vec::new()));
        for topic in [Topic::SessionInitialized, Topic::ResponseGenerated, Topic::StageChanged] {
            let sink = Arc::clone(&topics);
            oracle.event_bus().subscribe(topic, move |e| {
                sink.lock().expect("lock").push(e.topic());
            });
        }

        let id = open(&mut oracle, "u1", "s1");
        for _ in 0..4 {
            oracle.generate_response(&id, "hello", &strong());
        }
        let seen = topics.lock().expect("lock");
        assert_eq!(seen.first(), Some(&Topic::SessionInitialized));
        assert!(seen.contains(&Topic::ResponseGenerated));
        assert!(seen.contains(&Topic::StageChanged));
    }

    #[test]
    fn progress_and_queries() {
        let (mut oracle, clock) = oracle_with_clock();
        let id = open(&mut oracle, "u1", "s1");
        oracle.generate_response(&id, "hello", &TurnContext::default());

        let progress = oracle.stage_progress(&id).expect("progress");
        assert_eq!(progress.current, Stage::StructuredGuide);
        assert_eq!(progress.next, Some(Stage::DialogicalCompanion));
        assert!(!progress.blocking.is_empty());

        let explanation = oracle.explain_signals(&UserId::new("u1")).expect("explain");
        assert!(!explanation.lines.is_empty());

        clock.advance(Duration::days(2));
        assert_eq!(oracle.signal_history(&UserId::new("u1"), 1).expect("h").len(), 0);
        assert_eq!(oracle.signal_history(&UserId::new("u1"), 3).expect("h").len(), 1);
        assert!(oracle.signal_history(&UserId::new("u1"), 10_000).is_err());

        assert!(matches!(
            oracle.stage_progress(&SessionId::new("missing")),
            Err(OracleError::SessionNotFound(_))
        ));
    }

    #[test]
    fn end_session_keeps_history() {
        let (mut oracle, _) = oracle_with_clock();
        let id = open(&mut oracle, "u1", "s1");
        for _ in 0..6 {
            oracle.generate_response(&id, "hello", &strong());
        }
        let before = oracle.session_history(&UserId::new("u1")).expect("h").len();
        oracle.end_session(&id).expect("end");
        assert!(oracle.active_session(&id).expect("get").is_none());
        assert!(matches!(oracle.end_session(&id), Err(OracleError::SessionNotFound(_))));
        assert_eq!(oracle.session_history(&UserId::new("u1")).expect("h").len(), before);
    }

    #[test]
    fn dropping_oracle_releases_bus_subscription() {
        let bus = EventBus::new();
        {
            let _oracle = Oracle::builder().event_bus(bus.clone()).build().expect("build");
            assert_eq!(bus.subscription_count(), 1);
        }
        assert_eq!(bus.subscription_count(), 0);
    }
}
