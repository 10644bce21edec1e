//! # oracle-core
//!
//! The stage-gating engine for the Oracle - THE LOGIC.
//!
//! A conversational system serves each user at one of four maturity stages.
//! Every turn re-measures the user's capacity signals, the evaluator decides
//! whether to move one stage up or down (or collapse to the lowest stage on a
//! safety flag), and the reply is generated and filtered under the rules of
//! the resulting stage.
//!
//! ## Architectural Constraints
//!
//! - Synchronous: no async, no network dependencies
//! - Deterministic: `BTreeMap` collections, integer per-mille levels, no floats
//! - Injected collaborators: capacity store, session store, agents, clock
//! - Fail-safe boundaries: session initialization and turns never surface an error

// =============================================================================
// MODULES
// =============================================================================

pub mod agent;
pub mod capacity;
pub mod clock;
pub mod evaluator;
pub mod events;
pub mod oracle;
pub mod postprocess;
pub mod primitives;
pub mod session;
pub mod signals;
pub mod storage;
pub mod system;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{AgentId, Level, OracleError, SessionId, UserId};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use agent::{
    Agent, AgentContext, AgentError, AgentRegistry, AgentResponse, SAFE_AGENT, TemplateAgent,
    Tone, select_agent,
};
pub use capacity::{
    CapacityStore, InMemoryCapacityStore, ObservedLevels, SessionData, SignalExplanation,
    TurnObservation,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use evaluator::{StageDecision, StageEvaluator, recent_downgrade};
pub use events::{EventBus, OracleEvent, SubscriptionId, Topic};
pub use oracle::{
    InitialStagePolicy, Oracle, OracleBuilder, OracleSettings, SessionContext, TurnContext,
    TurnOutcome,
};
pub use session::{PersonalOracleSession, StageTransition, TransitionKind};
pub use signals::{CapacitySignals, SignalKind, Trajectory};
pub use storage::{InMemoryStore, RedbStore, SessionStore};

// =============================================================================
// RE-EXPORTS: System (from system module)
// =============================================================================

pub use system::{
    ContentFilter, DowngradeRule, ResponseStyle, SafetyEnvelope, Stage, StageConfiguration,
    StageProgress, StageTable, UpgradeRule,
};
