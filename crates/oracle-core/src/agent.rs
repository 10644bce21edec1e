//! # Agents
//!
//! Reply generators the oracle routes turns to.
//!
//! Agents are looked up by id in an [`AgentRegistry`]. The built-in set is a
//! group of deterministic template responders so the engine runs without any
//! external model; hosts register their own implementations of [`Agent`]
//! under the same ids (or new ones) to replace them.

use crate::signals::CapacitySignals;
use crate::system::{ResponseStyle, SafetyEnvelope, Stage, StageConfiguration};
use crate::{AgentId, Level, OracleError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Agent used when nothing else is eligible.
pub const SAFE_AGENT: &str = "grounding_guide";

/// Words of the user's input echoed back in template replies.
const ECHO_WORDS: usize = 12;

// =============================================================================
// ERRORS
// =============================================================================

/// Failures raised by an agent while generating a reply.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Nothing to respond to.
    #[error("empty input")]
    EmptyInput,

    /// The agent cannot serve requests right now.
    #[error("agent unavailable: {0}")]
    Unavailable(String),

    /// Generation started but failed.
    #[error("generation failed: {0}")]
    Generation(String),
}

// =============================================================================
// CONTEXT & RESPONSE
// =============================================================================

/// Emotional register of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Warm,
    Grounding,
    Curious,
    Reflective,
    Challenging,
    Concerned,
}

/// What an agent knows about the turn it is answering.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub stage: Stage,
    pub response_style: ResponseStyle,
    pub safety: SafetyEnvelope,
    pub signals: CapacitySignals,
    pub turn_count: u32,
    pub metadata: BTreeMap<String, String>,
}

impl AgentContext {
    /// Build the context for a stage configuration.
    #[must_use]
    pub fn for_stage(
        stage: Stage,
        config: &StageConfiguration,
        signals: &CapacitySignals,
        turn_count: u32,
    ) -> Self {
        Self {
            stage,
            response_style: config.response_style,
            safety: config.safety.clone(),
            signals: signals.clone(),
            turn_count,
            metadata: BTreeMap::new(),
        }
    }
}

/// A generated reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent_id: AgentId,
    pub content: String,
    pub intensity: Level,
    pub tone: Tone,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A reply generator.
pub trait Agent: Send + Sync {
    /// Registry id of this agent.
    fn id(&self) -> &AgentId;

    /// Answer one turn.
    fn respond(&self, input: &str, ctx: &AgentContext) -> Result<AgentResponse, AgentError>;
}

// =============================================================================
// TEMPLATE AGENT
// =============================================================================

/// Deterministic responder built from fixed phrases.
#[derive(Debug, Clone)]
pub struct TemplateAgent {
    id: AgentId,
    tone: Tone,
    base_intensity: Level,
    opening: &'static str,
    metaphor: &'static str,
    challenge: &'static str,
}

impl TemplateAgent {
    fn new(
        id: &str,
        tone: Tone,
        base_intensity: u16,
        opening: &'static str,
        metaphor: &'static str,
        challenge: &'static str,
    ) -> Self {
        Self {
            id: AgentId::new(id),
            tone,
            base_intensity: Level::new(base_intensity),
            opening,
            metaphor,
            challenge,
        }
    }
}

impl Agent for TemplateAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn respond(&self, input: &str, ctx: &AgentContext) -> Result<AgentResponse, AgentError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AgentError::EmptyInput);
        }

        let echo: Vec<&str> = trimmed.split_whitespace().take(ECHO_WORDS).collect();
        let mut content = format!("{} You said: \"{}\".", self.opening, echo.join(" "));
        let mut tags = vec![self.id.as_str().to_string()];

        let style = ctx.response_style;
        if style.metaphor_density > Level::new(500) {
            content.push(' ');
            content.push_str(self.metaphor);
            tags.push("metaphor".to_string());
        }
        // Challenges alternate so they never land on consecutive turns.
        if style.challenge_frequency > Level::new(400) && ctx.turn_count % 2 == 1 {
            content.push(' ');
            content.push_str(self.challenge);
            tags.push("challenge".to_string());
        }

        let intensity = Level::new(
            self.base_intensity
                .permille()
                .saturating_add(style.complexity.permille() / 4),
        );

        Ok(AgentResponse {
            agent_id: self.id.clone(),
            content,
            intensity,
            tone: self.tone,
            tags,
        })
    }
}

fn builtin_agents() -> Vec<TemplateAgent> {
    vec![
        TemplateAgent::new(
            SAFE_AGENT,
            Tone::Grounding,
            150,
            "Let's take this one step at a time.",
            "Notice your feet on the floor and your breath moving.",
            "What is one small thing you could do next?",
        ),
        TemplateAgent::new(
            "maya",
            Tone::Warm,
            300,
            "I'm here with you.",
            "It sounds like a path opening in front of you.",
            "What would change if you looked at it from the other side?",
        ),
        TemplateAgent::new(
            "earth",
            Tone::Grounding,
            200,
            "Let's find some solid ground.",
            "Roots grow slowly and hold firm.",
            "What is within reach for you today?",
        ),
        TemplateAgent::new(
            "water",
            Tone::Reflective,
            250,
            "Let's stay with what you're feeling.",
            "Feelings move like water and find their own level.",
            "What feeling sits underneath that one?",
        ),
        TemplateAgent::new(
            "fire",
            Tone::Challenging,
            500,
            "There's energy in what you're bringing.",
            "A spark only needs a little air to catch.",
            "What are you ready to commit to?",
        ),
        TemplateAgent::new(
            "air",
            Tone::Curious,
            400,
            "Let's look at this from a few angles.",
            "Ideas drift until something gives them shape.",
            "Which assumption here would you test first?",
        ),
        TemplateAgent::new(
            "aether",
            Tone::Reflective,
            600,
            "Let's hold the whole picture at once.",
            "Every thread you named belongs to one weave.",
            "What is the pattern asking of you?",
        ),
    ]
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Agents addressable by id.
#[derive(Default)]
pub struct AgentRegistry {
    agents: BTreeMap<AgentId, Box<dyn Agent>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AgentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in agents.
    #[must_use]
    pub fn with_builtin_agents() -> Self {
        let mut registry = Self::new();
        for agent in builtin_agents() {
            registry.register(Box::new(agent));
        }
        registry
    }

    /// Register an agent, replacing any agent with the same id.
    pub fn register(&mut self, agent: Box<dyn Agent>) {
        self.agents.insert(agent.id().clone(), agent);
    }

    /// Look up an agent.
    pub fn get(&self, id: &AgentId) -> Result<&dyn Agent, OracleError> {
        self.agents
            .get(id)
            .map(|agent| agent.as_ref())
            .ok_or_else(|| OracleError::AgentNotFound(id.clone()))
    }

    #[must_use]
    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    /// Registered ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &AgentId> {
        self.agents.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Choose the agent for a stage.
///
/// Order: the first preferred agent that is registered and eligible, then the
/// stage default, then any eligible registered agent from the allowed list,
/// then [`SAFE_AGENT`].
#[must_use]
pub fn select_agent(
    config: &StageConfiguration,
    registry: &AgentRegistry,
    preferred: &[AgentId],
) -> AgentId {
    let usable = |id: &AgentId| registry.contains(id) && config.is_agent_eligible(id);

    preferred
        .iter()
        .find(|id| usable(id))
        .or_else(|| Some(&config.default_agent).filter(|id| usable(id)))
        .or_else(|| config.allowed_agents.iter().find(|id| usable(id)))
        .cloned()
        .unwrap_or_else(|| {
            tracing::debug!(event = "agent_fallback", agent = SAFE_AGENT);
            AgentId::new(SAFE_AGENT)
        })
}

// =============================================================================
// TESTS
// =============================================================================
