//! # Reply Post-Processing
//!
//! Applies a stage's safety envelope to an agent reply:
//! 1. intensity is clamped to `max_intensity`
//! 2. content filters run in the order the stage lists them
//! 3. grounding content is appended when `grounding_frequency` exceeds 0.5

use crate::agent::{AgentResponse, SAFE_AGENT, Tone};
use crate::system::{ContentFilter, SafetyEnvelope};
use crate::{AgentId, Level};
use regex::Regex;
use std::sync::LazyLock;

/// Appended to replies at stages that require grounding.
pub const GROUNDING_LINE: &str = "Take a slow breath and notice where you are right now.";

/// Content of the reply returned when a turn fails.
pub const FALLBACK_CONTENT: &str =
    "I'm having trouble responding right now. Let's pause and take a breath together.";

/// Intensity of the fallback reply.
pub const FALLBACK_INTENSITY: Level = Level::new(200);

/// Tag carried by the fallback reply.
pub const PROCESSING_ERROR_TAG: &str = "processing_error";

/// Used when filtering leaves nothing to say.
const EMPTY_AFTER_FILTER: &str = "Let's stay with what we know for now.";

static ABSTRACT_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(cosmic|universe|divine|sacred|transcendent|infinite|soul)\b")
        .expect("hardcoded regex")
});

static UNGROUNDED_CLAIM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(always|certainly|definitely|guaranteed|destined|meant to be)\b")
        .expect("hardcoded regex")
});

static SENTENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]*").expect("hardcoded regex"));

fn plain_word(term: &str) -> &'static str {
    match term.to_lowercase().as_str() {
        "cosmic" => "wide",
        "universe" => "world",
        "divine" => "meaningful",
        "sacred" => "important",
        "transcendent" => "larger",
        "infinite" => "vast",
        _ => "inner self",
    }
}

fn soften_abstract(content: &str) -> String {
    ABSTRACT_TERMS
        .replace_all(content, |caps: &regex::Captures<'_>| plain_word(&caps[0]))
        .into_owned()
}

fn drop_ungrounded(content: &str) -> String {
    let kept: Vec<&str> = SENTENCE
        .find_iter(content)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty() && !UNGROUNDED_CLAIM.is_match(s))
        .collect();
    if kept.is_empty() {
        EMPTY_AFTER_FILTER.to_string()
    } else {
        kept.join(" ")
    }
}

/// Apply one content filter.
#[must_use]
pub fn apply_filter(filter: ContentFilter, content: &str) -> String {
    match filter {
        ContentFilter::AbstractLanguage => soften_abstract(content),
        ContentFilter::UngroundedClaims => drop_ungrounded(content),
    }
}

/// Shape a reply to a safety envelope.
#[must_use]
pub fn apply_envelope(mut response: AgentResponse, safety: &SafetyEnvelope) -> AgentResponse {
    response.intensity = response.intensity.min(safety.max_intensity);

    for filter in &safety.content_filters {
        response.content = apply_filter(*filter, &response.content);
    }

    if safety.injects_grounding() {
        response.content.push(' ');
        response.content.push_str(GROUNDING_LINE);
        response.tags.push("grounding".to_string());
    }
    response
}

/// The fixed reply returned when a turn cannot be processed.
#[must_use]
pub fn fallback_reply() -> AgentResponse {
    AgentResponse {
        agent_id: AgentId::new(SAFE_AGENT),
        content: FALLBACK_CONTENT.to_string(),
        intensity: FALLBACK_INTENSITY,
        tone: Tone::Concerned,
        tags: vec![PROCESSING_ERROR_TAG.to_string()],
    }
}
