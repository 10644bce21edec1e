//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use super::EvaluateArgs;
use crate::api;
use crate::config::{Backend, OracleConfig};
use chrono::Utc;
use oracle_core::{
    CapacitySignals, Level, OracleError, Stage, StageEvaluator, StageTable, Trajectory, UserId,
};

/// Print a value as pretty JSON.
fn print_json<T: serde::Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

fn warn_if_volatile(config: &OracleConfig) {
    if config.storage.backend == Backend::Memory {
        tracing::warn!(
            event = "volatile_backend",
            "memory backend keeps no state between runs; pass --database to read a redb store"
        );
    }
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

/// Start the HTTP server.
pub async fn cmd_server(
    config: OracleConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), OracleError> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let oracle = config.build_oracle()?;

    println!("Oracle Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Host:     {}", host);
    println!("  Port:     {}", port);
    println!("  Backend:  {}", config.storage.backend);
    if config.storage.backend == Backend::Redb {
        println!("  Database: {:?}", config.storage.database);
    }
    println!();
    println!("Endpoints:");
    println!("  POST   /sessions               - Start a session");
    println!("  GET    /sessions/{{id}}          - Read a session");
    println!("  DELETE /sessions/{{id}}          - End a session");
    println!("  POST   /sessions/{{id}}/turns    - Send a turn");
    println!("  GET    /sessions/{{id}}/progress - Progress to the next stage");
    println!("  GET    /users/{{id}}/stage       - Current stage");
    println!("  GET    /users/{{id}}/history     - Stage transitions");
    println!("  GET    /users/{{id}}/signals     - Capacity signals");
    println!("  POST   /safety-alerts          - Report a safety concern");
    println!("  GET    /stages                 - Stage table");
    println!("  GET    /health                 - Health check");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let addr = format!("{}:{}", host, port);
    api::run_server(&addr, oracle).await
}

// =============================================================================
// STAGES COMMAND
// =============================================================================

/// Print the configured stage table.
pub fn cmd_stages(config: &OracleConfig, json_mode: bool) -> Result<(), OracleError> {
    let table = config.stages.clone().unwrap_or_default();

    if json_mode {
        print_json(&table);
        return Ok(());
    }

    println!("Oracle Stage Table");
    println!("==================");
    for stage in Stage::ALL {
        print_stage(&table, stage);
    }
    println!();
    println!("A safety flag collapses any stage to {}.", Stage::lowest());
    Ok(())
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    if items.is_empty() {
        return "-".to_string();
    }
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_stage(table: &StageTable, stage: Stage) {
    let config = table.get(stage);
    println!();
    println!("{} ({})", stage.name(), stage);
    println!("  Default agent:   {}", config.default_agent);
    println!("  Allowed agents:  {}", join(&config.allowed_agents));
    println!("  Restricted:      {}", join(&config.restricted_agents));
    println!(
        "  Style:           complexity {} / metaphor {} / challenge {}",
        config.response_style.complexity,
        config.response_style.metaphor_density,
        config.response_style.challenge_frequency
    );
    println!(
        "  Safety:          max intensity {} / grounding {}",
        config.safety.max_intensity, config.safety.grounding_frequency
    );
    let filters: Vec<String> = config
        .safety
        .content_filters
        .iter()
        .map(|f| format!("{:?}", f))
        .collect();
    println!("  Filters:         {}", join(&filters));

    for rule in &config.upgrade_rules {
        let sustained = rule
            .sustained_sessions
            .map(|n| format!(", sustained {}", n))
            .unwrap_or_default();
        println!(
            "  Upgrade when:    trust >= {}, engagement >= {}, integration >= {}, confidence >= {}{}",
            rule.trust_threshold,
            rule.engagement_threshold,
            rule.integration_threshold,
            rule.confidence_required,
            sustained
        );
    }
    for rule in &config.downgrade_rules {
        let mut parts = Vec::new();
        if let Some(floor) = rule.trust_floor {
            parts.push(format!("trust < {}", floor));
        }
        if let Some(floor) = rule.engagement_floor {
            parts.push(format!("engagement < {}", floor));
        }
        if let Some(floor) = rule.integration_floor {
            parts.push(format!("integration < {}", floor));
        }
        println!("  Downgrade when:  {}", join(&parts));
    }
}

// =============================================================================
// EVALUATE COMMAND
// =============================================================================

/// Run one evaluation against the configured table.
pub fn cmd_evaluate(
    config: &OracleConfig,
    json_mode: bool,
    args: &EvaluateArgs,
) -> Result<(), OracleError> {
    let current = Stage::parse(&args.stage)
        .ok_or_else(|| OracleError::InvalidInput(format!("Unknown stage '{}'", args.stage)))?;
    let table = config.stages.clone().unwrap_or_default();
    table.validate()?;

    let now = Utc::now();
    let signals = CapacitySignals {
        trust: Level::new(args.trust),
        engagement_depth: Level::new(args.engagement),
        integration_skill: Level::new(args.integration),
        safety_flag: args.safety,
        confidence_level: Level::new(args.confidence),
        trajectory: Trajectory::Stable,
        session_count: 1,
        last_updated: now,
    };

    let decision = StageEvaluator::new(&table).evaluate(current, &signals, &[], now);
    let progress = table.progress(decision.target, &signals);

    if json_mode {
        print_json(&serde_json::json!({
            "decision": decision,
            "progress": progress,
        }));
        return Ok(());
    }

    println!("Stage Evaluation");
    println!("================");
    println!("Current:  {}", decision.current.name());
    println!("Target:   {}", decision.target.name());
    match decision.kind {
        Some(kind) if decision.should_change => {
            println!("Change:   yes ({:?})", kind);
            println!("Trigger:  {}", decision.trigger);
        }
        _ => println!("Change:   no"),
    }
    println!();
    match progress.next {
        Some(next) => {
            println!("Toward {}: {}%", next.name(), progress.percent);
            for blocker in &progress.blocking {
                println!("  blocked by {}", blocker);
            }
        }
        None => println!("Terminal stage reached"),
    }
    Ok(())
}

// =============================================================================
// HISTORY COMMAND
// =============================================================================

/// Show a user's current stage and transition history.
pub fn cmd_history(config: &OracleConfig, json_mode: bool, user: &str) -> Result<(), OracleError> {
    warn_if_volatile(config);
    let oracle = config.build_oracle()?;
    let user_id = UserId::new(user);
    let stage = oracle.current_stage(&user_id)?;
    let transitions = oracle.session_history(&user_id)?;

    if json_mode {
        print_json(&serde_json::json!({
            "user_id": user_id,
            "current_stage": stage,
            "transitions": transitions,
        }));
        return Ok(());
    }

    println!("Stage History for {}", user_id);
    println!("Current stage: {}", stage.name());
    println!();
    if transitions.is_empty() {
        println!("No transitions recorded");
        return Ok(());
    }
    for t in &transitions {
        println!(
            "{}  {} -> {}  [{}]{}",
            t.timestamp.format("%Y-%m-%d %H:%M:%S"),
            t.from_stage,
            t.to_stage,
            t.trigger,
            if t.user_notified { "" } else { " (silent)" }
        );
    }
    Ok(())
}

// =============================================================================
// SESSIONS COMMAND
// =============================================================================

/// List live sessions.
pub fn cmd_sessions(config: &OracleConfig, json_mode: bool) -> Result<(), OracleError> {
    warn_if_volatile(config);
    let oracle = config.build_oracle()?;
    let sessions = oracle.sessions()?;

    if json_mode {
        print_json(&sessions);
        return Ok(());
    }

    println!("Live Sessions: {}", sessions.len());
    for s in &sessions {
        println!(
            "  {}  user={}  stage={}  agent={}  turns={}  last={}",
            s.session_id,
            s.user_id,
            s.current_stage(),
            s.agent_id,
            s.turn_count,
            s.last_activity.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
