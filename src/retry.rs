//! The two looping composite commands, `repeat` and `retry`. Both delegate
//! each pass to `Orchestrator::execute_commands_subflow`, the
//! same loop a nested `run-flow` uses, so a child that is itself a
//! `run-flow`/`repeat`/`retry` composes without special-casing here.

use tracing::warn;

use crate::condition;
use crate::error::DomainError;
use crate::interpreter::{self, ExecError, Orchestrator};
use crate::protocol::{CommandEnvelope, FlowConfig, Insight, InsightLevel};

/// Safety net for a condition-driven (no `times`) repeat: bounds how many
/// passes an always-true condition can drive before the loop gives up,
/// since nothing else would ever stop it.
const MAX_CONDITIONAL_REPEAT_ITERATIONS: u32 = 1_000;

/// `max_retries` is flow-authored input; capped at 3 total retries
/// regardless of what the flow asks for.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Runs `repeat`. `times`, already substituted by the script engine, is
/// either a literal count or absent (condition-driven). Zero iterations
/// raises `CommandSkipped` rather than completing vacuously.
pub(crate) async fn run_repeat(
    orchestrator: &Orchestrator,
    raw: &CommandEnvelope,
    times: Option<&str>,
    commands: &[CommandEnvelope],
    cfg: &FlowConfig,
) -> Result<bool, ExecError> {
    let fixed_count = match times {
        Some(raw_times) => Some(raw_times.trim().parse::<u32>().map_err(|_| {
            DomainError::InvalidCommand(format!("repeat times `{raw_times}` is not a number"))
        })?),
        None => None,
    };

    if fixed_count == Some(0) {
        return Err(ExecError::Skipped);
    }

    let mut mutated = false;
    let mut iteration: u32 = 0;

    loop {
        let proceed = match fixed_count {
            Some(n) => iteration < n,
            None => match &raw.condition {
                Some(condition) if !condition.is_empty() => {
                    condition::evaluate(
                        condition,
                        orchestrator.driver.as_ref(),
                        orchestrator.clock.adjusted(interpreter::DEFAULT_LOOKUP_TIMEOUT),
                    )
                    .await?
                }
                _ => iteration == 0,
            },
        };
        if !proceed {
            break;
        }
        if fixed_count.is_none() && iteration >= MAX_CONDITIONAL_REPEAT_ITERATIONS {
            break;
        }

        if iteration > 0 {
            for child in commands {
                reset_recursive(orchestrator, child);
            }
        }

        iteration += 1;
        orchestrator
            .metadata
            .with(raw.id, |m| m.number_of_runs = iteration);

        let ran = orchestrator.execute_commands_subflow(commands, cfg).await?;
        mutated |= ran;
    }

    Ok(mutated)
}

fn reset_recursive(orchestrator: &Orchestrator, command: &CommandEnvelope) {
    orchestrator.observer.on_command_reset(command);
    orchestrator.metadata.reset_runs(command.id);
    for child in command.kind.children() {
        reset_recursive(orchestrator, child);
    }
}

/// Runs `retry`: re-runs the body up to `max_retries` additional times
/// after an initial attempt, capped at [`MAX_RETRY_ATTEMPTS`], raising a
/// warning insight between attempts and rethrowing the final failure.
pub(crate) async fn run_retry(
    orchestrator: &Orchestrator,
    raw: &CommandEnvelope,
    max_retries: Option<u32>,
    commands: &[CommandEnvelope],
    cfg: &FlowConfig,
) -> Result<bool, ExecError> {
    let max_attempts = max_retries.unwrap_or(1).min(MAX_RETRY_ATTEMPTS) + 1;

    for attempt in 1..=max_attempts {
        match orchestrator.execute_commands_subflow(commands, cfg).await {
            Ok(mutated) => return Ok(mutated),
            Err(failure) => {
                if attempt == max_attempts {
                    return Err(ExecError::Failure(failure));
                }
                let message = failure.to_string();
                warn!(attempt, max_attempts, %message, "retry attempt failed");
                orchestrator.metadata.with(raw.id, |m| {
                    m.insight = Some(Insight {
                        level: InsightLevel::Warning,
                        message: message.clone(),
                    });
                });
            }
        }
    }
    unreachable!("loop always returns before exhausting attempts")
}
