//! Drives a nested `run-flow` command body with its own lexical and
//! variable-binding scope, and with its own `onFlowStart`/`onFlowComplete`
//! hooks from the `run-flow` command's own (possibly absent)
//! configuration.
//!
//! Differs from the top-level loop in one respect: a `FAIL` resolution
//! propagates as an error instead of folding into a bool, so an enclosing
//! `retry` can catch it; the return value is "did any command mutate
//! device state", not "did the sub-flow succeed".

use crate::error::CommandFailure;
use crate::interpreter::{ExecError, Orchestrator};
use crate::protocol::{CommandEnvelope, CommandKind, FlowConfig};

pub(crate) async fn run_sub_flow(
    orchestrator: &Orchestrator,
    commands: &[CommandEnvelope],
    parent_cfg: &FlowConfig,
    sub_cfg: &FlowConfig,
) -> Result<bool, ExecError> {
    let engine = orchestrator.script_engine.as_ref();
    engine.enter_scope();
    engine.enter_env_scope();

    let define_variables: Vec<CommandEnvelope> = commands
        .iter()
        .filter(|c| matches!(c.kind, CommandKind::DefineVariables { .. }))
        .cloned()
        .collect();
    let filtered: Vec<CommandEnvelope> = commands
        .iter()
        .filter(|c| !matches!(c.kind, CommandKind::DefineVariables { .. }))
        .cloned()
        .collect();

    let result = if define_variables.is_empty() {
        run_body(orchestrator, &filtered, parent_cfg, sub_cfg).await
    } else {
        match orchestrator
            .execute_commands_subflow(&define_variables, sub_cfg)
            .await
        {
            Ok(_) => run_body(orchestrator, &filtered, parent_cfg, sub_cfg).await,
            Err(e) => Err(ExecError::Failure(e)),
        }
    };

    // Scopes close symmetrically regardless of outcome, so scope depth
    // stays balanced even when the body raised.
    engine.leave_env_scope();
    engine.leave_scope();

    result
}

async fn run_body(
    orchestrator: &Orchestrator,
    filtered: &[CommandEnvelope],
    parent_cfg: &FlowConfig,
    sub_cfg: &FlowConfig,
) -> Result<bool, ExecError> {
    let mut mutated = false;
    let mut first_err: Option<CommandFailure> = None;

    if !sub_cfg.on_flow_start.is_empty() {
        match orchestrator
            .execute_commands_subflow(&sub_cfg.on_flow_start, parent_cfg)
            .await
        {
            Ok(m) => mutated |= m,
            Err(e) => {
                first_err = Some(e);
            }
        }
    }

    if first_err.is_none() {
        match orchestrator.execute_commands_subflow(filtered, parent_cfg).await {
            Ok(m) => mutated |= m,
            Err(e) => {
                first_err = Some(e);
            }
        }
    }

    if !sub_cfg.on_flow_complete.is_empty() {
        match orchestrator
            .execute_commands_subflow(&sub_cfg.on_flow_complete, parent_cfg)
            .await
        {
            Ok(m) => mutated |= m,
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(ExecError::Failure(e)),
        None => Ok(mutated),
    }
}
