//! Sequence execution
//!
//! Steps run strictly in order. The first failing step aborts the run
//! (unless it is marked `continue_on_fail`), after which the script's
//! fail handler runs best-effort. Cancellation is checked at every step
//! boundary.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::sequence::{Expect, SequenceScript, SequenceStep, StepKind};
use crate::session::{SessionCore, SessionEvent, StepOutcome};

pub async fn run(
    session: &SessionCore,
    script: &SequenceScript,
    cancel: &AtomicBool,
) -> Result<(), SessionError> {
    for (index, step) in script.steps.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            info!(step = index, "sequence cancelled");
            return Err(SessionError::Cancelled);
        }

        emit_step(session, index, step, StepOutcome::Started);
        info!(step = index, name = %step.name, "running sequence step");

        match execute_step(session, script, step).await {
            Ok(()) => emit_step(session, index, step, StepOutcome::Passed),
            Err(e) if step.continue_on_fail => {
                warn!(step = index, name = %step.name, error = %e, "step failed, continuing");
                emit_step(session, index, step, StepOutcome::Failed(e.to_string()));
            }
            Err(e) => {
                warn!(step = index, name = %step.name, error = %e, "step failed, aborting");
                emit_step(session, index, step, StepOutcome::Failed(e.to_string()));
                run_fail_handler(session, script).await;
                return Err(SessionError::sequence_step(index, &step.name, e));
            }
        }
    }
    info!(steps = script.steps.len(), "sequence completed");
    Ok(())
}

async fn run_fail_handler(session: &SessionCore, script: &SequenceScript) {
    for step in &script.fail_handler {
        if let Err(e) = execute_step(session, script, step).await {
            warn!(name = %step.name, error = %e, "fail handler step failed");
        }
    }
}

async fn execute_step(
    session: &SessionCore,
    script: &SequenceScript,
    step: &SequenceStep,
) -> Result<(), SessionError> {
    // Connect and disconnect run under their own transport timeouts,
    // and a wait step must suspend for its full configured duration.
    if matches!(
        step.kind,
        StepKind::Connect | StepKind::Disconnect | StepKind::Wait { .. }
    ) {
        return execute_kind(session, script, step).await;
    }
    match timeout(step.timeout, execute_kind(session, script, step)).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::RequestTimeout),
    }
}

async fn execute_kind(
    session: &SessionCore,
    script: &SequenceScript,
    step: &SequenceStep,
) -> Result<(), SessionError> {
    match &step.kind {
        StepKind::Connect => match session.connect().await {
            // An already-open session satisfies a connect step
            Err(SessionError::AlreadyConnected) => Ok(()),
            other => other,
        },
        StepKind::Disconnect => session.disconnect().await,
        StepKind::Wait { duration } => {
            tokio::time::sleep(*duration).await;
            Ok(())
        }
        StepKind::SecurityAccess { level } => {
            let key = script.parameters.key_for(*level).ok_or_else(|| {
                SessionError::InvalidParameters(format!(
                    "no key material for security access level {level}"
                ))
            })?;
            session.security_access(*level, key).await
        }
        StepKind::SendDiag { requests, expects } => {
            for (request, expect) in requests.iter().zip(expects) {
                check_response(session, request, expect).await?;
            }
            Ok(())
        }
    }
}

async fn check_response(
    session: &SessionCore,
    request: &[u8],
    expect: &Expect,
) -> Result<(), SessionError> {
    let response = session.send_uds(request).await?;
    match response {
        // Suppressed request: nothing to check
        None => Ok(()),
        Some(response) if expect.matches(&response.raw) => Ok(()),
        Some(response) => Err(SessionError::UnexpectedResponse {
            expected: expect.describe(),
            received: hex::encode(&response.raw),
        }),
    }
}

fn emit_step(session: &SessionCore, index: usize, step: &SequenceStep, outcome: StepOutcome) {
    session.emit_event(SessionEvent::SequenceStep {
        index,
        name: step.name.clone(),
        outcome,
    });
}
