//! Bounded retries around [`run_external_process`].

use std::future::Future;

use tokio::time::Instant;
use tracing::{info, warn};

use super::{ProcessRunConfig, RunOutcome, run_external_process};
use crate::error::Result;

/// Run `config` until it completes, retrying failed attempts.
///
/// See [`retry_with`] for the loop semantics.
pub async fn run_with_retries(config: &ProcessRunConfig) -> RunOutcome {
    retry_with(config, |_| run_external_process(config)).await
}

/// Drive `attempt` under the retry policy carried by `config`.
///
/// - At most `1 + config.retries` attempts, and no new attempt once
///   `config.timeout` has elapsed since the first one started. A single long
///   attempt can use up the whole budget.
/// - `config.retry_interval` is slept between attempts, never before the
///   first.
/// - Returns the attempt's outcome right away on success, on a signal or
///   parent cancellation, or when `config.interrupt` is found cancelled.
/// - Returns [`RunOutcome::Exhausted`] when the budget runs out.
///
/// `attempt` receives the zero-based attempt number. An `Err` counts as a
/// failed attempt.
pub async fn retry_with<F, Fut>(config: &ProcessRunConfig, mut attempt: F) -> RunOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<RunOutcome>>,
{
    let label = config.display_label();
    let started = Instant::now();
    let mut attempts = 0u32;
    let mut last_failure: Option<String> = None;

    while attempts <= config.retries && started.elapsed() < config.timeout {
        if attempts > 0 {
            info!(
                process = %label,
                attempt = attempts,
                retries = config.retries,
                last_error = last_failure.as_deref().unwrap_or("unknown"),
                "Retrying process"
            );
            if !config.retry_interval.is_zero() {
                match &config.interrupt {
                    Some(interrupt) => {
                        tokio::select! {
                            () = tokio::time::sleep(config.retry_interval) => {}
                            () = interrupt.cancelled() => {}
                        }
                    }
                    None => tokio::time::sleep(config.retry_interval).await,
                }
            }
            if interrupted(config) {
                info!(process = %label, "Received interrupt, stopping retries");
                return RunOutcome::Exhausted { attempts };
            }
        }

        let outcome = attempt(attempts).await;
        attempts += 1;

        let outcome = match outcome {
            Ok(outcome) if outcome.is_success() || outcome.is_terminal_interruption() => {
                return outcome;
            }
            Ok(outcome) => {
                last_failure = Some(format!("{outcome:?}"));
                outcome
            }
            Err(e) => {
                warn!(process = %label, attempt = attempts, error = %e, "Attempt failed");
                last_failure = Some(e.to_string());
                RunOutcome::Failed { exit_code: None }
            }
        };

        if interrupted(config) {
            info!(process = %label, "Received interrupt, stopping retries");
            return outcome;
        }
    }

    warn!(
        process = %label,
        attempts,
        last_error = last_failure.as_deref().unwrap_or("none"),
        "Process failed after all attempts"
    );
    RunOutcome::Exhausted { attempts }
}

/// Non-blocking check of the external interrupt.
fn interrupted(config: &ProcessRunConfig) -> bool {
    config
        .interrupt
        .as_ref()
        .is_some_and(tokio_util::sync::CancellationToken::is_cancelled)
}
