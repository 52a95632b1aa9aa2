//! Single-shot supervised run of an external process.

use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::{ProcessRunConfig, RunOutcome, SignalListener};
use crate::error::{BuildError, Result};

/// Run `config.executable` to completion, deadline, cancellation or signal.
///
/// The deadline covers the start delay as well as the run itself. Output is
/// streamed line by line into the log as it arrives.
///
/// # Errors
///
/// - [`BuildError::Spawn`] if the child cannot be started.
/// - [`BuildError::Process`] if the child exits unsuccessfully and
///   `config.fail_fast` is set.
/// - [`BuildError::Io`] if signal handlers cannot be installed or waiting on
///   the child fails.
pub async fn run_external_process(config: &ProcessRunConfig) -> Result<RunOutcome> {
    let label = config.display_label().to_string();
    let mut signals = SignalListener::install()?;
    let parent = config.cancel.clone().unwrap_or_default();

    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);

    if !config.delay_before_start.is_zero() {
        info!(
            process = %label,
            delay_secs = config.delay_before_start.as_secs(),
            "Delaying process start"
        );
        tokio::select! {
            () = tokio::time::sleep(config.delay_before_start) => {}
            signal = signals.recv() => {
                warn!(process = %label, %signal, "Process start interrupted by signal");
                return Ok(RunOutcome::Signaled(signal));
            }
            () = parent.cancelled() => {
                info!(process = %label, "Process start cancelled");
                return Ok(RunOutcome::Cancelled);
            }
            () = &mut deadline => {
                warn!(process = %label, "Process deadline elapsed before start");
                return Ok(RunOutcome::TimedOut);
            }
        }
    }

    info!(process = %label, command = %config.command_line(), "Starting process");

    let mut cmd = Command::new(&config.executable);
    cmd.args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    // Own process group so the whole script tree can be killed at once.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| BuildError::Spawn {
        command: config.executable.clone(),
        source,
    })?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain_lines(stdout, label.clone(), "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_lines(stderr, label.clone(), "stderr"));
    }

    let outcome = tokio::select! {
        status = child.wait() => exit_outcome(status?),
        () = &mut deadline => {
            kill_tree(&mut child, &label).await;
            warn!(
                process = %label,
                timeout_secs = config.timeout.as_secs(),
                "Process terminated due to timeout"
            );
            RunOutcome::TimedOut
        }
        () = parent.cancelled() => {
            kill_tree(&mut child, &label).await;
            info!(process = %label, "Process terminated due to cancellation");
            RunOutcome::Cancelled
        }
        signal = signals.recv() => {
            kill_tree(&mut child, &label).await;
            warn!(process = %label, %signal, "Process terminated due to signal");
            RunOutcome::Signaled(signal)
        }
    };

    match &outcome {
        RunOutcome::Completed => info!(process = %label, "Process finished successfully"),
        RunOutcome::Failed { exit_code } => {
            if config.fail_fast {
                error!(process = %label, exit_code = ?exit_code, "Process failed");
                return Err(BuildError::Process {
                    command: config.command_line(),
                    exit_code: *exit_code,
                });
            }
            warn!(process = %label, exit_code = ?exit_code, "Process finished with error");
        }
        _ => {}
    }

    Ok(outcome)
}

fn exit_outcome(status: ExitStatus) -> RunOutcome {
    if status.success() {
        RunOutcome::Completed
    } else {
        RunOutcome::Failed {
            exit_code: status.code(),
        }
    }
}

/// Log every line from `reader` until EOF.
async fn drain_lines<R>(reader: R, label: String, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(process = %label, stream, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(process = %label, stream, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

/// Best-effort kill of the child and everything in its process group. No
/// grace period.
async fn kill_tree(child: &mut Child, label: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let group = format!("-{pid}");
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => debug!(process = %label, pid, "Killed process group"),
            Ok(status) => debug!(process = %label, pid, ?status, "Process group kill reported failure"),
            Err(e) => debug!(process = %label, pid, error = %e, "Could not run kill"),
        }
    }

    if let Err(e) = child.kill().await {
        debug!(process = %label, error = %e, "Child already gone");
    }
}
