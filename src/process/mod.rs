//! External process supervision.
//!
//! Everything the build pipeline launches (the primary build script, the VNC
//! screenshot tool, the video encoder, the screen viewer) goes through
//! [`runner::run_external_process`], optionally wrapped by
//! [`retry::run_with_retries`].
//!
//! ```text
//! ProcessRunConfig ──► run_external_process ──► RunOutcome
//!        ▲                     │
//!        │               tokio::select! {
//!  ProcessOverrides        child exit | deadline | parent cancel | OS signal
//!                        }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub mod retry;
pub mod runner;
pub mod signals;

pub use retry::{retry_with, run_with_retries};
pub use runner::run_external_process;
pub use signals::{Shutdown, SignalListener, TerminationSignal};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Parameters for one external-process invocation.
///
/// `timeout` bounds a single run; for [`run_with_retries`] it also bounds the
/// total time spent across attempts.
#[derive(Debug, Clone)]
pub struct ProcessRunConfig {
    /// Program name or path, resolved through `PATH` when relative.
    pub executable: String,

    pub args: Vec<String>,

    /// Working directory of the child. Inherits ours when `None`.
    pub working_dir: Option<PathBuf>,

    /// Parent execution context. Cancelling it kills the child.
    pub cancel: Option<CancellationToken>,

    pub timeout: Duration,

    /// Wait this long before spawning. Signals, cancellation and the deadline
    /// all cut the wait short and abort the run.
    pub delay_before_start: Duration,

    /// Turn a non-zero exit into an `Err` instead of [`RunOutcome::Failed`].
    pub fail_fast: bool,

    /// Extra attempts after the first one (retry wrapper only).
    pub retries: u32,

    pub retry_interval: Duration,

    /// Stops the retry wrapper from starting further attempts once cancelled.
    /// A running attempt is not affected.
    pub interrupt: Option<CancellationToken>,

    /// Prefix for the child's log lines. Defaults to the executable.
    pub label: Option<String>,

    /// Substrings of the arguments masked in [`Self::command_line`].
    pub secrets: Vec<String>,
}

pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(10 * 60);

impl ProcessRunConfig {
    #[must_use]
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            cancel: None,
            timeout: DEFAULT_PROCESS_TIMEOUT,
            delay_before_start: Duration::ZERO,
            fail_fast: false,
            retries: 0,
            retry_interval: Duration::ZERO,
            interrupt: None,
            label: None,
            secrets: Vec::new(),
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn delay_before_start(mut self, delay: Duration) -> Self {
        self.delay_before_start = delay;
        self
    }

    #[must_use]
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    #[must_use]
    pub fn retries(mut self, retries: u32, interval: Duration) -> Self {
        self.retries = retries;
        self.retry_interval = interval;
        self
    }

    #[must_use]
    pub fn interrupt(mut self, token: CancellationToken) -> Self {
        self.interrupt = Some(token);
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Keep `secret` out of logs and error messages. Empty strings are
    /// ignored.
    #[must_use]
    pub fn redact(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }

    /// Label used in log lines for this process.
    #[must_use]
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.executable)
    }

    /// `executable arg1 arg2 …`, for log and error messages. Redacted
    /// secrets show as `***`.
    #[must_use]
    pub fn command_line(&self) -> String {
        let line = std::iter::once(self.executable.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.secrets
            .iter()
            .fold(line, |line, secret| line.replace(secret.as_str(), "***"))
    }

    /// Apply every field the caller explicitly set in `overrides`.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ProcessOverrides) -> Self {
        let ProcessOverrides {
            executable,
            args,
            working_dir,
            cancel,
            timeout,
            delay_before_start,
            fail_fast,
            retries,
            retry_interval,
            interrupt,
        } = overrides;

        if let Some(executable) = executable {
            self.executable = executable;
        }
        if let Some(args) = args {
            self.args = args;
        }
        if let Some(dir) = working_dir {
            self.working_dir = Some(dir);
        }
        if let Some(token) = cancel {
            self.cancel = Some(token);
        }
        if let Some(timeout) = timeout {
            self.timeout = timeout;
        }
        if let Some(delay) = delay_before_start {
            self.delay_before_start = delay;
        }
        if let Some(fail_fast) = fail_fast {
            self.fail_fast = fail_fast;
        }
        if let Some(retries) = retries {
            self.retries = retries;
        }
        if let Some(interval) = retry_interval {
            self.retry_interval = interval;
        }
        if let Some(token) = interrupt {
            self.interrupt = Some(token);
        }
        self
    }
}

/// Partial override of a [`ProcessRunConfig`].
///
/// `None` means "keep the base value"; `Some(Duration::ZERO)` or `Some(0)`
/// really sets the field to zero.
#[derive(Debug, Clone, Default)]
pub struct ProcessOverrides {
    pub executable: Option<String>,
    pub args: Option<Vec<String>>,
    pub working_dir: Option<PathBuf>,
    pub cancel: Option<CancellationToken>,
    pub timeout: Option<Duration>,
    pub delay_before_start: Option<Duration>,
    pub fail_fast: Option<bool>,
    pub retries: Option<u32>,
    pub retry_interval: Option<Duration>,
    pub interrupt: Option<CancellationToken>,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited with status zero.
    Completed,
    /// The process exited unsuccessfully. `exit_code` is `None` when the
    /// child was terminated by a signal we did not send.
    Failed { exit_code: Option<i32> },
    /// The deadline elapsed; the child (if started) was killed.
    TimedOut,
    /// The parent token was cancelled; the child (if started) was killed.
    Cancelled,
    /// An OS termination signal arrived; the child (if started) was killed.
    Signaled(TerminationSignal),
    /// Retry wrapper only: attempt budget or time budget ran out.
    Exhausted { attempts: u32 },
}

impl RunOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether the retry wrapper must stop instead of trying again.
    #[must_use]
    pub fn is_terminal_interruption(&self) -> bool {
        matches!(self, Self::Signaled(_) | Self::Cancelled)
    }
}
