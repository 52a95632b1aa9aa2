//! OS termination signals.
//!
//! SIGINT, SIGTERM, SIGHUP and SIGQUIT are all treated the same way: kill the
//! active child and abort. Every supervised run installs its own
//! [`SignalListener`]; tokio delivers each signal to all registered listeners.
//!
//! Once tokio has registered a handler the default disposition is gone for
//! the life of the process, so anything that runs several children in a row
//! holds a [`Shutdown`] listening for the whole sequence. Otherwise a signal
//! arriving between two children would be dropped.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The termination signal that interrupted a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
            Self::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Unix implementation
// ---------------------------------------------------------------------------

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    use super::TerminationSignal;

    /// Registered handlers for the four termination signals.
    ///
    /// Install before spawning so a signal arriving during start-up is not
    /// lost to the default disposition.
    pub struct SignalListener {
        interrupt: Signal,
        terminate: Signal,
        hangup: Signal,
        quit: Signal,
    }

    impl SignalListener {
        pub fn install() -> std::io::Result<Self> {
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
                hangup: signal(SignalKind::hangup())?,
                quit: signal(SignalKind::quit())?,
            })
        }

        /// Resolve with the first termination signal received.
        pub async fn recv(&mut self) -> TerminationSignal {
            tokio::select! {
                _ = self.interrupt.recv() => TerminationSignal::Interrupt,
                _ = self.terminate.recv() => TerminationSignal::Terminate,
                _ = self.hangup.recv() => TerminationSignal::Hangup,
                _ = self.quit.recv() => TerminationSignal::Quit,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Non-Unix fallback: Ctrl-C only
// ---------------------------------------------------------------------------

#[cfg(not(unix))]
mod imp {
    use super::TerminationSignal;

    pub struct SignalListener {
        _private: (),
    }

    impl SignalListener {
        pub fn install() -> std::io::Result<Self> {
            Ok(Self { _private: () })
        }

        pub async fn recv(&mut self) -> TerminationSignal {
            match tokio::signal::ctrl_c().await {
                Ok(()) => TerminationSignal::Interrupt,
                Err(e) => {
                    tracing::warn!(error = %e, "Ctrl-C handler unavailable");
                    std::future::pending().await
                }
            }
        }
    }
}

pub use imp::SignalListener;

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Stop request shared by every build of a run: a cancellation token plus
/// the termination signal that caused it, if one did.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    signal: Arc<OnceLock<TerminationSignal>>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Stop without a signal, e.g. from a caller giving up on the run.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Record `signal` and stop. Only the first signal is kept.
    pub fn signal_received(&self, signal: TerminationSignal) {
        let _ = self.signal.set(signal);
        self.token.cancel();
    }

    pub fn signal(&self) -> Option<TerminationSignal> {
        self.signal.get().copied()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Register the signal handlers now and forward every termination
    /// signal to [`Shutdown::signal_received`] until the returned task is
    /// aborted. Must be called from inside a runtime.
    pub fn listen(&self) -> std::io::Result<JoinHandle<()>> {
        let mut listener = SignalListener::install()?;
        let shutdown = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let signal = listener.recv().await;
                warn!(%signal, "Termination signal received, shutting down");
                shutdown.signal_received(signal);
            }
        }))
    }
}
