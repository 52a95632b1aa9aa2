//! Per-build coordinator.
//!
//! ```text
//! Gating ──► Reconciling ──► PortBinding ──► Running ──► Finalizing
//!   │                                          │  ├─ viewer   (detached)
//!   └─► AlreadyBuilt                           │  └─ capture  (JoinHandle<RecordingConfig>)
//!                                              ▼
//!                       interrupt capture retries, clean up on failure,
//!                       join capture (bounded), encode once
//! ```
//!
//! Every path that gets past gating goes through `Finalizing`, so a failed
//! or interrupted build never leaves partial artifacts behind and the
//! recording is always encoded from whatever was captured.
//!
//! The [`Shutdown`] is checked between phases as well as while a child runs.
//! A build stopped by a termination signal fails with
//! [`BuildError::Signal`] whichever phase it was in.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::artifacts;
use super::plan::{BuildPlanner, ProjectPlanner};
use super::ports::find_free_vnc_port;
use super::reconcile::{MediaReconciler, Reconciler};
use super::recording::{Recorder, RecordingConfig};
use super::viewer::open_screen_viewer;
use crate::error::{BuildError, BuildStatus, Result};
use crate::paths::ProjectDirs;
use crate::process::{
    ProcessOverrides, ProcessRunConfig, RunOutcome, Shutdown, run_external_process,
};
use crate::settings::Settings;
use crate::vm::{VirtualMachineConfig, catalog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Gating,
    Reconciling,
    PortBinding,
    Running,
    Finalizing,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gating => "gating",
            Self::Reconciling => "reconciling",
            Self::PortBinding => "port_binding",
            Self::Running => "running",
            Self::Finalizing => "finalizing",
        })
    }
}

fn enter(slug: &str, phase: BuildPhase) {
    info!(slug = %slug, %phase, "Build phase");
}

pub struct BuildSupervisor {
    dirs: Arc<ProjectDirs>,
    settings: Settings,
    catalog: Vec<VirtualMachineConfig>,
    reconciler: Arc<dyn Reconciler>,
    recorder: Arc<Recorder>,
    planner: Arc<dyn BuildPlanner>,
}

impl BuildSupervisor {
    /// Supervisor wired to the checkout at `dirs`: project catalog, install
    /// media checks, host-detected recording and the project build scripts.
    #[must_use]
    pub fn new(dirs: Arc<ProjectDirs>, settings: Settings) -> Self {
        Self {
            catalog: catalog::available_configs(&dirs),
            reconciler: Arc::new(MediaReconciler::for_project(&dirs)),
            recorder: Arc::new(Recorder::new(Arc::clone(&dirs))),
            planner: Arc::new(ProjectPlanner),
            dirs,
            settings,
        }
    }

    #[must_use]
    pub fn with_catalog(mut self, catalog: Vec<VirtualMachineConfig>) -> Self {
        self.catalog = catalog;
        self
    }

    #[must_use]
    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = reconciler;
        self
    }

    #[must_use]
    pub fn with_recorder(mut self, recorder: Recorder) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    #[must_use]
    pub fn with_planner(mut self, planner: Arc<dyn BuildPlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn dirs(&self) -> &ProjectDirs {
        &self.dirs
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn catalog(&self) -> &[VirtualMachineConfig] {
        &self.catalog
    }

    /// Build `vm` with the configured planner.
    ///
    /// On return `vm` carries the resolved artifact list and the VNC port the
    /// build actually used.
    pub async fn build(
        &self,
        vm: &mut VirtualMachineConfig,
        shutdown: &Shutdown,
    ) -> Result<BuildStatus> {
        let planner = Arc::clone(&self.planner);
        self.build_with(vm, shutdown, planner.as_ref()).await
    }

    /// Build `vm` with an explicit planner. Cancelling `shutdown` kills the
    /// build and everything it started.
    pub async fn build_with(
        &self,
        vm: &mut VirtualMachineConfig,
        shutdown: &Shutdown,
        planner: &dyn BuildPlanner,
    ) -> Result<BuildStatus> {
        let slug = vm.slug().to_string();
        let started = Instant::now();

        enter(&slug, BuildPhase::Gating);
        checkpoint(&slug, shutdown)?;
        if artifacts::already_built(vm, &self.catalog)? {
            return Ok(BuildStatus::AlreadyBuilt);
        }

        let build_token = shutdown.token().child_token();
        let capture_interrupt = CancellationToken::new();
        let mut capture = None;

        let result = self
            .run(vm, planner, shutdown, &build_token, &capture_interrupt, &mut capture)
            .await;

        enter(&slug, BuildPhase::Finalizing);
        capture_interrupt.cancel();

        if let Err(e) = &result {
            error!(slug = %slug, error = %e, "Build failed, removing partial artifacts");
            build_token.cancel();
            if let Err(e) = artifacts::remove_artifacts(&vm.expected_artifacts) {
                warn!(slug = %slug, error = %e, "Artifact cleanup incomplete");
            }
        }

        if let Some(handle) = capture {
            if let Some(recording) = self.join_capture(&slug, handle, &build_token).await {
                self.encode(&slug, &recording).await;
            }
        }
        build_token.cancel();

        let elapsed_secs = started.elapsed().as_secs();
        match &result {
            Ok(()) => info!(slug = %slug, port = vm.vnc_port, elapsed_secs, "Build finished successfully"),
            Err(e) => info!(slug = %slug, status = ?e.status(), elapsed_secs, "Build ended"),
        }
        result.map(|()| BuildStatus::Succeeded)
    }

    async fn run(
        &self,
        vm: &mut VirtualMachineConfig,
        planner: &dyn BuildPlanner,
        shutdown: &Shutdown,
        build_token: &CancellationToken,
        capture_interrupt: &CancellationToken,
        capture: &mut Option<JoinHandle<RecordingConfig>>,
    ) -> Result<()> {
        let slug = vm.slug().to_string();

        enter(&slug, BuildPhase::Reconciling);
        self.reconcile(vm).await?;
        checkpoint(&slug, shutdown)?;
        for step in planner.preparation(vm, &self.dirs) {
            prepare(&slug, step, shutdown, build_token).await?;
        }

        enter(&slug, BuildPhase::PortBinding);
        vm.vnc_port = find_free_vnc_port(vm.vnc_port).await?;
        checkpoint(&slug, shutdown)?;

        enter(&slug, BuildPhase::Running);
        let command = planner
            .command(vm, &self.dirs)?
            .timeout(self.settings.build.timeout())
            .cancel(build_token.clone())
            .fail_fast(false);

        self.spawn_viewer(vm, build_token);
        *capture = self.spawn_capture(vm, build_token, capture_interrupt);

        info!(slug = %slug, port = vm.vnc_port, command = %command.command_line(), "Running build");
        primary_result(&slug, &command, shutdown, run_external_process(&command).await)
    }

    /// Reconcilers touch the filesystem synchronously, so they run on the
    /// blocking pool.
    async fn reconcile(&self, vm: &VirtualMachineConfig) -> Result<()> {
        let reconciler = Arc::clone(&self.reconciler);
        let vm = vm.clone();
        tokio::task::spawn_blocking(move || reconciler.reconcile(&vm))
            .await
            .map_err(std::io::Error::other)?
    }

    fn spawn_viewer(&self, vm: &VirtualMachineConfig, build_token: &CancellationToken) {
        if !self.settings.viewer.enabled {
            return;
        }
        let vm = vm.clone();
        let password = self.settings.recording.password.clone();
        let overrides = ProcessOverrides {
            cancel: Some(build_token.clone()),
            ..self.settings.viewer.overrides()
        };
        tokio::spawn(async move {
            open_screen_viewer(&vm, &password, overrides).await;
        });
    }

    fn spawn_capture(
        &self,
        vm: &VirtualMachineConfig,
        build_token: &CancellationToken,
        interrupt: &CancellationToken,
    ) -> Option<JoinHandle<RecordingConfig>> {
        if !self.settings.recording.enabled {
            return None;
        }
        let recorder = Arc::clone(&self.recorder);
        let vm = vm.clone();
        let mut recording = RecordingConfig::new(self.settings.recording.password.clone());
        let overrides = ProcessOverrides {
            cancel: Some(build_token.clone()),
            interrupt: Some(interrupt.clone()),
            ..self
                .settings
                .recording
                .capture_overrides(self.settings.build.timeout())
        };

        Some(tokio::spawn(async move {
            match recorder.capture(&vm, overrides, &mut recording).await {
                Ok(Some(outcome)) => debug!(slug = vm.slug(), ?outcome, "Screen capture ended"),
                Ok(None) => {}
                Err(e) => warn!(slug = vm.slug(), error = %e, "Screen capture failed"),
            }
            recording
        }))
    }

    /// Wait for the capture task, cancelling it if it outlives the grace
    /// period.
    async fn join_capture(
        &self,
        slug: &str,
        mut handle: JoinHandle<RecordingConfig>,
        build_token: &CancellationToken,
    ) -> Option<RecordingConfig> {
        let grace = self.settings.recording.stop_grace();
        let joined = match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(slug = %slug, grace_secs = grace.as_secs(), "Screen capture still running, stopping it");
                build_token.cancel();
                handle.await
            }
        };
        match joined {
            Ok(recording) => Some(recording),
            Err(e) => {
                warn!(slug = %slug, error = %e, "Screen capture task did not complete");
                None
            }
        }
    }

    async fn encode(&self, slug: &str, recording: &RecordingConfig) {
        match self
            .recorder
            .encode(self.settings.recording.encode_overrides(), recording)
            .await
        {
            Ok(Some(outcome)) => debug!(slug = %slug, ?outcome, "Video encode ended"),
            Ok(None) => {}
            Err(e) => warn!(slug = %slug, error = %e, "Video encode failed"),
        }
    }
}

/// Fail with the reason for the shutdown once one has been requested.
fn checkpoint(slug: &str, shutdown: &Shutdown) -> Result<()> {
    if shutdown.is_cancelled() {
        Err(interruption(slug, shutdown))
    } else {
        Ok(())
    }
}

/// `Signal` when a termination signal stopped the run, `Cancelled` otherwise.
fn interruption(slug: &str, shutdown: &Shutdown) -> BuildError {
    match shutdown.signal() {
        Some(signal) => BuildError::Signal {
            command: format!("build {slug}"),
            signal,
        },
        None => BuildError::Cancelled {
            slug: slug.to_string(),
        },
    }
}

/// Run one preparation step; anything but a clean exit blocks the build.
async fn prepare(
    slug: &str,
    step: ProcessRunConfig,
    shutdown: &Shutdown,
    build_token: &CancellationToken,
) -> Result<()> {
    let step = step.cancel(build_token.clone()).fail_fast(false);
    info!(slug = %slug, command = %step.command_line(), "Preparing build");
    match run_external_process(&step).await {
        Ok(RunOutcome::Completed) => Ok(()),
        Ok(RunOutcome::Signaled(signal)) => Err(BuildError::Signal {
            command: step.command_line(),
            signal,
        }),
        Ok(RunOutcome::Cancelled) => Err(interruption(slug, shutdown)),
        Ok(outcome) => Err(BuildError::dependency(
            slug,
            format!("{} did not complete: {outcome:?}", step.command_line()),
        )),
        Err(e) => Err(BuildError::dependency(slug, e.to_string())),
    }
}

fn primary_result(
    slug: &str,
    command: &ProcessRunConfig,
    shutdown: &Shutdown,
    result: Result<RunOutcome>,
) -> Result<()> {
    match result? {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Failed { exit_code } => Err(BuildError::Process {
            command: command.command_line(),
            exit_code,
        }),
        RunOutcome::TimedOut => Err(BuildError::Timeout {
            command: command.command_line(),
            seconds: command.timeout.as_secs(),
        }),
        RunOutcome::Cancelled => Err(interruption(slug, shutdown)),
        RunOutcome::Signaled(signal) => Err(BuildError::Signal {
            command: command.command_line(),
            signal,
        }),
        RunOutcome::Exhausted { .. } => Err(BuildError::Process {
            command: command.command_line(),
            exit_code: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::TerminationSignal;
    use std::time::Duration;

    #[test]
    fn outcomes_map_to_build_errors() {
        let command = ProcessRunConfig::new("bash")
            .args(["build.sh"])
            .timeout(Duration::from_secs(90));
        let shutdown = Shutdown::new();

        assert!(primary_result("s", &command, &shutdown, Ok(RunOutcome::Completed)).is_ok());
        assert!(matches!(
            primary_result("s", &command, &shutdown, Ok(RunOutcome::Failed { exit_code: Some(3) })),
            Err(BuildError::Process { exit_code: Some(3), .. })
        ));
        assert!(matches!(
            primary_result("s", &command, &shutdown, Ok(RunOutcome::TimedOut)),
            Err(BuildError::Timeout { seconds: 90, .. })
        ));
        assert!(matches!(
            primary_result("s", &command, &shutdown, Ok(RunOutcome::Cancelled)),
            Err(BuildError::Cancelled { .. })
        ));
        assert!(matches!(
            primary_result(
                "s",
                &command,
                &shutdown,
                Ok(RunOutcome::Signaled(TerminationSignal::Terminate))
            ),
            Err(BuildError::Signal {
                signal: TerminationSignal::Terminate,
                ..
            })
        ));
    }

    #[test]
    fn cancellation_after_a_signal_is_reported_as_the_signal() {
        let command = ProcessRunConfig::new("bash").args(["build.sh"]);
        let shutdown = Shutdown::new();
        shutdown.signal_received(TerminationSignal::Interrupt);

        let err = primary_result("s", &command, &shutdown, Ok(RunOutcome::Cancelled))
            .expect_err("interrupted");
        assert!(matches!(
            err,
            BuildError::Signal {
                signal: TerminationSignal::Interrupt,
                ..
            }
        ));
        assert_eq!(err.exit_code(), 130);
    }

    #[test]
    fn phases_display_in_snake_case() {
        assert_eq!(BuildPhase::PortBinding.to_string(), "port_binding");
        assert_eq!(BuildPhase::Finalizing.to_string(), "finalizing");
    }

    #[tokio::test]
    async fn cancelled_shutdown_stops_at_the_gate() {
        let root = tempfile::tempdir().expect("tempdir");
        let dirs = Arc::new(ProjectDirs::from_project_root(root.path()));
        let supervisor = BuildSupervisor::new(dirs, Settings::default());
        let shutdown = Shutdown::new();
        shutdown.cancel();

        let mut vm = VirtualMachineConfig::new("ubuntu", "arm64")
            .with_artifacts([root.path().join("missing.qcow2")]);
        let err = supervisor.build(&mut vm, &shutdown).await.expect_err("cancelled");
        assert!(matches!(err, BuildError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn signal_before_the_build_is_reported_at_the_gate() {
        let root = tempfile::tempdir().expect("tempdir");
        let dirs = Arc::new(ProjectDirs::from_project_root(root.path()));
        let supervisor = BuildSupervisor::new(dirs, Settings::default());
        let shutdown = Shutdown::new();
        shutdown.signal_received(TerminationSignal::Hangup);

        let mut vm = VirtualMachineConfig::new("ubuntu", "arm64")
            .with_artifacts([root.path().join("missing.qcow2")]);
        let err = supervisor.build(&mut vm, &shutdown).await.expect_err("signalled");
        assert!(matches!(
            err,
            BuildError::Signal {
                signal: TerminationSignal::Hangup,
                ..
            }
        ));
    }
}
