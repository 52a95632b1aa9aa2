//! Fan-out of many builds over a bounded worker pool.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::supervisor::BuildSupervisor;
use crate::error::{BuildError, BuildStatus, Result};
use crate::process::{Shutdown, TerminationSignal};
use crate::vm::VirtualMachineConfig;

/// Result of one build in a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub slug: String,
    pub os: String,
    pub arch: String,
    pub os_type: Option<String>,
    pub status: BuildStatus,
    /// VNC port the build used. The configured port for builds that never
    /// reached port allocation.
    pub vnc_port: u16,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(skip)]
    pub exit_code: i32,
}

impl BuildReport {
    fn base(vm: &VirtualMachineConfig, status: BuildStatus) -> Self {
        Self {
            slug: vm.slug().to_string(),
            os: vm.os.clone(),
            arch: vm.arch.clone(),
            os_type: vm.os_type.clone(),
            status,
            vnc_port: vm.vnc_port,
            started_at: None,
            finished_at: None,
            error: None,
            exit_code: 0,
        }
    }

    /// Report for a build that was never started because the batch was
    /// shutting down.
    #[must_use]
    pub fn not_started(vm: &VirtualMachineConfig) -> Self {
        let error = BuildError::Cancelled {
            slug: vm.slug().to_string(),
        };
        Self {
            error: Some(error.to_string()),
            exit_code: error.exit_code(),
            ..Self::base(vm, BuildStatus::Cancelled)
        }
    }

    #[must_use]
    pub fn from_result(
        vm: &VirtualMachineConfig,
        started_at: DateTime<Utc>,
        result: &Result<BuildStatus>,
    ) -> Self {
        let mut report = match result {
            Ok(status) => Self::base(vm, *status),
            Err(e) => Self {
                error: Some(e.to_string()),
                exit_code: e.exit_code(),
                ..Self::base(vm, e.status())
            },
        };
        report.started_at = Some(started_at);
        report.finished_at = Some(Utc::now());
        report
    }
}

/// Every build's report, in the order the configs were given.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub reports: Vec<BuildReport>,
    /// Termination signal received while the batch ran, even one that only
    /// arrived after the last build had finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted_by: Option<TerminationSignal>,
}

impl BatchSummary {
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.reports.iter().all(|r| r.status.is_success())
    }

    /// Exit code for the whole batch: interruption wins, then the first
    /// failing build's code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        let interrupted = self.interrupted_by.is_some()
            || self
                .reports
                .iter()
                .any(|r| matches!(r.status, BuildStatus::Signaled | BuildStatus::Cancelled));
        if interrupted {
            return 130;
        }
        self.reports
            .iter()
            .find(|r| !r.status.is_success())
            .map_or(0, |r| r.exit_code)
    }
}

/// Build every config, at most `parallel` at a time, starting them in the
/// given order.
///
/// A termination signal stops the whole batch, whatever phase the builds
/// are in: running builds fail with [`BuildError::Signal`] and queued ones
/// report [`BuildStatus::Cancelled`] without starting.
pub async fn run_batch(
    supervisor: Arc<BuildSupervisor>,
    configs: Vec<VirtualMachineConfig>,
    parallel: usize,
) -> BatchSummary {
    let shutdown = Shutdown::new();
    let listener = match shutdown.listen() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Could not install signal handlers for the batch");
            None
        }
    };

    let summary = run_batch_with(supervisor, configs, parallel, &shutdown).await;

    if let Some(listener) = listener {
        listener.abort();
    }
    summary
}

/// [`run_batch`] driven by a caller-owned [`Shutdown`] instead of OS
/// signals.
pub async fn run_batch_with(
    supervisor: Arc<BuildSupervisor>,
    configs: Vec<VirtualMachineConfig>,
    parallel: usize,
    shutdown: &Shutdown,
) -> BatchSummary {
    let parallel = parallel.max(1);
    let semaphore = Arc::new(Semaphore::new(parallel));
    let mut tasks = JoinSet::new();

    info!(builds = configs.len(), parallel, "Starting batch");

    let mut reports: Vec<BuildReport> = configs.iter().map(BuildReport::not_started).collect();

    for (index, mut vm) in configs.into_iter().enumerate() {
        let permit = tokio::select! {
            biased;
            () = shutdown.cancelled() => None,
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            warn!(slug = vm.slug(), "Batch shutting down, build not started");
            continue;
        };

        reports[index] = BuildReport {
            status: BuildStatus::Failed,
            error: Some("build task aborted".to_string()),
            exit_code: 1,
            ..BuildReport::not_started(&vm)
        };

        let supervisor = Arc::clone(&supervisor);
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let started_at = Utc::now();
            info!(slug = vm.slug(), os = %vm.os, arch = %vm.arch, "Dispatching build");

            let result = supervisor.build(&mut vm, &shutdown).await;
            if let Err(e @ BuildError::Signal { signal, .. }) = &result {
                warn!(slug = vm.slug(), error = %e, "Build interrupted by signal, stopping batch");
                shutdown.signal_received(*signal);
            }
            (index, BuildReport::from_result(&vm, started_at, &result))
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, report)) => reports[index] = report,
            Err(e) => error!(error = %e, "Build task aborted"),
        }
    }

    let summary = BatchSummary {
        reports,
        interrupted_by: shutdown.signal(),
    };
    for report in &summary.reports {
        info!(slug = %report.slug, status = ?report.status, port = report.vnc_port, "Build result");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> VirtualMachineConfig {
        VirtualMachineConfig::new("ubuntu", "arm64")
            .with_type("server")
            .with_vnc_port(5901)
    }

    #[test]
    fn report_carries_error_and_exit_code() {
        let result: Result<BuildStatus> = Err(BuildError::Timeout {
            command: "bash build.sh".to_string(),
            seconds: 60,
        });
        let report = BuildReport::from_result(&vm(), Utc::now(), &result);

        assert_eq!(report.status, BuildStatus::TimedOut);
        assert_eq!(report.exit_code, 124);
        assert!(report.error.as_deref().is_some_and(|e| e.contains("timed out")));
        assert!(report.finished_at >= report.started_at);
    }

    #[test]
    fn summary_exit_code_prefers_interruption() {
        let failed = BuildReport::from_result(
            &vm(),
            Utc::now(),
            &Err(BuildError::Process {
                command: "bash".to_string(),
                exit_code: Some(1),
            }),
        );
        let ok = BuildReport::from_result(&vm(), Utc::now(), &Ok(BuildStatus::Succeeded));

        let summary = BatchSummary {
            reports: vec![ok.clone(), failed.clone()],
            interrupted_by: None,
        };
        assert_eq!(summary.exit_code(), 1);
        assert!(!summary.all_succeeded());

        let summary = BatchSummary {
            reports: vec![failed, BuildReport::not_started(&vm())],
            interrupted_by: None,
        };
        assert_eq!(summary.exit_code(), 130);

        let summary = BatchSummary {
            reports: vec![ok.clone()],
            interrupted_by: None,
        };
        assert_eq!(summary.exit_code(), 0);

        let summary = BatchSummary {
            reports: vec![ok],
            interrupted_by: Some(TerminationSignal::Terminate),
        };
        assert_eq!(summary.exit_code(), 130);
    }

    #[test]
    fn report_serializes_status_in_snake_case() {
        let report = BuildReport::from_result(&vm(), Utc::now(), &Ok(BuildStatus::AlreadyBuilt));
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["status"], "already_built");
        assert_eq!(json["slug"], "ubuntu-server-arm64");
        assert!(json.get("exit_code").is_none());
    }
}
