//! Batch driver: ordering, concurrency bound and collected reports.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dev_alchemy::build::{BuildPlanner, BuildSupervisor, NoopReconciler, run_batch};
use dev_alchemy::error::{BuildStatus, Result};
use dev_alchemy::paths::ProjectDirs;
use dev_alchemy::process::ProcessRunConfig;
use dev_alchemy::settings::Settings;
use dev_alchemy::vm::VirtualMachineConfig;

/// Logs start and end of each build to a shared file; targets whose arch is
/// `broken` fail.
struct LoggingPlanner {
    log: PathBuf,
}

impl BuildPlanner for LoggingPlanner {
    fn command(&self, vm: &VirtualMachineConfig, _dirs: &ProjectDirs) -> Result<ProcessRunConfig> {
        let exit_code = if vm.arch == "broken" { 1 } else { 0 };
        let script = format!(
            "echo start-{slug} >> '{log}'; sleep 0.2; echo end-{slug} >> '{log}'; exit {exit_code}",
            slug = vm.slug(),
            log = self.log.display()
        );
        Ok(ProcessRunConfig::new("sh").args(["-c".to_string(), script]))
    }
}

fn supervisor(root: &Path, log: PathBuf) -> Arc<BuildSupervisor> {
    let mut settings = Settings::default();
    settings.recording.enabled = false;
    settings.viewer.enabled = false;

    let dirs = Arc::new(ProjectDirs::from_project_root(root));
    Arc::new(
        BuildSupervisor::new(dirs, settings)
            .with_reconciler(Arc::new(NoopReconciler))
            .with_planner(Arc::new(LoggingPlanner { log })),
    )
}

fn target(root: &Path, os: &str, arch: &str, port: u16) -> VirtualMachineConfig {
    VirtualMachineConfig::new(os, arch)
        .with_vnc_port(port)
        .with_artifacts([root.join("cache").join(os).join(format!("{os}-{arch}.qcow2"))])
}

#[tokio::test]
async fn single_worker_runs_builds_one_after_another() {
    let root = tempfile::tempdir().expect("tempdir");
    let log = root.path().join("batch.log");
    let configs = vec![
        target(root.path(), "alpha", "amd64", 5931),
        target(root.path(), "beta", "amd64", 5941),
        target(root.path(), "gamma", "amd64", 5951),
    ];

    let summary = run_batch(supervisor(root.path(), log.clone()), configs, 1).await;

    let lines: Vec<String> = std::fs::read_to_string(&log)
        .expect("log")
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(
        lines,
        [
            "start-alpha-amd64",
            "end-alpha-amd64",
            "start-beta-amd64",
            "end-beta-amd64",
            "start-gamma-amd64",
            "end-gamma-amd64",
        ]
    );
    assert!(summary.all_succeeded());
    assert_eq!(summary.exit_code(), 0);
}

#[tokio::test]
async fn reports_come_back_in_dispatch_order_with_every_status() {
    let root = tempfile::tempdir().expect("tempdir");
    let log = root.path().join("batch.log");

    let built = target(root.path(), "alpha", "amd64", 5931);
    let existing = &built.expected_artifacts[0];
    std::fs::create_dir_all(existing.parent().expect("parent")).expect("mkdir");
    std::fs::write(existing, b"qcow").expect("write");

    let configs = vec![
        built,
        target(root.path(), "beta", "broken", 5941),
        VirtualMachineConfig::new("plan9", "mips").with_vnc_port(5951),
        target(root.path(), "gamma", "amd64", 5961),
    ];

    let summary = run_batch(supervisor(root.path(), log), configs, 3).await;

    let slugs: Vec<&str> = summary.reports.iter().map(|r| r.slug.as_str()).collect();
    assert_eq!(slugs, ["alpha-amd64", "beta-broken", "plan9-mips", "gamma-amd64"]);

    let statuses: Vec<BuildStatus> = summary.reports.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        [
            BuildStatus::AlreadyBuilt,
            BuildStatus::Failed,
            BuildStatus::Misconfigured,
            BuildStatus::Succeeded,
        ]
    );

    assert!(summary.reports[1].error.is_some());
    assert!(summary.reports[3].started_at.is_some());
    assert!(summary.reports[3].vnc_port >= 5961);
    assert_eq!(summary.exit_code(), 1);

    let json = serde_json::to_value(&summary).expect("serialize");
    assert_eq!(json["reports"][2]["status"], "misconfigured");
}

#[tokio::test]
async fn zero_parallelism_still_runs_everything() {
    let root = tempfile::tempdir().expect("tempdir");
    let log = root.path().join("batch.log");
    let configs = vec![target(root.path(), "alpha", "arm64", 5971)];

    let summary = run_batch(supervisor(root.path(), log), configs, 0).await;
    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].status, BuildStatus::Succeeded);
}
