//! `alchemy create`: turn a built image into a local UTM virtual machine.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::build::plan::plan_create;
use crate::error::{BuildError, Result};
use crate::paths::ProjectDirs;
use crate::process::{ProcessRunConfig, RunOutcome, run_external_process};
use crate::vm::VirtualMachineConfig;

/// Run the UTM creation script for `vm`. Fails on any outcome other than a
/// clean exit.
pub async fn create_vm(
    vm: &VirtualMachineConfig,
    dirs: &ProjectDirs,
    shutdown: &CancellationToken,
) -> Result<()> {
    let config = plan_create(vm, dirs).cancel(shutdown.clone());
    info!(slug = vm.slug(), command = %config.command_line(), "Creating VM");
    run_create(vm, &config).await
}

async fn run_create(vm: &VirtualMachineConfig, config: &ProcessRunConfig) -> Result<()> {
    let command = config.command_line();
    match run_external_process(config).await? {
        RunOutcome::Completed => {
            info!(slug = vm.slug(), "VM created");
            Ok(())
        }
        RunOutcome::Failed { exit_code } => Err(BuildError::Process { command, exit_code }),
        RunOutcome::TimedOut => Err(BuildError::Timeout {
            command,
            seconds: config.timeout.as_secs(),
        }),
        RunOutcome::Signaled(signal) => Err(BuildError::Signal { command, signal }),
        RunOutcome::Cancelled => Err(BuildError::Cancelled {
            slug: vm.slug().to_string(),
        }),
        RunOutcome::Exhausted { .. } => Err(BuildError::Process {
            command,
            exit_code: None,
        }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn vm() -> VirtualMachineConfig {
        VirtualMachineConfig::new("ubuntu", "arm64").with_type("server")
    }

    #[tokio::test]
    async fn clean_exit_creates() {
        let config = ProcessRunConfig::new("sh").args(["-c", "exit 0"]);
        run_create(&vm(), &config).await.expect("created");
    }

    #[tokio::test]
    async fn failing_script_is_a_process_error() {
        let config = ProcessRunConfig::new("sh").args(["-c", "exit 4"]);
        let err = run_create(&vm(), &config).await.expect_err("failed");
        assert!(matches!(err, BuildError::Process { exit_code: Some(4), .. }));
    }

    #[tokio::test]
    async fn slow_script_times_out() {
        let config = ProcessRunConfig::new("sh")
            .args(["-c", "sleep 5"])
            .timeout(Duration::from_millis(200));
        let err = run_create(&vm(), &config).await.expect_err("timed out");
        assert_eq!(err.exit_code(), 124);
    }

    #[tokio::test]
    async fn missing_script_fails_with_nonzero_exit() {
        let root = tempfile::tempdir().expect("tempdir");
        let dirs = ProjectDirs::from_project_root(root.path());
        let err = create_vm(&vm(), &dirs, &CancellationToken::new())
            .await
            .expect_err("script does not exist");
        assert!(matches!(err, BuildError::Process { .. }));
    }
}
