//! Which command builds (or deploys) a given target.

use std::time::Duration;

use crate::error::{BuildError, Result};
use crate::paths::ProjectDirs;
use crate::process::ProcessRunConfig;
use crate::vm::{HostOs, VirtualMachineConfig, VirtualizationEngine};

/// Packer template for Hyper-V builds, relative to the project root.
pub const WINDOWS_PACKER_TEMPLATE: &str = "build/packer/windows/windows.pkr.hcl";
pub const WINDOWS_AMD64_ISO: &str = "./vendor/windows/win11_25h2_english_amd64.iso";

pub const CREATE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Routes a build target to the commands that produce it.
pub trait BuildPlanner: Send + Sync {
    /// One-off steps that must succeed before the primary command starts.
    fn preparation(&self, _vm: &VirtualMachineConfig, _dirs: &ProjectDirs) -> Vec<ProcessRunConfig> {
        Vec::new()
    }

    /// The primary build command. Called after port allocation, so
    /// `vm.vnc_port` is final.
    fn command(&self, vm: &VirtualMachineConfig, dirs: &ProjectDirs) -> Result<ProcessRunConfig>;
}

/// Build scripts and templates of a dev-alchemy checkout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProjectPlanner;

impl BuildPlanner for ProjectPlanner {
    fn preparation(&self, vm: &VirtualMachineConfig, dirs: &ProjectDirs) -> Vec<ProcessRunConfig> {
        match (vm.os.as_str(), vm.host_os, vm.engine) {
            ("windows11", HostOs::Windows, VirtualizationEngine::HyperV) => vec![
                ProcessRunConfig::new("packer")
                    .args(["init", WINDOWS_PACKER_TEMPLATE])
                    .working_dir(&dirs.project_dir)
                    .label("packer-init"),
            ],
            _ => Vec::new(),
        }
    }

    fn command(&self, vm: &VirtualMachineConfig, dirs: &ProjectDirs) -> Result<ProcessRunConfig> {
        let root = dirs.project_dir.display().to_string();
        let port = vm.vnc_port.to_string();

        let config = match (vm.os.as_str(), vm.host_os) {
            ("ubuntu", HostOs::Darwin) => {
                let os_type = vm.os_type.as_deref().ok_or_else(|| {
                    BuildError::configuration("ubuntu builds need a type (server or desktop)")
                })?;
                let script = dirs.packer_dir().join("linux/ubuntu/linux-ubuntu-on-macos.sh");
                bash(script.display().to_string()).args([
                    "--project-root",
                    root.as_str(),
                    "--arch",
                    vm.arch.as_str(),
                    "--ubuntu-type",
                    os_type,
                    "--vnc-port",
                    port.as_str(),
                    "--headless",
                ])
            }
            ("windows11", HostOs::Darwin) => {
                let script = dirs.packer_dir().join("windows/windows11-on-macos.sh");
                bash(script.display().to_string()).args([
                    "--arch",
                    vm.arch.as_str(),
                    "--vnc-port",
                    port.as_str(),
                    "--headless",
                ])
            }
            ("windows11", HostOs::Windows) => ProcessRunConfig::new("packer").args([
                "build".to_string(),
                "-var".to_string(),
                format!("iso_url={WINDOWS_AMD64_ISO}"),
                WINDOWS_PACKER_TEMPLATE.to_string(),
            ]),
            (os, host) => {
                return Err(BuildError::configuration(format!(
                    "no build plan for {os} on {host}"
                )));
            }
        };

        Ok(config.working_dir(&dirs.project_dir).label(vm.log_label()))
    }
}

/// `bash <root>/deployments/utm/create-utm-vm.sh --arch <arch> --os <name>`
#[must_use]
pub fn plan_create(vm: &VirtualMachineConfig, dirs: &ProjectDirs) -> ProcessRunConfig {
    let script = dirs.deployments_dir().join("utm").join("create-utm-vm.sh");
    let name = vm.name_with_type();
    bash(script.display().to_string())
        .args(["--arch", vm.arch.as_str(), "--os", name.as_str()])
        .working_dir(&dirs.project_dir)
        .timeout(CREATE_TIMEOUT)
        .label(format!("{name}:{}", vm.arch))
}

fn bash(script: String) -> ProcessRunConfig {
    ProcessRunConfig::new("bash").args([script])
}
