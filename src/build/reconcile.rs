//! Pre-build dependency reconciliation.
//!
//! Builds consume large install media (ISOs, firmware packages) from
//! `<root>/vendor/`. A build that starts without them fails deep inside
//! Packer after minutes of work, so they are checked up front.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::{BuildError, Result};
use crate::paths::ProjectDirs;
use crate::vm::{HostOs, VirtualMachineConfig, VirtualizationEngine};

/// Ensures everything a build needs is in place before its command runs.
pub trait Reconciler: Send + Sync {
    /// # Errors
    ///
    /// [`BuildError::Dependency`] when something required is missing or could
    /// not be provisioned.
    fn reconcile(&self, vm: &VirtualMachineConfig) -> Result<()>;
}

/// Accepts every build. Used where no media is managed, and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReconciler;

impl Reconciler for NoopReconciler {
    fn reconcile(&self, vm: &VirtualMachineConfig) -> Result<()> {
        debug!(slug = vm.slug(), "No dependencies to reconcile");
        Ok(())
    }
}

/// One file a matching build cannot start without.
#[derive(Debug, Clone)]
pub struct MediaRequirement {
    pub os: &'static str,
    /// `None` matches every architecture.
    pub arch: Option<&'static str>,
    pub host_os: HostOs,
    pub engine: VirtualizationEngine,
    pub path: PathBuf,
}

impl MediaRequirement {
    fn applies_to(&self, vm: &VirtualMachineConfig) -> bool {
        self.os == vm.os
            && self.arch.is_none_or(|arch| arch == vm.arch)
            && self.host_os == vm.host_os
            && self.engine == vm.engine
    }
}

/// Checks that required install media exist and are not empty.
#[derive(Debug, Clone, Default)]
pub struct MediaReconciler {
    requirements: Vec<MediaRequirement>,
}

impl MediaReconciler {
    #[must_use]
    pub fn new(requirements: Vec<MediaRequirement>) -> Self {
        Self { requirements }
    }

    /// Media layout of a dev-alchemy checkout.
    #[must_use]
    pub fn for_project(dirs: &ProjectDirs) -> Self {
        let vendor = dirs.vendor_dir();
        let windows_iso = |arch: &str| {
            vendor
                .join("windows")
                .join(format!("win11_25h2_english_{arch}.iso"))
        };

        let mut requirements = Vec::new();
        for (host_os, engine) in [
            (HostOs::Darwin, VirtualizationEngine::Qemu),
            (HostOs::Windows, VirtualizationEngine::HyperV),
        ] {
            for arch in ["amd64", "arm64"] {
                requirements.push(MediaRequirement {
                    os: "windows11",
                    arch: Some(arch),
                    host_os,
                    engine,
                    path: windows_iso(arch),
                });
            }
        }
        requirements.push(MediaRequirement {
            os: "windows11",
            arch: None,
            host_os: HostOs::Darwin,
            engine: VirtualizationEngine::Qemu,
            path: vendor.join("windows").join("virtio-win.iso"),
        });
        requirements.push(MediaRequirement {
            os: "ubuntu",
            arch: Some("arm64"),
            host_os: HostOs::Darwin,
            engine: VirtualizationEngine::Qemu,
            path: vendor.join("qemu-efi-aarch64_2025.02-8_all.deb"),
        });

        Self { requirements }
    }

    /// Requirements that apply to `vm`.
    pub fn requirements_for<'a>(
        &'a self,
        vm: &'a VirtualMachineConfig,
    ) -> impl Iterator<Item = &'a MediaRequirement> + 'a {
        self.requirements.iter().filter(move |req| req.applies_to(vm))
    }
}

impl Reconciler for MediaReconciler {
    fn reconcile(&self, vm: &VirtualMachineConfig) -> Result<()> {
        let mut missing = Vec::new();
        for requirement in self.requirements_for(vm) {
            let usable = std::fs::metadata(&requirement.path)
                .map(|meta| meta.is_file() && meta.len() > 0)
                .unwrap_or(false);
            if usable {
                debug!(slug = vm.slug(), media = %requirement.path.display(), "Install media present");
            } else {
                missing.push(requirement.path.display().to_string());
            }
        }

        if missing.is_empty() {
            info!(slug = vm.slug(), "Dependencies reconciled");
            Ok(())
        } else {
            Err(BuildError::dependency(
                vm.slug(),
                format!("missing install media: {}", missing.join(", ")),
            ))
        }
    }
}
