//! Static table of supported build targets.

use super::{HostOs, VirtualMachineConfig, VirtualizationEngine};
use crate::paths::ProjectDirs;

/// Every build target this tool knows how to produce, with its default VNC
/// port and expected artifacts under `<cache>/<os>/`.
#[must_use]
pub fn available_configs(dirs: &ProjectDirs) -> Vec<VirtualMachineConfig> {
    let artifact = |os: &str, file: &str| dirs.cache_dir.join(os).join(file);

    vec![
        VirtualMachineConfig::new("ubuntu", "arm64")
            .with_type("server")
            .with_vnc_port(5901)
            .with_artifacts([artifact("ubuntu", "qemu-ubuntu-server-packer-arm64.qcow2")])
            .with_host(HostOs::Darwin, VirtualizationEngine::Qemu),
        VirtualMachineConfig::new("ubuntu", "amd64")
            .with_type("server")
            .with_vnc_port(5902)
            .with_artifacts([artifact("ubuntu", "qemu-ubuntu-server-packer-amd64.qcow2")])
            .with_host(HostOs::Darwin, VirtualizationEngine::Qemu),
        VirtualMachineConfig::new("ubuntu", "arm64")
            .with_type("desktop")
            .with_vnc_port(5903)
            .with_artifacts([artifact("ubuntu", "qemu-ubuntu-desktop-packer-arm64.qcow2")])
            .with_host(HostOs::Darwin, VirtualizationEngine::Qemu),
        VirtualMachineConfig::new("ubuntu", "amd64")
            .with_type("desktop")
            .with_vnc_port(5904)
            .with_artifacts([artifact("ubuntu", "qemu-ubuntu-desktop-packer-amd64.qcow2")])
            .with_host(HostOs::Darwin, VirtualizationEngine::Qemu),
        VirtualMachineConfig::new("windows11", "arm64")
            .with_vnc_port(5911)
            .with_artifacts([artifact("windows11", "qemu-windows11-arm64.qcow2")])
            .with_host(HostOs::Darwin, VirtualizationEngine::Qemu),
        VirtualMachineConfig::new("windows11", "amd64")
            .with_vnc_port(5912)
            .with_artifacts([artifact("windows11", "qemu-windows11-amd64.qcow2")])
            .with_host(HostOs::Darwin, VirtualizationEngine::Qemu),
        VirtualMachineConfig::new("windows11", "amd64")
            .with_vnc_port(5912)
            .with_artifacts([artifact("windows11", "hyperv-windows11-amd64.box")])
            .with_host(HostOs::Windows, VirtualizationEngine::HyperV),
    ]
}

/// Catalog entries buildable on `host`.
#[must_use]
pub fn configs_for_host(catalog: &[VirtualMachineConfig], host: HostOs) -> Vec<VirtualMachineConfig> {
    catalog
        .iter()
        .filter(|vm| vm.host_os == host)
        .cloned()
        .collect()
}

/// The catalog entry describing the same target as `vm`, if any.
#[must_use]
pub fn find_matching<'a>(
    catalog: &'a [VirtualMachineConfig],
    vm: &VirtualMachineConfig,
) -> Option<&'a VirtualMachineConfig> {
    catalog.iter().find(|entry| entry.same_target(vm))
}
