//! Build targets: which OS image to produce, for which architecture, on
//! which host.
//!
//! A [`VirtualMachineConfig`] is constructed by the CLI or the batch driver
//! (usually from [`catalog::available_configs`]) and is read-only afterwards,
//! except for the memoized slug and the VNC port, which port allocation may
//! raise.

use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

pub mod catalog;

/// First TCP port of the VNC display range; display `N` listens on
/// `5900 + N`.
pub const VNC_BASE_PORT: u16 = 5900;

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// Operating system of the machine running the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostOs {
    #[default]
    Darwin,
    Windows,
    Linux,
}

impl HostOs {
    /// Host OS this binary was compiled for.
    #[must_use]
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::Darwin
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            Self::Linux
        }
    }
}

impl fmt::Display for HostOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Darwin => "darwin",
            Self::Windows => "windows",
            Self::Linux => "linux",
        })
    }
}

/// Hypervisor stack that produces the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtualizationEngine {
    #[default]
    Qemu,
    Utm,
    HyperV,
    VirtualBox,
}

impl fmt::Display for VirtualizationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Qemu => "qemu",
            Self::Utm => "utm",
            Self::HyperV => "hyperv",
            Self::VirtualBox => "virtualbox",
        })
    }
}

// ---------------------------------------------------------------------------
// VirtualMachineConfig
// ---------------------------------------------------------------------------

/// One build target.
#[derive(Debug, Clone, Default)]
pub struct VirtualMachineConfig {
    /// Operating system name, e.g. `ubuntu` or `windows11`.
    pub os: String,

    /// Target architecture, e.g. `amd64` or `arm64`.
    pub arch: String,

    /// OS flavour such as `server` or `desktop`. `None` for OSes without one.
    pub os_type: Option<String>,

    /// VNC port the build exposes its display on.
    pub vnc_port: u16,

    /// Files a successful build leaves behind. Empty means "look it up in
    /// the catalog".
    pub expected_artifacts: Vec<PathBuf>,

    pub host_os: HostOs,

    pub engine: VirtualizationEngine,

    slug: OnceLock<String>,
}

impl VirtualMachineConfig {
    #[must_use]
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            host_os: HostOs::current(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_type(mut self, os_type: impl Into<String>) -> Self {
        let os_type = os_type.into();
        self.os_type = (!os_type.is_empty()).then_some(os_type);
        self
    }

    #[must_use]
    pub fn with_vnc_port(mut self, port: u16) -> Self {
        self.vnc_port = port;
        self
    }

    #[must_use]
    pub fn with_artifacts<I, P>(mut self, artifacts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.expected_artifacts = artifacts.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_host(mut self, host_os: HostOs, engine: VirtualizationEngine) -> Self {
        self.host_os = host_os;
        self.engine = engine;
        self
    }

    /// Lowercase `<os>[-<type>]-<arch>` identifier.
    ///
    /// Derived on first call and memoized; later calls return the stored
    /// value even if the fields have changed since.
    pub fn slug(&self) -> &str {
        self.slug.get_or_init(|| {
            let mut slug = self.os.to_lowercase();
            if let Some(os_type) = &self.os_type {
                slug.push('-');
                slug.push_str(&os_type.to_lowercase());
            }
            slug.push('-');
            slug.push_str(&self.arch.to_lowercase());
            slug
        })
    }

    /// `ubuntu-server`, `ubuntu`, `windows11`, as the VM creation scripts
    /// expect.
    #[must_use]
    pub fn name_with_type(&self) -> String {
        match (self.os.as_str(), &self.os_type) {
            ("ubuntu", Some(os_type)) => format!("{}-{os_type}", self.os),
            _ => self.os.clone(),
        }
    }

    /// `<type>:<arch>` prefix for the primary build's log lines.
    #[must_use]
    pub fn log_label(&self) -> String {
        format!("{}:{}", self.name_with_type(), self.arch)
    }

    /// VNC display number for the current port, if the port is in the VNC
    /// range.
    #[must_use]
    pub fn vnc_display(&self) -> Option<u16> {
        self.vnc_port.checked_sub(VNC_BASE_PORT)
    }

    /// Whether `self` and `other` describe the same build target on the same
    /// host.
    #[must_use]
    pub fn same_target(&self, other: &Self) -> bool {
        self.host_os == other.host_os
            && self.os == other.os
            && self.os_type == other.os_type
            && self.arch == other.arch
    }
}

impl fmt::Display for VirtualMachineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (type: {}, arch: {}, host: {})",
            self.os,
            self.os_type.as_deref().unwrap_or("-"),
            self.arch,
            self.host_os
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_includes_type_when_present() {
        let vm = VirtualMachineConfig::new("Ubuntu", "ARM64").with_type("Server");
        assert_eq!(vm.slug(), "ubuntu-server-arm64");

        let vm = VirtualMachineConfig::new("windows11", "amd64");
        assert_eq!(vm.slug(), "windows11-amd64");
    }

    #[test]
    fn slug_is_memoized_after_first_derivation() {
        let mut vm = VirtualMachineConfig::new("ubuntu", "arm64").with_type("server");
        let first = vm.slug().to_string();

        vm.arch = "amd64".to_string();
        vm.os_type = Some("desktop".to_string());

        assert_eq!(vm.slug(), first);
        assert_eq!(vm.slug(), vm.slug());
    }

    #[test]
    fn memoized_slug_survives_clone() {
        let vm = VirtualMachineConfig::new("ubuntu", "arm64").with_type("desktop");
        let _ = vm.slug();
        let mut copy = vm.clone();
        copy.os = "windows11".to_string();
        assert_eq!(copy.slug(), "ubuntu-desktop-arm64");
    }

    #[test]
    fn empty_type_is_treated_as_none() {
        let vm = VirtualMachineConfig::new("windows11", "arm64").with_type("");
        assert_eq!(vm.os_type, None);
    }

    #[test]
    fn name_with_type_matches_script_expectations() {
        let server = VirtualMachineConfig::new("ubuntu", "amd64").with_type("server");
        let plain = VirtualMachineConfig::new("ubuntu", "amd64");
        let windows = VirtualMachineConfig::new("windows11", "amd64");
        assert_eq!(server.name_with_type(), "ubuntu-server");
        assert_eq!(plain.name_with_type(), "ubuntu");
        assert_eq!(windows.name_with_type(), "windows11");
        assert_eq!(server.log_label(), "ubuntu-server:amd64");
    }

    #[test]
    fn vnc_display_is_offset_from_base_port() {
        let vm = VirtualMachineConfig::new("ubuntu", "arm64").with_vnc_port(5901);
        assert_eq!(vm.vnc_display(), Some(1));
        let vm = vm.with_vnc_port(80);
        assert_eq!(vm.vnc_display(), None);
    }
}
