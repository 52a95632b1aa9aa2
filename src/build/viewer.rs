//! Opens the macOS Screen Sharing app on a build's VNC display.
//!
//! Purely a convenience for whoever is watching the build: it is retried
//! while the VM boots, never awaited by the build and never fatal.

use tracing::{debug, info, warn};

use crate::process::{ProcessOverrides, ProcessRunConfig, RunOutcome, run_with_retries};
use crate::vm::VirtualMachineConfig;

/// `open -a "Screen Sharing" vnc://:<password>@localhost:<port>`
#[must_use]
pub fn viewer_command(vm: &VirtualMachineConfig, password: &str) -> ProcessRunConfig {
    ProcessRunConfig::new("open")
        .args([
            "-a".to_string(),
            "Screen Sharing".to_string(),
            format!("vnc://:{password}@localhost:{}", vm.vnc_port),
        ])
        .label(format!("{}:viewer", vm.slug()))
        .redact(password)
}

/// Launch the viewer, retrying per `overrides`. Returns `None` on hosts
/// without Screen Sharing.
pub async fn open_screen_viewer(
    vm: &VirtualMachineConfig,
    password: &str,
    overrides: ProcessOverrides,
) -> Option<RunOutcome> {
    if !cfg!(target_os = "macos") {
        debug!(slug = vm.slug(), "Screen viewer only available on macOS");
        return None;
    }

    let config = viewer_command(vm, password).with_overrides(overrides);
    info!(slug = vm.slug(), port = vm.vnc_port, "Opening screen viewer");
    let outcome = run_with_retries(&config).await;
    if !outcome.is_success() {
        warn!(slug = vm.slug(), outcome = ?outcome, "Screen viewer did not open");
    }
    Some(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_targets_the_build_port() {
        let vm = VirtualMachineConfig::new("ubuntu", "arm64")
            .with_type("server")
            .with_vnc_port(5907);
        let config = viewer_command(&vm, "packer");

        assert_eq!(config.executable, "open");
        assert_eq!(
            config.args,
            vec!["-a", "Screen Sharing", "vnc://:packer@localhost:5907"]
        );
        assert_eq!(config.display_label(), "ubuntu-server-arm64:viewer");
    }

    #[test]
    fn logged_command_line_hides_the_password() {
        let vm = VirtualMachineConfig::new("windows11", "arm64").with_vnc_port(5911);
        let config = viewer_command(&vm, "s3cr3t-vnc");

        let line = config.command_line();
        assert!(!line.contains("s3cr3t-vnc"), "{line}");
        assert_eq!(line, "open -a Screen Sharing vnc://:***@localhost:5911");
        assert!(!config.display_label().contains("s3cr3t-vnc"));
    }

    #[test]
    fn empty_password_is_not_masked() {
        let vm = VirtualMachineConfig::new("windows11", "arm64").with_vnc_port(5911);
        let config = viewer_command(&vm, "");
        assert_eq!(config.command_line(), "open -a Screen Sharing vnc://:@localhost:5911");
    }
}
