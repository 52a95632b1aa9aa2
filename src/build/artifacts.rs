//! Skip-if-already-built gate and partial artifact cleanup.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{BuildError, Result};
use crate::vm::VirtualMachineConfig;
use crate::vm::catalog;

/// Artifacts `vm` is expected to produce: its own list, or the list of the
/// matching catalog entry.
///
/// # Errors
///
/// [`BuildError::Configuration`] if neither source names any artifact, since
/// build completion could then never be determined.
pub fn resolve_expected_artifacts(
    vm: &VirtualMachineConfig,
    catalog: &[VirtualMachineConfig],
) -> Result<Vec<PathBuf>> {
    if !vm.expected_artifacts.is_empty() {
        return Ok(vm.expected_artifacts.clone());
    }

    let artifacts = catalog::find_matching(catalog, vm)
        .map(|entry| entry.expected_artifacts.clone())
        .unwrap_or_default();

    if artifacts.is_empty() {
        warn!(slug = vm.slug(), "No build artifacts defined, aborting build");
        return Err(BuildError::configuration(format!(
            "no build artifacts defined for {vm}"
        )));
    }
    Ok(artifacts)
}

/// Whether every path in `artifacts` exists. Existence only; content is not
/// inspected.
#[must_use]
pub fn all_present(artifacts: &[PathBuf]) -> bool {
    for artifact in artifacts {
        if !artifact.exists() {
            info!(artifact = %artifact.display(), "Expected build artifact does not exist, proceeding with build");
            return false;
        }
    }
    true
}

/// `Ok(true)` when `vm` is already built and the build can be skipped.
///
/// The resolved list is written back to `vm.expected_artifacts`, so cleanup
/// after a failed build removes exactly what was checked here.
pub fn already_built(
    vm: &mut VirtualMachineConfig,
    catalog: &[VirtualMachineConfig],
) -> Result<bool> {
    vm.expected_artifacts = resolve_expected_artifacts(vm, catalog)?;
    let present = all_present(&vm.expected_artifacts);
    if present {
        info!(
            slug = vm.slug(),
            count = vm.expected_artifacts.len(),
            "Build artifacts already exist, skipping build"
        );
    }
    Ok(present)
}

/// Delete every path in `artifacts`, files and directories alike.
///
/// Missing paths are skipped silently, so calling this twice is harmless.
/// Every path is attempted; the first failure is returned afterwards.
pub fn remove_artifacts(artifacts: &[PathBuf]) -> std::io::Result<()> {
    let mut first_error = None;
    for artifact in artifacts {
        if let Err(e) = remove_path(artifact) {
            warn!(artifact = %artifact.display(), error = %e, "Failed to remove build artifact");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    info!(artifact = %path.display(), "Removing build artifact");
    if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}
