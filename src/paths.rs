//! Project directory layout for dev-alchemy.
//!
//! Resolved once at start-up by [`ProjectDirs::discover`] and shared
//! read-only (`Arc<ProjectDirs>`) with everything that needs a path:
//!
//! - Project root: nearest ancestor of the working directory containing a
//!   `.git` marker (directory, or file for worktrees).
//! - Cache:        `<root>/cache/` (build artifacts, recordings, logs)
//! - Packer:       `<root>/build/packer/` (build scripts and templates)
//! - Deployments:  `<root>/deployments/`
//! - Vendor:       `<root>/vendor/` (install media)

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{BuildError, Result};

const VCS_MARKER: &str = ".git";

/// All resolved project paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDirs {
    /// Directory the process was started in.
    pub working_dir: PathBuf,
    /// Repository root.
    pub project_dir: PathBuf,
    /// `<root>/cache`
    pub cache_dir: PathBuf,
}

impl ProjectDirs {
    /// Resolve from the current working directory.
    pub fn discover() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Self::discover_from(&cwd)
    }

    /// Resolve by walking up from `start` until a `.git` marker is found.
    pub fn discover_from(start: &Path) -> Result<Self> {
        let project_dir = start
            .ancestors()
            .find(|dir| dir.join(VCS_MARKER).exists())
            .ok_or_else(|| {
                BuildError::configuration(format!(
                    "project root could not be determined: no {VCS_MARKER} found above {}",
                    start.display()
                ))
            })?
            .to_path_buf();

        debug!(
            working_dir = %start.display(),
            project_dir = %project_dir.display(),
            "Resolved project directories"
        );

        Ok(Self {
            working_dir: start.to_path_buf(),
            cache_dir: project_dir.join("cache"),
            project_dir,
        })
    }

    /// Use `root` as the project root without any discovery.
    #[must_use]
    pub fn from_project_root(root: impl Into<PathBuf>) -> Self {
        let project_dir = root.into();
        Self {
            working_dir: project_dir.clone(),
            cache_dir: project_dir.join("cache"),
            project_dir,
        }
    }

    /// `<cache>/<os>/`
    #[must_use]
    pub fn os_cache_dir(&self, os: &str) -> PathBuf {
        self.cache_dir.join(os)
    }

    /// `<root>/build/packer/`
    #[must_use]
    pub fn packer_dir(&self) -> PathBuf {
        self.project_dir.join("build").join("packer")
    }

    /// `<root>/deployments/`
    #[must_use]
    pub fn deployments_dir(&self) -> PathBuf {
        self.project_dir.join("deployments")
    }

    /// `<root>/vendor/`
    #[must_use]
    pub fn vendor_dir(&self) -> PathBuf {
        self.project_dir.join("vendor")
    }

    /// `<cache>/logs/`
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.cache_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_walks_up_to_the_git_directory() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(root.path().join(".git")).expect("git dir");
        let nested = root.path().join("pkg").join("build");
        std::fs::create_dir_all(&nested).expect("nested");

        let dirs = ProjectDirs::discover_from(&nested).expect("discover");

        assert_eq!(dirs.project_dir, root.path());
        assert_eq!(dirs.working_dir, nested);
        assert_eq!(dirs.cache_dir, root.path().join("cache"));
    }

    #[test]
    fn git_file_marker_counts_as_root() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::write(root.path().join(".git"), "gitdir: /elsewhere\n").expect("git file");

        let dirs = ProjectDirs::discover_from(root.path()).expect("discover");
        assert_eq!(dirs.project_dir, root.path());
    }

    #[test]
    fn discover_fails_without_marker() {
        let root = tempfile::tempdir().expect("tempdir");
        let nested = root.path().join("a");
        std::fs::create_dir_all(&nested).expect("nested");

        // The temp dir itself could live inside a checkout; only assert when
        // it does not.
        if root.path().ancestors().any(|dir| dir.join(VCS_MARKER).exists()) {
            return;
        }
        let err = ProjectDirs::discover_from(&nested).expect_err("no root");
        assert!(matches!(err, BuildError::Configuration { .. }));
    }

    #[test]
    fn derived_directories_hang_off_the_root() {
        let dirs = ProjectDirs::from_project_root("/work/dev-alchemy");
        assert_eq!(dirs.os_cache_dir("ubuntu"), PathBuf::from("/work/dev-alchemy/cache/ubuntu"));
        assert_eq!(dirs.packer_dir(), PathBuf::from("/work/dev-alchemy/build/packer"));
        assert_eq!(dirs.deployments_dir(), PathBuf::from("/work/dev-alchemy/deployments"));
        assert_eq!(dirs.vendor_dir(), PathBuf::from("/work/dev-alchemy/vendor"));
        assert_eq!(dirs.log_dir(), PathBuf::from("/work/dev-alchemy/cache/logs"));
    }
}
