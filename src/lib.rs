//! dev-alchemy: builds reproducible VM images with Packer and the local
//! hypervisor, supervising the build scripts, recording their displays and
//! cleaning up after failures.

pub mod build;
pub mod deploy;
pub mod error;
pub mod logging;
pub mod paths;
pub mod process;
pub mod settings;
pub mod vm;

pub use error::{BuildError, BuildStatus, Result};
