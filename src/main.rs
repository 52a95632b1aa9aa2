//! alchemy: VM image builder CLI
//!
//! ```text
//! alchemy build ubuntu --type server --arch amd64
//! alchemy build windows11 --arch arm64
//! alchemy build all --parallel 4
//! alchemy create ubuntu --type desktop --arch arm64
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::error;

use dev_alchemy::build::{BatchSummary, BuildSupervisor, run_batch};
use dev_alchemy::deploy::create_vm;
use dev_alchemy::error::BuildError;
use dev_alchemy::logging;
use dev_alchemy::paths::ProjectDirs;
use dev_alchemy::settings::Settings;
use dev_alchemy::vm::{HostOs, VirtualMachineConfig, catalog};

/// Build and deploy development VM images
#[derive(Parser, Debug)]
#[command(name = "alchemy", version, about = "Build and deploy development VM images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the VM image for an operating system, or `all`
    Build(BuildArgs),
    /// Create a local VM from a built image
    Create(TargetArgs),
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Operating system name, e.g. ubuntu or windows11
    osname: String,

    /// Target architecture (amd64, arm64)
    #[arg(short, long, default_value = "amd64")]
    arch: String,

    /// OS flavour (server, desktop); ignored for OSes without one
    #[arg(short = 't', long = "type", default_value = "server")]
    os_type: String,
}

#[derive(Args, Debug)]
struct BuildArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Number of builds to run at once for `all`
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Print the build reports as JSON on stdout
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let dirs = ProjectDirs::discover();
    let _log_guard = logging::init(dirs.as_ref().ok().map(ProjectDirs::log_dir).as_deref());

    let code = match dirs.map_err(anyhow::Error::from).and_then(|dirs| run(cli, dirs)) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "alchemy failed");
            eprintln!("error: {e:#}");
            e.downcast_ref::<BuildError>().map_or(1, BuildError::exit_code)
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(cli: Cli, dirs: ProjectDirs) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    let dirs = Arc::new(dirs);
    let settings = Settings::load(&dirs)?;

    match cli.command {
        Command::Build(args) => {
            let parallel = args.parallel.unwrap_or(settings.build.parallel);
            let supervisor = Arc::new(BuildSupervisor::new(Arc::clone(&dirs), settings));
            let configs = select_targets(supervisor.catalog(), &args.target)?;

            let summary = runtime.block_on(run_batch(supervisor, configs, parallel));
            print_summary(&summary, args.json)?;
            Ok(summary.exit_code())
        }
        Command::Create(target) => {
            let catalog = catalog::available_configs(&dirs);
            let vm = find_target(&catalog, &target)?;
            runtime.block_on(create_vm(&vm, &dirs, &CancellationToken::new()))?;
            Ok(0)
        }
    }
}

fn select_targets(
    catalog: &[VirtualMachineConfig],
    target: &TargetArgs,
) -> Result<Vec<VirtualMachineConfig>, BuildError> {
    if target.osname == "all" {
        let host = HostOs::current();
        let configs = catalog::configs_for_host(catalog, host);
        if configs.is_empty() {
            return Err(BuildError::configuration(format!(
                "no build targets available on {host}"
            )));
        }
        return Ok(configs);
    }
    find_target(catalog, target).map(|vm| vec![vm])
}

/// The catalog entry for `target` on this host. `--type` only narrows the
/// search for OSes that have flavours.
fn find_target(
    catalog: &[VirtualMachineConfig],
    target: &TargetArgs,
) -> Result<VirtualMachineConfig, BuildError> {
    let host = HostOs::current();
    let candidates: Vec<&VirtualMachineConfig> = catalog
        .iter()
        .filter(|vm| vm.host_os == host && vm.os == target.osname && vm.arch == target.arch)
        .collect();
    let has_types = candidates.iter().any(|vm| vm.os_type.is_some());

    candidates
        .into_iter()
        .find(|vm| !has_types || vm.os_type.as_deref() == Some(target.os_type.as_str()))
        .cloned()
        .ok_or_else(|| {
            BuildError::configuration(format!(
                "invalid combination on {host}: os={}, type={}, arch={}",
                target.osname, target.os_type, target.arch
            ))
        })
}

fn print_summary(summary: &BatchSummary, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("failed to serialize build reports")?
        );
        return Ok(());
    }
    for report in &summary.reports {
        let outcome = report.error.as_deref().unwrap_or("ok");
        println!(
            "{:<28} {:<14} port {:<5} {}",
            report.slug,
            format!("{:?}", report.status),
            report.vnc_port,
            outcome
        );
    }
    Ok(())
}
