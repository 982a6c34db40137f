//! `nccl-smoke`: run the all-reduce smoke test on every rank of an MPI job
//!
//! Start it through the MPI launcher, one process per GPU:
//!
//! ```text
//! mpirun -np 4 nccl-smoke
//! ```

use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nccl_smoke::config::{AsyncErrorPolicy, Launcher, LocalTopology};
use nccl_smoke::cuda::{CudaDevice, NcclCollective};
use nccl_smoke::device::Device;
use nccl_smoke::error::{Error, Termination};
use nccl_smoke::group::ProcessGroup;
use nccl_smoke::harness::{self, Stage};
use nccl_smoke::world::WorldGroup;

/// Check that NCCL can all-reduce across the GPUs of an MPI job
#[derive(Debug, Parser)]
#[command(name = "nccl-smoke", version)]
struct Cli {
    /// Launcher whose environment reports the local rank and local size
    #[arg(long, value_enum, default_value_t = Launcher::Auto, env = "NCCL_SMOKE_LAUNCHER")]
    launcher: Launcher,

    /// Whether an asynchronous NCCL error fails the run or is only reported
    #[arg(
        long,
        value_enum,
        default_value_t = AsyncErrorPolicy::Escalate,
        env = "NCCL_SMOKE_ASYNC_ERRORS"
    )]
    async_errors: AsyncErrorPolicy,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // nothing may touch MPI or CUDA before the device is chosen
    let topology = match LocalTopology::from_env(cli.launcher) {
        Ok(topology) => topology,
        Err(err) => return exit_before_join(err.into()),
    };
    let device = match CudaDevice::bind(topology.device()) {
        Ok(device) => device,
        Err(err) => return exit_before_join(err),
    };
    debug!(
        launcher = %topology.launcher,
        ordinal = topology.ordinal,
        local_size = topology.size,
        device = device.ordinal(),
        "{}",
        Stage::SelectDevice.milestone()
    );

    let group = match WorldGroup::join() {
        Ok(group) => group,
        Err(err) => return exit_before_join(err),
    };
    harness::progress(group.rank(), Stage::JoinGroup);

    let outcome = harness::run(&group, &device, &NcclCollective, cli.async_errors);
    match harness::conclude(group.rank(), outcome) {
        // returning drops `group`, which finalizes MPI
        Termination::Exit(status) => ExitCode::from(status),
        Termination::AbortGroup(code) => group.abort(code),
    }
}

fn exit_before_join(err: Error) -> ExitCode {
    error!("{}", err);
    match err.termination() {
        Termination::Exit(status) => ExitCode::from(status),
        Termination::AbortGroup(_) => ExitCode::FAILURE,
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
