//! The verification harness
//!
//! Drives one process through the smoke test: after the device has been bound and the group
//! joined, [`run`] creates a queue, bootstraps the communication context, sums a contribution of
//! `1` from every process with a single all-reduce and checks that the result equals the number
//! of processes.
//!
//! Everything acquired here (queue, context, buffers) is owned by [`run`] and released when it
//! returns, whether it succeeds or fails.

use std::fmt;
use std::process::ExitCode;

use tracing::{debug, error, info, warn};

use crate::collective::{distribute_seed, AsyncFault, Collective, CollectiveContext};
use crate::config::AsyncErrorPolicy;
use crate::device::Device;
use crate::error::{Error, Result, Termination};
use crate::group::ProcessGroup;

/// Value every process contributes to the reduction
pub const CONTRIBUTION: i32 = 1;

/// The steps of a run, in the order they happen.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Stage {
    /// Map the process to a local device and bind it
    SelectDevice,
    /// Join the process group
    JoinGroup,
    /// Create the command queue
    CreateQueue,
    /// Broadcast the seed and create the communication context
    DistributeSeed,
    /// Allocate and fill the payload buffers
    SetupBuffers,
    /// Issue the all-reduce
    AllReduce,
    /// Poll the context for asynchronous errors
    CheckAsync,
    /// Wait for the device to drain
    Synchronize,
    /// Copy the result back and compare it
    Verify,
}

impl Stage {
    /// Progress line logged once the stage has completed
    pub fn milestone(self) -> &'static str {
        match self {
            Stage::SelectDevice => "device bound",
            Stage::JoinGroup => "MPI initialized",
            Stage::CreateQueue => "queue created",
            Stage::DistributeSeed => "NCCL initialized",
            Stage::SetupBuffers => "buffers ready",
            Stage::AllReduce => "all-reduce issued",
            Stage::CheckAsync => "async error checked",
            Stage::Synchronize => "device synchronized",
            Stage::Verify => "all done",
        }
    }
}

/// Log a completed stage: at info on the root, at debug everywhere else.
pub fn progress(rank: usize, stage: Stage) {
    if rank == crate::group::ROOT {
        info!(rank, ?stage, "{}", stage.milestone());
    } else {
        debug!(rank, ?stage, "{}", stage.milestone());
    }
}

/// Outcome of the final comparison
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Verdict {
    /// The reduced value equals the number of processes.
    Pass,
    /// The reduced value differs from the number of processes.
    Mismatch,
}

impl Verdict {
    /// Process exit status for this verdict
    pub fn status(self) -> u8 {
        match self {
            Verdict::Pass => 0,
            Verdict::Mismatch => 1,
        }
    }

    /// [`Verdict::status`] as the return value of `main`
    pub fn exit_code(self) -> ExitCode {
        ExitCode::from(self.status())
    }
}

/// What one process observed during a completed run.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Report {
    /// Rank of the process
    pub rank: usize,
    /// Number of processes in the group
    pub size: usize,
    /// Ordinal of the bound device
    pub device: usize,
    /// Value read back from the output buffer
    pub result: i32,
    /// Value the output buffer should hold
    pub expected: i32,
    /// Asynchronous error seen under [`AsyncErrorPolicy::Advisory`]
    pub async_fault: Option<AsyncFault>,
}

impl Report {
    /// Compare the observed result with the expected one.
    pub fn verdict(&self) -> Verdict {
        if self.result == self.expected {
            Verdict::Pass
        } else {
            Verdict::Mismatch
        }
    }

    /// Whether the run passed
    pub fn passed(&self) -> bool {
        self.verdict() == Verdict::Pass
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Result: {}; {}",
            self.result,
            match self.verdict() {
                Verdict::Pass => "Success!",
                Verdict::Mismatch => "Incorrect!",
            }
        )
    }
}

/// Run the smoke test on a process that has bound `device` and joined `group`.
///
/// All processes of `group` must call this concurrently with the same `policy`.
///
/// # Errors
///
/// Any failure of the device, the group or the collective. An asynchronous collective error is
/// returned as [`Error::AsyncFault`] under [`AsyncErrorPolicy::Escalate`]; under
/// [`AsyncErrorPolicy::Advisory`] it is logged, recorded in the [`Report`] and the run carries
/// on.
pub fn run<G, C>(
    group: &G,
    device: &C::Device,
    collective: &C,
    policy: AsyncErrorPolicy,
) -> Result<Report>
where
    G: ProcessGroup,
    C: Collective,
{
    let rank = group.rank();
    let size = group.size();
    let expected = expected_sum(size)?;

    let queue = device.create_queue()?;
    progress(rank, Stage::CreateQueue);

    let seed = distribute_seed(group, collective)?;
    let context = collective.init_rank(&queue, &seed, size, rank)?;
    progress(rank, Stage::DistributeSeed);

    let input = device.upload(&queue, &[CONTRIBUTION])?;
    let mut output = device.alloc_zeroed(&queue, 1)?;
    progress(rank, Stage::SetupBuffers);

    context.all_reduce_sum(&input, &mut output)?;
    progress(rank, Stage::AllReduce);

    let async_fault = context.async_error()?;
    if let Some(fault) = async_fault {
        match policy {
            AsyncErrorPolicy::Escalate => return Err(Error::AsyncFault { code: fault.code }),
            AsyncErrorPolicy::Advisory => warn!(rank, code = fault.code, "{}", fault),
        }
    }
    progress(rank, Stage::CheckAsync);

    device.synchronize()?;
    progress(rank, Stage::Synchronize);

    let result = device
        .download(&queue, &output)?
        .first()
        .copied()
        .ok_or(Error::MissingResult)?;
    progress(rank, Stage::Verify);

    Ok(Report {
        rank,
        size,
        device: device.ordinal(),
        result,
        expected,
        async_fault,
    })
}

/// Settle the outcome of [`run`] on process `rank`.
///
/// A report is printed as its result line on stderr and ends the process with the status of its
/// verdict. An error is logged and ends the process the way [`Error::termination`] says.
pub fn conclude(rank: usize, outcome: Result<Report>) -> Termination {
    match outcome {
        Ok(report) => {
            eprintln!("{}", report);
            Termination::Exit(report.verdict().status())
        }
        Err(err) => {
            error!(rank, "{}", err);
            err.termination()
        }
    }
}

/// The sum of every process's contribution, as the collective's element type.
fn expected_sum(size: usize) -> Result<i32> {
    use conv::ConvUtil;

    size.value_as::<i32>()
        .ok()
        .and_then(|size| size.checked_mul(CONTRIBUTION))
        .ok_or_else(|| {
            Error::library(
                crate::error::Subsystem::Group,
                0,
                format!("group of {} processes overflows the reduction type", size),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(result: i32, expected: i32) -> Report {
        Report {
            rank: 0,
            size: expected as usize,
            device: 0,
            result,
            expected,
            async_fault: None,
        }
    }

    #[test]
    fn matching_sum_passes() {
        let report = report(4, 4);
        assert_eq!(report.verdict(), Verdict::Pass);
        assert_eq!(report.to_string(), "Result: 4; Success!");
    }

    #[test]
    fn wrong_sum_fails() {
        let report = report(3, 4);
        assert!(!report.passed());
        assert_eq!(report.verdict(), Verdict::Mismatch);
        assert_eq!(report.to_string(), "Result: 3; Incorrect!");
    }

    #[test]
    fn verdict_sets_exit_status() {
        assert_eq!(Verdict::Pass.status(), 0);
        assert_eq!(Verdict::Mismatch.status(), 1);
        assert_eq!(
            format!("{:?}", Verdict::Pass.exit_code()),
            format!("{:?}", ExitCode::SUCCESS)
        );
        assert_eq!(
            format!("{:?}", Verdict::Mismatch.exit_code()),
            format!("{:?}", ExitCode::FAILURE)
        );
    }

    #[test]
    fn concluded_report_exits_with_its_verdict() {
        assert_eq!(conclude(0, Ok(report(4, 4))), Termination::Exit(0));
        assert_eq!(conclude(0, Ok(report(3, 4))), Termination::Exit(1));
    }

    #[test]
    fn concluded_device_error_exits_without_abort() {
        let err = Error::library(crate::error::Subsystem::Device, 700, "illegal address");
        assert_eq!(conclude(1, Err(err)), Termination::Exit(1));
        assert_eq!(
            conclude(1, Err(Error::AsyncFault { code: 6 })),
            Termination::AbortGroup(6)
        );
    }

    #[test]
    fn expected_sum_is_group_size() {
        assert_eq!(expected_sum(1).unwrap(), 1);
        assert_eq!(expected_sum(4).unwrap(), 4);
        assert!(expected_sum(usize::MAX).is_err());
    }

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::SelectDevice < Stage::JoinGroup);
        assert!(Stage::AllReduce < Stage::CheckAsync);
        assert!(Stage::Synchronize < Stage::Verify);
    }
}
