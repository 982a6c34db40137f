//! The MPI world as a process group
//!
//! Joining initializes MPI; dropping the [`WorldGroup`] finalizes it. MPI reports failures of
//! the calls made here through its default error handler, which aborts the job.

use std::os::raw::c_int;

use conv::ConvUtil;
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use tracing::debug;

use crate::error::{Error, Result, Subsystem};
use crate::group::ProcessGroup;

/// All processes started by the launcher, `MPI_COMM_WORLD`
pub struct WorldGroup {
    rank: usize,
    size: usize,
    world: SimpleCommunicator,
    // dropped last, finalizes MPI
    _universe: Universe,
}

impl WorldGroup {
    /// Initialize MPI and join the world communicator.
    ///
    /// # Errors
    ///
    /// If MPI has already been initialized in this process, or the world reports a rank or size
    /// that is not a valid index.
    pub fn join() -> Result<Self> {
        let universe = mpi::initialize()
            .ok_or_else(|| Error::library(Subsystem::Group, 0, "MPI is already initialized"))?;
        let world = universe.world();
        let rank = world
            .rank()
            .value_as::<usize>()
            .map_err(|_| Error::library(Subsystem::Group, 0, "negative rank"))?;
        let size = world
            .size()
            .value_as::<usize>()
            .map_err(|_| Error::library(Subsystem::Group, 0, "negative group size"))?;
        debug!(rank, size, "joined MPI world");
        Ok(WorldGroup {
            rank,
            size,
            world,
            _universe: universe,
        })
    }

    /// Terminate every process in the world with `code`.
    pub fn abort(&self, code: c_int) -> ! {
        self.world.abort(code)
    }
}

impl ProcessGroup for WorldGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_bytes(&self, root: usize, buffer: &mut [u8]) -> Result<()> {
        let root = root
            .value_as::<c_int>()
            .map_err(|_| Error::library(Subsystem::Group, 0, "root rank out of range"))?;
        self.world.process_at_rank(root).broadcast_into(buffer);
        Ok(())
    }
}
