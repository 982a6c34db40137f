//! Multi-process NCCL all-reduce smoke test
//!
//! Checks that a job started by an MPI launcher can bring up an [NCCL] communicator across its
//! GPUs and run a collective on it. Every process
//!
//! 1. binds the GPU `local rank mod local size`, as reported by the launcher environment,
//! 2. joins the MPI world,
//! 3. creates a CUDA stream,
//! 4. receives the NCCL unique id from rank 0 over an MPI broadcast and creates its communicator,
//! 5. copies the value `1` into a device buffer,
//! 6. issues a sum all-reduce into a second device buffer,
//! 7. polls the communicator for asynchronous errors,
//! 8. synchronizes the device,
//! 9. copies the result back and checks that it equals the number of processes.
//!
//! [NCCL]: https://developer.nvidia.com/nccl
//!
//! # Usage
//!
//! ```text
//! mpirun -np 4 nccl-smoke
//! ```
//!
//! Every rank prints `Result: 4; Success!` on stderr and exits with status 0. A wrong sum prints
//! `Incorrect!` and exits with status 1.
//!
//! # Backends
//!
//! The harness in [`harness::run`] is generic over three seams:
//!
//! - [`ProcessGroup`](group::ProcessGroup): ranks and a byte broadcast, backed by MPI in
//!   [`world`] (feature `mpi`),
//! - [`Device`](device::Device): queues, buffers and synchronization, backed by CUDA in [`cuda`]
//!   (feature `cuda`),
//! - [`Collective`](collective::Collective): seeds, contexts and the all-reduce, backed by NCCL in
//!   [`cuda`].
//!
//! The [`loopback`] backend implements all three in-process and is always available.

#![warn(missing_docs)]

pub mod collective;
pub mod config;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod error;
pub mod group;
pub mod harness;
pub mod loopback;
pub mod raw;
#[cfg(feature = "mpi")]
pub mod world;

pub use crate::error::{Error, Result};

/// The traits of the harness seams
pub mod traits {
    pub use crate::collective::{Collective, CollectiveContext};
    pub use crate::device::Device;
    pub use crate::error::Check;
    pub use crate::group::ProcessGroup;
    pub use crate::raw::AsRaw;
}
