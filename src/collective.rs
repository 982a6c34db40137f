//! Collective communication
//!
//! The collective library needs every participant to agree on an opaque identifier before it can
//! build a communication context, but it cannot distribute that identifier itself. Bootstrapping
//! therefore takes two phases:
//!
//! 1. the [`ROOT`] process asks the library for a fresh [`Seed`] and broadcasts it byte-for-byte
//!    over the [`ProcessGroup`], see [`distribute_seed`],
//! 2. every process creates its local [`CollectiveContext`] from the seed, the group size and its
//!    own rank.

use std::fmt;

use tracing::debug;

use crate::device::Device;
use crate::error::Result;
use crate::group::{ProcessGroup, ROOT};

/// Size in bytes of a collective bootstrap seed (`NCCL_UNIQUE_ID_BYTES`)
pub const SEED_BYTES: usize = 128;

/// Opaque identifier shared by all participants of one communication context.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Seed([u8; SEED_BYTES]);

impl Seed {
    /// A seed of all zero bytes, the receive buffer on non-root processes
    pub const fn zeroed() -> Self {
        Seed([0; SEED_BYTES])
    }

    /// Wrap raw seed bytes.
    pub const fn from_bytes(bytes: [u8; SEED_BYTES]) -> Self {
        Seed(bytes)
    }

    /// The raw seed bytes
    pub fn as_bytes(&self) -> &[u8; SEED_BYTES] {
        &self.0
    }

    /// Mutable access to the raw seed bytes, used as a broadcast buffer
    pub fn as_bytes_mut(&mut self) -> &mut [u8; SEED_BYTES] {
        &mut self.0
    }
}

impl Default for Seed {
    fn default() -> Self {
        Seed::zeroed()
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed(")?;
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..)")
    }
}

/// An asynchronous error reported by a communication context.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AsyncFault {
    /// Raw error code of the collective library
    pub code: i32,
}

impl fmt::Display for AsyncFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "asynchronous collective error (code {})", self.code)
    }
}

/// A collective communication library.
pub trait Collective {
    /// Device the library moves data between
    type Device: Device;
    /// Per-process handle on a communication context
    type Context: CollectiveContext<Device = Self::Device>;

    /// Generate a fresh seed. Only called on the [`ROOT`].
    fn unique_seed(&self) -> Result<Seed>;

    /// Create this process's handle on the context identified by `seed`.
    ///
    /// Collective operations of the context are enqueued on `queue`. The handle releases the
    /// context when dropped.
    fn init_rank(
        &self,
        queue: &<Self::Device as Device>::Queue,
        seed: &Seed,
        size: usize,
        rank: usize,
    ) -> Result<Self::Context>;
}

/// One process's handle on a communication context.
pub trait CollectiveContext {
    /// Device the context's buffers live on
    type Device: Device;

    /// Enqueue an element-wise sum of `input` over all participants into `output`.
    ///
    /// Returns once the operation is enqueued; `output` holds the result only after the device
    /// has been synchronized. Every participant must call this with buffers of the same length.
    fn all_reduce_sum(
        &self,
        input: &<Self::Device as Device>::Buffer,
        output: &mut <Self::Device as Device>::Buffer,
    ) -> Result<()>;

    /// Query the context for an asynchronous error.
    ///
    /// `Ok(None)` means no error has been reported so far.
    fn async_error(&self) -> Result<Option<AsyncFault>>;
}

/// Agree on a seed across the whole group.
///
/// The [`ROOT`] generates the seed, every other process receives a byte-for-byte copy of it.
pub fn distribute_seed<G, C>(group: &G, collective: &C) -> Result<Seed>
where
    G: ProcessGroup,
    C: Collective,
{
    let mut seed = if group.rank() == ROOT {
        collective.unique_seed()?
    } else {
        Seed::zeroed()
    };
    group.broadcast_bytes(ROOT, seed.as_bytes_mut())?;
    debug!(rank = group.rank(), ?seed, "seed distributed");
    Ok(seed)
}
