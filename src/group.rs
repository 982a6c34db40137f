//! Process groups
//!
//! The process group is the out-of-band channel the harness uses before the collective library
//! is up: it hands out ranks and carries the collective's bootstrap seed from the root to every
//! other process.

use crate::error::Result;

/// Rank of the process that generates and broadcasts the collective seed.
pub const ROOT: usize = 0;

/// A set of cooperating processes with fixed ranks.
///
/// Rank and size are assigned when the group is joined and never change afterwards.
pub trait ProcessGroup {
    /// Rank of the calling process
    fn rank(&self) -> usize;

    /// Number of processes in the group
    fn size(&self) -> usize;

    /// Broadcast the contents of `buffer` from `root` to the `buffer`s of all other processes.
    ///
    /// Every process must call this with a buffer of the same length.
    fn broadcast_bytes(&self, root: usize, buffer: &mut [u8]) -> Result<()>;

    /// Whether the calling process is the [`ROOT`]
    fn is_root(&self) -> bool {
        self.rank() == ROOT
    }
}
