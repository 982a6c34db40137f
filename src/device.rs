//! Accelerator devices
//!
//! A [`Device`] is the accelerator a process is bound to. It owns the operations the harness
//! needs from the compute runtime: command queues, tiny device buffers, host copies and a
//! device-wide synchronization.
//!
//! # Examples
//!
//! ```
//! use nccl_smoke::device::select_device;
//!
//! assert_eq!(select_device(2, 4), 2);
//! assert_eq!(select_device(6, 4), 2);
//! ```

use crate::error::Result;

/// The device a process with local `ordinal` out of `size` processes on its node binds to.
///
/// # Panics
///
/// If `size` is zero. [`LocalTopology`](crate::config::LocalTopology) never holds a zero size.
pub fn select_device(ordinal: usize, size: usize) -> usize {
    ordinal % size
}

/// An accelerator the calling process is bound to.
pub trait Device: Sized {
    /// An ordered, asynchronous command queue on the device
    type Queue;
    /// A device-resident buffer of `i32`
    type Buffer;

    /// Bind the calling process to the device with the given ordinal.
    ///
    /// Must happen before any other use of the runtime.
    fn bind(ordinal: usize) -> Result<Self>;

    /// Ordinal of the bound device
    fn ordinal(&self) -> usize;

    /// Create a command queue on the device.
    fn create_queue(&self) -> Result<Self::Queue>;

    /// Allocate a buffer on `queue` holding a copy of `values`.
    fn upload(&self, queue: &Self::Queue, values: &[i32]) -> Result<Self::Buffer>;

    /// Allocate a zeroed buffer of `len` elements on `queue`.
    fn alloc_zeroed(&self, queue: &Self::Queue, len: usize) -> Result<Self::Buffer>;

    /// Copy a buffer back to the host.
    ///
    /// Work still pending on other queues is not waited for.
    fn download(&self, queue: &Self::Queue, buffer: &Self::Buffer) -> Result<Vec<i32>>;

    /// Block until every queue on the device has drained.
    fn synchronize(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn identity_within_node() {
        for size in 1..=8 {
            for ordinal in 0..size {
                assert_eq!(select_device(ordinal, size), ordinal);
            }
        }
    }

    #[test]
    fn single_device_node() {
        assert_eq!(select_device(0, 1), 0);
        assert_eq!(select_device(7, 1), 0);
    }

    proptest! {
        /// Property: the selected device always exists on the node
        #[test]
        fn selection_in_range(ordinal in 0usize..1 << 16, size in 1usize..1 << 10) {
            let device = select_device(ordinal, size);
            prop_assert!(device < size);
            prop_assert_eq!(device, ordinal % size);
        }

        /// Property: selection is a pure function of its inputs
        #[test]
        fn selection_is_deterministic(ordinal in any::<u16>(), size in 1u16..) {
            let (ordinal, size) = (usize::from(ordinal), usize::from(size));
            prop_assert_eq!(select_device(ordinal, size), select_device(ordinal, size));
        }
    }
}
