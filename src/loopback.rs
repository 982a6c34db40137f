//! In-process loopback backend
//!
//! Threads stand in for processes and host memory stands in for device memory, so the harness
//! can be driven end to end on a machine without MPI launchers or GPUs.
//!
//! The backend keeps the properties of the real libraries that the harness relies on:
//!
//! - the broadcast is a rendezvous of every rank,
//! - a context only comes up if every rank passes the same seed, size and a distinct rank,
//! - the all-reduce is deferred: the output buffer is written when the device is synchronized,
//!   and reading it before that observes the zeroed allocation.
//!
//! A [`Loopback`] describes exactly one run.
//!
//! # Examples
//!
//! ```
//! use nccl_smoke::config::AsyncErrorPolicy;
//! use nccl_smoke::device::Device;
//! use nccl_smoke::group::ProcessGroup;
//! use nccl_smoke::harness;
//! use nccl_smoke::loopback::{Loopback, LoopbackDevice};
//!
//! let loopback = Loopback::new(3);
//! let reports = loopback.run(|group, collective| {
//!     let device = LoopbackDevice::bind(group.rank()).unwrap();
//!     harness::run(&group, &device, &collective, AsyncErrorPolicy::Escalate).unwrap()
//! });
//! assert!(reports.iter().all(|report| report.result == 3));
//! ```

use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::trace;

use crate::collective::{AsyncFault, Collective, CollectiveContext, Seed, SEED_BYTES};
use crate::device::Device;
use crate::error::{Error, Result, Subsystem};
use crate::group::ProcessGroup;

/// `ncclInvalidArgument`
const INVALID_ARGUMENT: i32 = 4;
/// `ncclInvalidUsage`
const INVALID_USAGE: i32 = 5;

struct Shared {
    size: usize,
    barrier: Barrier,
    slot: Mutex<Vec<u8>>,
    sums: Mutex<Vec<i32>>,
    context_seeds: Mutex<Vec<Seed>>,
    seeds_generated: AtomicUsize,
    contexts_released: AtomicUsize,
    async_fault: Option<i32>,
    skew: i32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A group of `size` simulated processes sharing one simulated collective.
#[derive(Clone)]
pub struct Loopback {
    shared: Arc<Shared>,
}

impl Loopback {
    /// A loopback group of `size` processes. `size` must be at least one.
    pub fn new(size: usize) -> Self {
        Self::build(size, None, 0)
    }

    /// A loopback group whose contexts report the asynchronous error `code` once the reduction
    /// has been issued.
    pub fn with_async_fault(size: usize, code: i32) -> Self {
        Self::build(size, Some(code), 0)
    }

    /// A loopback group whose all-reduce adds `skew` to every reduced element.
    pub fn with_result_skew(size: usize, skew: i32) -> Self {
        Self::build(size, None, skew)
    }

    fn build(size: usize, async_fault: Option<i32>, skew: i32) -> Self {
        Loopback {
            shared: Arc::new(Shared {
                size,
                barrier: Barrier::new(size),
                slot: Mutex::new(Vec::new()),
                sums: Mutex::new(Vec::new()),
                context_seeds: Mutex::new(Vec::new()),
                seeds_generated: AtomicUsize::new(0),
                contexts_released: AtomicUsize::new(0),
                async_fault,
                skew,
            }),
        }
    }

    /// Number of simulated processes
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// The group handle of the process with `rank`.
    pub fn group(&self, rank: usize) -> LoopbackGroup {
        LoopbackGroup {
            rank,
            shared: Arc::clone(&self.shared),
        }
    }

    /// A handle on the simulated collective library.
    pub fn collective(&self) -> LoopbackCollective {
        LoopbackCollective {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run `f` once per rank, each on its own thread, and collect the results in rank order.
    ///
    /// A panic on any rank is resumed on the calling thread.
    pub fn run<R, F>(&self, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(LoopbackGroup, LoopbackCollective) -> R + Sync,
    {
        let f = &f;
        thread::scope(|scope| {
            let handles: Vec<_> = (0..self.size())
                .map(|rank| {
                    let group = self.group(rank);
                    let collective = self.collective();
                    scope.spawn(move || f(group, collective))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|err| panic::resume_unwind(err)))
                .collect()
        })
    }

    /// Number of communication contexts created so far
    pub fn contexts_created(&self) -> usize {
        lock(&self.shared.context_seeds).len()
    }

    /// Number of communication contexts dropped so far
    pub fn contexts_released(&self) -> usize {
        self.shared.contexts_released.load(Ordering::SeqCst)
    }

    /// Number of seeds handed out by [`Collective::unique_seed`]
    pub fn seeds_generated(&self) -> usize {
        self.shared.seeds_generated.load(Ordering::SeqCst)
    }

    /// The seed every context was created with, in creation order
    pub fn context_seeds(&self) -> Vec<Seed> {
        lock(&self.shared.context_seeds).clone()
    }
}

impl fmt::Debug for Loopback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loopback")
            .field("size", &self.shared.size)
            .field("async_fault", &self.shared.async_fault)
            .field("skew", &self.shared.skew)
            .finish()
    }
}

/// One simulated process's view of the group
pub struct LoopbackGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl ProcessGroup for LoopbackGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn broadcast_bytes(&self, root: usize, buffer: &mut [u8]) -> Result<()> {
        if root >= self.shared.size {
            return Err(Error::library(
                Subsystem::Group,
                INVALID_ARGUMENT,
                format!("root {} outside a group of {}", root, self.shared.size),
            ));
        }

        if self.rank == root {
            let mut slot = lock(&self.shared.slot);
            slot.clear();
            slot.extend_from_slice(buffer);
        }
        self.shared.barrier.wait();

        // every rank has to reach the second rendezvous, even on a length mismatch
        let received = if self.rank == root {
            Ok(())
        } else {
            let slot = lock(&self.shared.slot);
            if slot.len() == buffer.len() {
                buffer.copy_from_slice(&slot);
                Ok(())
            } else {
                Err(Error::library(
                    Subsystem::Group,
                    INVALID_ARGUMENT,
                    format!(
                        "broadcast of {} bytes into a buffer of {}",
                        slot.len(),
                        buffer.len()
                    ),
                ))
            }
        };
        self.shared.barrier.wait();
        received
    }
}

/// Host memory standing in for a device buffer
#[derive(Clone, Debug)]
pub struct LoopbackBuffer {
    cells: Arc<Mutex<Vec<i32>>>,
}

impl LoopbackBuffer {
    fn new(values: Vec<i32>) -> Self {
        LoopbackBuffer {
            cells: Arc::new(Mutex::new(values)),
        }
    }
}

struct PendingReduce {
    output: LoopbackBuffer,
    shared: Arc<Shared>,
}

impl PendingReduce {
    /// Wait for every rank to contribute, then publish the sums.
    fn complete(self) {
        self.shared.barrier.wait();
        let sums = lock(&self.shared.sums).clone();
        let mut output = lock(&self.output.cells);
        for (out, sum) in output.iter_mut().zip(sums) {
            *out = sum.wrapping_add(self.shared.skew);
        }
    }
}

/// A queue of deferred operations
#[derive(Clone)]
pub struct LoopbackQueue {
    pending: Arc<Mutex<Vec<PendingReduce>>>,
}

impl fmt::Debug for LoopbackQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackQueue")
            .field("pending", &lock(&self.pending).len())
            .finish()
    }
}

/// A simulated device
#[derive(Debug)]
pub struct LoopbackDevice {
    ordinal: usize,
    queues: Mutex<Vec<LoopbackQueue>>,
}

impl Device for LoopbackDevice {
    type Queue = LoopbackQueue;
    type Buffer = LoopbackBuffer;

    fn bind(ordinal: usize) -> Result<Self> {
        Ok(LoopbackDevice {
            ordinal,
            queues: Mutex::new(Vec::new()),
        })
    }

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn create_queue(&self) -> Result<Self::Queue> {
        let queue = LoopbackQueue {
            pending: Arc::new(Mutex::new(Vec::new())),
        };
        lock(&self.queues).push(queue.clone());
        Ok(queue)
    }

    fn upload(&self, _queue: &Self::Queue, values: &[i32]) -> Result<Self::Buffer> {
        Ok(LoopbackBuffer::new(values.to_vec()))
    }

    fn alloc_zeroed(&self, _queue: &Self::Queue, len: usize) -> Result<Self::Buffer> {
        Ok(LoopbackBuffer::new(vec![0; len]))
    }

    fn download(&self, _queue: &Self::Queue, buffer: &Self::Buffer) -> Result<Vec<i32>> {
        Ok(lock(&buffer.cells).clone())
    }

    fn synchronize(&self) -> Result<()> {
        let queues = lock(&self.queues).clone();
        for queue in queues {
            let pending = std::mem::take(&mut *lock(&queue.pending));
            for op in pending {
                op.complete();
            }
        }
        trace!(ordinal = self.ordinal, "loopback device synchronized");
        Ok(())
    }
}

/// The simulated collective library
pub struct LoopbackCollective {
    shared: Arc<Shared>,
}

impl Collective for LoopbackCollective {
    type Device = LoopbackDevice;
    type Context = LoopbackContext;

    fn unique_seed(&self) -> Result<Seed> {
        let nonce = self.shared.seeds_generated.fetch_add(1, Ordering::SeqCst) + 1;
        let mut bytes = [0u8; SEED_BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(31) ^ (nonce as u8).wrapping_mul(0x9d) ^ 0xa5;
        }
        Ok(Seed::from_bytes(bytes))
    }

    fn init_rank(
        &self,
        queue: &LoopbackQueue,
        seed: &Seed,
        size: usize,
        rank: usize,
    ) -> Result<LoopbackContext> {
        if size != self.shared.size || rank >= size {
            return Err(Error::library(
                Subsystem::Collective,
                INVALID_ARGUMENT,
                format!("rank {} of {} in a loopback of {}", rank, size, self.shared.size),
            ));
        }

        let mut seeds = lock(&self.shared.context_seeds);
        if let Some(first) = seeds.first() {
            if first != seed {
                return Err(Error::library(
                    Subsystem::Collective,
                    INVALID_USAGE,
                    format!("rank {} joined with seed {:?}, expected {:?}", rank, seed, first),
                ));
            }
        }
        seeds.push(*seed);

        Ok(LoopbackContext {
            queue: queue.clone(),
            shared: Arc::clone(&self.shared),
        })
    }
}

/// One simulated process's handle on the loopback context
pub struct LoopbackContext {
    queue: LoopbackQueue,
    shared: Arc<Shared>,
}

impl CollectiveContext for LoopbackContext {
    type Device = LoopbackDevice;

    fn all_reduce_sum(&self, input: &LoopbackBuffer, output: &mut LoopbackBuffer) -> Result<()> {
        let values = lock(&input.cells).clone();
        {
            let mut sums = lock(&self.shared.sums);
            if sums.len() < values.len() {
                sums.resize(values.len(), 0);
            }
            for (sum, value) in sums.iter_mut().zip(values) {
                *sum = sum.wrapping_add(value);
            }
        }
        lock(&self.queue.pending).push(PendingReduce {
            output: output.clone(),
            shared: Arc::clone(&self.shared),
        });
        Ok(())
    }

    fn async_error(&self) -> Result<Option<AsyncFault>> {
        Ok(self.shared.async_fault.map(|code| AsyncFault { code }))
    }
}

impl Drop for LoopbackContext {
    fn drop(&mut self) {
        self.shared.contexts_released.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_every_rank() {
        let loopback = Loopback::new(4);
        let received = loopback.run(|group, _| {
            let mut buffer = if group.is_root() { [7u8, 8, 9] } else { [0u8; 3] };
            group.broadcast_bytes(0, &mut buffer).unwrap();
            buffer
        });
        assert!(received.iter().all(|buffer| *buffer == [7, 8, 9]));
    }

    #[test]
    fn broadcast_from_non_zero_root() {
        let loopback = Loopback::new(3);
        let received = loopback.run(|group, _| {
            let mut buffer = [group.rank() as u8; 2];
            group.broadcast_bytes(2, &mut buffer).unwrap();
            buffer
        });
        assert_eq!(received, vec![[2, 2], [2, 2], [2, 2]]);
    }

    #[test]
    fn broadcast_rejects_unknown_root() {
        let loopback = Loopback::new(1);
        let mut buffer = [0u8; 4];
        assert!(loopback.group(0).broadcast_bytes(1, &mut buffer).is_err());
    }

    #[test]
    fn seeds_differ_between_calls() {
        let loopback = Loopback::new(1);
        let collective = loopback.collective();
        let first = collective.unique_seed().unwrap();
        let second = collective.unique_seed().unwrap();
        assert_ne!(first, second);
        assert_ne!(first, Seed::zeroed());
        assert_eq!(loopback.seeds_generated(), 2);
    }

    #[test]
    fn context_rejects_foreign_seed() {
        let loopback = Loopback::new(2);
        let collective = loopback.collective();
        let device = LoopbackDevice::bind(0).unwrap();
        let queue = device.create_queue().unwrap();
        let seed = collective.unique_seed().unwrap();
        let _first = collective.init_rank(&queue, &seed, 2, 0).unwrap();
        let err = collective
            .init_rank(&queue, &Seed::zeroed(), 2, 1)
            .err()
            .unwrap();
        assert_eq!(err.subsystem(), Some(Subsystem::Collective));
        assert_eq!(loopback.contexts_created(), 1);
    }

    #[test]
    fn context_rejects_wrong_size() {
        let loopback = Loopback::new(2);
        let device = LoopbackDevice::bind(0).unwrap();
        let queue = device.create_queue().unwrap();
        assert!(loopback
            .collective()
            .init_rank(&queue, &Seed::zeroed(), 3, 0)
            .is_err());
        assert!(loopback
            .collective()
            .init_rank(&queue, &Seed::zeroed(), 2, 2)
            .is_err());
    }

    #[test]
    fn reduction_lands_on_synchronize() {
        let loopback = Loopback::new(1);
        let collective = loopback.collective();
        let device = LoopbackDevice::bind(0).unwrap();
        let queue = device.create_queue().unwrap();
        let context = collective
            .init_rank(&queue, &Seed::zeroed(), 1, 0)
            .unwrap();

        let input = device.upload(&queue, &[5]).unwrap();
        let mut output = device.alloc_zeroed(&queue, 1).unwrap();
        context.all_reduce_sum(&input, &mut output).unwrap();
        assert_eq!(device.download(&queue, &output).unwrap(), vec![0]);

        device.synchronize().unwrap();
        assert_eq!(device.download(&queue, &output).unwrap(), vec![5]);
    }

    #[test]
    fn skewed_reduction_is_off_by_skew() {
        let loopback = Loopback::with_result_skew(1, -1);
        let collective = loopback.collective();
        let device = LoopbackDevice::bind(0).unwrap();
        let queue = device.create_queue().unwrap();
        let context = collective
            .init_rank(&queue, &Seed::zeroed(), 1, 0)
            .unwrap();

        let input = device.upload(&queue, &[5]).unwrap();
        let mut output = device.alloc_zeroed(&queue, 1).unwrap();
        context.all_reduce_sum(&input, &mut output).unwrap();
        device.synchronize().unwrap();
        assert_eq!(device.download(&queue, &output).unwrap(), vec![4]);
    }

    #[test]
    fn dropped_context_is_counted() {
        let loopback = Loopback::new(1);
        let device = LoopbackDevice::bind(0).unwrap();
        let queue = device.create_queue().unwrap();
        let context = loopback
            .collective()
            .init_rank(&queue, &Seed::zeroed(), 1, 0)
            .unwrap();
        assert_eq!(loopback.contexts_released(), 0);
        drop(context);
        assert_eq!(loopback.contexts_released(), 1);
    }
}
