//! CUDA devices and NCCL communicators
//!
//! Backs [`Device`] with a `cudarc` driver context and its streams, and [`Collective`] with NCCL.
//!
//! The device is bound through the primary context of its ordinal, which also makes it current
//! on the calling thread. Device-wide synchronization waits for every stream of that context.

use std::cell::Cell;
use std::mem::MaybeUninit;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use conv::ConvUtil;
use cudarc::driver::{CudaContext, CudaSlice, CudaStream, DevicePtr, DevicePtrMut, DriverError};
use cudarc::nccl::result::{self as nccl_result, NcclError};
use cudarc::nccl::sys::{self as nccl_sys, ncclComm_t, ncclDataType_t, ncclRedOp_t, ncclResult_t};
use tracing::{debug, warn};

use crate::collective::{AsyncFault, Collective, CollectiveContext, Seed, SEED_BYTES};
use crate::device::Device;
use crate::error::{Check, Error, Result, ReturnCode, Subsystem};
use crate::raw::AsRaw;

impl ReturnCode for DriverError {
    const SUBSYSTEM: Subsystem = Subsystem::Device;

    fn code(&self) -> i32 {
        self.0 as i32
    }
}

impl ReturnCode for NcclError {
    const SUBSYSTEM: Subsystem = Subsystem::Collective;

    fn code(&self) -> i32 {
        self.0 as i32
    }
}

/// A CUDA device bound to the calling process
#[derive(Debug)]
pub struct CudaDevice {
    ctx: Arc<CudaContext>,
}

impl Device for CudaDevice {
    type Queue = Arc<CudaStream>;
    type Buffer = CudaSlice<i32>;

    fn bind(ordinal: usize) -> Result<Self> {
        let ctx = CudaContext::new(ordinal).check()?;
        debug!(ordinal, "CUDA context bound");
        Ok(CudaDevice { ctx })
    }

    fn ordinal(&self) -> usize {
        self.ctx.ordinal()
    }

    fn create_queue(&self) -> Result<Self::Queue> {
        self.ctx.new_stream().check()
    }

    fn upload(&self, queue: &Self::Queue, values: &[i32]) -> Result<Self::Buffer> {
        queue.memcpy_stod(values).check()
    }

    fn alloc_zeroed(&self, queue: &Self::Queue, len: usize) -> Result<Self::Buffer> {
        queue.alloc_zeros::<i32>(len).check()
    }

    fn download(&self, queue: &Self::Queue, buffer: &Self::Buffer) -> Result<Vec<i32>> {
        queue.memcpy_dtov(buffer).check()
    }

    fn synchronize(&self) -> Result<()> {
        self.ctx.synchronize().check()
    }
}

/// The NCCL library
#[derive(Copy, Clone, Debug, Default)]
pub struct NcclCollective;

impl Collective for NcclCollective {
    type Device = CudaDevice;
    type Context = NcclContext;

    fn unique_seed(&self) -> Result<Seed> {
        let id = nccl_result::get_uniqueid().check()?;
        let mut bytes = [0u8; SEED_BYTES];
        for (dst, src) in bytes.iter_mut().zip(id.internal.iter()) {
            *dst = *src as u8;
        }
        Ok(Seed::from_bytes(bytes))
    }

    fn init_rank(
        &self,
        queue: &Arc<CudaStream>,
        seed: &Seed,
        size: usize,
        rank: usize,
    ) -> Result<NcclContext> {
        let nranks = to_c_int(size, "group size")?;
        let rank = to_c_int(rank, "rank")?;

        let mut id = nccl_sys::ncclUniqueId {
            internal: [0; SEED_BYTES],
        };
        for (dst, src) in id.internal.iter_mut().zip(seed.as_bytes().iter()) {
            *dst = *src as c_char;
        }

        let mut comm = MaybeUninit::uninit();
        let comm = unsafe {
            nccl_result::comm_init_rank(comm.as_mut_ptr(), nranks, id, rank).check()?;
            comm.assume_init()
        };
        debug!(rank, nranks, "NCCL communicator created");

        Ok(NcclContext {
            comm,
            stream: queue.clone(),
            faulted: Cell::new(false),
        })
    }
}

fn to_c_int(value: usize, what: &str) -> Result<c_int> {
    value.value_as::<c_int>().map_err(|_| {
        Error::library(
            Subsystem::Collective,
            ncclResult_t::ncclInvalidArgument as i32,
            format!("{} {} does not fit a C int", what, value),
        )
    })
}

/// One process's NCCL communicator, bound to the stream its collectives are enqueued on.
///
/// Dropping the context destroys the communicator. Once an asynchronous error has been observed
/// the communicator is aborted instead, since destroying it could block on the failed operation.
#[derive(Debug)]
pub struct NcclContext {
    comm: ncclComm_t,
    stream: Arc<CudaStream>,
    faulted: Cell<bool>,
}

impl AsRaw for NcclContext {
    type Raw = ncclComm_t;
    unsafe fn as_raw(&self) -> Self::Raw {
        self.comm
    }
}

impl CollectiveContext for NcclContext {
    type Device = CudaDevice;

    fn all_reduce_sum(&self, input: &CudaSlice<i32>, output: &mut CudaSlice<i32>) -> Result<()> {
        let count = input.len();
        let (src, _record_src) = input.device_ptr(&self.stream);
        let (dst, _record_dst) = output.device_ptr_mut(&self.stream);
        unsafe {
            nccl_result::all_reduce(
                src as _,
                dst as _,
                count,
                ncclDataType_t::ncclInt32,
                ncclRedOp_t::ncclSum,
                self.as_raw(),
                self.stream.cu_stream() as _,
            )
        }
        .check()?;
        Ok(())
    }

    fn async_error(&self) -> Result<Option<AsyncFault>> {
        let mut state = ncclResult_t::ncclSuccess;
        let ret = unsafe { nccl_sys::ncclCommGetAsyncError(self.as_raw(), &mut state) };
        if ret != ncclResult_t::ncclSuccess {
            return Err::<Option<AsyncFault>, _>(NcclError(ret)).check();
        }
        match state {
            ncclResult_t::ncclSuccess => Ok(None),
            fault => {
                self.faulted.set(true);
                Ok(Some(AsyncFault { code: fault as i32 }))
            }
        }
    }
}

impl Drop for NcclContext {
    fn drop(&mut self) {
        let res = unsafe {
            if self.faulted.get() {
                nccl_result::comm_abort(self.comm)
            } else {
                nccl_result::comm_destroy(self.comm)
            }
        };
        if let Err(err) = res {
            warn!(?err, "failed to release NCCL communicator");
        }
    }
}
