use cust::context::{Context, ContextFlags};
use cust::device::DeviceAttribute;
use cust::launch;
use cust::memory::{CopyDestination, DeviceBuffer};
use cust::module::Module;
use cust::stream::{Stream, StreamFlags};

use log::{debug, info, warn};

use crate::error::{MinerError, Result};
use crate::header::Share;
use crate::job::{Job, Running};
use crate::miner::{job_header, job_range};
use crate::DeviceInfo;

/// PTX image for the `search` kernel; compiled out-of-tree, mirroring the
/// OpenCL kernel's layout contract.
const PTX_FILE: &str = "kernels/pow.ptx";

const DEVICE_HEADER_SIZE: usize = 192;

pub(crate) fn device_count() -> u32 {
    cust::init(cust::CudaFlags::empty()).ok();
    cust::device::Device::num_devices().unwrap_or(0)
}

pub(crate) fn device_info(index: u32) -> Result<DeviceInfo> {
    cust::init(cust::CudaFlags::empty())?;
    let device = cust::device::Device::get_device(index).map_err(|_| MinerError::NoDevice(index))?;
    Ok(DeviceInfo {
        name: device.name()?,
        memory: device.total_memory()? as u64,
        bits: device.get_attribute(DeviceAttribute::GlobalMemoryBusWidth)? as u32,
        clock_rate: device.get_attribute(DeviceAttribute::ClockRate)? as u32,
    })
}

/// Dispatch one kernel pass over the job's nonce range. Same layout and
/// host-side re-verification as the OpenCL path.
pub(crate) fn run(job: &Job, running: &Running) -> Result<u32> {
    let hdr = job_header(job)?;
    let range = job_range(job);

    cust::init(cust::CudaFlags::empty())?;
    let device =
        cust::device::Device::get_device(job.device).map_err(|_| MinerError::NoDevice(job.device))?;
    debug!("cuda: device {}: {}", job.device, device.name()?);
    let _context = Context::create_and_push(ContextFlags::SCHED_AUTO, device)?;

    let ptx = std::fs::read_to_string(PTX_FILE)
        .map_err(|_| MinerError::BadPath(PTX_FILE.to_string()))?;
    let module = Module::from_ptx(&ptx, &[])?;
    let kernel = module.get_function("search")?;
    let stream = Stream::new(StreamFlags::NON_BLOCKING, None)?;

    let mut device_header = [0u8; DEVICE_HEADER_SIZE];
    device_header[0..128].copy_from_slice(&hdr.pre_encode());
    device_header[128..160].copy_from_slice(&hdr.padding(32));
    device_header[160..192].copy_from_slice(&job.target);

    let header_buffer = DeviceBuffer::from_slice(&device_header)?;
    let nonce_buffer = DeviceBuffer::from_slice(&[0u32])?;
    let match_buffer = DeviceBuffer::from_slice(&[0u32])?;

    let max_block = device.get_attribute(DeviceAttribute::MaxThreadsPerBlock)? as u32;
    let max_grid = device.get_attribute(DeviceAttribute::MaxGridDimX)? as u32;

    let mut block_size = job.blocks;
    if block_size < 1 || block_size > max_block {
        block_size = max_block;
    }
    let mut total_threads = job.threads;
    let max_threads = max_grid.saturating_mul(block_size);
    if total_threads < 1 || total_threads > max_threads {
        total_threads = max_threads;
    }
    // Round down to a whole number of blocks.
    let grid_size = (total_threads / block_size).max(1);
    debug!("cuda: {} blocks of {} threads", grid_size, block_size);

    if !running.is_running() {
        return Err(MinerError::Aborted);
    }

    unsafe {
        launch!(
            kernel<<<grid_size, block_size, 0, stream>>>(
                header_buffer.as_device_ptr(),
                nonce_buffer.as_device_ptr(),
                match_buffer.as_device_ptr(),
                job.nonce,
                range
            )
        )?;
    }
    stream.synchronize()?;

    let mut nonce_out = [0u32; 1];
    let mut match_out = [0u32; 1];
    nonce_buffer.copy_to(&mut nonce_out)?;
    match_buffer.copy_to(&mut match_out)?;

    if match_out[0] != 0 {
        let nonce = nonce_out[0];
        let mut share = Share::new(&hdr);
        let hash = share.pow(nonce);
        debug!(
            "cuda: candidate nonce {} hash {}",
            nonce,
            hex::encode(&hash)
        );
        if hash <= job.target {
            running.stop();
            info!("cuda: solution at nonce {}", nonce);
            return Ok(nonce);
        }
        warn!(
            "cuda: candidate nonce {} fails verification under the mask",
            nonce
        );
    }

    if !running.is_running() {
        return Err(MinerError::Aborted);
    }
    Err(MinerError::NoSolution)
}
