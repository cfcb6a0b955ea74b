use log::{debug, info, warn};
use ocl::builders::{DeviceSpecifier, ProgramBuilder};
use ocl::enums::{DeviceInfo as OclDeviceInfo, DeviceInfoResult};
use ocl::{Buffer, Context, Device, Kernel, Platform, Queue};

use crate::error::{MinerError, Result};
use crate::header::Share;
use crate::job::{Job, Running};
use crate::miner::{job_header, job_range};
use crate::DeviceInfo;

static KERNEL_SRC: &str = include_str!("kernels/pow.cl");

/// Share pre-image, pad32 and target, as the kernel expects them.
const DEVICE_HEADER_SIZE: usize = 192;

/// All GPU devices, flattened across platforms in enumeration order.
fn list_devices() -> Vec<(Platform, Device)> {
    let mut devices = Vec::new();
    for platform in Platform::list() {
        if let Ok(platform_devices) = Device::list_all(&platform) {
            for device in platform_devices {
                devices.push((platform, device));
            }
        }
    }
    devices
}

pub(crate) fn device_count() -> u32 {
    list_devices().len() as u32
}

pub(crate) fn device_info(index: u32) -> Result<DeviceInfo> {
    let (_, device) = list_devices()
        .into_iter()
        .nth(index as usize)
        .ok_or(MinerError::NoDevice(index))?;

    let memory = match device
        .info(OclDeviceInfo::GlobalMemSize)
        .map_err(|_| MinerError::BadProps)?
    {
        DeviceInfoResult::GlobalMemSize(memory) => memory,
        _ => return Err(MinerError::BadProps),
    };
    let clock_rate = match device
        .info(OclDeviceInfo::MaxClockFrequency)
        .map_err(|_| MinerError::BadProps)?
    {
        DeviceInfoResult::MaxClockFrequency(clock_rate) => clock_rate,
        _ => return Err(MinerError::BadProps),
    };
    Ok(DeviceInfo {
        name: device.name()?,
        memory,
        // The memory bus width has no portable OpenCL query.
        bits: 0,
        clock_rate,
    })
}

/// Clamp the requested work sizing to what the device reports, and round the
/// item count down to a whole number of work groups.
fn work_sizes(device: &Device, threads: u32, blocks: u32) -> Result<(usize, usize)> {
    let max_group_size = match device
        .info(OclDeviceInfo::MaxWorkGroupSize)
        .map_err(|_| MinerError::BadProps)?
    {
        DeviceInfoResult::MaxWorkGroupSize(size) => size,
        _ => return Err(MinerError::BadProps),
    };
    let max_work_items: usize = match device
        .info(OclDeviceInfo::MaxWorkItemSizes)
        .map_err(|_| MinerError::BadProps)?
    {
        DeviceInfoResult::MaxWorkItemSizes(sizes) => sizes.iter().product(),
        _ => return Err(MinerError::BadProps),
    };

    let mut total_work_items = threads as usize;
    if total_work_items < 1 || total_work_items > max_work_items {
        total_work_items = max_work_items;
    }
    let mut work_group_size = blocks as usize;
    if work_group_size < 1 || work_group_size > max_group_size {
        work_group_size = max_group_size;
    }
    total_work_items = total_work_items / work_group_size * work_group_size;
    if total_work_items == 0 {
        total_work_items = work_group_size;
    }
    Ok((total_work_items, work_group_size))
}

/// Dispatch one kernel pass over the job's nonce range.
///
/// The kernel never sees the mask, so it matches on the unmasked digest;
/// candidates are re-verified on the host with the mask applied before being
/// reported.
pub(crate) fn run(job: &Job, running: &Running) -> Result<u32> {
    let hdr = job_header(job)?;
    let range = job_range(job);

    let (platform, device) = list_devices()
        .into_iter()
        .nth(job.device as usize)
        .ok_or(MinerError::NoDevice(job.device))?;
    debug!("opencl: device {}: {}", job.device, device.name()?);

    let context = Context::builder()
        .platform(platform)
        .devices(DeviceSpecifier::Single(device))
        .build()?;
    let queue = Queue::new(&context, device, None)?;
    let mut prog_builder = ProgramBuilder::new();
    prog_builder
        .src(KERNEL_SRC)
        .devices(DeviceSpecifier::Single(device));
    let program = prog_builder.build(&context)?;

    let mut device_header = [0u8; DEVICE_HEADER_SIZE];
    device_header[0..128].copy_from_slice(&hdr.pre_encode());
    device_header[128..160].copy_from_slice(&hdr.padding(32));
    device_header[160..192].copy_from_slice(&job.target);

    let header_buffer: Buffer<u8> = Buffer::builder()
        .queue(queue.clone())
        .len(DEVICE_HEADER_SIZE)
        .build()?;
    let nonce_buffer: Buffer<u32> = Buffer::builder().queue(queue.clone()).len(1).build()?;
    let match_buffer: Buffer<u32> = Buffer::builder().queue(queue.clone()).len(1).build()?;

    header_buffer.write(&device_header[..]).enq()?;
    nonce_buffer.write(&[0u32][..]).enq()?;
    match_buffer.write(&[0u32][..]).enq()?;

    let kernel = Kernel::builder()
        .program(&program)
        .name("search")
        .queue(queue.clone())
        .arg_named("header", &header_buffer)
        .arg_named("nonce_out", &nonce_buffer)
        .arg_named("match_out", &match_buffer)
        .arg_named("start_nonce", job.nonce)
        .arg_named("range", range)
        .build()?;

    let (total_work_items, work_group_size) = work_sizes(&device, job.threads, job.blocks)?;
    debug!(
        "opencl: {} work items in groups of {}",
        total_work_items, work_group_size
    );

    if !running.is_running() {
        return Err(MinerError::Aborted);
    }

    let cmd = kernel
        .cmd()
        .global_work_size(total_work_items)
        .local_work_size(work_group_size);
    unsafe {
        cmd.enq()?;
    }

    let mut nonce_out = [0u32; 1];
    let mut match_out = [0u32; 1];
    nonce_buffer.read(&mut nonce_out[..]).enq()?;
    match_buffer.read(&mut match_out[..]).enq()?;

    if match_out[0] != 0 {
        let nonce = nonce_out[0];
        let mut share = Share::new(&hdr);
        let hash = share.pow(nonce);
        debug!(
            "opencl: candidate nonce {} hash {}",
            nonce,
            hex::encode(&hash)
        );
        if hash <= job.target {
            running.stop();
            info!("opencl: solution at nonce {}", nonce);
            return Ok(nonce);
        }
        warn!(
            "opencl: candidate nonce {} fails verification under the mask",
            nonce
        );
    }

    if !running.is_running() {
        return Err(MinerError::Aborted);
    }
    Err(MinerError::NoSolution)
}
