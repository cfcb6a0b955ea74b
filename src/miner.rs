use std::thread;

use log::{debug, info};

use crate::error::{MinerError, Result};
use crate::header::{Header, Share, HEADER_SIZE};
use crate::job::{Backend, Job, Running};

/// Upper bound on CPU worker fan-out; requests past it are clamped.
const MAX_THREADS: u32 = 128;

/// Run `job` to completion on its selected backend. Returns the matching
/// nonce, `NoSolution` when the range is exhausted, or `Aborted` when the
/// job's running latch was cleared externally.
pub(crate) fn run(job: &Job, running: &Running) -> Result<u32> {
    match job.backend {
        Backend::Simple => simple_run(job, running),
        Backend::Cpu => cpu_run(job, running),
        #[cfg(feature = "opencl")]
        Backend::OpenCl => crate::opencl::run(job, running),
        #[cfg(feature = "cuda")]
        Backend::Cuda => crate::cuda::run(job, running),
        #[cfg(not(feature = "opencl"))]
        Backend::OpenCl => Err(MinerError::NoSupport("opencl")),
        #[cfg(not(feature = "cuda"))]
        Backend::Cuda => Err(MinerError::NoSupport("cuda")),
    }
}

/// Decode the job's header template, applying the per-job extra nonce.
pub(crate) fn job_header(job: &Job) -> Result<Header> {
    if job.header.len() != HEADER_SIZE {
        return Err(MinerError::BadArgs("backend requires a 236-byte header"));
    }
    let mut hdr = Header::decode(&job.header)?;
    if let Some(extra_nonce) = job.extra_nonce {
        hdr.extra_nonce = extra_nonce;
    }
    Ok(hdr)
}

pub(crate) fn job_range(job: &Job) -> u32 {
    if job.range == 0 {
        1
    } else {
        job.range
    }
}

/// The common search loop: write the nonce into the cached share, hash,
/// compare. The latch is observed once per iteration.
fn scan(
    share: &mut Share,
    target: &[u8; 32],
    running: &Running,
    start: u32,
    len: u32,
) -> Result<u32> {
    let end = start as u64 + len as u64;
    let mut nonce = start as u64;

    while nonce < end {
        if !running.is_running() {
            return Err(MinerError::Aborted);
        }
        if share.pow(nonce as u32) <= *target {
            return Ok(nonce as u32);
        }
        nonce += 1;
    }
    Err(MinerError::NoSolution)
}

/// Single-threaded reference backend.
fn simple_run(job: &Job, running: &Running) -> Result<u32> {
    let hdr = job_header(job)?;
    let mut share = Share::new(&hdr);
    let range = job_range(job);

    debug!(
        "simple: scanning nonces {}..{}",
        job.nonce,
        job.nonce as u64 + range as u64
    );
    let nonce = scan(&mut share, &job.target, running, job.nonce, range)?;
    running.stop();
    info!(
        "simple: solution at nonce {} hash {}",
        nonce,
        hex::encode(&share.pow(nonce))
    );
    Ok(nonce)
}

/// Thread fan-out over equal sub-ranges. The first worker to find a match
/// clears the shared latch; the rest observe it and wind down.
fn cpu_run(job: &Job, running: &Running) -> Result<u32> {
    let hdr = job_header(job)?;
    let range = job_range(job);
    let threads = job.threads.max(1).min(MAX_THREADS).min(range);
    let sub_range = range / threads;

    debug!(
        "cpu: scanning nonces {}..{} on {} threads",
        job.nonce,
        job.nonce as u64 + range as u64,
        threads
    );

    let mut workers = Vec::with_capacity(threads as usize);
    for thread in 0..threads {
        let mut share = Share::new(&hdr);
        let target = job.target;
        let running = running.clone();
        let start = job.nonce.wrapping_add(sub_range * thread);
        // The last worker also covers the division remainder.
        let len = if thread == threads - 1 {
            range - sub_range * thread
        } else {
            sub_range
        };

        workers.push(thread::spawn(move || {
            let result = scan(&mut share, &target, &running, start, len);
            if result.is_ok() {
                running.stop();
            }
            result
        }));
    }

    let mut outcome = Err(MinerError::NoSolution);
    let mut aborted = false;
    for worker in workers {
        match worker.join() {
            Ok(Ok(nonce)) => outcome = Ok(nonce),
            Ok(Err(MinerError::Aborted)) => aborted = true,
            Ok(Err(MinerError::NoSolution)) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(MinerError::Failure("mining worker panicked".to_string())),
        }
    }

    match outcome {
        Ok(nonce) => {
            info!(
                "cpu: solution at nonce {} hash {}",
                nonce,
                hex::encode(&Share::new(&hdr).pow(nonce))
            );
            Ok(nonce)
        }
        Err(_) if aborted => Err(MinerError::Aborted),
        Err(_) => Err(MinerError::NoSolution),
    }
}
