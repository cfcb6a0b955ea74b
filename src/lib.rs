#[cfg(feature = "cuda")]
mod cuda;
mod error;
mod hash;
mod header;
mod job;
mod miner;
#[cfg(feature = "opencl")]
mod opencl;
mod target;

pub use error::{MinerError, Result};
pub use header::{Header, Share, HEADER_SIZE, SHARE_SIZE};
pub use job::{Backend, Job, Registry, Running, MAX_HEADER_SIZE, MIN_HEADER_SIZE};
pub use target::{bits_to_target, target_to_bits};

use lazy_static::lazy_static;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

/// The process-wide job registry behind [`mine`], [`mine_async`], [`stop`]
/// and friends. Tests that need isolation construct their own [`Registry`].
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Network tag baked in at compile time.
pub fn network() -> &'static str {
    option_env!("HNS_NETWORK").unwrap_or("main")
}

/// Names of the backends compiled into this build.
pub fn backends() -> Vec<&'static str> {
    let mut backends = vec!["simple", "cpu"];
    if cfg!(feature = "opencl") {
        backends.push("opencl");
    }
    if cfg!(feature = "cuda") {
        backends.push("cuda");
    }
    backends
}

pub fn has_opencl() -> bool {
    cfg!(feature = "opencl")
}

pub fn has_cuda() -> bool {
    cfg!(feature = "cuda")
}

/// A physical GPU as seen by the compiled backend.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub memory: u64,
    pub bits: u32,
    pub clock_rate: u32,
}

pub fn device_count() -> u32 {
    #[cfg(feature = "opencl")]
    return opencl::device_count();
    #[cfg(all(feature = "cuda", not(feature = "opencl")))]
    return cuda::device_count();
    #[cfg(not(any(feature = "opencl", feature = "cuda")))]
    return 0;
}

fn device_info(index: u32) -> Result<DeviceInfo> {
    #[cfg(feature = "opencl")]
    return opencl::device_info(index);
    #[cfg(all(feature = "cuda", not(feature = "opencl")))]
    return cuda::device_info(index);
    #[cfg(not(any(feature = "opencl", feature = "cuda")))]
    return Err(MinerError::NoDevice(index));
}

pub fn devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();
    for index in 0..device_count() {
        match device_info(index) {
            Ok(info) => devices.push(info),
            Err(_) => break,
        }
    }
    devices
}

/// BLAKE2b-256 convenience digest.
pub fn blake2b(data: &[u8]) -> [u8; 32] {
    hash::blake2b_256(data)
}

/// SHA3-256 convenience digest.
pub fn sha3(data: &[u8]) -> [u8; 32] {
    hash::sha3_256(data)
}

/// Recompute the PoW digest of an encoded header and compare it against an
/// explicit 32-byte target.
pub fn verify(header: &[u8], target: &[u8; 32]) -> Result<()> {
    let hdr = Header::decode(header)?;
    if hdr.pow_hash() > *target {
        return Err(MinerError::HighHash);
    }
    Ok(())
}

/// An in-flight [`mine_async`] job.
pub struct JobHandle {
    device: u32,
    running: Running,
    task: tokio::task::JoinHandle<Result<Option<u32>>>,
}

impl JobHandle {
    /// The registry device id this job runs under. Synthetic for non-GPU
    /// backends.
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Signal the job to wind down; it completes with `Aborted`.
    pub fn stop(&self) {
        self.running.stop();
    }

    /// Wait for the search to finish.
    pub async fn join(self) -> Result<Option<u32>> {
        self.task
            .await
            .map_err(|_| MinerError::Failure("mining task panicked".to_string()))?
    }
}

impl Registry {
    fn claim_device(&self, job: &Job) -> u32 {
        if job.backend.is_gpu() {
            job.device
        } else {
            self.next_cpu_device()
        }
    }

    /// Run `job` to completion on this registry, blocking the caller.
    /// Returns the matching nonce, or `None` when the range is exhausted.
    pub fn mine(&self, job: &Job) -> Result<Option<u32>> {
        job.validate()?;
        let device = self.claim_device(job);
        let running = self.insert(device)?;
        let result = miner::run(job, &running);
        self.remove(device);
        match result {
            Ok(nonce) => Ok(Some(nonce)),
            Err(MinerError::NoSolution) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Schedule `job` on the blocking worker pool and return immediately.
    /// The job is registered before this returns, so [`Registry::stop`] and
    /// [`Registry::is_running`] see it right away. Must be called within a
    /// tokio runtime.
    pub fn mine_async(&'static self, job: Job) -> Result<JobHandle> {
        job.validate()?;
        let device = self.claim_device(&job);
        let running = self.insert(device)?;
        let task = tokio::task::spawn_blocking({
            let running = running.clone();
            move || {
                let result = miner::run(&job, &running);
                self.remove(device);
                match result {
                    Ok(nonce) => Ok(Some(nonce)),
                    Err(MinerError::NoSolution) => Ok(None),
                    Err(err) => Err(err),
                }
            }
        });
        Ok(JobHandle {
            device,
            running,
            task,
        })
    }
}

/// Run `job` to completion, blocking the caller.
pub fn mine(job: &Job) -> Result<Option<u32>> {
    registry().mine(job)
}

/// Schedule `job` and return a handle; see [`Registry::mine_async`].
pub fn mine_async(job: Job) -> Result<JobHandle> {
    registry().mine_async(job)
}

/// Whether a job is registered on `device`.
pub fn is_running(device: u32) -> bool {
    registry().is_running(device)
}

/// Signal the job on `device` to wind down. Returns whether one was found.
pub fn stop(device: u32) -> bool {
    registry().stop(device)
}

/// Signal every in-flight job. Returns whether any was found.
pub fn stop_all() -> bool {
    registry().stop_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn easy_header() -> Header {
        let mut hdr = Header::default();
        hdr.prev_block = [0x1f; 32];
        hdr.name_root = [0x2e; 32];
        hdr.time = 1_600_000_000;
        hdr
    }

    fn easy_target() -> [u8; 32] {
        let mut target = [0xff; 32];
        target[0] = 0x0f;
        target
    }

    fn isolated() -> &'static Registry {
        Box::leak(Box::new(Registry::new()))
    }

    #[test]
    fn verify_permissive_target() {
        let hdr = easy_header();
        verify(&hdr.encode(), &[0xff; 32]).unwrap();
    }

    #[test]
    fn verify_rejects_high_hash() {
        let hdr = easy_header();
        let mut target = [0x00; 32];
        target[31] = 0x01;
        assert!(matches!(
            verify(&hdr.encode(), &target),
            Err(MinerError::HighHash)
        ));
    }

    #[test]
    fn verify_rejects_short_header() {
        assert!(matches!(
            verify(&[0u8; 100], &[0xff; 32]),
            Err(MinerError::Encoding)
        ));
    }

    #[test]
    fn convenience_digests_are_256_bit() {
        assert_eq!(blake2b(b"x").len(), 32);
        assert_eq!(sha3(b"x").len(), 32);
        assert_ne!(blake2b(b"x"), sha3(b"x"));
    }

    #[test]
    fn advertised_backends() {
        let backends = backends();
        assert!(backends.contains(&"simple"));
        assert!(backends.contains(&"cpu"));
        assert_eq!(backends.contains(&"opencl"), has_opencl());
        assert_eq!(backends.contains(&"cuda"), has_cuda());
    }

    #[test]
    fn network_defaults_to_main() {
        assert_eq!(network(), "main");
    }

    #[test]
    fn mine_finds_a_verifiable_nonce() {
        let mut job = Job::new(Backend::Simple, &easy_header().encode(), easy_target());
        job.range = 10_000;
        let nonce = isolated().mine(&job).unwrap().expect("solution in range");

        let mut hdr = easy_header();
        hdr.nonce = nonce;
        verify(&hdr.encode(), &job.target).unwrap();
    }

    #[test]
    fn mine_reports_exhaustion_as_none() {
        let mut job = Job::new(Backend::Simple, &easy_header().encode(), [0x00; 32]);
        job.range = 25;
        assert_eq!(isolated().mine(&job).unwrap(), None);
    }

    #[test]
    fn mine_cleans_up_its_registration() {
        let registry = Registry::new();
        let mut job = Job::new(Backend::Cpu, &easy_header().encode(), [0x00; 32]);
        job.range = 25;
        job.threads = 2;
        assert_eq!(registry.mine(&job).unwrap(), None);
        assert!(registry.is_empty());
    }

    #[cfg(not(feature = "opencl"))]
    #[test]
    fn missing_backend_is_rejected() {
        let job = Job::new(Backend::OpenCl, &easy_header().encode(), easy_target());
        assert!(matches!(mine(&job), Err(MinerError::NoSupport(_))));
    }

    #[tokio::test]
    async fn mine_async_completes() {
        let registry = isolated();
        let mut job = Job::new(Backend::Cpu, &easy_header().encode(), easy_target());
        job.range = 20_000;
        job.threads = 2;
        let handle = registry.mine_async(job.clone()).unwrap();
        let nonce = handle.join().await.unwrap().expect("solution in range");

        let mut hdr = easy_header();
        hdr.nonce = nonce;
        verify(&hdr.encode(), &job.target).unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stop_aborts_a_long_search() {
        let registry = isolated();
        let mut job = Job::new(Backend::Simple, &easy_header().encode(), [0x00; 32]);
        job.range = u32::MAX;
        let handle = registry.mine_async(job).unwrap();
        let device = handle.device();

        assert!(registry.is_running(device));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.stop(device));

        assert!(matches!(handle.join().await, Err(MinerError::Aborted)));
        assert!(!registry.is_running(device));
    }

    #[tokio::test]
    async fn stop_all_clears_outstanding_jobs() {
        let registry = isolated();
        let mut job = Job::new(Backend::Cpu, &easy_header().encode(), [0x00; 32]);
        job.range = u32::MAX;
        job.threads = 2;
        let first = registry.mine_async(job.clone()).unwrap();
        let second = registry.mine_async(job).unwrap();

        assert!(registry.stop_all());
        assert!(matches!(first.join().await, Err(MinerError::Aborted)));
        assert!(matches!(second.join().await, Err(MinerError::Aborted)));
        assert!(registry.is_empty());
    }
}
