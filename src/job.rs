use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::error::{MinerError, Result};

pub const MIN_HEADER_SIZE: usize = 4;
pub const MAX_HEADER_SIZE: usize = 512;

/// High bit marks a synthetic (non-GPU) device id, so concurrent CPU jobs
/// never collide with real GPU device numbers in the registry.
const CPU_DEVICE_BIT: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Simple,
    Cpu,
    OpenCl,
    Cuda,
}

impl Backend {
    pub fn from_name(name: &str) -> Option<Backend> {
        match name {
            "simple" => Some(Backend::Simple),
            "cpu" => Some(Backend::Cpu),
            "opencl" => Some(Backend::OpenCl),
            "cuda" => Some(Backend::Cuda),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Simple => "simple",
            Backend::Cpu => "cpu",
            Backend::OpenCl => "opencl",
            Backend::Cuda => "cuda",
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Backend::OpenCl | Backend::Cuda)
    }

    /// Whether this backend was compiled into the crate.
    pub fn available(&self) -> bool {
        match self {
            Backend::Simple | Backend::Cpu => true,
            Backend::OpenCl => cfg!(feature = "opencl"),
            Backend::Cuda => cfg!(feature = "cuda"),
        }
    }
}

/// One search invocation: a header template, the nonce window, the target
/// and the worker parameters for the selected backend.
#[derive(Debug, Clone)]
pub struct Job {
    pub backend: Backend,
    pub header: Vec<u8>,
    pub nonce: u32,
    pub range: u32,
    pub target: [u8; 32],
    pub threads: u32,
    pub blocks: u32,
    pub device: u32,
    pub extra_nonce: Option<[u8; 24]>,
}

impl Job {
    pub fn new(backend: Backend, header: &[u8], target: [u8; 32]) -> Job {
        Job {
            backend,
            header: header.to_vec(),
            nonce: 0,
            range: 0,
            target,
            threads: 1,
            blocks: 0,
            device: 0,
            extra_nonce: None,
        }
    }

    /// Partition the search space against other miners working on the same
    /// template. Applied to the header once at submit time.
    pub fn randomize_extra_nonce(&mut self) {
        let mut extra_nonce = [0u8; 24];
        rand::thread_rng().fill(&mut extra_nonce[..]);
        self.extra_nonce = Some(extra_nonce);
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backend.available() {
            return Err(MinerError::NoSupport(self.backend.name()));
        }
        let len = self.header.len();
        if len < MIN_HEADER_SIZE || len > MAX_HEADER_SIZE || len % 4 != 0 {
            return Err(MinerError::BadArgs("invalid header size"));
        }
        Ok(())
    }
}

/// Cooperative cancellation latch. The only transition is true to false;
/// workers poll it between nonce iterations with relaxed ordering.
#[derive(Debug, Clone)]
pub struct Running(Arc<AtomicBool>);

impl Running {
    pub fn new() -> Running {
        Running(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

impl Default for Running {
    fn default() -> Self {
        Running::new()
    }
}

/// Table of in-flight jobs, keyed by device id. At most one job per device.
///
/// The process-wide instance lives in [`crate::registry`]; tests construct
/// their own.
pub struct Registry {
    jobs: Mutex<HashMap<u32, Running>>,
    cpu_counter: AtomicU16,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            jobs: Mutex::new(HashMap::new()),
            cpu_counter: AtomicU16::new(0),
        }
    }

    /// Mint a device id for a job that has no physical device.
    pub fn next_cpu_device(&self) -> u32 {
        let counter = self.cpu_counter.fetch_add(1, Ordering::Relaxed);
        CPU_DEVICE_BIT | counter as u32
    }

    /// Register a job on `device` and hand back its cancellation latch.
    pub fn insert(&self, device: u32) -> Result<Running> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&device) {
            return Err(MinerError::MaxLoad);
        }
        let running = Running::new();
        jobs.insert(device, running.clone());
        Ok(running)
    }

    /// Idempotent.
    pub fn remove(&self, device: u32) {
        self.jobs.lock().unwrap().remove(&device);
    }

    pub fn is_running(&self, device: u32) -> bool {
        self.jobs.lock().unwrap().contains_key(&device)
    }

    /// Signal the job on `device` to wind down. Returns whether one was found.
    pub fn stop(&self, device: u32) -> bool {
        let jobs = self.jobs.lock().unwrap();
        match jobs.get(&device) {
            Some(running) => {
                running.stop();
                true
            }
            None => false,
        }
    }

    /// Signal every registered job. Returns whether any was found.
    pub fn stop_all(&self) -> bool {
        let jobs = self.jobs.lock().unwrap();
        for running in jobs.values() {
            running.stop();
        }
        !jobs.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().unwrap().is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
