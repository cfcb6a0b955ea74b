use thiserror::Error;

pub type Result<T> = std::result::Result<T, MinerError>;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("miner out of memory")]
    OutOfMemory,
    #[error("miner timed out")]
    Timeout,
    #[error("miner failed: {0}")]
    Failure(String),
    #[error("invalid mining arguments: {0}")]
    BadArgs(&'static str),
    #[error("bad header encoding")]
    Encoding,
    #[error("no device {0}")]
    NoDevice(u32),
    #[error("invalid device properties")]
    BadProps,
    #[error("backend not compiled in: {0}")]
    NoSupport(&'static str),
    #[error("job already in progress for device")]
    MaxLoad,
    #[error("bad kernel path: {0}")]
    BadPath(String),
    #[error("no solution in nonce range")]
    NoSolution,
    #[error("target is negative or malformed")]
    NegTarget,
    #[error("hash above target")]
    HighHash,
    #[error("job aborted")]
    Aborted,
    #[cfg(feature = "opencl")]
    #[error("opencl error: {0}")]
    Ocl(#[from] ocl::Error),
    #[cfg(feature = "cuda")]
    #[error("cuda error: {0}")]
    Cuda(#[from] cust::error::CudaError),
}

impl MinerError {
    /// Stable integer code, compatible with the registry other Handshake
    /// miner implementations share. Driver errors have no slot of their own
    /// and collapse to the generic failure code; their detail survives in
    /// the `Display` output.
    pub fn code(&self) -> i32 {
        use MinerError::*;
        match self {
            OutOfMemory => 1,
            Timeout => 2,
            Failure(_) => 3,
            BadArgs(_) => 4,
            Encoding => 5,
            NoDevice(_) => 6,
            BadProps => 7,
            NoSupport(_) => 8,
            MaxLoad => 9,
            BadPath(_) => 10,
            NoSolution => 11,
            NegTarget => 19,
            HighHash => 20,
            Aborted => 21,
            #[cfg(feature = "opencl")]
            Ocl(_) => 3,
            #[cfg(feature = "cuda")]
            Cuda(_) => 3,
        }
    }
}
