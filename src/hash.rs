use blake2::digest::consts::U32;
use blake2::digest::{Update, VariableOutput};
use blake2::{Blake2b, Blake2b512, Blake2bVar, Digest};
use sha3::Sha3_256;

use crate::error::{MinerError, Result};

pub type Blake2b256 = Blake2b<U32>;

/// Unkeyed BLAKE2b at an arbitrary digest length in 1..=64 bytes.
pub fn blake2b(data: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let mut ctx =
        Blake2bVar::new(out_len).map_err(|_| MinerError::BadArgs("digest length out of range"))?;
    ctx.update(data);
    let mut out = vec![0u8; out_len];
    ctx.finalize_variable(&mut out)
        .map_err(|_| MinerError::BadArgs("digest length out of range"))?;
    Ok(out)
}

pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut ctx = Blake2b256::new();
    Digest::update(&mut ctx, data);
    ctx.finalize().into()
}

pub fn blake2b_512(data: &[u8]) -> [u8; 64] {
    let mut ctx = Blake2b512::new();
    Digest::update(&mut ctx, data);
    ctx.finalize().into()
}

pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut ctx = Sha3_256::new();
    Digest::update(&mut ctx, data);
    ctx.finalize().into()
}
