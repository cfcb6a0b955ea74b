use std::convert::TryInto;

use blake2::{Blake2b512, Digest};
use sha3::Sha3_256;

use crate::error::{MinerError, Result};
use crate::hash::Blake2b256;
use crate::target::bits_to_target;

/// Serialized header length: preheader, subheader and mask.
pub const HEADER_SIZE: usize = 236;

/// Length of the hashed pre-image (the pool "share").
pub const SHARE_SIZE: usize = 128;

/// A Handshake block header.
///
/// Value-typed; hashes are recomputed on demand. Miners that need the cached
/// pre-image go through [`Share`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub nonce: u32,
    pub time: u64,
    pub prev_block: [u8; 32],
    pub name_root: [u8; 32],
    pub extra_nonce: [u8; 24],
    pub reserved_root: [u8; 32],
    pub witness_root: [u8; 32],
    pub merkle_root: [u8; 32],
    pub version: u32,
    pub bits: u32,
    pub mask: [u8; 32],
}

impl Default for Header {
    fn default() -> Self {
        Header {
            nonce: 0,
            time: 0,
            prev_block: [0; 32],
            name_root: [0; 32],
            extra_nonce: [0; 24],
            reserved_root: [0; 32],
            witness_root: [0; 32],
            merkle_root: [0; 32],
            version: 0,
            bits: 0,
            mask: [0; 32],
        }
    }
}

impl Header {
    pub fn decode(data: &[u8]) -> Result<Header> {
        if data.len() < HEADER_SIZE {
            return Err(MinerError::Encoding);
        }
        Ok(Header {
            nonce: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            time: u64::from_le_bytes(data[4..12].try_into().unwrap()),
            prev_block: data[12..44].try_into().unwrap(),
            name_root: data[44..76].try_into().unwrap(),
            extra_nonce: data[76..100].try_into().unwrap(),
            reserved_root: data[100..132].try_into().unwrap(),
            witness_root: data[132..164].try_into().unwrap(),
            merkle_root: data[164..196].try_into().unwrap(),
            version: u32::from_le_bytes(data[196..200].try_into().unwrap()),
            bits: u32::from_le_bytes(data[200..204].try_into().unwrap()),
            mask: data[204..236].try_into().unwrap(),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut data = [0u8; HEADER_SIZE];
        data[0..4].copy_from_slice(&self.nonce.to_le_bytes());
        data[4..12].copy_from_slice(&self.time.to_le_bytes());
        data[12..44].copy_from_slice(&self.prev_block);
        data[44..76].copy_from_slice(&self.name_root);
        data[76..100].copy_from_slice(&self.extra_nonce);
        data[100..132].copy_from_slice(&self.reserved_root);
        data[132..164].copy_from_slice(&self.witness_root);
        data[164..196].copy_from_slice(&self.merkle_root);
        data[196..200].copy_from_slice(&self.version.to_le_bytes());
        data[200..204].copy_from_slice(&self.bits.to_le_bytes());
        data[204..236].copy_from_slice(&self.mask);
        data
    }

    /// The 128-byte subheader: everything the preheader commits to except
    /// the mask.
    pub fn sub_encode(&self) -> [u8; 128] {
        let mut data = [0u8; 128];
        data[0..24].copy_from_slice(&self.extra_nonce);
        data[24..56].copy_from_slice(&self.reserved_root);
        data[56..88].copy_from_slice(&self.witness_root);
        data[88..120].copy_from_slice(&self.merkle_root);
        data[120..124].copy_from_slice(&self.version.to_le_bytes());
        data[124..128].copy_from_slice(&self.bits.to_le_bytes());
        data
    }

    pub fn sub_hash(&self) -> [u8; 32] {
        crate::hash::blake2b_256(&self.sub_encode())
    }

    pub fn mask_hash(&self) -> [u8; 32] {
        let mut ctx = Blake2b256::new();
        Digest::update(&mut ctx, &self.prev_block);
        Digest::update(&mut ctx, &self.mask);
        ctx.finalize().into()
    }

    /// Binds the subheader and the pool-held mask into the pre-image.
    pub fn commit_hash(&self) -> [u8; 32] {
        let mut ctx = Blake2b256::new();
        Digest::update(&mut ctx, &self.sub_hash());
        Digest::update(&mut ctx, &self.mask_hash());
        ctx.finalize().into()
    }

    /// XOR stream of `prev_block` and `name_root`, repeated to `len` bytes.
    /// Invariant under nonce changes, so miners cache it per job.
    pub fn padding(&self, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.prev_block[i % 32] ^ self.name_root[i % 32])
            .collect()
    }

    /// The 128-byte pre-image for the PoW hash.
    pub fn pre_encode(&self) -> [u8; SHARE_SIZE] {
        let mut data = [0u8; SHARE_SIZE];
        data[0..4].copy_from_slice(&self.nonce.to_le_bytes());
        data[4..12].copy_from_slice(&self.time.to_le_bytes());
        data[12..32].copy_from_slice(&self.padding(20));
        data[32..64].copy_from_slice(&self.prev_block);
        data[64..96].copy_from_slice(&self.name_root);
        data[96..128].copy_from_slice(&self.commit_hash());
        data
    }

    /// The 32-byte PoW digest, mask applied.
    pub fn pow_hash(&self) -> [u8; 32] {
        Share::new(self).pow(self.nonce)
    }

    /// Check this header's PoW against its own compact `bits`.
    pub fn verify_pow(&self) -> Result<()> {
        let target = bits_to_target(self.bits)?;
        if self.pow_hash() > target {
            return Err(MinerError::HighHash);
        }
        Ok(())
    }
}

/// Cached mining state for one job: the pre-image with the nonce slot at
/// offset 0, and the paddings and mask that never change while mining.
#[derive(Debug, Clone)]
pub struct Share {
    share: [u8; SHARE_SIZE],
    pad8: [u8; 8],
    pad32: [u8; 32],
    mask: [u8; 32],
}

impl Share {
    pub fn new(hdr: &Header) -> Share {
        let pad32: [u8; 32] = hdr.padding(32).try_into().unwrap();
        let mut pad8 = [0u8; 8];
        pad8.copy_from_slice(&pad32[..8]);
        Share {
            share: hdr.pre_encode(),
            pad8,
            pad32,
            mask: hdr.mask,
        }
    }

    /// Digest before the mask is applied.
    fn mix(&mut self, nonce: u32) -> [u8; 32] {
        self.share[0..4].copy_from_slice(&nonce.to_le_bytes());

        let mut left_ctx = Blake2b512::new();
        Digest::update(&mut left_ctx, &self.share[..]);
        let left: [u8; 64] = left_ctx.finalize().into();

        let mut right_ctx = Sha3_256::new();
        Digest::update(&mut right_ctx, &self.share[..]);
        Digest::update(&mut right_ctx, &self.pad8);
        let right: [u8; 32] = right_ctx.finalize().into();

        let mut ctx = Blake2b256::new();
        Digest::update(&mut ctx, &left);
        Digest::update(&mut ctx, &self.pad32);
        Digest::update(&mut ctx, &right);
        ctx.finalize().into()
    }

    /// Write `nonce` into the pre-image and compute the masked PoW digest.
    pub fn pow(&mut self, nonce: u32) -> [u8; 32] {
        let mut hash = self.mix(nonce);
        for (h, m) in hash.iter_mut().zip(self.mask.iter()) {
            *h ^= m;
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{blake2b_256, blake2b_512, sha3_256};

    fn sample_header() -> Header {
        let mut hdr = Header::default();
        hdr.nonce = 0x01020304;
        hdr.time = 0x0505_0606_0707_0808;
        hdr.prev_block = [0x11; 32];
        hdr.name_root = [0x22; 32];
        hdr.extra_nonce = [0x33; 24];
        hdr.reserved_root = [0x44; 32];
        hdr.witness_root = [0x55; 32];
        hdr.merkle_root = [0x66; 32];
        hdr.version = 7;
        hdr.bits = 0x207fffff;
        hdr.mask = [0x77; 32];
        hdr
    }

    #[test]
    fn encode_decode_round_trip() {
        let hdr = sample_header();
        assert_eq!(Header::decode(&hdr.encode()).unwrap(), hdr);
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(matches!(
            Header::decode(&[0u8; HEADER_SIZE - 1]),
            Err(MinerError::Encoding)
        ));
    }

    #[test]
    fn encoding_layout() {
        let data = sample_header().encode();
        assert_eq!(&data[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&data[12..44], &[0x11; 32]);
        assert_eq!(&data[76..100], &[0x33; 24]);
        assert_eq!(&data[196..200], &[7, 0, 0, 0]);
        assert_eq!(&data[200..204], &[0xff, 0xff, 0x7f, 0x20]);
        assert_eq!(&data[204..236], &[0x77; 32]);
    }

    #[test]
    fn padding_is_field_xor() {
        let hdr = sample_header();
        let pad = hdr.padding(32);
        for (i, &b) in pad.iter().enumerate() {
            assert_eq!(b, hdr.prev_block[i % 32] ^ hdr.name_root[i % 32]);
        }
        // Wraps past 32.
        let pad40 = hdr.padding(40);
        assert_eq!(pad40[32], pad40[0]);
    }

    #[test]
    fn pre_and_sub_encodings_are_128_bytes() {
        let hdr = sample_header();
        assert_eq!(hdr.sub_encode().len(), 128);
        assert_eq!(hdr.pre_encode().len(), 128);
    }

    #[test]
    fn pow_is_deterministic() {
        let hdr = sample_header();
        assert_eq!(hdr.pow_hash(), hdr.pow_hash());
    }

    #[test]
    fn pow_composes_the_layered_digest() {
        let hdr = sample_header();

        // Recompute the digest from the primitive operations.
        let pre = hdr.pre_encode();
        let pad8 = hdr.padding(8);
        let pad32 = hdr.padding(32);
        let left = blake2b_512(&pre);
        let mut right_input = pre.to_vec();
        right_input.extend_from_slice(&pad8);
        let right = sha3_256(&right_input);
        let mut mix_input = left.to_vec();
        mix_input.extend_from_slice(&pad32);
        mix_input.extend_from_slice(&right);
        let mix = blake2b_256(&mix_input);

        let pow = hdr.pow_hash();
        for i in 0..32 {
            assert_eq!(pow[i], mix[i] ^ hdr.mask[i]);
        }
    }

    #[test]
    fn share_nonce_slot_tracks_header_nonce() {
        let mut hdr = sample_header();
        let mut share = Share::new(&hdr);
        hdr.nonce = 999;
        assert_eq!(share.pow(999), hdr.pow_hash());
    }

    #[test]
    fn commit_hash_binds_the_mask() {
        let mut hdr = sample_header();
        let before = hdr.commit_hash();
        hdr.mask[0] ^= 1;
        assert_ne!(before, hdr.commit_hash());
    }

    #[test]
    fn verify_pow_against_own_bits() {
        let mut hdr = sample_header();

        // A one-byte target is out of reach for any real digest.
        hdr.bits = 0x03000001;
        assert!(matches!(hdr.verify_pow(), Err(MinerError::HighHash)));

        // Invalid compact encoding.
        hdr.bits = 0x21ffffff;
        assert!(matches!(hdr.verify_pow(), Err(MinerError::NegTarget)));

        // Walk nonces until the digest leaves headroom to encode a compact
        // target just above it, then expect success.
        loop {
            let pow = hdr.pow_hash();
            if pow[0] == 0 && pow[1] < 0x7f {
                let mantissa =
                    (pow[1] as u32) << 16 | (pow[2] as u32) << 8 | pow[3] as u32;
                hdr.bits = 31 << 24 | (mantissa + 1);
                break;
            }
            hdr.nonce += 1;
        }
        hdr.verify_pow().unwrap();
    }
}
