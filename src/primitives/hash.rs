// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::codec::{Decodable, DecodeError, Encodable, Reader};
use bincode::{Decode, Encode};
use blake3::Hasher as Blake3;
use sha2::{Digest, Sha256};
use std::fmt;

/// 256-bit hash. Used for txids, merkle nodes, and block identities.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    #[must_use]
    pub fn zero() -> Self {
        Self([0; 32])
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_hex(hexstr: &str) -> Result<Self, &'static str> {
        let bytes = hex::decode(hexstr).map_err(|_| "invalid hexstr")?;
        if bytes.len() != 32 {
            return Err("invalid slice length! expected 32");
        }
        let mut out = [0; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash256").field(&hex::encode(self.0)).finish()
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Encodable for Hash256 {
    fn consensus_encode(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(&self.0);
    }

    fn encoded_size(&self) -> usize {
        32
    }
}

impl Decodable for Hash256 {
    fn consensus_decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let mut b = [0u8; 32];
        r.read_exact(&mut b)?;
        Ok(Self(b))
    }
}

/// Double SHA-256. Txids, merkle nodes, and header mid hashes.
#[must_use]
pub fn sha256d(bytes: &[u8]) -> Hash256 {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    let mut out = [0; 32];
    out.copy_from_slice(&second);
    Hash256(out)
}

/// BLAKE3. The network-visible block identity is BLAKE3 of the 80-byte
/// header serialization.
#[must_use]
pub fn blake3_256(bytes: &[u8]) -> Hash256 {
    let mut hasher = Blake3::new();
    hasher.update(bytes);
    let mut out = [0; 32];
    out.copy_from_slice(hasher.finalize().as_bytes());
    Hash256(out)
}

/// MurmurHash3 (x86, 32-bit). Consensus-critical: the interest rate table
/// self-check hashes the table's textual form with this function.
#[must_use]
pub fn murmur3_32(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);

        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    let mut k1: u32 = 0;
    if tail.len() >= 3 {
        k1 ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        k1 ^= u32::from(tail[0]);
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_test() {
        let result = sha256d(b"");
        let result = hex::encode(result.0);

        assert_eq!(
            &result,
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn blake3_256_test() {
        let result = blake3_256(b"");
        let result = hex::encode(result.0);

        assert_eq!(
            &result,
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn murmur3_32_test_vectors() {
        // Reference vectors for the x86 32-bit variant.
        assert_eq!(murmur3_32(0x0000_0000, &[]), 0x0000_0000);
        assert_eq!(murmur3_32(0xFBA4_C795, &[]), 0x6a39_6f08);
        assert_eq!(murmur3_32(0xFFFF_FFFF, &[]), 0x81f1_6f39);
        assert_eq!(murmur3_32(0x0000_0000, &[0x00]), 0x514e_28b7);
        assert_eq!(murmur3_32(0xFBA4_C795, &[0x00]), 0xea3f_0b17);
        assert_eq!(murmur3_32(0x0000_0000, &[0xff]), 0xfd6c_f10d);
        assert_eq!(murmur3_32(0x0000_0000, &[0x00, 0x11]), 0x16c6_b7ab);
        assert_eq!(murmur3_32(0x0000_0000, &[0x00, 0x11, 0x22]), 0x8eb5_1c3d);
        assert_eq!(
            murmur3_32(0x0000_0000, &[0x00, 0x11, 0x22, 0x33]),
            0xb447_1bf8
        );
        assert_eq!(
            murmur3_32(0x0000_0000, &[0x00, 0x11, 0x22, 0x33, 0x44]),
            0xe230_1fa8
        );
    }

    #[test]
    fn hash256_hex_roundtrip() {
        let h = sha256d(b"membercoin");
        let parsed = Hash256::from_hex(&h.to_string()).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn hash256_consensus_codec_roundtrip() {
        let h = blake3_256(b"header");
        let bytes = crate::codec::serialize(&h);
        assert_eq!(bytes.len(), 32);
        assert_eq!(crate::codec::deserialize::<Hash256>(&bytes).unwrap(), h);
    }
}
