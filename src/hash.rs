//! Hash capability set: SHA-512, SHA-1, RIPEMD-160, Whirlpool and Blake2b,
//! each exposed through one tagged enum so callers can pick an algorithm at
//! runtime without trait objects on the derivation hot path.

use blake2::Blake2b512;
use digest::Digest;
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::Sha512;
use whirlpool::Whirlpool;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha512,
    Sha1,
    Ripemd160,
    Whirlpool,
    Blake2b,
}

impl HashAlgorithm {
    /// All hashes, default (SHA-512) first. The order decides which hash the
    /// RNG pool picks up when it starts.
    pub fn all() -> &'static [HashAlgorithm] {
        &[
            HashAlgorithm::Sha512,
            HashAlgorithm::Whirlpool,
            HashAlgorithm::Blake2b,
            HashAlgorithm::Ripemd160,
            HashAlgorithm::Sha1,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha512 => "SHA-512",
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Ripemd160 => "RIPEMD-160",
            HashAlgorithm::Whirlpool => "Whirlpool",
            HashAlgorithm::Blake2b => "Blake2b",
        }
    }

    pub fn from_name(name: &str) -> Result<HashAlgorithm> {
        match name.to_ascii_lowercase().replace('_', "-").as_str() {
            "sha-512" | "sha512" => Ok(HashAlgorithm::Sha512),
            "sha-1" | "sha1" => Ok(HashAlgorithm::Sha1),
            "ripemd-160" | "ripemd160" => Ok(HashAlgorithm::Ripemd160),
            "whirlpool" => Ok(HashAlgorithm::Whirlpool),
            "blake2b" => Ok(HashAlgorithm::Blake2b),
            _ => Err(Error::ParameterIncorrect("unknown hash algorithm")),
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha512 => 64,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Ripemd160 => 20,
            HashAlgorithm::Whirlpool => 64,
            HashAlgorithm::Blake2b => 64,
        }
    }

    pub fn block_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha512 => 128,
            HashAlgorithm::Sha1 => 64,
            HashAlgorithm::Ripemd160 => 64,
            HashAlgorithm::Whirlpool => 64,
            HashAlgorithm::Blake2b => 128,
        }
    }

    /// SHA-1 and RIPEMD-160 are accepted when opening old volumes but are
    /// never offered for new-volume creation.
    pub fn legacy_only(&self) -> bool {
        matches!(self, HashAlgorithm::Sha1 | HashAlgorithm::Ripemd160)
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Ripemd160 => Hasher::Ripemd160(Ripemd160::new()),
            HashAlgorithm::Whirlpool => Hasher::Whirlpool(Whirlpool::new()),
            HashAlgorithm::Blake2b => Hasher::Blake2b(Box::new(Blake2b512::new())),
        }
    }

    /// One-shot digest.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut h = self.hasher();
        h.update(data);
        h.finalize()
    }
}

/// Streaming hash state. `init`/`update`/`finalize` in enum clothing; the
/// state is re-created for every finalize so a hasher is never reused with
/// stale chaining values.
pub enum Hasher {
    Sha512(Sha512),
    Sha1(Sha1),
    Ripemd160(Ripemd160),
    Whirlpool(Whirlpool),
    Blake2b(Box<Blake2b512>),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha512(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Ripemd160(h) => h.update(data),
            Hasher::Whirlpool(h) => h.update(data),
            Hasher::Blake2b(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha512(h) => h.finalize().to_vec(),
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Ripemd160(h) => h.finalize().to_vec(),
            Hasher::Whirlpool(h) => h.finalize().to_vec(),
            Hasher::Blake2b(h) => h.finalize().to_vec(),
        }
    }
}
