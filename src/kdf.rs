//! Header-key derivation: the PBKDF2 family (RFC 2898, 4-byte big-endian
//! block counter) and Argon2id (RFC 9106, version 0x13).
//!
//! Legacy iteration counts exist so TrueCrypt 7.1a volumes stay mountable;
//! they are tried first when opening (a wrong KDF is the cheapest rejection)
//! and never offered when creating a volume.

use hmac::Hmac;
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::Sha512;
use whirlpool::Whirlpool;

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kdf {
    Pbkdf2Sha512Legacy,
    Pbkdf2Ripemd160Legacy,
    Pbkdf2WhirlpoolLegacy,
    Pbkdf2Sha1Legacy,
    Argon2idMax,
    Argon2id,
    Pbkdf2Sha512,
    Pbkdf2Whirlpool,
    Pbkdf2Ripemd160,
    Pbkdf2Sha1,
    /// 1,000-iteration RIPEMD-160 variant. Defined for completeness; not
    /// reachable through the open candidate list. No volume in the 7.1a/6.x
    /// test corpus has required it so far.
    Pbkdf2Ripemd160LegacyLow,
}

/// Trial order when opening a volume: legacy counts first, then Argon2id,
/// then the modern PBKDF2 counts.
pub const OPEN_ORDER: [Kdf; 10] = [
    Kdf::Pbkdf2Sha512Legacy,
    Kdf::Pbkdf2Ripemd160Legacy,
    Kdf::Pbkdf2WhirlpoolLegacy,
    Kdf::Pbkdf2Sha1Legacy,
    Kdf::Argon2idMax,
    Kdf::Argon2id,
    Kdf::Pbkdf2Sha512,
    Kdf::Pbkdf2Whirlpool,
    Kdf::Pbkdf2Ripemd160,
    Kdf::Pbkdf2Sha1,
];

/// Legacy-only subset, for V1 layouts that predate the modern counts.
pub const LEGACY_ORDER: [Kdf; 4] = [
    Kdf::Pbkdf2Sha512Legacy,
    Kdf::Pbkdf2Ripemd160Legacy,
    Kdf::Pbkdf2WhirlpoolLegacy,
    Kdf::Pbkdf2Sha1Legacy,
];

impl Kdf {
    pub fn name(&self) -> &'static str {
        match self {
            Kdf::Pbkdf2Sha512 | Kdf::Pbkdf2Sha512Legacy => "PBKDF2-HMAC-SHA512",
            Kdf::Pbkdf2Ripemd160
            | Kdf::Pbkdf2Ripemd160Legacy
            | Kdf::Pbkdf2Ripemd160LegacyLow => "PBKDF2-HMAC-RIPEMD160",
            Kdf::Pbkdf2Whirlpool | Kdf::Pbkdf2WhirlpoolLegacy => "PBKDF2-HMAC-Whirlpool",
            Kdf::Pbkdf2Sha1 | Kdf::Pbkdf2Sha1Legacy => "PBKDF2-HMAC-SHA1",
            Kdf::Argon2id => "Argon2id",
            Kdf::Argon2idMax => "Argon2id-Max",
        }
    }

    /// PBKDF2 iteration count, or the Argon2 time cost.
    pub fn iterations(&self) -> u32 {
        match self {
            Kdf::Pbkdf2Sha512Legacy | Kdf::Pbkdf2WhirlpoolLegacy => 1_000,
            Kdf::Pbkdf2Ripemd160Legacy | Kdf::Pbkdf2Sha1Legacy => 2_000,
            Kdf::Pbkdf2Ripemd160LegacyLow => 1_000,
            Kdf::Pbkdf2Sha512 | Kdf::Pbkdf2Whirlpool | Kdf::Pbkdf2Sha1 => 500_000,
            Kdf::Pbkdf2Ripemd160 => 655_331,
            Kdf::Argon2id | Kdf::Argon2idMax => 4,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(
            self,
            Kdf::Pbkdf2Sha512Legacy
                | Kdf::Pbkdf2Ripemd160Legacy
                | Kdf::Pbkdf2WhirlpoolLegacy
                | Kdf::Pbkdf2Sha1Legacy
                | Kdf::Pbkdf2Ripemd160LegacyLow
        )
    }

    pub fn is_argon2(&self) -> bool {
        matches!(self, Kdf::Argon2id | Kdf::Argon2idMax)
    }

    pub fn hash(&self) -> Option<HashAlgorithm> {
        match self {
            Kdf::Pbkdf2Sha512 | Kdf::Pbkdf2Sha512Legacy => Some(HashAlgorithm::Sha512),
            Kdf::Pbkdf2Ripemd160
            | Kdf::Pbkdf2Ripemd160Legacy
            | Kdf::Pbkdf2Ripemd160LegacyLow => Some(HashAlgorithm::Ripemd160),
            Kdf::Pbkdf2Whirlpool | Kdf::Pbkdf2WhirlpoolLegacy => Some(HashAlgorithm::Whirlpool),
            Kdf::Pbkdf2Sha1 | Kdf::Pbkdf2Sha1Legacy => Some(HashAlgorithm::Sha1),
            Kdf::Argon2id | Kdf::Argon2idMax => None,
        }
    }

    /// KDFs offered for new-volume creation. `legacy` opts into the 7.1a
    /// iteration counts and is the only way to reach them.
    pub fn creation_kdfs(legacy: bool) -> &'static [Kdf] {
        if legacy {
            &[Kdf::Pbkdf2Sha512Legacy, Kdf::Pbkdf2WhirlpoolLegacy]
        } else {
            &[
                Kdf::Argon2id,
                Kdf::Argon2idMax,
                Kdf::Pbkdf2Sha512,
                Kdf::Pbkdf2Whirlpool,
            ]
        }
    }

    /// Resolve a user-facing KDF name for volume creation.
    pub fn from_name(name: &str, legacy: bool) -> Result<Kdf> {
        let canon = name.to_ascii_lowercase().replace('_', "-");
        match canon.as_str() {
            "argon2id" => Ok(Kdf::Argon2id),
            "argon2id-max" => Ok(Kdf::Argon2idMax),
            "sha512" | "sha-512" | "pbkdf2-hmac-sha512" => Ok(if legacy {
                Kdf::Pbkdf2Sha512Legacy
            } else {
                Kdf::Pbkdf2Sha512
            }),
            "whirlpool" | "pbkdf2-hmac-whirlpool" => Ok(if legacy {
                Kdf::Pbkdf2WhirlpoolLegacy
            } else {
                Kdf::Pbkdf2Whirlpool
            }),
            "ripemd160" | "ripemd-160" | "pbkdf2-hmac-ripemd160" if !legacy => {
                Ok(Kdf::Pbkdf2Ripemd160)
            }
            "sha1" | "sha-1" | "pbkdf2-hmac-sha1" if !legacy => Ok(Kdf::Pbkdf2Sha1),
            _ => Err(Error::ParameterIncorrect("unknown KDF")),
        }
    }

    /// Whether a header using this KDF should be offered the one-click
    /// re-encryption with a modern KDF.
    pub fn needs_upgrade(&self) -> bool {
        !self.is_argon2() && self.iterations() < 10_000
    }

    /// The modern variant an upgrade re-encrypts with: same hash family,
    /// current iteration count.
    pub fn modern_equivalent(&self) -> Kdf {
        match self {
            Kdf::Pbkdf2Sha512Legacy => Kdf::Pbkdf2Sha512,
            Kdf::Pbkdf2Ripemd160Legacy | Kdf::Pbkdf2Ripemd160LegacyLow => Kdf::Pbkdf2Ripemd160,
            Kdf::Pbkdf2WhirlpoolLegacy => Kdf::Pbkdf2Whirlpool,
            Kdf::Pbkdf2Sha1Legacy => Kdf::Pbkdf2Sha1,
            other => *other,
        }
    }

    /// Derive `out.len()` bytes of header key from the (keyfile-mixed)
    /// password and the header salt.
    pub fn derive(&self, password: &[u8], salt: &[u8], out: &mut [u8]) -> Result<()> {
        match self {
            Kdf::Argon2id => argon2id_derive(password, salt, 512 * 1024, 4, 4, out),
            Kdf::Argon2idMax => argon2id_derive(password, salt, 1024 * 1024, 4, 8, out),
            _ => {
                let hash = self.hash().expect("pbkdf2 variant has a hash");
                pbkdf2_derive(hash, password, salt, self.iterations(), out)
            }
        }
    }
}

/// RFC 2898 PBKDF2 over the given HMAC hash. The `pbkdf2` crate implements
/// the standard 4-byte big-endian block counter; a single-byte counter
/// diverges from block 2 onward and is a conformance defect.
pub fn pbkdf2_derive(
    hash: HashAlgorithm,
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    out: &mut [u8],
) -> Result<()> {
    let derived = match hash {
        HashAlgorithm::Sha512 => pbkdf2::pbkdf2::<Hmac<Sha512>>(password, salt, iterations, out),
        HashAlgorithm::Sha1 => pbkdf2::pbkdf2::<Hmac<Sha1>>(password, salt, iterations, out),
        HashAlgorithm::Ripemd160 => {
            pbkdf2::pbkdf2::<Hmac<Ripemd160>>(password, salt, iterations, out)
        }
        HashAlgorithm::Whirlpool => {
            pbkdf2::pbkdf2::<Hmac<Whirlpool>>(password, salt, iterations, out)
        }
        HashAlgorithm::Blake2b => return Err(Error::ParameterIncorrect("Blake2b is not a KDF hash")),
    };
    derived.map_err(|_| Error::ParameterIncorrect("PBKDF2 output length"))
}

/// Argon2id type 2, version 0x13. `m_cost` is in KiB. Allocation failure of
/// the memory blocks surfaces as `SystemError` so the trial loop can move
/// on to the next candidate.
fn argon2id_derive(
    password: &[u8],
    salt: &[u8],
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
    out: &mut [u8],
) -> Result<()> {
    let params = argon2::Params::new(m_cost, t_cost, p_cost, None)
        .map_err(|_| Error::ParameterIncorrect("Argon2 parameters"))?;
    let ctx = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    ctx.hash_password_into(password, salt, out)
        .map_err(|e| match e {
            argon2::Error::MemoryTooLittle | argon2::Error::MemoryTooMuch => {
                Error::SystemError {
                    code: 0,
                    subject: "Argon2id".to_string(),
                    message: "memory allocation for derivation failed".to_string(),
                }
            }
            _ => Error::ParameterIncorrect("Argon2 derivation input"),
        })
}
