//! Basalt: an on-disk encrypted-volume engine compatible with TrueCrypt
//! 7.1a and VeraCrypt container formats.
//!
//! The crate is organised leaves-first: cipher and hash primitives, the
//! KDF pipeline, the entropy pool, then the volume layer (headers, trial
//! decryption, XTS sector I/O, creation, header maintenance) and finally
//! the block-device service that exposes a mounted volume to the host
//! through NFS, iSCSI or a loop-file object.

pub mod admin;
pub mod create;
pub mod crypto;
pub mod error;
pub mod fat;
pub mod hash;
pub mod header;
pub mod host;
pub mod kdf;
pub mod keyfile;
pub mod layout;
pub mod memory;
pub mod registry;
pub mod rng;
pub mod service;
pub mod volume;

pub use crate::crypto::EncryptionAlgorithm;
pub use crate::error::{Error, Result};
pub use crate::hash::HashAlgorithm;
pub use crate::kdf::Kdf;
pub use crate::memory::Password;
pub use crate::volume::{OpenOptions, Protection, Volume, VolumeInfo};

use cipher::{BlockEncrypt, KeyInit};
use zeroize::Zeroizing;

/// Cross-cutting self-test: cipher known answers, an XTS round trip, the
/// PBKDF2 reference vectors, CRC32 and the RNG health check. Any failure
/// is fatal for the caller; nothing here touches user data.
pub fn self_test() -> Result<()> {
    // AES-256 known answer (FIPS-197 C.3).
    let aes_key: Vec<u8> = (0u8..32).collect();
    let aes = aes::Aes256::new_from_slice(&aes_key)
        .map_err(|_| Error::TestFailed("AES key schedule"))?;
    let mut block = [0u8; 16];
    for (i, b) in block.iter_mut().enumerate() {
        *b = (i as u8) * 0x11;
    }
    let mut ga = cipher::generic_array::GenericArray::clone_from_slice(&block);
    aes.encrypt_block(&mut ga);
    let expected = [
        0x8e, 0xa2, 0xb7, 0xca, 0x51, 0x67, 0x45, 0xbf, 0xea, 0xfc, 0x49, 0x90, 0x4b, 0x49,
        0x60, 0x89,
    ];
    if ga.as_slice() != expected {
        return Err(Error::TestFailed("AES-256 known answer"));
    }

    // Twofish-256 known answer (ECB table, all-zero key).
    let twofish = twofish::Twofish::new_from_slice(&[0u8; 32])
        .map_err(|_| Error::TestFailed("Twofish key schedule"))?;
    let mut ga = cipher::generic_array::GenericArray::clone_from_slice(&[0u8; 16]);
    twofish.encrypt_block(&mut ga);
    let expected = [
        0x57, 0xff, 0x73, 0x9d, 0x4d, 0xc9, 0x2c, 0x1b, 0xd7, 0xfc, 0x01, 0x70, 0x0c, 0xc8,
        0x21, 0x6f,
    ];
    if ga.as_slice() != expected {
        return Err(Error::TestFailed("Twofish-256 known answer"));
    }

    // XTS round trip over every supported algorithm and cascade.
    let key_material: Vec<u8> = (0..crypto::MAX_KEY_MATERIAL)
        .map(|i| (i % 251) as u8)
        .collect();
    let mut sector = Zeroizing::new([0u8; 512]);
    for (i, b) in sector.iter_mut().enumerate() {
        *b = (i % 256) as u8;
    }
    for &algorithm in EncryptionAlgorithm::all() {
        let cascade = crypto::CipherCascade::from_key_material(
            algorithm,
            &key_material[..algorithm.key_material_size()],
        )?;
        let mut data = Zeroizing::new(*sector);
        cascade.encrypt_area(&mut data[..], 512, 7);
        if data[..] == sector[..] {
            return Err(Error::TestFailed("XTS produced identity"));
        }
        cascade.decrypt_area(&mut data[..], 512, 7);
        if data[..] != sector[..] {
            return Err(Error::TestFailed("XTS round trip"));
        }
    }

    // PBKDF2 reference vector (RFC 6070), including the multi-block case
    // that catches a mis-sized block counter.
    let mut derived = [0u8; 25];
    kdf::pbkdf2_derive(
        HashAlgorithm::Sha1,
        b"passwordPASSWORDpassword",
        b"saltSALTsaltSALTsaltSALTsaltSALTsalt",
        4096,
        &mut derived,
    )?;
    let expected = [
        0x3d, 0x2e, 0xec, 0x4f, 0xe4, 0x1c, 0x84, 0x9b, 0x80, 0xc8, 0xd8, 0x36, 0x62, 0xc0,
        0xe4, 0x4a, 0x8b, 0x29, 0x1a, 0x96, 0x4c, 0xf2, 0xf0, 0x70, 0x38,
    ];
    if derived != expected {
        return Err(Error::TestFailed("PBKDF2 known answer"));
    }

    // CRC32, the header validator.
    if crc32fast::hash(b"123456789") != 0xCBF4_3926 {
        return Err(Error::TestFailed("CRC32 known answer"));
    }

    // Constant-time compare sanity.
    if !memory::ct_eq(&[1, 2, 3], &[1, 2, 3]) || memory::ct_eq(&[1, 2, 3], &[1, 2, 4]) {
        return Err(Error::TestFailed("constant-time compare"));
    }

    // RNG pool health.
    rng::start()?;
    rng::self_test()?;

    log::info!(
        "self-test passed (hardware AES: {})",
        if crypto::hardware_aes_available() {
            "yes"
        } else {
            "no"
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_test_passes() {
        self_test().unwrap();
    }
}
