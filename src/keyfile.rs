//! Keyfile mixing: each keyfile's content is reduced into a 64-byte rolling
//! pool which is then XORed into the password buffer before key derivation.
//!
//! The transform is deterministic and depends only on the concatenated byte
//! stream of the keyfiles in the order given.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::memory::{Password, MAX_PASSWORD_LEN};

/// Size of the keyfile pool; equals the maximum password length.
pub const KEYFILE_POOL_SIZE: usize = 64;

/// At most this much of each keyfile is processed.
pub const MAX_KEYFILE_BYTES: u64 = 1024 * 1024;

/// Rolling pool accumulator.
struct KeyfilePool {
    pool: Zeroizing<[u8; KEYFILE_POOL_SIZE]>,
    cursor: usize,
    crc: crc32fast::Hasher,
}

impl KeyfilePool {
    fn new() -> Self {
        KeyfilePool {
            pool: Zeroizing::new([0u8; KEYFILE_POOL_SIZE]),
            cursor: 0,
            crc: crc32fast::Hasher::new(),
        }
    }

    /// Fold one byte of keyfile content into the pool: the running CRC32 is
    /// advanced, and the pool byte at the cursor absorbs the input byte plus
    /// the CRC octet selected by the cursor position.
    fn absorb(&mut self, byte: u8) {
        self.crc.update(&[byte]);
        let crc = self.crc.clone().finalize();
        let rotated = (crc >> (8 * (self.cursor % 4) as u32)) as u8;
        self.pool[self.cursor] = self.pool[self.cursor]
            .wrapping_add(byte)
            .wrapping_add(rotated);
        self.cursor = (self.cursor + 1) % KEYFILE_POOL_SIZE;
    }

    fn absorb_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|e| Error::system_path(e, path))?;
        let mut remaining = MAX_KEYFILE_BYTES;
        let mut reader = file.take(remaining);
        let mut chunk = Zeroizing::new([0u8; 4096]);
        loop {
            let n = reader
                .read(&mut chunk[..])
                .map_err(|e| Error::system_path(e, path))?;
            if n == 0 {
                break;
            }
            for &b in &chunk[..n] {
                self.absorb(b);
            }
            remaining -= n as u64;
            if remaining == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// Mix the given keyfiles into `password`. With no keyfiles the password is
/// untouched; otherwise the result is a 64-byte buffer (the password,
/// zero-extended, XORed with the final pool).
pub fn apply_keyfiles(password: &mut Password, keyfiles: &[PathBuf]) -> Result<()> {
    if keyfiles.is_empty() {
        return Ok(());
    }

    let mut pool = KeyfilePool::new();
    for path in keyfiles {
        pool.absorb_file(path)?;
        log::debug!("keyfile applied: {}", path.display());
    }

    let mut mixed = Zeroizing::new([0u8; MAX_PASSWORD_LEN]);
    let pw = password.as_bytes();
    mixed[..pw.len()].copy_from_slice(pw);
    for i in 0..KEYFILE_POOL_SIZE {
        mixed[i] ^= pool.pool[i];
    }
    password.replace(&mixed[..]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn keyfile_with(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f
    }

    #[test]
    fn no_keyfiles_is_identity() {
        let mut pw = Password::from_str("secret").unwrap();
        apply_keyfiles(&mut pw, &[]).unwrap();
        assert_eq!(pw.as_bytes(), b"secret");
    }

    #[test]
    fn mixing_is_deterministic() {
        let kf = keyfile_with(b"some keyfile content");
        let paths = vec![kf.path().to_path_buf()];

        let mut a = Password::from_str("secret").unwrap();
        let mut b = Password::from_str("secret").unwrap();
        apply_keyfiles(&mut a, &paths).unwrap();
        apply_keyfiles(&mut b, &paths).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.len(), KEYFILE_POOL_SIZE);
        assert_ne!(&a.as_bytes()[..6], b"secret");
    }

    #[test]
    fn different_keyfiles_differ() {
        let kf1 = keyfile_with(b"keyfile one");
        let kf2 = keyfile_with(b"keyfile two");

        let mut a = Password::from_str("secret").unwrap();
        let mut b = Password::from_str("secret").unwrap();
        apply_keyfiles(&mut a, &[kf1.path().to_path_buf()]).unwrap();
        apply_keyfiles(&mut b, &[kf2.path().to_path_buf()]).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn split_keyfiles_equal_concatenation() {
        // The pool depends on the concatenated byte stream, so one file with
        // "abcdef" equals "abc" followed by "def".
        let whole = keyfile_with(b"abcdef");
        let first = keyfile_with(b"abc");
        let second = keyfile_with(b"def");

        let mut a = Password::from_str("pw").unwrap();
        let mut b = Password::from_str("pw").unwrap();
        apply_keyfiles(&mut a, &[whole.path().to_path_buf()]).unwrap();
        apply_keyfiles(
            &mut b,
            &[first.path().to_path_buf(), second.path().to_path_buf()],
        )
        .unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn missing_keyfile_is_system_error() {
        let mut pw = Password::from_str("pw").unwrap();
        let err =
            apply_keyfiles(&mut pw, &[PathBuf::from("/nonexistent/keyfile")]).unwrap_err();
        assert!(matches!(err, Error::SystemError { .. }));
    }
}
