//! Secure buffers and constant-time helpers.
//!
//! Every buffer holding key material, passwords or intermediate whitening
//! values lives in a [`SecureBytes`] (or a `Zeroizing` stack array) so the
//! bytes are wiped with a compiler-barrier-resistant zeroise on drop. Where
//! the host OS permits, the pages are additionally pinned against swap.

use std::fmt;
use std::ops::{Deref, DerefMut};

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Heap buffer that is pinned against swap (best effort) and zeroised on drop.
pub struct SecureBytes {
    data: Vec<u8>,
    locked: bool,
}

impl SecureBytes {
    pub fn new(len: usize) -> Self {
        let mut buf = SecureBytes {
            data: vec![0u8; len],
            locked: false,
        };
        buf.locked = lock_pages(&buf.data);
        buf
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::new(bytes.len());
        buf.data.copy_from_slice(bytes);
        buf
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Deref for SecureBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for SecureBytes {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Clone for SecureBytes {
    fn clone(&self) -> Self {
        Self::from_slice(&self.data)
    }
}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        self.data.zeroize();
        if self.locked {
            unlock_pages(&self.data);
        }
    }
}

impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes({} bytes)", self.data.len())
    }
}

#[cfg(unix)]
fn lock_pages(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    // mlock may fail under RLIMIT_MEMLOCK; the buffer still zeroises on drop.
    unsafe { libc::mlock(data.as_ptr() as *const libc::c_void, data.len()) == 0 }
}

#[cfg(unix)]
fn unlock_pages(data: &[u8]) {
    if !data.is_empty() {
        unsafe {
            libc::munlock(data.as_ptr() as *const libc::c_void, data.len());
        }
    }
}

#[cfg(not(unix))]
fn lock_pages(_data: &[u8]) -> bool {
    false
}

#[cfg(not(unix))]
fn unlock_pages(_data: &[u8]) {}

/// Maximum password length in bytes, after UTF-8 encoding and keyfile mixing.
pub const MAX_PASSWORD_LEN: usize = 64;

/// A caller-supplied password. Pinned and wiped like any other key material.
pub struct Password(SecureBytes);

impl Password {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_PASSWORD_LEN {
            return Err(Error::ParameterIncorrect("password longer than 64 bytes"));
        }
        Ok(Password(SecureBytes::from_slice(bytes)))
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Self::new(s.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replace the password content. Used by keyfile mixing, which may grow
    /// the buffer up to [`MAX_PASSWORD_LEN`] but never beyond.
    pub(crate) fn replace(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= MAX_PASSWORD_LEN);
        self.0 = SecureBytes::from_slice(bytes);
    }
}

impl Clone for Password {
    fn clone(&self) -> Self {
        Password(self.0.clone())
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Password(***)")
    }
}

/// Constant-time equality over byte slices of equal length.
///
/// OR-accumulating compare with no secret-dependent branch or table lookup.
/// Slices of different length compare unequal without touching the data.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
