use std::fmt;
use std::io;
use std::path::Path;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Disjoint error kinds surfaced by the volume engine.
///
/// Password-related variants deliberately carry no detail about which input
/// was wrong or how far trial decryption got.
#[derive(Debug, Error)]
pub enum Error {
    #[error("incorrect password or corrupted volume")]
    PasswordIncorrect,

    #[error("incorrect password/keyfiles or corrupted volume")]
    PasswordKeyfilesIncorrect,

    #[error("volume is already mounted")]
    VolumeAlreadyMounted,

    #[error("volume is in use by another process")]
    VolumeInUse,

    #[error("mount point unavailable: {0}")]
    MountPointUnavailable(String),

    #[error("volume header is damaged")]
    VolumeFormatBad,

    #[error("volume is mounted read-only")]
    VolumeReadOnly,

    #[error("write rejected by hidden-volume protection")]
    VolumeProtected,

    #[error("invalid parameter: {0}")]
    ParameterIncorrect(&'static str),

    #[error("{subject}: {message} (os error {code})")]
    SystemError {
        code: i32,
        subject: String,
        message: String,
    },

    #[error("operation cancelled")]
    UserAbort,

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("self-test failed: {0}")]
    TestFailed(&'static str),

    #[error("cipher '{0}' is recognised but not supported")]
    VeraCryptCipherNotSupported(String),
}

impl Error {
    /// Wrap an OS-level failure together with the path or description that
    /// triggered it.
    pub fn system(err: io::Error, subject: impl fmt::Display) -> Self {
        Error::SystemError {
            code: err.raw_os_error().unwrap_or(0),
            subject: subject.to_string(),
            message: err.to_string(),
        }
    }

    pub fn system_path(err: io::Error, path: &Path) -> Self {
        Error::system(err, path.display())
    }

    /// True for the two password failure kinds the CLI maps to exit code 2.
    pub fn is_password_error(&self) -> bool {
        matches!(
            self,
            Error::PasswordIncorrect | Error::PasswordKeyfilesIncorrect
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::system(err, "i/o")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_errors_carry_no_candidate_detail() {
        let msg = Error::PasswordIncorrect.to_string();
        for leak in ["AES", "Serpent", "Twofish", "SHA", "RIPEMD", "salt", "iter"] {
            assert!(!msg.contains(leak), "error text leaks {leak}: {msg}");
        }
    }

    #[test]
    fn system_error_keeps_subject() {
        let err = Error::system(
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
            "/dev/sda1",
        );
        assert!(err.to_string().contains("/dev/sda1"));
    }
}
