//! Kernel-file transport: the volume as a plain `Read + Write + Seek`
//! object. The host collaborator wires it to a loop-mounted regular file
//! (or any other byte-oriented channel); a control file carries the
//! serialised `VolumeInfo` for cooperating processes.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::error::Error;
use crate::registry;
use crate::service::{BlockDevice, SharedDevice, VolumeDevice};

/// Byte-oriented view over a [`VolumeDevice`]. Unaligned accesses are fixed
/// up by the device's aligned-extent path.
pub struct VolumeIo<'a> {
    device: &'a mut VolumeDevice,
    position: u64,
}

impl<'a> VolumeIo<'a> {
    pub fn new(device: &'a mut VolumeDevice) -> VolumeIo<'a> {
        VolumeIo {
            device,
            position: 0,
        }
    }
}

fn to_io_error(err: Error) -> io::Error {
    let kind = match err {
        Error::VolumeReadOnly | Error::VolumeProtected => io::ErrorKind::PermissionDenied,
        Error::ParameterIncorrect(_) => io::ErrorKind::InvalidInput,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err.to_string())
}

impl Read for VolumeIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.device.size();
        if self.position >= size {
            return Ok(0);
        }
        let n = buf.len().min((size - self.position) as usize);
        self.device
            .read_at(self.position, &mut buf[..n])
            .map_err(to_io_error)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for VolumeIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let size = self.device.size();
        if self.position >= size {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past end of volume",
            ));
        }
        let n = buf.len().min((size - self.position) as usize);
        self.device
            .write_at(self.position, &buf[..n])
            .map_err(to_io_error)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.device.flush().map_err(to_io_error)
    }
}

impl Seek for VolumeIo<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.device.size();
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => {
                if d >= 0 {
                    size.checked_add(d as u64)
                } else {
                    size.checked_sub(d.unsigned_abs())
                }
            }
            SeekFrom::Current(d) => {
                if d >= 0 {
                    self.position.checked_add(d as u64)
                } else {
                    self.position.checked_sub(d.unsigned_abs())
                }
            }
        };
        match target {
            Some(p) => {
                self.position = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek out of range",
            )),
        }
    }
}

/// Publish the serialised `VolumeInfo` for cooperating processes and return
/// the control-file path the host attach callback receives.
pub fn write_control_file(device: &SharedDevice, slot: u32) -> crate::error::Result<PathBuf> {
    let info = {
        let dev = device.lock().unwrap_or_else(|e| e.into_inner());
        dev.info(slot, None)
    };
    registry::write_control_file(&info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::{create_volume, CreateOptions, FilesystemType};
    use crate::crypto::EncryptionAlgorithm;
    use crate::kdf::Kdf;
    use crate::memory::Password;
    use crate::rng;
    use crate::volume::{OpenOptions, Volume};

    fn test_device() -> VolumeDevice {
        rng::start().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.bslt");
        std::mem::forget(dir);
        create_volume(
            CreateOptions {
                path: path.clone(),
                size: 1024 * 1024,
                algorithm: EncryptionAlgorithm::Aes,
                kdf: Kdf::Pbkdf2Sha512Legacy,
                password: Password::from_str("pw").unwrap(),
                keyfiles: Vec::new(),
                filesystem: FilesystemType::None,
                quick: true,
                sector_size: 512,
                hidden_size: None,
                hidden_password: None,
            },
            None,
            &mut |_, _| {},
        )
        .unwrap();
        let volume =
            Volume::open(OpenOptions::new(&path, Password::from_str("pw").unwrap())).unwrap();
        VolumeDevice::new(volume)
    }

    #[test]
    fn read_write_seek_round_trip() {
        let mut device = test_device();
        let mut io = VolumeIo::new(&mut device);

        io.seek(SeekFrom::Start(1000)).unwrap();
        io.write_all(b"hello volume").unwrap();
        io.flush().unwrap();

        io.seek(SeekFrom::Start(1000)).unwrap();
        let mut back = [0u8; 12];
        io.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"hello volume");
    }

    #[test]
    fn read_stops_at_end() {
        let mut device = test_device();
        let size = device.size();
        let mut io = VolumeIo::new(&mut device);
        io.seek(SeekFrom::End(-4)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(io.read(&mut buf).unwrap(), 4);
        assert_eq!(io.read(&mut buf).unwrap(), 0);
        assert_eq!(io.seek(SeekFrom::Current(0)).unwrap(), size);
    }
}
