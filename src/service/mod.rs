//! Block-device service: exposes a mounted [`Volume`] to the host as a
//! virtual disk through one of three interchangeable transports.
//!
//! All transports share one contract: sector requests are answered from the
//! volume, unaligned requests are served by reading or read-modify-writing
//! the aligned extent, metadata calls report volume and sector size, and
//! `dismount` guarantees no in-flight request issues after it returns. Each
//! mounted volume is served by exactly one event-loop thread; transports
//! that accept several connections serialise them behind the device mutex.

pub mod iscsi;
pub mod loopfile;
pub mod nfs;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::host::HostCallbacks;
use crate::registry;
use crate::volume::{Volume, VolumeInfo};

/// Mount points that must never be shadowed by a volume. Checked before any
/// disk I/O happens.
pub const PROTECTED_MOUNT_POINTS: &[&str] =
    &["/", "/usr", "/bin", "/etc", "/System", "/Library"];

/// The sector-request contract every transport dispatches into.
pub trait BlockDevice: Send {
    fn size(&self) -> u64;
    fn sector_size(&self) -> u32;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn info(&self, slot: u32, mount_point: Option<PathBuf>) -> VolumeInfo;
}

/// The one implementation of [`BlockDevice`]: a volume plus the shared
/// aligned-extent fix-up for requests that are not sector-aligned.
pub struct VolumeDevice {
    volume: Volume,
}

impl VolumeDevice {
    pub fn new(volume: Volume) -> VolumeDevice {
        VolumeDevice { volume }
    }

    pub fn into_volume(self) -> Volume {
        self.volume
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }
}

impl BlockDevice for VolumeDevice {
    fn size(&self) -> u64 {
        self.volume.size()
    }

    fn sector_size(&self) -> u32 {
        self.volume.sector_size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let sector = self.volume.sector_size() as u64;
        let len = buf.len() as u64;
        if len == 0 {
            return Ok(());
        }
        let end = offset
            .checked_add(len)
            .ok_or(Error::ParameterIncorrect("request overflow"))?;
        if end > self.volume.size() {
            return Err(Error::ParameterIncorrect("read beyond device"));
        }

        if offset % sector == 0 && len % sector == 0 {
            return self.volume.read_sectors(offset, buf);
        }

        // Unaligned: read the covering aligned extent and copy the slice
        // the caller asked for.
        let aligned_start = offset - offset % sector;
        let aligned_end = end.div_ceil(sector) * sector;
        let mut extent = Zeroizing::new(vec![0u8; (aligned_end - aligned_start) as usize]);
        self.volume.read_sectors(aligned_start, &mut extent)?;
        let skip = (offset - aligned_start) as usize;
        buf.copy_from_slice(&extent[skip..skip + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let sector = self.volume.sector_size() as u64;
        let len = data.len() as u64;
        if len == 0 {
            return Ok(());
        }
        let end = offset
            .checked_add(len)
            .ok_or(Error::ParameterIncorrect("request overflow"))?;
        if end > self.volume.size() {
            return Err(Error::ParameterIncorrect("write beyond device"));
        }

        if offset % sector == 0 && len % sector == 0 {
            return self.volume.write_sectors(offset, data);
        }

        // Unaligned: read-modify-write the covering aligned extent.
        let aligned_start = offset - offset % sector;
        let aligned_end = end.div_ceil(sector) * sector;
        let mut extent = Zeroizing::new(vec![0u8; (aligned_end - aligned_start) as usize]);
        self.volume.read_sectors(aligned_start, &mut extent)?;
        let skip = (offset - aligned_start) as usize;
        extent[skip..skip + data.len()].copy_from_slice(data);
        self.volume.write_sectors(aligned_start, &extent)
    }

    fn flush(&mut self) -> Result<()> {
        self.volume.flush()
    }

    fn info(&self, slot: u32, mount_point: Option<PathBuf>) -> VolumeInfo {
        self.volume.info(slot, mount_point)
    }
}

/// Transport back-end selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Userspace NFSv4.0 loopback server.
    Nfs,
    /// iSCSI loopback target.
    Iscsi,
    /// Kernel-file transport: a `Read + Write + Seek` object handed to the
    /// host attach callback.
    LoopFile,
}

/// Where the host collaborator should connect to reach a served volume.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Nfs { addr: SocketAddr },
    Iscsi { addr: SocketAddr, iqn: String },
    LoopFile { control_file: PathBuf },
}

pub(crate) type SharedDevice = Arc<Mutex<VolumeDevice>>;

struct ServerHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl ServerHandle {
    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            // Joining the event loop is the no-in-flight-requests barrier.
            let _ = thread.join();
        }
    }
}

/// A served, registered volume.
pub struct MountedVolume {
    slot: u32,
    info: VolumeInfo,
    endpoint: Endpoint,
    device: SharedDevice,
    server: Option<ServerHandle>,
    attached_at: Option<PathBuf>,
}

impl MountedVolume {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn info(&self) -> VolumeInfo {
        // Refresh the byte counters from the live device.
        let device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        device.info(self.slot, self.info.mount_point.clone())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stop the sector server, detach the virtual device, drop the volume
    /// (wiping its keys) and release the registry slot. Safe to call from
    /// any context; no sector request issues after this returns.
    pub fn dismount(mut self, host: &dyn HostCallbacks) -> Result<()> {
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
        if let Some(device_path) = self.attached_at.take() {
            if let Err(err) = host.detach_block_device(&device_path) {
                log::warn!("detach of {} failed: {}", device_path.display(), err);
            }
        }
        registry::remove(self.slot)?;
        log::info!("dismounted slot {}", self.slot);
        Ok(())
    }
}

impl Drop for MountedVolume {
    fn drop(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
    }
}

/// Validate a requested mount point against the protected list.
pub fn check_mount_point(mount_point: &Path) -> Result<()> {
    let canonical = mount_point.to_string_lossy();
    let trimmed = canonical.trim_end_matches('/');
    let probe = if trimmed.is_empty() { "/" } else { trimmed };
    if PROTECTED_MOUNT_POINTS.iter().any(|p| *p == probe) {
        return Err(Error::MountPointUnavailable(format!(
            "{} is a protected system path",
            mount_point.display()
        )));
    }
    Ok(())
}

/// Serve an authenticated volume and ask the host to attach it.
pub fn mount(
    volume: Volume,
    transport: Transport,
    mount_point: Option<PathBuf>,
    host: &dyn HostCallbacks,
) -> Result<MountedVolume> {
    if let Some(ref mp) = mount_point {
        check_mount_point(mp)?;
    }
    if registry::find_by_path(volume.path())?.is_some() {
        return Err(Error::VolumeAlreadyMounted);
    }

    let slot = registry::next_free_slot()?;
    let device: SharedDevice = Arc::new(Mutex::new(VolumeDevice::new(volume)));
    let shutdown = Arc::new(AtomicBool::new(false));

    let (thread, endpoint) = match transport {
        Transport::Nfs => {
            let (thread, addr) = nfs::serve(device.clone(), shutdown.clone())?;
            (Some(thread), Endpoint::Nfs { addr })
        }
        Transport::Iscsi => {
            let (thread, addr, iqn) = iscsi::serve(device.clone(), slot, shutdown.clone())?;
            (Some(thread), Endpoint::Iscsi { addr, iqn })
        }
        Transport::LoopFile => {
            let control_file = loopfile::write_control_file(&device, slot)?;
            (None, Endpoint::LoopFile { control_file })
        }
    };

    let attached_at = match host.attach_block_device(&endpoint, mount_point.as_deref()) {
        Ok(path) => path,
        Err(err) => {
            // Roll the server back; the volume drops (and wipes) with it.
            if let Some(t) = thread {
                shutdown.store(true, Ordering::SeqCst);
                let _ = t.join();
            }
            return Err(err);
        }
    };

    let info = {
        let dev = device.lock().unwrap_or_else(|e| e.into_inner());
        dev.info(slot, mount_point.clone())
    };
    if let Err(err) = registry::write(&info) {
        if let Some(t) = thread {
            shutdown.store(true, Ordering::SeqCst);
            let _ = t.join();
        }
        return Err(err);
    }
    log::info!(
        "volume served on slot {} via {:?}{}",
        slot,
        transport,
        attached_at
            .as_ref()
            .map(|p| format!(", attached at {}", p.display()))
            .unwrap_or_default()
    );

    Ok(MountedVolume {
        slot,
        info,
        endpoint,
        device,
        server: thread.map(|t| ServerHandle {
            thread: Some(t),
            shutdown,
        }),
        attached_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::{create_volume, CreateOptions, FilesystemType};
    use crate::crypto::EncryptionAlgorithm;
    use crate::kdf::Kdf;
    use crate::memory::Password;
    use crate::rng;
    use crate::volume::OpenOptions;

    fn test_device() -> VolumeDevice {
        rng::start().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.bslt");
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
    fn protected_mount_points_rejected() {
        for mp in ["/", "/usr", "/bin", "/etc", "/System", "/Library", "/usr/"] {
            assert!(
                matches!(
                    check_mount_point(Path::new(mp)),
                    Err(Error::MountPointUnavailable(_))
                ),
                "{mp} was not rejected"
            );
        }
        check_mount_point(Path::new("/mnt/vault")).unwrap();
        check_mount_point(Path::new("/usr/local/vault")).unwrap();
    }

    #[test]
    fn unaligned_requests_use_aligned_extent() {
        let mut device = test_device();

        // Aligned write, unaligned read back.
        let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        device.write_at(512, &payload).unwrap();

        let mut window = vec![0u8; 100];
        device.read_at(512 + 37, &mut window).unwrap();
        assert_eq!(window, payload[37..137]);

        // Unaligned write must leave the surrounding bytes intact.
        device.write_at(512 + 200, &[0xEEu8; 16]).unwrap();
        let mut full = vec![0u8; 1024];
        device.read_at(512, &mut full).unwrap();
        assert_eq!(full[..200], payload[..200]);
        assert_eq!(full[200..216], [0xEEu8; 16]);
        assert_eq!(full[216..], payload[216..]);
    }

    #[test]
    fn requests_beyond_device_rejected() {
        let mut device = test_device();
        let size = device.size();
        let mut buf = [0u8; 16];
        assert!(device.read_at(size - 8, &mut buf).is_err());
        assert!(device.write_at(size, &buf[..]).is_err());
    }
}
