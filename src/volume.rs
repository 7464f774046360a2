//! The volume layer: opening, sector I/O, header re-encryption and header
//! backup/restore.
//!
//! Opening runs the candidate search over (layout x KDF x cipher): the KDF
//! loop sits outside the cipher loop because one derivation serves every
//! cipher trial, and legacy KDFs come first so TrueCrypt 7.1a volumes stay
//! responsive. When nothing matches, the caller learns only that the
//! password (or keyfiles) were wrong; a corrupt volume is reported the same
//! way on purpose.

use std::fs::{File, OpenOptions as FsOpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use zeroize::Zeroizing;

use crate::crypto::{CipherCascade, EncryptionAlgorithm, MAX_KEY_MATERIAL};
use crate::error::{Error, Result};
use crate::header::{
    HeaderRejected, VolumeHeader, ENCRYPTED_HEADER_SIZE, HEADER_SECTOR_SIZE, SALT_SIZE,
};
use crate::kdf::Kdf;
use crate::keyfile::apply_keyfiles;
use crate::layout::{LayoutKind, VolumeLayout, LAYOUTS, V2_HIDDEN_HEADER_OFFSET};
use crate::memory::Password;
use crate::rng;

/// Overwrite passes applied to superseded header sectors. Release builds
/// use the paranoid default; callers pass 1 when the master key in the old
/// header is unchanged.
pub const DEFAULT_WIPE_PASS_COUNT: u32 = if cfg!(debug_assertions) { 4 } else { 256 };

/// Write protection applied when mounting an outer volume.
pub enum Protection {
    None,
    /// Decrypt the hidden header with these credentials and refuse writes
    /// into the hidden volume's data range.
    HiddenVolume {
        password: Password,
        keyfiles: Vec<PathBuf>,
    },
}

pub struct OpenOptions {
    pub path: PathBuf,
    pub password: Password,
    pub keyfiles: Vec<PathBuf>,
    pub read_only: bool,
    pub preserve_timestamps: bool,
    pub use_backup_headers: bool,
    pub protection: Protection,
    /// Restrict the candidate search to one KDF instead of the full sweep.
    /// Saves the Argon2id trials when the caller knows what the volume
    /// uses; a wrong hint simply fails the mount.
    pub kdf: Option<Kdf>,
}

impl OpenOptions {
    pub fn new(path: impl Into<PathBuf>, password: Password) -> OpenOptions {
        OpenOptions {
            path: path.into(),
            password,
            keyfiles: Vec::new(),
            read_only: false,
            preserve_timestamps: false,
            use_backup_headers: false,
            protection: Protection::None,
            kdf: None,
        }
    }
}

/// Read-only snapshot of a mounted volume, for the registry and callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub slot: u32,
    pub path: PathBuf,
    pub mount_point: Option<PathBuf>,
    pub encryption_algorithm: String,
    pub kdf_name: String,
    pub iteration_count: u32,
    pub size: u64,
    pub sector_size: u32,
    pub hidden: bool,
    pub read_only: bool,
    pub protection: bool,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// A successfully authenticated volume. Owns the file handle, the decrypted
/// header and the keyed cascade; dropping the volume wipes the key material
/// and restores preserved timestamps.
pub struct Volume {
    file: File,
    path: PathBuf,
    layout: &'static VolumeLayout,
    header: VolumeHeader,
    cascade: CipherCascade,
    kdf: Kdf,
    read_only: bool,
    used_backup_header: bool,
    protected_range: Option<(u64, u64)>,
    preserved_times: Option<(SystemTime, SystemTime)>,
    bytes_read: u64,
    bytes_written: u64,
}

impl std::fmt::Debug for Volume {
    /// Manual impl: the header and cascade carry key material and must
    /// never be formatted, so this deliberately omits them rather than
    /// deriving.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("path", &self.path)
            .field("kdf", &self.kdf)
            .field("read_only", &self.read_only)
            .field("used_backup_header", &self.used_backup_header)
            .field("bytes_read", &self.bytes_read)
            .field("bytes_written", &self.bytes_written)
            .finish_non_exhaustive()
    }
}

impl Volume {
    /// Open and authenticate a volume.
    pub fn open(options: OpenOptions) -> Result<Volume> {
        let OpenOptions {
            path,
            password,
            keyfiles,
            read_only,
            preserve_timestamps,
            use_backup_headers,
            protection,
            kdf,
        } = options;

        if password.is_empty() && keyfiles.is_empty() {
            return Err(Error::ParameterIncorrect("empty password without keyfiles"));
        }

        let mut file = FsOpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|e| Error::system_path(e, &path))?;
        let metadata = file.metadata().map_err(|e| Error::system_path(e, &path))?;
        let file_size = metadata.len();
        let preserved_times = if preserve_timestamps {
            metadata.accessed().ok().zip(metadata.modified().ok())
        } else {
            None
        };

        let mut mixed = password;
        apply_keyfiles(&mut mixed, &keyfiles)?;

        let hidden_protection = !matches!(protection, Protection::None);
        let found = search_headers(
            &mut file,
            file_size,
            mixed.as_bytes(),
            use_backup_headers,
            // An outer volume under protection must match a normal layout.
            if hidden_protection {
                CandidateFilter::NormalOnly
            } else {
                CandidateFilter::Any
            },
            kdf,
        )?;

        let Some(found) = found else {
            return Err(if keyfiles.is_empty() {
                Error::PasswordIncorrect
            } else {
                Error::PasswordKeyfilesIncorrect
            });
        };

        // Geometry must fit the file we actually opened.
        let data_end = found
            .header
            .data_area_offset
            .checked_add(found.header.data_area_length)
            .ok_or(Error::VolumeFormatBad)?;
        if data_end > file_size {
            return Err(Error::VolumeFormatBad);
        }

        let mut volume = Volume {
            file,
            path,
            layout: found.layout,
            cascade: found.cascade,
            kdf: found.kdf,
            header: found.header,
            read_only,
            used_backup_header: found.used_backup,
            protected_range: None,
            preserved_times,
            bytes_read: 0,
            bytes_written: 0,
        };

        if let Protection::HiddenVolume { password, keyfiles } = protection {
            let mut hidden_pw = password;
            apply_keyfiles(&mut hidden_pw, &keyfiles)?;
            let hidden = search_headers(
                &mut volume.file,
                file_size,
                hidden_pw.as_bytes(),
                false,
                CandidateFilter::HiddenOnly,
                // The hidden header may well use a different KDF than the
                // outer one; always run the full sweep for it.
                None,
            )?
            .ok_or(if keyfiles.is_empty() {
                Error::PasswordIncorrect
            } else {
                Error::PasswordKeyfilesIncorrect
            })?;

            let start = hidden.header.data_area_offset;
            let end = start
                .checked_add(hidden.header.data_area_length)
                .ok_or(Error::VolumeFormatBad)?;
            volume.protected_range = Some((start, end));
            log::info!(
                "hidden-volume protection active over {} bytes",
                end - start
            );
        }

        log::info!(
            "opened volume {} ({}, {}, {} iterations{})",
            volume.path.display(),
            volume.cascade.algorithm().name(),
            volume.kdf.name(),
            volume.kdf.iterations(),
            if volume.used_backup_header {
                ", backup header"
            } else {
                ""
            }
        );
        Ok(volume)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout_kind(&self) -> LayoutKind {
        self.layout.kind
    }

    pub fn sector_size(&self) -> u32 {
        self.header.sector_size
    }

    /// Size of the data area in bytes.
    pub fn size(&self) -> u64 {
        self.header.data_area_length
    }

    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.cascade.algorithm()
    }

    pub fn kdf(&self) -> Kdf {
        self.kdf
    }

    pub fn is_hidden(&self) -> bool {
        self.layout.hidden
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn used_backup_header(&self) -> bool {
        self.used_backup_header
    }

    pub fn protection_active(&self) -> bool {
        self.protected_range.is_some()
    }

    /// Whether the header's KDF is weak enough to offer the one-click
    /// re-encryption with the modern equivalent.
    pub fn kdf_upgrade_available(&self) -> bool {
        self.kdf.needs_upgrade()
    }

    pub fn info(&self, slot: u32, mount_point: Option<PathBuf>) -> VolumeInfo {
        VolumeInfo {
            slot,
            path: self.path.clone(),
            mount_point,
            encryption_algorithm: self.cascade.algorithm().name().to_string(),
            kdf_name: self.kdf.name().to_string(),
            iteration_count: self.kdf.iterations(),
            size: self.size(),
            sector_size: self.sector_size(),
            hidden: self.is_hidden(),
            read_only: self.read_only,
            protection: self.protection_active(),
            bytes_read: self.bytes_read,
            bytes_written: self.bytes_written,
        }
    }

    fn check_alignment(&self, offset: u64, len: usize) -> Result<()> {
        let sector = self.header.sector_size as u64;
        if offset % sector != 0 || len as u64 % sector != 0 {
            return Err(Error::ParameterIncorrect(
                "offset and length must be sector-aligned",
            ));
        }
        let end = offset
            .checked_add(len as u64)
            .ok_or(Error::ParameterIncorrect("offset overflow"))?;
        if end > self.header.data_area_length {
            return Err(Error::ParameterIncorrect("read/write beyond data area"));
        }
        Ok(())
    }

    /// Read and decrypt whole sectors. `offset` is relative to the data
    /// area; the XTS tweak is the sector index within the data area.
    pub fn read_sectors(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }

        self.file
            .seek(SeekFrom::Start(self.header.data_area_offset + offset))
            .map_err(|e| Error::system_path(e, &self.path))?;
        self.file
            .read_exact(buf)
            .map_err(|e| Error::system_path(e, &self.path))?;

        let sector_size = self.header.sector_size as usize;
        let first_sector = offset / sector_size as u64;
        self.cascade.decrypt_area(buf, sector_size, first_sector);
        self.bytes_read += buf.len() as u64;
        Ok(())
    }

    /// Encrypt and write whole sectors. Rejected on read-only mounts and on
    /// ranges overlapping a protected hidden volume, before any disk I/O.
    pub fn write_sectors(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::VolumeReadOnly);
        }
        self.check_alignment(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        if let Some((prot_start, prot_end)) = self.protected_range {
            let phys_start = self.header.data_area_offset + offset;
            let phys_end = phys_start + data.len() as u64;
            if phys_start < prot_end && phys_end > prot_start {
                return Err(Error::VolumeProtected);
            }
        }

        let sector_size = self.header.sector_size as usize;
        let first_sector = offset / sector_size as u64;
        let mut ciphertext = Zeroizing::new(data.to_vec());
        self.cascade
            .encrypt_area(&mut ciphertext, sector_size, first_sector);

        self.file
            .seek(SeekFrom::Start(self.header.data_area_offset + offset))
            .map_err(|e| Error::system_path(e, &self.path))?;
        self.file
            .write_all(&ciphertext)
            .map_err(|e| Error::system_path(e, &self.path))?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Flush buffered writes to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::system_path(e, &self.path))
    }

    /// Re-encrypt the header (and its backup, where the layout has one)
    /// under new credentials and/or a new KDF. The master key, and thus the
    /// data area, is untouched.
    pub fn change_password(
        &mut self,
        new_password: Password,
        new_keyfiles: &[PathBuf],
        new_kdf: Kdf,
        wipe_pass_count: u32,
    ) -> Result<()> {
        if self.read_only {
            return Err(Error::VolumeReadOnly);
        }
        if new_password.is_empty() && new_keyfiles.is_empty() {
            return Err(Error::ParameterIncorrect("empty password without keyfiles"));
        }
        // Fresh salt and wipe noise both come from the pool.
        rng::start()?;

        let mut mixed = new_password;
        apply_keyfiles(&mut mixed, new_keyfiles)?;

        self.header.refresh_header_time();
        let sector = seal_header(
            &self.header,
            self.cascade.algorithm(),
            new_kdf,
            mixed.as_bytes(),
            None,
        )?;

        let file_size = self
            .file
            .metadata()
            .map_err(|e| Error::system_path(e, &self.path))?
            .len();
        let mut positions = vec![self.layout.header_position(file_size)?];
        if let Some(backup) = self.layout.backup_header_position(file_size) {
            positions.push(backup);
        }

        for &pos in &positions {
            self.wipe_header_sector(pos, wipe_pass_count)?;
            self.file
                .seek(SeekFrom::Start(pos))
                .map_err(|e| Error::system_path(e, &self.path))?;
            self.file
                .write_all(&sector[..])
                .map_err(|e| Error::system_path(e, &self.path))?;
        }
        self.flush()?;

        self.kdf = new_kdf;
        log::info!(
            "re-encrypted header of {} with {}",
            self.path.display(),
            new_kdf.name()
        );
        Ok(())
    }

    /// One-click KDF upgrade: same credentials, modern iteration count.
    /// A single wipe pass suffices because the old header protects the same
    /// master key.
    pub fn upgrade_kdf(&mut self, password: Password, keyfiles: &[PathBuf]) -> Result<()> {
        if !self.kdf.needs_upgrade() {
            return Err(Error::ParameterIncorrect("KDF does not need upgrading"));
        }
        let target = self.kdf.modern_equivalent();
        self.change_password(password, keyfiles, target, 1)
    }

    fn wipe_header_sector(&mut self, position: u64, passes: u32) -> Result<()> {
        let mut noise = Zeroizing::new([0u8; HEADER_SECTOR_SIZE]);
        if passes > 1 {
            log::debug!("wiping header sector at {position} with {passes} passes");
        }
        for _ in 0..passes.saturating_sub(1) {
            rng::fill_random(&mut noise[..])?;
            self.file
                .seek(SeekFrom::Start(position))
                .map_err(|e| Error::system_path(e, &self.path))?;
            self.file
                .write_all(&noise[..])
                .map_err(|e| Error::system_path(e, &self.path))?;
            self.file
                .sync_data()
                .map_err(|e| Error::system_path(e, &self.path))?;
        }
        Ok(())
    }

}

impl Drop for Volume {
    fn drop(&mut self) {
        if let Some((accessed, modified)) = self.preserved_times.take() {
            restore_file_times(&self.path, accessed, modified);
        }
    }
}

#[cfg(unix)]
fn restore_file_times(path: &Path, accessed: SystemTime, modified: SystemTime) {
    use std::os::unix::ffi::OsStrExt;
    use std::time::UNIX_EPOCH;

    fn to_timeval(t: SystemTime) -> libc::timeval {
        let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        }
    }

    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    let times = [to_timeval(accessed), to_timeval(modified)];
    let rc = unsafe { libc::utimes(cpath.as_ptr(), times.as_ptr()) };
    if rc != 0 {
        log::warn!("could not restore timestamps of {}", path.display());
    }
}

#[cfg(not(unix))]
fn restore_file_times(_path: &Path, _accessed: SystemTime, _modified: SystemTime) {}

/// Which layouts a header search considers.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CandidateFilter {
    Any,
    NormalOnly,
    HiddenOnly,
}

struct FoundHeader {
    layout: &'static VolumeLayout,
    kdf: Kdf,
    header: VolumeHeader,
    cascade: CipherCascade,
    used_backup: bool,
}

/// Candidate search over (layout x KDF x cipher). Returns `Ok(None)` when
/// every candidate failed the magic check, so the caller can report a
/// password failure without detail.
fn search_headers(
    file: &mut File,
    file_size: u64,
    password: &[u8],
    use_backup_headers: bool,
    filter: CandidateFilter,
    kdf_filter: Option<Kdf>,
) -> Result<Option<FoundHeader>> {
    for layout in LAYOUTS.iter() {
        // V1Normal shares its header position with V2Normal; the V2Normal
        // probe covers both and the version field picks the real layout.
        if layout.kind == LayoutKind::V1Normal {
            continue;
        }
        match filter {
            CandidateFilter::NormalOnly if layout.hidden => continue,
            CandidateFilter::HiddenOnly if !layout.hidden => continue,
            _ => {}
        }

        let position = if use_backup_headers {
            match layout.backup_header_position(file_size) {
                Some(p) => p,
                None => continue,
            }
        } else {
            match layout.header_position(file_size) {
                Ok(p) => p,
                Err(_) => continue,
            }
        };

        let mut sector = Zeroizing::new([0u8; HEADER_SECTOR_SIZE]);
        if file.seek(SeekFrom::Start(position)).is_err() {
            continue;
        }
        if file.read_exact(&mut sector[..]).is_err() {
            continue;
        }
        let salt = &sector[..SALT_SIZE];
        let encrypted = &sector[SALT_SIZE..];

        let mut header_key = Zeroizing::new([0u8; MAX_KEY_MATERIAL]);
        for &kdf in layout.kdfs() {
            if kdf_filter.is_some_and(|wanted| wanted != kdf) {
                continue;
            }
            if let Err(err) = kdf.derive(password, salt, &mut header_key[..]) {
                // Argon2id-Max may be undeliverable on small machines; the
                // next candidate still gets its chance.
                log::warn!("KDF {} unavailable: {}", kdf.name(), err);
                continue;
            }

            for &algorithm in layout.algorithms() {
                let Ok(header_cascade) = CipherCascade::from_key_material(
                    algorithm,
                    &header_key[..algorithm.key_material_size()],
                ) else {
                    continue;
                };

                let mut payload = Zeroizing::new([0u8; ENCRYPTED_HEADER_SIZE]);
                payload.copy_from_slice(encrypted);
                header_cascade.decrypt_area(&mut payload[..], ENCRYPTED_HEADER_SIZE, 0);

                match VolumeHeader::deserialize(&payload[..], layout.magics()) {
                    Ok(header) => {
                        // The data cascade inherits the algorithm that
                        // decrypted the header. Equal XTS key halves in the
                        // key area are fatal here, not a retry.
                        let cascade = CipherCascade::from_key_material(
                            algorithm,
                            header.master_key_for(algorithm),
                        )?;
                        // A version-1 header found at the shared front
                        // position belongs to the legacy layout.
                        let effective = if layout.kind == LayoutKind::V2Normal
                            && header.version < 2
                        {
                            VolumeLayout::find(LayoutKind::V1Normal)
                        } else {
                            layout
                        };
                        return Ok(Some(FoundHeader {
                            layout: effective,
                            kdf,
                            header,
                            cascade,
                            used_backup: use_backup_headers,
                        }));
                    }
                    Err(HeaderRejected::WrongMagic) => continue,
                    Err(_) => return Err(Error::VolumeFormatBad),
                }
            }
        }
    }
    Ok(None)
}

/// Serialise and encrypt a header sector: salt (fresh from the pool unless
/// supplied) followed by the XTS-encrypted payload under a key derived with
/// `kdf` from the already-keyfile-mixed password.
pub(crate) fn seal_header(
    header: &VolumeHeader,
    algorithm: EncryptionAlgorithm,
    kdf: Kdf,
    mixed_password: &[u8],
    salt: Option<&[u8; SALT_SIZE]>,
) -> Result<Zeroizing<[u8; HEADER_SECTOR_SIZE]>> {
    let mut sector = Zeroizing::new([0u8; HEADER_SECTOR_SIZE]);
    match salt {
        Some(s) => sector[..SALT_SIZE].copy_from_slice(s),
        None => rng::fill_random(&mut sector[..SALT_SIZE])?,
    }

    let mut header_key = Zeroizing::new([0u8; MAX_KEY_MATERIAL]);
    kdf.derive(mixed_password, &sector[..SALT_SIZE], &mut header_key[..])?;
    let header_cascade =
        CipherCascade::from_key_material(algorithm, &header_key[..algorithm.key_material_size()])?;

    let mut payload = header.serialize();
    header_cascade.encrypt_area(&mut payload[..], ENCRYPTED_HEADER_SIZE, 0);
    sector[SALT_SIZE..].copy_from_slice(&payload[..]);
    Ok(sector)
}

/// Header-only backup to an external file.
///
/// The exported group carries the re-encrypted (fresh salt) primary header
/// and a hidden slot: the real hidden header when its credentials are
/// supplied, otherwise random data encrypted under a random throwaway key,
/// so the backup file never reveals whether a hidden volume exists.
pub fn backup_headers(
    path: &Path,
    password: Password,
    keyfiles: &[PathBuf],
    hidden_credentials: Option<(Password, Vec<PathBuf>)>,
    out_path: &Path,
) -> Result<()> {
    rng::start()?;
    let mut outer_pw = password;
    apply_keyfiles(&mut outer_pw, keyfiles)?;

    let mut file = File::open(path).map_err(|e| Error::system_path(e, path))?;
    let file_size = file
        .metadata()
        .map_err(|e| Error::system_path(e, path))?
        .len();

    let outer = search_headers(
        &mut file,
        file_size,
        outer_pw.as_bytes(),
        false,
        CandidateFilter::NormalOnly,
        None,
    )?
    .ok_or(if keyfiles.is_empty() {
        Error::PasswordIncorrect
    } else {
        Error::PasswordKeyfilesIncorrect
    })?;

    if !outer.layout.is_v2() {
        return Err(Error::NotImplemented(
            "header backup of legacy-layout volumes",
        ));
    }

    let group_size = crate::layout::V2_HEADER_GROUP_SIZE as usize;
    let mut group = vec![0u8; group_size];
    rng::fill_random(&mut group)?;

    let outer_sector = seal_header(
        &outer.header,
        outer.cascade.algorithm(),
        outer.kdf,
        outer_pw.as_bytes(),
        None,
    )?;
    group[..HEADER_SECTOR_SIZE].copy_from_slice(&outer_sector[..]);

    let hidden_sector = match hidden_credentials {
        Some((hidden_pw, hidden_keyfiles)) => {
            let mut mixed = hidden_pw;
            apply_keyfiles(&mut mixed, &hidden_keyfiles)?;
            let hidden = search_headers(
                &mut file,
                file_size,
                mixed.as_bytes(),
                false,
                CandidateFilter::HiddenOnly,
                None,
            )?
            .ok_or(Error::PasswordIncorrect)?;
            seal_header(
                &hidden.header,
                hidden.cascade.algorithm(),
                hidden.kdf,
                mixed.as_bytes(),
                None,
            )?
        }
        None => decoy_header_sector()?,
    };
    let hidden_off = V2_HIDDEN_HEADER_OFFSET as usize;
    group[hidden_off..hidden_off + HEADER_SECTOR_SIZE].copy_from_slice(&hidden_sector[..]);

    let mut out = File::create(out_path).map_err(|e| Error::system_path(e, out_path))?;
    out.write_all(&group)
        .map_err(|e| Error::system_path(e, out_path))?;
    out.sync_all().map_err(|e| Error::system_path(e, out_path))?;
    log::info!(
        "exported header backup of {} to {}",
        path.display(),
        out_path.display()
    );
    Ok(())
}

/// A header-shaped sector of random bytes encrypted under a random key:
/// indistinguishable from a real hidden header without its password.
fn decoy_header_sector() -> Result<Zeroizing<[u8; HEADER_SECTOR_SIZE]>> {
    let mut sector = Zeroizing::new([0u8; HEADER_SECTOR_SIZE]);
    rng::fill_random(&mut sector[..])?;

    let mut key = Zeroizing::new([0u8; MAX_KEY_MATERIAL]);
    rng::fill_random(&mut key[..])?;
    // Random halves collide with probability 2^-256; treat it as an RNG
    // failure if they do.
    let cascade = CipherCascade::from_key_material(EncryptionAlgorithm::Aes, &key[..])
        .map_err(|_| Error::TestFailed("RNG produced identical XTS key halves"))?;
    cascade.encrypt_area(&mut sector[SALT_SIZE..], ENCRYPTED_HEADER_SIZE, 0);
    Ok(sector)
}

/// Where a header restore takes its header from.
pub enum RestoreSource {
    /// The volume's own embedded backup group (V2 layouts only).
    InternalBackup,
    /// An external file produced by [`backup_headers`].
    ExternalFile(PathBuf),
}

/// Restore a damaged primary header. The restored header is re-encrypted
/// with a fresh salt before being written back.
pub fn restore_headers(
    path: &Path,
    password: Password,
    keyfiles: &[PathBuf],
    source: RestoreSource,
) -> Result<()> {
    rng::start()?;
    let mut mixed = password;
    apply_keyfiles(&mut mixed, keyfiles)?;

    let mut file = FsOpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::system_path(e, path))?;
    let file_size = file
        .metadata()
        .map_err(|e| Error::system_path(e, path))?
        .len();

    let found = match source {
        RestoreSource::InternalBackup => search_headers(
            &mut file,
            file_size,
            mixed.as_bytes(),
            true,
            CandidateFilter::Any,
            None,
        )?,
        RestoreSource::ExternalFile(ref backup_path) => {
            let mut backup = File::open(backup_path)
                .map_err(|e| Error::system_path(e, backup_path))?;
            let backup_size = backup
                .metadata()
                .map_err(|e| Error::system_path(e, backup_path))?
                .len();
            // The backup file mirrors a header group, so the same candidate
            // search applies with in-file offsets.
            search_headers(
                &mut backup,
                backup_size,
                mixed.as_bytes(),
                false,
                CandidateFilter::Any,
                None,
            )?
        }
    };

    let Some(found) = found else {
        return Err(if keyfiles.is_empty() {
            Error::PasswordIncorrect
        } else {
            Error::PasswordKeyfilesIncorrect
        });
    };

    // Internal restores land on the layout of the embedded backup, and an
    // external group mirrors the on-volume slot positions, so the matched
    // layout carries over directly in both cases.
    let target_layout = found.layout;

    let sector = seal_header(
        &found.header,
        found.cascade.algorithm(),
        found.kdf,
        mixed.as_bytes(),
        None,
    )?;
    let position = target_layout.header_position(file_size)?;
    file.seek(SeekFrom::Start(position))
        .map_err(|e| Error::system_path(e, path))?;
    file.write_all(&sector[..])
        .map_err(|e| Error::system_path(e, path))?;
    file.sync_data().map_err(|e| Error::system_path(e, path))?;
    log::info!("restored header of {}", path.display());
    Ok(())
}

/// Change the password/KDF of an unmounted volume.
pub fn change_volume_password(
    path: &Path,
    old_password: Password,
    old_keyfiles: &[PathBuf],
    new_password: Password,
    new_keyfiles: &[PathBuf],
    new_kdf: Kdf,
    wipe_pass_count: u32,
) -> Result<()> {
    let mut volume = Volume::open(OpenOptions {
        path: path.to_path_buf(),
        password: old_password,
        keyfiles: old_keyfiles.to_vec(),
        read_only: false,
        preserve_timestamps: false,
        use_backup_headers: false,
        protection: Protection::None,
        kdf: None,
    })?;
    volume.change_password(new_password, new_keyfiles, new_kdf, wipe_pass_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::{create_volume, CreateOptions, FilesystemType};
    use byteorder::{BigEndian, ByteOrder};

    fn start_rng() {
        rng::start().unwrap();
    }

    fn temp_path(name: &str) -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        // Leak the TempDir so the path stays valid for the test body.
        let path = dir.path().join(name);
        std::mem::forget(dir);
        path
    }

    fn quick_volume(path: &Path, password: &str) {
        create_volume(
            CreateOptions {
                path: path.to_path_buf(),
                size: 1024 * 1024,
                algorithm: EncryptionAlgorithm::Aes,
                kdf: Kdf::Pbkdf2Sha512Legacy,
                password: Password::from_str(password).unwrap(),
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
    }

    #[test]
    fn create_open_read_write() {
        start_rng();
        let path = temp_path("basic.bslt");
        quick_volume(&path, "test password");

        let mut volume = Volume::open(OpenOptions::new(
            &path,
            Password::from_str("test password").unwrap(),
        ))
        .unwrap();
        assert_eq!(volume.algorithm(), EncryptionAlgorithm::Aes);
        assert_eq!(volume.sector_size(), 512);

        let payload = vec![0x42u8; 2048];
        volume.write_sectors(1024, &payload).unwrap();
        let mut read_back = vec![0u8; 2048];
        volume.read_sectors(1024, &mut read_back).unwrap();
        assert_eq!(read_back, payload);

        // The ciphertext on disk must differ from the plaintext.
        drop(volume);
        let raw = std::fs::read(&path).unwrap();
        let data_start = crate::layout::V2_HEADER_GROUP_SIZE as usize + 1024;
        assert_ne!(&raw[data_start..data_start + 2048], payload.as_slice());
    }

    #[test]
    fn wrong_password_rejected_without_detail() {
        start_rng();
        let path = temp_path("wrongpw.bslt");
        quick_volume(&path, "right password");

        // Hint the KDF so the failing search stays bounded to the legacy
        // candidate cost.
        let mut options =
            OpenOptions::new(&path, Password::from_str("wrong password").unwrap());
        options.kdf = Some(Kdf::Pbkdf2Sha512Legacy);
        let err = Volume::open(options).unwrap_err();
        assert!(matches!(err, Error::PasswordIncorrect));
    }

    #[test]
    fn unaligned_io_rejected() {
        start_rng();
        let path = temp_path("align.bslt");
        quick_volume(&path, "pw");
        let mut volume =
            Volume::open(OpenOptions::new(&path, Password::from_str("pw").unwrap())).unwrap();

        let mut buf = vec![0u8; 512];
        assert!(matches!(
            volume.read_sectors(100, &mut buf),
            Err(Error::ParameterIncorrect(_))
        ));
        let mut odd = vec![0u8; 100];
        assert!(matches!(
            volume.read_sectors(0, &mut odd),
            Err(Error::ParameterIncorrect(_))
        ));
    }

    #[test]
    fn read_only_mount_rejects_writes() {
        start_rng();
        let path = temp_path("ro.bslt");
        quick_volume(&path, "pw");

        let mut options = OpenOptions::new(&path, Password::from_str("pw").unwrap());
        options.read_only = true;
        let mut volume = Volume::open(options).unwrap();
        assert!(matches!(
            volume.write_sectors(0, &[0u8; 512]),
            Err(Error::VolumeReadOnly)
        ));
    }

    #[test]
    fn change_password_and_reopen() {
        start_rng();
        let path = temp_path("chpw.bslt");
        quick_volume(&path, "old password");

        let mut volume = Volume::open(OpenOptions::new(
            &path,
            Password::from_str("old password").unwrap(),
        ))
        .unwrap();
        volume.write_sectors(0, &[7u8; 512]).unwrap();
        volume
            .change_password(
                Password::from_str("new password").unwrap(),
                &[],
                Kdf::Pbkdf2Sha512Legacy,
                2,
            )
            .unwrap();
        drop(volume);

        let mut old_options =
            OpenOptions::new(&path, Password::from_str("old password").unwrap());
        old_options.kdf = Some(Kdf::Pbkdf2Sha512Legacy);
        assert!(matches!(
            Volume::open(old_options).unwrap_err(),
            Error::PasswordIncorrect
        ));

        let mut reopened = Volume::open(OpenOptions::new(
            &path,
            Password::from_str("new password").unwrap(),
        ))
        .unwrap();
        let mut buf = [0u8; 512];
        reopened.read_sectors(0, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 512]);
    }

    #[test]
    fn backup_header_mount_works() {
        start_rng();
        let path = temp_path("backup.bslt");
        quick_volume(&path, "pw");

        let mut options = OpenOptions::new(&path, Password::from_str("pw").unwrap());
        options.use_backup_headers = true;
        let volume = Volume::open(options).unwrap();
        assert!(volume.used_backup_header());
    }

    #[test]
    fn equal_master_key_halves_are_fatal() {
        start_rng();
        let path = temp_path("weakkey.bslt");

        // Hand-build a volume whose master key has primary == secondary.
        let size: u64 = 1024 * 1024;
        let layout = VolumeLayout::find(LayoutKind::V2Normal);
        let (data_off, data_len) = layout.data_area_for_creation(size).unwrap();
        let mut weak_key = [0u8; 64];
        weak_key[..32].copy_from_slice(&[5u8; 32]);
        weak_key[32..].copy_from_slice(&[5u8; 32]);
        let header =
            VolumeHeader::new(size, data_off, data_len, 0, 512, &weak_key).unwrap();
        let sector = seal_header(
            &header,
            EncryptionAlgorithm::Aes,
            Kdf::Pbkdf2Sha512Legacy,
            b"pw",
            None,
        )
        .unwrap();

        let mut file = File::create(&path).unwrap();
        file.set_len(size).unwrap();
        file.write_all(&sector[..]).unwrap();
        drop(file);

        let err =
            Volume::open(OpenOptions::new(&path, Password::from_str("pw").unwrap()))
                .unwrap_err();
        assert!(matches!(err, Error::ParameterIncorrect(_)));
    }

    #[test]
    fn legacy_truecrypt_header_mounts() {
        start_rng();
        let path = temp_path("legacy.tc");

        // A V1-style fixture: TRUE magic, PBKDF2-RIPEMD160/2000, AES-256,
        // header sector at offset 0, zero-filled data area.
        let size: u64 = 1024 * 1024;
        let mut master_key = [0u8; 64];
        master_key[32..].copy_from_slice(&[1u8; 32]); // primary zero, secondary ones

        let mut payload = [0u8; ENCRYPTED_HEADER_SIZE];
        payload[0..4].copy_from_slice(b"TRUE");
        BigEndian::write_u16(&mut payload[4..6], 1);
        BigEndian::write_u16(&mut payload[6..8], 1);
        BigEndian::write_u64(&mut payload[36..44], size);
        BigEndian::write_u64(&mut payload[44..52], 512);
        BigEndian::write_u64(&mut payload[52..60], size - 512);
        BigEndian::write_u32(&mut payload[64..68], 512);
        payload[72..72 + 64].copy_from_slice(&master_key);
        let key_crc = crc32fast::hash(&payload[72..72 + 256]);
        BigEndian::write_u32(&mut payload[8..12], key_crc);
        let fields_crc = crc32fast::hash(&payload[..68]);
        BigEndian::write_u32(&mut payload[68..72], fields_crc);

        let salt = [0u8; SALT_SIZE];
        let mut header_key = [0u8; MAX_KEY_MATERIAL];
        Kdf::Pbkdf2Ripemd160Legacy
            .derive(b"test", &salt, &mut header_key)
            .unwrap();
        let cascade =
            CipherCascade::from_key_material(EncryptionAlgorithm::Aes, &header_key[..64])
                .unwrap();
        cascade.encrypt_area(&mut payload, ENCRYPTED_HEADER_SIZE, 0);

        let mut file = File::create(&path).unwrap();
        file.set_len(size).unwrap();
        file.write_all(&salt).unwrap();
        file.write_all(&payload).unwrap();
        drop(file);

        let mut volume =
            Volume::open(OpenOptions::new(&path, Password::from_str("test").unwrap()))
                .unwrap();
        assert_eq!(volume.layout_kind(), LayoutKind::V1Normal);
        assert_eq!(volume.kdf(), Kdf::Pbkdf2Ripemd160Legacy);
        assert_eq!(volume.algorithm(), EncryptionAlgorithm::Aes);

        // Sector 0 of the zero-filled data area decrypts deterministically.
        let mut first = [0u8; 512];
        volume.read_sectors(0, &mut first).unwrap();
        let mut second = [0u8; 512];
        volume.read_sectors(0, &mut second).unwrap();
        assert_eq!(first, second);
        drop(volume);

        // Wrong password on the same fixture: rejected, no detail, within
        // the legacy candidate search cost.
        let mut wrong = OpenOptions::new(&path, Password::from_str("xxxx").unwrap());
        wrong.kdf = Some(Kdf::Pbkdf2Ripemd160Legacy);
        let err = Volume::open(wrong).unwrap_err();
        assert!(matches!(err, Error::PasswordIncorrect));
    }

    #[test]
    fn kdf_upgrade_re_encrypts_header() {
        start_rng();
        let path = temp_path("upgrade.bslt");
        quick_volume(&path, "pw");

        let mut volume =
            Volume::open(OpenOptions::new(&path, Password::from_str("pw").unwrap())).unwrap();
        volume.write_sectors(512, &[9u8; 512]).unwrap();
        assert!(volume.kdf_upgrade_available());
        volume
            .upgrade_kdf(Password::from_str("pw").unwrap(), &[])
            .unwrap();
        assert_eq!(volume.kdf(), Kdf::Pbkdf2Sha512);
        assert_eq!(volume.kdf().iterations(), 500_000);
        drop(volume);

        // The legacy candidate no longer opens the volume.
        let mut stale = OpenOptions::new(&path, Password::from_str("pw").unwrap());
        stale.kdf = Some(Kdf::Pbkdf2Sha512Legacy);
        assert!(matches!(
            Volume::open(stale).unwrap_err(),
            Error::PasswordIncorrect
        ));
        // Remount with data intact is covered by the header-maintenance
        // integration tests, which pay the 500k-iteration derivation.
    }
}
