//! Volume creation.
//!
//! Writes the header group pair (and, when requested, a hidden header
//! inside it), fills the data area with cipher output keyed by the master
//! key so unused space is indistinguishable from data, and optionally lays
//! down a FAT filesystem. The fill loop checks an abort flag between
//! batches; an aborted creation leaves the partial file on disk.

use std::fs::OpenOptions as FsOpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use zeroize::Zeroizing;

use crate::crypto::{CipherCascade, EncryptionAlgorithm};
use crate::error::{Error, Result};
use crate::header::VolumeHeader;
use crate::kdf::Kdf;
use crate::keyfile::apply_keyfiles;
use crate::layout::{LayoutKind, VolumeLayout};
use crate::memory::Password;
use crate::rng;
use crate::service::loopfile::VolumeIo;
use crate::service::VolumeDevice;
use crate::volume::{seal_header, OpenOptions, Protection, Volume};

/// Guest filesystem written into the fresh data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemType {
    None,
    Fat,
    /// HFS+ formatting runs through the platform collaborator (mount the
    /// attached device, run `newfs`, dismount); creation itself leaves the
    /// data area empty.
    MacOsExt,
}

impl FilesystemType {
    pub fn from_name(name: &str) -> Result<FilesystemType> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Ok(FilesystemType::None),
            "fat" | "fat32" => Ok(FilesystemType::Fat),
            "hfs" | "hfs+" | "macos-ext" | "mac" => Ok(FilesystemType::MacOsExt),
            _ => Err(Error::ParameterIncorrect("unknown filesystem type")),
        }
    }
}

pub struct CreateOptions {
    pub path: PathBuf,
    pub size: u64,
    pub algorithm: EncryptionAlgorithm,
    pub kdf: Kdf,
    pub password: Password,
    pub keyfiles: Vec<PathBuf>,
    pub filesystem: FilesystemType,
    /// Skip the data-area fill. The header still protects the whole area;
    /// old file content stays readable to whoever had the file before.
    pub quick: bool,
    pub sector_size: u32,
    /// Also create a hidden volume of this many bytes inside the new
    /// volume's data area.
    pub hidden_size: Option<u64>,
    pub hidden_password: Option<Password>,
}

/// Fill batch size. Also the progress-report granularity.
const FILL_CHUNK: usize = 1024 * 1024;

/// Generate key material whose XTS halves differ for every cascade layer.
fn generate_master_key(algorithm: EncryptionAlgorithm) -> Result<Zeroizing<Vec<u8>>> {
    let mut key = Zeroizing::new(vec![0u8; algorithm.key_material_size()]);
    for _ in 0..8 {
        rng::fill_random(&mut key)?;
        if CipherCascade::from_key_material(algorithm, &key).is_ok() {
            return Ok(key);
        }
    }
    Err(Error::TestFailed("RNG repeatedly produced weak XTS keys"))
}

/// Create a new volume at `options.path`. `abort` is polled between fill
/// batches; `progress` receives (bytes done, bytes total) for the fill.
pub fn create_volume(
    options: CreateOptions,
    abort: Option<&AtomicBool>,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    rng::start()?;

    let CreateOptions {
        path,
        size,
        algorithm,
        kdf,
        password,
        keyfiles,
        filesystem,
        quick,
        sector_size,
        hidden_size,
        hidden_password,
    } = options;

    // SHA-1 and RIPEMD-160 based KDFs are accepted when opening foreign
    // volumes but never offered for new ones.
    if !Kdf::creation_kdfs(kdf.is_legacy()).contains(&kdf) {
        return Err(Error::ParameterIncorrect(
            "KDF not available for new volumes",
        ));
    }

    let layout = VolumeLayout::find(LayoutKind::V2Normal);
    if size < layout.min_volume_size(sector_size) {
        return Err(Error::ParameterIncorrect("volume size too small"));
    }
    if size % sector_size as u64 != 0 {
        return Err(Error::ParameterIncorrect(
            "volume size must be a multiple of the sector size",
        ));
    }
    if password.is_empty() && keyfiles.is_empty() {
        return Err(Error::ParameterIncorrect("empty password without keyfiles"));
    }

    let mut mixed = password.clone();
    apply_keyfiles(&mut mixed, &keyfiles)?;

    let (data_offset, data_length) = layout.data_area_for_creation(size)?;
    let master_key = generate_master_key(algorithm)?;
    let header = VolumeHeader::new(size, data_offset, data_length, 0, sector_size, &master_key)?;

    let mut file = FsOpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| Error::system_path(e, &path))?;
    file.set_len(size).map_err(|e| Error::system_path(e, &path))?;

    // Primary and backup header sectors, each under its own fresh salt.
    let primary = seal_header(&header, algorithm, kdf, mixed.as_bytes(), None)?;
    file.seek(SeekFrom::Start(layout.header_position(size)?))
        .map_err(|e| Error::system_path(e, &path))?;
    file.write_all(&primary[..])
        .map_err(|e| Error::system_path(e, &path))?;

    if let Some(backup_pos) = layout.backup_header_position(size) {
        let backup = seal_header(&header, algorithm, kdf, mixed.as_bytes(), None)?;
        file.seek(SeekFrom::Start(backup_pos))
            .map_err(|e| Error::system_path(e, &path))?;
        file.write_all(&backup[..])
            .map_err(|e| Error::system_path(e, &path))?;
    }

    if !quick {
        fill_data_area(
            &mut file,
            &path,
            algorithm,
            &master_key,
            data_offset,
            data_length,
            sector_size,
            abort,
            progress,
        )?;
    }

    if let Some(hidden_size) = hidden_size {
        let hidden_password = hidden_password
            .ok_or(Error::ParameterIncorrect("hidden volume needs a password"))?;
        write_hidden_volume(
            &mut file,
            &path,
            size,
            hidden_size,
            sector_size,
            algorithm,
            kdf,
            hidden_password,
        )?;
    }

    file.sync_all().map_err(|e| Error::system_path(e, &path))?;
    drop(file);

    if filesystem == FilesystemType::Fat {
        format_with_fat(&path, password, &keyfiles, kdf, data_length)?;
    }

    log::info!(
        "created {} byte volume at {} ({}, {})",
        size,
        path.display(),
        algorithm.name(),
        kdf.name()
    );
    Ok(())
}

/// Overwrite the data area with the cascade's own output so free space is
/// indistinguishable from ciphertext.
#[allow(clippy::too_many_arguments)]
fn fill_data_area(
    file: &mut std::fs::File,
    path: &std::path::Path,
    algorithm: EncryptionAlgorithm,
    master_key: &[u8],
    data_offset: u64,
    data_length: u64,
    sector_size: u32,
    abort: Option<&AtomicBool>,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    let cascade = CipherCascade::from_key_material(algorithm, master_key)?;
    let sector = sector_size as usize;
    let chunk_len = FILL_CHUNK - FILL_CHUNK % sector;

    file.seek(SeekFrom::Start(data_offset))
        .map_err(|e| Error::system_path(e, path))?;

    let mut written = 0u64;
    let mut chunk = Zeroizing::new(vec![0u8; chunk_len]);
    while written < data_length {
        if abort.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            log::warn!("volume creation aborted at {written}/{data_length} bytes");
            return Err(Error::UserAbort);
        }

        let n = chunk_len.min((data_length - written) as usize);
        chunk[..n].fill(0);
        cascade.encrypt_area(&mut chunk[..n], sector, written / sector_size as u64);
        file.write_all(&chunk[..n])
            .map_err(|e| Error::system_path(e, path))?;
        written += n as u64;
        progress(written, data_length);
    }
    file.sync_data().map_err(|e| Error::system_path(e, path))?;
    Ok(())
}

/// Write the hidden header pair into the freshly created outer volume.
#[allow(clippy::too_many_arguments)]
fn write_hidden_volume(
    file: &mut std::fs::File,
    path: &std::path::Path,
    outer_size: u64,
    hidden_size: u64,
    sector_size: u32,
    algorithm: EncryptionAlgorithm,
    kdf: Kdf,
    hidden_password: Password,
) -> Result<()> {
    if hidden_size == 0 || hidden_size % sector_size as u64 != 0 {
        return Err(Error::ParameterIncorrect(
            "hidden volume size must be a positive multiple of the sector size",
        ));
    }
    if hidden_password.is_empty() {
        return Err(Error::ParameterIncorrect("hidden volume needs a password"));
    }

    let layout = VolumeLayout::find(LayoutKind::V2Hidden);
    let (data_offset, data_length) = layout.hidden_data_area(outer_size, hidden_size)?;
    let master_key = generate_master_key(algorithm)?;
    let header = VolumeHeader::new(
        outer_size,
        data_offset,
        data_length,
        hidden_size,
        sector_size,
        &master_key,
    )?;

    let sector = seal_header(&header, algorithm, kdf, hidden_password.as_bytes(), None)?;
    file.seek(SeekFrom::Start(layout.header_position(outer_size)?))
        .map_err(|e| Error::system_path(e, path))?;
    file.write_all(&sector[..])
        .map_err(|e| Error::system_path(e, path))?;

    if let Some(backup_pos) = layout.backup_header_position(outer_size) {
        let backup = seal_header(&header, algorithm, kdf, hidden_password.as_bytes(), None)?;
        file.seek(SeekFrom::Start(backup_pos))
            .map_err(|e| Error::system_path(e, path))?;
        file.write_all(&backup[..])
            .map_err(|e| Error::system_path(e, path))?;
    }
    log::info!("hidden volume of {hidden_size} bytes written into {}", path.display());
    Ok(())
}

/// Open the new volume and format its data area as FAT through the cipher.
fn format_with_fat(
    path: &std::path::Path,
    password: Password,
    keyfiles: &[PathBuf],
    kdf: Kdf,
    data_length: u64,
) -> Result<()> {
    let volume = Volume::open(OpenOptions {
        path: path.to_path_buf(),
        password,
        keyfiles: keyfiles.to_vec(),
        read_only: false,
        preserve_timestamps: false,
        use_backup_headers: false,
        protection: Protection::None,
        kdf: Some(kdf),
    })?;

    let mut volume_id = [0u8; 4];
    rng::get_data(&mut volume_id, true)?;

    let mut device = VolumeDevice::new(volume);
    let mut io = VolumeIo::new(&mut device);
    crate::fat::format_fat(&mut io, data_length, u32::from_le_bytes(volume_id))
        .map_err(|e| Error::system_path(e, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::BlockDevice;

    fn base_options(path: PathBuf, size: u64) -> CreateOptions {
        CreateOptions {
            path,
            size,
            algorithm: EncryptionAlgorithm::Aes,
            kdf: Kdf::Pbkdf2Sha512Legacy,
            password: Password::from_str("creation password").unwrap(),
            keyfiles: Vec::new(),
            filesystem: FilesystemType::None,
            quick: true,
            sector_size: 512,
            hidden_size: None,
            hidden_password: None,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::mem::forget(dir);
        path
    }

    #[test]
    fn created_file_has_requested_size() {
        rng::start().unwrap();
        let path = temp_path("size.bslt");
        create_volume(base_options(path.clone(), 1024 * 1024), None, &mut |_, _| {})
            .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024 * 1024);
    }

    #[test]
    fn full_fill_reports_progress_and_randomises() {
        rng::start().unwrap();
        let path = temp_path("fill.bslt");
        let mut options = base_options(path.clone(), 1024 * 1024);
        options.quick = false;

        let mut reports = 0u32;
        let mut last = (0u64, 0u64);
        create_volume(options, None, &mut |done, total| {
            reports += 1;
            last = (done, total);
        })
        .unwrap();
        assert!(reports > 0);
        assert_eq!(last.0, last.1);

        // The fill is cipher output: no long zero runs in the data area.
        let raw = std::fs::read(&path).unwrap();
        let data = &raw[131_072..131_072 + 4096];
        assert!(data.iter().any(|&b| b != 0));
    }

    #[test]
    fn abort_stops_fill() {
        rng::start().unwrap();
        let path = temp_path("abort.bslt");
        let mut options = base_options(path.clone(), 1024 * 1024);
        options.quick = false;

        let flag = AtomicBool::new(true);
        let err = create_volume(options, Some(&flag), &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::UserAbort));
        // Partial file stays on disk.
        assert!(path.exists());
    }

    #[test]
    fn bad_sizes_rejected() {
        rng::start().unwrap();
        let path = temp_path("bad.bslt");
        assert!(matches!(
            create_volume(base_options(path.clone(), 1000), None, &mut |_, _| {}),
            Err(Error::ParameterIncorrect(_))
        ));
        assert!(matches!(
            create_volume(
                base_options(path, 2 * 131_072 + 700),
                None,
                &mut |_, _| {}
            ),
            Err(Error::ParameterIncorrect(_))
        ));
    }

    #[test]
    fn legacy_only_hashes_rejected_for_creation() {
        rng::start().unwrap();
        for kdf in [
            Kdf::Pbkdf2Sha1Legacy,
            Kdf::Pbkdf2Ripemd160Legacy,
            Kdf::Pbkdf2Sha1,
            Kdf::Pbkdf2Ripemd160,
            Kdf::Pbkdf2Ripemd160LegacyLow,
        ] {
            let path = temp_path("legacyonly.bslt");
            let mut options = base_options(path, 1024 * 1024);
            options.kdf = kdf;
            assert!(
                matches!(
                    create_volume(options, None, &mut |_, _| {}),
                    Err(Error::ParameterIncorrect(_))
                ),
                "{} accepted for creation",
                kdf.name()
            );
        }
    }

    #[test]
    fn fat_formatted_volume_has_boot_signature() {
        rng::start().unwrap();
        let path = temp_path("fat.bslt");
        let mut options = base_options(path.clone(), 2 * 1024 * 1024);
        options.filesystem = FilesystemType::Fat;
        create_volume(options, None, &mut |_, _| {}).unwrap();

        let mut volume = Volume::open(OpenOptions::new(
            &path,
            Password::from_str("creation password").unwrap(),
        ))
        .unwrap();
        let mut boot = [0u8; 512];
        volume.read_sectors(0, &mut boot).unwrap();
        assert_eq!(&boot[510..512], &[0x55, 0xAA]);
        assert_eq!(&boot[82..90], b"FAT32   ");
    }

    #[test]
    fn hidden_volume_mounts_with_its_own_password() {
        rng::start().unwrap();
        let path = temp_path("hidden.bslt");
        let mut options = base_options(path.clone(), 2 * 1024 * 1024);
        options.hidden_size = Some(512 * 1024);
        options.hidden_password = Some(Password::from_str("hidden password").unwrap());
        create_volume(options, None, &mut |_, _| {}).unwrap();

        // Outer password mounts the outer volume.
        let outer = Volume::open(OpenOptions::new(
            &path,
            Password::from_str("creation password").unwrap(),
        ))
        .unwrap();
        assert!(!outer.is_hidden());
        drop(outer);

        // Hidden password mounts the hidden volume. The KDF hint keeps the
        // failing outer-position candidates cheap.
        let mut hidden_options =
            OpenOptions::new(&path, Password::from_str("hidden password").unwrap());
        hidden_options.kdf = Some(Kdf::Pbkdf2Sha512Legacy);
        let mut hidden = Volume::open(hidden_options).unwrap();
        assert!(hidden.is_hidden());
        assert_eq!(hidden.size(), 512 * 1024);
        let mut device = VolumeDevice::new({
            hidden.write_sectors(0, &[3u8; 512]).unwrap();
            hidden
        });
        assert_eq!(device.size(), 512 * 1024);
    }

    #[test]
    fn hidden_protection_blocks_overlapping_writes() {
        rng::start().unwrap();
        let path = temp_path("protected.bslt");
        let mut options = base_options(path.clone(), 2 * 1024 * 1024);
        options.hidden_size = Some(512 * 1024);
        options.hidden_password = Some(Password::from_str("hidden password").unwrap());
        create_volume(options, None, &mut |_, _| {}).unwrap();

        // Capture the hidden volume's current first sector.
        let mut hidden_options =
            OpenOptions::new(&path, Password::from_str("hidden password").unwrap());
        hidden_options.kdf = Some(Kdf::Pbkdf2Sha512Legacy);
        let mut hidden = Volume::open(hidden_options).unwrap();
        hidden.write_sectors(0, &[0x77u8; 512]).unwrap();
        drop(hidden);

        // Mount the outer volume with protection.
        let mut outer = Volume::open(OpenOptions {
            path: path.clone(),
            password: Password::from_str("creation password").unwrap(),
            keyfiles: Vec::new(),
            read_only: false,
            preserve_timestamps: false,
            use_backup_headers: false,
            protection: Protection::HiddenVolume {
                password: Password::from_str("hidden password").unwrap(),
                keyfiles: Vec::new(),
            },
            kdf: None,
        })
        .unwrap();
        assert!(outer.protection_active());

        // A write near the start of the outer area is fine.
        outer.write_sectors(0, &[1u8; 512]).unwrap();

        // A write into the hidden range must be blocked.
        let outer_size = outer.size();
        let err = outer
            .write_sectors(outer_size - 512, &[2u8; 512])
            .unwrap_err();
        assert!(matches!(err, Error::VolumeProtected));
        drop(outer);

        // Hidden data is untouched.
        let mut reopen_options =
            OpenOptions::new(&path, Password::from_str("hidden password").unwrap());
        reopen_options.kdf = Some(Kdf::Pbkdf2Sha512Legacy);
        let mut hidden = Volume::open(reopen_options).unwrap();
        let mut buf = [0u8; 512];
        hidden.read_sectors(0, &mut buf).unwrap();
        assert_eq!(buf, [0x77u8; 512]);
    }
}
