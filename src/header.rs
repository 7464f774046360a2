//! Volume header binary format.
//!
//! A header sector is 512 bytes on disk: a 64-byte plaintext salt followed
//! by 448 bytes of XTS-encrypted header data (tweak 0). All multi-byte
//! integers are big-endian. Decrypted layout:
//!
//! ```text
//! offset size field
//!      0    4 magic ("BSLT", "TRUE" or "VERA")
//!      4    2 format version
//!      6    2 minimum required reader version
//!      8    4 CRC32 over the master-key area
//!     12    8 volume creation time (100 ns ticks)
//!     20    8 header creation time (100 ns ticks)
//!     28    8 hidden volume size (0 for outer/normal)
//!     36    8 volume size
//!     44    8 data area start offset (relative to volume start)
//!     52    8 data area length
//!     60    4 header flags (reserved)
//!     64    4 sector size
//!     68    4 CRC32 over bytes 0..68
//!     72  256 master-key area
//!    328  120 zero padding
//! ```
//!
//! The magic plus the two CRC32s are the positive validator during trial
//! decryption: a wrong key, KDF or cipher candidate fails the magic check
//! with overwhelming probability.

use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use zeroize::Zeroizing;

use crate::crypto::EncryptionAlgorithm;
use crate::error::{Error, Result};

/// Salt bytes preceding the encrypted header on disk.
pub const SALT_SIZE: usize = 64;

/// Encrypted header payload size.
pub const ENCRYPTED_HEADER_SIZE: usize = 448;

/// Whole header sector: salt + encrypted payload.
pub const HEADER_SECTOR_SIZE: usize = SALT_SIZE + ENCRYPTED_HEADER_SIZE;

/// Offset and size of the master-key area within the decrypted payload.
pub const KEY_AREA_OFFSET: usize = 72;
pub const KEY_AREA_SIZE: usize = 256;

/// Range covered by the header-fields CRC32.
const FIELDS_CRC_END: usize = 68;

/// Current on-disk format version (the V2 layout family).
pub const FORMAT_VERSION: u16 = 2;

/// Oldest format version this reader understands.
pub const MIN_FORMAT_VERSION: u16 = 1;

/// Highest `min_reader_version` this implementation satisfies.
pub const READER_VERSION: u16 = 2;

/// 100-ns ticks between the tick epoch (1601-01-01) and the Unix epoch.
const TICKS_TO_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMagic {
    /// This implementation's native tag. The only tag the writer emits.
    Bslt,
    /// TrueCrypt 7.1a.
    True,
    /// VeraCrypt.
    Vera,
}

impl HeaderMagic {
    pub fn bytes(&self) -> &'static [u8; 4] {
        match self {
            HeaderMagic::Bslt => b"BSLT",
            HeaderMagic::True => b"TRUE",
            HeaderMagic::Vera => b"VERA",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<HeaderMagic> {
        match bytes {
            b"BSLT" => Some(HeaderMagic::Bslt),
            b"TRUE" => Some(HeaderMagic::True),
            b"VERA" => Some(HeaderMagic::Vera),
            _ => None,
        }
    }
}

/// Why a decrypted candidate was rejected. `WrongMagic` keeps the trial
/// loop going; the others mean the key was right but the header is not
/// usable, which callers surface as `VolumeFormatBad`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRejected {
    WrongMagic,
    BadFieldsCrc,
    BadKeyAreaCrc,
    BadFieldValue,
    UnsupportedReaderVersion,
}

/// Decrypted header view. The master-key area wipes itself on drop.
#[derive(Clone)]
pub struct VolumeHeader {
    pub magic: HeaderMagic,
    pub version: u16,
    pub min_reader_version: u16,
    pub volume_creation_time: u64,
    pub header_creation_time: u64,
    pub hidden_volume_size: u64,
    pub volume_size: u64,
    pub data_area_offset: u64,
    pub data_area_length: u64,
    pub flags: u32,
    pub sector_size: u32,
    master_key: Zeroizing<[u8; KEY_AREA_SIZE]>,
}

impl std::fmt::Debug for VolumeHeader {
    /// Manual impl: `master_key` must never be formatted, so this
    /// deliberately omits it rather than deriving.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeHeader")
            .field("magic", &self.magic)
            .field("version", &self.version)
            .field("min_reader_version", &self.min_reader_version)
            .field("volume_creation_time", &self.volume_creation_time)
            .field("header_creation_time", &self.header_creation_time)
            .field("hidden_volume_size", &self.hidden_volume_size)
            .field("volume_size", &self.volume_size)
            .field("data_area_offset", &self.data_area_offset)
            .field("data_area_length", &self.data_area_length)
            .field("flags", &self.flags)
            .field("sector_size", &self.sector_size)
            .finish_non_exhaustive()
    }
}

impl VolumeHeader {
    /// Assemble a fresh header for volume creation. `master_key` carries the
    /// cascade's key material; the rest of the key area is zero.
    pub fn new(
        volume_size: u64,
        data_area_offset: u64,
        data_area_length: u64,
        hidden_volume_size: u64,
        sector_size: u32,
        master_key: &[u8],
    ) -> Result<VolumeHeader> {
        if master_key.len() > KEY_AREA_SIZE {
            return Err(Error::ParameterIncorrect("master key exceeds key area"));
        }
        validate_sector_size(sector_size)?;

        let now = now_ticks();
        let mut key_area = Zeroizing::new([0u8; KEY_AREA_SIZE]);
        key_area[..master_key.len()].copy_from_slice(master_key);

        Ok(VolumeHeader {
            magic: HeaderMagic::Bslt,
            version: FORMAT_VERSION,
            min_reader_version: FORMAT_VERSION,
            volume_creation_time: now,
            header_creation_time: now,
            hidden_volume_size,
            volume_size,
            data_area_offset,
            data_area_length,
            flags: 0,
            sector_size,
            master_key: key_area,
        })
    }

    /// Parse a decrypted 448-byte payload.
    pub fn deserialize(
        decrypted: &[u8],
        allowed_magics: &[HeaderMagic],
    ) -> std::result::Result<VolumeHeader, HeaderRejected> {
        if decrypted.len() < ENCRYPTED_HEADER_SIZE {
            return Err(HeaderRejected::BadFieldValue);
        }

        let magic = match HeaderMagic::from_bytes(&decrypted[0..4]) {
            Some(m) if allowed_magics.contains(&m) => m,
            _ => return Err(HeaderRejected::WrongMagic),
        };

        // Magic matched: from here every failure is a damaged header, not a
        // wrong-key candidate.
        let stored_fields_crc = BigEndian::read_u32(&decrypted[68..72]);
        if stored_fields_crc != crc32fast::hash(&decrypted[..FIELDS_CRC_END]) {
            return Err(HeaderRejected::BadFieldsCrc);
        }

        let stored_key_crc = BigEndian::read_u32(&decrypted[8..12]);
        let key_area = &decrypted[KEY_AREA_OFFSET..KEY_AREA_OFFSET + KEY_AREA_SIZE];
        if stored_key_crc != crc32fast::hash(key_area) {
            return Err(HeaderRejected::BadKeyAreaCrc);
        }

        let version = BigEndian::read_u16(&decrypted[4..6]);
        let min_reader_version = BigEndian::read_u16(&decrypted[6..8]);
        if version < MIN_FORMAT_VERSION {
            return Err(HeaderRejected::BadFieldValue);
        }
        if min_reader_version > READER_VERSION {
            return Err(HeaderRejected::UnsupportedReaderVersion);
        }

        let sector_size = BigEndian::read_u32(&decrypted[64..68]);
        if validate_sector_size(sector_size).is_err() {
            return Err(HeaderRejected::BadFieldValue);
        }

        let volume_size = BigEndian::read_u64(&decrypted[36..44]);
        let data_area_offset = BigEndian::read_u64(&decrypted[44..52]);
        let data_area_length = BigEndian::read_u64(&decrypted[52..60]);
        let hidden_volume_size = BigEndian::read_u64(&decrypted[28..36]);

        // Structurally impossible geometry is a damaged header.
        if data_area_length == 0
            || data_area_length % sector_size as u64 != 0
            || data_area_offset.checked_add(data_area_length).is_none()
            || hidden_volume_size > data_area_length
        {
            return Err(HeaderRejected::BadFieldValue);
        }

        let mut master_key = Zeroizing::new([0u8; KEY_AREA_SIZE]);
        master_key.copy_from_slice(key_area);

        Ok(VolumeHeader {
            magic,
            version,
            min_reader_version,
            volume_creation_time: BigEndian::read_u64(&decrypted[12..20]),
            header_creation_time: BigEndian::read_u64(&decrypted[20..28]),
            hidden_volume_size,
            volume_size,
            data_area_offset,
            data_area_length,
            flags: BigEndian::read_u32(&decrypted[60..64]),
            sector_size,
            master_key,
        })
    }

    /// Serialise to a 448-byte payload ready for header-key encryption. The
    /// writer always emits the native magic, and both CRC32s are computed
    /// fresh.
    pub fn serialize(&self) -> Zeroizing<[u8; ENCRYPTED_HEADER_SIZE]> {
        let mut out = Zeroizing::new([0u8; ENCRYPTED_HEADER_SIZE]);
        out[0..4].copy_from_slice(HeaderMagic::Bslt.bytes());
        BigEndian::write_u16(&mut out[4..6], self.version);
        BigEndian::write_u16(&mut out[6..8], self.min_reader_version);
        BigEndian::write_u32(&mut out[8..12], crc32fast::hash(&self.master_key[..]));
        BigEndian::write_u64(&mut out[12..20], self.volume_creation_time);
        BigEndian::write_u64(&mut out[20..28], self.header_creation_time);
        BigEndian::write_u64(&mut out[28..36], self.hidden_volume_size);
        BigEndian::write_u64(&mut out[36..44], self.volume_size);
        BigEndian::write_u64(&mut out[44..52], self.data_area_offset);
        BigEndian::write_u64(&mut out[52..60], self.data_area_length);
        BigEndian::write_u32(&mut out[60..64], self.flags);
        BigEndian::write_u32(&mut out[64..68], self.sector_size);
        let fields_crc = crc32fast::hash(&out[..FIELDS_CRC_END]);
        BigEndian::write_u32(&mut out[68..72], fields_crc);
        out[KEY_AREA_OFFSET..KEY_AREA_OFFSET + KEY_AREA_SIZE]
            .copy_from_slice(&self.master_key[..]);
        out
    }

    /// Key material for the given algorithm, sliced from the key area.
    pub fn master_key_for(&self, algorithm: EncryptionAlgorithm) -> &[u8] {
        &self.master_key[..algorithm.key_material_size()]
    }

    /// Touch the header-creation timestamp (used when re-encrypting).
    pub fn refresh_header_time(&mut self) {
        self.header_creation_time = now_ticks();
    }
}

fn validate_sector_size(sector_size: u32) -> Result<()> {
    if !(512..=4096).contains(&sector_size) || !sector_size.is_power_of_two() {
        return Err(Error::ParameterIncorrect("sector size"));
    }
    Ok(())
}

/// Current time in 100-ns ticks since 1601-01-01.
pub fn now_ticks() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| TICKS_TO_UNIX_EPOCH + d.as_secs() * 10_000_000 + u64::from(d.subsec_nanos()) / 100)
        .unwrap_or(TICKS_TO_UNIX_EPOCH)
}
