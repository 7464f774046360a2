//! Static table of volume layouts.
//!
//! A layout is a pure value describing where header sectors live, which
//! magic tags and KDFs a header found there may use, and where the data
//! area sits. Layouts are probed in table order when opening a volume;
//! a `Volume` holds a `&'static` reference to the matching row.

use crate::crypto::EncryptionAlgorithm;
use crate::error::{Error, Result};
use crate::header::{HeaderMagic, HEADER_SECTOR_SIZE};
use crate::kdf::{Kdf, LEGACY_ORDER, OPEN_ORDER};

/// V2 header group: 128 KiB at the start and again at the end of the file.
pub const V2_HEADER_GROUP_SIZE: u64 = 131_072;

/// Offset of the hidden header sector within a V2 header group.
pub const V2_HIDDEN_HEADER_OFFSET: u64 = 65_536;

/// V1 reserves a single header sector at the start of the file.
pub const V1_HEADER_SIZE: u64 = 512;

/// V1 hidden header: a fixed distance from the end of the file.
pub const V1_HIDDEN_HEADER_OFFSET_FROM_END: u64 = 1_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    V1Normal,
    V1Hidden,
    V2Normal,
    V2Hidden,
}

pub struct VolumeLayout {
    pub kind: LayoutKind,
    /// Header sector position; negative counts from the end of the file.
    header_offset: i64,
    /// Backup header sector position (V2 only); negative from the end.
    backup_header_offset: Option<i64>,
    pub hidden: bool,
    magics: &'static [HeaderMagic],
    kdfs: &'static [Kdf],
}

/// Probe order: the modern layouts first, then the legacy ones.
pub static LAYOUTS: [VolumeLayout; 4] = [
    VolumeLayout {
        kind: LayoutKind::V2Normal,
        header_offset: 0,
        backup_header_offset: Some(-(V2_HEADER_GROUP_SIZE as i64)),
        hidden: false,
        magics: &[HeaderMagic::Bslt, HeaderMagic::True, HeaderMagic::Vera],
        kdfs: &OPEN_ORDER,
    },
    VolumeLayout {
        kind: LayoutKind::V2Hidden,
        header_offset: V2_HIDDEN_HEADER_OFFSET as i64,
        backup_header_offset: Some(-(V2_HIDDEN_HEADER_OFFSET as i64)),
        hidden: true,
        magics: &[HeaderMagic::Bslt, HeaderMagic::True, HeaderMagic::Vera],
        kdfs: &OPEN_ORDER,
    },
    VolumeLayout {
        kind: LayoutKind::V1Normal,
        header_offset: 0,
        backup_header_offset: None,
        hidden: false,
        magics: &[HeaderMagic::True],
        kdfs: &LEGACY_ORDER,
    },
    VolumeLayout {
        kind: LayoutKind::V1Hidden,
        header_offset: -(V1_HIDDEN_HEADER_OFFSET_FROM_END as i64),
        backup_header_offset: None,
        hidden: true,
        magics: &[HeaderMagic::True],
        kdfs: &LEGACY_ORDER,
    },
];

impl VolumeLayout {
    pub fn find(kind: LayoutKind) -> &'static VolumeLayout {
        LAYOUTS
            .iter()
            .find(|l| l.kind == kind)
            .expect("layout table covers every kind")
    }

    pub fn magics(&self) -> &'static [HeaderMagic] {
        self.magics
    }

    pub fn kdfs(&self) -> &'static [Kdf] {
        self.kdfs
    }

    /// Every layout supports the full cipher set.
    pub fn algorithms(&self) -> &'static [EncryptionAlgorithm] {
        EncryptionAlgorithm::all()
    }

    pub fn is_v2(&self) -> bool {
        matches!(self.kind, LayoutKind::V2Normal | LayoutKind::V2Hidden)
    }

    fn resolve(offset: i64, file_size: u64) -> Result<u64> {
        let abs = if offset >= 0 {
            offset as u64
        } else {
            file_size
                .checked_sub(offset.unsigned_abs())
                .ok_or(Error::ParameterIncorrect("volume smaller than layout"))?
        };
        if abs + HEADER_SECTOR_SIZE as u64 > file_size {
            return Err(Error::ParameterIncorrect("volume smaller than layout"));
        }
        Ok(abs)
    }

    /// Absolute byte offset of the header sector.
    pub fn header_position(&self, file_size: u64) -> Result<u64> {
        Self::resolve(self.header_offset, file_size)
    }

    /// Absolute byte offset of the backup header sector, if the layout
    /// carries one.
    pub fn backup_header_position(&self, file_size: u64) -> Option<u64> {
        self.backup_header_offset
            .and_then(|off| Self::resolve(off, file_size).ok())
    }

    /// Smallest file this layout fits in (header areas plus one sector of
    /// data).
    pub fn min_volume_size(&self, sector_size: u32) -> u64 {
        if self.is_v2() {
            2 * V2_HEADER_GROUP_SIZE + sector_size as u64
        } else {
            V1_HEADER_SIZE + sector_size as u64
        }
    }

    /// Data area for a new normal volume of `file_size` bytes.
    pub fn data_area_for_creation(&self, file_size: u64) -> Result<(u64, u64)> {
        match self.kind {
            LayoutKind::V2Normal => {
                let reserved = 2 * V2_HEADER_GROUP_SIZE;
                let length = file_size
                    .checked_sub(reserved)
                    .ok_or(Error::ParameterIncorrect("volume too small"))?;
                Ok((V2_HEADER_GROUP_SIZE, length))
            }
            LayoutKind::V1Normal => {
                let length = file_size
                    .checked_sub(V1_HEADER_SIZE)
                    .ok_or(Error::ParameterIncorrect("volume too small"))?;
                Ok((V1_HEADER_SIZE, length))
            }
            // Hidden data areas are sized by the caller; see
            // `hidden_data_area`.
            _ => Err(Error::ParameterIncorrect(
                "hidden layout has no default data area",
            )),
        }
    }

    /// Data area for a hidden volume of `hidden_size` bytes inside an outer
    /// volume of `file_size` bytes: the last `hidden_size` bytes of the
    /// outer data area.
    pub fn hidden_data_area(&self, file_size: u64, hidden_size: u64) -> Result<(u64, u64)> {
        let outer_end = if self.is_v2() {
            file_size
                .checked_sub(V2_HEADER_GROUP_SIZE)
                .ok_or(Error::ParameterIncorrect("volume too small"))?
        } else {
            file_size
                .checked_sub(V1_HIDDEN_HEADER_OFFSET_FROM_END)
                .ok_or(Error::ParameterIncorrect("volume too small"))?
        };
        let start = outer_end
            .checked_sub(hidden_size)
            .ok_or(Error::ParameterIncorrect("hidden volume too large"))?;
        Ok((start, hidden_size))
    }
}
