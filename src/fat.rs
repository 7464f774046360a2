//! Minimal FAT32 formatter for freshly created volumes.
//!
//! Writes boot sector, FSInfo, backup boot sector, the two FAT tables and
//! an empty root directory through the supplied writer (which is expected
//! to be the decrypted view of the volume's data area). The layout follows
//! the Microsoft FAT32 specification.

use std::io::{self, Seek, SeekFrom, Write};

use byteorder::{ByteOrder, LittleEndian};

const SECTOR_SIZE: u64 = 512;
const RESERVED_SECTORS: u64 = 32;
const FAT_COUNT: u64 = 2;
const SECTORS_PER_CLUSTER: u64 = 8;

/// Format `volume_size` bytes behind `writer` as FAT32.
pub fn format_fat<W: Write + Seek>(
    writer: &mut W,
    volume_size: u64,
    volume_id: u32,
) -> io::Result<()> {
    let total_sectors = volume_size / SECTOR_SIZE;
    if total_sectors <= RESERVED_SECTORS + 16 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "volume too small for FAT",
        ));
    }

    let cluster_size = SECTORS_PER_CLUSTER * SECTOR_SIZE;
    let approx_clusters = (total_sectors - RESERVED_SECTORS) / SECTORS_PER_CLUSTER;
    let fat_size_bytes = approx_clusters * 4;
    let fat_sectors = fat_size_bytes.div_ceil(SECTOR_SIZE);

    // Boot sector.
    let mut boot = [0u8; 512];
    boot[0] = 0xEB;
    boot[1] = 0x58;
    boot[2] = 0x90;
    boot[3..11].copy_from_slice(b"MSDOS5.0");
    LittleEndian::write_u16(&mut boot[11..13], SECTOR_SIZE as u16);
    boot[13] = SECTORS_PER_CLUSTER as u8;
    LittleEndian::write_u16(&mut boot[14..16], RESERVED_SECTORS as u16);
    boot[16] = FAT_COUNT as u8;
    // Root entries and 16-bit totals stay zero for FAT32.
    boot[21] = 0xF8;
    LittleEndian::write_u16(&mut boot[24..26], 32);
    LittleEndian::write_u16(&mut boot[26..28], 64);
    LittleEndian::write_u32(&mut boot[32..36], total_sectors as u32);
    LittleEndian::write_u32(&mut boot[36..40], fat_sectors as u32);
    LittleEndian::write_u32(&mut boot[44..48], 2); // root cluster
    LittleEndian::write_u16(&mut boot[48..50], 1); // FSInfo sector
    LittleEndian::write_u16(&mut boot[50..52], 6); // backup boot sector
    boot[64] = 0x80;
    boot[66] = 0x29;
    LittleEndian::write_u32(&mut boot[67..71], volume_id);
    boot[71..82].copy_from_slice(b"BASALT     ");
    boot[82..90].copy_from_slice(b"FAT32   ");
    boot[510] = 0x55;
    boot[511] = 0xAA;

    writer.seek(SeekFrom::Start(0))?;
    writer.write_all(&boot)?;

    // FSInfo sector.
    let mut fs_info = [0u8; 512];
    LittleEndian::write_u32(&mut fs_info[0..4], 0x4161_5252);
    LittleEndian::write_u32(&mut fs_info[484..488], 0x6141_7272);
    LittleEndian::write_u32(&mut fs_info[488..492], 0xFFFF_FFFF);
    LittleEndian::write_u32(&mut fs_info[492..496], 2);
    LittleEndian::write_u32(&mut fs_info[508..512], 0xAA55_0000);
    writer.write_all(&fs_info)?;

    // Backup boot sector at sector 6.
    writer.seek(SeekFrom::Start(6 * SECTOR_SIZE))?;
    writer.write_all(&boot)?;

    // Both FAT tables: media descriptor, end-of-chain marks, root chain end.
    let mut fat_head = [0u8; 12];
    fat_head[0..4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0x0F]);
    fat_head[4..8].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0x0F]);
    fat_head[8..12].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0x0F]);

    let zeros = [0u8; 4096];
    for table in 0..FAT_COUNT {
        let offset = (RESERVED_SECTORS + table * fat_sectors) * SECTOR_SIZE;
        writer.seek(SeekFrom::Start(offset))?;
        writer.write_all(&fat_head)?;
        let mut remaining = fat_sectors * SECTOR_SIZE - fat_head.len() as u64;
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            writer.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
    }

    // Empty root directory in cluster 2.
    let root_offset = (RESERVED_SECTORS + FAT_COUNT * fat_sectors) * SECTOR_SIZE;
    writer.seek(SeekFrom::Start(root_offset))?;
    let mut remaining = cluster_size;
    while remaining > 0 {
        let n = remaining.min(zeros.len() as u64) as usize;
        writer.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }

    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn boot_sector_structure() {
        let size = 8 * 1024 * 1024u64;
        let mut image = Cursor::new(vec![0u8; size as usize]);
        format_fat(&mut image, size, 0x1234_5678).unwrap();

        let data = image.into_inner();
        // Signature, OEM name, sector size, FAT32 tag.
        assert_eq!(&data[510..512], &[0x55, 0xAA]);
        assert_eq!(&data[3..11], b"MSDOS5.0");
        assert_eq!(LittleEndian::read_u16(&data[11..13]), 512);
        assert_eq!(&data[82..90], b"FAT32   ");
        // Backup boot sector matches the primary.
        assert_eq!(&data[..512], &data[6 * 512..7 * 512]);
        // FSInfo signatures.
        assert_eq!(LittleEndian::read_u32(&data[512..516]), 0x4161_5252);
        // FAT media descriptor entry.
        let fat0 = (RESERVED_SECTORS * SECTOR_SIZE) as usize;
        assert_eq!(&data[fat0..fat0 + 4], &[0xF8, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn tiny_volume_rejected() {
        let mut image = Cursor::new(vec![0u8; 4096]);
        assert!(format_fat(&mut image, 4096, 0).is_err());
    }
}
