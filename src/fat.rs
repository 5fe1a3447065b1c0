// FAT bootstrap filesystem, emitted through the encrypted sector stream.
//
// Geometry follows the Microsoft FAT specification: the FAT variant is
// whatever the final cluster count dictates (< 4085 clusters is FAT12,
// < 65525 is FAT16, anything above is FAT32), and the FAT size is solved
// by fixpoint iteration since it feeds back into the cluster count.

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::CryptoContext;
use crate::format::FormatError;
use crate::layout::MAX_FAT_SECTOR_COUNT;
use crate::rng::EntropySource;
use crate::writer::SectorWriter;

pub const VOLUME_LABEL: &[u8; 11] = b"NO NAME    ";

const FAT12_MAX_CLUSTERS: u64 = 4085;
const FAT16_MAX_CLUSTERS: u64 = 65525;
const MAX_CLUSTER_BYTES: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    fn label(self) -> &'static [u8; 8] {
        match self {
            FatType::Fat12 => b"FAT12   ",
            FatType::Fat16 => b"FAT16   ",
            FatType::Fat32 => b"FAT32   ",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FatParams {
    pub fat_type: FatType,
    pub sector_size: u32,
    pub num_sectors: u32,
    // sectors per cluster
    pub cluster_size: u32,
    pub reserved: u32,
    pub fat_count: u32,
    // sectors per FAT copy
    pub fat_length: u32,
    pub root_entries: u32,
    pub root_dir_sectors: u32,
    pub cluster_count: u32,
    pub volume_name: [u8; 11],
}

impl FatParams {
    pub fn compute(
        num_sectors: u64,
        sector_size: u32,
        requested_cluster: u32,
    ) -> Result<FatParams, FormatError> {
        if num_sectors > MAX_FAT_SECTOR_COUNT || num_sectors < 64 {
            return Err(FormatError::VolSizeWrong);
        }

        let volume_bytes = num_sectors * sector_size as u64;

        const MIB: u64 = 1024 * 1024;
        const GIB: u64 = 1024 * MIB;

        let mut cluster = if requested_cluster != 0 {
            if !requested_cluster.is_power_of_two() || requested_cluster > 128 {
                return Err(FormatError::ParameterIncorrect);
            }
            requested_cluster
        } else if volume_bytes >= 256 * GIB {
            256
        } else if volume_bytes >= 64 * GIB {
            128
        } else if volume_bytes >= 16 * GIB {
            64
        } else if volume_bytes >= 8 * GIB {
            32
        } else if volume_bytes > 266 * MIB {
            16
        } else if volume_bytes > 133 * MIB {
            8
        } else if volume_bytes > 66 * MIB {
            4
        } else if volume_bytes > 33 * MIB {
            2
        } else {
            1
        };

        // a cluster may not exceed 64 KiB
        while cluster > 1 && cluster * sector_size > MAX_CLUSTER_BYTES {
            cluster /= 2;
        }
        cluster = cluster.clamp(1, 128);

        let mut fat_type = match num_sectors / cluster as u64 {
            n if n < FAT12_MAX_CLUSTERS => FatType::Fat12,
            n if n < FAT16_MAX_CLUSTERS => FatType::Fat16,
            _ => FatType::Fat32,
        };

        let mut fat_length;
        let mut cluster_count;
        let mut reserved;
        let mut root_entries;
        let mut root_dir_sectors;

        // The FAT variant decides the reserved-area shape, which shifts the
        // cluster count, which can shift the variant back. Converges in a
        // couple of rounds.
        let mut rounds = 0;
        loop {
            let (res, entries) = match fat_type {
                FatType::Fat32 => (32u32, 0u32),
                _ => (1, 512),
            };
            reserved = res;
            root_entries = entries;
            root_dir_sectors = root_entries * 32 / sector_size;

            fat_length = 1;
            for _ in 0..8 {
                let system = reserved as u64 + 2 * fat_length + root_dir_sectors as u64;
                if system >= num_sectors {
                    return Err(FormatError::VolSizeWrong);
                }
                let clusters = (num_sectors - system) / cluster as u64;
                let fat_bytes = match fat_type {
                    FatType::Fat12 => ((clusters + 2) * 3 + 1) / 2,
                    FatType::Fat16 => (clusters + 2) * 2,
                    FatType::Fat32 => (clusters + 2) * 4,
                };
                let needed = fat_bytes.div_ceil(sector_size as u64);
                if needed == fat_length {
                    break;
                }
                fat_length = needed;
            }

            let system = reserved as u64 + 2 * fat_length + root_dir_sectors as u64;
            cluster_count = (num_sectors - system) / cluster as u64;

            let settled = match fat_type {
                FatType::Fat12 if cluster_count >= FAT12_MAX_CLUSTERS => {
                    fat_type = FatType::Fat16;
                    false
                }
                FatType::Fat16 if cluster_count >= FAT16_MAX_CLUSTERS => {
                    fat_type = FatType::Fat32;
                    false
                }
                FatType::Fat16 if cluster_count < FAT12_MAX_CLUSTERS => {
                    fat_type = FatType::Fat12;
                    false
                }
                FatType::Fat32 if cluster_count < FAT16_MAX_CLUSTERS => {
                    fat_type = FatType::Fat16;
                    false
                }
                _ => true,
            };

            rounds += 1;
            if settled || rounds >= 4 {
                break;
            }
        }

        if cluster_count == 0 {
            return Err(FormatError::VolSizeWrong);
        }

        // FAT32 keeps its root directory in the first data cluster
        if fat_type == FatType::Fat32 {
            let system =
                reserved as u64 + 2 * fat_length + root_dir_sectors as u64 + cluster as u64;
            if system > num_sectors {
                return Err(FormatError::VolSizeWrong);
            }
        }

        Ok(FatParams {
            fat_type,
            sector_size,
            num_sectors: num_sectors as u32,
            cluster_size: cluster,
            reserved,
            fat_count: 2,
            fat_length: fat_length as u32,
            root_entries,
            root_dir_sectors,
            cluster_count: cluster_count as u32,
            volume_name: *VOLUME_LABEL,
        })
    }

    // Sectors occupied by the boot area, the FATs and the root directory.
    pub fn system_sectors(&self) -> u64 {
        let root = match self.fat_type {
            FatType::Fat32 => self.cluster_size,
            _ => self.root_dir_sectors,
        };
        self.reserved as u64 + (self.fat_count * self.fat_length) as u64 + root as u64
    }
}

fn build_boot_sector(ft: &FatParams, volume_id: u32) -> Vec<u8> {
    let mut s = vec![0u8; ft.sector_size as usize];

    s[0] = 0xeb;
    s[1] = if ft.fat_type == FatType::Fat32 { 0x58 } else { 0x3c };
    s[2] = 0x90;
    s[3..11].copy_from_slice(b"MSDOS5.0");

    LittleEndian::write_u16(&mut s[11..13], ft.sector_size as u16);
    s[13] = ft.cluster_size as u8;
    LittleEndian::write_u16(&mut s[14..16], ft.reserved as u16);
    s[16] = ft.fat_count as u8;
    LittleEndian::write_u16(&mut s[17..19], ft.root_entries as u16);
    if ft.fat_type != FatType::Fat32 && ft.num_sectors < 0x10000 {
        LittleEndian::write_u16(&mut s[19..21], ft.num_sectors as u16);
    } else {
        LittleEndian::write_u32(&mut s[32..36], ft.num_sectors);
    }
    s[21] = 0xf8;
    if ft.fat_type != FatType::Fat32 {
        LittleEndian::write_u16(&mut s[22..24], ft.fat_length as u16);
    }
    LittleEndian::write_u16(&mut s[24..26], 32); // sectors per track
    LittleEndian::write_u16(&mut s[26..28], 64); // heads

    match ft.fat_type {
        FatType::Fat32 => {
            LittleEndian::write_u32(&mut s[36..40], ft.fat_length);
            // ext flags, fs version: zero (mirrored FATs)
            LittleEndian::write_u32(&mut s[44..48], 2); // root cluster
            LittleEndian::write_u16(&mut s[48..50], 1); // FSInfo sector
            LittleEndian::write_u16(&mut s[50..52], 6); // backup boot sector
            s[64] = 0x80;
            s[66] = 0x29;
            LittleEndian::write_u32(&mut s[67..71], volume_id);
            s[71..82].copy_from_slice(&ft.volume_name);
            s[82..90].copy_from_slice(ft.fat_type.label());
        }
        _ => {
            s[36] = 0x80;
            s[38] = 0x29;
            LittleEndian::write_u32(&mut s[39..43], volume_id);
            s[43..54].copy_from_slice(&ft.volume_name);
            s[54..62].copy_from_slice(ft.fat_type.label());
        }
    }

    s[510] = 0x55;
    s[511] = 0xaa;
    s
}

fn build_fsinfo(ft: &FatParams) -> Vec<u8> {
    let mut s = vec![0u8; ft.sector_size as usize];
    LittleEndian::write_u32(&mut s[0..4], 0x4161_5252);
    LittleEndian::write_u32(&mut s[484..488], 0x6141_7272);
    LittleEndian::write_u32(&mut s[488..492], ft.cluster_count - 1); // root takes one
    LittleEndian::write_u32(&mut s[492..496], 3);
    LittleEndian::write_u32(&mut s[508..512], 0xaa55_0000);
    s
}

// Emit the filesystem image sector by sector. A quick format stops after
// the system area; a full format keeps writing zero sectors (under the
// real volume key, so the mounted filesystem reads them back as free
// space) to the end of the data area.
pub fn format_fat(
    writer: &mut SectorWriter<'_, '_>,
    ctx: &CryptoContext,
    rng: &mut dyn EntropySource,
    ft: &FatParams,
    quick: bool,
) -> Result<(), FormatError> {
    let mut id = [0u8; 4];
    rng.fill(&mut id, false)?;
    let volume_id = LittleEndian::read_u32(&id);

    let boot = build_boot_sector(ft, volume_id);
    let zero = vec![0u8; ft.sector_size as usize];

    writer.write_sector(ctx, &boot)?;
    if ft.fat_type == FatType::Fat32 {
        let fsinfo = build_fsinfo(ft);
        for sec in 1..ft.reserved {
            match sec {
                1 => writer.write_sector(ctx, &fsinfo)?,
                6 => writer.write_sector(ctx, &boot)?,
                7 => writer.write_sector(ctx, &fsinfo)?,
                _ => writer.write_sector(ctx, &zero)?,
            }
        }
    } else {
        for _ in 1..ft.reserved {
            writer.write_sector(ctx, &zero)?;
        }
    }

    // FAT copies: media descriptor entry, end-of-chain markers, and for
    // FAT32 the root directory chain terminator
    let mut fat_first = vec![0u8; ft.sector_size as usize];
    match ft.fat_type {
        FatType::Fat12 => fat_first[0..3].copy_from_slice(&[0xf8, 0xff, 0xff]),
        FatType::Fat16 => fat_first[0..4].copy_from_slice(&[0xf8, 0xff, 0xff, 0xff]),
        FatType::Fat32 => fat_first[0..12].copy_from_slice(&[
            0xf8, 0xff, 0xff, 0x0f, //
            0xff, 0xff, 0xff, 0x0f, //
            0xff, 0xff, 0xff, 0x0f,
        ]),
    }
    for _ in 0..ft.fat_count {
        writer.write_sector(ctx, &fat_first)?;
        for _ in 1..ft.fat_length {
            writer.write_sector(ctx, &zero)?;
        }
    }

    // root directory: fixed area for FAT12/16, the first data cluster for FAT32
    let root_sectors = match ft.fat_type {
        FatType::Fat32 => ft.cluster_size,
        _ => ft.root_dir_sectors,
    };
    for _ in 0..root_sectors {
        writer.write_sector(ctx, &zero)?;
    }

    let remaining = ft.num_sectors as u64 - ft.system_sectors();
    if quick {
        writer.flush(ctx)?;
        writer.skip_sectors(remaining);
    } else {
        for _ in 0..remaining {
            writer.write_sector(ctx, &zero)?;
        }
    }
    Ok(())
}
