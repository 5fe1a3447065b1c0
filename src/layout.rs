// Volume layout: fixed on-disk constants and the derived offsets for
// standard and hidden containers.
//
// A container is laid out as:
//   [header group][data area][header group]
// where each header group holds a primary (or backup) header slot plus a
// hidden-volume header slot. A hidden volume lives near the end of its
// host container; its header sits in the host's hidden slot and its data
// area ends just before the host's trailing header group.

use crate::format::FormatError;

pub const SECTOR_SIZE_MIN: u32 = 512;
pub const SECTOR_SIZE_MAX: u32 = 4096;

// The cipher always operates on 512-byte units, independent of the host
// sector size. XTS tweaks count these units from byte 0 of the container.
pub const DATA_UNIT_SIZE: u32 = 512;

pub const HEADER_SIZE: u64 = 64 * 1024;
pub const HEADER_EFFECTIVE_SIZE: usize = 512;
pub const HEADER_GROUP_SIZE: u64 = 2 * HEADER_SIZE;
pub const TOTAL_HEADERS_SIZE: u64 = 4 * HEADER_SIZE;

pub const DATA_OFFSET: u64 = HEADER_GROUP_SIZE;
pub const HIDDEN_HEADER_OFFSET: u64 = HEADER_SIZE;

pub const SALT_SIZE: usize = 64;
pub const MASTER_KEYDATA_SIZE: usize = 256;

// Reserved tail of a hidden volume's data area. The host filesystem may
// touch its very last sector (FAT marks it free with zeroes), which must
// not land inside the hidden data area. Above the threshold the reserve
// is a multiple of the maximum supported sector size.
pub const SMALL_VOLUME_THRESHOLD: u64 = 2 * 1024 * 1024;
pub const HIDDEN_HOST_RESERVED_END: u64 = 4096;
pub const HIDDEN_HOST_RESERVED_END_HIGH: u64 = 4 * SECTOR_SIZE_MAX as u64;

pub const MIN_HIDDEN_HOST_SIZE: u64 = 2 * HEADER_GROUP_SIZE + SECTOR_SIZE_MIN as u64;
pub const MAX_VOLUME_SIZE: u64 = 1 << 50;

pub const MAX_FAT_SECTOR_COUNT: u64 = 0xFFFF_FFFF;

pub const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

// Size of the encrypted data area once the reserved regions are taken out.
// Returns 0 when the volume is too small to hold them.
pub fn data_area_size(hidden: bool, volume_size: u64) -> u64 {
    let reserved = if hidden {
        if volume_size < SMALL_VOLUME_THRESHOLD {
            HIDDEN_HOST_RESERVED_END
        } else {
            HIDDEN_HOST_RESERVED_END_HIGH
        }
    } else {
        TOTAL_HEADERS_SIZE
    };

    volume_size.saturating_sub(reserved)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeLayout {
    pub sector_size: u32,
    pub data_offset: u64,
    pub data_area_size: u64,
    pub num_sectors: u64,
    pub start_sector: u64,
    pub primary_header_offset: u64,
    pub backup_header_offset: u64,
}

impl VolumeLayout {
    // Pure function of the requested geometry. `hidden_host_size` is Some
    // for a hidden volume, carrying the size of the existing host container;
    // `size` is then the inner volume size.
    pub fn compute(
        size: u64,
        hidden_host_size: Option<u64>,
        sector_size: u32,
    ) -> Result<VolumeLayout, FormatError> {
        if sector_size < SECTOR_SIZE_MIN
            || sector_size > SECTOR_SIZE_MAX
            || !sector_size.is_power_of_two()
            || sector_size % DATA_UNIT_SIZE != 0
        {
            return Err(FormatError::SectorSizeUnsupported);
        }

        if size == 0 || size > MAX_VOLUME_SIZE || size % sector_size as u64 != 0 {
            return Err(FormatError::VolSizeWrong);
        }

        let hidden = hidden_host_size.is_some();

        let data_offset = match hidden_host_size {
            Some(host_size) => {
                if host_size < MIN_HIDDEN_HOST_SIZE || host_size > MAX_VOLUME_SIZE {
                    return Err(FormatError::VolSizeWrong);
                }

                let offset = host_size
                    .checked_sub(HEADER_GROUP_SIZE)
                    .and_then(|o| o.checked_sub(size))
                    .ok_or(FormatError::VolSizeWrong)?;

                // The hidden data area must not reach into the host's own
                // header group, and must start on a sector boundary.
                if offset < DATA_OFFSET || offset % sector_size as u64 != 0 {
                    return Err(FormatError::VolSizeWrong);
                }

                offset
            }
            None => {
                if size <= TOTAL_HEADERS_SIZE {
                    return Err(FormatError::VolSizeWrong);
                }

                DATA_OFFSET
            }
        };

        let data_area_size = data_area_size(hidden, size);
        let num_sectors = data_area_size / sector_size as u64;

        if num_sectors == 0 {
            return Err(FormatError::VolSizeWrong);
        }

        let backup_header_offset = match hidden_host_size {
            Some(host_size) => host_size - HIDDEN_HEADER_OFFSET,
            None => data_area_size + HEADER_GROUP_SIZE,
        };

        Ok(VolumeLayout {
            sector_size,
            data_offset,
            data_area_size,
            num_sectors,
            start_sector: data_offset / sector_size as u64,
            primary_header_offset: if hidden { HIDDEN_HEADER_OFFSET } else { 0 },
            backup_header_offset,
        })
    }
}
