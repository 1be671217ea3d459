//! Boot-time partition-table allocator.
//!
//! Only used while the partition manager lays out the device; the
//! table is dropped once layout finishes and plays no part in normal
//! post-boot I/O. There are no bad blocks on SD/eMMC, so logical and
//! physical addresses line up except across the boot/user boundary.

use bitflags::bitflags;
use log::{debug, info};

use crate::err::SdError;
use crate::host::SdioHost;
use crate::sdmmc::{PartitionEntry, SdmmcDevice};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PartitionAttributes: u32 {
        /// Allocate what is left after reserving the requested size off
        /// the tail of the device.
        const REMAIN_SIZE = 0x800;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationType {
    /// Next free address after the previous allocation.
    Relative,
    /// Caller-fixed start sector.
    Absolute { start_sector: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// Boot-chain partition, may live in the boot regions.
    Boot,
    /// First data partition and everything after it goes to the user area.
    Data,
}

#[derive(Debug, Clone, Copy)]
pub struct PartitionRequest {
    pub partition_id: u32,
    /// Requested size in block-device sectors; `u32::MAX` takes all
    /// remaining space.
    pub num_logical_sectors: u32,
    pub allocation: AllocationType,
    pub attributes: PartitionAttributes,
    pub kind: PartitionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedPartition {
    pub start_logical_sector: u32,
    pub num_logical_sectors: u32,
    pub start_physical_sector: u32,
    pub num_physical_sectors: u32,
}

impl<H: SdioHost> SdmmcDevice<H> {
    pub(crate) fn alloc_partition(
        &mut self,
        req: &PartitionRequest,
    ) -> Result<AllocatedPartition, SdError> {
        let info = self.device_info();
        let log2_per_page = self.sectors_per_page_log2;

        // Allocation unit: smallest multiple of the erase group that is
        // also a multiple of the block-driver block, in 512-byte sectors
        let unit = if self.part_unit_size != 0 {
            self.part_unit_size
        } else {
            let unit = lcm(
                self.erase_grp_size,
                info.sectors_per_block << log2_per_page,
            );
            debug!(
                "inst {}: partition allocation unit {} sectors",
                self.instance, unit
            );
            self.part_unit_size = unit;
            unit
        };
        // Rounding to the unit is waived when it outgrows the erase group
        let erase_align = unit <= self.erase_grp_size;

        // Data partitions never land in the boot regions
        if !self.user_alloc_started && req.kind == PartitionKind::Data {
            let bp_blocks = (self.boot_part_sectors() << 1) >> log2_per_page;
            if self.logical_address_start < bp_blocks {
                self.logical_address_start = bp_blocks;
            }
            self.user_alloc_started = true;
        }

        let mut start = self.logical_address_start;
        if let AllocationType::Absolute { start_sector } = req.allocation {
            start = start_sector;
            self.logical_address_start = start_sector;
            if !self.partition_range_free(start, start) {
                return Err(SdError::OverlappedPartition);
            }
        }

        let total = info.total_blocks * info.sectors_per_block;
        let mut num_logical = req.num_logical_sectors;
        let unit_blocks = unit >> log2_per_page;

        if req.attributes.contains(PartitionAttributes::REMAIN_SIZE) {
            let remaining = total - self.logical_address_start;
            let reserved = num_logical.div_ceil(unit_blocks) * unit_blocks;
            num_logical = remaining
                .checked_sub(reserved)
                .ok_or(SdError::InvalidArgument)?;
        }
        if num_logical == u32::MAX {
            num_logical = total - self.logical_address_start;
        }

        // Round the size to the allocation unit
        let mut sd_sectors = num_logical << log2_per_page;
        if erase_align && sd_sectors % unit != 0 {
            debug!(
                "inst {}: part {} grown by {} sectors for alignment",
                self.instance,
                req.partition_id,
                unit - sd_sectors % unit
            );
            sd_sectors += unit - sd_sectors % unit;
            num_logical = sd_sectors >> log2_per_page;
        }

        // Whole blocks only
        let num_blocks = num_logical.div_ceil(info.sectors_per_block);
        let num_sectors = num_blocks * info.sectors_per_block;

        if !self.partition_range_free(start, start + num_sectors) {
            return Err(SdError::OverlappedPartition);
        }
        self.logical_address_start += num_sectors;

        // Physical bounds through the region mapper; counts can differ
        // from the logical ones across the boot/user boundary
        let mut phys_start = start;
        let mut one = 1u32;
        self.select_region_blocks(&mut phys_start, &mut one, false)?;
        let mut phys_end = start + num_sectors;
        one = 1;
        self.select_region_blocks(&mut phys_end, &mut one, false)?;

        self.partitions.push(PartitionEntry {
            start_lsa: start,
            num_sectors,
            partition_id: req.partition_id,
        });
        info!(
            "inst {}: allocated part {} at sector {}, {} sectors",
            self.instance, req.partition_id, start, num_sectors
        );

        Ok(AllocatedPartition {
            start_logical_sector: start,
            num_logical_sectors: num_sectors,
            start_physical_sector: phys_start,
            num_physical_sectors: phys_end - phys_start,
        })
    }

    /// True when `[start, end)` overlaps none of the recorded entries.
    fn partition_range_free(&self, start: u32, end: u32) -> bool {
        self.partitions.iter().all(|entry| {
            end <= entry.start_lsa || start >= entry.start_lsa + entry.num_sectors
        })
    }

    pub(crate) fn free_partition_table(&mut self) {
        self.partitions.clear();
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

pub(crate) fn lcm(a: u32, b: u32) -> u32 {
    if a == 0 || b == 0 {
        return a.max(b).max(1);
    }
    a / gcd(a, b) * b
}

#[cfg(test)]
mod tests {
    use super::lcm;

    #[test]
    fn lcm_basics() {
        assert_eq!(lcm(4096, 512), 4096);
        assert_eq!(lcm(24, 64), 192);
        assert_eq!(lcm(7, 7), 7);
        assert_eq!(lcm(0, 128), 128);
    }
}
