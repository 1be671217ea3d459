//! Logical-to-physical region addressing.
//!
//! With boot partitions present the flat logical space is laid out as
//! [0, B) = boot partition 1, [B, 2B) = boot partition 2 and the rest
//! user area, B being the boot partition size in 512-byte sectors.
//! Without boot partitions every address is user area and no partition
//! switch is ever issued.

use log::debug;

use crate::err::SdError;
use crate::host::SdioHost;

use super::{SdmmcDevice, cmd::SdCommand, constant::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRegion {
    UserArea = 0,
    BootPartition1 = 1,
    BootPartition2 = 2,
}

pub const ACCESS_REGION_COUNT: usize = 3;

/// First-region clip of a logical sector range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionBounds {
    pub region: AccessRegion,
    /// Start relative to the region the range begins in.
    pub relative_start: u32,
    /// Sectors inside that region.
    pub sectors: u32,
    /// Sectors left beyond the region boundary.
    pub remaining: u32,
}

/// Clips `[start, start + count)` (512-byte sectors) to the region the
/// start address falls in.
pub fn map_region(boot_part_sectors: u32, start: u32, count: u32) -> RegionBounds {
    let bp = boot_part_sectors;
    if bp == 0 {
        return RegionBounds {
            region: AccessRegion::UserArea,
            relative_start: start,
            sectors: count,
            remaining: 0,
        };
    }

    let end = start + count.max(1);
    let (region, relative_start, clipped_end) = if start < bp {
        (AccessRegion::BootPartition1, start, end.min(bp))
    } else if start < bp << 1 {
        (AccessRegion::BootPartition2, start - bp, end.min(bp << 1))
    } else {
        (AccessRegion::UserArea, start - (bp << 1), end)
    };

    let sectors = (clipped_end - start).min(count);
    RegionBounds {
        region,
        relative_start,
        sectors,
        remaining: count - sectors,
    }
}

impl<H: SdioHost> SdmmcDevice<H> {
    /// Bounds of the first region a 512-byte sector range touches,
    /// optionally switching the card to it.
    pub(crate) fn first_region_bounds(
        &mut self,
        start: u32,
        count: u32,
        select: bool,
    ) -> Result<RegionBounds, SdError> {
        let bounds = map_region(self.boot_part_sectors(), start, count);
        if self.boot_part_sectors() != 0 && count != 0 && select {
            self.select_region(bounds.region)?;
        }
        Ok(bounds)
    }

    /// Same clip in block-device sector units, updating in place.
    pub(crate) fn select_region_blocks(
        &mut self,
        block: &mut u32,
        num_blocks: &mut u32,
        select: bool,
    ) -> Result<(), SdError> {
        if self.boot_part_sectors() == 0 {
            return Ok(());
        }
        let start = *block << self.sectors_per_page_log2;
        let count = *num_blocks << self.sectors_per_page_log2;
        let bounds = self.first_region_bounds(start, count, select)?;
        *block = bounds.relative_start >> self.sectors_per_page_log2;
        *num_blocks = bounds.sectors >> self.sectors_per_page_log2;
        Ok(())
    }

    /// PARTITION_CONFIG switch, issued only when the target region
    /// differs from the currently selected one.
    pub(crate) fn select_region(&mut self, region: AccessRegion) -> Result<(), SdError> {
        if self.current_region == Some(region) {
            return Ok(());
        }
        debug!("inst {}: selecting region {:?}", self.instance, region);

        let mut arg = ((self.boot_config & !0x7) as u32) | region as u32;
        arg <<= EMMC_SWITCH_SELECT_PARTITION_OFFSET;
        arg |= EMMC_SWITCH_SELECT_PARTITION_ARG;
        self.command(&SdCommand::new(MMC_SWITCH, arg, MMC_RSP_R1B))?;
        self.wait_while_programming()?;

        self.current_region = Some(region);
        Ok(())
    }
}
