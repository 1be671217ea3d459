// ===== Erase/Trim Engine =====
//
// Erase walks the 512-byte sector range one region at a time. Ranges
// that are not whole erase groups get their unaligned edges rewritten
// with the card's erased-content fill byte, the aligned middle is
// hardware-erased. Trim works on write-block granularity and needs no
// alignment handling.

use log::{debug, warn};

use crate::err::SdError;
use crate::host::SdioHost;

use super::{SdmmcDevice, cmd::SdCommand, constant::*, region::ACCESS_REGION_COUNT};

impl<H: SdioHost> SdmmcDevice<H> {
    /// Erases a logical range of 512-byte sectors, honoring the
    /// secure/sanitize flags armed by the caller.
    pub fn erase_sectors(&mut self, start_sector: u32, num_sectors: u32) -> Result<(), SdError> {
        let mut cursor = start_sector;
        let mut remaining = num_sectors;

        for _ in 0..ACCESS_REGION_COUNT {
            let bounds = self.first_region_bounds(cursor, remaining, true)?;
            let count = bounds.sectors;

            let grp = self.erase_grp_size;
            let mut hw_rel = bounds.relative_start;
            let mut hw_count = count;
            let mut prefix = 0u32;
            let mut suffix = 0u32;
            if grp != 0 && count % grp != 0 {
                let aligned_rel = hw_rel.next_multiple_of(grp);
                prefix = (aligned_rel - hw_rel).min(count);
                hw_count = count - prefix;
                suffix = hw_count % grp;
                hw_count -= suffix;
                hw_rel = aligned_rel;
            }

            // Partial-group edges become plain writes of the erased pattern
            if prefix != 0 {
                self.fill_sectors(bounds.relative_start, prefix)?;
            }
            if hw_count != 0 {
                self.erase_group_span(hw_rel, hw_count)?;
            }
            if suffix != 0 {
                self.fill_sectors(hw_rel + hw_count, suffix)?;
            }

            cursor += count;
            remaining = bounds.remaining;
            if remaining == 0 {
                break;
            }
        }
        if remaining != 0 {
            warn!(
                "inst {}: failed to erase {} sectors",
                self.instance, remaining
            );
            return Err(SdError::EraseFailure);
        }

        if self.do_sanitize {
            self.sanitize()?;
        }
        Ok(())
    }

    /// Trim of a logical range of 512-byte sectors.
    pub fn trim_erase_sectors(&mut self, start_sector: u32, num_sectors: u32) -> Result<(), SdError> {
        debug_assert!(self.do_trim_erase);
        let mut cursor = start_sector;
        let mut remaining = num_sectors;

        for _ in 0..ACCESS_REGION_COUNT {
            let bounds = self.first_region_bounds(cursor, remaining, true)?;
            self.trim_span(bounds.relative_start, bounds.sectors)?;

            cursor += bounds.sectors;
            remaining = bounds.remaining;
            if remaining == 0 {
                break;
            }
        }
        if remaining != 0 {
            warn!(
                "inst {}: failed to trim {} sectors",
                self.instance, remaining
            );
            return Err(SdError::EraseFailure);
        }

        if self.do_sanitize {
            self.sanitize()?;
        }
        Ok(())
    }

    /// Rewrites a logical range with the erased pattern, one region at
    /// a time. Used where no hardware erase may be issued.
    pub(crate) fn fill_logical_sectors(
        &mut self,
        start_sector: u32,
        num_sectors: u32,
    ) -> Result<(), SdError> {
        let mut cursor = start_sector;
        let mut remaining = num_sectors;
        for _ in 0..ACCESS_REGION_COUNT {
            let bounds = self.first_region_bounds(cursor, remaining, true)?;
            self.fill_sectors(bounds.relative_start, bounds.sectors)?;
            cursor += bounds.sectors;
            remaining = bounds.remaining;
            if remaining == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Hardware erase of whole erase groups, region-relative start.
    /// Large spans are cut at the per-command erasable maximum with the
    /// start re-aligned to its boundary, so slow cards never see one
    /// oversized erase.
    fn erase_group_span(&mut self, mut start: u32, mut num: u32) -> Result<(), SdError> {
        if num != 0 {
            debug!(
                "inst {}: hardware erase {} sectors at {}",
                self.instance, num, start
            );
        }
        while num != 0 {
            let span = if num >= EMMC_MAX_ERASABLE_SECTORS {
                let unaligned = start & (EMMC_MAX_ERASABLE_SECTORS - 1);
                if unaligned == 0 {
                    EMMC_MAX_ERASABLE_SECTORS
                } else {
                    EMMC_MAX_ERASABLE_SECTORS - unaligned
                }
            } else {
                num
            };

            let (grp_start, grp_end) = self.erase_group_commands();
            self.command(&SdCommand::new(grp_start, self.sector_arg(start), MMC_RSP_R1))?;
            self.command(&SdCommand::new(
                grp_end,
                self.sector_arg(start + span - 1),
                MMC_RSP_R1,
            ))?;

            let arg = if self.do_secure_erase {
                MMC_ERASE_ARG_SECURE
            } else {
                0
            };
            self.command(&SdCommand::new(MMC_ERASE, arg, MMC_RSP_R1B))?;
            if self.response[0] & ERASE_CMD_ERROR != 0 {
                return Err(SdError::CommandFailed(MMC_ERASE));
            }
            self.wait_while_programming()?;

            num -= span;
            start += span;
        }
        Ok(())
    }

    /// Trim pass, plus the secure-trim second step when requested.
    fn trim_span(&mut self, mut start: u32, mut num: u32) -> Result<(), SdError> {
        while num != 0 {
            let span = if num >= EMMC_MAX_ERASABLE_SECTORS {
                let unaligned = start & (EMMC_MAX_ERASABLE_SECTORS - 1);
                if unaligned == 0 {
                    EMMC_MAX_ERASABLE_SECTORS
                } else {
                    EMMC_MAX_ERASABLE_SECTORS - unaligned
                }
            } else {
                num
            };

            let arg = if self.do_secure_erase {
                MMC_ERASE_ARG_SECURE | MMC_ERASE_ARG_TRIM
            } else {
                MMC_ERASE_ARG_TRIM
            };
            self.trim_pass(start, span, arg)?;

            if self.do_secure_erase {
                self.trim_pass(start, span, MMC_ERASE_ARG_SECURE_TRIM_STEP2)?;
            }

            num -= span;
            start += span;
        }
        Ok(())
    }

    fn trim_pass(&mut self, start: u32, span: u32, erase_arg: u32) -> Result<(), SdError> {
        self.command(&SdCommand::new(
            MMC_ERASE_GROUP_START,
            self.sector_arg(start),
            MMC_RSP_R1,
        ))?;
        self.command(&SdCommand::new(
            MMC_ERASE_GROUP_END,
            self.sector_arg(start + span - 1),
            MMC_RSP_R1,
        ))?;
        self.command(&SdCommand::new(MMC_ERASE, erase_arg, MMC_RSP_R1B))?;
        if self.response[0] & ERASE_CMD_ERROR != 0 {
            return Err(SdError::CommandFailed(MMC_ERASE));
        }
        self.wait_while_programming()
    }

    /// SANITIZE switch with a bounded retry, each attempt waiting for
    /// the card to settle back into transfer state.
    pub(crate) fn sanitize(&mut self) -> Result<(), SdError> {
        let cmd = SdCommand::new(MMC_SWITCH, MMC_SANITIZE_ARG, MMC_RSP_R1B);
        let mut last = SdError::CommandFailed(MMC_SWITCH);
        for attempt in 1..=MMC_SANITIZE_MAX_RETRIES {
            match self.command(&cmd) {
                Ok(()) => return self.wait_while_programming(),
                Err(e) => {
                    warn!(
                        "inst {}: sanitize attempt {}/{} failed",
                        self.instance, attempt, MMC_SANITIZE_MAX_RETRIES
                    );
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Single-sector writes of the erased pattern at a region-relative
    /// start; the region must already be selected.
    fn fill_sectors(&mut self, rel_start: u32, num: u32) -> Result<(), SdError> {
        let fill = if self.erased_mem_content != 0 { 0xFF } else { 0x00 };
        let buf = [fill; SD_SECTOR_SIZE as usize];
        debug!(
            "inst {}: fill {} sectors at {} with {:#04x}",
            self.instance, num, rel_start, fill
        );
        for i in 0..num {
            let cmd = SdCommand::new(MMC_WRITE_BLOCK, self.sector_arg(rel_start + i), MMC_RSP_R1);
            let auto_cmd12 = self.auto_cmd12;
            self.host
                .write(&cmd, &buf, auto_cmd12)
                .map_err(|_| SdError::CommandFailed(cmd.opcode))?;
            self.host
                .response(&cmd, &mut self.response)
                .map_err(|_| SdError::CommandFailed(cmd.opcode))?;
        }
        Ok(())
    }

    fn erase_group_commands(&self) -> (u8, u8) {
        if self.is_mmc {
            (MMC_ERASE_GROUP_START, MMC_ERASE_GROUP_END)
        } else {
            (SD_ERASE_WR_BLK_START, SD_ERASE_WR_BLK_END)
        }
    }

    /// 512-byte sector address, or byte address on standard capacity.
    fn sector_arg(&self, sector: u32) -> u32 {
        if self.is_sdhc {
            sector
        } else {
            sector * SD_SECTOR_SIZE
        }
    }
}
