//! Scripted SD/eMMC card model behind the `SdioHost` trait, with a
//! sector store, a command log and fault injection for the recovery
//! paths.

#![allow(dead_code)]

use sdmmc_blk::err::SdError;
use sdmmc_blk::host::{
    BusWidth, HostCapabilities, HostModes, ResetScope, SdioHost, SlotUsage, UhsMode,
};
use sdmmc_blk::sdmmc::cmd::SdCommand;
use sdmmc_blk::sdmmc::constant::*;

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    Emmc,
    Sd,
    /// Nothing in the slot: every wake command times out.
    Absent,
}

#[derive(Debug, Clone, Copy)]
pub struct MockConfig {
    pub personality: Personality,
    /// User-area capacity in 512-byte sectors.
    pub user_sectors: u32,
    /// Erase group in 512-byte sectors. With `erase_grp_def` set it must
    /// be a multiple of 1024 (the high-capacity unit); otherwise it is
    /// encoded into the CSD and must be at most 32 * 32.
    pub erase_grp_sectors: u32,
    pub erase_grp_def: bool,
    /// Write-protect groups per erase group.
    pub wp_grp_mult: u8,
    /// EXT_CSD BOOT_SIZE_MULT (x 128 KiB per boot partition).
    pub boot_size_mult: u8,
    /// EXT_CSD DEVICE_TYPE byte.
    pub device_type: u8,
    /// EXT_CSD SEC_FEATURE_SUPPORT byte.
    pub sec_feature: u8,
    /// Busy polls before the wake handshake reports power-up.
    pub wake_polls: u32,
}

impl MockConfig {
    pub fn emmc() -> Self {
        Self {
            personality: Personality::Emmc,
            user_sectors: 0x1_0000,
            erase_grp_sectors: 1024,
            erase_grp_def: true,
            wp_grp_mult: 4,
            boot_size_mult: 0,
            device_type: MMC_DEVICE_TYPE_HS200_SDR_200MHZ_1_8_V
                | MMC_DEVICE_TYPE_HIGHSPEED_DDR_52MHZ_1_8_V
                | MMC_DEVICE_TYPE_HIGHSPEED_52MHZ
                | MMC_DEVICE_TYPE_HIGHSPEED_26MHZ,
            sec_feature: EXT_CSD_SEC_ER_EN | EXT_CSD_SEC_GB_CL_EN,
            wake_polls: 2,
        }
    }

    pub fn sd() -> Self {
        Self {
            personality: Personality::Sd,
            user_sectors: 0x1_0000,
            erase_grp_sectors: 8,
            erase_grp_def: false,
            wp_grp_mult: 4,
            boot_size_mult: 0,
            device_type: 0,
            sec_feature: 0,
            wake_polls: 2,
        }
    }
}

pub fn host_caps() -> HostCapabilities {
    HostCapabilities {
        modes: HostModes::AUTO_CMD12
            | HostModes::HIGH_SPEED
            | HostModes::SDR50
            | HostModes::DDR50
            | HostModes::SDR104,
        bus_width: BusWidth::Width8,
        slot_usage: SlotUsage::Boot,
    }
}

pub struct MockHost {
    pub cfg: MockConfig,
    pub caps: HostCapabilities,

    user: Vec<u8>,
    boot1: Vec<u8>,
    boot2: Vec<u8>,

    // card model state
    card_state: u32, // protocol state number as reported by CMD13
    partition: u32,  // 0 = user area, 1/2 = boot partitions
    wake_remaining: u32,
    erase_start: Option<u32>,
    erase_end: Option<u32>,
    response: [u32; 4],
    status_error_pending: bool,
    locked_groups: BTreeSet<u32>,

    // host-side observable state
    pub cmd_log: Vec<(u8, u32)>,
    pub clock_khz: u32,
    pub bus_width: BusWidth,
    pub uhs_mode: UhsMode,
    pub block_size: u32,
    pub tuning_runs: u32,
    pub soft_resets: u32,
    pub suspend_calls: u32,
    pub resume_calls: u32,

    // fault injection
    pub write_crc_failures: u32,
    pub data_timeout_failures: u32,
}

impl MockHost {
    pub fn new(cfg: MockConfig, caps: HostCapabilities) -> Self {
        let boot_bytes = (cfg.boot_size_mult as usize) << 17;
        Self {
            cfg,
            caps,
            user: vec![0u8; cfg.user_sectors as usize * 512],
            boot1: vec![0u8; boot_bytes],
            boot2: vec![0u8; boot_bytes],
            card_state: 0,
            partition: 0,
            wake_remaining: cfg.wake_polls,
            erase_start: None,
            erase_end: None,
            response: [0; 4],
            status_error_pending: false,
            locked_groups: BTreeSet::new(),
            cmd_log: Vec::new(),
            clock_khz: 0,
            bus_width: BusWidth::Width1,
            uhs_mode: UhsMode::Sdr12,
            block_size: 0,
            tuning_runs: 0,
            soft_resets: 0,
            suspend_calls: 0,
            resume_calls: 0,
            write_crc_failures: 0,
            data_timeout_failures: 0,
        }
    }

    pub fn count_cmd(&self, opcode: u8) -> usize {
        self.cmd_log.iter().filter(|(op, _)| *op == opcode).count()
    }

    pub fn args_of(&self, opcode: u8) -> Vec<u32> {
        self.cmd_log
            .iter()
            .filter(|(op, _)| *op == opcode)
            .map(|(_, arg)| *arg)
            .collect()
    }

    pub fn wp_grp_sectors(&self) -> u32 {
        self.cfg.erase_grp_sectors * self.cfg.wp_grp_mult as u32
    }

    pub fn user_sector(&self, sector: u32) -> &[u8] {
        let at = sector as usize * 512;
        &self.user[at..at + 512]
    }

    pub fn user_range_is(&self, start: u32, count: u32, byte: u8) -> bool {
        let at = start as usize * 512;
        let end = at + count as usize * 512;
        self.user[at..end].iter().all(|b| *b == byte)
    }

    pub fn boot_range_is(&self, part: u32, byte: u8) -> bool {
        let store = if part == 1 { &self.boot1 } else { &self.boot2 };
        store.iter().all(|b| *b == byte)
    }

    fn store_mut(&mut self) -> &mut Vec<u8> {
        match self.partition {
            1 => &mut self.boot1,
            2 => &mut self.boot2,
            _ => &mut self.user,
        }
    }

    fn store(&self) -> &Vec<u8> {
        match self.partition {
            1 => &self.boot1,
            2 => &self.boot2,
            _ => &self.user,
        }
    }

    fn r1(&self) -> u32 {
        let err = if self.status_error_pending {
            MMC_READ_WRITE_ERROR_MASK
        } else {
            0
        };
        (self.card_state << 9) | err
    }

    /// MMC CSD with the erase group and write-protect fields encoded;
    /// capacity comes from EXT_CSD on high-capacity parts.
    fn mmc_csd(&self) -> [u32; 4] {
        assert!(!self.cfg.erase_grp_def || self.cfg.erase_grp_sectors % 1024 == 0);
        // (ERASE_GRP_SIZE+1) * (ERASE_GRP_MULT+1) * 512 / 512 = group sectors
        let g = self.cfg.erase_grp_sectors;
        let (gsz, gmult) = match g {
            8 => (3u32, 1u32),
            1024 => (31, 31),
            other => {
                assert!(other <= 32, "unsupported mock erase group {}", other);
                (other - 1, 0)
            }
        };
        let mut csd = [0u32; 4];
        csd[0] |= (gmult & 0x7) << 29; // ERASE_GRP_MULT low bits
        csd[1] |= (gmult >> 3) & 0x3; // ERASE_GRP_MULT high bits
        csd[1] |= (gsz & 0x1F) << 2; // ERASE_GRP_SIZE
        csd[0] |= 9 << 14; // WRITE_BL_LEN = 512
        csd[0] |= (self.cfg.wp_grp_mult as u32 & 0x1F) << 24; // WP_GRP_SIZE
        csd[2] |= 9 << 8; // READ_BL_LEN = 512
        csd
    }

    /// SD CSD v2 with the same erase group geometry knobs.
    fn sd_csd(&self) -> [u32; 4] {
        let mut csd = [0u32; 4];
        let c_size = self.cfg.user_sectors / 1024 - 1;
        csd[1] |= (c_size << 8) & SD_SDHC_CSIZE_MASK;
        let es = self.cfg.erase_grp_sectors - 1; // SECTOR_SIZE field
        csd[1] |= (es >> 1) & 0x3F;
        csd[0] |= (es & 1) << 31;
        csd[0] |= 9 << 14; // WRITE_BL_LEN = 512
        csd[0] |= ((self.cfg.wp_grp_mult as u32 - 1) & 0x7F) << 24; // WP_GRP_SIZE
        csd[2] |= 9 << 8; // READ_BL_LEN
        csd
    }

    fn ext_csd(&self) -> [u8; 512] {
        let mut e = [0u8; 512];
        let n = self.cfg.user_sectors;
        e[EXT_CSD_SEC_CNT] = n as u8;
        e[EXT_CSD_SEC_CNT + 1] = (n >> 8) as u8;
        e[EXT_CSD_SEC_CNT + 2] = (n >> 16) as u8;
        e[EXT_CSD_SEC_CNT + 3] = (n >> 24) as u8;
        if self.cfg.erase_grp_def {
            e[EXT_CSD_ERASE_GROUP_DEF] = 1;
            e[EXT_CSD_HC_ERASE_GRP_SIZE] = (self.cfg.erase_grp_sectors / 1024) as u8;
            e[EXT_CSD_HC_WP_GRP_SIZE] = self.cfg.wp_grp_mult;
        }
        e[EXT_CSD_CARD_TYPE] = self.cfg.device_type;
        e[EXT_CSD_SEC_FEATURE_SUPPORT] = self.cfg.sec_feature;
        e[EXT_CSD_ERASED_MEM_CONT] = 1; // erased cells read 0xFF
        e[EXT_CSD_BOOT_SIZE_MULT] = self.cfg.boot_size_mult;
        e
    }

    fn apply_erase(&mut self) {
        if let (Some(start), Some(end)) = (self.erase_start.take(), self.erase_end.take()) {
            let store = self.store_mut();
            let from = start as usize * 512;
            let to = ((end + 1) as usize * 512).min(store.len());
            store[from..to].fill(0xFF);
        }
    }

    fn handle_switch(&mut self, arg: u32) {
        match arg & 0xFFFF_0000 {
            EMMC_SWITCH_SELECT_PARTITION_ARG => self.partition = (arg >> 8) & 0x7,
            _ => {}
        }
    }
}

impl SdioHost for MockHost {
    fn capabilities(&self) -> HostCapabilities {
        self.caps
    }

    fn send_command(&mut self, cmd: &SdCommand) -> Result<(), SdError> {
        self.cmd_log.push((cmd.opcode, cmd.arg));
        self.response = [0; 4];

        if self.cfg.personality == Personality::Absent {
            return match cmd.opcode {
                MMC_GO_IDLE_STATE => Ok(()),
                _ => Err(SdError::Timeout),
            };
        }

        match cmd.opcode {
            MMC_GO_IDLE_STATE => {
                self.card_state = 0;
                self.wake_remaining = self.cfg.wake_polls;
            }
            MMC_SEND_OP_COND => {
                if self.cfg.personality != Personality::Emmc {
                    return Err(SdError::Timeout);
                }
                if self.wake_remaining > 0 {
                    self.wake_remaining -= 1;
                    self.response[0] = MMC_EXPECTED_OCR & !SD_CARD_POWERUP_STATUS_MASK;
                } else {
                    self.response[0] = SD_CARD_POWERUP_STATUS_MASK | SD_CARD_CAPACITY_MASK;
                    self.card_state = 1; // ready
                }
            }
            MMC_APP_CMD => {
                if self.cfg.personality != Personality::Sd {
                    return Err(SdError::Timeout);
                }
                self.response[0] = self.r1() | 0x20; // APP_CMD bit
            }
            SD_APP_SEND_OP_COND => {
                if self.wake_remaining > 0 {
                    self.wake_remaining -= 1;
                    self.response[0] = SD_CARD_OCR_VALUE;
                } else {
                    self.response[0] =
                        SD_CARD_POWERUP_STATUS_MASK | SD_CARD_CAPACITY_MASK | SD_CARD_OCR_VALUE;
                    self.card_state = 1;
                }
            }
            SD_SEND_IF_COND if self.cfg.personality == Personality::Sd => {
                // echo of voltage range and check pattern
                self.response[0] = cmd.arg & 0xFFF;
            }
            MMC_ALL_SEND_CID => {
                self.response = [0x1B014D4D, 0x43303847, 0x12345678, 0x9ABC00DE];
                self.card_state = 2; // ident
            }
            MMC_SET_RELATIVE_ADDR => {
                self.card_state = 3; // standby
                if self.cfg.personality == Personality::Sd {
                    self.response[0] = 1 << 16; // published RCA
                } else {
                    self.response[0] = self.r1();
                }
            }
            MMC_SEND_CSD => {
                self.response = match self.cfg.personality {
                    Personality::Sd => self.sd_csd(),
                    _ => self.mmc_csd(),
                };
            }
            MMC_SELECT_CARD => {
                self.card_state = 4; // transfer
                self.response[0] = self.r1();
            }
            MMC_SEND_STATUS => {
                self.response[0] = self.r1();
                self.status_error_pending = false;
            }
            MMC_SET_BLOCKLEN => {
                self.response[0] = self.r1();
            }
            MMC_SWITCH => {
                self.handle_switch(cmd.arg);
                self.response[0] = self.r1();
            }
            MMC_STOP_TRANSMISSION => {
                self.card_state = 4;
                self.response[0] = self.r1();
            }
            MMC_ERASE_GROUP_START | SD_ERASE_WR_BLK_START => {
                self.erase_start = Some(cmd.arg);
                self.response[0] = self.r1();
            }
            MMC_ERASE_GROUP_END | SD_ERASE_WR_BLK_END => {
                self.erase_end = Some(cmd.arg);
                self.response[0] = self.r1();
            }
            MMC_ERASE => {
                self.apply_erase();
                self.response[0] = self.r1();
            }
            MMC_SET_WRITE_PROT => {
                let group = cmd.arg / self.wp_grp_sectors();
                self.locked_groups.insert(group);
                self.response[0] = self.r1();
            }
            MMC_CLR_WRITE_PROT => {
                let group = cmd.arg / self.wp_grp_sectors();
                self.locked_groups.remove(&group);
                self.response[0] = self.r1();
            }
            _ => {
                self.response[0] = self.r1();
            }
        }
        Ok(())
    }

    fn response(&mut self, _cmd: &SdCommand, response: &mut [u32; 4]) -> Result<(), SdError> {
        *response = self.response;
        Ok(())
    }

    fn read(&mut self, cmd: &SdCommand, buf: &mut [u8], _auto_cmd12: bool) -> Result<(), SdError> {
        self.cmd_log.push((cmd.opcode, cmd.arg));
        self.response = [self.r1(), 0, 0, 0];

        match cmd.opcode {
            MMC_SEND_EXT_CSD if self.cfg.personality == Personality::Emmc => {
                buf.copy_from_slice(&self.ext_csd());
                Ok(())
            }
            MMC_SWITCH if self.cfg.personality == Personality::Sd => {
                // CMD6 switch status block, group 1 accepted
                buf.fill(0);
                buf[13] = 0x2;
                Ok(())
            }
            MMC_SEND_WRITE_PROT => {
                let group = cmd.arg / self.wp_grp_sectors();
                buf.fill(0);
                buf[0] = self.locked_groups.contains(&group) as u8;
                Ok(())
            }
            MMC_READ_SINGLE_BLOCK | MMC_READ_MULTIPLE_BLOCK => {
                if self.data_timeout_failures > 0 {
                    self.data_timeout_failures -= 1;
                    self.status_error_pending = true;
                    self.card_state = 5; // stuck in data state
                    return Err(SdError::DataTimeout);
                }
                let at = cmd.arg as usize * 512;
                let store = self.store();
                if at + buf.len() > store.len() {
                    return Err(SdError::DataTimeout);
                }
                buf.copy_from_slice(&store[at..at + buf.len()]);
                Ok(())
            }
            _ => Err(SdError::InvalidArgument),
        }
    }

    fn write(&mut self, cmd: &SdCommand, buf: &[u8], _auto_cmd12: bool) -> Result<(), SdError> {
        self.cmd_log.push((cmd.opcode, cmd.arg));
        self.response = [self.r1(), 0, 0, 0];

        match cmd.opcode {
            MMC_WRITE_BLOCK | MMC_WRITE_MULTIPLE_BLOCK => {
                if self.write_crc_failures > 0 {
                    self.write_crc_failures -= 1;
                    self.card_state = 6; // left in receive state
                    return Err(SdError::DataCrc);
                }
                if self.data_timeout_failures > 0 {
                    self.data_timeout_failures -= 1;
                    self.status_error_pending = true;
                    self.card_state = 6;
                    return Err(SdError::DataTimeout);
                }
                let at = cmd.arg as usize * 512;
                let store = self.store_mut();
                if at + buf.len() > store.len() {
                    return Err(SdError::DataTimeout);
                }
                store[at..at + buf.len()].copy_from_slice(buf);
                Ok(())
            }
            _ => Err(SdError::InvalidArgument),
        }
    }

    fn set_clock(&mut self, freq_khz: u32) -> Result<u32, SdError> {
        self.clock_khz = freq_khz;
        Ok(freq_khz)
    }

    fn set_bus_width(&mut self, width: BusWidth) -> Result<(), SdError> {
        self.bus_width = width;
        Ok(())
    }

    fn set_uhs_mode(&mut self, mode: UhsMode) -> Result<(), SdError> {
        self.uhs_mode = mode;
        Ok(())
    }

    fn set_block_size(&mut self, block_size: u32) -> Result<(), SdError> {
        self.block_size = block_size;
        Ok(())
    }

    fn execute_tuning(&mut self) -> Result<(), SdError> {
        self.tuning_runs += 1;
        Ok(())
    }

    fn soft_reset(&mut self, _scope: ResetScope) -> Result<(), SdError> {
        self.soft_resets += 1;
        self.card_state = 0;
        Ok(())
    }

    fn suspend(&mut self, _switch_device_power: bool) -> Result<(), SdError> {
        self.suspend_calls += 1;
        Ok(())
    }

    fn resume(&mut self, _switch_device_power: bool) -> Result<(), SdError> {
        self.resume_calls += 1;
        Ok(())
    }

    fn delay_ms(&mut self, _ms: u32) {}
}

/// Deterministic pseudo-random fill for round-trip checks.
pub fn fill_pattern(buf: &mut [u8], mut seed: u32) {
    for b in buf.iter_mut() {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        *b = seed as u8;
    }
}
