//! Protocol state machine shared by every partition handle on one
//! controller: identification, speed negotiation and the per-device
//! registers the transfer and erase engines work from.

extern crate alloc;

pub mod block;
pub mod cmd;
pub mod constant;
pub mod erase;
pub mod region;

use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::err::SdError;
use crate::floor_log2;
use crate::host::{BusWidth, HostCapabilities, HostModes, SdioHost, SlotUsage, UhsMode};

use cmd::SdCommand;
use constant::*;
use region::AccessRegion;

/// Protocol state of the card, from the R1 status bits [12:9].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardState {
    #[default]
    Idle,
    Ready,
    Ident,
    Stby,
    Tran,
    Data,
    Rcv,
    Prg,
    Dis,
    Unknown,
}

impl CardState {
    pub(crate) fn from_status(status: u32) -> Self {
        match (status & SD_TRANSFER_STATE_MASK) >> SD_TRANSFER_STATE_SHIFT {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Ident,
            3 => CardState::Stby,
            4 => CardState::Tran,
            5 => CardState::Data,
            6 => CardState::Rcv,
            7 => CardState::Prg,
            8 => CardState::Dis,
            _ => CardState::Unknown,
        }
    }
}

/// One partition allocated by the boot-time layout pass.
#[derive(Debug, Clone, Copy)]
pub struct PartitionEntry {
    pub start_lsa: u32,
    pub num_sectors: u32,
    pub partition_id: u32,
}

/// Per-controller device state, shared by all partitions on it.
pub struct SdmmcDevice<H: SdioHost> {
    pub(crate) host: H,
    pub(crate) instance: u32,
    pub(crate) caps: HostCapabilities,
    /// Scratch for the most recent command response.
    pub(crate) response: [u32; 4],
    pub(crate) rca: u16,
    pub(crate) cid: [u32; 4],
    /// User-area capacity in 512-byte sectors.
    pub(crate) num_sectors: u32,
    pub(crate) block_length_in_use: u32,
    pub(crate) auto_cmd12: bool,
    pub(crate) is_mmc: bool,
    /// High capacity: block addressing, SEC_CNT capacity on eMMC.
    pub(crate) is_sdhc: bool,
    pub(crate) is_high_speed: bool,
    pub(crate) uhs_mode: UhsMode,
    pub(crate) card_state: CardState,
    /// Erase group size in 512-byte sectors.
    pub(crate) erase_grp_size: u32,
    /// Write-protect group size in 512-byte sectors.
    pub(crate) wp_grp_size: u32,
    pub(crate) erase_grp_def_enabled: bool,
    pub(crate) erased_mem_content: u8,
    /// Size of one boot partition in bytes, 0 when absent.
    pub(crate) boot_partition_size: u32,
    pub(crate) boot_config: u8,
    /// EXT_CSD DEVICE_TYPE byte.
    pub(crate) device_type: u8,
    pub(crate) current_region: Option<AccessRegion>,
    pub(crate) secure_erase_supported: bool,
    pub(crate) trim_erase_supported: bool,
    pub(crate) sanitize_supported: bool,
    pub(crate) do_secure_erase: bool,
    pub(crate) do_trim_erase: bool,
    pub(crate) do_sanitize: bool,
    pub(crate) read_verify_write: bool,
    /// log2(block-device sector / 512-byte protocol sector).
    pub(crate) sectors_per_page_log2: u32,
    /// Cached LCM of erase group and block-device block, in sectors.
    pub(crate) part_unit_size: u32,
    /// Allocation cursor for the boot-time partition layout.
    pub(crate) logical_address_start: u32,
    pub(crate) user_alloc_started: bool,
    pub(crate) partitions: Vec<PartitionEntry>,
    pub(crate) ref_count: u32,
    pub(crate) power_up_counter: u32,
}

impl<H: SdioHost> SdmmcDevice<H> {
    pub fn new(host: H, instance: u32) -> Self {
        Self {
            host,
            instance,
            caps: HostCapabilities::default(),
            response: [0; 4],
            rca: 0,
            cid: [0; 4],
            num_sectors: 0,
            block_length_in_use: 0,
            auto_cmd12: false,
            is_mmc: false,
            is_sdhc: false,
            is_high_speed: false,
            uhs_mode: UhsMode::Sdr12,
            card_state: CardState::Idle,
            erase_grp_size: 0,
            wp_grp_size: 0,
            erase_grp_def_enabled: false,
            erased_mem_content: 0,
            boot_partition_size: 0,
            boot_config: 0,
            device_type: 0,
            current_region: None,
            secure_erase_supported: false,
            trim_erase_supported: false,
            sanitize_supported: false,
            do_secure_erase: false,
            do_trim_erase: false,
            do_sanitize: false,
            read_verify_write: false,
            sectors_per_page_log2: floor_log2(BLOCK_BYTES_PER_SECTOR / SD_SECTOR_SIZE),
            part_unit_size: 0,
            logical_address_start: 0,
            user_alloc_started: false,
            partitions: Vec::new(),
            ref_count: 0,
            power_up_counter: 0,
        }
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn is_mmc(&self) -> bool {
        self.is_mmc
    }

    pub fn is_high_capacity(&self) -> bool {
        self.is_sdhc
    }

    pub fn is_high_speed(&self) -> bool {
        self.is_high_speed
    }

    pub fn uhs_mode(&self) -> UhsMode {
        self.uhs_mode
    }

    pub fn cid(&self) -> [u32; 4] {
        self.cid
    }

    pub fn capacity_sectors(&self) -> u32 {
        self.num_sectors
    }

    pub fn erase_group_sectors(&self) -> u32 {
        self.erase_grp_size
    }

    pub fn write_protect_group_sectors(&self) -> u32 {
        self.wp_grp_size
    }

    pub fn boot_partition_bytes(&self) -> u32 {
        self.boot_partition_size
    }

    pub fn erase_group_def_enabled(&self) -> bool {
        self.erase_grp_def_enabled
    }

    /// Block length last set on the card via CMD16.
    pub fn block_length(&self) -> u32 {
        self.block_length_in_use
    }

    pub fn read_verify_write(&self) -> bool {
        self.read_verify_write
    }

    pub(crate) fn boot_part_sectors(&self) -> u32 {
        self.boot_partition_size >> SD_SECTOR_SZ_LOG2
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn power_up_counter(&self) -> u32 {
        self.power_up_counter
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Drives the card from power-up to transfer state and negotiates
    /// the fastest mode the card and host agree on. Also the recovery
    /// entry point after a controller reset.
    pub fn identify(&mut self) -> Result<(), SdError> {
        self.block_length_in_use = SD_SECTOR_SIZE;
        self.host.set_block_size(SD_SECTOR_SIZE)?;

        self.caps = self.host.capabilities();
        self.auto_cmd12 = self.caps.modes.contains(HostModes::AUTO_CMD12);

        // CMD0 puts the card in idle state
        self.command(&SdCommand::new(MMC_GO_IDLE_STATE, 0, MMC_RSP_NONE))?;
        self.current_region = None;
        self.is_mmc = false;
        self.is_high_speed = false;
        self.uhs_mode = UhsMode::Sdr12;

        match self.mmc_wake() {
            Ok(()) => self.is_mmc = true,
            // Not an eMMC part, probe the SD handshake instead
            Err(SdError::NoCard) => {}
            Err(e) => return Err(e),
        }

        if self.is_mmc {
            self.identify_mmc()
        } else {
            self.identify_sd()
        }
    }

    /// CMD1 poll. A timeout on the very first attempt means the device
    /// does not speak the MMC wake protocol at all.
    fn mmc_wake(&mut self) -> Result<(), SdError> {
        let mut ocr = 0u32;
        for attempt in 0..MMC_WAKE_POLL_LIMIT {
            let cmd = SdCommand::new(MMC_SEND_OP_COND, ocr | MMC_EXPECTED_OCR, MMC_RSP_R3);
            match self.try_command(&cmd) {
                Ok(()) => {}
                Err(SdError::Timeout) if attempt == 0 => return Err(SdError::NoCard),
                Err(SdError::Timeout) => return Err(SdError::Timeout),
                Err(_) => return Err(SdError::CommandFailed(MMC_SEND_OP_COND)),
            }
            ocr = self.response[0];
            if ocr & SD_CARD_POWERUP_STATUS_MASK != 0 {
                self.is_sdhc = ocr & SD_CARD_CAPACITY_MASK != 0;
                return Ok(());
            }
            self.host.delay_ms(MMC_WAKE_POLL_MS);
        }
        Err(SdError::Timeout)
    }

    // ===== SD identification =====

    fn identify_sd(&mut self) -> Result<(), SdError> {
        let host_capacity = self.send_interface_condition()?;
        let card_capacity = self.sd_read_ocr(host_capacity)?;
        self.is_sdhc = host_capacity != 0 && card_capacity != 0;

        self.read_cid()?;

        // CMD3: the card publishes its relative address
        self.command(&SdCommand::new(MMC_SET_RELATIVE_ADDR, 0, MMC_RSP_R6))?;
        self.rca = (self.response[0] >> 16) as u16;

        self.sd_read_csd()?;
        self.select_card()?;
        if !self.is_transfer_state()? {
            return Err(SdError::InvalidState);
        }

        self.host.set_clock(SD_TX_CLOCK_KHZ)?;
        if self.is_sdhc {
            if self.sd_switch_high_speed().is_ok() {
                self.is_high_speed = true;
                if self.host.set_clock(SD_SDHC_TX_CLOCK_KHZ).is_err() {
                    // Host refused the faster clock, stay at normal speed
                    self.is_high_speed = false;
                    self.host.set_clock(SD_TX_CLOCK_KHZ)?;
                }
            }
        }

        self.sd_set_bus_width()?;
        self.set_card_block_length(SD_SECTOR_SIZE)?;

        info!(
            "inst {}: SD card ready, {} sectors, sdhc={} hs={}",
            self.instance, self.num_sectors, self.is_sdhc, self.is_high_speed
        );
        Ok(())
    }

    /// CMD8 probe. Timeout means a legacy card that predates the
    /// command; a corrupted echo pattern is fatal.
    fn send_interface_condition(&mut self) -> Result<u32, SdError> {
        let cmd = SdCommand::new(
            SD_SEND_IF_COND,
            SD_HOST_VOLTAGE_RANGE | SD_HOST_CHECK_PATTERN,
            MMC_RSP_R7,
        );
        match self.try_command(&cmd) {
            Ok(()) => {
                let resp = self.response[0];
                if resp & 0xFF != SD_HOST_CHECK_PATTERN {
                    return Err(SdError::PatternIntegrity);
                }
                if (resp & 0xF00) >> 8 != SD_HOST_VOLTAGE_RANGE >> 8 {
                    // Voltage window rejected, fall back to standard capacity
                    return Ok(0);
                }
                Ok(1)
            }
            Err(SdError::Timeout) => Ok(0),
            Err(_) => Err(SdError::CommandFailed(SD_SEND_IF_COND)),
        }
    }

    /// ACMD41 loop until the card reports power-up.
    fn sd_read_ocr(&mut self, host_capacity: u32) -> Result<u32, SdError> {
        loop {
            let app = SdCommand::new(MMC_APP_CMD, 0, MMC_RSP_R1);
            match self.try_command(&app) {
                Ok(()) => {}
                // Nothing answers CMD55: the slot is empty or the card is gone
                Err(SdError::Timeout) => return Err(SdError::NoCard),
                Err(_) => return Err(SdError::CommandFailed(MMC_APP_CMD)),
            }

            let cmd = SdCommand::new(
                SD_APP_SEND_OP_COND,
                (host_capacity << 30) | SD_CARD_OCR_VALUE,
                MMC_RSP_R3,
            );
            self.command(&cmd)?;

            let ocr = self.response[0];
            if ocr == 0 {
                return Err(SdError::NoCard);
            }
            if ocr & SD_CARD_POWERUP_STATUS_MASK != 0 {
                return Ok(ocr & SD_CARD_CAPACITY_MASK);
            }
        }
    }

    fn sd_read_csd(&mut self) -> Result<(), SdError> {
        let cmd = SdCommand::new(MMC_SEND_CSD, (self.rca as u32) << 16, MMC_RSP_R2);
        self.command(&cmd)?;
        let csd = self.response;

        if !self.is_sdhc {
            // CSD v1: capacity = (C_SIZE+1) * 2^(C_SIZE_MULT+2) * 2^READ_BL_LEN
            let read_bl_len = 1u32
                << ((csd[SD_CSD_BLOCK_LEN_WORD] >> SD_CSD_BLOCK_LEN_SHIFT)
                    & SD_CSD_BLOCK_LEN_MASK);
            let mut c_size = (csd[SD_CSD_CSIZE_HIGH_WORD] & SD_CSD_CSIZE_HIGH_WORD_MASK)
                << SD_CSD_CSIZE_HIGH_WORD_SHIFT;
            c_size |= csd[SD_CSD_CSIZE_LOW_WORD] >> SD_CSD_CSIZE_LOW_WORD_SHIFT;
            c_size += 1;
            let c_size_mult = 1u32
                << (((csd[SD_CSD_CSIZE_MULT_WORD] >> SD_CSD_CSIZE_MULT_SHIFT)
                    & SD_CSD_CSIZE_MULT_MASK)
                    + 2);
            self.num_sectors = c_size * c_size_mult * (read_bl_len / SD_SECTOR_SIZE);
        } else {
            // CSD v2: capacity = (C_SIZE+1) * 512 KiB
            let c_size =
                ((csd[SD_SDHC_CSIZE_WORD] & SD_SDHC_CSIZE_MASK) >> SD_SDHC_CSIZE_SHIFT) + 1;
            self.num_sectors = c_size * SD_SDHC_CSIZE_MULTIPLIER;
        }

        // Erase group from SECTOR_SIZE [45:39] and WRITE_BL_LEN [25:22]
        let mut erase_sector_size = (csd[SD_CSD_SECTOR_SIZE_HIGH_WORD]
            & SD_CSD_SECTOR_SIZE_HIGH_MASK)
            << SD_CSD_SECTOR_SIZE_HIGH_SHIFT;
        erase_sector_size |= (csd[SD_CSD_SECTOR_SIZE_LOW_WORD] & SD_CSD_SECTOR_SIZE_LOW_MASK)
            >> SD_CSD_SECTOR_SIZE_LOW_SHIFT;
        erase_sector_size += 1;
        let write_bl_len =
            (csd[SD_CSD_WRITE_BL_LEN_WORD] & SD_CSD_WRITE_BL_LEN_MASK) >> SD_CSD_WRITE_BL_LEN_SHIFT;
        self.erase_grp_size = (erase_sector_size << write_bl_len) / SD_SECTOR_SIZE;

        // WP_GRP_SIZE [38:32], in erase group multiples
        let wp_groups =
            (csd[SD_CSD_WP_GRP_SIZE_WORD] >> SD_CSD_WP_GRP_SIZE_SHIFT) & SD_CSD_WP_GRP_SIZE_MASK;
        self.wp_grp_size = (wp_groups + 1) * self.erase_grp_size;
        Ok(())
    }

    /// CMD6 function-switch query then set, both checked for group-1
    /// acceptance in the 64-byte switch status block.
    fn sd_switch_high_speed(&mut self) -> Result<(), SdError> {
        let mut status = [0u8; SD_SDHC_SWITCH_BLOCK_SIZE as usize];
        self.set_card_block_length(SD_SDHC_SWITCH_BLOCK_SIZE)?;

        let query = SdCommand::new(MMC_SWITCH, SD_SDHC_HIGHSPEED_QUERY, MMC_RSP_R1)
            .with_block_size(SD_SDHC_SWITCH_BLOCK_SIZE);
        self.read_data(&query, &mut status)?;
        if !sd_switch_group1_accepted(&status) {
            return Err(SdError::NotSupported);
        }

        let set = SdCommand::new(MMC_SWITCH, SD_SDHC_HIGHSPEED_SET, MMC_RSP_R1)
            .with_block_size(SD_SDHC_SWITCH_BLOCK_SIZE);
        self.read_data(&set, &mut status)?;
        if !sd_switch_group1_accepted(&status) {
            return Err(SdError::InvalidState);
        }
        Ok(())
    }

    /// ACMD6 to 4-bit, then the host side.
    fn sd_set_bus_width(&mut self) -> Result<(), SdError> {
        let app = SdCommand::new(MMC_APP_CMD, (self.rca as u32) << 16, MMC_RSP_R1);
        self.command(&app)?;
        let cmd = SdCommand::new(SD_APP_SET_BUS_WIDTH, SD_BUS_WIDTH_4BIT, MMC_RSP_R1);
        self.command(&cmd)?;
        self.host.set_bus_width(BusWidth::Width4)
    }

    // ===== MMC identification =====

    fn identify_mmc(&mut self) -> Result<(), SdError> {
        self.read_cid()?;

        // No discovery handshake on MMC, the host assigns the address
        self.rca = 1;
        self.command(&SdCommand::new(
            MMC_SET_RELATIVE_ADDR,
            (self.rca as u32) << 16,
            MMC_RSP_R1,
        ))?;

        self.command(&SdCommand::new(
            MMC_SEND_CSD,
            (self.rca as u32) << 16,
            MMC_RSP_R2,
        ))?;
        self.mmc_decode_csd();

        self.select_card()?;
        if !self.is_transfer_state()? {
            return Err(SdError::InvalidState);
        }

        self.read_ext_csd()?;
        self.mmc_tune_speed()?;
        self.set_card_block_length(SD_SECTOR_SIZE)?;

        info!(
            "inst {}: eMMC ready, {} sectors, mode {:?}, boot partition {} KiB",
            self.instance,
            self.num_sectors,
            self.uhs_mode,
            self.boot_partition_size / 1024
        );
        Ok(())
    }

    fn mmc_decode_csd(&mut self) {
        let csd = self.response;

        // C_SIZE [73:62], C_SIZE_MULT [49:47], READ_BL_LEN [83:80]
        let c_size = ((csd[1] & 0xFFC0_0000) >> 22) | ((csd[2] & 0x3) << 10);
        let c_size_mult = (csd[1] & 0x380) >> 7;
        let read_bl_len = (csd[2] & 0xF00) >> 8;

        self.num_sectors = (c_size + 1) << (c_size_mult + 2);
        if read_bl_len >= SD_SECTOR_SZ_LOG2 {
            self.num_sectors <<= read_bl_len - SD_SECTOR_SZ_LOG2;
        } else {
            self.num_sectors >>= SD_SECTOR_SZ_LOG2 - read_bl_len;
        }

        // ERASE_GRP_SIZE [46:42], ERASE_GRP_MULT [41:37], WRITE_BL_LEN [25:22]
        let erase_grp_mult = ((csd[0] & 0xE000_0000) >> 29) | ((csd[1] & 0x3) << 3);
        let erase_grp_size = (csd[1] & 0x7C) >> 2;
        let write_bl_len = 1u32 << ((csd[0] & 0x3_C000) >> 14);
        self.erase_grp_size =
            (erase_grp_size + 1) * (erase_grp_mult + 1) * write_bl_len / SD_SECTOR_SIZE;

        // WP_GRP_SIZE [36:32], in erase group multiples
        self.wp_grp_size = ((csd[0] & 0x1F00_0000) >> 24) * self.erase_grp_size;
    }

    fn read_ext_csd(&mut self) -> Result<(), SdError> {
        let mut ext_csd = [0u8; SD_SECTOR_SIZE as usize];
        let cmd = SdCommand::new(MMC_SEND_EXT_CSD, 0, MMC_RSP_R1);
        self.read_data(&cmd, &mut ext_csd)?;

        // SEC_COUNT [215:212] overrides the CSD capacity on high-capacity parts
        if self.is_sdhc {
            self.num_sectors = (ext_csd[EXT_CSD_SEC_CNT] as u32)
                | ((ext_csd[EXT_CSD_SEC_CNT + 1] as u32) << 8)
                | ((ext_csd[EXT_CSD_SEC_CNT + 2] as u32) << 16)
                | ((ext_csd[EXT_CSD_SEC_CNT + 3] as u32) << 24);
        }

        self.erase_grp_def_enabled = ext_csd[EXT_CSD_ERASE_GROUP_DEF] & 0x1 != 0;
        if self.erase_grp_def_enabled {
            self.erase_grp_size = (ext_csd[EXT_CSD_HC_ERASE_GRP_SIZE] as u32)
                << (SD_HC_ERASE_UNIT_SIZE_LOG2 - SD_SECTOR_SZ_LOG2);
            self.wp_grp_size = ext_csd[EXT_CSD_HC_WP_GRP_SIZE] as u32 * self.erase_grp_size;
        }

        self.device_type = ext_csd[EXT_CSD_CARD_TYPE];
        self.uhs_mode = self.mmc_pick_speed_mode();
        debug!("inst {}: uhs mode {:?}", self.instance, self.uhs_mode);

        // Cards ship with power-on write protection armed in some cases;
        // clear the configuration before any region is written
        if ext_csd[EXT_CSD_BOOT_WP] != 0 {
            self.configure_write_protection(false, false, AccessRegion::BootPartition1)?;
        }
        if ext_csd[EXT_CSD_USER_WP] != 0 {
            self.configure_write_protection(false, false, AccessRegion::UserArea)?;
        }

        let sec = ext_csd[EXT_CSD_SEC_FEATURE_SUPPORT];
        self.secure_erase_supported = sec & EXT_CSD_SEC_ER_EN != 0;
        self.trim_erase_supported = sec & EXT_CSD_SEC_GB_CL_EN != 0;
        self.sanitize_supported = sec & EXT_CSD_SEC_SANITIZE != 0;

        self.erased_mem_content = ext_csd[EXT_CSD_ERASED_MEM_CONT];

        // Boot partitions are only exposed on slots wired as boot device
        if self.caps.slot_usage == SlotUsage::Boot {
            self.boot_partition_size =
                (ext_csd[EXT_CSD_BOOT_SIZE_MULT] as u32) << EXT_CSD_BOOT_SIZE_MULT_LOG2;
        }
        self.boot_config = ext_csd[EXT_CSD_PART_CONFIG];
        Ok(())
    }

    /// Fastest mode both the device and the host support.
    fn mmc_pick_speed_mode(&self) -> UhsMode {
        let hs200 =
            MMC_DEVICE_TYPE_HS200_SDR_200MHZ_1_8_V | MMC_DEVICE_TYPE_HS200_SDR_200MHZ_1_2_V;
        let ddr =
            MMC_DEVICE_TYPE_HIGHSPEED_DDR_52MHZ_1_8_V | MMC_DEVICE_TYPE_HIGHSPEED_DDR_52MHZ_1_2_V;
        if self.device_type & hs200 != 0 && self.caps.modes.contains(HostModes::SDR104) {
            UhsMode::Sdr104
        } else if self.device_type & ddr != 0 && self.caps.modes.contains(HostModes::DDR50) {
            UhsMode::Ddr50
        } else if self.device_type & MMC_DEVICE_TYPE_HIGHSPEED_52MHZ != 0
            && self.caps.modes.contains(HostModes::SDR50)
        {
            UhsMode::Sdr50
        } else {
            UhsMode::Sdr25
        }
    }

    fn mmc_tune_speed(&mut self) -> Result<(), SdError> {
        if self.uhs_mode == UhsMode::Sdr104 {
            debug!("inst {}: switching to HS200", self.instance);
            self.mmc_select_bus_width(false)?;
            self.is_high_speed = self.mmc_switch_timing(MMC_HS200_SPEED_ARGUMENT).is_ok();
            self.host.set_uhs_mode(UhsMode::Sdr104)?;
            self.host.set_clock(MMC_HS200_TX_CLOCK_KHZ)?;

            // Link training runs on a reduced block size
            self.host.set_block_size(128)?;
            self.host.execute_tuning()?;
            self.host.set_block_size(SD_SECTOR_SIZE)?;
        } else {
            let (speed_arg, clock_khz, ddr) = match self.uhs_mode {
                UhsMode::Ddr50 => (MMC_HIGH_SPEED_ARGUMENT, SD_SDHC_TX_CLOCK_KHZ, true),
                UhsMode::Sdr50 => (MMC_HIGH_SPEED_ARGUMENT, SD_SDHC_TX_CLOCK_KHZ, false),
                _ => (MMC_LEGACY_SPEED_ARGUMENT, SD_TX_CLOCK_KHZ, false),
            };
            let switched = self.mmc_switch_timing(speed_arg).is_ok();
            self.is_high_speed = switched && speed_arg != MMC_LEGACY_SPEED_ARGUMENT;
            self.host.set_clock(clock_khz)?;
            self.mmc_select_bus_width(ddr)?;
            if self.uhs_mode == UhsMode::Ddr50 {
                self.host.set_uhs_mode(UhsMode::Ddr50)?;
            }
        }
        Ok(())
    }

    /// HS_TIMING switch, waiting out the busy phase.
    fn mmc_switch_timing(&mut self, speed_arg: u32) -> Result<(), SdError> {
        let cmd = SdCommand::new(MMC_SWITCH, speed_arg, MMC_RSP_R1B);
        self.command(&cmd)?;
        self.wait_while_programming()
    }

    /// Widest bus first, 4-bit fallback when the 8-bit switch fails.
    fn mmc_select_bus_width(&mut self, ddr: bool) -> Result<(), SdError> {
        let (arg4, arg8) = if ddr {
            (MMC_DDR_MODE_4_BIT_BUSWIDTH, MMC_DDR_MODE_8_BIT_BUSWIDTH)
        } else {
            (MMC_SDR_MODE_4_BIT_BUSWIDTH, MMC_SDR_MODE_8_BIT_BUSWIDTH)
        };
        match self.caps.bus_width {
            BusWidth::Width1 => Ok(()),
            BusWidth::Width4 => self.mmc_set_bus_width(arg4),
            BusWidth::Width8 => {
                if self.mmc_set_bus_width(arg8).is_err() {
                    warn!(
                        "inst {}: 8-bit bus width switch failed, using 4-bit",
                        self.instance
                    );
                    self.mmc_set_bus_width(arg4)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn mmc_set_bus_width(&mut self, width_arg: u32) -> Result<(), SdError> {
        let cmd = SdCommand::new(MMC_SWITCH, MMC_BUS_WIDTH_ARG | (width_arg << 8), MMC_RSP_R1B);
        self.command(&cmd)?;
        self.wait_while_programming()?;

        let host_width = match width_arg {
            MMC_DDR_MODE_8_BIT_BUSWIDTH | MMC_SDR_MODE_8_BIT_BUSWIDTH => BusWidth::Width8,
            MMC_DDR_MODE_4_BIT_BUSWIDTH | MMC_SDR_MODE_4_BIT_BUSWIDTH => BusWidth::Width4,
            _ => BusWidth::Width1,
        };
        self.host.set_bus_width(host_width)
    }

    /// BOOT_WP / USER_WP configuration switch.
    pub(crate) fn configure_write_protection(
        &mut self,
        power_on_wp: bool,
        perm_wp: bool,
        region: AccessRegion,
    ) -> Result<(), SdError> {
        let pwr = power_on_wp as u32;
        let perm = perm_wp as u32;
        let arg = match region {
            AccessRegion::BootPartition1 => {
                ((pwr | (perm << 2) | ((1 - perm) << 4) | ((1 - pwr) << 6)) << 8)
                    | MMC_BOOT_PARTITION_WP_ARG
            }
            AccessRegion::UserArea => {
                ((pwr | (perm << 2) | ((1 - pwr) << 3) | ((1 - perm) << 4)) << 8)
                    | MMC_USER_PARTITION_WP_ARG
            }
            AccessRegion::BootPartition2 => return Err(SdError::InvalidArgument),
        };
        self.command(&SdCommand::new(MMC_SWITCH, arg, MMC_RSP_R1B))?;
        self.wait_while_programming()
    }

    // ===== Shared identification steps =====

    fn read_cid(&mut self) -> Result<(), SdError> {
        self.command(&SdCommand::new(MMC_ALL_SEND_CID, 0, MMC_RSP_R2))?;
        self.cid = self.response;
        debug!(
            "inst {}: CID {:08x} {:08x} {:08x} {:08x}",
            self.instance, self.cid[0], self.cid[1], self.cid[2], self.cid[3]
        );
        Ok(())
    }

    fn select_card(&mut self) -> Result<(), SdError> {
        self.command(&SdCommand::new(
            MMC_SELECT_CARD,
            (self.rca as u32) << 16,
            MMC_RSP_R1B,
        ))
    }

    /// CMD16. Illegal in DDR mode, where the block length is fixed.
    pub(crate) fn set_card_block_length(&mut self, block_size: u32) -> Result<(), SdError> {
        if self.uhs_mode == UhsMode::Ddr50 {
            return Ok(());
        }
        self.command(&SdCommand::new(MMC_SET_BLOCKLEN, block_size, MMC_RSP_R1))?;
        self.block_length_in_use = block_size;
        Ok(())
    }
}

/// Function group 1 result from a CMD6 switch status block,
/// bytes 12..16 viewed as one little-endian word.
fn sd_switch_group1_accepted(status: &[u8]) -> bool {
    let word = u32::from_le_bytes([status[12], status[13], status[14], status[15]]);
    (word >> SD_SDHC_GROUP1_SHIFT) & SD_SDHC_GROUP1_MASK != 0
}
