//! Command/transport seam towards the SDIO host controller.
//!
//! Everything below this trait (register access, DMA, clock dividers,
//! interrupt plumbing) belongs to the controller driver supplied by the
//! embedder. The protocol layer only ever talks through these calls.

use bitflags::bitflags;

use crate::err::SdError;
use crate::sdmmc::cmd::SdCommand;

bitflags! {
    /// Host controller mode and feature capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HostModes: u32 {
        /// Controller issues CMD12 by itself after multi-block transfers.
        const AUTO_CMD12 = 1 << 0;
        const HIGH_SPEED = 1 << 1;
        const SDR50 = 1 << 2;
        const DDR50 = 1 << 3;
        /// SDR104 for SD, doubles as HS200 capability for eMMC.
        const SDR104 = 1 << 4;
    }
}

/// What the board wired this slot up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotUsage {
    #[default]
    Unknown,
    /// Removable media slot.
    Media,
    /// Embedded boot device, boot partitions are exposed.
    Boot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusWidth {
    #[default]
    Width1,
    Width4,
    Width8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UhsMode {
    #[default]
    Sdr12,
    Sdr25,
    Sdr50,
    /// HS200 on eMMC.
    Sdr104,
    Ddr50,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    All,
    CmdLine,
    DataLine,
}

/// Static properties of one controller instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCapabilities {
    pub modes: HostModes,
    /// Widest data bus wired to the card.
    pub bus_width: BusWidth,
    pub slot_usage: SlotUsage,
}

/// One SDIO host controller instance.
///
/// `send_command` posts a command and reports its completion status;
/// the decoded response words are fetched separately with `response`,
/// mirroring the split on real controllers where the response registers
/// stay valid until the next command. Implementations map their error
/// interrupt bits onto `SdError::{Timeout, Crc, DataTimeout, DataCrc}`
/// so the protocol layer can tell recovery cases apart.
pub trait SdioHost {
    fn capabilities(&self) -> HostCapabilities;

    fn send_command(&mut self, cmd: &SdCommand) -> Result<(), SdError>;

    fn response(&mut self, cmd: &SdCommand, response: &mut [u32; 4]) -> Result<(), SdError>;

    /// Data-read command: posts `cmd` and moves `buf.len()` bytes from
    /// the card. `auto_cmd12` asks the controller to close a multi-block
    /// transfer by itself where supported.
    fn read(&mut self, cmd: &SdCommand, buf: &mut [u8], auto_cmd12: bool) -> Result<(), SdError>;

    fn write(&mut self, cmd: &SdCommand, buf: &[u8], auto_cmd12: bool) -> Result<(), SdError>;

    /// Returns the rate actually configured.
    fn set_clock(&mut self, freq_khz: u32) -> Result<u32, SdError>;

    fn set_bus_width(&mut self, width: BusWidth) -> Result<(), SdError>;

    fn set_uhs_mode(&mut self, mode: UhsMode) -> Result<(), SdError>;

    /// Transfer block size on the controller side.
    fn set_block_size(&mut self, block_size: u32) -> Result<(), SdError>;

    /// Clock/data tuning procedure for HS200-class modes.
    fn execute_tuning(&mut self) -> Result<(), SdError> {
        Ok(())
    }

    fn soft_reset(&mut self, scope: ResetScope) -> Result<(), SdError>;

    fn suspend(&mut self, switch_device_power: bool) -> Result<(), SdError>;

    fn resume(&mut self, switch_device_power: bool) -> Result<(), SdError>;

    fn delay_ms(&mut self, ms: u32);
}
