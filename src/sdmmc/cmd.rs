use log::debug;

use crate::err::SdError;
use crate::host::SdioHost;

use super::{SdmmcDevice, constant::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdType {
    Normal,
    /// Aborts an ongoing data transfer (CMD12).
    Abort,
}

/// One command as handed to the host controller.
#[derive(Debug, Clone, Copy)]
pub struct SdCommand {
    pub opcode: u8,
    pub cmd_type: CmdType,
    pub arg: u32,
    pub resp_type: u32,
    /// Block size of an attached data phase, 512 otherwise.
    pub block_size: u32,
}

impl SdCommand {
    pub fn new(opcode: u8, arg: u32, resp_type: u32) -> Self {
        Self {
            opcode,
            cmd_type: CmdType::Normal,
            arg,
            resp_type,
            block_size: SD_SECTOR_SIZE,
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn abort(mut self) -> Self {
        self.cmd_type = CmdType::Abort;
        self
    }
}

impl<H: SdioHost> SdmmcDevice<H> {
    /// Sends a command and latches its response words, preserving the
    /// host's raw status so callers can tell a timeout from a failure.
    pub(crate) fn try_command(&mut self, cmd: &SdCommand) -> Result<(), SdError> {
        debug!(
            "inst {}: CMD{} arg={:#010x} resp={:#x}",
            self.instance, cmd.opcode, cmd.arg, cmd.resp_type
        );
        self.host.send_command(cmd)?;
        self.host.response(cmd, &mut self.response)
    }

    /// Sends a command, mapping any failure to the offending index.
    pub(crate) fn command(&mut self, cmd: &SdCommand) -> Result<(), SdError> {
        self.try_command(cmd).map_err(|e| match e {
            SdError::CommandFailed(_) => e,
            _ => SdError::CommandFailed(cmd.opcode),
        })
    }

    /// Control-plane data read (switch status, EXT_CSD, WP status).
    pub(crate) fn read_data(&mut self, cmd: &SdCommand, buf: &mut [u8]) -> Result<(), SdError> {
        debug!(
            "inst {}: CMD{} arg={:#010x} read {} bytes",
            self.instance,
            cmd.opcode,
            cmd.arg,
            buf.len()
        );
        let auto_cmd12 = self.auto_cmd12;
        self.host
            .read(cmd, buf, auto_cmd12)
            .map_err(|_| SdError::CommandFailed(cmd.opcode))?;
        self.host
            .response(cmd, &mut self.response)
            .map_err(|_| SdError::CommandFailed(cmd.opcode))
    }

    /// CMD13, leaves the R1 status in `response[0]` and tracks the
    /// protocol state the card reports.
    pub(crate) fn read_card_status(&mut self) -> Result<(), SdError> {
        let cmd = SdCommand::new(MMC_SEND_STATUS, (self.rca as u32) << 16, MMC_RSP_R1);
        self.command(&cmd)?;
        self.card_state = super::CardState::from_status(self.response[0]);
        Ok(())
    }

    pub(crate) fn is_transfer_state(&mut self) -> Result<bool, SdError> {
        self.read_card_status()?;
        Ok(self.card_state == super::CardState::Tran)
    }

    /// Polls CMD13 until the card leaves the program state.
    pub(crate) fn wait_while_programming(&mut self) -> Result<(), SdError> {
        loop {
            self.read_card_status()?;
            if self.card_state != super::CardState::Prg {
                return Ok(());
            }
        }
    }
}
