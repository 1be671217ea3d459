// ===== Transfer Engine =====
//
// Multi-sector read/write in block-device sector units. A transfer is
// split at boot/user region boundaries and at the per-command sector
// cap, retried locally on write CRC errors and recovered through a
// controller reset plus full re-identification on card-level data
// errors before anything is reported to the caller.

use log::{debug, warn};

use crate::err::SdError;
use crate::floor_log2;
use crate::host::{BusWidth, ResetScope, SdioHost};

use super::{CardState, SdmmcDevice, cmd::SdCommand, constant::*};

pub enum DataBuffer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl DataBuffer<'_> {
    fn len(&self) -> usize {
        match self {
            DataBuffer::Read(buf) => buf.len(),
            DataBuffer::Write(buf) => buf.len(),
        }
    }

    fn is_read(&self) -> bool {
        matches!(self, DataBuffer::Read(_))
    }
}

impl<H: SdioHost> SdmmcDevice<H> {
    /// Reads block-device sectors starting at `block_num`. The buffer
    /// length determines the sector count.
    pub fn read_sectors(&mut self, block_num: u32, buf: &mut [u8]) -> Result<(), SdError> {
        let res = self.transfer(block_num, DataBuffer::Read(buf));
        self.end_transfer(res)
    }

    pub fn write_sectors(&mut self, block_num: u32, buf: &[u8]) -> Result<(), SdError> {
        let res = self.transfer(block_num, DataBuffer::Write(buf));
        self.end_transfer(res)
    }

    fn transfer(&mut self, mut block_num: u32, mut data: DataBuffer<'_>) -> Result<(), SdError> {
        let bytes_log2 = floor_log2(BLOCK_BYTES_PER_SECTOR);
        let len = data.len();
        if len == 0 || len & ((1 << bytes_log2) - 1) != 0 {
            return Err(SdError::InvalidArgument);
        }
        let num_blocks = (len >> bytes_log2) as u32;

        let total = self.total_block_dev_sectors();
        if block_num >= total || num_blocks > total - block_num {
            return Err(SdError::InvalidArgument);
        }

        debug!(
            "inst {}: {} {} sectors at {}",
            self.instance,
            if data.is_read() { "read" } else { "write" },
            num_blocks,
            block_num
        );

        let mut residue = num_blocks;
        let mut reset_retry = 0u32;
        while residue > 0 {
            let mut run_start = block_num;
            let mut run_blocks = residue;
            // Clip the run to one region and switch the card to it
            self.select_region_blocks(&mut run_start, &mut run_blocks, true)?;

            let run_buf_base = ((num_blocks - residue) as usize) << bytes_log2;
            let mut current = run_blocks;
            let mut start = run_start;
            let mut chunk_off = 0usize;
            let mut recovered = false;

            while current > 0 {
                let chunk = current.min(MMC_SD_MAX_READ_WRITE_SECTORS);
                let size = (chunk as usize) << bytes_log2;
                let buf_at = run_buf_base + chunk_off;

                if !self.is_transfer_state().unwrap_or(false) {
                    return Err(SdError::InvalidState);
                }

                let cmd = self.data_command(start, chunk, data.is_read(), bytes_log2);
                let mut status = self.run_data_command(&cmd, &mut data, buf_at, size);

                // Whole-transfer retry on write CRC errors, stopping any
                // half-finished transmission first
                if !data.is_read() {
                    let mut retry = MAX_WRITE_RETRY_COUNT;
                    while matches!(status, Err(SdError::DataCrc)) && retry > 0 {
                        warn!(
                            "inst {}: write CRC error at sector {}, retrying",
                            self.instance, start
                        );
                        let _ = self.stop_transmission_if_needed();
                        status = self.run_data_command(&cmd, &mut data, buf_at, size);
                        retry -= 1;
                    }
                }

                match status {
                    Ok(()) => {
                        self.fetch_data_response(&cmd)?;
                        if !self.auto_cmd12 && chunk > 1 {
                            self.send_stop_transmission(data.is_read())?;
                        }
                        reset_retry = 0;
                        current -= chunk;
                        start += chunk;
                        chunk_off += size;
                    }
                    Err(SdError::DataTimeout) => {
                        self.fetch_data_response(&cmd)?;
                        self.read_card_status()?;
                        if self.response[0] & MMC_READ_WRITE_ERROR_MASK == 0 {
                            return Err(SdError::CommandFailed(cmd.opcode));
                        }
                        // Card-level data fault: reset the controller and
                        // take the card through identification again
                        if reset_retry >= MAX_CONTROLLER_RESET_RETRIES {
                            return Err(SdError::DataTimeout);
                        }
                        reset_retry += 1;
                        warn!(
                            "inst {}: data timeout, controller reset {}/{}",
                            self.instance, reset_retry, MAX_CONTROLLER_RESET_RETRIES
                        );
                        self.host.soft_reset(ResetScope::All)?;
                        let _ = self.host.set_clock(MMC_IDENT_CLOCK_KHZ);
                        let _ = self.host.set_bus_width(BusWidth::Width1);
                        self.identify()?;
                        recovered = true;
                        break;
                    }
                    Err(_) => return Err(SdError::CommandFailed(cmd.opcode)),
                }
            }

            // The region run is only consumed when it completed; after a
            // recovery the same run is replayed from its first sector
            if !recovered {
                residue -= run_blocks;
                block_num += run_blocks;
            }
        }
        Ok(())
    }

    fn data_command(&self, start: u32, blocks: u32, is_read: bool, bytes_log2: u32) -> SdCommand {
        let opcode = match (is_read, blocks > 1) {
            (true, false) => MMC_READ_SINGLE_BLOCK,
            (true, true) => MMC_READ_MULTIPLE_BLOCK,
            (false, false) => MMC_WRITE_BLOCK,
            (false, true) => MMC_WRITE_MULTIPLE_BLOCK,
        };
        // Block addressing on high-capacity cards, byte addressing otherwise
        let arg = if self.is_sdhc {
            start << self.sectors_per_page_log2
        } else {
            start << bytes_log2
        };
        SdCommand::new(opcode, arg, MMC_RSP_R1)
    }

    fn run_data_command(
        &mut self,
        cmd: &SdCommand,
        data: &mut DataBuffer<'_>,
        offset: usize,
        size: usize,
    ) -> Result<(), SdError> {
        let auto_cmd12 = self.auto_cmd12;
        match data {
            DataBuffer::Read(buf) => {
                self.host
                    .read(cmd, &mut buf[offset..offset + size], auto_cmd12)
            }
            DataBuffer::Write(buf) => self.host.write(cmd, &buf[offset..offset + size], auto_cmd12),
        }
    }

    fn fetch_data_response(&mut self, cmd: &SdCommand) -> Result<(), SdError> {
        self.host
            .response(cmd, &mut self.response)
            .map_err(|_| SdError::CommandFailed(cmd.opcode))
    }

    fn send_stop_transmission(&mut self, is_read: bool) -> Result<(), SdError> {
        let resp = if is_read { MMC_RSP_R1 } else { MMC_RSP_R1B };
        self.command(&SdCommand::new(MMC_STOP_TRANSMISSION, 0, resp).abort())
    }

    /// CMD12 if the card was left mid data phase.
    pub(crate) fn stop_transmission_if_needed(&mut self) -> Result<(), SdError> {
        let in_tran = self.is_transfer_state()?;
        if !in_tran && matches!(self.card_state, CardState::Rcv | CardState::Data) {
            self.command(&SdCommand::new(MMC_STOP_TRANSMISSION, 0, MMC_RSP_R1B).abort())?;
        }
        Ok(())
    }

    /// Any exit path leaving the card in a data phase gets a final
    /// CMD12; its failure never masks an earlier error.
    fn end_transfer(&mut self, res: Result<(), SdError>) -> Result<(), SdError> {
        let in_tran = self.is_transfer_state().unwrap_or(false);
        if !in_tran && matches!(self.card_state, CardState::Rcv | CardState::Data) {
            let stop = self.command(&SdCommand::new(MMC_STOP_TRANSMISSION, 0, MMC_RSP_R1B).abort());
            if res.is_ok() {
                stop?;
            }
        }
        res
    }

    /// Whole logical space in block-device sectors, boot partitions
    /// included.
    pub(crate) fn total_block_dev_sectors(&self) -> u32 {
        let total_512 = self.num_sectors + (self.boot_part_sectors() << 1);
        total_512 >> self.sectors_per_page_log2
    }
}
