//! Block-device surface: controller registry, partition handles,
//! lifecycle and the operation set the partition manager drives.
//!
//! One [`SdmmcDevice`] exists per physical controller and is shared by
//! every partition opened on it; a single per-controller lock
//! serializes command issuance, erase and partition-table mutation.
//! Independent controllers proceed in parallel.

extern crate alloc;

pub mod part;

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, info};
use spin::Mutex;

use crate::err::SdError;
use crate::host::SdioHost;
use crate::sdmmc::cmd::SdCommand;
use crate::sdmmc::constant::*;
use crate::sdmmc::region::AccessRegion;
use crate::sdmmc::SdmmcDevice;

pub use part::{
    AllocatedPartition, AllocationType, PartitionAttributes, PartitionKind, PartitionRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Fixed,
}

/// Geometry reported to the block-device manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub bytes_per_sector: u32,
    pub sectors_per_block: u32,
    /// Block-device sectors, boot partitions included.
    pub total_sectors: u32,
    pub total_blocks: u32,
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStatus {
    pub is_good: bool,
    pub is_locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProtectionType {
    Permanent,
    PowerOn,
    Disable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionOperation {
    Begin,
    /// Layout done: the in-memory table is dropped.
    Finish,
}

impl<H: SdioHost> SdmmcDevice<H> {
    /// Geometry derived from capacity and erase group size. Blocks are
    /// erase-group sized but never above 2 MiB.
    pub fn device_info(&self) -> DeviceInfo {
        let bytes_per_sector = BLOCK_BYTES_PER_SECTOR;
        let erase_bytes = self.erase_grp_size * SD_SECTOR_SIZE;
        let sectors_per_block = if erase_bytes > MAX_BLOCK_SIZE {
            MAX_SECTORS_PER_BLOCK
        } else {
            (erase_bytes / bytes_per_sector).max(1)
        };
        let total_sectors = self.total_block_dev_sectors();
        DeviceInfo {
            bytes_per_sector,
            sectors_per_block,
            total_sectors,
            total_blocks: total_sectors / sectors_per_block,
            device_type: DeviceType::Fixed,
        }
    }
}

struct RegistryInner<H: SdioHost> {
    devices: Vec<Option<Arc<Mutex<SdmmcDevice<H>>>>>,
    /// Controller kept open for the life of the process, torn down only
    /// by `deinit`.
    boot_instance: Option<u32>,
}

/// Process-wide table of controller instances. Cloned handles share the
/// same table; construct it once and hand it to whoever opens devices.
pub struct SdmmcRegistry<H: SdioHost> {
    inner: Arc<Mutex<RegistryInner<H>>>,
}

impl<H: SdioHost> Clone for SdmmcRegistry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: SdioHost> SdmmcRegistry<H> {
    pub fn new(max_instances: u32) -> Self {
        let mut devices = Vec::new();
        devices.resize_with(max_instances as usize, || None);
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                devices,
                boot_instance: None,
            })),
        }
    }

    /// Marks the controller holding the boot device; its state survives
    /// the last close and is only dropped by [`SdmmcRegistry::deinit`].
    pub fn set_boot_instance(&self, instance: u32) {
        self.inner.lock().boot_instance = Some(instance);
    }

    /// Opens a partition handle. The first open of a controller builds
    /// the transport via `host_init` and identifies the card; further
    /// opens share the existing device state.
    pub fn open<F>(
        &self,
        instance: u32,
        minor_instance: u32,
        host_init: F,
    ) -> Result<SdBlockDev<H>, SdError>
    where
        F: FnOnce() -> Result<H, SdError>,
    {
        let mut inner = self.inner.lock();
        let slot = inner
            .devices
            .get_mut(instance as usize)
            .ok_or(SdError::InvalidArgument)?;

        let dev = match slot {
            Some(dev) => dev.clone(),
            None => {
                debug!("opening controller instance {}", instance);
                let host = host_init()?;
                let mut device = SdmmcDevice::new(host, instance);
                device.identify()?;
                let dev = Arc::new(Mutex::new(device));
                *slot = Some(dev.clone());
                dev
            }
        };

        {
            let mut d = dev.lock();
            d.ref_count += 1;
            d.power_up_counter += 1;
        }
        info!("opened instance {} minor {}", instance, minor_instance);

        Ok(SdBlockDev {
            registry: self.inner.clone(),
            dev,
            instance,
            minor_instance,
            powered: true,
        })
    }

    /// Tears down the boot-device exception kept across closes.
    pub fn deinit(&self) {
        let mut inner = self.inner.lock();
        if let Some(instance) = inner.boot_instance.take() {
            if let Some(slot) = inner.devices.get_mut(instance as usize) {
                *slot = None;
            }
        }
    }
}

/// One opened minor instance (partition) of a controller.
///
/// Every operation acquires the controller lock for its entire
/// duration; dropping the handle closes it.
pub struct SdBlockDev<H: SdioHost> {
    registry: Arc<Mutex<RegistryInner<H>>>,
    dev: Arc<Mutex<SdmmcDevice<H>>>,
    instance: u32,
    minor_instance: u32,
    /// Per-handle flag making power transitions idempotent.
    powered: bool,
}

impl<H: SdioHost> core::fmt::Debug for SdBlockDev<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdBlockDev")
            .field("instance", &self.instance)
            .field("minor_instance", &self.minor_instance)
            .field("powered", &self.powered)
            .finish()
    }
}

impl<H: SdioHost> SdBlockDev<H> {
    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn minor_instance(&self) -> u32 {
        self.minor_instance
    }

    /// Runs `f` under the controller lock. Escape hatch for embedders
    /// that need at the device state or the transport (IRQ acks etc.).
    pub fn with_device<R>(&self, f: impl FnOnce(&mut SdmmcDevice<H>) -> R) -> R {
        let mut dev = self.dev.lock();
        f(&mut dev)
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.dev.lock().device_info()
    }

    /// Reads whole block-device sectors; the buffer length sets the
    /// count.
    pub fn read(&self, block_num: u32, buf: &mut [u8]) -> Result<(), SdError> {
        self.dev.lock().read_sectors(block_num, buf)
    }

    pub fn write(&self, block_num: u32, buf: &[u8]) -> Result<(), SdError> {
        self.dev.lock().write_sectors(block_num, buf)
    }

    /// Resumes the transport on the first powered handle.
    pub fn power_up(&mut self) {
        let mut dev = self.dev.lock();
        if !self.powered && dev.power_up_counter < dev.ref_count {
            dev.power_up_counter += 1;
            self.powered = true;
            if dev.power_up_counter == 1 {
                let _ = dev.host_mut().resume(true);
            }
        }
    }

    /// Suspends the transport when the last powered handle lets go.
    pub fn power_down(&mut self) {
        let mut dev = self.dev.lock();
        if self.powered && dev.power_up_counter > 0 {
            dev.power_up_counter -= 1;
            self.powered = false;
            if dev.power_up_counter == 0 {
                let _ = dev.host_mut().suspend(false);
            }
        }
    }

    pub fn close(self) {}

    // ===== Partition-manager operation surface =====

    /// Raw sector read, device-level handles only.
    pub fn read_physical(&self, sector: u32, buf: &mut [u8]) -> Result<(), SdError> {
        if self.minor_instance != 0 {
            return Err(SdError::NotSupported);
        }
        self.read(sector, buf)
    }

    pub fn write_physical(&self, sector: u32, buf: &[u8]) -> Result<(), SdError> {
        if self.minor_instance != 0 {
            return Err(SdError::NotSupported);
        }
        self.write(sector, buf)
    }

    /// Logical and physical sector numbers coincide on SD/eMMC.
    pub fn map_logical_to_physical(&self, logical_sector: u32) -> Result<u32, SdError> {
        if self.minor_instance != 0 {
            return Err(SdError::NotSupported);
        }
        Ok(logical_sector)
    }

    /// Region-relative bounds of a logical span, no region switch.
    pub fn partition_physical_bounds(
        &self,
        logical_start: u32,
        logical_stop: u32,
    ) -> Result<(u32, u32), SdError> {
        let mut dev = self.dev.lock();
        let mut phys = logical_start;
        let mut one = 1u32;
        dev.select_region_blocks(&mut phys, &mut one, false)?;
        let delta = phys.wrapping_sub(logical_start);
        Ok((phys, logical_stop.wrapping_add(delta)))
    }

    /// Erases every logical sector, boot partitions included.
    pub fn format_device(&self) -> Result<(), SdError> {
        let mut dev = self.dev.lock();
        dev.do_secure_erase = false;
        dev.do_trim_erase = false;
        dev.do_sanitize = false;
        let total = dev.capacity_sectors() + (dev.boot_partition_bytes() >> SD_SECTOR_SZ_LOG2 << 1);
        dev.erase_sectors(0, total)
    }

    pub fn partition_operation(&self, op: PartitionOperation) -> Result<(), SdError> {
        if self.minor_instance != 0 {
            return Err(SdError::NotSupported);
        }
        if op == PartitionOperation::Finish {
            self.dev.lock().free_partition_table();
        }
        Ok(())
    }

    /// Boot-time partition allocation, device-level handles only.
    pub fn allocate_partition(
        &self,
        request: &PartitionRequest,
    ) -> Result<AllocatedPartition, SdError> {
        if self.minor_instance != 0 {
            return Err(SdError::NotSupported);
        }
        self.dev.lock().alloc_partition(request)
    }

    /// Erase of logical block-device sectors. Secure requests use
    /// sanitize when the card has it, secure-erase otherwise; trim is
    /// taken when supported.
    pub fn erase_logical_sectors(
        &self,
        start_sector: u32,
        num_sectors: u32,
        secure: bool,
        trim: bool,
    ) -> Result<(), SdError> {
        let mut dev = self.dev.lock();
        dev.arm_erase_flags(secure);

        let start = start_sector << dev.sectors_per_page_log2();
        let num = num_sectors << dev.sectors_per_page_log2();
        if trim && dev.trim_supported() {
            dev.do_trim_erase = true;
            dev.trim_erase_sectors(start, num)
        } else {
            dev.do_trim_erase = false;
            dev.erase_sectors(start, num)
        }
    }

    /// Block-granular erase. The trim path hardware-trims; without trim
    /// the blocks are rewritten with the erased pattern.
    pub fn erase_physical_block(
        &self,
        block_num: u32,
        num_blocks: u32,
        secure: bool,
        trim: bool,
    ) -> Result<(), SdError> {
        let mut dev = self.dev.lock();
        dev.arm_erase_flags(secure);

        let info = dev.device_info();
        let start = block_num * info.sectors_per_block << dev.sectors_per_page_log2();
        let num = num_blocks * info.sectors_per_block << dev.sectors_per_page_log2();
        if trim && dev.trim_supported() {
            dev.do_trim_erase = true;
            dev.trim_erase_sectors(start, num)
        } else {
            dev.do_trim_erase = false;
            dev.fill_logical_sectors(start, num)
        }
    }

    /// Write-protects (or clears protection on) whole WP groups.
    pub fn lock_region(
        &self,
        start_sector: u32,
        num_sectors: u32,
        enable: bool,
    ) -> Result<(), SdError> {
        self.dev.lock().lock_region(start_sector, num_sectors, enable)
    }

    /// There is no bad-block concept on SD/eMMC; lock state comes from
    /// the card's write-protect query.
    pub fn block_status(&self, block_num: u32) -> Result<BlockStatus, SdError> {
        let mut dev = self.dev.lock();
        let info = dev.device_info();
        let sector = block_num * info.sectors_per_block << dev.sectors_per_page_log2();
        let locked = dev.query_write_protect(sector)?;
        Ok(BlockStatus {
            is_good: true,
            is_locked: locked,
        })
    }

    pub fn configure_write_protection(
        &self,
        protection: WriteProtectionType,
        enable: bool,
        region: AccessRegion,
    ) -> Result<(), SdError> {
        let (power_on, permanent) = match protection {
            WriteProtectionType::PowerOn => (enable, false),
            WriteProtectionType::Permanent => (false, enable),
            WriteProtectionType::Disable => (false, false),
        };
        self.dev
            .lock()
            .configure_write_protection(power_on, permanent, region)
    }

    pub fn write_verify_mode(&self, enable: bool) {
        self.dev.lock().read_verify_write = enable;
    }
}

impl<H: SdioHost> Drop for SdBlockDev<H> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        let teardown = {
            let mut dev = self.dev.lock();
            if dev.ref_count > 1 {
                dev.ref_count -= 1;
                if self.powered && dev.power_up_counter > 0 {
                    dev.power_up_counter -= 1;
                }
                false
            } else {
                dev.ref_count = 0;
                dev.power_up_counter = 0;
                true
            }
        };
        self.powered = false;

        // The boot device stays open until the registry is deinited
        if teardown && registry.boot_instance != Some(self.instance) {
            if let Some(slot) = registry.devices.get_mut(self.instance as usize) {
                *slot = None;
            }
            debug!("closed controller instance {}", self.instance);
        }
    }
}

impl<H: SdioHost> SdmmcDevice<H> {
    pub fn sectors_per_page_log2(&self) -> u32 {
        self.sectors_per_page_log2
    }

    fn trim_supported(&self) -> bool {
        self.trim_erase_supported
    }

    /// Secure requests prefer sanitize over secure-erase.
    fn arm_erase_flags(&mut self, secure: bool) {
        self.do_secure_erase = false;
        self.do_sanitize = false;
        if secure {
            if self.sanitize_supported {
                self.do_sanitize = true;
            } else if self.secure_erase_supported {
                self.do_secure_erase = true;
            }
        }
    }

    /// CMD28/29 across every write-protect group in the range.
    fn lock_region(
        &mut self,
        start_sector: u32,
        num_sectors: u32,
        enable: bool,
    ) -> Result<(), SdError> {
        if self.wp_grp_size == 0 {
            return Err(SdError::NotSupported);
        }
        let factor = 1u32 << self.sectors_per_page_log2;
        let mut total = num_sectors;
        let mut start = start_sector;

        while total > 0 {
            let mut rel = start;
            let mut in_region = total;
            self.select_region_blocks(&mut rel, &mut in_region, true)?;

            let rel_sectors = rel * factor;
            let span_sectors = in_region * factor;
            if rel_sectors % self.wp_grp_size != 0 || span_sectors % self.wp_grp_size != 0 {
                return Err(SdError::LockUnaligned);
            }

            let opcode = if enable {
                MMC_SET_WRITE_PROT
            } else {
                MMC_CLR_WRITE_PROT
            };
            let mut group_addr = rel_sectors;
            for _ in 0..span_sectors / self.wp_grp_size {
                let cmd = SdCommand::new(opcode, group_addr, MMC_RSP_R1B);
                self.command(&cmd).map_err(|_| SdError::LockFailure)?;
                self.wait_while_programming()?;
                group_addr += self.wp_grp_size;
            }

            total -= in_region;
            start += in_region;
        }
        Ok(())
    }

    /// CMD30: 32 write-protect group bits, LSB is the addressed group.
    fn query_write_protect(&mut self, sector: u32) -> Result<bool, SdError> {
        let mut status = [0u8; 4];
        let arg = if self.is_high_capacity() {
            sector
        } else {
            sector * SD_SECTOR_SIZE
        };
        let cmd = SdCommand::new(MMC_SEND_WRITE_PROT, arg, MMC_RSP_R1).with_block_size(4);
        self.read_data(&cmd, &mut status)?;
        Ok(status[0] & 0x1 != 0)
    }
}
