//! SD/MMC/eMMC block-storage driver.
//!
//! Sits between a generic block-device abstraction and an SDIO
//! command/transport layer supplied by the embedder through the
//! [`host::SdioHost`] trait. Identifies the inserted card or embedded
//! eMMC device, negotiates bus width and speed mode, maps the flat
//! logical sector space onto the card's physical regions (user area
//! plus up to two boot partitions) and performs block I/O, erase/trim
//! and boot-time partition bookkeeping on top of it.

#![no_std]

extern crate alloc;

pub mod blockdev;
pub mod err;
pub mod host;
pub mod sdmmc;

pub use err::SdError;

/// Index of the highest set bit, for power-of-two scale factors.
pub(crate) fn floor_log2(x: u32) -> u32 {
    debug_assert!(x != 0);
    31 - x.leading_zeros()
}
