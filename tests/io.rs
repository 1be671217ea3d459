mod common;

use common::{MockConfig, MockHost, fill_pattern, host_caps};
use sdmmc_blk::blockdev::{SdBlockDev, SdmmcRegistry};
use sdmmc_blk::err::SdError;
use sdmmc_blk::sdmmc::constant::*;

fn open_emmc() -> SdBlockDev<MockHost> {
    let registry = SdmmcRegistry::new(1);
    registry.set_boot_instance(0);
    registry
        .open(0, 0, || Ok(MockHost::new(MockConfig::emmc(), host_caps())))
        .unwrap()
}

#[test]
fn round_trip_various_sizes() {
    let dev = open_emmc();
    let info = dev.device_info();
    assert_eq!(info.bytes_per_sector, 4096);
    let total = info.total_sectors;

    for n in [1u32, 8, 4096] {
        for start in [0, total / 2, total - n] {
            let bytes = (n * info.bytes_per_sector) as usize;
            let mut wr = vec![0u8; bytes];
            fill_pattern(&mut wr, n.wrapping_mul(31).wrapping_add(start));

            dev.write(start, &wr).unwrap();
            let mut rd = vec![0u8; bytes];
            dev.read(start, &mut rd).unwrap();
            assert!(wr == rd, "mismatch for {} sectors at {}", n, start);
        }
    }
}

#[test]
fn oversized_transfer_is_split() {
    let dev = open_emmc();
    let info = dev.device_info();
    // One more sector than a single command may carry
    let n = MMC_SD_MAX_READ_WRITE_SECTORS + 1;
    assert!(n <= info.total_sectors);

    let mut wr = vec![0u8; (n * info.bytes_per_sector) as usize];
    fill_pattern(&mut wr, 0xC0FFEE);
    dev.write(0, &wr).unwrap();

    dev.with_device(|d| {
        let host = d.host_mut();
        // 8191-sector chunk plus a single-sector tail
        assert_eq!(host.count_cmd(MMC_WRITE_MULTIPLE_BLOCK), 1);
        assert_eq!(host.count_cmd(MMC_WRITE_BLOCK), 1);
    });

    let mut rd = vec![0u8; wr.len()];
    dev.read(0, &mut rd).unwrap();
    assert!(wr == rd);
}

#[test]
fn write_crc_error_retried_with_stop() {
    let dev = open_emmc();
    let info = dev.device_info();
    let mut wr = vec![0u8; info.bytes_per_sector as usize];
    fill_pattern(&mut wr, 7);

    // Five consecutive CRC failures still succeed on the final retry
    dev.with_device(|d| d.host_mut().write_crc_failures = 5);
    dev.write(3, &wr).unwrap();

    dev.with_device(|d| {
        let host = d.host_mut();
        assert_eq!(host.count_cmd(MMC_WRITE_BLOCK), 6);
        // every retry is preceded by a stop-transmission
        assert_eq!(host.count_cmd(MMC_STOP_TRANSMISSION), 5);
    });

    let mut rd = vec![0u8; wr.len()];
    dev.read(3, &mut rd).unwrap();
    assert!(wr == rd);
}

#[test]
fn write_crc_error_budget_exhausted() {
    let dev = open_emmc();
    let info = dev.device_info();
    let wr = vec![0x5Au8; info.bytes_per_sector as usize];

    dev.with_device(|d| d.host_mut().write_crc_failures = 6);
    let err = dev.write(3, &wr).unwrap_err();
    assert_eq!(err, SdError::CommandFailed(MMC_WRITE_BLOCK));

    // Initial attempt plus the five-retry budget, nothing more
    dev.with_device(|d| assert_eq!(d.host_mut().count_cmd(MMC_WRITE_BLOCK), 6));
}

#[test]
fn data_timeout_recovers_through_reidentification() {
    let dev = open_emmc();
    let info = dev.device_info();
    let mut wr = vec![0u8; 8 * info.bytes_per_sector as usize];
    fill_pattern(&mut wr, 99);
    dev.write(16, &wr).unwrap();

    dev.with_device(|d| d.host_mut().data_timeout_failures = 1);
    let mut rd = vec![0u8; wr.len()];
    dev.read(16, &mut rd).unwrap();
    assert!(wr == rd);

    dev.with_device(|d| {
        let host = d.host_mut();
        assert_eq!(host.soft_resets, 1);
        // identification ran once at open and once for recovery
        assert_eq!(host.count_cmd(MMC_ALL_SEND_CID), 2);
    });
}

#[test]
fn data_timeout_recovery_budget_exhausted() {
    let dev = open_emmc();
    let info = dev.device_info();

    dev.with_device(|d| d.host_mut().data_timeout_failures = 10);
    let mut rd = vec![0u8; info.bytes_per_sector as usize];
    let err = dev.read(0, &mut rd).unwrap_err();
    assert_eq!(err, SdError::DataTimeout);

    dev.with_device(|d| {
        assert_eq!(d.host_mut().soft_resets, MAX_CONTROLLER_RESET_RETRIES);
    });
}

#[test]
fn rejects_bad_parameters() {
    let dev = open_emmc();
    let info = dev.device_info();

    let mut empty: [u8; 0] = [];
    assert_eq!(dev.read(0, &mut empty), Err(SdError::InvalidArgument));

    let mut short = vec![0u8; 100];
    assert_eq!(dev.read(0, &mut short), Err(SdError::InvalidArgument));

    let mut one = vec![0u8; info.bytes_per_sector as usize];
    assert_eq!(
        dev.read(info.total_sectors, &mut one),
        Err(SdError::InvalidArgument)
    );
    assert_eq!(
        dev.write(info.total_sectors - 1, &vec![0u8; 2 * info.bytes_per_sector as usize]),
        Err(SdError::InvalidArgument)
    );
}
