#![allow(unused)]

// SD/MMC command definitions
// Basic commands (class 0 and class 1)
pub const MMC_GO_IDLE_STATE: u8 = 0;
pub const MMC_SEND_OP_COND: u8 = 1;
pub const MMC_ALL_SEND_CID: u8 = 2;
pub const MMC_SET_RELATIVE_ADDR: u8 = 3;
pub const MMC_SET_DSR: u8 = 4;
pub const MMC_SWITCH: u8 = 6;
pub const MMC_SELECT_CARD: u8 = 7;
pub const MMC_SEND_EXT_CSD: u8 = 8;
pub const MMC_SEND_CSD: u8 = 9;
pub const MMC_SEND_CID: u8 = 10;
pub const MMC_STOP_TRANSMISSION: u8 = 12;
pub const MMC_SEND_STATUS: u8 = 13;

// Block-oriented read/write commands (class 2 and class 4)
pub const MMC_SET_BLOCKLEN: u8 = 16;
pub const MMC_READ_SINGLE_BLOCK: u8 = 17;
pub const MMC_READ_MULTIPLE_BLOCK: u8 = 18;
pub const MMC_WRITE_BLOCK: u8 = 24;
pub const MMC_WRITE_MULTIPLE_BLOCK: u8 = 25;

// Write protection commands (class 6)
pub const MMC_SET_WRITE_PROT: u8 = 28;
pub const MMC_CLR_WRITE_PROT: u8 = 29;
pub const MMC_SEND_WRITE_PROT: u8 = 30;

// Erase commands (class 5)
pub const MMC_ERASE_GROUP_START: u8 = 35;
pub const MMC_ERASE_GROUP_END: u8 = 36;
pub const MMC_ERASE: u8 = 38;
pub const SD_ERASE_WR_BLK_START: u8 = 32;
pub const SD_ERASE_WR_BLK_END: u8 = 33;

// Application-specific commands (class 8)
pub const MMC_APP_CMD: u8 = 55;

// SD-only command indices
pub const SD_SEND_IF_COND: u8 = 8;
pub const SD_APP_SET_BUS_WIDTH: u8 = 6;
pub const SD_APP_SEND_OP_COND: u8 = 41;

// Response types
pub const MMC_RSP_PRESENT: u32 = 1 << 0;
pub const MMC_RSP_136: u32 = 1 << 1; // 136-bit response
pub const MMC_RSP_CRC: u32 = 1 << 2; // Expect valid CRC
pub const MMC_RSP_BUSY: u32 = 1 << 3; // Card may send busy
pub const MMC_RSP_OPCODE: u32 = 1 << 4; // Response contains opcode

pub const MMC_RSP_NONE: u32 = 0;
pub const MMC_RSP_R1: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE;
pub const MMC_RSP_R1B: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE | MMC_RSP_BUSY;
pub const MMC_RSP_R2: u32 = MMC_RSP_PRESENT | MMC_RSP_136 | MMC_RSP_CRC;
pub const MMC_RSP_R3: u32 = MMC_RSP_PRESENT;
pub const MMC_RSP_R6: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE;
pub const MMC_RSP_R7: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE;

// Sector geometry
pub const SD_SECTOR_SIZE: u32 = 512;
pub const SD_SECTOR_SZ_LOG2: u32 = 9;
/// Sector size presented to the block-device layer.
pub const BLOCK_BYTES_PER_SECTOR: u32 = SD_SECTOR_SIZE << 3;
pub const MAX_SECTORS_PER_BLOCK: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 2 * 1024 * 1024;

// Largest single transfer, in block-device sectors
pub const MMC_SD_MAX_READ_WRITE_SECTORS: u32 = 0x1FFF;
pub const MAX_WRITE_RETRY_COUNT: u32 = 5;
pub const MAX_CONTROLLER_RESET_RETRIES: u32 = 3;

// Clock rates
pub const SD_IDENT_CLOCK_KHZ: u32 = 200;
pub const MMC_IDENT_CLOCK_KHZ: u32 = 100;
pub const SD_TX_CLOCK_KHZ: u32 = 25_000;
pub const SD_SDHC_TX_CLOCK_KHZ: u32 = 50_000;
pub const MMC_HS200_TX_CLOCK_KHZ: u32 = 200_000;

// OCR handshake
pub const SD_HOST_VOLTAGE_RANGE: u32 = 0x100;
pub const SD_HOST_CHECK_PATTERN: u32 = 0xAA;
pub const SD_CARD_OCR_VALUE: u32 = 0x0030_0000;
pub const SD_CARD_POWERUP_STATUS_MASK: u32 = 0x8000_0000;
pub const SD_CARD_CAPACITY_MASK: u32 = 0x4000_0000;
pub const MMC_EXPECTED_OCR: u32 = 0x40FF_8080;
pub const MMC_WAKE_POLL_LIMIT: u32 = 100;
pub const MMC_WAKE_POLL_MS: u32 = 10;

// SD CSD fields (response-word relative, CRC byte stripped)
pub const SD_SDHC_CSIZE_MASK: u32 = 0x3FFF_FF00;
pub const SD_SDHC_CSIZE_WORD: usize = 1;
pub const SD_SDHC_CSIZE_SHIFT: u32 = 8;
pub const SD_SDHC_CSIZE_MULTIPLIER: u32 = 1024;
pub const SD_CSD_BLOCK_LEN_WORD: usize = 2;
pub const SD_CSD_BLOCK_LEN_SHIFT: u32 = 8;
pub const SD_CSD_BLOCK_LEN_MASK: u32 = 0xF;
pub const SD_CSD_CSIZE_HIGH_WORD: usize = 2;
pub const SD_CSD_CSIZE_HIGH_WORD_SHIFT: u32 = 10;
pub const SD_CSD_CSIZE_HIGH_WORD_MASK: u32 = 0x3;
pub const SD_CSD_CSIZE_LOW_WORD: usize = 1;
pub const SD_CSD_CSIZE_LOW_WORD_SHIFT: u32 = 22;
pub const SD_CSD_CSIZE_MULT_WORD: usize = 1;
pub const SD_CSD_CSIZE_MULT_SHIFT: u32 = 7;
pub const SD_CSD_CSIZE_MULT_MASK: u32 = 0x7;
pub const SD_CSD_SECTOR_SIZE_HIGH_WORD: usize = 1;
pub const SD_CSD_SECTOR_SIZE_HIGH_MASK: u32 = 0x3F;
pub const SD_CSD_SECTOR_SIZE_HIGH_SHIFT: u32 = 1;
pub const SD_CSD_SECTOR_SIZE_LOW_WORD: usize = 0;
pub const SD_CSD_SECTOR_SIZE_LOW_MASK: u32 = 0x8000_0000;
pub const SD_CSD_SECTOR_SIZE_LOW_SHIFT: u32 = 31;
pub const SD_CSD_WRITE_BL_LEN_WORD: usize = 0;
pub const SD_CSD_WRITE_BL_LEN_MASK: u32 = 0x3_C000;
pub const SD_CSD_WRITE_BL_LEN_SHIFT: u32 = 14;
pub const SD_CSD_WP_GRP_SIZE_WORD: usize = 0;
pub const SD_CSD_WP_GRP_SIZE_SHIFT: u32 = 24;
pub const SD_CSD_WP_GRP_SIZE_MASK: u32 = 0x7F;

// Card status (R1)
pub const SD_TRANSFER_STATE_MASK: u32 = 0x1E00;
pub const SD_TRANSFER_STATE_SHIFT: u32 = 9;
pub const MMC_READ_WRITE_ERROR_MASK: u32 = 0x8_0000;
pub const ERASE_CMD_ERROR: u32 = 0x1000_2000;

// SD bus width arguments (ACMD6)
pub const SD_BUS_WIDTH_1BIT: u32 = 0;
pub const SD_BUS_WIDTH_4BIT: u32 = 2;

// SD high-speed function switch (CMD6)
pub const SD_SDHC_HIGHSPEED_QUERY: u32 = 0x00FF_FF01;
pub const SD_SDHC_HIGHSPEED_SET: u32 = 0x80FF_FF01;
pub const SD_SDHC_SWITCH_BLOCK_SIZE: u32 = 64;
pub const SD_SDHC_GROUP1_MASK: u32 = 0x2;
pub const SD_SDHC_GROUP1_SHIFT: u32 = 8;

// MMC SWITCH (CMD6) arguments
pub const MMC_LEGACY_SPEED_ARGUMENT: u32 = 0x03B9_0000;
pub const MMC_HIGH_SPEED_ARGUMENT: u32 = 0x03B9_0100;
pub const MMC_HS200_SPEED_ARGUMENT: u32 = 0x03B9_0200;
pub const MMC_BUS_WIDTH_ARG: u32 = 0x03B7_0000;
pub const MMC_SANITIZE_ARG: u32 = 0x03A5_0100;
pub const MMC_BOOT_PARTITION_WP_ARG: u32 = 0x03AD_0000;
pub const MMC_USER_PARTITION_WP_ARG: u32 = 0x03AB_0000;
pub const EMMC_SWITCH_SELECT_PARTITION_ARG: u32 = 0x03B3_0000;
pub const EMMC_SWITCH_SELECT_PARTITION_OFFSET: u32 = 0x8;

// MMC SWITCH bus width encodings
pub const MMC_SDR_MODE_4_BIT_BUSWIDTH: u32 = 0x1;
pub const MMC_SDR_MODE_8_BIT_BUSWIDTH: u32 = 0x2;
pub const MMC_DDR_MODE_4_BIT_BUSWIDTH: u32 = 0x5;
pub const MMC_DDR_MODE_8_BIT_BUSWIDTH: u32 = 0x6;

// EXT_CSD device type byte
pub const MMC_DEVICE_TYPE_HIGHSPEED_26MHZ: u8 = 0x1;
pub const MMC_DEVICE_TYPE_HIGHSPEED_52MHZ: u8 = 0x2;
pub const MMC_DEVICE_TYPE_HIGHSPEED_DDR_52MHZ_1_8_V: u8 = 0x4;
pub const MMC_DEVICE_TYPE_HIGHSPEED_DDR_52MHZ_1_2_V: u8 = 0x8;
pub const MMC_DEVICE_TYPE_HS200_SDR_200MHZ_1_8_V: u8 = 0x10;
pub const MMC_DEVICE_TYPE_HS200_SDR_200MHZ_1_2_V: u8 = 0x20;

// EXT_CSD byte offsets
pub const EXT_CSD_USER_WP: usize = 171;
pub const EXT_CSD_BOOT_WP: usize = 173;
pub const EXT_CSD_ERASE_GROUP_DEF: usize = 175;
pub const EXT_CSD_PART_CONFIG: usize = 179;
pub const EXT_CSD_ERASED_MEM_CONT: usize = 181;
pub const EXT_CSD_CARD_TYPE: usize = 196;
pub const EXT_CSD_SEC_CNT: usize = 212;
pub const EXT_CSD_HC_WP_GRP_SIZE: usize = 221;
pub const EXT_CSD_HC_ERASE_GRP_SIZE: usize = 224;
pub const EXT_CSD_BOOT_SIZE_MULT: usize = 226;
pub const EXT_CSD_SEC_FEATURE_SUPPORT: usize = 231;

pub const EXT_CSD_SEC_ER_EN: u8 = 1 << 0;
pub const EXT_CSD_SEC_GB_CL_EN: u8 = 1 << 4;
pub const EXT_CSD_SEC_SANITIZE: u8 = 1 << 6;

// High-capacity erase unit: HC_ERASE_GRP_SIZE counts 512 KiB units
pub const SD_HC_ERASE_UNIT_SIZE_LOG2: u32 = 9 + 10;
// Boot partition size: BOOT_SIZE_MULT counts 128 KiB units
pub const EXT_CSD_BOOT_SIZE_MULT_LOG2: u32 = 7 + 10;

// Largest span a single erase command may cover, in 512-byte sectors
pub const EMMC_MAX_ERASABLE_SECTORS: u32 = 0x20_0000;
pub const EMMC_MAX_ERASABLE_SECTORS_LOG2: u32 = 21;

// Erase (CMD38) argument bits
pub const MMC_ERASE_ARG_SECURE: u32 = 0x8000_0000;
pub const MMC_ERASE_ARG_TRIM: u32 = 0x1;
pub const MMC_ERASE_ARG_SECURE_TRIM_STEP2: u32 = 0x8000_8000;

pub const MMC_SANITIZE_MAX_RETRIES: u32 = 3;
