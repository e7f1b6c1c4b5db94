//! SDHCI Register Definitions using tock-registers
//!
//! Only the registers the SDIO transport touches are named; the rest of the
//! 256-byte block is reserved padding.

use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

// ============================================================================
// Register Bitfield Definitions
// ============================================================================

register_bitfields! [
    u32,
    /// Present State Register (0x24)
    pub PRESENT_STATE [
        CMD_INHIBIT OFFSET(0) NUMBITS(1) [],
        DAT_INHIBIT OFFSET(1) NUMBITS(1) [],
        DAT_ACTIVE OFFSET(2) NUMBITS(1) [],
        /// Buffer Write Enable: one word may be written to the data port
        BUFFER_WRITE_ENABLE OFFSET(10) NUMBITS(1) [],
        /// Buffer Read Enable: one word may be read from the data port
        BUFFER_READ_ENABLE OFFSET(11) NUMBITS(1) [],
        CARD_INSERTED OFFSET(16) NUMBITS(1) [],
        CARD_STABLE OFFSET(17) NUMBITS(1) []
    ],

    /// Normal + Error Interrupt Status (0x30), Status Enable (0x34) and
    /// Signal Enable (0x38). The layout matches `StatusBits`.
    pub INT_STATUS [
        CMD_COMPLETE OFFSET(0) NUMBITS(1) [],
        TRANSFER_COMPLETE OFFSET(1) NUMBITS(1) [],
        BLOCK_GAP OFFSET(2) NUMBITS(1) [],
        DMA_INT OFFSET(3) NUMBITS(1) [],
        BUFFER_WRITE_READY OFFSET(4) NUMBITS(1) [],
        BUFFER_READ_READY OFFSET(5) NUMBITS(1) [],
        CARD_INSERT OFFSET(6) NUMBITS(1) [],
        CARD_REMOVE OFFSET(7) NUMBITS(1) [],
        CARD_INT OFFSET(8) NUMBITS(1) [],
        ERROR OFFSET(15) NUMBITS(1) [],
        CMD_TIMEOUT OFFSET(16) NUMBITS(1) [],
        CMD_CRC OFFSET(17) NUMBITS(1) [],
        CMD_END_BIT OFFSET(18) NUMBITS(1) [],
        CMD_INDEX OFFSET(19) NUMBITS(1) [],
        DATA_TIMEOUT OFFSET(20) NUMBITS(1) [],
        DATA_CRC OFFSET(21) NUMBITS(1) [],
        DATA_END_BIT OFFSET(22) NUMBITS(1) [],
        /// Vendor error: receive FIFO overrun
        FIFO_OVERRUN OFFSET(28) NUMBITS(1) [],
        /// Vendor error: transmit FIFO underrun
        FIFO_UNDERRUN OFFSET(29) NUMBITS(1) []
    ],

    /// Capabilities Register (0x40)
    pub CAPABILITIES [
        /// Base clock in MHz (bits 13:8 on SDHCI 2.0, 15:8 on 3.0+)
        BASE_CLK_FREQ OFFSET(8) NUMBITS(8) [],
        SUPPORT_HIGHSPEED OFFSET(21) NUMBITS(1) [],
        SUPPORT_SDMA OFFSET(22) NUMBITS(1) [],
        SUPPORT_3V3 OFFSET(24) NUMBITS(1) [],
        SUPPORT_3V0 OFFSET(25) NUMBITS(1) [],
        SUPPORT_1V8 OFFSET(26) NUMBITS(1) []
    ]
];

register_bitfields! [
    u16,
    /// Block Size Register (0x04)
    pub BLOCK_SIZE [
        BLOCK_SIZE OFFSET(0) NUMBITS(12) [],
        SDMA_BOUNDARY OFFSET(12) NUMBITS(3) []
    ],

    /// Transfer Mode Register (0x0C)
    pub TRANSFER_MODE [
        DMA_ENABLE OFFSET(0) NUMBITS(1) [],
        BLOCK_COUNT_ENABLE OFFSET(1) NUMBITS(1) [],
        /// 1 = card to host
        DATA_DIRECTION OFFSET(4) NUMBITS(1) [],
        MULTI_BLOCK OFFSET(5) NUMBITS(1) []
    ],

    /// Command Register (0x0E)
    pub COMMAND [
        RESPONSE_TYPE OFFSET(0) NUMBITS(2) [
            None = 0,
            Long136 = 1,
            Short48 = 2,
            Short48Busy = 3
        ],
        CRC_CHECK OFFSET(3) NUMBITS(1) [],
        INDEX_CHECK OFFSET(4) NUMBITS(1) [],
        DATA_PRESENT OFFSET(5) NUMBITS(1) [],
        CMD_INDEX OFFSET(8) NUMBITS(6) []
    ],

    /// Clock Control Register (0x2C)
    pub CLOCK_CONTROL [
        INTERNAL_CLK_EN OFFSET(0) NUMBITS(1) [],
        INTERNAL_CLK_STABLE OFFSET(1) NUMBITS(1) [],
        SD_CLK_EN OFFSET(2) NUMBITS(1) [],
        /// Upper bits of the 10-bit divider (SDHCI 3.0+)
        FREQ_SELECT_HI OFFSET(6) NUMBITS(2) [],
        FREQ_SELECT OFFSET(8) NUMBITS(8) []
    ],

    /// Host Controller Version (0xFE)
    pub HOST_VERSION [
        SPEC_VERSION OFFSET(0) NUMBITS(8) [],
        VENDOR_VERSION OFFSET(8) NUMBITS(8) []
    ]
];

register_bitfields! [
    u8,
    /// Host Control Register (0x28)
    pub HOST_CONTROL [
        DATA_WIDTH_4BIT OFFSET(1) NUMBITS(1) [],
        HIGH_SPEED OFFSET(2) NUMBITS(1) [],
        DMA_SELECT OFFSET(3) NUMBITS(2) [
            SDMA = 0,
            ADMA32 = 2,
            ADMA64 = 3
        ],
        DATA_WIDTH_8BIT OFFSET(5) NUMBITS(1) []
    ],

    /// Power Control Register (0x29)
    pub POWER_CONTROL [
        BUS_POWER OFFSET(0) NUMBITS(1) [],
        BUS_VOLTAGE OFFSET(1) NUMBITS(3) [
            V3_3 = 7,
            V3_0 = 6,
            V1_8 = 5
        ]
    ],

    /// Software Reset Register (0x2F)
    pub SOFTWARE_RESET [
        RESET_ALL OFFSET(0) NUMBITS(1) [],
        RESET_CMD OFFSET(1) NUMBITS(1) [],
        RESET_DATA OFFSET(2) NUMBITS(1) []
    ]
];

// ============================================================================
// SDHCI Register Memory Map
// ============================================================================

#[repr(C)]
pub struct SdhciRegisters {
    /// SDMA System Address (0x00)
    pub sdma_addr: ReadWrite<u32>,
    /// Block Size (0x04)
    pub block_size: ReadWrite<u16, BLOCK_SIZE::Register>,
    /// Block Count (0x06)
    pub block_count: ReadWrite<u16>,
    /// Argument (0x08)
    pub argument: ReadWrite<u32>,
    /// Transfer Mode (0x0C)
    pub transfer_mode: ReadWrite<u16, TRANSFER_MODE::Register>,
    /// Command (0x0E)
    pub command: ReadWrite<u16, COMMAND::Register>,
    /// Response 0-3 (0x10-0x1C)
    pub response: [ReadOnly<u32>; 4],
    /// Buffer Data Port (0x20)
    pub buffer_data: ReadWrite<u32>,
    /// Present State (0x24)
    pub present_state: ReadOnly<u32, PRESENT_STATE::Register>,
    /// Host Control (0x28)
    pub host_control: ReadWrite<u8, HOST_CONTROL::Register>,
    /// Power Control (0x29)
    pub power_control: ReadWrite<u8, POWER_CONTROL::Register>,
    _block_gap_wakeup: [u8; 2],
    /// Clock Control (0x2C)
    pub clock_control: ReadWrite<u16, CLOCK_CONTROL::Register>,
    /// Timeout Control (0x2E)
    pub timeout_control: ReadWrite<u8>,
    /// Software Reset (0x2F)
    pub software_reset: ReadWrite<u8, SOFTWARE_RESET::Register>,
    /// Interrupt Status (0x30), write-1-to-clear
    pub int_status: ReadWrite<u32, INT_STATUS::Register>,
    /// Interrupt Status Enable (0x34)
    pub int_enable: ReadWrite<u32, INT_STATUS::Register>,
    /// Interrupt Signal Enable (0x38)
    pub signal_enable: ReadWrite<u32, INT_STATUS::Register>,
    _acmd_error_host_control2: [u16; 2],
    /// Capabilities (0x40)
    pub capabilities: ReadOnly<u32, CAPABILITIES::Register>,
    _reserved: [u8; 0xBA],
    /// Host Controller Version (0xFE)
    pub host_version: ReadOnly<u16, HOST_VERSION::Register>,
}

// ============================================================================
// Constants
// ============================================================================

/// SDHCI Specification Version 3.00
pub const SDHCI_SPEC_300: u8 = 2;

/// Maximum divider for SDHCI 2.0 (8-bit, powers of 2)
pub const SDHCI_MAX_DIV_SPEC_200: u32 = 256;

/// Maximum divider for SDHCI 3.0+ (10-bit, even values)
pub const SDHCI_MAX_DIV_SPEC_300: u32 = 2046;

/// SDMA buffer boundary argument (7 = 512 KiB)
pub const SDHCI_DEFAULT_BOUNDARY_ARG: u16 = 7;

/// Largest data timeout counter value (TMCLK * 2^27)
pub const SDHCI_TIMEOUT_MAX: u8 = 0xE;

/// Identification clock
pub const SLOW_CLOCK_HZ: u32 = 400_000;

/// Default-speed transfer clock
pub const FAST_CLOCK_HZ: u32 = 25_000_000;

/// SDMA length granularity used by the transport
pub const SDMA_GRANULARITY: u16 = 16;

/// Every interrupt source the transport relies on
pub const SDHCI_INT_USED_MASK: u32 = 0x3033_013B;

/// Pick the clock divider for `target` Hz from a `base` Hz clock
///
/// SDHCI 3.0+ takes an even 10-bit divider (0 means undivided); SDHCI 2.0
/// takes a power of two and stores half of it. The returned value is what
/// goes into the register fields.
pub fn clock_divider(version: u8, base: u32, target: u32) -> u16 {
    if version >= SDHCI_SPEC_300 {
        if target >= base {
            return 0;
        }
        (2..=SDHCI_MAX_DIV_SPEC_300)
            .step_by(2)
            .find(|d| base / d <= target)
            .unwrap_or(SDHCI_MAX_DIV_SPEC_300) as u16
    } else {
        let mut div = 1u32;
        while div < SDHCI_MAX_DIV_SPEC_200 && base / div > target {
            div *= 2;
        }
        (div / 2) as u16
    }
}

/// Frequency produced by `divider` as returned from [`clock_divider`]
pub fn divided_clock(version: u8, base: u32, divider: u16) -> u32 {
    match (version >= SDHCI_SPEC_300, divider) {
        (_, 0) => base,
        (true, d) => base / d as u32,
        (false, d) => base / (d as u32 * 2),
    }
}

/// Register encoding of `divider` as (FREQ_SELECT, FREQ_SELECT_HI)
pub fn divider_fields(version: u8, divider: u16) -> (u16, u16) {
    if version >= SDHCI_SPEC_300 {
        let n = divider >> 1;
        (n & 0xFF, (n >> 8) & 0x3)
    } else {
        (divider & 0xFF, 0)
    }
}

/// Largest block the 12-bit Transfer Block Size field can describe
pub const SDHCI_MAX_BLOCK_SIZE: u16 = 2048;

/// Split a transfer of `length` bytes into (block size, block count)
///
/// With a block length set and `length` a whole number of blocks, the
/// transfer is multi-block. Otherwise a transfer that fits one block is sent
/// as one; longer ones use the largest block size that divides `length`.
pub fn block_geometry(length: u16, block_length: u16) -> (u16, u16) {
    if block_length != 0
        && block_length <= SDHCI_MAX_BLOCK_SIZE
        && length > block_length
        && length % block_length == 0
    {
        return (block_length, length / block_length);
    }
    if length <= SDHCI_MAX_BLOCK_SIZE {
        return (length, 1);
    }
    let size = (1..=SDHCI_MAX_BLOCK_SIZE)
        .rev()
        .find(|size| length % size == 0)
        .unwrap_or(1);
    (size, length / size)
}
