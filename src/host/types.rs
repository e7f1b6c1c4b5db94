//! Transport data model: modes, commands, interrupt reasons and descriptors

use bitflags::bitflags;

use super::error::ProtocolError;

/// Bus width / protocol selected once at `host_init`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    OneBitSdio,
    FourBitSdio,
    SpiMode,
}

/// Bus clock state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Clock gated; no command or data may be issued
    Off,
    /// Identification speed (400 kHz class)
    Slow,
    /// Default transfer speed (25 MHz class)
    Fast,
}

/// SD/MMC/SDIO response formats
///
/// Only the short SDIO formats (R1, R5, R6) are accepted by the command
/// engine; the rest exist so callers can describe what they asked for and be
/// told precisely that it is unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    None,
    R1,
    R1b,
    R2,
    R3,
    R5,
    R6,
}

impl ResponseKind {
    /// Whether the command engine can decode this response
    pub const fn is_supported(self) -> bool {
        matches!(self, Self::R1 | Self::R5 | Self::R6)
    }
}

bitflags! {
    /// Per-command flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u8 {
        /// Command is followed by a data phase
        const HAS_DATA = 1 << 0;
        /// Data flows card-to-host
        const DIR_TO_HOST = 1 << 1;
        /// Card signals busy on DAT0 after the response
        const BUSY = 1 << 2;
    }
}

bitflags! {
    /// SDIO R5 response flags (bits 15:8 of the short response)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct R5Flags: u8 {
        const COM_CRC_ERROR = 1 << 7;
        const ILLEGAL_COMMAND = 1 << 6;
        const IO_CURRENT_STATE = 0b11 << 4;
        const ERROR = 1 << 3;
        const FUNCTION_NUMBER = 1 << 1;
        const OUT_OF_RANGE = 1 << 0;
    }
}

impl R5Flags {
    /// Flags that mean the card rejected the command
    pub const FAILURE_MASK: Self = Self::COM_CRC_ERROR
        .union(Self::ILLEGAL_COMMAND)
        .union(Self::ERROR)
        .union(Self::FUNCTION_NUMBER)
        .union(Self::OUT_OF_RANGE);

    /// Split a short R5 response word into its flags and data byte
    pub fn decode(response: u32) -> (Self, u8) {
        (
            Self::from_bits_retain((response >> 8) as u8),
            response as u8,
        )
    }
}

/// IO_RW_DIRECT opcode
pub const SD_IO_RW_DIRECT: u8 = 52;
/// IO_RW_EXTENDED opcode
pub const SD_IO_RW_EXTENDED: u8 = 53;

/// Highest SDIO function number
const SDIO_MAX_FUNCTION: u8 = 7;
/// SDIO register addresses are 17 bits wide
const SDIO_ADDRESS_MASK: u32 = 0x1_FFFF;
/// Byte/block count field of CMD53 (0 encodes the maximum)
const SDIO_MAX_COUNT: u16 = 512;

/// A command submitted to the command/response engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub arg: u32,
    pub response: ResponseKind,
    pub flags: CommandFlags,
}

impl Command {
    pub const fn new(opcode: u8, arg: u32, response: ResponseKind, flags: CommandFlags) -> Self {
        Self {
            opcode,
            arg,
            response,
            flags,
        }
    }

    /// CMD52: single-register read or write
    pub fn io_rw_direct(
        write: bool,
        function: u8,
        address: u32,
        data: u8,
        read_after_write: bool,
    ) -> Result<Self, ProtocolError> {
        check_function_address(function, address)?;
        let mut arg = ((function as u32) << 28) | (address << 9) | data as u32;
        if write {
            arg |= 1 << 31;
            if read_after_write {
                arg |= 1 << 27;
            }
        }
        Ok(Self::new(SD_IO_RW_DIRECT, arg, ResponseKind::R5, CommandFlags::empty()))
    }

    /// CMD53: multi-byte or multi-block transfer
    ///
    /// `count` is bytes in byte mode and blocks in block mode, `1..=512`.
    pub fn io_rw_extended(
        direction: Direction,
        function: u8,
        address: u32,
        count: u16,
        block_mode: bool,
        incrementing: bool,
    ) -> Result<Self, ProtocolError> {
        check_function_address(function, address)?;
        if count == 0 || count > SDIO_MAX_COUNT {
            return Err(ProtocolError::InvalidArgument);
        }
        let mut arg = ((function as u32) << 28) | (address << 9) | (count % SDIO_MAX_COUNT) as u32;
        let mut flags = CommandFlags::HAS_DATA;
        match direction {
            Direction::FromHost => arg |= 1 << 31,
            Direction::ToHost => flags |= CommandFlags::DIR_TO_HOST,
        }
        if block_mode {
            arg |= 1 << 27;
        }
        if incrementing {
            arg |= 1 << 26;
        }
        Ok(Self::new(SD_IO_RW_EXTENDED, arg, ResponseKind::R5, flags))
    }

    pub fn has_data(&self) -> bool {
        self.flags.contains(CommandFlags::HAS_DATA)
    }

    /// Direction of the data phase, if any
    pub fn data_direction(&self) -> Option<Direction> {
        if !self.has_data() {
            return None;
        }
        Some(if self.flags.contains(CommandFlags::DIR_TO_HOST) {
            Direction::ToHost
        } else {
            Direction::FromHost
        })
    }
}

fn check_function_address(function: u8, address: u32) -> Result<(), ProtocolError> {
    if function > SDIO_MAX_FUNCTION || address & !SDIO_ADDRESS_MASK != 0 {
        return Err(ProtocolError::InvalidArgument);
    }
    Ok(())
}

/// Interrupt sources the dispatcher manages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReason {
    ResponseCompletion,
    RwAccessCompletion,
    FifoReadReady,
    FifoWriteReady,
    TargetInterrupt,
}

impl IrqReason {
    pub const COUNT: usize = 5;

    pub const ALL: [Self; Self::COUNT] = [
        Self::ResponseCompletion,
        Self::RwAccessCompletion,
        Self::FifoReadReady,
        Self::FifoWriteReady,
        Self::TargetInterrupt,
    ];

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// Operation applied through `host_interrupt`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqOp {
    Enable,
    Disable,
    Acknowledge,
    QueryStatus,
}

/// Decoded status of an interrupt reason, a command, or a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IrqStatus {
    Inactive = 1,
    Active = 2,
    Timeout = 3,
    Crc = 4,
    FifoError = 5,
    Fail = 6,
    Success = 7,
}

impl IrqStatus {
    pub(crate) const fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Inactive,
            2 => Self::Active,
            3 => Self::Timeout,
            4 => Self::Crc,
            5 => Self::FifoError,
            6 => Self::Fail,
            7 => Self::Success,
            _ => return None,
        })
    }

    /// Whether the status reports a hardware error condition
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Timeout | Self::Crc | Self::FifoError | Self::Fail)
    }
}

/// Data direction, named from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Card-to-host (read)
    ToHost,
    /// Host-to-card (write)
    FromHost,
}

impl Direction {
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::ToHost => 0,
            Self::FromHost => 1,
        }
    }
}

/// A single data phase
///
/// The descriptor borrows the caller's buffer for the duration of the
/// transfer. `length` may be shorter than the buffer. DMA is only possible
/// when the platform supplied the buffer's bus address.
#[derive(Debug)]
pub struct TransferDescriptor<'a> {
    buffer: &'a mut [u8],
    phys_addr: Option<u64>,
    length: u16,
    direction: Direction,
}

impl<'a> TransferDescriptor<'a> {
    /// Describe a transfer of the whole buffer
    pub fn new(buffer: &'a mut [u8], direction: Direction) -> Result<Self, ProtocolError> {
        let length = u16::try_from(buffer.len()).map_err(|_| ProtocolError::InvalidArgument)?;
        if length == 0 {
            return Err(ProtocolError::InvalidArgument);
        }
        Ok(Self {
            buffer,
            phys_addr: None,
            length,
            direction,
        })
    }

    /// Restrict the transfer to the first `length` bytes of the buffer
    pub fn with_length(mut self, length: u16) -> Result<Self, ProtocolError> {
        if length == 0 || length as usize > self.buffer.len() {
            return Err(ProtocolError::InvalidArgument);
        }
        self.length = length;
        Ok(self)
    }

    /// Attach the buffer's bus address, making the descriptor DMA-eligible
    pub fn with_phys_addr(mut self, phys_addr: u64) -> Self {
        self.phys_addr = Some(phys_addr);
        self
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn phys_addr(&self) -> Option<u64> {
        self.phys_addr
    }

    /// Bytes covered by the transfer
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.length as usize]
    }

    /// Mutable bytes covered by the transfer
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.length as usize]
    }
}

/// Ancillary values exposed through `host_control`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlId {
    /// Block length; a non-zero parameter sets it
    Length,
    /// Status of the last command, as latched when it completed; does not wait
    WaitCmdReady,
    /// Last short response word
    Response,
}

/// GPIO operations delegated to the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioOp {
    Enable,
    Disable,
    High,
    Low,
}

/// Chipset control lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioId {
    Reset,
    Power,
    Wake,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd52_write_encodes_raw_flag() {
        let cmd = Command::io_rw_direct(true, 1, 0x0_0004, 0x5A, true).unwrap();
        assert_eq!(cmd.opcode, SD_IO_RW_DIRECT);
        assert_eq!(cmd.response, ResponseKind::R5);
        assert_eq!(cmd.arg, 0x8000_0000 | 0x1000_0000 | 0x0800_0000 | (4 << 9) | 0x5A);
        assert!(!cmd.has_data());
    }

    #[test]
    fn cmd52_read_ignores_raw_flag() {
        let cmd = Command::io_rw_direct(false, 0, 0x0_0013, 0xFF, true).unwrap();
        assert_eq!(cmd.arg, (0x13 << 9) | 0xFF);
    }

    #[test]
    fn cmd53_block_read_sets_direction_flags() {
        let cmd = Command::io_rw_extended(Direction::ToHost, 2, 0x100, 512, true, true).unwrap();
        assert_eq!(cmd.opcode, SD_IO_RW_EXTENDED);
        assert_eq!(cmd.arg, 0x2000_0000 | 0x0800_0000 | 0x0400_0000 | (0x100 << 9));
        assert_eq!(cmd.data_direction(), Some(Direction::ToHost));
    }

    #[test]
    fn cmd53_rejects_out_of_range_fields() {
        assert_eq!(
            Command::io_rw_extended(Direction::FromHost, 8, 0, 4, false, true),
            Err(ProtocolError::InvalidArgument)
        );
        assert_eq!(
            Command::io_rw_extended(Direction::FromHost, 1, 0x2_0000, 4, false, true),
            Err(ProtocolError::InvalidArgument)
        );
        assert_eq!(
            Command::io_rw_extended(Direction::FromHost, 1, 0, 0, false, true),
            Err(ProtocolError::InvalidArgument)
        );
    }

    #[test]
    fn r5_decode_splits_flags_and_data() {
        let (flags, data) = R5Flags::decode(0x0000_1043);
        assert_eq!(data, 0x43);
        assert!(!flags.intersects(R5Flags::FAILURE_MASK));
        let (flags, _) = R5Flags::decode(0x0000_C800);
        assert!(flags.contains(R5Flags::COM_CRC_ERROR | R5Flags::ILLEGAL_COMMAND | R5Flags::ERROR));
    }

    #[test]
    fn descriptor_length_bounds() {
        let mut buf = [0u8; 32];
        let desc = TransferDescriptor::new(&mut buf, Direction::ToHost).unwrap();
        assert_eq!(desc.length(), 32);
        assert!(desc.with_length(33).is_err());
        let mut empty: [u8; 0] = [];
        assert!(TransferDescriptor::new(&mut empty, Direction::ToHost).is_err());
    }

    #[test]
    fn irq_status_roundtrips_through_u8() {
        for status in [
            IrqStatus::Inactive,
            IrqStatus::Active,
            IrqStatus::Timeout,
            IrqStatus::Crc,
            IrqStatus::FifoError,
            IrqStatus::Fail,
            IrqStatus::Success,
        ] {
            assert_eq!(IrqStatus::from_u8(status as u8), Some(status));
        }
        assert_eq!(IrqStatus::from_u8(0), None);
    }
}
