//! Bus Controller Adapter contract
//!
//! The adapter is the only code that touches controller registers or the
//! bus. Everything above it (command engine, data engine, dispatcher) is
//! written once against [`BusController`]; each platform supplies one small
//! implementation.

use bitflags::bitflags;

use super::error::{ClockError, DmaError, ProtocolError};
use super::types::{ClockMode, Command, Direction, TransferDescriptor, TransferMode};
use crate::time::wait_for;

bitflags! {
    /// Latched controller status, normalised across adapters
    ///
    /// Bit positions follow the SDHCI normal/error interrupt status layout;
    /// the FIFO overrun/underrun bits sit in the vendor-specific error range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusBits: u32 {
        /// Command complete (response received)
        const CMD_COMPLETE = 1 << 0;
        /// Transfer complete
        const TRANSFER_COMPLETE = 1 << 1;
        /// DMA boundary / DMA end
        const DMA_END = 1 << 3;
        /// Buffer write ready
        const BUFFER_WRITE_READY = 1 << 4;
        /// Buffer read ready
        const BUFFER_READ_READY = 1 << 5;
        /// Card (target) interrupt
        const CARD_INT = 1 << 8;
        /// Error summary
        const ERROR = 1 << 15;
        /// Command timeout
        const CMD_TIMEOUT = 1 << 16;
        /// Command CRC error
        const CMD_CRC = 1 << 17;
        /// Data timeout
        const DATA_TIMEOUT = 1 << 20;
        /// Data CRC error
        const DATA_CRC = 1 << 21;
        /// Receive FIFO overrun
        const FIFO_OVERRUN = 1 << 28;
        /// Transmit FIFO underrun
        const FIFO_UNDERRUN = 1 << 29;
    }
}

bitflags! {
    /// Transfer modes an adapter can provide
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModeSet: u8 {
        const ONE_BIT = 1 << 0;
        const FOUR_BIT = 1 << 1;
        const SPI = 1 << 2;
    }
}

impl ModeSet {
    pub const fn supports(self, mode: TransferMode) -> bool {
        let bit = match mode {
            TransferMode::OneBitSdio => Self::ONE_BIT,
            TransferMode::FourBitSdio => Self::FOUR_BIT,
            TransferMode::SpiMode => Self::SPI,
        };
        self.contains(bit)
    }
}

/// Static description of what an adapter can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Transfer modes the controller supports
    pub modes: ModeSet,
    /// DMA length granularity in bytes, `None` without a DMA engine
    pub dma_granularity: Option<u16>,
    /// Whether command completion raises a discrete interrupt
    pub response_irq: bool,
    /// `0xFF` bytes the bus needs after a FIFO write payload
    pub write_trailer_bytes: u8,
}

/// Register-level access to an SDIO/SPI host controller
///
/// Implementations perform no internal locking: the registers are a single
/// global resource serialised by the host's caller.
pub trait BusController {
    fn capabilities(&self) -> Capabilities;

    /// Check that the controller is present and responding
    fn probe(&mut self) -> bool;

    /// Route pins and clock domains for `mode`
    fn configure(&mut self, mode: TransferMode);

    /// Release pins, DMA channels and power; the controller is left idle
    fn shutdown(&mut self);

    /// Kick off the controller soft reset
    fn start_reset(&mut self);

    /// Whether the soft reset has finished
    fn reset_done(&mut self) -> bool;

    /// Raw latched status
    fn read_status(&mut self) -> StatusBits;

    /// Write-1-to-clear exactly `bits`; other latched bits are left alone
    fn clear_status(&mut self, bits: StatusBits);

    /// Current interrupt enable mask
    fn read_enable(&self) -> StatusBits;

    /// Replace the interrupt enable mask
    fn write_enable(&mut self, bits: StatusBits);

    /// Program the clock divider/gate for `mode` without waiting
    fn program_clock(&mut self, mode: ClockMode);

    /// Whether the bus clock is running and stable
    fn clock_running(&mut self) -> bool;

    fn write_argument(&mut self, arg: u32);

    /// Write the command register; this starts the command on the bus
    fn write_command(&mut self, cmd: &Command);

    /// Short response word of the last command
    fn read_response(&mut self) -> u32;

    /// Whether the card is still signalling busy after a `BUSY` command
    fn card_busy(&mut self) -> bool;

    fn set_block_length(&mut self, length: u16);

    /// Set up the controller for a FIFO data phase of `length` bytes
    fn prepare_data(&mut self, direction: Direction, length: u16);

    fn fifo_read_word(&mut self) -> u32;

    fn fifo_write_word(&mut self, word: u32);

    /// Program and start a DMA transfer for `desc`
    ///
    /// Takes the descriptor mutably because the engine writes into the
    /// buffer for card-to-host transfers.
    fn dma_start(&mut self, desc: &mut TransferDescriptor<'_>) -> Result<(), DmaError>;

    /// Tear down the DMA mapping/channel for `direction`
    fn dma_release(&mut self, direction: Direction);

    /// Program the clock and wait until it is observably in the new state
    ///
    /// Turning the clock on waits for the stable bit; turning it off waits for
    /// the clock to read back as stopped.
    fn set_clock(&mut self, mode: ClockMode, retries: u32) -> Result<(), ClockError> {
        self.program_clock(mode);
        let want_running = mode != ClockMode::Off;
        if wait_for(retries, || self.clock_running() == want_running) {
            Ok(())
        } else {
            log::error!(target: "sdio_host::adapter", "clock {:?} not stable after {} polls", mode, retries);
            Err(ClockError::NotStable)
        }
    }

    /// Soft-reset the controller and wait for it to finish
    fn soft_reset(&mut self, retries: u32) -> Result<(), ProtocolError> {
        self.start_reset();
        if wait_for(retries, || self.reset_done()) {
            Ok(())
        } else {
            log::error!(target: "sdio_host::adapter", "soft reset did not complete");
            Err(ProtocolError::Timeout)
        }
    }
}

/// GPIO lines owned by the platform (reset, power, wake)
pub trait HostGpio {
    fn apply(&mut self, op: super::types::GpioOp, id: super::types::GpioId);
}

/// GPIO stub for boards that hard-wire the chipset control lines
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGpio;

impl HostGpio for NoGpio {
    fn apply(&mut self, op: super::types::GpioOp, id: super::types::GpioId) {
        log::debug!(target: "sdio_host::adapter", "gpio {:?} {:?} ignored (no GPIO)", op, id);
    }
}
