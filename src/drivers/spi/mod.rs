//! SDIO-over-SPI bus controller
//!
//! Runs the SDIO command set over a plain SPI port. There is no controller
//! status register on this bus, so the adapter keeps a software one: command
//! responses, data tokens and data-response tokens are decoded into
//! `StatusBits` as they arrive, and the host engines poll those exactly as
//! they would an SDHCI slot.
//!
//! Data blocks are buffered one at a time: a read block is received whole
//! (start token, payload, CRC16) and then handed out word by word; a write
//! block is collected word by word and sent once full.

pub mod crc;

use heapless::Vec;

use crate::host::adapter::{BusController, Capabilities, ModeSet, StatusBits};
use crate::host::error::DmaError;
use crate::host::types::{
    ClockMode, Command, CommandFlags, Direction, R5Flags, ResponseKind, TransferDescriptor, TransferMode,
};
use crate::time::poll_for;

use crc::{crc7, crc16};

/// Byte-level access to the SPI bus wired to the card
pub trait SpiPort {
    /// Clock one byte out on MOSI and return the byte seen on MISO
    fn exchange(&mut self, byte: u8) -> u8;

    /// Assert (`true`) or release chip select
    fn select(&mut self, asserted: bool);

    /// Set the SCK frequency; `0` stops the clock
    fn set_frequency(&mut self, hz: u32);
}

/// Largest data block the adapter buffers (SDIO function block size limit)
pub const SPI_MAX_BLOCK: usize = 2048;

/// Identification clock
const SLOW_CLOCK_HZ: u32 = 400_000;
/// Transfer clock
const FAST_CLOCK_HZ: u32 = 25_000_000;

/// Bytes to wait for a command response (NCR is at most 8)
const NCR_POLLS: u32 = 16;
/// Bytes to wait for a read start token
const TOKEN_POLLS: u32 = 10_000;
/// Bytes to wait for a write data-response token
const DATA_RESPONSE_POLLS: u32 = 16;
/// Bytes to wait for the card to release busy after a write
const BUSY_POLLS: u32 = 100_000;
/// Idle bytes clocked at power-up (at least 74 clocks)
const POWER_UP_BYTES: usize = 10;

/// Start token for single-block transfers
const TOKEN_START_BLOCK: u8 = 0xFE;
/// Start token for each block of a multi-block write
const TOKEN_START_MULTI: u8 = 0xFC;

/// Data response token, low five bits
const DATA_RES_MASK: u8 = 0x1F;
const DATA_RES_ACCEPTED: u8 = 0x05;
const DATA_RES_CRC_ERROR: u8 = 0x0B;
const DATA_RES_WRITE_ERROR: u8 = 0x0D;

/// R1 / R5 first-byte flags in SPI mode
const SPI_R1_ILLEGAL_COMMAND: u8 = 1 << 2;
const SPI_R1_COM_CRC: u8 = 1 << 3;
const SPI_R5_FUNCTION_NUMBER: u8 = 1 << 4;
const SPI_R5_PARAMETER: u8 = 1 << 6;

/// Convert the SPI-mode R5 flag byte into SD-mode R5 response flags
pub fn r5_flags_from_spi(flags: u8) -> R5Flags {
    let mut out = R5Flags::empty();
    if flags & SPI_R1_COM_CRC != 0 {
        out |= R5Flags::COM_CRC_ERROR;
    }
    if flags & SPI_R1_ILLEGAL_COMMAND != 0 {
        out |= R5Flags::ILLEGAL_COMMAND;
    }
    if flags & SPI_R5_FUNCTION_NUMBER != 0 {
        out |= R5Flags::FUNCTION_NUMBER;
    }
    if flags & SPI_R5_PARAMETER != 0 {
        out |= R5Flags::OUT_OF_RANGE;
    }
    out
}

/// Command frame: start/transmission bits + index, argument, CRC7 + end bit
pub fn command_frame(opcode: u8, arg: u32) -> [u8; 6] {
    let a = arg.to_be_bytes();
    let mut frame = [0x40 | (opcode & 0x3F), a[0], a[1], a[2], a[3], 0];
    frame[5] = crc7(&frame[..5]);
    frame
}

#[derive(Debug)]
struct DataPhase {
    direction: Direction,
    block_size: u16,
    blocks_left: u16,
    multi: bool,
    /// The data command has been accepted and blocks are flowing
    started: bool,
}

/// SDIO card on an SPI port
pub struct SpiController<P: SpiPort> {
    port: P,
    clock: ClockMode,
    selected: bool,
    latched: StatusBits,
    enabled: StatusBits,
    response: u32,
    argument: u32,
    block_length: u16,
    phase: Option<DataPhase>,
    block: Vec<u8, SPI_MAX_BLOCK>,
    cursor: usize,
    /// Payload done; further writes are clocked out raw
    trailer_open: bool,
}

impl<P: SpiPort> SpiController<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            clock: ClockMode::Off,
            selected: false,
            latched: StatusBits::empty(),
            enabled: StatusBits::empty(),
            response: 0,
            argument: 0,
            block_length: 0,
            phase: None,
            block: Vec::new(),
            cursor: 0,
            trailer_open: false,
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    fn select(&mut self) {
        if !self.selected {
            self.port.select(true);
            self.selected = true;
        }
    }

    /// Release chip select and give the card one byte of clocks to let go of MISO
    fn release(&mut self) {
        if self.selected {
            self.port.select(false);
            self.port.exchange(0xFF);
            self.selected = false;
        }
        self.trailer_open = false;
    }

    fn fail_data(&mut self, bits: StatusBits) {
        log::debug!(target: "sdio_host::spi", "SPI: data phase failed: {:?}", bits);
        self.latched |= bits;
        self.phase = None;
        self.block.clear();
        self.cursor = 0;
        self.release();
    }

    fn finish_data(&mut self, direction: Direction) {
        self.latched |= StatusBits::TRANSFER_COMPLETE;
        self.phase = None;
        self.block.clear();
        self.cursor = 0;
        match direction {
            Direction::ToHost => self.release(),
            Direction::FromHost => self.trailer_open = true,
        }
    }

    /// Receive one block: start token, payload, CRC16
    fn receive_block(&mut self) {
        let Some(size) = self.phase.as_ref().map(|p| p.block_size as usize) else {
            return;
        };
        let port = &mut self.port;
        let token = poll_for(TOKEN_POLLS, || match port.exchange(0xFF) {
            0xFF => None,
            t => Some(t),
        });
        match token {
            Some(TOKEN_START_BLOCK) => {}
            Some(t) => {
                log::debug!(target: "sdio_host::spi", "SPI: data error token {:#04x}", t);
                return self.fail_data(StatusBits::DATA_CRC);
            }
            None => return self.fail_data(StatusBits::DATA_TIMEOUT),
        }

        self.block.clear();
        self.cursor = 0;
        for _ in 0..size {
            let byte = self.port.exchange(0xFF);
            // `size` never exceeds the buffer capacity, checked in `prepare_data`
            let _ = self.block.push(byte);
        }
        let received = u16::from_be_bytes([self.port.exchange(0xFF), self.port.exchange(0xFF)]);
        let computed = crc16(&self.block);
        if received != computed {
            log::debug!(
                target: "sdio_host::spi",
                "SPI: read CRC mismatch (card {:#06x}, computed {:#06x})",
                received,
                computed
            );
            self.fail_data(StatusBits::DATA_CRC);
        }
    }

    /// Send the buffered block and collect the data response and busy
    fn send_block(&mut self) {
        let Some(multi) = self.phase.as_ref().map(|p| p.multi) else {
            return;
        };
        let crc = crc16(&self.block);
        self.port.exchange(0xFF);
        self.port
            .exchange(if multi { TOKEN_START_MULTI } else { TOKEN_START_BLOCK });
        for &byte in self.block.iter() {
            self.port.exchange(byte);
        }
        for byte in crc.to_be_bytes() {
            self.port.exchange(byte);
        }

        let port = &mut self.port;
        let response = poll_for(DATA_RESPONSE_POLLS, || match port.exchange(0xFF) {
            0xFF => None,
            r => Some(r & DATA_RES_MASK),
        });
        match response {
            Some(DATA_RES_ACCEPTED) => {}
            Some(DATA_RES_CRC_ERROR) => return self.fail_data(StatusBits::DATA_CRC),
            Some(DATA_RES_WRITE_ERROR) => return self.fail_data(StatusBits::FIFO_UNDERRUN),
            Some(r) => {
                log::debug!(target: "sdio_host::spi", "SPI: unexpected data response {:#04x}", r);
                return self.fail_data(StatusBits::DATA_CRC);
            }
            None => return self.fail_data(StatusBits::DATA_TIMEOUT),
        }

        let port = &mut self.port;
        if poll_for(BUSY_POLLS, || (port.exchange(0xFF) != 0x00).then_some(())).is_none() {
            return self.fail_data(StatusBits::DATA_TIMEOUT);
        }
        self.block.clear();
    }

    /// Account for one finished block; true when the phase has more blocks
    fn next_block(&mut self) -> bool {
        match &mut self.phase {
            Some(phase) => {
                phase.blocks_left = phase.blocks_left.saturating_sub(1);
                phase.blocks_left > 0
            }
            None => false,
        }
    }
}

impl<P: SpiPort> BusController for SpiController<P> {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            modes: ModeSet::SPI,
            dma_granularity: None,
            response_irq: false,
            write_trailer_bytes: 2,
        }
    }

    /// Clock the power-up idle bytes with CS released; MISO must float high
    fn probe(&mut self) -> bool {
        self.port.select(false);
        self.selected = false;
        let mut last = 0;
        for _ in 0..POWER_UP_BYTES {
            last = self.port.exchange(0xFF);
        }
        if last != 0xFF {
            log::error!(target: "sdio_host::spi", "SPI: MISO stuck at {:#04x}", last);
            return false;
        }
        true
    }

    fn configure(&mut self, mode: TransferMode) {
        log::debug!(target: "sdio_host::spi", "SPI: configured for {:?}", mode);
    }

    fn shutdown(&mut self) {
        self.release();
        self.port.set_frequency(0);
        self.clock = ClockMode::Off;
    }

    fn start_reset(&mut self) {
        self.release();
        self.latched = StatusBits::empty();
        self.phase = None;
        self.block.clear();
        self.cursor = 0;
    }

    fn reset_done(&mut self) -> bool {
        true
    }

    fn read_status(&mut self) -> StatusBits {
        let mut status = self.latched;
        if let Some(phase) = &self.phase {
            if phase.started {
                match phase.direction {
                    Direction::ToHost if self.cursor < self.block.len() => status |= StatusBits::BUFFER_READ_READY,
                    Direction::FromHost => status |= StatusBits::BUFFER_WRITE_READY,
                    _ => {}
                }
            }
        } else if self.trailer_open {
            status |= StatusBits::BUFFER_WRITE_READY;
        }
        status
    }

    fn clear_status(&mut self, bits: StatusBits) {
        self.latched -= bits;
    }

    fn read_enable(&self) -> StatusBits {
        self.enabled
    }

    fn write_enable(&mut self, bits: StatusBits) {
        self.enabled = bits;
    }

    fn program_clock(&mut self, mode: ClockMode) {
        let hz = match mode {
            ClockMode::Off => 0,
            ClockMode::Slow => SLOW_CLOCK_HZ,
            ClockMode::Fast => FAST_CLOCK_HZ,
        };
        self.port.set_frequency(hz);
        self.clock = mode;
        log::debug!(target: "sdio_host::spi", "SPI: SCK {} Hz", hz);
    }

    fn clock_running(&mut self) -> bool {
        self.clock != ClockMode::Off
    }

    fn write_argument(&mut self, arg: u32) {
        self.argument = arg;
    }

    fn write_command(&mut self, cmd: &Command) {
        self.release();
        self.select();
        for byte in command_frame(cmd.opcode, self.argument) {
            self.port.exchange(byte);
        }

        let port = &mut self.port;
        let r1 = poll_for(NCR_POLLS, || {
            let byte = port.exchange(0xFF);
            (byte & 0x80 == 0).then_some(byte)
        });
        let Some(r1) = r1 else {
            log::debug!(target: "sdio_host::spi", "SPI: CMD{} no response", cmd.opcode);
            self.latched |= StatusBits::CMD_TIMEOUT;
            self.phase = None;
            self.release();
            return;
        };

        self.response = match cmd.response {
            ResponseKind::R5 => {
                let data = self.port.exchange(0xFF);
                ((r5_flags_from_spi(r1).bits() as u32) << 8) | data as u32
            }
            _ => r1 as u32,
        };

        let mut status = StatusBits::CMD_COMPLETE;
        if r1 & SPI_R1_COM_CRC != 0 {
            status |= StatusBits::CMD_CRC;
        }
        self.latched |= status;

        let rejected = r1 & (SPI_R1_COM_CRC | SPI_R1_ILLEGAL_COMMAND) != 0;
        let direction = match &mut self.phase {
            Some(phase) if cmd.has_data() && !rejected => {
                phase.started = true;
                Some(phase.direction)
            }
            _ => None,
        };
        match direction {
            Some(Direction::ToHost) => self.receive_block(),
            Some(Direction::FromHost) => self.block.clear(),
            None => {
                self.phase = None;
                // A busy card holds MISO low until released; `card_busy` watches it
                if rejected || !cmd.flags.contains(CommandFlags::BUSY) {
                    self.release();
                }
            }
        }
    }

    fn read_response(&mut self) -> u32 {
        self.response
    }

    fn card_busy(&mut self) -> bool {
        if !self.selected || self.phase.is_some() {
            return false;
        }
        if self.port.exchange(0xFF) == 0x00 {
            return true;
        }
        self.release();
        false
    }

    fn set_block_length(&mut self, length: u16) {
        self.block_length = length;
    }

    fn prepare_data(&mut self, direction: Direction, length: u16) {
        let (block_size, blocks) =
            if self.block_length != 0 && length > self.block_length && length % self.block_length == 0 {
                (self.block_length, length / self.block_length)
            } else {
                (length, 1)
            };
        self.block.clear();
        self.cursor = 0;
        self.trailer_open = false;

        if block_size as usize > SPI_MAX_BLOCK {
            log::error!(target: "sdio_host::spi", "SPI: {} byte block exceeds buffer", block_size);
            self.phase = None;
            self.latched |= match direction {
                Direction::ToHost => StatusBits::FIFO_OVERRUN,
                Direction::FromHost => StatusBits::FIFO_UNDERRUN,
            };
            return;
        }
        self.phase = Some(DataPhase {
            direction,
            block_size,
            blocks_left: blocks,
            multi: blocks > 1,
            started: false,
        });
    }

    /// Words may straddle blocks; the next block is received as soon as the
    /// current one is drained
    fn fifo_read_word(&mut self) -> u32 {
        let mut word = [0u8; 4];
        for byte in &mut word {
            let Some(&b) = self.block.get(self.cursor) else {
                break;
            };
            *byte = b;
            self.cursor += 1;
            if self.phase.is_some() && self.cursor == self.block.len() {
                if self.next_block() {
                    self.receive_block();
                } else {
                    self.finish_data(Direction::ToHost);
                }
            }
        }
        u32::from_le_bytes(word)
    }

    fn fifo_write_word(&mut self, word: u32) {
        if self.trailer_open {
            for byte in word.to_le_bytes() {
                self.port.exchange(byte);
            }
            return;
        }
        for byte in word.to_le_bytes() {
            let Some(block_size) = self.phase.as_ref().map(|p| p.block_size as usize) else {
                return;
            };
            let _ = self.block.push(byte);
            if self.block.len() == block_size {
                self.send_block();
                if self.phase.is_none() {
                    return;
                }
                if !self.next_block() {
                    self.finish_data(Direction::FromHost);
                    return;
                }
            }
        }
    }

    fn dma_start(&mut self, _desc: &mut TransferDescriptor<'_>) -> Result<(), DmaError> {
        Err(DmaError::Unsupported)
    }

    fn dma_release(&mut self, _direction: Direction) {}
}
