//! Scripted controller used by the host tests
//!
//! Records every bus-visible call in order and models just enough of a
//! controller to drive the engines: latched write-1-to-clear status, an
//! enable mask, a FIFO data phase with buffer-ready bits, and a DMA engine
//! that completes immediately.

use super::adapter::{BusController, Capabilities, ModeSet, StatusBits};
use super::error::DmaError;
use super::irq::{Completions, service_interrupt};
use super::types::{ClockMode, Command, Direction, TransferDescriptor, TransferMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Probe,
    Configure(TransferMode),
    Shutdown,
    StartReset,
    ClearStatus(StatusBits),
    WriteEnable(StatusBits),
    ProgramClock(ClockMode),
    WriteArgument(u32),
    WriteCommand(u8),
    SetBlockLength(u16),
    PrepareData(Direction, u16),
    FifoRead,
    FifoWrite(u32),
    DmaStart(Direction, u16),
    DmaRelease(Direction),
}

#[derive(Debug)]
struct DataPhase {
    direction: Direction,
    remaining: usize,
}

pub struct MockController {
    pub caps: Capabilities,
    /// Status latched by every command write
    pub on_command: StatusBits,
    pub response: u32,
    pub present: bool,
    pub clock_never_stable: bool,
    pub reset_stuck: bool,
    /// Whether buffer-ready bits assert during a data phase
    pub fifo_ready: bool,
    /// Latch transfer complete once the payload has moved
    pub complete_after_data: bool,
    /// Error bits latched instead of transfer complete
    pub data_error: StatusBits,
    /// Bytes the card returns for reads
    pub card_data: Vec<u8>,
    /// Payload bytes written through the FIFO
    pub fifo_sink: Vec<u8>,
    /// Bytes written after the payload
    pub trailer_sink: Vec<u8>,
    /// Payload bytes written by DMA
    pub dma_sink: Vec<u8>,
    pub dma_busy: bool,
    /// DMA starts but never completes
    pub dma_stall: bool,
    pub calls: Vec<Call>,
    /// Busy checks that report the card still busy
    pub busy_for: usize,
    pub busy_checks: usize,
    /// Interrupt line: when set, latching an enabled bit runs the handler
    pub irq: Option<&'static Completions>,
    latched: StatusBits,
    enabled: StatusBits,
    clock: ClockMode,
    status_reads: usize,
    card_cursor: usize,
    phase: Option<DataPhase>,
}

impl MockController {
    /// One/four-bit controller without DMA
    pub fn sdio() -> Self {
        Self {
            caps: Capabilities {
                modes: ModeSet::ONE_BIT | ModeSet::FOUR_BIT,
                dma_granularity: None,
                response_irq: true,
                write_trailer_bytes: 0,
            },
            on_command: StatusBits::CMD_COMPLETE,
            response: 0,
            present: true,
            clock_never_stable: false,
            reset_stuck: false,
            fifo_ready: true,
            complete_after_data: true,
            data_error: StatusBits::empty(),
            card_data: Vec::new(),
            fifo_sink: Vec::new(),
            trailer_sink: Vec::new(),
            dma_sink: Vec::new(),
            dma_busy: false,
            dma_stall: false,
            calls: Vec::new(),
            busy_for: 0,
            busy_checks: 0,
            irq: None,
            latched: StatusBits::empty(),
            enabled: StatusBits::empty(),
            clock: ClockMode::Off,
            status_reads: 0,
            card_cursor: 0,
            phase: None,
        }
    }

    /// SDIO controller with a 16-byte-granular DMA engine
    pub fn dma_capable() -> Self {
        let mut mock = Self::sdio();
        mock.caps.dma_granularity = Some(16);
        mock
    }

    /// SPI-only bridge: no response interrupt, two trailer bytes
    pub fn spi_only() -> Self {
        let mut mock = Self::sdio();
        mock.caps.modes = ModeSet::SPI;
        mock.caps.response_irq = false;
        mock.caps.write_trailer_bytes = 2;
        mock
    }

    pub fn latch(&mut self, bits: StatusBits) {
        self.latched |= bits;
    }

    pub fn latched(&self) -> StatusBits {
        self.latched
    }

    pub fn clock(&self) -> ClockMode {
        self.clock
    }

    pub fn status_reads(&self) -> usize {
        self.status_reads
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    /// Position of the first call matching `pred`
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.iter().position(pred)
    }

    /// Argument and command register writes, in order
    pub fn bus_writes(&self) -> Vec<Call> {
        self.calls
            .iter()
            .copied()
            .filter(|c| matches!(c, Call::WriteArgument(_) | Call::WriteCommand(_)))
            .collect()
    }

    fn finish_phase(&mut self) {
        if !self.data_error.is_empty() {
            self.latched |= self.data_error;
        } else if self.complete_after_data {
            self.latched |= StatusBits::TRANSFER_COMPLETE;
        }
        self.raise();
    }

    fn raise(&mut self) {
        if let Some(completions) = self.irq {
            if self.latched.intersects(self.enabled) {
                service_interrupt(self, completions);
            }
        }
    }
}

impl BusController for MockController {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn probe(&mut self) -> bool {
        self.calls.push(Call::Probe);
        self.present
    }

    fn configure(&mut self, mode: TransferMode) {
        self.calls.push(Call::Configure(mode));
    }

    fn shutdown(&mut self) {
        self.calls.push(Call::Shutdown);
    }

    fn start_reset(&mut self) {
        self.calls.push(Call::StartReset);
        self.phase = None;
    }

    fn reset_done(&mut self) -> bool {
        !self.reset_stuck
    }

    fn read_status(&mut self) -> StatusBits {
        self.status_reads += 1;
        let mut bits = self.latched;
        if let Some(phase) = &self.phase {
            if self.fifo_ready {
                match phase.direction {
                    Direction::ToHost if phase.remaining > 0 => bits |= StatusBits::BUFFER_READ_READY,
                    Direction::FromHost => bits |= StatusBits::BUFFER_WRITE_READY,
                    _ => {}
                }
            }
        }
        bits
    }

    fn clear_status(&mut self, bits: StatusBits) {
        self.calls.push(Call::ClearStatus(bits));
        self.latched -= bits;
    }

    fn read_enable(&self) -> StatusBits {
        self.enabled
    }

    fn write_enable(&mut self, bits: StatusBits) {
        self.calls.push(Call::WriteEnable(bits));
        self.enabled = bits;
    }

    fn program_clock(&mut self, mode: ClockMode) {
        self.calls.push(Call::ProgramClock(mode));
        self.clock = mode;
    }

    fn clock_running(&mut self) -> bool {
        self.clock != ClockMode::Off && !self.clock_never_stable
    }

    fn write_argument(&mut self, arg: u32) {
        self.calls.push(Call::WriteArgument(arg));
    }

    fn write_command(&mut self, cmd: &Command) {
        self.calls.push(Call::WriteCommand(cmd.opcode));
        self.latched |= self.on_command;
        self.raise();
    }

    fn read_response(&mut self) -> u32 {
        self.response
    }

    fn card_busy(&mut self) -> bool {
        self.busy_checks += 1;
        if self.busy_for == 0 {
            return false;
        }
        self.busy_for -= 1;
        true
    }

    fn set_block_length(&mut self, length: u16) {
        self.calls.push(Call::SetBlockLength(length));
    }

    fn prepare_data(&mut self, direction: Direction, length: u16) {
        self.calls.push(Call::PrepareData(direction, length));
        self.phase = Some(DataPhase {
            direction,
            remaining: length as usize,
        });
    }

    fn fifo_read_word(&mut self) -> u32 {
        self.calls.push(Call::FifoRead);
        let mut word = [0u8; 4];
        for byte in &mut word {
            *byte = self.card_data.get(self.card_cursor).copied().unwrap_or(0);
            self.card_cursor += 1;
        }
        if let Some(phase) = &mut self.phase {
            if phase.remaining > 0 {
                phase.remaining = phase.remaining.saturating_sub(4);
                if phase.remaining == 0 {
                    self.finish_phase();
                }
            }
        }
        u32::from_le_bytes(word)
    }

    fn fifo_write_word(&mut self, word: u32) {
        self.calls.push(Call::FifoWrite(word));
        let bytes = word.to_le_bytes();
        match &mut self.phase {
            Some(phase) if phase.remaining > 0 => {
                let take = phase.remaining.min(4);
                phase.remaining -= take;
                let done = phase.remaining == 0;
                self.fifo_sink.extend_from_slice(&bytes[..take]);
                if done {
                    self.finish_phase();
                }
            }
            _ => self.trailer_sink.extend_from_slice(&bytes),
        }
    }

    fn dma_start(&mut self, desc: &mut TransferDescriptor<'_>) -> Result<(), DmaError> {
        if self.dma_busy {
            return Err(DmaError::ChannelBusy);
        }
        if self.caps.dma_granularity.is_none() {
            return Err(DmaError::Unsupported);
        }
        self.calls.push(Call::DmaStart(desc.direction(), desc.length()));
        match desc.direction() {
            Direction::ToHost => {
                for (dst, src) in desc.payload_mut().iter_mut().zip(self.card_data.iter()) {
                    *dst = *src;
                }
            }
            Direction::FromHost => self.dma_sink.extend_from_slice(desc.payload()),
        }
        if !self.dma_stall {
            if self.data_error.is_empty() {
                self.latched |= StatusBits::TRANSFER_COMPLETE;
            } else {
                self.latched |= self.data_error;
            }
            self.raise();
        }
        Ok(())
    }

    fn dma_release(&mut self, direction: Direction) {
        self.calls.push(Call::DmaRelease(direction));
    }
}
