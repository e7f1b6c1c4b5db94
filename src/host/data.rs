//! Data Transfer Engine
//!
//! Moves a payload through the controller either word by word through the
//! FIFO, or by handing the buffer to the adapter's DMA engine. The path is
//! picked per transfer; FIFO is always correct and is the fallback whenever
//! DMA setup is refused.

use super::adapter::{BusController, Capabilities};
use super::error::{DmaError, ProtocolError};
use super::irq::Dispatcher;
use super::types::{Direction, IrqReason, IrqStatus, TransferDescriptor};
use crate::config::{DmaPolicy, HostConfig};
use crate::time::poll_for;

/// Trailer byte clocked after a write payload
const TRAILER_WORD: u32 = 0xFFFF_FFFF;

/// FIFO word width in bytes
const WORD: usize = 4;

/// Data path chosen for one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPath {
    Fifo,
    Dma,
}

/// Data Transfer Engine
///
/// Tracks which directions have a transfer in flight and which DMA channels
/// are mapped, so a second request on a busy direction is refused and
/// `host_exit` can release what is still open. `dma_irq` names the channel
/// that turned the completion interrupt on and must turn it off again.
#[derive(Debug, Default)]
pub struct DataEngine {
    busy: [bool; 2],
    dma_open: [bool; 2],
    dma_irq: Option<Direction>,
}

impl DataEngine {
    pub const fn new() -> Self {
        Self {
            busy: [false; 2],
            dma_open: [false; 2],
            dma_irq: None,
        }
    }

    /// Pick the data path for `desc`
    ///
    /// DMA needs an engine, a bus address, and a length that is a multiple of
    /// the engine's granularity.
    pub fn select_path(caps: &Capabilities, config: &HostConfig, desc: &TransferDescriptor<'_>) -> DataPath {
        if config.dma == DmaPolicy::Disabled {
            return DataPath::Fifo;
        }
        let Some(granularity) = caps.dma_granularity else {
            return DataPath::Fifo;
        };
        if granularity == 0 || desc.phys_addr().is_none() || desc.length() % granularity != 0 {
            return DataPath::Fifo;
        }
        DataPath::Dma
    }

    /// Mark `direction` busy for the duration of one transfer
    pub fn claim(&mut self, direction: Direction) -> Result<(), ProtocolError> {
        let slot = &mut self.busy[direction.index()];
        if *slot {
            log::debug!(target: "sdio_host::data", "{:?} transfer already in flight", direction);
            return Err(ProtocolError::OrderingViolation);
        }
        *slot = true;
        Ok(())
    }

    pub fn release(&mut self, direction: Direction) {
        self.busy[direction.index()] = false;
    }

    pub fn is_busy(&self, direction: Direction) -> bool {
        self.busy[direction.index()]
    }

    /// Arm and enable the completion reason, then start DMA for `desc`
    ///
    /// The reason is enabled only if it was not already, and the enable mask
    /// is restored when the channel closes. On error nothing is left armed
    /// and the caller falls back to the FIFO.
    pub fn begin_dma<A: BusController + ?Sized>(
        &mut self,
        adapter: &mut A,
        dispatcher: &Dispatcher<'_>,
        desc: &mut TransferDescriptor<'_>,
    ) -> Result<(), DmaError> {
        let direction = desc.direction();
        if self.dma_open[direction.index()] {
            return Err(DmaError::ChannelBusy);
        }
        let reason = IrqReason::RwAccessCompletion;
        dispatcher.arm(adapter, reason);
        let enable_here = !adapter.read_enable().contains(reason.status_bits());
        if enable_here {
            dispatcher.enable(adapter, reason);
        }
        if let Err(err) = adapter.dma_start(desc) {
            if enable_here {
                dispatcher.disable(adapter, reason);
            }
            return Err(err);
        }
        self.dma_open[direction.index()] = true;
        if enable_here {
            self.dma_irq = Some(direction);
        }
        log::trace!(
            target: "sdio_host::data",
            "DMA {:?} {} bytes @ {:#x} started",
            direction,
            desc.length(),
            desc.phys_addr().unwrap_or(0)
        );
        Ok(())
    }

    /// Wait for the DMA completion, release the channel and classify the result
    pub fn finish_dma<A: BusController + ?Sized>(
        &mut self,
        adapter: &mut A,
        dispatcher: &Dispatcher<'_>,
        direction: Direction,
        retries: u32,
    ) -> Result<(), ProtocolError> {
        let status = dispatcher.poll(adapter, IrqReason::RwAccessCompletion, retries);
        self.close_dma(adapter, direction);
        match status {
            Some(status) => classify(status, direction),
            None => {
                log::debug!(target: "sdio_host::data", "DMA {:?} never completed", direction);
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Tear down an armed DMA transfer whose command failed
    pub fn abort_dma<A: BusController + ?Sized>(
        &mut self,
        adapter: &mut A,
        dispatcher: &Dispatcher<'_>,
        direction: Direction,
    ) {
        self.close_dma(adapter, direction);
        dispatcher.arm(adapter, IrqReason::RwAccessCompletion);
    }

    /// Release every DMA channel still mapped
    pub fn close_all<A: BusController + ?Sized>(&mut self, adapter: &mut A) {
        for direction in [Direction::ToHost, Direction::FromHost] {
            self.close_dma(adapter, direction);
            self.release(direction);
        }
    }

    fn close_dma<A: BusController + ?Sized>(&mut self, adapter: &mut A, direction: Direction) {
        let open = &mut self.dma_open[direction.index()];
        if *open {
            adapter.dma_release(direction);
            *open = false;
        }
        if self.dma_irq == Some(direction) {
            let mask = adapter.read_enable() - IrqReason::RwAccessCompletion.status_bits();
            adapter.write_enable(mask);
            self.dma_irq = None;
        }
    }

    /// Set the controller up for a FIFO data phase; must precede the command
    pub fn prepare_fifo<A: BusController + ?Sized>(
        &mut self,
        adapter: &mut A,
        dispatcher: &Dispatcher<'_>,
        desc: &TransferDescriptor<'_>,
    ) {
        dispatcher.arm(adapter, IrqReason::RwAccessCompletion);
        adapter.prepare_data(desc.direction(), desc.length());
    }

    /// Move the payload word by word, then wait for transfer complete
    ///
    /// Each word waits on its buffer-ready bit. Write payloads are followed by
    /// `trailer` bytes of `0xFF`, rounded up to whole words. All words moved
    /// without a completion bit is `Incomplete`.
    pub fn run_fifo<A: BusController + ?Sized>(
        &mut self,
        adapter: &mut A,
        dispatcher: &Dispatcher<'_>,
        desc: &mut TransferDescriptor<'_>,
        config: &HostConfig,
        trailer: usize,
    ) -> Result<(), ProtocolError> {
        let direction = desc.direction();
        match direction {
            Direction::ToHost => {
                for chunk in desc.payload_mut().chunks_mut(WORD) {
                    wait_word(adapter, dispatcher, direction, config.fifo_retries)?;
                    let word = adapter.fifo_read_word().to_le_bytes();
                    chunk.copy_from_slice(&word[..chunk.len()]);
                }
            }
            Direction::FromHost => {
                for chunk in desc.payload().chunks(WORD) {
                    wait_word(adapter, dispatcher, direction, config.fifo_retries)?;
                    let mut word = [0u8; WORD];
                    word[..chunk.len()].copy_from_slice(chunk);
                    adapter.fifo_write_word(u32::from_le_bytes(word));
                }
                for _ in 0..trailer.div_ceil(WORD) {
                    wait_word(adapter, dispatcher, direction, config.fifo_retries)?;
                    adapter.fifo_write_word(TRAILER_WORD);
                }
            }
        }

        match dispatcher.poll(adapter, IrqReason::RwAccessCompletion, config.transfer_retries) {
            Some(status) => classify(status, direction),
            None => {
                log::debug!(
                    target: "sdio_host::data",
                    "{:?} {} bytes moved but transfer never completed",
                    direction,
                    desc.length()
                );
                Err(ProtocolError::Incomplete)
            }
        }
    }
}

/// Wait for the FIFO to accept or offer one word, failing early on data errors
fn wait_word<A: BusController + ?Sized>(
    adapter: &mut A,
    dispatcher: &Dispatcher<'_>,
    direction: Direction,
    retries: u32,
) -> Result<(), ProtocolError> {
    let ready = match direction {
        Direction::ToHost => IrqReason::FifoReadReady,
        Direction::FromHost => IrqReason::FifoWriteReady,
    };
    poll_for(retries, || {
        let data = dispatcher.query(adapter, IrqReason::RwAccessCompletion);
        if data.is_error() {
            dispatcher.acknowledge(adapter, IrqReason::RwAccessCompletion);
            return Some(classify(data, direction));
        }
        (dispatcher.query(adapter, ready) == IrqStatus::Active).then_some(Ok(()))
    })
    .unwrap_or_else(|| {
        log::debug!(target: "sdio_host::data", "{:?} FIFO not ready after {} polls", ready, retries);
        Err(ProtocolError::Timeout)
    })
}

/// Map a decoded transfer status onto the request result
fn classify(status: IrqStatus, direction: Direction) -> Result<(), ProtocolError> {
    match status {
        IrqStatus::Active | IrqStatus::Success => Ok(()),
        IrqStatus::Timeout => Err(ProtocolError::Timeout),
        IrqStatus::Crc => Err(ProtocolError::Crc),
        IrqStatus::FifoError => Err(match direction {
            Direction::ToHost => ProtocolError::FifoOverrun,
            Direction::FromHost => ProtocolError::FifoUnderrun,
        }),
        IrqStatus::Inactive | IrqStatus::Fail => Err(ProtocolError::Incomplete),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::adapter::StatusBits;
    use crate::host::irq::Completions;
    use crate::host::mock::{Call, MockController};

    fn config() -> HostConfig {
        HostConfig::default_const().with_retries(200)
    }

    fn fifo_transfer(
        mock: &mut MockController,
        desc: &mut TransferDescriptor<'_>,
        trailer: usize,
    ) -> Result<(), ProtocolError> {
        let completions = Completions::new();
        let dispatcher = Dispatcher::new(&completions);
        let mut engine = DataEngine::new();
        engine.prepare_fifo(mock, &dispatcher, desc);
        engine.run_fifo(mock, &dispatcher, desc, &config(), trailer)
    }

    #[test]
    fn path_selection_requires_alignment_and_address() {
        let caps = MockController::dma_capable().capabilities();
        let cfg = HostConfig::default();
        let mut buf = [0u8; 64];

        let desc = TransferDescriptor::new(&mut buf, Direction::ToHost).unwrap();
        assert_eq!(DataEngine::select_path(&caps, &cfg, &desc), DataPath::Fifo);

        let desc = desc.with_phys_addr(0x8000_0000);
        assert_eq!(DataEngine::select_path(&caps, &cfg, &desc), DataPath::Dma);
        assert_eq!(
            DataEngine::select_path(&caps, &cfg.with_dma(DmaPolicy::Disabled), &desc),
            DataPath::Fifo
        );

        let desc = desc.with_length(60).unwrap();
        assert_eq!(DataEngine::select_path(&caps, &cfg, &desc), DataPath::Fifo);

        let no_dma = MockController::sdio().capabilities();
        let desc = desc.with_length(64).unwrap();
        assert_eq!(DataEngine::select_path(&no_dma, &cfg, &desc), DataPath::Fifo);
    }

    #[test]
    fn fifo_read_packs_little_endian_words_and_short_tail() {
        let mut mock = MockController::sdio();
        mock.card_data = (1..=7).collect();
        let mut buf = [0u8; 7];
        let mut desc = TransferDescriptor::new(&mut buf, Direction::ToHost).unwrap();

        fifo_transfer(&mut mock, &mut desc, 0).unwrap();

        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(mock.count(|c| matches!(c, Call::FifoRead)), 2);
    }

    #[test]
    fn fifo_write_appends_trailer_words() {
        let mut mock = MockController::sdio();
        let mut payload = [0xA5u8; 8];
        let mut desc = TransferDescriptor::new(&mut payload, Direction::FromHost).unwrap();

        fifo_transfer(&mut mock, &mut desc, 2).unwrap();

        assert_eq!(mock.fifo_sink, vec![0xA5; 8]);
        assert_eq!(mock.trailer_sink, vec![0xFF; 4]);
    }

    #[test]
    fn fifo_never_ready_times_out_within_cap() {
        let mut mock = MockController::sdio();
        mock.fifo_ready = false;
        let mut buf = [0u8; 16];
        let mut desc = TransferDescriptor::new(&mut buf, Direction::ToHost).unwrap();

        assert_eq!(fifo_transfer(&mut mock, &mut desc, 0), Err(ProtocolError::Timeout));
        assert_eq!(mock.count(|c| matches!(c, Call::FifoRead)), 0);
        assert!(mock.status_reads() <= 2 * 200);
    }

    #[test]
    fn words_without_completion_are_incomplete() {
        let mut mock = MockController::sdio();
        mock.complete_after_data = false;
        let mut buf = [0u8; 16];
        let mut desc = TransferDescriptor::new(&mut buf, Direction::ToHost).unwrap();

        assert_eq!(fifo_transfer(&mut mock, &mut desc, 0), Err(ProtocolError::Incomplete));
        assert_eq!(mock.count(|c| matches!(c, Call::FifoRead)), 4);
    }

    #[test]
    fn data_errors_are_classified_per_direction() {
        let cases = [
            (StatusBits::DATA_CRC, Direction::ToHost, ProtocolError::Crc),
            (StatusBits::FIFO_OVERRUN, Direction::ToHost, ProtocolError::FifoOverrun),
            (StatusBits::FIFO_UNDERRUN, Direction::FromHost, ProtocolError::FifoUnderrun),
            (StatusBits::DATA_TIMEOUT, Direction::FromHost, ProtocolError::Timeout),
        ];
        for (error, direction, expected) in cases {
            let mut mock = MockController::sdio();
            mock.data_error = error;
            let mut buf = [0u8; 32];
            let mut desc = TransferDescriptor::new(&mut buf, direction).unwrap();
            assert_eq!(fifo_transfer(&mut mock, &mut desc, 0), Err(expected), "{:?}", error);
        }
    }

    #[test]
    fn error_mid_transfer_stops_word_loop() {
        let mut mock = MockController::sdio();
        mock.latch(StatusBits::DATA_CRC);
        let mut buf = [0u8; 32];
        let mut desc = TransferDescriptor::new(&mut buf, Direction::ToHost).unwrap();
        let completions = Completions::new();
        let dispatcher = Dispatcher::new(&completions);
        let mut engine = DataEngine::new();

        let result = engine.run_fifo(&mut mock, &dispatcher, &mut desc, &config(), 0);

        assert_eq!(result, Err(ProtocolError::Crc));
        assert_eq!(mock.count(|c| matches!(c, Call::FifoRead)), 0);
    }

    #[test]
    fn claim_refuses_busy_direction() {
        let mut engine = DataEngine::new();
        engine.claim(Direction::ToHost).unwrap();
        assert_eq!(engine.claim(Direction::ToHost), Err(ProtocolError::OrderingViolation));
        engine.claim(Direction::FromHost).unwrap();
        engine.release(Direction::ToHost);
        assert!(!engine.is_busy(Direction::ToHost));
        assert!(engine.is_busy(Direction::FromHost));
    }

    #[test]
    fn dma_completion_releases_channel() {
        let mut mock = MockController::dma_capable();
        mock.card_data = (0..32).collect();
        let completions = Completions::new();
        let dispatcher = Dispatcher::new(&completions);
        let mut engine = DataEngine::new();
        let mut buf = [0u8; 32];
        let mut desc = TransferDescriptor::new(&mut buf, Direction::ToHost)
            .unwrap()
            .with_phys_addr(0x1000);

        engine.begin_dma(&mut mock, &dispatcher, &mut desc).unwrap();
        assert_eq!(
            engine.begin_dma(&mut mock, &dispatcher, &mut desc),
            Err(DmaError::ChannelBusy)
        );
        engine.finish_dma(&mut mock, &dispatcher, Direction::ToHost, 100).unwrap();

        assert_eq!(mock.count(|c| matches!(c, Call::DmaRelease(Direction::ToHost))), 1);
        assert_eq!(buf.to_vec(), (0..32).collect::<Vec<u8>>());
    }

    #[test]
    fn dma_enables_completion_for_its_lifetime() {
        let mut mock = MockController::dma_capable();
        let completions = Completions::new();
        let dispatcher = Dispatcher::new(&completions);
        let mut engine = DataEngine::new();
        let mut buf = [0u8; 16];
        let mut desc = TransferDescriptor::new(&mut buf, Direction::ToHost)
            .unwrap()
            .with_phys_addr(0x1000);

        engine.begin_dma(&mut mock, &dispatcher, &mut desc).unwrap();
        assert!(mock.read_enable().contains(IrqReason::RwAccessCompletion.status_bits()));
        engine.finish_dma(&mut mock, &dispatcher, Direction::ToHost, 100).unwrap();
        assert!(mock.read_enable().is_empty());

        // Already enabled by the caller: left alone on close
        dispatcher.enable(&mut mock, IrqReason::RwAccessCompletion);
        engine.begin_dma(&mut mock, &dispatcher, &mut desc).unwrap();
        engine.abort_dma(&mut mock, &dispatcher, Direction::ToHost);
        assert_eq!(mock.read_enable(), IrqReason::RwAccessCompletion.status_bits());

        dispatcher.disable(&mut mock, IrqReason::RwAccessCompletion);
        mock.dma_busy = true;
        assert_eq!(
            engine.begin_dma(&mut mock, &dispatcher, &mut desc),
            Err(DmaError::ChannelBusy)
        );
        assert!(mock.read_enable().is_empty());
    }

    #[test]
    fn stalled_dma_times_out() {
        let mut mock = MockController::dma_capable();
        mock.dma_stall = true;
        let completions = Completions::new();
        let dispatcher = Dispatcher::new(&completions);
        let mut engine = DataEngine::new();
        let mut buf = [0u8; 16];
        let mut desc = TransferDescriptor::new(&mut buf, Direction::FromHost)
            .unwrap()
            .with_phys_addr(0x2000);

        engine.begin_dma(&mut mock, &dispatcher, &mut desc).unwrap();
        assert_eq!(
            engine.finish_dma(&mut mock, &dispatcher, Direction::FromHost, 30),
            Err(ProtocolError::Timeout)
        );
        assert_eq!(mock.count(|c| matches!(c, Call::DmaRelease(_))), 1);
    }
}
