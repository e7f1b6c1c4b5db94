//! Host Control Facade
//!
//! [`Host`] is the single entry point the chipset driver talks to. It owns the
//! bus controller adapter, the GPIO collaborator and the per-host state, and
//! routes every request through the command engine, the data engine and the
//! interrupt dispatcher.
//!
//! A `Host` only exists between [`Host::host_init`] and [`Host::host_exit`];
//! the latter consumes it, so use-after-exit does not compile.

pub mod adapter;
pub mod cmd;
pub mod data;
pub mod error;
pub mod irq;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

use adapter::{BusController, HostGpio, NoGpio, StatusBits};
use cmd::CommandEngine;
use data::{DataEngine, DataPath};
use error::{ClockError, InitError, ProtocolError};
use irq::{Completions, Dispatcher};
use types::{
    ClockMode, Command, CtlId, Direction, GpioId, GpioOp, IrqOp, IrqReason, IrqStatus, TransferDescriptor,
    TransferMode,
};

use crate::config::HostConfig;

/// Per-host state
#[derive(Debug, Clone)]
pub struct HostState {
    mode: TransferMode,
    clock: ClockMode,
    block_length: u16,
    last_response: u32,
    last_status: Option<IrqStatus>,
    staged: Option<Command>,
}

impl HostState {
    fn new(mode: TransferMode) -> Self {
        Self {
            mode,
            clock: ClockMode::Off,
            block_length: 0,
            last_response: 0,
            last_status: None,
            staged: None,
        }
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    pub fn clock(&self) -> ClockMode {
        self.clock
    }

    pub fn block_length(&self) -> u16 {
        self.block_length
    }

    /// Short response word of the last completed command
    pub fn last_response(&self) -> u32 {
        self.last_response
    }

    /// Status of the last completed command
    pub fn last_status(&self) -> Option<IrqStatus> {
        self.last_status
    }

    /// Data command waiting for its `host_fifo`
    pub fn staged(&self) -> Option<&Command> {
        self.staged.as_ref()
    }
}

/// An initialised SDIO/SPI host
pub struct Host<'c, A: BusController, G: HostGpio = NoGpio> {
    adapter: A,
    gpio: G,
    dispatcher: Dispatcher<'c>,
    config: HostConfig,
    state: HostState,
    cmd: CommandEngine,
    data: DataEngine,
}

impl<'c, A: BusController, G: HostGpio> Host<'c, A, G> {
    /// Bring up the controller in `mode`
    ///
    /// The controller is probed, reset and configured; on return the clock is
    /// off and every interrupt reason is disabled.
    pub fn host_init(
        mut adapter: A,
        gpio: G,
        completions: &'c Completions,
        mode: TransferMode,
        config: HostConfig,
    ) -> Result<Self, InitError> {
        if !adapter.probe() {
            log::error!(target: "sdio_host::host", "no bus controller found");
            return Err(InitError::AdapterUnavailable);
        }

        let caps = adapter.capabilities();
        if !caps.modes.supports(mode) {
            log::warn!(target: "sdio_host::host", "{:?} not supported (adapter modes {:?})", mode, caps.modes);
            return Err(InitError::UnsupportedMode);
        }

        if adapter.soft_reset(config.reset_retries).is_err() {
            adapter.shutdown();
            return Err(InitError::AdapterUnavailable);
        }

        adapter.configure(mode);
        if adapter.set_clock(ClockMode::Off, config.clock_retries).is_err() {
            adapter.shutdown();
            return Err(InitError::AdapterUnavailable);
        }
        adapter.write_enable(StatusBits::empty());
        completions.clear_all();

        log::info!(
            target: "sdio_host::host",
            "host up: {:?}, DMA {}, response irq {}",
            mode,
            if caps.dma_granularity.is_some() { "available" } else { "none" },
            caps.response_irq
        );

        Ok(Self {
            adapter,
            gpio,
            dispatcher: Dispatcher::new(completions),
            config,
            state: HostState::new(mode),
            cmd: CommandEngine::new(),
            data: DataEngine::new(),
        })
    }

    /// Soft-reset the controller, dropping any staged command and open DMA
    ///
    /// The interrupt enable mask survives; the clock is left off. Calling it
    /// repeatedly has the same effect as calling it once.
    pub fn host_reset(&mut self) -> Result<(), ProtocolError> {
        log::info!(target: "sdio_host::host", "controller reset");
        self.data.close_all(&mut self.adapter);
        let enabled = self.adapter.read_enable();
        self.cmd.reset();
        self.dispatcher.completions().clear_all();
        self.state.clock = ClockMode::Off;
        self.state.staged = None;
        self.state.last_status = None;

        let reset = self.adapter.soft_reset(self.config.reset_retries);
        self.adapter.program_clock(ClockMode::Off);
        self.adapter.write_enable(enabled);
        reset
    }

    /// Switch the bus clock; the state only changes once the clock is stable
    pub fn host_clock(&mut self, mode: ClockMode) -> Result<(), ClockError> {
        self.adapter.set_clock(mode, self.config.clock_retries)?;
        log::debug!(target: "sdio_host::host", "clock {:?} -> {:?}", self.state.clock, mode);
        self.state.clock = mode;
        Ok(())
    }

    /// Combined enable/disable/acknowledge/query entry point
    ///
    /// Enable, Disable and Acknowledge return `Success`; QueryStatus returns
    /// the decoded status, preferring a completion already posted by the
    /// interrupt handler.
    pub fn host_interrupt(&mut self, op: IrqOp, reason: IrqReason) -> IrqStatus {
        match op {
            IrqOp::Enable => {
                self.dispatcher.enable(&mut self.adapter, reason);
                IrqStatus::Success
            }
            IrqOp::Disable => {
                self.dispatcher.disable(&mut self.adapter, reason);
                IrqStatus::Success
            }
            IrqOp::Acknowledge => {
                self.dispatcher.acknowledge(&mut self.adapter, reason);
                IrqStatus::Success
            }
            IrqOp::QueryStatus => match self.dispatcher.completions().peek(reason) {
                Some(status) => status,
                None => self.dispatcher.query(&mut self.adapter, reason),
            },
        }
    }

    /// Submit a command
    ///
    /// Commands without a data phase run to completion and return their
    /// decoded status; a hardware timeout is `Ok(IrqStatus::Timeout)`.
    /// Commands with `HAS_DATA` are validated and staged, returning
    /// `Ok(IrqStatus::Inactive)`; the next `host_fifo` issues them once the
    /// data path is ready.
    pub fn host_cmd(&mut self, cmd: Command) -> Result<IrqStatus, ProtocolError> {
        self.require_clock()?;
        CommandEngine::validate(&cmd)?;

        if cmd.has_data() {
            if let Some(pending) = &self.state.staged {
                log::debug!(
                    target: "sdio_host::host",
                    "CMD{} refused: CMD{} still waiting for its data phase",
                    cmd.opcode,
                    pending.opcode
                );
                return Err(ProtocolError::OrderingViolation);
            }
            log::trace!(target: "sdio_host::host", "CMD{} staged for data phase", cmd.opcode);
            self.state.staged = Some(cmd);
            return Ok(IrqStatus::Inactive);
        }

        self.run_command(&cmd)
    }

    /// Run one data phase, issuing the staged data command at the right point
    ///
    /// DMA is used when the adapter, the configuration and the descriptor all
    /// allow it; otherwise, or when DMA setup fails, the FIFO path runs. The
    /// call returns only once the transfer has completed or failed, so the
    /// descriptor's buffer is never referenced afterwards.
    pub fn host_fifo(&mut self, mut desc: TransferDescriptor<'_>) -> Result<(), ProtocolError> {
        self.require_clock()?;
        let direction = desc.direction();

        let staged = self.state.staged.take();
        if let Some(cmd) = &staged {
            if cmd.data_direction() != Some(direction) {
                log::debug!(
                    target: "sdio_host::host",
                    "CMD{} direction {:?} does not match {:?} transfer",
                    cmd.opcode,
                    cmd.data_direction(),
                    direction
                );
                return Err(ProtocolError::OrderingViolation);
            }
        }

        self.data.claim(direction)?;
        let result = self.transfer(&mut desc, staged);
        self.data.release(direction);
        result
    }

    /// Get or set an ancillary value
    ///
    /// - `Length`: a non-zero `param` sets the block length; returns the
    ///   current block length.
    /// - `WaitCmdReady`: returns the last command's `IrqStatus` as `u32`
    ///   (`Inactive` when none has run).
    /// - `Response`: returns the last short response word.
    pub fn host_control(&mut self, id: CtlId, param: u32) -> u32 {
        match id {
            CtlId::Length => {
                if param != 0 {
                    match u16::try_from(param) {
                        Ok(length) => {
                            self.adapter.set_block_length(length);
                            self.state.block_length = length;
                        }
                        Err(_) => log::warn!(target: "sdio_host::host", "block length {} out of range", param),
                    }
                }
                self.state.block_length as u32
            }
            CtlId::WaitCmdReady => self.state.last_status.unwrap_or(IrqStatus::Inactive) as u32,
            CtlId::Response => self.state.last_response,
        }
    }

    /// Drive a chipset control line through the platform GPIO collaborator
    pub fn host_gpio(&mut self, op: GpioOp, id: GpioId) {
        self.gpio.apply(op, id);
    }

    /// Tear the host down and hand the adapter and GPIO back
    pub fn host_exit(mut self) -> (A, G) {
        self.adapter.write_enable(StatusBits::empty());
        self.data.close_all(&mut self.adapter);
        self.dispatcher.completions().clear_all();
        if let Err(e) = self.adapter.set_clock(ClockMode::Off, self.config.clock_retries) {
            log::warn!(target: "sdio_host::host", "clock stop on exit: {}", e);
        }
        self.adapter.shutdown();
        log::info!(target: "sdio_host::host", "host down");
        (self.adapter, self.gpio)
    }

    /// Interrupt handler body for platforms that route the vector here
    pub fn service_interrupt(&mut self) -> usize {
        self.dispatcher.service(&mut self.adapter)
    }

    pub fn state(&self) -> &HostState {
        &self.state
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    fn require_clock(&self) -> Result<(), ProtocolError> {
        if self.state.clock == ClockMode::Off {
            log::debug!(target: "sdio_host::host", "bus request with clock off");
            return Err(ProtocolError::OrderingViolation);
        }
        Ok(())
    }

    fn run_command(&mut self, cmd: &Command) -> Result<IrqStatus, ProtocolError> {
        let retries = self.config.command_retries;
        let status = if self.adapter.capabilities().response_irq {
            self.cmd.issue(&mut self.adapter, &self.dispatcher, cmd)?;
            let status = self.dispatcher.wait(&mut self.adapter, IrqReason::ResponseCompletion, retries);
            self.cmd.complete(status)
        } else {
            self.cmd.submit(&mut self.adapter, &self.dispatcher, cmd, retries)?
        };
        let status = self
            .cmd
            .await_release(&mut self.adapter, cmd, status, self.config.transfer_retries);

        if !status.is_error() {
            self.state.last_response = self.adapter.read_response();
        }
        self.state.last_status = Some(status);
        Ok(status)
    }

    /// Issue the staged command of a data phase and turn a failed response into an error
    fn run_data_command(&mut self, staged: Option<Command>) -> Result<(), ProtocolError> {
        let Some(cmd) = staged else {
            return Ok(());
        };
        match self.run_command(&cmd)? {
            IrqStatus::Timeout => Err(ProtocolError::Timeout),
            IrqStatus::Crc => Err(ProtocolError::Crc),
            status if status.is_error() => Err(ProtocolError::Incomplete),
            _ => Ok(()),
        }
    }

    fn transfer(&mut self, desc: &mut TransferDescriptor<'_>, staged: Option<Command>) -> Result<(), ProtocolError> {
        let caps = self.adapter.capabilities();
        let direction = desc.direction();

        if DataEngine::select_path(&caps, &self.config, desc) == DataPath::Dma {
            match self.data.begin_dma(&mut self.adapter, &self.dispatcher, desc) {
                Ok(()) => {
                    log::debug!(target: "sdio_host::host", "{:?} {} bytes via DMA", direction, desc.length());
                    if let Err(e) = self.run_data_command(staged) {
                        self.data.abort_dma(&mut self.adapter, &self.dispatcher, direction);
                        return Err(e);
                    }
                    return self.data.finish_dma(
                        &mut self.adapter,
                        &self.dispatcher,
                        direction,
                        self.config.transfer_retries,
                    );
                }
                Err(e) => log::warn!(target: "sdio_host::host", "DMA setup failed ({}), using FIFO", e),
            }
        }

        log::debug!(target: "sdio_host::host", "{:?} {} bytes via FIFO", direction, desc.length());
        self.data.prepare_fifo(&mut self.adapter, &self.dispatcher, desc);
        self.run_data_command(staged)?;
        let trailer = match direction {
            Direction::FromHost => self.config.write_trailer as usize + caps.write_trailer_bytes as usize,
            Direction::ToHost => 0,
        };
        self.data
            .run_fifo(&mut self.adapter, &self.dispatcher, desc, &self.config, trailer)
    }
}
