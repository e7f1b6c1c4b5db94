//! Command/Response Engine
//!
//! Loads the argument, issues the command and collects the short response
//! status:
//!
//! ```text
//! Idle -> ArgumentLoaded -> CommandIssued -> {ResponseReceived | TimedOut | CrcError} -> Idle
//! ```
//!
//! A hardware timeout is an `IrqStatus::Timeout` result, never an `Err`.

use super::adapter::BusController;
use super::error::ProtocolError;
use super::irq::{Dispatcher, decode};
use super::types::{Command, CommandFlags, IrqReason, IrqStatus};
use crate::time::{poll_for, wait_for};

/// Command engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdState {
    Idle,
    ArgumentLoaded,
    CommandIssued,
    ResponseReceived,
    TimedOut,
    CrcError,
}

/// Command/Response Engine
#[derive(Debug)]
pub struct CommandEngine {
    state: CmdState,
    last_opcode: Option<u8>,
}

impl CommandEngine {
    pub const fn new() -> Self {
        Self {
            state: CmdState::Idle,
            last_opcode: None,
        }
    }

    pub fn state(&self) -> CmdState {
        self.state
    }

    /// Opcode of the most recently issued command
    pub fn last_opcode(&self) -> Option<u8> {
        self.last_opcode
    }

    /// Reject commands the engine cannot decode, before touching the bus
    pub fn validate(cmd: &Command) -> Result<(), ProtocolError> {
        if !cmd.response.is_supported() {
            log::debug!(
                target: "sdio_host::cmd",
                "CMD{} rejected: response {:?} unsupported",
                cmd.opcode,
                cmd.response
            );
            return Err(ProtocolError::UnsupportedResponse);
        }
        Ok(())
    }

    /// Write the argument, then the command register
    ///
    /// Stale response status is dropped first so the wait that follows sees
    /// only this command's completion.
    pub fn issue<A: BusController + ?Sized>(
        &mut self,
        adapter: &mut A,
        dispatcher: &Dispatcher<'_>,
        cmd: &Command,
    ) -> Result<(), ProtocolError> {
        Self::validate(cmd)?;
        if self.state != CmdState::Idle {
            log::debug!(
                target: "sdio_host::cmd",
                "CMD{} issued while {:?}; previous response dropped",
                cmd.opcode,
                self.state
            );
            self.transition(CmdState::Idle);
        }

        dispatcher.arm(adapter, IrqReason::ResponseCompletion);

        adapter.write_argument(cmd.arg);
        self.transition(CmdState::ArgumentLoaded);
        adapter.write_command(cmd);
        self.transition(CmdState::CommandIssued);
        self.last_opcode = Some(cmd.opcode);

        log::trace!(target: "sdio_host::cmd", "CMD{} arg={:#010x} issued", cmd.opcode, cmd.arg);
        Ok(())
    }

    /// Record the outcome of the issued command and return to `Idle`
    pub fn complete(&mut self, status: IrqStatus) -> IrqStatus {
        let outcome = match status {
            IrqStatus::Timeout => CmdState::TimedOut,
            IrqStatus::Crc => CmdState::CrcError,
            _ => CmdState::ResponseReceived,
        };
        self.transition(outcome);
        if status.is_error() {
            log::debug!(
                target: "sdio_host::cmd",
                "CMD{} finished with {:?}",
                self.last_opcode.unwrap_or(0),
                status
            );
        }
        self.transition(CmdState::Idle);
        status
    }

    /// Poll the response status bits until the command resolves
    ///
    /// Used when the platform has no discrete response interrupt. The bits
    /// are decoded with Timeout > Crc > Active priority and acknowledged.
    pub fn busy_wait<A: BusController + ?Sized>(
        &mut self,
        adapter: &mut A,
        dispatcher: &Dispatcher<'_>,
        retries: u32,
    ) -> IrqStatus {
        let reason = IrqReason::ResponseCompletion;
        let status = poll_for(retries, || match decode(reason, adapter.read_status()) {
            IrqStatus::Inactive => None,
            status => Some(status),
        })
        .unwrap_or(IrqStatus::Timeout);
        dispatcher.acknowledge(adapter, reason);
        self.complete(status)
    }

    /// Issue `cmd` and busy-wait for its response
    pub fn submit<A: BusController + ?Sized>(
        &mut self,
        adapter: &mut A,
        dispatcher: &Dispatcher<'_>,
        cmd: &Command,
        retries: u32,
    ) -> Result<IrqStatus, ProtocolError> {
        self.issue(adapter, dispatcher, cmd)?;
        Ok(self.busy_wait(adapter, dispatcher, retries))
    }

    /// Hold a `BUSY` command's result until the card releases the data line
    ///
    /// Error results and commands without `BUSY` pass through untouched. A
    /// card still busy after `retries` checks turns the result into `Timeout`.
    pub fn await_release<A: BusController + ?Sized>(
        &mut self,
        adapter: &mut A,
        cmd: &Command,
        status: IrqStatus,
        retries: u32,
    ) -> IrqStatus {
        if status.is_error() || !cmd.flags.contains(CommandFlags::BUSY) {
            return status;
        }
        if wait_for(retries, || !adapter.card_busy()) {
            return status;
        }
        log::debug!(target: "sdio_host::cmd", "CMD{} card still busy after {} checks", cmd.opcode, retries);
        IrqStatus::Timeout
    }

    /// Forget any in-progress command (controller reset)
    pub fn reset(&mut self) {
        self.transition(CmdState::Idle);
    }

    fn transition(&mut self, next: CmdState) {
        if self.state != next {
            log::trace!(target: "sdio_host::cmd", "{:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self::new()
    }
}
