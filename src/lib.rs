//! SDIO/SPI host transport
//!
//! A platform-independent host-side transport for SDIO wireless chipsets.
//! The [`Host`] facade drives commands, FIFO and DMA data phases and
//! interrupt completions over a [`BusController`] adapter; concrete adapters
//! for SDHCI-style slots and SPI-mode cards live in [`drivers`].

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod drivers;
pub mod host;
pub mod logger;
pub mod time;

pub use config::{DmaPolicy, HostConfig};
pub use host::adapter::{BusController, Capabilities, HostGpio, ModeSet, NoGpio, StatusBits};
pub use host::error::{ClockError, DmaError, InitError, ProtocolError};
pub use host::irq::{Completions, service_interrupt};
pub use host::types::{
    ClockMode, Command, CommandFlags, CtlId, Direction, GpioId, GpioOp, IrqOp, IrqReason, IrqStatus, R5Flags,
    ResponseKind, TransferDescriptor, TransferMode,
};
pub use host::{Host, HostState};
