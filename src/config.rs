//! Host transport configuration
//!
//! Iteration caps for every bounded busy-wait and the data-path policy. A
//! platform typically keeps one `static` configuration built with
//! [`HostConfig::default_const`] and the `with_*` setters.

/// Default cap for clock-stabilisation, command and FIFO-readiness waits
pub const DEFAULT_RETRIES: u32 = 10_000;

/// Default cap for the overall transfer-complete wait
pub const DEFAULT_TRANSFER_RETRIES: u32 = 100_000;

/// Whether the data engine may take the DMA path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaPolicy {
    /// Use DMA whenever the descriptor and adapter allow it
    Auto,
    /// Always use the FIFO path
    Disabled,
}

/// Host transport configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    /// Polls allowed for the "clock stable" bit
    pub clock_retries: u32,
    /// Polls allowed for command completion on the busy-wait path
    pub command_retries: u32,
    /// Polls allowed for each FIFO word's "buffer ready" bit
    pub fifo_retries: u32,
    /// Polls allowed for "transfer complete" after the last word or a DMA start
    pub transfer_retries: u32,
    /// Polls allowed for the controller soft reset to finish
    pub reset_retries: u32,
    /// Data-path policy
    pub dma: DmaPolicy,
    /// Extra `0xFF` bytes emitted after a FIFO write payload, added to the
    /// adapter's own trailer requirement
    pub write_trailer: u8,
}

impl HostConfig {
    /// Default configuration usable in `static` initialisers
    pub const fn default_const() -> Self {
        Self {
            clock_retries: DEFAULT_RETRIES,
            command_retries: DEFAULT_RETRIES,
            fifo_retries: DEFAULT_RETRIES,
            transfer_retries: DEFAULT_TRANSFER_RETRIES,
            reset_retries: DEFAULT_RETRIES,
            dma: DmaPolicy::Auto,
            write_trailer: 0,
        }
    }

    /// Use the same cap for every wait
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.clock_retries = retries;
        self.command_retries = retries;
        self.fifo_retries = retries;
        self.transfer_retries = retries;
        self.reset_retries = retries;
        self
    }

    pub const fn with_clock_retries(mut self, retries: u32) -> Self {
        self.clock_retries = retries;
        self
    }

    pub const fn with_command_retries(mut self, retries: u32) -> Self {
        self.command_retries = retries;
        self
    }

    pub const fn with_fifo_retries(mut self, retries: u32) -> Self {
        self.fifo_retries = retries;
        self
    }

    pub const fn with_transfer_retries(mut self, retries: u32) -> Self {
        self.transfer_retries = retries;
        self
    }

    pub const fn with_dma(mut self, dma: DmaPolicy) -> Self {
        self.dma = dma;
        self
    }

    pub const fn with_write_trailer(mut self, bytes: u8) -> Self {
        self.write_trailer = bytes;
        self
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::default_const()
    }
}
