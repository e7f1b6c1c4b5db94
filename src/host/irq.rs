//! Interrupt/Completion Dispatcher
//!
//! Maps each [`IrqReason`] onto its controller status bits, decodes those bits
//! into an [`IrqStatus`], and hands completions from interrupt context to the
//! waiting caller through [`Completions`].
//!
//! Two producers feed the same result: a platform interrupt handler calling
//! [`service_interrupt`], and the bounded polling loop in
//! [`Dispatcher::wait`]. The engines above never know which one fired.

use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use super::adapter::{BusController, StatusBits};
use super::types::{IrqReason, IrqStatus};
use crate::time::poll_for;

/// Empty completion slot
const NO_COMPLETION: u8 = 0;

impl IrqReason {
    /// Bit that signals the event itself
    pub const fn event_bits(self) -> StatusBits {
        match self {
            Self::ResponseCompletion => StatusBits::CMD_COMPLETE,
            Self::RwAccessCompletion => StatusBits::TRANSFER_COMPLETE,
            Self::FifoReadReady => StatusBits::BUFFER_READ_READY,
            Self::FifoWriteReady => StatusBits::BUFFER_WRITE_READY,
            Self::TargetInterrupt => StatusBits::CARD_INT,
        }
    }

    /// Error bits that belong to this reason
    pub const fn error_bits(self) -> StatusBits {
        match self {
            Self::ResponseCompletion => StatusBits::CMD_TIMEOUT.union(StatusBits::CMD_CRC),
            Self::RwAccessCompletion => StatusBits::DATA_TIMEOUT
                .union(StatusBits::DATA_CRC)
                .union(StatusBits::FIFO_OVERRUN)
                .union(StatusBits::FIFO_UNDERRUN),
            _ => StatusBits::empty(),
        }
    }

    /// Every bit owned by this reason
    pub const fn status_bits(self) -> StatusBits {
        self.event_bits().union(self.error_bits())
    }
}

/// Decode the bits of `reason` in `status`
///
/// Severity wins over plain completion: Timeout, then CRC, then FIFO errors,
/// then Active. Bits that belong to other reasons are ignored.
pub fn decode(reason: IrqReason, status: StatusBits) -> IrqStatus {
    match reason {
        IrqReason::ResponseCompletion => {
            if status.contains(StatusBits::CMD_TIMEOUT) {
                IrqStatus::Timeout
            } else if status.contains(StatusBits::CMD_CRC) {
                IrqStatus::Crc
            } else if status.contains(StatusBits::CMD_COMPLETE) {
                IrqStatus::Active
            } else {
                IrqStatus::Inactive
            }
        }
        IrqReason::RwAccessCompletion => {
            if status.contains(StatusBits::DATA_TIMEOUT) {
                IrqStatus::Timeout
            } else if status.contains(StatusBits::DATA_CRC) {
                IrqStatus::Crc
            } else if status.intersects(StatusBits::FIFO_OVERRUN | StatusBits::FIFO_UNDERRUN) {
                IrqStatus::FifoError
            } else if status.contains(StatusBits::TRANSFER_COMPLETE) {
                IrqStatus::Active
            } else {
                IrqStatus::Inactive
            }
        }
        _ => {
            if status.contains(reason.event_bits()) {
                IrqStatus::Active
            } else {
                IrqStatus::Inactive
            }
        }
    }
}

/// Completion mailbox shared between interrupt context and the waiting caller
///
/// One slot per reason holds the last decoded status until it is taken. The
/// type is `Sync` and `const`-constructible so platforms keep it in a
/// `static` next to their interrupt handler.
pub struct Completions {
    slots: [AtomicU8; IrqReason::COUNT],
    notifier: Mutex<Option<fn(IrqReason, IrqStatus)>>,
}

impl Completions {
    pub const fn new() -> Self {
        Self {
            slots: [const { AtomicU8::new(NO_COMPLETION) }; IrqReason::COUNT],
            notifier: Mutex::new(None),
        }
    }

    /// Install a hook run after every `signal`, e.g. to wake a blocked task
    pub fn set_notifier(&self, notifier: fn(IrqReason, IrqStatus)) {
        *self.notifier.lock() = Some(notifier);
    }

    /// Post `status` for `reason`, replacing any unconsumed value
    pub fn signal(&self, reason: IrqReason, status: IrqStatus) {
        self.slots[reason.index()].store(status as u8, Ordering::Release);
        let notifier = *self.notifier.lock();
        if let Some(notify) = notifier {
            notify(reason, status);
        }
    }

    /// Consume the pending status for `reason`, if any
    pub fn take(&self, reason: IrqReason) -> Option<IrqStatus> {
        let raw = self.slots[reason.index()].swap(NO_COMPLETION, Ordering::AcqRel);
        IrqStatus::from_u8(raw)
    }

    /// Pending status for `reason`, left in place
    pub fn peek(&self, reason: IrqReason) -> Option<IrqStatus> {
        IrqStatus::from_u8(self.slots[reason.index()].load(Ordering::Acquire))
    }

    /// Whether a status is waiting for `reason`
    pub fn is_pending(&self, reason: IrqReason) -> bool {
        self.slots[reason.index()].load(Ordering::Acquire) != NO_COMPLETION
    }

    /// Drop any stale status for `reason`
    pub fn clear(&self, reason: IrqReason) {
        self.slots[reason.index()].store(NO_COMPLETION, Ordering::Release);
    }

    pub fn clear_all(&self) {
        for reason in IrqReason::ALL {
            self.clear(reason);
        }
    }
}

impl Default for Completions {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt handler body: acknowledge every enabled, asserted reason and post
/// its decoded status. Returns how many reasons fired.
///
/// The platform calls this from its interrupt vector with its own handle on
/// the controller registers.
pub fn service_interrupt<A: BusController + ?Sized>(adapter: &mut A, completions: &Completions) -> usize {
    let enabled = adapter.read_enable();
    let status = adapter.read_status();
    let mut fired = 0;
    for reason in IrqReason::ALL {
        if !enabled.intersects(reason.event_bits()) {
            continue;
        }
        let decoded = decode(reason, status);
        if decoded == IrqStatus::Inactive {
            continue;
        }
        adapter.clear_status(reason.status_bits());
        completions.signal(reason, decoded);
        log::trace!(target: "sdio_host::irq", "irq {:?} -> {:?}", reason, decoded);
        fired += 1;
    }
    fired
}

/// Per-host view of the interrupt sources
pub struct Dispatcher<'c> {
    completions: &'c Completions,
}

impl<'c> Dispatcher<'c> {
    pub fn new(completions: &'c Completions) -> Self {
        Self { completions }
    }

    pub fn completions(&self) -> &'c Completions {
        self.completions
    }

    pub fn enable<A: BusController + ?Sized>(&self, adapter: &mut A, reason: IrqReason) {
        let mask = adapter.read_enable() | reason.status_bits();
        adapter.write_enable(mask);
        log::trace!(target: "sdio_host::irq", "enable {:?}", reason);
    }

    pub fn disable<A: BusController + ?Sized>(&self, adapter: &mut A, reason: IrqReason) {
        let mask = adapter.read_enable() - reason.status_bits();
        adapter.write_enable(mask);
        debug_assert!(
            !adapter.read_enable().intersects(reason.status_bits()),
            "disable of {:?} did not take effect",
            reason
        );
        log::trace!(target: "sdio_host::irq", "disable {:?}", reason);
    }

    /// Clear the status bits owned by `reason` and any completion posted for it
    pub fn acknowledge<A: BusController + ?Sized>(&self, adapter: &mut A, reason: IrqReason) {
        adapter.clear_status(reason.status_bits());
        self.completions.clear(reason);
    }

    pub fn query<A: BusController + ?Sized>(&self, adapter: &mut A, reason: IrqReason) -> IrqStatus {
        decode(reason, adapter.read_status())
    }

    /// Arm `reason` for a new wait: drop stale completions and latched bits
    pub fn arm<A: BusController + ?Sized>(&self, adapter: &mut A, reason: IrqReason) {
        self.acknowledge(adapter, reason);
    }

    /// Poll up to `retries` times for `reason` to leave `Inactive`
    ///
    /// A completion posted by the interrupt handler is consumed first;
    /// otherwise the status bits are polled and acknowledged here. `None`
    /// means the budget ran out with nothing observed.
    pub fn poll<A: BusController + ?Sized>(
        &self,
        adapter: &mut A,
        reason: IrqReason,
        retries: u32,
    ) -> Option<IrqStatus> {
        poll_for(retries, || {
            if let Some(status) = self.completions.take(reason) {
                return Some(status);
            }
            let status = self.query(adapter, reason);
            if status == IrqStatus::Inactive {
                return None;
            }
            self.acknowledge(adapter, reason);
            Some(status)
        })
    }

    /// Like [`Dispatcher::poll`], but running out of polls is `IrqStatus::Timeout`
    pub fn wait<A: BusController + ?Sized>(&self, adapter: &mut A, reason: IrqReason, retries: u32) -> IrqStatus {
        self.poll(adapter, reason, retries).unwrap_or_else(|| {
            log::debug!(target: "sdio_host::irq", "wait {:?} timed out after {} polls", reason, retries);
            IrqStatus::Timeout
        })
    }

    /// Handle a pending interrupt on the caller's own adapter handle
    pub fn service<A: BusController + ?Sized>(&self, adapter: &mut A) -> usize {
        service_interrupt(adapter, self.completions)
    }
}
