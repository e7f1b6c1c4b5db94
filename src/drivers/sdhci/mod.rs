//! SDHCI (SD Host Controller Interface) bus controller
//!
//! Drives a standard SDHCI slot in 1-bit or 4-bit SDIO mode. Interrupt status
//! bits are passed through unchanged (the register layout is the
//! `StatusBits` layout); per-word FIFO readiness comes from the Present
//! State buffer-enable bits. DMA uses SDMA with a 32-bit system address.

pub mod regs;

use core::ptr::NonNull;
use core::sync::atomic::{Ordering, fence};

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

use crate::host::adapter::{BusController, Capabilities, ModeSet, StatusBits};
use crate::host::error::DmaError;
use crate::host::types::{ClockMode, Command, CommandFlags, Direction, ResponseKind, TransferDescriptor, TransferMode};
use crate::time::wait_for;

use regs::*;

/// Polls allowed for CMD/DAT inhibit to clear before a command write
const INHIBIT_POLLS: u32 = 100_000;

/// SDHCI controller
pub struct SdhciController {
    /// MMIO registers
    regs: NonNull<SdhciRegisters>,
    /// SDHCI specification version
    version: u8,
    /// Base clock frequency (Hz)
    base_clock: u32,
    /// SDMA supported
    sdma: bool,
    /// Block length set through `set_block_length`
    block_length: u16,
    /// Direction with a live SDMA transfer
    dma_active: [bool; 2],
}

// SAFETY: the register block is only reached through `&mut self`; the host
// serialises all access to one controller.
unsafe impl Send for SdhciController {}

impl SdhciController {
    /// Wrap the SDHCI register block mapped at `mmio_base`
    ///
    /// # Safety
    ///
    /// `mmio_base` must be the uncached mapping of an SDHCI slot's 256-byte
    /// register block, valid for the lifetime of the controller and not
    /// accessed by anything else.
    pub unsafe fn new(mmio_base: usize) -> Option<Self> {
        let regs = NonNull::new(mmio_base as *mut SdhciRegisters)?;
        Some(Self {
            regs,
            version: 0,
            base_clock: 0,
            sdma: false,
            block_length: 0,
            dma_active: [false; 2],
        })
    }

    /// Get reference to registers
    #[inline]
    fn regs(&self) -> &SdhciRegisters {
        // SAFETY: `new` requires a valid, exclusively owned register block
        unsafe { self.regs.as_ref() }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn base_clock(&self) -> u32 {
        self.base_clock
    }

    /// Power the bus at the highest voltage the slot supports
    fn power_on(&self) {
        let regs = self.regs();
        let voltage = if regs.capabilities.is_set(CAPABILITIES::SUPPORT_3V3) {
            POWER_CONTROL::BUS_VOLTAGE::V3_3
        } else if regs.capabilities.is_set(CAPABILITIES::SUPPORT_3V0) {
            POWER_CONTROL::BUS_VOLTAGE::V3_0
        } else {
            POWER_CONTROL::BUS_VOLTAGE::V1_8
        };
        regs.power_control.set(0);
        regs.power_control.write(POWER_CONTROL::BUS_POWER::SET + voltage);
    }

    fn set_bus_width(&self, mode: TransferMode) {
        let width = match mode {
            TransferMode::FourBitSdio => HOST_CONTROL::DATA_WIDTH_4BIT::SET,
            _ => HOST_CONTROL::DATA_WIDTH_4BIT::CLEAR,
        };
        self.regs()
            .host_control
            .modify(width + HOST_CONTROL::DATA_WIDTH_8BIT::CLEAR + HOST_CONTROL::DMA_SELECT::SDMA);
    }

    fn wait_inhibit(&self, data: bool) -> bool {
        let present = &self.regs().present_state;
        wait_for(INHIBIT_POLLS, || {
            !present.is_set(PRESENT_STATE::CMD_INHIBIT) && !(data && present.is_set(PRESENT_STATE::DAT_INHIBIT))
        })
    }

    /// Program block size, count and transfer mode for one data phase
    fn setup_transfer(&self, direction: Direction, length: u16, dma: bool) {
        let regs = self.regs();
        let (size, count) = block_geometry(length, self.block_length);
        regs.block_size
            .write(BLOCK_SIZE::BLOCK_SIZE.val(size) + BLOCK_SIZE::SDMA_BOUNDARY.val(SDHCI_DEFAULT_BOUNDARY_ARG));
        regs.block_count.set(count);

        let mut mode = TRANSFER_MODE::BLOCK_COUNT_ENABLE::SET;
        if dma {
            mode += TRANSFER_MODE::DMA_ENABLE::SET;
        }
        if direction == Direction::ToHost {
            mode += TRANSFER_MODE::DATA_DIRECTION::SET;
        }
        if count > 1 {
            mode += TRANSFER_MODE::MULTI_BLOCK::SET;
        }
        regs.transfer_mode.write(mode);
    }
}

impl BusController for SdhciController {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            modes: ModeSet::ONE_BIT | ModeSet::FOUR_BIT,
            dma_granularity: self.sdma.then_some(SDMA_GRANULARITY),
            response_irq: true,
            write_trailer_bytes: 0,
        }
    }

    fn probe(&mut self) -> bool {
        let regs = self.regs();
        let raw_caps = regs.capabilities.get();
        if raw_caps == 0 || raw_caps == u32::MAX {
            log::error!(target: "sdio_host::sdhci", "SDHCI: no controller (capabilities {:#010x})", raw_caps);
            return false;
        }

        let version = regs.host_version.read(HOST_VERSION::SPEC_VERSION) as u8;
        let vendor = regs.host_version.read(HOST_VERSION::VENDOR_VERSION);
        let mut base_mhz = regs.capabilities.read(CAPABILITIES::BASE_CLK_FREQ);
        if version < SDHCI_SPEC_300 {
            base_mhz &= 0x3F;
        }
        let sdma = regs.capabilities.is_set(CAPABILITIES::SUPPORT_SDMA);

        self.version = version;
        self.base_clock = base_mhz * 1_000_000;
        self.sdma = sdma;

        log::info!(
            target: "sdio_host::sdhci",
            "SDHCI: version {}.0 (vendor {:#x}), base clock {} MHz, SDMA {}",
            version + 1,
            vendor,
            base_mhz,
            if sdma { "yes" } else { "no" }
        );
        self.base_clock != 0
    }

    fn configure(&mut self, mode: TransferMode) {
        self.power_on();
        self.set_bus_width(mode);
        let regs = self.regs();
        regs.timeout_control.set(SDHCI_TIMEOUT_MAX);
        regs.int_enable.set(SDHCI_INT_USED_MASK);
        regs.signal_enable.set(0);
        log::debug!(target: "sdio_host::sdhci", "SDHCI: configured for {:?}", mode);
    }

    fn shutdown(&mut self) {
        let regs = self.regs();
        regs.signal_enable.set(0);
        regs.int_enable.set(0);
        regs.clock_control.set(0);
        regs.power_control.set(0);
        self.dma_active = [false; 2];
        log::debug!(target: "sdio_host::sdhci", "SDHCI: powered down");
    }

    fn start_reset(&mut self) {
        self.regs().software_reset.write(SOFTWARE_RESET::RESET_ALL::SET);
        self.dma_active = [false; 2];
    }

    fn reset_done(&mut self) -> bool {
        !self.regs().software_reset.is_set(SOFTWARE_RESET::RESET_ALL)
    }

    fn read_status(&mut self) -> StatusBits {
        let regs = self.regs();
        let raw = regs.int_status.get();
        if regs.int_status.is_set(INT_STATUS::DMA_INT) {
            // SDMA boundary: re-arm at the address the engine stopped at
            let next = regs.sdma_addr.get();
            regs.sdma_addr.set(next);
            regs.int_status.write(INT_STATUS::DMA_INT::SET);
        }

        let mut status = StatusBits::from_bits_truncate(raw);
        if regs.present_state.is_set(PRESENT_STATE::BUFFER_READ_ENABLE) {
            status |= StatusBits::BUFFER_READ_READY;
        }
        if regs.present_state.is_set(PRESENT_STATE::BUFFER_WRITE_ENABLE) {
            status |= StatusBits::BUFFER_WRITE_READY;
        }
        status
    }

    fn clear_status(&mut self, bits: StatusBits) {
        self.regs().int_status.set(bits.bits());
    }

    fn read_enable(&self) -> StatusBits {
        StatusBits::from_bits_truncate(self.regs().signal_enable.get())
    }

    fn write_enable(&mut self, bits: StatusBits) {
        self.regs().signal_enable.set(bits.bits());
    }

    fn program_clock(&mut self, mode: ClockMode) {
        let regs = self.regs();
        regs.clock_control.set(0);

        let target = match mode {
            ClockMode::Off => return,
            ClockMode::Slow => SLOW_CLOCK_HZ,
            ClockMode::Fast => FAST_CLOCK_HZ,
        };
        let divider = clock_divider(self.version, self.base_clock, target);
        let (lo, hi) = divider_fields(self.version, divider);

        log::debug!(
            target: "sdio_host::sdhci",
            "SDHCI: Setting clock to {} Hz (divider={}, actual={})",
            target,
            divider,
            divided_clock(self.version, self.base_clock, divider)
        );

        regs.clock_control.write(
            CLOCK_CONTROL::FREQ_SELECT.val(lo)
                + CLOCK_CONTROL::FREQ_SELECT_HI.val(hi)
                + CLOCK_CONTROL::INTERNAL_CLK_EN::SET,
        );
    }

    /// Internal clock stable and card clock gated on
    ///
    /// The card clock is enabled here, on the first poll that sees the
    /// internal clock stable.
    fn clock_running(&mut self) -> bool {
        let clock = &self.regs().clock_control;
        if !clock.is_set(CLOCK_CONTROL::INTERNAL_CLK_EN) || !clock.is_set(CLOCK_CONTROL::INTERNAL_CLK_STABLE) {
            return false;
        }
        if !clock.is_set(CLOCK_CONTROL::SD_CLK_EN) {
            clock.modify(CLOCK_CONTROL::SD_CLK_EN::SET);
        }
        true
    }

    fn write_argument(&mut self, arg: u32) {
        self.regs().argument.set(arg);
    }

    fn write_command(&mut self, cmd: &Command) {
        if !self.wait_inhibit(cmd.has_data()) {
            log::warn!(target: "sdio_host::sdhci", "SDHCI: CMD{} issued with inhibit still set", cmd.opcode);
        }

        let mut value = COMMAND::CMD_INDEX.val(cmd.opcode as u16);
        match cmd.response {
            ResponseKind::None => value += COMMAND::RESPONSE_TYPE::None,
            ResponseKind::R1 | ResponseKind::R5 | ResponseKind::R6 | ResponseKind::R1b => {
                let kind = if cmd.response == ResponseKind::R1b || cmd.flags.contains(CommandFlags::BUSY) {
                    COMMAND::RESPONSE_TYPE::Short48Busy
                } else {
                    COMMAND::RESPONSE_TYPE::Short48
                };
                value = value + kind + COMMAND::CRC_CHECK::SET + COMMAND::INDEX_CHECK::SET
            }
            ResponseKind::R2 => value = value + COMMAND::RESPONSE_TYPE::Long136 + COMMAND::CRC_CHECK::SET,
            ResponseKind::R3 => value += COMMAND::RESPONSE_TYPE::Short48,
        }
        if cmd.has_data() {
            value += COMMAND::DATA_PRESENT::SET;
        }
        self.regs().command.write(value);
    }

    /// DAT inhibit stays set while the card holds DAT0 low after a busy response
    fn card_busy(&mut self) -> bool {
        self.regs().present_state.is_set(PRESENT_STATE::DAT_INHIBIT)
    }

    fn read_response(&mut self) -> u32 {
        self.regs().response[0].get()
    }

    fn set_block_length(&mut self, length: u16) {
        self.block_length = length;
        self.regs()
            .block_size
            .write(BLOCK_SIZE::BLOCK_SIZE.val(length) + BLOCK_SIZE::SDMA_BOUNDARY.val(SDHCI_DEFAULT_BOUNDARY_ARG));
    }

    fn prepare_data(&mut self, direction: Direction, length: u16) {
        self.setup_transfer(direction, length, false);
    }

    fn fifo_read_word(&mut self) -> u32 {
        self.regs().buffer_data.get()
    }

    fn fifo_write_word(&mut self, word: u32) {
        self.regs().buffer_data.set(word);
    }

    fn dma_start(&mut self, desc: &mut TransferDescriptor<'_>) -> Result<(), DmaError> {
        let direction = desc.direction();
        if !self.sdma {
            return Err(DmaError::Unsupported);
        }
        if self.dma_active[direction.index()] {
            return Err(DmaError::ChannelBusy);
        }
        let addr = desc
            .phys_addr()
            .and_then(|a| u32::try_from(a).ok())
            .ok_or(DmaError::Unsupported)?;
        if desc.length() % SDMA_GRANULARITY != 0 {
            return Err(DmaError::Unsupported);
        }

        // Payload stores must reach memory before the engine reads them
        fence(Ordering::SeqCst);
        self.regs().sdma_addr.set(addr);
        self.setup_transfer(direction, desc.length(), true);
        self.dma_active[direction.index()] = true;
        Ok(())
    }

    fn dma_release(&mut self, direction: Direction) {
        if self.dma_active[direction.index()] {
            fence(Ordering::SeqCst);
            self.regs().transfer_mode.modify(TRANSFER_MODE::DMA_ENABLE::CLEAR);
            self.dma_active[direction.index()] = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Register block backed by plain memory
    struct FakeSlot {
        block: Box<SdhciRegisters>,
    }

    impl FakeSlot {
        fn new(capabilities: u32, version: u16) -> Self {
            // SAFETY: every register type is a transparent integer cell
            let block: Box<SdhciRegisters> = Box::new(unsafe { core::mem::zeroed() });
            let slot = Self { block };
            slot.poke32(core::mem::offset_of!(SdhciRegisters, capabilities), capabilities);
            slot.poke16(core::mem::offset_of!(SdhciRegisters, host_version), version);
            slot
        }

        fn base(&self) -> *mut u8 {
            &*self.block as *const SdhciRegisters as *mut u8
        }

        fn poke32(&self, offset: usize, value: u32) {
            unsafe { (self.base().add(offset) as *mut u32).write_volatile(value) }
        }

        fn poke16(&self, offset: usize, value: u16) {
            unsafe { (self.base().add(offset) as *mut u16).write_volatile(value) }
        }

        fn controller(&self) -> SdhciController {
            unsafe { SdhciController::new(self.base() as usize) }.unwrap()
        }
    }

    /// SDHCI 3.0, 200 MHz base clock, SDMA, 3.3V
    const CAPS_V3: u32 = (200 << 8) | (1 << 22) | (1 << 24);

    #[test]
    fn probe_reads_version_and_base_clock() {
        let slot = FakeSlot::new(CAPS_V3, 0x1002);
        let mut ctrl = slot.controller();
        assert!(ctrl.probe());
        assert_eq!(ctrl.version(), SDHCI_SPEC_300);
        assert_eq!(ctrl.base_clock(), 200_000_000);
        assert_eq!(ctrl.capabilities().dma_granularity, Some(SDMA_GRANULARITY));

        let empty = FakeSlot::new(0, 0);
        assert!(!empty.controller().probe());
    }

    #[test]
    fn v2_base_clock_uses_six_bits() {
        let slot = FakeSlot::new((0xC0 | 50) << 8, 0x0001);
        let mut ctrl = slot.controller();
        assert!(ctrl.probe());
        assert_eq!(ctrl.base_clock(), 50_000_000);
        assert_eq!(ctrl.capabilities().dma_granularity, None);
    }

    #[test]
    fn slow_clock_programs_divider_and_gates_card_clock() {
        let slot = FakeSlot::new(CAPS_V3, 0x0002);
        let mut ctrl = slot.controller();
        ctrl.probe();

        ctrl.program_clock(ClockMode::Slow);
        let clock = &slot.block.clock_control;
        assert_eq!(clock.read(CLOCK_CONTROL::FREQ_SELECT), 250);
        assert!(clock.is_set(CLOCK_CONTROL::INTERNAL_CLK_EN));
        assert!(!ctrl.clock_running());

        clock.modify(CLOCK_CONTROL::INTERNAL_CLK_STABLE::SET);
        assert!(ctrl.clock_running());
        assert!(clock.is_set(CLOCK_CONTROL::SD_CLK_EN));

        ctrl.program_clock(ClockMode::Off);
        assert_eq!(clock.get(), 0);
        assert!(!ctrl.clock_running());
    }

    #[test]
    fn command_register_encodes_r5_with_data() {
        let slot = FakeSlot::new(CAPS_V3, 0x0002);
        let mut ctrl = slot.controller();

        let cmd = Command::new(53, 0x1000_0004, ResponseKind::R5, CommandFlags::HAS_DATA);
        ctrl.write_argument(cmd.arg);
        ctrl.write_command(&cmd);

        let command = &slot.block.command;
        assert_eq!(command.read(COMMAND::CMD_INDEX), 53);
        assert!(command.matches_all(COMMAND::RESPONSE_TYPE::Short48));
        assert!(command.is_set(COMMAND::CRC_CHECK));
        assert!(command.is_set(COMMAND::DATA_PRESENT));
        assert_eq!(slot.block.argument.get(), 0x1000_0004);
    }

    #[test]
    fn busy_flag_selects_busy_response_and_tracks_dat_inhibit() {
        let slot = FakeSlot::new(CAPS_V3, 0x0002);
        let mut ctrl = slot.controller();

        let cmd = Command::new(52, 0x8000_0C00, ResponseKind::R5, CommandFlags::BUSY);
        ctrl.write_command(&cmd);
        assert!(slot.block.command.matches_all(COMMAND::RESPONSE_TYPE::Short48Busy));
        assert!(!ctrl.card_busy());

        slot.poke32(core::mem::offset_of!(SdhciRegisters, present_state), 1 << 1);
        assert!(ctrl.card_busy());
    }

    #[test]
    fn status_merges_buffer_enables() {
        let slot = FakeSlot::new(CAPS_V3, 0x0002);
        let mut ctrl = slot.controller();
        slot.block.int_status.set(StatusBits::CMD_COMPLETE.bits() | StatusBits::CMD_CRC.bits());
        slot.poke32(core::mem::offset_of!(SdhciRegisters, present_state), 1 << 11);

        let status = ctrl.read_status();
        assert_eq!(
            status,
            StatusBits::CMD_COMPLETE | StatusBits::CMD_CRC | StatusBits::BUFFER_READ_READY
        );
    }

    #[test]
    fn multi_block_transfer_mode() {
        let slot = FakeSlot::new(CAPS_V3, 0x0002);
        let mut ctrl = slot.controller();
        ctrl.probe();
        ctrl.set_block_length(512);
        ctrl.prepare_data(Direction::ToHost, 2048);

        let mode = &slot.block.transfer_mode;
        assert!(mode.is_set(TRANSFER_MODE::MULTI_BLOCK));
        assert!(mode.is_set(TRANSFER_MODE::DATA_DIRECTION));
        assert!(!mode.is_set(TRANSFER_MODE::DMA_ENABLE));
        assert_eq!(slot.block.block_count.get(), 4);
        assert_eq!(slot.block.block_size.read(BLOCK_SIZE::BLOCK_SIZE), 512);
    }

    #[test]
    fn long_transfer_without_block_length_is_split() {
        let slot = FakeSlot::new(CAPS_V3, 0x0002);
        let mut ctrl = slot.controller();
        ctrl.probe();
        ctrl.prepare_data(Direction::ToHost, 4096);

        assert_eq!(slot.block.block_size.read(BLOCK_SIZE::BLOCK_SIZE), 2048);
        assert_eq!(slot.block.block_count.get(), 2);
        assert!(slot.block.transfer_mode.is_set(TRANSFER_MODE::MULTI_BLOCK));
    }

    #[test]
    fn sdma_requires_low_address_and_granularity() {
        let slot = FakeSlot::new(CAPS_V3, 0x0002);
        let mut ctrl = slot.controller();
        ctrl.probe();
        let mut buf = [0u8; 64];

        let mut high = TransferDescriptor::new(&mut buf, Direction::FromHost)
            .unwrap()
            .with_phys_addr(0x1_0000_0000);
        assert_eq!(ctrl.dma_start(&mut high), Err(DmaError::Unsupported));

        let mut desc = TransferDescriptor::new(&mut buf, Direction::FromHost)
            .unwrap()
            .with_phys_addr(0x8000_0000);
        ctrl.dma_start(&mut desc).unwrap();
        assert_eq!(slot.block.sdma_addr.get(), 0x8000_0000);
        assert!(slot.block.transfer_mode.is_set(TRANSFER_MODE::DMA_ENABLE));
        assert_eq!(ctrl.dma_start(&mut desc), Err(DmaError::ChannelBusy));

        ctrl.dma_release(Direction::FromHost);
        assert!(!slot.block.transfer_mode.is_set(TRANSFER_MODE::DMA_ENABLE));
    }
}
