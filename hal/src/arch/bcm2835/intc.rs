//! BCM2835 ARM interrupt controller
//!
//! Two 32-line GPU banks and the 8-line ARM "basic" bank. On BCM2836/7 the
//! per-core local controller adds a fourth bank of 12 lines (core 0 only).

use crate::interrupts::{BankLayout, InterruptController, IrqLine};
use crate::mmio::RegisterBus;
use crate::{HalError, HalResult};

/// ARM interrupt controller register offsets
pub mod regs {
    /// IRQ basic pending
    pub const IRQ_BASIC_PENDING: usize = 0x00;
    /// IRQ pending 1 (GPU lines 0..31)
    pub const IRQ_PENDING1: usize = 0x04;
    /// IRQ pending 2 (GPU lines 32..63)
    pub const IRQ_PENDING2: usize = 0x08;
    /// FIQ control
    pub const FIQ_CONTROL: usize = 0x0C;
    /// Enable IRQs 1
    pub const ENABLE_IRQS1: usize = 0x10;
    /// Enable IRQs 2
    pub const ENABLE_IRQS2: usize = 0x14;
    /// Enable basic IRQs
    pub const ENABLE_BASIC_IRQS: usize = 0x18;
    /// Disable IRQs 1
    pub const DISABLE_IRQS1: usize = 0x1C;
    /// Disable IRQs 2
    pub const DISABLE_IRQS2: usize = 0x20;
    /// Disable basic IRQs
    pub const DISABLE_BASIC_IRQS: usize = 0x24;
}

/// Local (per-core) controller register offsets
pub mod local_regs {
    /// Core 0 timers interrupt control
    pub const CORE0_TIMER_IRQCNTL: usize = 0x40;
    /// Core 0 mailboxes interrupt control
    pub const CORE0_MBOX_IRQCNTL: usize = 0x50;
    /// Core 0 IRQ source
    pub const CORE0_IRQ_SOURCE: usize = 0x60;
}

/// Well-known line numbers
pub mod lines {
    use crate::interrupts::IrqLine;

    /// System timer compare 1
    pub const TIMER1: IrqLine = 1;
    /// System timer compare 3
    pub const TIMER3: IrqLine = 3;
    /// USB controller
    pub const USB: IrqLine = 9;
    /// PL011 UART
    pub const UART: IrqLine = 57;
    /// EMMC controller
    pub const ARASANSDIO: IrqLine = 62;
    /// ARM timer (basic bank)
    pub const ARM_TIMER: IrqLine = 64;
    /// First line of the local bank
    pub const LOCAL_BASE: IrqLine = 72;
    /// Local non-secure physical timer
    pub const LOCAL_CNTPNS: IrqLine = LOCAL_BASE + 1;
}

/// GPU banks plus the basic bank
pub const BASIC_LAYOUT: BankLayout = match BankLayout::new(&[32, 32, 8]) {
    Some(layout) => layout,
    None => panic!("invalid bank layout"),
};

/// [`BASIC_LAYOUT`] plus the core-local bank
pub const LOCAL_LAYOUT: BankLayout = match BankLayout::new(&[32, 32, 8, 12]) {
    Some(layout) => layout,
    None => panic!("invalid bank layout"),
};

const PENDING: [usize; 3] = [regs::IRQ_PENDING1, regs::IRQ_PENDING2, regs::IRQ_BASIC_PENDING];
const ENABLE: [usize; 3] = [regs::ENABLE_IRQS1, regs::ENABLE_IRQS2, regs::ENABLE_BASIC_IRQS];
const DISABLE: [usize; 3] = [regs::DISABLE_IRQS1, regs::DISABLE_IRQS2, regs::DISABLE_BASIC_IRQS];

/// Local bank lines that have an enable bit for core 0
const LOCAL_TIMER_LINES: u32 = 4;
const LOCAL_MAILBOX_LINES: u32 = 4;

/// The BCM2835 interrupt controller, optionally with the local bank
#[derive(Debug)]
pub struct Bcm2835Intc<B> {
    bus: B,
    local: Option<B>,
}

impl<B: RegisterBus> Bcm2835Intc<B> {
    /// Controller without the local bank
    pub const fn new(bus: B) -> Self {
        Self { bus, local: None }
    }

    /// Controller including the BCM2836 core-local bank
    pub const fn with_local(bus: B, local: B) -> Self {
        Self {
            bus,
            local: Some(local),
        }
    }

    fn set_local(&self, bit: u32, enable: bool) -> HalResult<()> {
        let local = self.local.as_ref().ok_or(HalError::NotSupported)?;
        let (offset, bit) = if bit < LOCAL_TIMER_LINES {
            (local_regs::CORE0_TIMER_IRQCNTL, bit)
        } else if bit < LOCAL_TIMER_LINES + LOCAL_MAILBOX_LINES {
            (local_regs::CORE0_MBOX_IRQCNTL, bit - LOCAL_TIMER_LINES)
        } else {
            // GPU, PMU, AXI and local timer sources are routed elsewhere
            return Err(HalError::NotSupported);
        };
        if enable {
            local.set_bits(offset, 1 << bit);
        } else {
            local.clear_bits(offset, 1 << bit);
        }
        Ok(())
    }
}

impl<B: RegisterBus> InterruptController for Bcm2835Intc<B> {
    fn layout(&self) -> BankLayout {
        if self.local.is_some() {
            LOCAL_LAYOUT
        } else {
            BASIC_LAYOUT
        }
    }

    fn init(&self) {
        self.bus.write32(regs::FIQ_CONTROL, 0);
        for offset in DISABLE {
            self.bus.write32(offset, u32::MAX);
        }
        if let Some(local) = &self.local {
            local.write32(local_regs::CORE0_TIMER_IRQCNTL, 0);
            local.write32(local_regs::CORE0_MBOX_IRQCNTL, 0);
        }
        log::info!("intc: all lines masked ({} lines)", self.layout().line_count());
    }

    fn pending(&self, bank: usize) -> u32 {
        match bank {
            0..=2 => self.bus.read32(PENDING[bank]),
            3 => self
                .local
                .as_ref()
                .map_or(0, |local| local.read32(local_regs::CORE0_IRQ_SOURCE)),
            _ => 0,
        }
    }

    fn enable_line(&self, line: IrqLine) -> HalResult<()> {
        match self.layout().locate(line) {
            Some((bank @ 0..=2, bit)) => {
                self.bus.write32(ENABLE[bank], 1 << bit);
                Ok(())
            }
            Some((_, bit)) => self.set_local(bit, true),
            None => Err(HalError::InvalidParameter),
        }
    }

    fn disable_line(&self, line: IrqLine) -> HalResult<()> {
        match self.layout().locate(line) {
            Some((bank @ 0..=2, bit)) => {
                self.bus.write32(DISABLE[bank], 1 << bit);
                Ok(())
            }
            Some((_, bit)) => self.set_local(bit, false),
            None => Err(HalError::InvalidParameter),
        }
    }
}
