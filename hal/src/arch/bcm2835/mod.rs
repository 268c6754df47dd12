//! # BCM2835 Family (BCM2835 / BCM2836 / BCM2837)
//!
//! Peripheral offsets are relative to the ARM-side I/O base, which moves
//! between SoC generations; see [`IoBase`].

pub mod intc;
pub mod systimer;

pub use intc::{Bcm2835Intc, BASIC_LAYOUT, LOCAL_LAYOUT};
pub use systimer::SystemTimer;

/// Peripheral block offsets from the I/O base
pub mod offsets {
    /// System timer
    pub const SYSTIMER: usize = 0x3000;
    /// ARM interrupt controller
    pub const INTC: usize = 0xB200;
    /// VideoCore mailbox
    pub const MAILBOX: usize = 0xB880;
    /// External mass media controller
    pub const EMMC: usize = 0x30_0000;
}

/// Where the peripherals appear in the ARM physical address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoBase {
    /// BCM2835 (Raspberry Pi 1, Zero)
    Bcm2835,
    /// BCM2836 / BCM2837 (Raspberry Pi 2, 3)
    Bcm2836,
}

impl IoBase {
    /// ARM physical address of the peripheral window
    pub const fn address(self) -> usize {
        match self {
            IoBase::Bcm2835 => 0x2000_0000,
            IoBase::Bcm2836 => 0x3F00_0000,
        }
    }

    /// Bus alias under which the VideoCore sees ARM memory
    pub const fn gpu_mem_base(self) -> u32 {
        match self {
            // L2 cached alias
            IoBase::Bcm2835 => 0x4000_0000,
            // Uncached alias
            IoBase::Bcm2836 => 0xC000_0000,
        }
    }

    /// Per-core local peripherals, BCM2836 and later only
    pub const fn local_base(self) -> Option<usize> {
        match self {
            IoBase::Bcm2835 => None,
            IoBase::Bcm2836 => Some(0x4000_0000),
        }
    }

    /// Absolute address of a peripheral block
    pub const fn block(self, offset: usize) -> usize {
        self.address() + offset
    }
}
