//! BCM2835 system timer
//!
//! A free-running 64-bit counter clocked at 1 MHz with four 32-bit compare
//! channels. Channels 0 and 2 belong to the VideoCore; the ARM uses channel
//! 3 for the periodic system tick and channel 1 is left free.

use crate::mmio::RegisterBus;
use crate::timer::Clock;
use crate::{HalError, HalResult};
use bitflags::bitflags;

/// System timer register offsets
pub mod regs {
    /// Control/status: match flags, write 1 to clear
    pub const CS: usize = 0x00;
    /// Counter lower 32 bits
    pub const CLO: usize = 0x04;
    /// Counter upper 32 bits
    pub const CHI: usize = 0x08;
    /// Compare channel `n` (0..=3)
    pub const fn compare(n: usize) -> usize {
        0x0C + n * 4
    }
}

/// Counter rate
pub const TIMER_CLOCK_HZ: u32 = 1_000_000;

/// Counter preload, so that the low word wraps 30 s after boot
const WRAP_TEST_PRELOAD: u32 = (30 * TIMER_CLOCK_HZ).wrapping_neg();

bitflags! {
    /// Compare match flags in the CS register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MatchFlags: u32 {
        /// Channel 0 matched
        const M0 = 1 << 0;
        /// Channel 1 matched
        const M1 = 1 << 1;
        /// Channel 2 matched
        const M2 = 1 << 2;
        /// Channel 3 matched
        const M3 = 1 << 3;
    }
}

/// Compare channel used for the periodic tick
const TICK_CHANNEL: usize = 3;

/// The system timer block
#[derive(Debug)]
pub struct SystemTimer<B> {
    bus: B,
    interval: u32,
}

impl<B: RegisterBus> SystemTimer<B> {
    /// Wrap the register block; the periodic tick is not armed yet
    pub const fn new(bus: B) -> Self {
        Self { bus, interval: 0 }
    }

    /// Arm compare channel 3 to fire `hz` times per second
    ///
    /// The counter is preloaded so that the 32-bit wrap happens shortly
    /// after boot rather than after 71 minutes.
    pub fn start_periodic(&mut self, hz: u32) -> HalResult<()> {
        if hz == 0 || hz > TIMER_CLOCK_HZ {
            return Err(HalError::InvalidParameter);
        }
        self.interval = TIMER_CLOCK_HZ / hz;
        self.bus.write32(regs::CLO, WRAP_TEST_PRELOAD);
        let first = self.bus.read32(regs::CLO).wrapping_add(self.interval);
        self.bus.write32(regs::compare(TICK_CHANNEL), first);
        log::info!("systimer: {} Hz tick, interval {} us", hz, self.interval);
        Ok(())
    }

    /// Tick interval in counter ticks, zero before [`Self::start_periodic`]
    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Program the next compare value and acknowledge the match
    ///
    /// If the counter already passed the next deadline (a late or lost
    /// interrupt), the deadline is re-based on the current counter value.
    pub fn acknowledge_tick(&self) {
        let compare = regs::compare(TICK_CHANNEL);
        let mut next = self.bus.read32(compare).wrapping_add(self.interval);
        let now = self.bus.read32(regs::CLO);
        if (next.wrapping_sub(now) as i32) <= 0 {
            next = now.wrapping_add(self.interval);
        }
        self.bus.write32(compare, next);
        self.bus.write32(regs::CS, MatchFlags::M3.bits());
    }

    /// Full 64-bit counter value
    pub fn counter(&self) -> u64 {
        loop {
            let hi = self.bus.read32(regs::CHI);
            let lo = self.bus.read32(regs::CLO);
            if self.bus.read32(regs::CHI) == hi {
                return (u64::from(hi) << 32) | u64::from(lo);
            }
        }
    }
}

impl<B: RegisterBus> Clock for SystemTimer<B> {
    fn now_ticks(&self) -> u32 {
        self.bus.read32(regs::CLO)
    }
}
