//! # Clock and Delay Service
//!
//! Busy-wait delays and timeout-bounded polling built on a free-running
//! counter, plus the software system tick.
//!
//! Nothing here depends on interrupts being enabled, so every helper is
//! usable from interrupt context.

use crate::{HalError, HalResult};
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

/// Free-running hardware counter
pub trait Clock {
    /// Current counter value; wraps around at `u32::MAX`
    fn now_ticks(&self) -> u32;

    /// Counter rate in ticks per microsecond
    fn ticks_per_us(&self) -> u32 {
        1
    }

    /// Spin for at least `us` microseconds
    fn delay_us(&self, us: u32) {
        if us == 0 {
            return;
        }
        // One extra tick: the first one may already be partly elapsed
        let ticks = us.saturating_mul(self.ticks_per_us()).saturating_add(1);
        let start = self.now_ticks();
        while self.now_ticks().wrapping_sub(start) < ticks {
            core::hint::spin_loop();
        }
    }

    /// Spin for at least `ms` milliseconds
    fn delay_ms(&self, ms: u32) {
        for _ in 0..ms {
            self.delay_us(1000);
        }
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ticks(&self) -> u32 {
        (**self).now_ticks()
    }

    fn ticks_per_us(&self) -> u32 {
        (**self).ticks_per_us()
    }

    fn delay_us(&self, us: u32) {
        (**self).delay_us(us);
    }
}

/// Poll `condition` until it holds or `timeout_us` expires
///
/// The condition is sampled 1 µs into every millisecond, `timeout_us / 1000 + 1`
/// times in total, so a condition that is already true succeeds on the first
/// sample and a timeout is reported within one millisecond of expiry.
pub fn wait_for<C, F>(clock: &C, timeout_us: u32, mut condition: F) -> HalResult<()>
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    let mut remaining = timeout_us / 1000;
    loop {
        clock.delay_us(1);
        if condition() {
            return Ok(());
        }
        clock.delay_us(999);
        if remaining == 0 {
            return Err(HalError::Timeout);
        }
        remaining -= 1;
    }
}

/// Default rate of the system tick
pub const TICK_HZ: u32 = 200;

/// Rotating pattern that selects every fourth tick
const SIEVE_PATTERN: u16 = 0x1111;

/// Software system tick
///
/// Counts timer interrupts and derives the 50 Hz sub-tick that drives
/// keyboard auto-repeat and sound sequencing.
#[derive(Debug)]
pub struct SystemTick {
    ticks: AtomicU32,
    sieve: AtomicU16,
}

impl SystemTick {
    /// Create a tick counter at zero
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU32::new(0),
            sieve: AtomicU16::new(SIEVE_PATTERN),
        }
    }

    /// Account one tick; returns true when the 50 Hz work is due
    pub fn tick(&self) -> bool {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let sieve = self.sieve.load(Ordering::Relaxed).rotate_left(1);
        self.sieve.store(sieve, Ordering::Relaxed);
        sieve & 0x4 != 0
    }

    /// Ticks since boot
    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Default for SystemTick {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::Clock;
    use core::cell::Cell;

    /// Virtual clock: delays advance time instantly
    #[derive(Debug, Default)]
    pub struct VirtualClock {
        pub now: Cell<u32>,
    }

    impl Clock for VirtualClock {
        fn now_ticks(&self) -> u32 {
            self.now.get()
        }

        fn delay_us(&self, us: u32) {
            self.now.set(self.now.get().wrapping_add(us));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::VirtualClock;
    use super::*;
    use core::cell::Cell;

    /// Counter that advances by one tick per read
    struct SteppingClock(Cell<u32>);

    impl Clock for SteppingClock {
        fn now_ticks(&self) -> u32 {
            let now = self.0.get();
            self.0.set(now.wrapping_add(1));
            now
        }
    }

    #[test]
    fn test_delay_spins_requested_ticks() {
        let clock = SteppingClock(Cell::new(100));
        clock.delay_us(10);
        // start read + reads until 11 ticks elapsed
        assert_eq!(clock.0.get(), 100 + 1 + 11);
    }

    #[test]
    fn test_delay_across_wrap() {
        let clock = SteppingClock(Cell::new(u32::MAX - 3));
        clock.delay_us(10);
        assert_eq!(clock.0.get(), (u32::MAX - 3).wrapping_add(12));
    }

    #[test]
    fn test_delay_zero_is_noop() {
        let clock = SteppingClock(Cell::new(5));
        clock.delay_us(0);
        assert_eq!(clock.0.get(), 5);
    }

    #[test]
    fn test_wait_for_immediate_success() {
        let clock = VirtualClock::default();
        assert!(wait_for(&clock, 500_000, || true).is_ok());
        assert_eq!(clock.now.get(), 1);
    }

    #[test]
    fn test_wait_for_times_out_within_granularity() {
        let clock = VirtualClock::default();
        let mut samples = 0;
        let result = wait_for(&clock, 10_000, || {
            samples += 1;
            false
        });
        assert_eq!(result, Err(HalError::Timeout));
        assert_eq!(samples, 11);
        assert!(clock.now.get() >= 10_000 && clock.now.get() <= 11_000);
    }

    #[test]
    fn test_wait_for_sub_millisecond_timeout() {
        let clock = VirtualClock::default();
        let mut samples = 0;
        let result = wait_for(&clock, 500, || {
            samples += 1;
            false
        });
        assert!(result.is_err());
        assert_eq!(samples, 1);
    }

    #[test]
    fn test_wait_for_late_success() {
        let clock = VirtualClock::default();
        let mut samples = 0;
        let result = wait_for(&clock, 10_000, || {
            samples += 1;
            samples == 4
        });
        assert!(result.is_ok());
        assert_eq!(clock.now.get(), 3 * 1000 + 1);
    }

    #[test]
    fn test_system_tick_sieve_every_fourth() {
        let tick = SystemTick::new();
        let due: Vec<bool> = (0..8).map(|_| tick.tick()).collect();
        assert_eq!(due, vec![false, true, false, false, false, true, false, false]);
        assert_eq!(tick.ticks(), 8);
    }
}
