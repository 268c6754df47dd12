//! Host-side stand-ins for the HAL seams

use core::cell::{Cell, RefCell};
use stos_hal::cpu::CacheMaintenance;
use stos_hal::timer::Clock;

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

/// Records barrier and cache maintenance calls in order
#[derive(Debug, Default)]
pub struct RecordingCpu {
    pub log: RefCell<Vec<&'static str>>,
}

impl CacheMaintenance for RecordingCpu {
    fn data_sync_barrier(&self) {
        self.log.borrow_mut().push("dsb");
    }

    fn data_memory_barrier(&self) {
        self.log.borrow_mut().push("dmb");
    }

    fn instruction_sync_barrier(&self) {
        self.log.borrow_mut().push("isb");
    }

    fn clean_dcache_range(&self, _addr: usize, _len: usize) {
        self.log.borrow_mut().push("clean");
    }

    fn invalidate_dcache_range(&self, _addr: usize, _len: usize) {
        self.log.borrow_mut().push("invalidate");
    }
}
