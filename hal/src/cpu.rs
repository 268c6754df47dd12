//! # CPU Barrier and Cache Contract
//!
//! The only CPU services the drivers depend on: ordering barriers around
//! buffers handed to another bus master, data-cache maintenance by
//! address range, and masking IRQs around state shared with a handler.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        /// Data cache line size of the ARM1176 / Cortex-A7 L1
        pub const CACHE_LINE_SIZE: usize = 32;
    } else {
        /// Data cache line size of the Cortex-A53 L1
        pub const CACHE_LINE_SIZE: usize = 64;
    }
}

/// Barrier and cache maintenance operations
pub trait CacheMaintenance {
    /// Data synchronization barrier: all memory accesses complete
    fn data_sync_barrier(&self);

    /// Data memory barrier: accesses are observed in program order
    fn data_memory_barrier(&self);

    /// Instruction synchronization barrier: flush the pipeline
    fn instruction_sync_barrier(&self);

    /// Write back dirty lines covering `[addr, addr + len)`
    fn clean_dcache_range(&self, addr: usize, len: usize);

    /// Discard lines covering `[addr, addr + len)`
    fn invalidate_dcache_range(&self, addr: usize, len: usize);
}

/// Cache-line aligned span covering `[addr, addr + len)`
pub fn cache_lines(addr: usize, len: usize) -> impl Iterator<Item = usize> {
    let start = addr & !(CACHE_LINE_SIZE - 1);
    let end = addr.saturating_add(len);
    (start..end).step_by(CACHE_LINE_SIZE)
}

/// Barriers of the CPU the code is running on
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmCpu;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        impl CacheMaintenance for ArmCpu {
            #[inline]
            fn data_sync_barrier(&self) {
                // SAFETY: barrier instructions have no side effects besides ordering
                unsafe { core::arch::asm!("dsb sy", options(nostack, preserves_flags)) };
            }

            #[inline]
            fn data_memory_barrier(&self) {
                // SAFETY: see above
                unsafe { core::arch::asm!("dmb sy", options(nostack, preserves_flags)) };
            }

            #[inline]
            fn instruction_sync_barrier(&self) {
                // SAFETY: see above
                unsafe { core::arch::asm!("isb", options(nostack, preserves_flags)) };
            }

            fn clean_dcache_range(&self, addr: usize, len: usize) {
                for line in cache_lines(addr, len) {
                    // SAFETY: cache maintenance by VA does not change memory contents
                    unsafe { core::arch::asm!("dc cvac, {}", in(reg) line, options(nostack)) };
                }
                self.data_sync_barrier();
            }

            fn invalidate_dcache_range(&self, addr: usize, len: usize) {
                for line in cache_lines(addr, len) {
                    // SAFETY: the caller owns the range and expects device-written data
                    unsafe { core::arch::asm!("dc ivac, {}", in(reg) line, options(nostack)) };
                }
                self.data_sync_barrier();
            }
        }
    } else if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        // CP15 c7 operations exist on both ARMv6 and ARMv7
        impl CacheMaintenance for ArmCpu {
            #[inline]
            fn data_sync_barrier(&self) {
                // SAFETY: barrier operation has no side effects besides ordering
                unsafe {
                    core::arch::asm!("mcr p15, 0, {0}, c7, c10, 4", in(reg) 0u32, options(nostack, preserves_flags))
                };
            }

            #[inline]
            fn data_memory_barrier(&self) {
                // SAFETY: see above
                unsafe {
                    core::arch::asm!("mcr p15, 0, {0}, c7, c10, 5", in(reg) 0u32, options(nostack, preserves_flags))
                };
            }

            #[inline]
            fn instruction_sync_barrier(&self) {
                // SAFETY: prefetch flush
                unsafe {
                    core::arch::asm!("mcr p15, 0, {0}, c7, c5, 4", in(reg) 0u32, options(nostack, preserves_flags))
                };
            }

            fn clean_dcache_range(&self, addr: usize, len: usize) {
                for line in cache_lines(addr, len) {
                    // SAFETY: clean by MVA does not change memory contents
                    unsafe { core::arch::asm!("mcr p15, 0, {0}, c7, c10, 1", in(reg) line, options(nostack)) };
                }
                self.data_sync_barrier();
            }

            fn invalidate_dcache_range(&self, addr: usize, len: usize) {
                for line in cache_lines(addr, len) {
                    // SAFETY: the caller owns the range and expects device-written data
                    unsafe { core::arch::asm!("mcr p15, 0, {0}, c7, c6, 1", in(reg) line, options(nostack)) };
                }
                self.data_sync_barrier();
            }
        }
    } else {
        // Hosted builds: there is no second bus master, ordering is enough
        impl CacheMaintenance for ArmCpu {
            fn data_sync_barrier(&self) {
                core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
            }

            fn data_memory_barrier(&self) {
                core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
            }

            fn instruction_sync_barrier(&self) {
                core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
            }

            fn clean_dcache_range(&self, _addr: usize, _len: usize) {
                self.data_sync_barrier();
            }

            fn invalidate_dcache_range(&self, _addr: usize, _len: usize) {
                self.data_sync_barrier();
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        /// Whether IRQs are unmasked on this core
        #[inline]
        pub fn are_interrupts_enabled() -> bool {
            let daif: u64;
            // SAFETY: reading DAIF has no side effects
            unsafe { core::arch::asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags)) };
            daif & (1 << 7) == 0
        }

        /// Mask IRQs
        ///
        /// # Safety
        /// The caller restores the previous state.
        #[inline]
        pub unsafe fn disable_interrupts() {
            core::arch::asm!("msr daifset, #2", options(nomem, nostack, preserves_flags));
        }

        /// Unmask IRQs
        ///
        /// # Safety
        /// Handlers must be ready to run.
        #[inline]
        pub unsafe fn enable_interrupts() {
            core::arch::asm!("msr daifclr, #2", options(nomem, nostack, preserves_flags));
        }
    } else if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        /// Whether IRQs are unmasked on this core
        #[inline]
        pub fn are_interrupts_enabled() -> bool {
            let cpsr: u32;
            // SAFETY: reading CPSR has no side effects
            unsafe { core::arch::asm!("mrs {}, cpsr", out(reg) cpsr, options(nomem, nostack, preserves_flags)) };
            cpsr & (1 << 7) == 0
        }

        /// Mask IRQs
        ///
        /// # Safety
        /// The caller restores the previous state.
        #[inline]
        pub unsafe fn disable_interrupts() {
            core::arch::asm!("cpsid i", options(nomem, nostack, preserves_flags));
        }

        /// Unmask IRQs
        ///
        /// # Safety
        /// Handlers must be ready to run.
        #[inline]
        pub unsafe fn enable_interrupts() {
            core::arch::asm!("cpsie i", options(nomem, nostack, preserves_flags));
        }
    } else {
        // Hosted builds never take an IRQ
        /// Whether IRQs are unmasked on this core
        pub fn are_interrupts_enabled() -> bool {
            false
        }

        /// Mask IRQs
        ///
        /// # Safety
        /// The caller restores the previous state.
        pub unsafe fn disable_interrupts() {}

        /// Unmask IRQs
        ///
        /// # Safety
        /// Handlers must be ready to run.
        pub unsafe fn enable_interrupts() {}
    }
}

/// Run `f` with IRQs masked, restoring the previous mask afterwards
///
/// Any lock also taken by an interrupt handler must only be held inside
/// this, otherwise the handler can spin on a lock its own core holds.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let were_enabled = are_interrupts_enabled();
    if were_enabled {
        // SAFETY: restored below
        unsafe { disable_interrupts() };
    }

    let result = f();

    if were_enabled {
        // SAFETY: IRQs were unmasked on entry
        unsafe { enable_interrupts() };
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_lines_cover_range() {
        let lines: Vec<usize> = cache_lines(CACHE_LINE_SIZE + 4, CACHE_LINE_SIZE).collect();
        assert_eq!(lines, vec![CACHE_LINE_SIZE, 2 * CACHE_LINE_SIZE]);
    }

    #[test]
    fn test_empty_range() {
        assert_eq!(cache_lines(0x1000, 0).count(), 0);
    }

    #[test]
    fn test_without_interrupts_nests() {
        let value = without_interrupts(|| without_interrupts(|| 7) + 1);
        assert_eq!(value, 8);
        assert!(!are_interrupts_enabled());
    }
}
