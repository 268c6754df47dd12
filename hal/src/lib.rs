//! # STOS HAL - Hardware Abstraction Layer
//!
//! This crate defines the traits and register-level building blocks the
//! peripheral drivers are written against.
//!
//! ## Design Philosophy
//!
//! The HAL is designed to be:
//! - **Injectable**: Drivers only see [`mmio::RegisterBus`], [`timer::Clock`]
//!   and [`cpu::CacheMaintenance`], so every driver runs against test doubles
//! - **Minimal**: Only exposes what the drivers need
//! - **Safe**: Encapsulates all volatile and inline-assembly access
//! - **Owned**: No hidden global state; every controller is a value

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod cpu;
pub mod interrupts;
pub mod mmio;
pub mod timer;

// Board-specific peripheral blocks
pub mod arch;

use core::fmt;

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported on this platform
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Operation timed out
    Timeout,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            HalError::NotSupported => "operation not supported",
            HalError::InvalidParameter => "invalid parameter",
            HalError::Timeout => "timed out",
        };
        f.write_str(msg)
    }
}

/// Physical address as seen by the ARM core
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Physical address of a pointer (identity mapped)
    #[inline]
    pub fn of<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Add an offset to the address
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// Translate into the VideoCore bus view through `alias`
    ///
    /// The co-processor only decodes 32 address bits; the alias selects the
    /// cached (0x4000_0000) or uncached (0xC000_0000) window onto SDRAM.
    #[inline]
    pub const fn to_bus(self, alias: u32) -> BusAddr {
        BusAddr((self.0 as u32).wrapping_add(alias))
    }
}

/// Address as seen from the VideoCore side of the SoC
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BusAddr(u32);

impl BusAddr {
    /// Create a bus address from its raw value
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

static_assertions::assert_eq_size!(BusAddr, u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phys_to_bus() {
        let phys = PhysAddr::new(0x0010_0000);
        assert_eq!(phys.to_bus(0xC000_0000).as_u32(), 0xC010_0000);
        assert_eq!(phys.to_bus(0x4000_0000).as_u32(), 0x4010_0000);
    }

    #[test]
    fn test_alignment() {
        assert!(PhysAddr::new(0x1000).is_aligned(16));
        assert!(!PhysAddr::new(0x1004).is_aligned(16));
        assert_eq!(PhysAddr::new(0x1000).add(4).as_u64(), 0x1004);
    }
}
