//! # Memory-Mapped Register Access
//!
//! Every peripheral block is reached through a [`RegisterBus`]: a 32-bit
//! register file addressed by byte offset from the block base. Drivers are
//! generic over the bus so that tests can substitute a recording mock.

/// 32-bit register file addressed by byte offset
pub trait RegisterBus {
    /// Read the register at `offset`
    fn read32(&self, offset: usize) -> u32;

    /// Write `value` to the register at `offset`
    fn write32(&self, offset: usize, value: u32);

    /// Read-modify-write: set `bits`
    fn set_bits(&self, offset: usize, bits: u32) {
        let value = self.read32(offset);
        self.write32(offset, value | bits);
    }

    /// Read-modify-write: clear `bits`
    fn clear_bits(&self, offset: usize, bits: u32) {
        let value = self.read32(offset);
        self.write32(offset, value & !bits);
    }
}

impl<B: RegisterBus + ?Sized> RegisterBus for &B {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value);
    }
}

/// Volatile access to a physical register block
#[derive(Debug, Clone, Copy)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Create a register block at `base`
    ///
    /// # Safety
    /// `base` must be the address of a mapped device register block that
    /// stays valid for the lifetime of the returned value, and no other code
    /// may assume exclusive access to it.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// Base address of the block
    pub const fn base(&self) -> usize {
        self.base
    }
}

impl RegisterBus for Mmio {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        debug_assert!(offset % 4 == 0);
        // SAFETY: constructor contract guarantees a mapped register block
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        debug_assert!(offset % 4 == 0);
        // SAFETY: constructor contract guarantees a mapped register block
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}
