//! IOREC input ring buffers
//!
//! Single producer (the receive interrupt) and single consumer (the BIOS
//! poller). The producer only moves `tail` and the consumer only moves
//! `head`, so neither side needs a lock. One slot always stays free so that
//! `head == tail` means empty.

use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Fixed-size byte ring with flow-control watermarks
pub struct Iorec<const N: usize> {
    buf: [AtomicU8; N],
    head: AtomicUsize,
    tail: AtomicUsize,
    low: usize,
    high: usize,
}

/// Keyboard input buffer
pub type KeyboardIorec = Iorec<0x100>;
/// MIDI input buffer
pub type MidiIorec = Iorec<0x80>;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicU8 = AtomicU8::new(0);

impl<const N: usize> Iorec<N> {
    /// Empty ring with the given low and high watermarks
    pub const fn new(low: usize, high: usize) -> Self {
        Self {
            buf: [EMPTY_SLOT; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            low,
            high,
        }
    }

    /// Append a byte; returns `false` and drops it when the ring is full
    ///
    /// Producer side only.
    pub fn push(&self, byte: u8) -> bool {
        let tail = (self.tail.load(Ordering::Relaxed) + 1) % N;
        if tail == self.head.load(Ordering::Acquire) {
            return false;
        }
        self.buf[tail].store(byte, Ordering::Relaxed);
        self.tail.store(tail, Ordering::Release);
        true
    }

    /// Oldest byte
    ///
    /// Consumer side only.
    pub fn pop(&self) -> Option<u8> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let head = (head + 1) % N;
        let byte = self.buf[head].load(Ordering::Relaxed);
        self.head.store(head, Ordering::Release);
        Some(byte)
    }

    /// Bytes waiting
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + N - head) % N
    }

    /// Nothing waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes the ring can hold
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    /// Fill level reached the high watermark
    pub fn above_high_water(&self) -> bool {
        self.len() >= self.high
    }

    /// Fill level dropped to the low watermark
    pub fn below_low_water(&self) -> bool {
        self.len() <= self.low
    }

    /// Discard everything; consumer side only
    pub fn clear(&self) {
        self.head.store(self.tail.load(Ordering::Acquire), Ordering::Release);
    }
}

impl<const N: usize> fmt::Debug for Iorec<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iorec")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("low", &self.low)
            .field("high", &self.high)
            .finish()
    }
}

impl KeyboardIorec {
    /// Keyboard ring: 256 bytes, watermarks 0x40 / 0xC0
    pub const fn keyboard() -> Self {
        Self::new(0x40, 0xC0)
    }
}

impl MidiIorec {
    /// MIDI ring: 128 bytes, watermarks 0x20 / 0x60
    pub const fn midi() -> Self {
        Self::new(0x20, 0x60)
    }
}
