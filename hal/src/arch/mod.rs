//! # Board-Specific Peripheral Blocks
//!
//! Register-level drivers for the SoC peripherals the HAL traits are
//! implemented on. They only touch hardware through
//! [`RegisterBus`](crate::mmio::RegisterBus), so they build and test on any
//! host.

pub mod bcm2835;

// Future SoCs
// pub mod bcm2711;
