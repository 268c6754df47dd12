//! # STOS I/O Subsystem
//!
//! Peripheral drivers of the Raspberry Pi I/O core:
//!
//! - [`mailbox`]: property-tag RPC channel to the VideoCore firmware
//! - [`emmc`]: SD card driver for the Arasan EMMC controller
//! - [`ikbd`]: IKBD packet reassembly and the IOREC input buffers
//!
//! Every driver is an owned value parameterised over the HAL seams
//! ([`RegisterBus`](stos_hal::mmio::RegisterBus),
//! [`Clock`](stos_hal::timer::Clock),
//! [`CacheMaintenance`](stos_hal::cpu::CacheMaintenance)); the board
//! profile decides where each instance lives.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod emmc;
pub mod ikbd;
pub mod mailbox;

#[cfg(test)]
pub(crate) mod testing;
