//! # STOS Raspberry Pi Profile
//!
//! Composes the HAL and I/O subsystem into a board:
//!
//! - [`platform`]: memory map and tunables per board, selected by feature
//! - [`logger`]: `log` backend writing to a byte sink such as the UART
//! - [`board`]: the peripheral singletons, bring-up, the IRQ entry point and
//!   the block-device hooks

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod board;
pub mod logger;
pub mod platform;

pub use board::{init, irq_entry, Board, BoardError};
pub use platform::{Platform, TickConfig};
