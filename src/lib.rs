//! Dual-bank embedded flash driver for STM32H5-class microcontrollers.
//!
//! The driver covers the three operations the controller exposes to
//! application code: sector erase, programming (quad-words into the main
//! array, half-words into the high-cycle data area) and option-byte
//! configuration of the high-cycle area size. Register access goes through
//! the [`regs::FlashRegs`] capability so the same driver runs against the
//! memory-mapped hardware block or a simulated register file in tests.
#![cfg_attr(not(test), no_std)]

// This must go FIRST so that all the other modules see its macros.
mod fmt;

pub mod flash;
pub mod regs;

#[cfg(test)]
pub(crate) mod sim;

pub use flash::{Bank, Config, Error, Flash, PollStrategy, SpinForever};
