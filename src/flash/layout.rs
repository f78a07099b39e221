//! Memory layout and address-to-bank resolution.

use super::Bank;
use crate::regs::{FlashRegs, EDATAR_EN, EDATAR_STRT_MASK};

/// Base address of bank 1 of the main array.
pub const BANK1_BASE: u32 = 0x0800_0000;
/// Base address of bank 2, directly after bank 1.
pub const BANK2_BASE: u32 = 0x0810_0000;
/// Erase granularity of the main array.
pub const PAGE_SIZE: u32 = 0x2000;
pub const PAGES_PER_BANK: u32 = 128;
pub const BANK_SIZE: u32 = PAGES_PER_BANK * PAGE_SIZE;
/// Total main array size, both banks.
pub const FLASH_SIZE: u32 = 2 * BANK_SIZE;

/// Base address of the bank 1 high-cycle data window.
pub const EDATA1_BASE: u32 = 0x0900_0000;
/// Base address of the bank 2 high-cycle data window.
pub const EDATA2_BASE: u32 = 0x0900_C000;
/// High-cycle sector-group granularity.
pub const EDATA_SECTOR_SIZE: u32 = 0x1800;
/// At most 8 trailing sector groups per bank can be remapped.
pub const EDATA_MAX_SECTORS: u32 = 8;
/// Offset between high-cycle sector numbers and main-array sector numbers
/// in the protection numbering scheme. Given configuration, not derived.
pub const EDATA_SECTOR_OFFSET: u32 = 120;

/// Resolve a main-array address range to its owning bank.
///
/// Returns `None` when the range straddles the bank boundary or falls
/// outside the array, even if both end points are valid flash addresses.
pub fn flash_bank(address: u32, size: u32) -> Option<Bank> {
    if size == 0 {
        return None;
    }
    let end = address.checked_add(size - 1)?;
    if address >= BANK1_BASE && end < BANK1_BASE + BANK_SIZE {
        Some(Bank::Bank1)
    } else if address >= BANK2_BASE && end < BANK2_BASE + BANK_SIZE {
        Some(Bank::Bank2)
    } else {
        None
    }
}

/// Number of high-cycle sector groups encoded in an `EDATAR` value.
pub fn edata_sector_count(edatar: u32) -> u32 {
    if edatar & EDATAR_EN != 0 {
        1 + (edatar & EDATAR_STRT_MASK)
    } else {
        0
    }
}

/// Resolve a high-cycle address range to its owning bank.
///
/// The window of each bank grows backwards from a fixed end address by the
/// currently configured group count; a count of zero means no window. The
/// configuration registers are read on every call.
pub fn high_cycle_bank<R: FlashRegs>(regs: &R, address: u32, size: u32) -> Option<Bank> {
    if size == 0 {
        return None;
    }
    let end = address.checked_add(size - 1)?;
    for bank in [Bank::Bank1, Bank::Bank2] {
        let sectors = edata_sector_count(regs.edatar_cur(bank));
        if sectors == 0 {
            continue;
        }
        let window_end = bank.edata_base() + EDATA_MAX_SECTORS * EDATA_SECTOR_SIZE - 1;
        let window_start = window_end + 1 - sectors * EDATA_SECTOR_SIZE;
        if address >= window_start && end <= window_end {
            return Some(bank);
        }
    }
    None
}
