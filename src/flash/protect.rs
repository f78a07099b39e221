//! Write-protect (WRP) and hide-protect (HDP) checks.
//!
//! Both checks are advisory fast paths: the hardware refuses a protected
//! operation on its own and latches the corresponding error flag, which the
//! engines re-check after every operation. A false negative here is caught
//! there; a false positive would wrongly block a legitimate operation, so
//! the predicates reproduce the hardware behaviour exactly.

use super::Bank;
use crate::regs::{self, FlashRegs};

/// Bitmask covering the 4-sector groups `[start >> 2, end >> 2]`.
///
/// Stays in 64-bit arithmetic so the top group (31) and nonsense inputs
/// (`end < start`) cannot overflow or panic.
pub(crate) fn wrp_group_mask(start_sector: u32, end_sector: u32) -> u32 {
    let start_group = start_sector >> 2;
    let end_group = end_sector >> 2;
    (((2u64 << end_group) - 1) & !((1u64 << start_group) - 1)) as u32
}

/// Whether any part of the sector range is write-protected.
///
/// One bitmap bit per group of 4 sectors, 0 = protected.
pub(crate) fn is_write_protected<R: FlashRegs>(
    regs: &R,
    start_sector: u32,
    end_sector: u32,
    bank: Bank,
) -> bool {
    (!regs.wrpr_cur(bank)) & wrp_group_mask(start_sector, end_sector) != 0
}

/// A hide-protect window as configured in the per-bank registers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HdpWindow {
    pub start: u32,
    pub end: u32,
    pub ext: u32,
}

/// Whether the window protects any part of the sector range at the given
/// privilege level.
pub(crate) fn hdp_applies(
    window: HdpWindow,
    level: u32,
    start_sector: u32,
    end_sector: u32,
) -> bool {
    if level == regs::HDPL0 || level == regs::HDPL1 {
        return false;
    }
    let HdpWindow { start, end, ext } = window;

    // Covers all three intersections: ([)], [(]), [()].
    if end >= start && end_sector >= start && start_sector <= end {
        return true;
    }

    if level != regs::HDPL2 {
        if end >= start && end_sector >= start && start_sector <= end + ext {
            return true;
        }
        // HDP behaves slightly differently when start > end.
        if start > end && end_sector >= end && start <= end + ext {
            return true;
        }
    }

    false
}

/// Whether any part of the sector range is hide-protected.
pub(crate) fn is_hide_protected<R: FlashRegs>(
    regs: &R,
    start_sector: u32,
    end_sector: u32,
    bank: Bank,
) -> bool {
    let hdpr = regs.hdpr_cur(bank);
    let ext = match bank {
        Bank::Bank1 => (regs.hdpextr() & regs::HDPEXTR_HDP1_EXT_MASK) >> regs::HDPEXTR_HDP1_EXT_POS,
        Bank::Bank2 => (regs.hdpextr() & regs::HDPEXTR_HDP2_EXT_MASK) >> regs::HDPEXTR_HDP2_EXT_POS,
    };
    let window = HdpWindow {
        start: hdpr & regs::HDPR_STRT_MASK,
        end: (hdpr & regs::HDPR_END_MASK) >> regs::HDPR_END_POS,
        ext,
    };
    hdp_applies(window, regs.hdpl(), start_sector, end_sector)
}
