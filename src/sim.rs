//! Simulated register file and flash memory for host-side tests.
//!
//! Implements [`FlashRegs`] over plain memory: the key-sequence lock state
//! machines, instant-completion (or optionally stuck) busy behaviour, the
//! hardware-side write-protect refusal, and counters the tests use to
//! assert what the driver touched.

use core::cell::Cell;

use crate::flash::{layout, Bank};
use crate::regs::{self, FlashRegs, Sr};

const EDATA_SPAN: u32 = 2 * layout::EDATA_MAX_SECTORS * layout::EDATA_SECTOR_SIZE;

pub(crate) struct SimRegs {
    sr: Cell<u32>,
    cr: u32,
    optcr: u32,
    pub wrpr: [u32; 2],
    pub hdpr: [u32; 2],
    pub hdpextr: u32,
    edatar_cur: [u32; 2],
    edatar_prg: [u32; 2],
    pub hdpl: u32,
    /// BSY never clears once set.
    pub stuck_busy: bool,
    /// Raise WBNE as soon as the main control register is unlocked.
    pub wbne_after_unlock: bool,

    key_stage: u8,
    opt_key_stage: u8,
    locked: bool,
    opt_locked: bool,

    bank1: Vec<u8>,
    bank2: Vec<u8>,
    edata: Vec<u8>,

    /// Register writes of any kind (keys, control, option programming).
    pub reg_writes: u32,
    pub word_programs: u32,
    pub half_programs: u32,
    pub erases: u32,
    pub opt_programs: u32,
}

impl SimRegs {
    pub fn new() -> Self {
        Self {
            sr: Cell::new(0),
            cr: regs::CR_LOCK,
            optcr: regs::OPTCR_OPTLOCK,
            wrpr: [0xFFFF_FFFF; 2],
            hdpr: [0; 2],
            hdpextr: 0,
            edatar_cur: [0; 2],
            edatar_prg: [0; 2],
            hdpl: regs::HDPL0,
            stuck_busy: false,
            wbne_after_unlock: false,
            key_stage: 0,
            opt_key_stage: 0,
            locked: true,
            opt_locked: true,
            bank1: vec![0xFF; layout::BANK_SIZE as usize],
            bank2: vec![0xFF; layout::BANK_SIZE as usize],
            edata: vec![0xFF; EDATA_SPAN as usize],
            reg_writes: 0,
            word_programs: 0,
            half_programs: 0,
            erases: 0,
            opt_programs: 0,
        }
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn opt_locked(&self) -> bool {
        self.opt_locked
    }

    pub fn edatar_cur_raw(&self, bank: Bank) -> u32 {
        self.edatar_cur[bank_index(bank)]
    }

    /// Provision a high-cycle area configuration directly, as if it had
    /// been programmed in a previous power cycle.
    pub fn set_edata_groups(&mut self, bank: Bank, count: u32) {
        let value = if count > 0 {
            regs::EDATAR_EN | ((count - 1) & regs::EDATAR_STRT_MASK)
        } else {
            0
        };
        self.edatar_cur[bank_index(bank)] = value;
        self.edatar_prg[bank_index(bank)] = value;
    }

    /// Provision a hide-protect window directly.
    pub fn set_hdp_window(&mut self, bank: Bank, start: u32, end: u32, ext: u32) {
        self.hdpr[bank_index(bank)] = (start & regs::HDPR_STRT_MASK) | (end << regs::HDPR_END_POS);
        match bank {
            Bank::Bank1 => {
                self.hdpextr = (self.hdpextr & !regs::HDPEXTR_HDP1_EXT_MASK)
                    | (ext << regs::HDPEXTR_HDP1_EXT_POS);
            }
            Bank::Bank2 => {
                self.hdpextr = (self.hdpextr & !regs::HDPEXTR_HDP2_EXT_MASK)
                    | (ext << regs::HDPEXTR_HDP2_EXT_POS);
            }
        }
    }

    /// Place bytes into the simulated array without going through the
    /// programming interface.
    pub fn fill(&mut self, address: u32, data: &[u8]) {
        let (mem, offset) = self.region_mut(address).expect("address outside simulated memory");
        mem[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn read_mem(&self, address: u32, buf: &mut [u8]) {
        let (mem, offset) = self.region(address).expect("address outside simulated memory");
        buf.copy_from_slice(&mem[offset..offset + buf.len()]);
    }

    fn region(&self, address: u32) -> Option<(&Vec<u8>, usize)> {
        if (layout::BANK1_BASE..layout::BANK2_BASE).contains(&address) {
            Some((&self.bank1, (address - layout::BANK1_BASE) as usize))
        } else if (layout::BANK2_BASE..layout::BANK2_BASE + layout::BANK_SIZE).contains(&address) {
            Some((&self.bank2, (address - layout::BANK2_BASE) as usize))
        } else if (layout::EDATA1_BASE..layout::EDATA1_BASE + EDATA_SPAN).contains(&address) {
            Some((&self.edata, (address - layout::EDATA1_BASE) as usize))
        } else {
            None
        }
    }

    fn region_mut(&mut self, address: u32) -> Option<(&mut Vec<u8>, usize)> {
        if (layout::BANK1_BASE..layout::BANK2_BASE).contains(&address) {
            Some((&mut self.bank1, (address - layout::BANK1_BASE) as usize))
        } else if (layout::BANK2_BASE..layout::BANK2_BASE + layout::BANK_SIZE).contains(&address) {
            Some((&mut self.bank2, (address - layout::BANK2_BASE) as usize))
        } else if (layout::EDATA1_BASE..layout::EDATA1_BASE + EDATA_SPAN).contains(&address) {
            Some((&mut self.edata, (address - layout::EDATA1_BASE) as usize))
        } else {
            None
        }
    }

    fn set_flag(&self, flag: u32) {
        self.sr.set(self.sr.get() | flag);
    }

    /// Hardware-side write-protect refusal for the main array.
    fn wrp_refuses(&self, address: u32) -> bool {
        match layout::flash_bank(address, 1) {
            Some(bank) => {
                let sector = (address - bank.base()) / layout::PAGE_SIZE;
                self.wrpr[bank_index(bank)] & (1 << (sector >> 2)) == 0
            }
            None => false,
        }
    }

    fn do_erase(&mut self) {
        let page = (self.cr & regs::CR_SNB_MASK) >> regs::CR_SNB_POS;
        let bank = if self.cr & regs::CR_BKSEL != 0 {
            Bank::Bank2
        } else {
            Bank::Bank1
        };
        if self.wrpr[bank_index(bank)] & (1 << (page >> 2)) == 0 {
            self.set_flag(regs::SR_WRPERR);
            return;
        }
        let start = (page * layout::PAGE_SIZE) as usize;
        let mem = match bank {
            Bank::Bank1 => &mut self.bank1,
            Bank::Bank2 => &mut self.bank2,
        };
        mem[start..start + layout::PAGE_SIZE as usize].fill(0xFF);
        self.erases += 1;
        self.set_flag(regs::SR_BSY);
    }
}

fn bank_index(bank: Bank) -> usize {
    match bank {
        Bank::Bank1 => 0,
        Bank::Bank2 => 1,
    }
}

impl FlashRegs for SimRegs {
    fn sr(&self) -> Sr {
        let value = self.sr.get();
        // Operations complete instantly unless the controller is stuck.
        if !self.stuck_busy {
            self.sr.set(value & !regs::SR_BSY);
        }
        Sr(value)
    }

    fn cr(&self) -> u32 {
        self.cr
    }

    fn set_cr(&mut self, value: u32) {
        self.reg_writes += 1;
        if self.locked {
            return;
        }
        self.cr = value;
        if value & regs::CR_LOCK != 0 {
            self.locked = true;
            self.key_stage = 0;
        } else if value & regs::CR_START != 0 && value & regs::CR_SER != 0 {
            self.do_erase();
        }
    }

    fn write_keyr(&mut self, key: u32) {
        self.reg_writes += 1;
        if !self.locked {
            return;
        }
        if self.key_stage == 0 && key == regs::FLASH_KEY1 {
            self.key_stage = 1;
        } else if self.key_stage == 1 && key == regs::FLASH_KEY2 {
            self.key_stage = 0;
            self.locked = false;
            self.cr &= !regs::CR_LOCK;
            if self.wbne_after_unlock {
                self.set_flag(regs::SR_WBNE);
            }
        } else {
            self.key_stage = 0;
        }
    }

    fn write_optkeyr(&mut self, key: u32) {
        self.reg_writes += 1;
        if !self.opt_locked {
            return;
        }
        if self.opt_key_stage == 0 && key == regs::FLASH_OPT_KEY1 {
            self.opt_key_stage = 1;
        } else if self.opt_key_stage == 1 && key == regs::FLASH_OPT_KEY2 {
            self.opt_key_stage = 0;
            self.opt_locked = false;
            self.optcr &= !regs::OPTCR_OPTLOCK;
        } else {
            self.opt_key_stage = 0;
        }
    }

    fn optcr(&self) -> u32 {
        self.optcr
    }

    fn set_optcr(&mut self, value: u32) {
        self.reg_writes += 1;
        if self.opt_locked {
            return;
        }
        self.optcr = value;
        if value & regs::OPTCR_OPTSTART != 0 {
            // Option-byte programming transfers the shadow registers.
            self.edatar_cur = self.edatar_prg;
            self.opt_programs += 1;
            self.optcr &= !regs::OPTCR_OPTSTART;
            self.set_flag(regs::SR_BSY);
        }
        if value & regs::OPTCR_OPTLOCK != 0 {
            self.opt_locked = true;
            self.optcr = regs::OPTCR_OPTLOCK;
        }
    }

    fn wrpr_cur(&self, bank: Bank) -> u32 {
        self.wrpr[bank_index(bank)]
    }

    fn hdpr_cur(&self, bank: Bank) -> u32 {
        self.hdpr[bank_index(bank)]
    }

    fn hdpextr(&self) -> u32 {
        self.hdpextr
    }

    fn edatar_cur(&self, bank: Bank) -> u32 {
        self.edatar_cur[bank_index(bank)]
    }

    fn set_edatar_prg(&mut self, bank: Bank, value: u32) {
        self.reg_writes += 1;
        if self.opt_locked {
            return;
        }
        self.edatar_prg[bank_index(bank)] = value;
    }

    fn hdpl(&self) -> u32 {
        self.hdpl
    }

    fn program_word(&mut self, address: u32, value: u32) {
        if self.locked || self.cr & regs::CR_PG == 0 {
            self.set_flag(regs::SR_PGSERR);
            return;
        }
        if self.wrp_refuses(address) {
            self.set_flag(regs::SR_WRPERR);
            return;
        }
        let (mem, offset) = self.region_mut(address).expect("program outside simulated memory");
        mem[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self.word_programs += 1;
        self.set_flag(regs::SR_BSY);
    }

    fn program_halfword(&mut self, address: u32, value: u16) {
        if self.locked || self.cr & regs::CR_PG == 0 {
            self.set_flag(regs::SR_PGSERR);
            return;
        }
        if self.wrp_refuses(address) {
            self.set_flag(regs::SR_WRPERR);
            return;
        }
        let (mem, offset) = self.region_mut(address).expect("program outside simulated memory");
        mem[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        self.half_programs += 1;
        self.set_flag(regs::SR_BSY);
    }

    fn read(&self, address: u32, buf: &mut [u8]) {
        self.read_mem(address, buf);
    }
}
