//! Flash controller register access.
//!
//! All register traffic goes through the [`FlashRegs`] capability. The
//! memory-mapped implementation is [`Device`]; tests substitute a simulated
//! register file so the driver logic runs on the host.

use core::sync::atomic::{fence, Ordering};

use vcell::VolatileCell;

use crate::flash::Bank;

/// Main control register key sequence.
pub const FLASH_KEY1: u32 = 0x4567_0123;
pub const FLASH_KEY2: u32 = 0xCDEF_89AB;
/// Option-byte control register key sequence.
pub const FLASH_OPT_KEY1: u32 = 0x0819_2A3B;
pub const FLASH_OPT_KEY2: u32 = 0x4C5D_6E7F;

// NSSR bits.
pub const SR_BSY: u32 = 1 << 0;
pub const SR_WBNE: u32 = 1 << 1;
pub const SR_DBNE: u32 = 1 << 3;
pub const SR_EOP: u32 = 1 << 16;
pub const SR_WRPERR: u32 = 1 << 17;
pub const SR_PGSERR: u32 = 1 << 18;
pub const SR_STRBERR: u32 = 1 << 19;
pub const SR_INCERR: u32 = 1 << 20;
pub const SR_OPTCHANGEERR: u32 = 1 << 23;

/// Mutually exclusive error flags checked before and after every operation.
pub const SR_ERROR_FLAGS: u32 = SR_OPTCHANGEERR | SR_INCERR | SR_STRBERR | SR_PGSERR | SR_WRPERR;
/// An operation is still in flight or buffered.
pub const SR_OP_INCOMPLETE: u32 = SR_BSY | SR_DBNE | SR_WBNE;

// NSCR bits.
pub const CR_LOCK: u32 = 1 << 0;
pub const CR_PG: u32 = 1 << 1;
pub const CR_SER: u32 = 1 << 2;
pub const CR_START: u32 = 1 << 5;
pub const CR_SNB_POS: u32 = 6;
pub const CR_SNB_MASK: u32 = 0x7F << CR_SNB_POS;
pub const CR_EOPIE: u32 = 1 << 16;
pub const CR_WRPERRIE: u32 = 1 << 17;
pub const CR_PGSERRIE: u32 = 1 << 18;
pub const CR_STRBERRIE: u32 = 1 << 19;
pub const CR_INCERRIE: u32 = 1 << 20;
pub const CR_OPTCHANGEERRIE: u32 = 1 << 23;
pub const CR_BKSEL: u32 = 1 << 31;

/// Interrupt-enable bits preserved across control register updates.
pub const CR_IRQ_MASK: u32 =
    CR_EOPIE | CR_WRPERRIE | CR_PGSERRIE | CR_STRBERRIE | CR_INCERRIE | CR_OPTCHANGEERRIE;

// OPTCR bits.
pub const OPTCR_OPTLOCK: u32 = 1 << 0;
pub const OPTCR_OPTSTART: u32 = 1 << 1;

// HDPxR fields.
pub const HDPR_STRT_MASK: u32 = 0x7F;
pub const HDPR_END_POS: u32 = 16;
pub const HDPR_END_MASK: u32 = 0x7F << HDPR_END_POS;

// HDPEXTR fields.
pub const HDPEXTR_HDP1_EXT_POS: u32 = 0;
pub const HDPEXTR_HDP1_EXT_MASK: u32 = 0x7F;
pub const HDPEXTR_HDP2_EXT_POS: u32 = 16;
pub const HDPEXTR_HDP2_EXT_MASK: u32 = 0x7F << HDPEXTR_HDP2_EXT_POS;

// EDATAxR fields.
pub const EDATAR_EN: u32 = 1 << 15;
pub const EDATAR_STRT_MASK: u32 = 0x7;

// SBS hide-protect privilege level encodings.
pub const HDPL0: u32 = 0xB4;
pub const HDPL1: u32 = 0x51;
pub const HDPL2: u32 = 0x8A;
pub const HDPL3: u32 = 0x6F;
pub const HDPLSR_HDPL_MASK: u32 = 0xFF;

/// Status register snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sr(pub u32);

impl Sr {
    pub fn bsy(self) -> bool {
        self.0 & SR_BSY != 0
    }

    pub fn wbne(self) -> bool {
        self.0 & SR_WBNE != 0
    }

    pub fn dbne(self) -> bool {
        self.0 & SR_DBNE != 0
    }

    /// Error flags currently latched.
    pub fn errors(self) -> u32 {
        self.0 & SR_ERROR_FLAGS
    }

    /// No latched errors, not busy, no pending write or data buffer.
    pub fn clean(self) -> bool {
        self.0 & (SR_ERROR_FLAGS | SR_OP_INCOMPLETE) == 0
    }
}

/// Capability granting access to the registers and address spaces this
/// driver touches. At most one instance may exist per controller.
pub trait FlashRegs {
    fn sr(&self) -> Sr;
    fn cr(&self) -> u32;
    fn set_cr(&mut self, value: u32);
    fn write_keyr(&mut self, key: u32);
    fn write_optkeyr(&mut self, key: u32);
    fn optcr(&self) -> u32;
    fn set_optcr(&mut self, value: u32);
    /// Live write-protect bitmap, one bit per 4-sector group, 0 = protected.
    fn wrpr_cur(&self, bank: Bank) -> u32;
    /// Live hide-protect window register.
    fn hdpr_cur(&self, bank: Bank) -> u32;
    fn hdpextr(&self) -> u32;
    /// Live high-cycle area configuration.
    fn edatar_cur(&self, bank: Bank) -> u32;
    fn set_edatar_prg(&mut self, bank: Bank, value: u32);
    /// Current hide-protect privilege level (HDPL encoding).
    fn hdpl(&self) -> u32;
    /// Program one word at an address the driver has already validated.
    fn program_word(&mut self, address: u32, value: u32);
    /// Program one half-word at an address the driver has already validated.
    fn program_halfword(&mut self, address: u32, value: u16);
    /// Read back from flash address space.
    fn read(&self, address: u32, buf: &mut [u8]);
}

impl<T: FlashRegs> FlashRegs for &mut T {
    fn sr(&self) -> Sr {
        T::sr(self)
    }
    fn cr(&self) -> u32 {
        T::cr(self)
    }
    fn set_cr(&mut self, value: u32) {
        T::set_cr(self, value)
    }
    fn write_keyr(&mut self, key: u32) {
        T::write_keyr(self, key)
    }
    fn write_optkeyr(&mut self, key: u32) {
        T::write_optkeyr(self, key)
    }
    fn optcr(&self) -> u32 {
        T::optcr(self)
    }
    fn set_optcr(&mut self, value: u32) {
        T::set_optcr(self, value)
    }
    fn wrpr_cur(&self, bank: Bank) -> u32 {
        T::wrpr_cur(self, bank)
    }
    fn hdpr_cur(&self, bank: Bank) -> u32 {
        T::hdpr_cur(self, bank)
    }
    fn hdpextr(&self) -> u32 {
        T::hdpextr(self)
    }
    fn edatar_cur(&self, bank: Bank) -> u32 {
        T::edatar_cur(self, bank)
    }
    fn set_edatar_prg(&mut self, bank: Bank, value: u32) {
        T::set_edatar_prg(self, bank, value)
    }
    fn hdpl(&self) -> u32 {
        T::hdpl(self)
    }
    fn program_word(&mut self, address: u32, value: u32) {
        T::program_word(self, address, value)
    }
    fn program_halfword(&mut self, address: u32, value: u16) {
        T::program_halfword(self, address, value)
    }
    fn read(&self, address: u32, buf: &mut [u8]) {
        T::read(self, address, buf)
    }
}

const FLASH_BASE: usize = 0x4002_2000;
const SBS_HDPLSR: usize = 0x4400_0410;

#[repr(C)]
#[allow(dead_code)]
struct RegisterBlock {
    acr: VolatileCell<u32>,         // 0x000
    nskeyr: VolatileCell<u32>,      // 0x004
    seckeyr: VolatileCell<u32>,     // 0x008
    optkeyr: VolatileCell<u32>,     // 0x00C
    nsobkkeyr: VolatileCell<u32>,   // 0x010
    secobkkeyr: VolatileCell<u32>,  // 0x014
    opsr: VolatileCell<u32>,        // 0x018
    optcr: VolatileCell<u32>,       // 0x01C
    nssr: VolatileCell<u32>,        // 0x020
    secsr: VolatileCell<u32>,       // 0x024
    nscr: VolatileCell<u32>,        // 0x028
    seccr: VolatileCell<u32>,       // 0x02C
    nsccr: VolatileCell<u32>,       // 0x030
    secccr: VolatileCell<u32>,      // 0x034
    _reserved0: [u32; 1],           // 0x038
    privcfgr: VolatileCell<u32>,    // 0x03C
    nsobkcfgr: VolatileCell<u32>,   // 0x040
    secobkcfgr: VolatileCell<u32>,  // 0x044
    hdpextr: VolatileCell<u32>,     // 0x048
    _reserved1: [u32; 1],           // 0x04C
    optsr_cur: VolatileCell<u32>,   // 0x050
    optsr_prg: VolatileCell<u32>,   // 0x054
    _reserved2: [u32; 34],          // 0x058
    secwm1r_cur: VolatileCell<u32>, // 0x0E0
    secwm1r_prg: VolatileCell<u32>, // 0x0E4
    wrp1r_cur: VolatileCell<u32>,   // 0x0E8
    wrp1r_prg: VolatileCell<u32>,   // 0x0EC
    edata1r_cur: VolatileCell<u32>, // 0x0F0
    edata1r_prg: VolatileCell<u32>, // 0x0F4
    hdp1r_cur: VolatileCell<u32>,   // 0x0F8
    hdp1r_prg: VolatileCell<u32>,   // 0x0FC
    _reserved3: [u32; 56],          // 0x100
    secwm2r_cur: VolatileCell<u32>, // 0x1E0
    secwm2r_prg: VolatileCell<u32>, // 0x1E4
    wrp2r_cur: VolatileCell<u32>,   // 0x1E8
    wrp2r_prg: VolatileCell<u32>,   // 0x1EC
    edata2r_cur: VolatileCell<u32>, // 0x1F0
    edata2r_prg: VolatileCell<u32>, // 0x1F4
    hdp2r_cur: VolatileCell<u32>,   // 0x1F8
    hdp2r_prg: VolatileCell<u32>,   // 0x1FC
}

/// The memory-mapped flash controller.
pub struct Device {
    _priv: (),
}

impl Device {
    /// Conjure the register capability out of thin air.
    ///
    /// # Safety
    ///
    /// Only one instance may be live, and no other code may touch the flash
    /// controller registers while it exists.
    pub const unsafe fn steal() -> Self {
        Self { _priv: () }
    }

    fn block(&self) -> &'static RegisterBlock {
        unsafe { &*(FLASH_BASE as *const RegisterBlock) }
    }
}

impl FlashRegs for Device {
    fn sr(&self) -> Sr {
        Sr(self.block().nssr.get())
    }

    fn cr(&self) -> u32 {
        self.block().nscr.get()
    }

    fn set_cr(&mut self, value: u32) {
        self.block().nscr.set(value);
    }

    fn write_keyr(&mut self, key: u32) {
        self.block().nskeyr.set(key);
        fence(Ordering::SeqCst);
    }

    fn write_optkeyr(&mut self, key: u32) {
        self.block().optkeyr.set(key);
        fence(Ordering::SeqCst);
    }

    fn optcr(&self) -> u32 {
        self.block().optcr.get()
    }

    fn set_optcr(&mut self, value: u32) {
        self.block().optcr.set(value);
    }

    fn wrpr_cur(&self, bank: Bank) -> u32 {
        match bank {
            Bank::Bank1 => self.block().wrp1r_cur.get(),
            Bank::Bank2 => self.block().wrp2r_cur.get(),
        }
    }

    fn hdpr_cur(&self, bank: Bank) -> u32 {
        match bank {
            Bank::Bank1 => self.block().hdp1r_cur.get(),
            Bank::Bank2 => self.block().hdp2r_cur.get(),
        }
    }

    fn hdpextr(&self) -> u32 {
        self.block().hdpextr.get()
    }

    fn edatar_cur(&self, bank: Bank) -> u32 {
        match bank {
            Bank::Bank1 => self.block().edata1r_cur.get(),
            Bank::Bank2 => self.block().edata2r_cur.get(),
        }
    }

    fn set_edatar_prg(&mut self, bank: Bank, value: u32) {
        match bank {
            Bank::Bank1 => self.block().edata1r_prg.set(value),
            Bank::Bank2 => self.block().edata2r_prg.set(value),
        }
    }

    fn hdpl(&self) -> u32 {
        let level = unsafe { core::ptr::read_volatile(SBS_HDPLSR as *const u32) };
        level & HDPLSR_HDPL_MASK
    }

    fn program_word(&mut self, address: u32, value: u32) {
        unsafe { core::ptr::write_volatile(address as *mut u32, value) };
        fence(Ordering::SeqCst);
    }

    fn program_halfword(&mut self, address: u32, value: u16) {
        unsafe { core::ptr::write_volatile(address as *mut u16, value) };
        fence(Ordering::SeqCst);
    }

    fn read(&self, address: u32, buf: &mut [u8]) {
        let flash_data = unsafe { core::slice::from_raw_parts(address as *const u8, buf.len()) };
        buf.copy_from_slice(flash_data);
    }
}
