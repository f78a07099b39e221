//! Flash memory (FLASH).
//!
//! Driver for the dual-bank embedded flash controller: sector erase,
//! quad-word programming of the main array, half-word programming of the
//! high-cycle data area and option-byte configuration of how much of each
//! bank is remapped into that area.
//!
//! Every operation re-reads protection and area configuration from the
//! hardware, unlocks the control register it needs and re-locks it before
//! returning, on success and on failure alike.

use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};

use crate::regs::{self, FlashRegs, Sr};

pub mod layout;
mod protect;

/// Read size (always 1).
pub const READ_SIZE: usize = 1;
/// Programming unit of the main array (one quad-word).
pub const WRITE_SIZE: usize = 16;
/// Erase granularity of the main array.
pub const ERASE_SIZE: usize = layout::PAGE_SIZE as usize;

/// Flash bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bank {
    Bank1,
    Bank2,
}

impl Bank {
    /// Bank from its hardware index (1 or 2).
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(Bank::Bank1),
            2 => Some(Bank::Bank2),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Bank::Bank1 => 1,
            Bank::Bank2 => 2,
        }
    }

    /// Base address of this bank in the main array.
    pub fn base(self) -> u32 {
        match self {
            Bank::Bank1 => layout::BANK1_BASE,
            Bank::Bank2 => layout::BANK2_BASE,
        }
    }

    /// Base address of this bank's high-cycle data window.
    pub fn edata_base(self) -> u32 {
        match self {
            Bank::Bank1 => layout::EDATA1_BASE,
            Bank::Bank2 => layout::EDATA2_BASE,
        }
    }

    fn bksel(self) -> u32 {
        match self {
            Bank::Bank1 => 0,
            Bank::Bank2 => regs::CR_BKSEL,
        }
    }
}

/// Flash error.
///
/// The compatibility entry points collapse all of these into a discarded
/// result; the `blocking_*` entry points surface them.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Address not aligned to the programming unit.
    Unaligned,
    /// Size is not a multiple of the programming unit, or out of range.
    Size,
    /// Range does not lie within a single bank.
    OutOfBounds,
    /// Bank index outside 1..=2.
    Bank,
    /// Page index outside the bank.
    Page,
    /// WRP or HDP covers part of the range.
    Protected,
    /// The controller reported busy, a pending buffer or stale error flags
    /// before the operation started.
    Busy,
    /// The poll strategy gave up while the controller was busy.
    Timeout,
    /// A write buffer was still pending after unlock. Erasing over it would
    /// corrupt the in-flight write; the controller must be reset.
    Fault,
    // Error flags latched by the hardware after an operation.
    WriteProtect,
    Seq,
    Strobe,
    Inconsistency,
    OptChange,
}

impl NorFlashError for Error {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Self::Size | Self::OutOfBounds | Self::Bank | Self::Page => {
                NorFlashErrorKind::OutOfBounds
            }
            Self::Unaligned => NorFlashErrorKind::NotAligned,
            _ => NorFlashErrorKind::Other,
        }
    }
}

/// Driver configuration.
///
/// The protection checks are advisory: with a check disabled the hardware
/// still refuses the operation and the post-operation status check reports
/// it, just without the early short-circuit.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Check the write-protect bitmap before erase and program.
    pub check_wrp: bool,
    /// Check the hide-protect window before erase and program.
    pub check_hdp: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_wrp: true,
            check_hdp: true,
        }
    }
}

/// Busy-wait policy applied while the controller reports BSY.
///
/// The hardware contract is an unbounded wait ([`SpinForever`]); a bounded
/// implementation lets tests observe stuck-busy behaviour as
/// [`Error::Timeout`] instead of hanging.
pub trait PollStrategy {
    /// Called once per busy iteration. Returning an error aborts the wait;
    /// the driver still re-locks the controller.
    fn poll(&mut self) -> Result<(), Error>;
}

impl<T: PollStrategy> PollStrategy for &mut T {
    fn poll(&mut self) -> Result<(), Error> {
        T::poll(self)
    }
}

/// Spin until the hardware clears BSY, without bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpinForever;

impl PollStrategy for SpinForever {
    fn poll(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

fn status_error(sr: Sr) -> Result<(), Error> {
    let err = sr.errors();
    if err == 0 {
        Ok(())
    } else if err & regs::SR_WRPERR != 0 {
        Err(Error::WriteProtect)
    } else if err & regs::SR_PGSERR != 0 {
        Err(Error::Seq)
    } else if err & regs::SR_STRBERR != 0 {
        Err(Error::Strobe)
    } else if err & regs::SR_INCERR != 0 {
        Err(Error::Inconsistency)
    } else {
        Err(Error::OptChange)
    }
}

/// Internal flash memory driver.
///
/// `R` is the register capability, `P` the busy-wait policy. The driver
/// assumes it is the only logical caller touching the controller; invoking
/// it concurrently from several execution contexts requires external
/// mutual exclusion.
pub struct Flash<R: FlashRegs, P: PollStrategy = SpinForever> {
    regs: R,
    poll: P,
    config: Config,
}

impl<R: FlashRegs> Flash<R, SpinForever> {
    /// Create a new flash driver with the unbounded busy-wait policy.
    pub fn new(regs: R, config: Config) -> Self {
        Self {
            regs,
            poll: SpinForever,
            config,
        }
    }
}

impl<R: FlashRegs, P: PollStrategy> Flash<R, P> {
    /// Create a new flash driver with a caller-supplied busy-wait policy.
    pub fn new_with_poll(regs: R, config: Config, poll: P) -> Self {
        Self { regs, poll, config }
    }

    /// Release the register capability.
    pub fn release(self) -> R {
        self.regs
    }

    // --- compatibility entry points: errors are discarded by contract ---

    /// Erase sector `page` of `bank` (1 or 2). Fire and forget; use
    /// [`Self::blocking_erase`] to observe failures.
    pub fn erase(&mut self, bank: u8, page: u8) {
        let _ = self.blocking_erase(bank, page);
    }

    /// Program `data` at `address`, dispatching by address: half-word path
    /// when the address lies in a configured high-cycle window and the
    /// length is even, quad-word path when the length is a multiple of 16.
    /// Any other length is silently dropped.
    pub fn write(&mut self, address: u32, data: &[u8]) {
        if layout::high_cycle_bank(&self.regs, address, 1).is_some() {
            // High-cycle flash is writable by 16 bit.
            if data.len() % 2 == 0 {
                let _ = self.blocking_write_high_cycle(address, data);
            }
        } else {
            // Normal flash is writable by 128 bit.
            if data.len() % 16 == 0 {
                let _ = self.blocking_write_main(address, data);
            }
        }
    }

    /// Configure the high-cycle area sizes, discarding the result.
    pub fn set_high_cycle_area(&mut self, count_bank1: u8, count_bank2: u8) {
        let _ = self.blocking_set_high_cycle_area(count_bank1, count_bank2);
    }

    // --- erase ---

    /// Erase sector `page` of `bank` (1 or 2).
    pub fn blocking_erase(&mut self, bank: u8, page: u8) -> Result<(), Error> {
        let bank = Bank::from_index(bank).ok_or(Error::Bank)?;
        let page = page as u32;
        if page >= layout::PAGES_PER_BANK {
            return Err(Error::Page);
        }
        self.check_protection(page, page, bank)?;
        self.check_idle()?;

        trace!("Erasing bank {} page {}", bank.index(), page);

        self.unlock();
        // A buffered write that has not reached the array yet would be
        // destroyed by the erase. Unrecoverable; the caller must reset the
        // controller.
        let sr = self.regs.sr();
        if sr.wbne() || sr.dbne() {
            self.lock();
            return Err(Error::Fault);
        }

        let res = self.erase_sequence(bank, page);
        self.regs.set_cr(self.regs.cr() & !regs::CR_SER);
        self.lock();
        res?;

        status_error(self.regs.sr())
    }

    fn erase_sequence(&mut self, bank: Bank, page: u32) -> Result<(), Error> {
        let irq = self.regs.cr() & regs::CR_IRQ_MASK;
        self.regs
            .set_cr(irq | (page << regs::CR_SNB_POS) | bank.bksel() | regs::CR_SER);
        self.wait_not_busy()?;
        self.regs.set_cr(self.regs.cr() | regs::CR_START);
        self.wait_not_busy()
    }

    // --- program ---

    /// Program quad-words into the main array. `address` must be 16-byte
    /// aligned and `data.len()` a multiple of 16.
    pub fn blocking_write_main(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        if address % WRITE_SIZE as u32 != 0 {
            return Err(Error::Unaligned);
        }
        if data.len() % WRITE_SIZE != 0 {
            return Err(Error::Size);
        }
        if data.is_empty() {
            return Ok(());
        }
        let bank = layout::flash_bank(address, data.len() as u32).ok_or(Error::OutOfBounds)?;
        let offset = address - bank.base();
        let start_sector = offset / layout::PAGE_SIZE;
        let end_sector = (offset + data.len() as u32 - 1) / layout::PAGE_SIZE;
        self.check_protection(start_sector, end_sector, bank)?;
        self.check_idle()?;

        trace!("Programming {} bytes at 0x{:x}", data.len(), address);

        self.unlock();
        let irq = self.regs.cr() & regs::CR_IRQ_MASK;
        self.regs.set_cr(irq | regs::CR_PG);

        // The controller wants the four words of a quad-word back to back;
        // an interrupt handler in the middle of the sequence could
        // desynchronize it. Prior mask state is restored on every path.
        let res = critical_section::with(|_| -> Result<(), Error> {
            let mut addr = address;
            for quad in data.chunks_exact(WRITE_SIZE) {
                for word in quad.chunks_exact(4) {
                    self.regs
                        .program_word(addr, u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
                    addr += 4;
                }
                self.wait_not_busy()?;
            }
            Ok(())
        });

        let res = res.and_then(|()| self.wait_not_busy());
        self.regs.set_cr(self.regs.cr() & !regs::CR_PG);
        self.lock();
        res?;

        status_error(self.regs.sr())
    }

    /// Program half-words into the high-cycle data area. `address` must be
    /// 2-byte aligned and `data.len()` a multiple of 2.
    pub fn blocking_write_high_cycle(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        if address % 2 != 0 {
            return Err(Error::Unaligned);
        }
        if data.len() % 2 != 0 {
            return Err(Error::Size);
        }
        if data.is_empty() {
            return Ok(());
        }
        let bank =
            layout::high_cycle_bank(&self.regs, address, data.len() as u32).ok_or(Error::OutOfBounds)?;
        let offset = address - bank.edata_base();
        let start_sector = layout::EDATA_SECTOR_OFFSET + offset / layout::EDATA_SECTOR_SIZE;
        let end_sector = layout::EDATA_SECTOR_OFFSET
            + (offset + data.len() as u32 - 1) / layout::EDATA_SECTOR_SIZE;
        self.check_protection(start_sector, end_sector, bank)?;
        self.check_idle()?;

        trace!("Programming {} bytes of high-cycle data at 0x{:x}", data.len(), address);

        self.unlock();
        let irq = self.regs.cr() & regs::CR_IRQ_MASK;
        self.regs.set_cr(irq | regs::CR_PG);

        critical_section::with(|_| {
            let mut addr = address;
            for half in data.chunks_exact(2) {
                self.regs.program_halfword(addr, u16::from_le_bytes([half[0], half[1]]));
                addr += 2;
            }
        });

        let res = self.wait_not_busy();
        self.regs.set_cr(self.regs.cr() & !regs::CR_PG);
        self.lock();
        res?;

        status_error(self.regs.sr())
    }

    // --- high-cycle area configuration ---

    /// Configure how many trailing sector groups of each bank (0..=8) are
    /// remapped into the high-cycle data area. Persisted in option bytes;
    /// a bank whose configuration already matches is left untouched.
    pub fn blocking_set_high_cycle_area(
        &mut self,
        count_bank1: u8,
        count_bank2: u8,
    ) -> Result<(), Error> {
        self.set_high_cycle_bank(Bank::Bank1, count_bank1 as u32)?;
        self.set_high_cycle_bank(Bank::Bank2, count_bank2 as u32)
    }

    fn set_high_cycle_bank(&mut self, bank: Bank, count: u32) -> Result<(), Error> {
        if count > layout::EDATA_MAX_SECTORS {
            return Err(Error::Size);
        }
        let configuration = if count > 0 {
            regs::EDATAR_EN | ((count - 1) & regs::EDATAR_STRT_MASK)
        } else {
            0
        };
        if self.regs.edatar_cur(bank) == configuration {
            return Ok(());
        }
        self.check_idle()?;

        trace!("Setting bank {} high-cycle area to {} groups", bank.index(), count);

        self.unlock_option_bytes();
        self.regs.set_edatar_prg(bank, configuration);
        self.regs.set_optcr(self.regs.optcr() | regs::OPTCR_OPTSTART);
        let res = self.wait_not_busy();
        self.lock_option_bytes();
        res
    }

    // --- read ---

    /// Read from the main array. `offset` is relative to the start of
    /// bank 1, not an absolute address.
    pub fn blocking_read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        if offset as u64 + bytes.len() as u64 > layout::FLASH_SIZE as u64 {
            return Err(Error::Size);
        }
        self.regs.read(layout::BANK1_BASE + offset, bytes);
        Ok(())
    }

    // --- helpers ---

    fn check_protection(&self, start_sector: u32, end_sector: u32, bank: Bank) -> Result<(), Error> {
        if self.config.check_hdp
            && protect::is_hide_protected(&self.regs, start_sector, end_sector, bank)
        {
            return Err(Error::Protected);
        }
        if self.config.check_wrp
            && protect::is_write_protected(&self.regs, start_sector, end_sector, bank)
        {
            return Err(Error::Protected);
        }
        Ok(())
    }

    fn check_idle(&self) -> Result<(), Error> {
        if self.regs.sr().clean() {
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }

    fn wait_not_busy(&mut self) -> Result<(), Error> {
        while self.regs.sr().bsy() {
            self.poll.poll()?;
        }
        Ok(())
    }

    fn unlock(&mut self) {
        self.regs.write_keyr(regs::FLASH_KEY1);
        self.regs.write_keyr(regs::FLASH_KEY2);
    }

    fn lock(&mut self) {
        self.regs.set_cr(regs::CR_LOCK);
    }

    fn unlock_option_bytes(&mut self) {
        self.regs.write_optkeyr(regs::FLASH_OPT_KEY1);
        self.regs.write_optkeyr(regs::FLASH_OPT_KEY2);
    }

    fn lock_option_bytes(&mut self) {
        self.regs.set_optcr(regs::OPTCR_OPTLOCK);
    }
}

impl<R: FlashRegs, P: PollStrategy> embedded_storage::nor_flash::ErrorType for Flash<R, P> {
    type Error = Error;
}

impl<R: FlashRegs, P: PollStrategy> embedded_storage::nor_flash::ReadNorFlash for Flash<R, P> {
    const READ_SIZE: usize = READ_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        self.blocking_read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        layout::FLASH_SIZE as usize
    }
}

impl<R: FlashRegs, P: PollStrategy> embedded_storage::nor_flash::NorFlash for Flash<R, P> {
    const WRITE_SIZE: usize = WRITE_SIZE;
    const ERASE_SIZE: usize = ERASE_SIZE;

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        self.blocking_write_main(layout::BANK1_BASE + offset, bytes)
    }

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Error> {
        if from > to || to > layout::FLASH_SIZE {
            return Err(Error::Size);
        }
        if from % layout::PAGE_SIZE != 0 || to % layout::PAGE_SIZE != 0 {
            return Err(Error::Unaligned);
        }
        let mut address = layout::BANK1_BASE + from;
        let end = layout::BANK1_BASE + to;
        while address < end {
            let bank = layout::flash_bank(address, layout::PAGE_SIZE).ok_or(Error::OutOfBounds)?;
            let page = (address - bank.base()) / layout::PAGE_SIZE;
            self.blocking_erase(bank.index(), page as u8)?;
            address += layout::PAGE_SIZE;
        }
        Ok(())
    }
}
