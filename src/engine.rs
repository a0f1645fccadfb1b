//! Flash and EEPROM programming.
//!
//! All operations take the target address cursor by reference and advance it
//! past the bytes they touched. Busy-waits run to completion in the caller's
//! context.

use core::fmt::Debug;
use core::marker::PhantomData;

use crate::hal::{Eeprom, SelfProgram};
use crate::Error;

pub struct Engine<M, E> {
    mem: M,
    app_end: u16,
    _err: PhantomData<E>,
}

impl<M, E> Engine<M, E>
where
    M: SelfProgram<E> + Eeprom<E>,
    E: Debug,
{
    /// Create an engine that refuses to write at or above `app_end`
    pub fn new(mem: M, app_end: u16) -> Self {
        Self {
            mem,
            app_end,
            _err: PhantomData,
        }
    }

    /// Erase and program the page at `addr`.
    ///
    /// `addr` must be page aligned, `page` is one full page. Pages inside the
    /// bootloader region are refused and leave the cursor untouched.
    pub fn write_page(&mut self, addr: &mut u16, page: &[u8]) -> Result<(), Error<E>> {
        let start = *addr;
        if start >= self.app_end {
            return Err(Error::Protected(start));
        }

        trace!("Erasing page 0x{:04x}", start);
        self.mem.page_erase(start)?;
        block!(self.mem.spm_busy())?;

        for pair in page.chunks(2) {
            let mut word = pair[0] as u16;
            if let Some(hi) = pair.get(1) {
                word |= (*hi as u16) << 8;
            }
            self.mem.page_fill(*addr, word)?;
            *addr = addr.wrapping_add(2);
        }

        trace!("Writing page 0x{:04x}", start);
        self.mem.page_write(start)?;
        block!(self.mem.spm_busy())?;
        self.mem.rww_enable()?;

        Ok(())
    }

    pub fn read_flash(&mut self, addr: &mut u16) -> u8 {
        let v = self.mem.read_byte(*addr);
        *addr = addr.wrapping_add(1);
        v
    }

    pub fn read_eeprom(&mut self, addr: &mut u16) -> Result<u8, Error<E>> {
        let v = self.mem.read(*addr)?;
        *addr = addr.wrapping_add(1);
        Ok(v)
    }

    pub fn write_eeprom(&mut self, addr: &mut u16, value: u8) -> Result<(), Error<E>> {
        let a = *addr;
        *addr = addr.wrapping_add(1);

        self.mem.write(a, value)?;
        block!(self.mem.eeprom_busy())?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ATMEGA88;
    use crate::sim::{Chip, Fault, Handle, SimMemory};

    const PAGE: usize = 64;
    const APP_END: u16 = 0x1C00;

    fn engine() -> (Handle, Engine<SimMemory, Fault>) {
        let chip = Chip::new(&ATMEGA88).shared();
        let e = Engine::new(SimMemory::new(chip.clone()), APP_END);
        (chip, e)
    }

    #[test]
    fn page_write_programs_flash() {
        let (chip, mut e) = engine();
        let page: Vec<u8> = (0..PAGE as u8).collect();

        let mut addr = 0x0040;
        e.write_page(&mut addr, &page).unwrap();

        assert_eq!(addr, 0x0040 + PAGE as u16);
        assert_eq!(&chip.borrow().flash[0x40..0x40 + PAGE], &page[..]);
        assert!(chip.borrow().rww_enabled);
    }

    #[test]
    fn page_write_erases_first() {
        let (chip, mut e) = engine();
        chip.borrow_mut().flash[0x80..0xC0]
            .iter_mut()
            .for_each(|b| *b = 0x00);

        let mut addr = 0x0080;
        e.write_page(&mut addr, &[0x5A; PAGE]).unwrap();

        let c = chip.borrow();
        assert!(c.flash[0x80..0xC0].iter().all(|b| *b == 0x5A));
        assert_eq!(c.erased, vec![0x0080]);
    }

    #[test]
    fn protected_region_is_refused() {
        let (chip, mut e) = engine();
        let before = chip.borrow().flash.clone();

        let mut addr = APP_END;
        assert_eq!(
            e.write_page(&mut addr, &[0u8; PAGE]),
            Err(Error::Protected(APP_END))
        );
        assert_eq!(addr, APP_END);
        assert_eq!(chip.borrow().flash, before);
        assert!(chip.borrow().erased.is_empty());
    }

    #[test]
    fn eeprom_cursor_advances() {
        let (_chip, mut e) = engine();

        let mut addr = 0x10;
        for v in &[1u8, 2, 3] {
            e.write_eeprom(&mut addr, *v).unwrap();
        }
        assert_eq!(addr, 0x13);

        let mut addr = 0x10;
        assert_eq!(e.read_eeprom(&mut addr), Ok(1));
        assert_eq!(e.read_eeprom(&mut addr), Ok(2));
        assert_eq!(e.read_eeprom(&mut addr), Ok(3));
        assert_eq!(addr, 0x13);
    }

    #[test]
    fn missing_eeprom_reads_blank() {
        let mut config = ATMEGA88.clone();
        config.eeprom_size = 0;
        let chip = Chip::new(&config).shared();
        let mut e: Engine<SimMemory, Fault> = Engine::new(SimMemory::new(chip), APP_END);

        let mut addr = 0x20;
        assert_eq!(e.write_eeprom(&mut addr, 0x42), Ok(()));
        let mut addr = 0x20;
        assert_eq!(e.read_eeprom(&mut addr), Ok(0xFF));
        assert_eq!(addr, 0x21);
    }

    #[test]
    fn flash_read_advances() {
        let (chip, mut e) = engine();
        chip.borrow_mut().flash[0x100..0x102].copy_from_slice(&[0xAB, 0xCD]);

        let mut addr = 0x100;
        assert_eq!(e.read_flash(&mut addr), 0xAB);
        assert_eq!(e.read_flash(&mut addr), 0xCD);
        assert_eq!(addr, 0x102);
    }

    #[test]
    fn hardware_faults_propagate() {
        let (chip, mut e) = engine();
        chip.borrow_mut().fault = true;

        let mut addr = 0;
        assert_eq!(e.write_eeprom(&mut addr, 0x42), Err(Error::Hal(Fault)));
        assert_eq!(
            e.write_page(&mut addr, &[0u8; PAGE]),
            Err(Error::Hal(Fault))
        );
    }
}
