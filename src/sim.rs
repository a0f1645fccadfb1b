//! Host-side simulation of a bootloader chip.
//!
//! [`Chip`] models the parts of the microcontroller the bootloader touches:
//! flash with its SPM page buffer, EEPROM, the TWI slave registers, the tick
//! timer, the vector table selection and the indicator pins. Every hardware
//! trait implementation holds a [`Handle`] to the same chip so state can be
//! inspected while the bootloader owns the parts.
//!
//! [`Simulator`] plays the bus master, producing the controller status
//! sequence for each transaction and invoking the interrupt handlers.

use std::any::Any;
use std::cell::RefCell;
use std::convert::Infallible;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::{OutputPin, ToggleableOutputPin};

use crate::config::{Config, ConfigError};
use crate::hal::{Eeprom, Platform, Reply, SelfProgram, Ticker, TwiSlave, VectorTable};
use crate::machine::*;
use crate::state::Shared;
use crate::{Bootloader, Parts};

/// Cycles an erase or page write keeps the SPM unit busy
const SPM_CYCLES: u8 = 3;
/// Cycles an EEPROM write keeps the EEPROM busy
const EEPROM_CYCLES: u8 = 2;

/// Pin index of the heartbeat indicator
pub const HEARTBEAT: usize = 0;
/// Pin index of the bus activity indicator
pub const ACTIVITY: usize = 1;

/// Injected hardware fault
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Fault;

#[derive(Clone, Debug, Default)]
pub struct TwiRegs {
    pub address: u8,
    pub enabled: bool,
    /// TWEA, acknowledge own address and data
    pub ack: bool,
    pub status: u8,
    pub data: u8,
    /// Stop conditions forced by the slave
    pub resets: usize,
}

#[derive(Clone, Debug, Default)]
pub struct TimerRegs {
    pub running: bool,
    pub reload: u8,
    pub restarts: usize,
}

#[derive(Clone, Debug)]
pub struct Chip {
    pub flash: Vec<u8>,
    pub eeprom: Vec<u8>,
    page_size: usize,
    spm_buffer: Vec<u16>,
    spm_cycles: u8,
    eeprom_cycles: u8,
    /// Pages erased, in order
    pub erased: Vec<u16>,
    pub rww_enabled: bool,
    /// Fail every flash and EEPROM operation
    pub fault: bool,

    pub twi: TwiRegs,
    pub timer: TimerRegs,
    pub vectors: VectorTable,
    pub watchdog: bool,
    pub interrupts: bool,
    pub pins: [bool; 2],
    pub toggles: [usize; 2],
    /// Milliseconds spent in busy-wait delays
    pub delayed_ms: u32,
}

pub type Handle = Rc<RefCell<Chip>>;

impl Chip {
    /// Blank chip fresh out of reset, watchdog running
    pub fn new(config: &Config) -> Self {
        Self {
            flash: vec![0xFF; config.flash_size as usize],
            eeprom: vec![0xFF; config.eeprom_size as usize],
            page_size: config.page_size,
            spm_buffer: vec![0xFFFF; config.page_size / 2],
            spm_cycles: 0,
            eeprom_cycles: 0,
            erased: Vec::new(),
            rww_enabled: true,
            fault: false,
            twi: TwiRegs::default(),
            timer: TimerRegs::default(),
            vectors: VectorTable::Application,
            watchdog: true,
            interrupts: false,
            pins: [false; 2],
            toggles: [0; 2],
            delayed_ms: 0,
        }
    }

    pub fn shared(self) -> Handle {
        Rc::new(RefCell::new(self))
    }

    fn page_start(&self, addr: u16) -> usize {
        let a = addr as usize;
        a - a % self.page_size
    }

    fn check(&self) -> Result<(), Fault> {
        if self.fault {
            Err(Fault)
        } else {
            Ok(())
        }
    }
}

/// Flash and EEPROM
pub struct SimMemory(Handle);

impl SimMemory {
    pub fn new(chip: Handle) -> Self {
        Self(chip)
    }
}

impl SelfProgram<Fault> for SimMemory {
    fn page_erase(&mut self, addr: u16) -> Result<(), Fault> {
        let mut c = self.0.borrow_mut();
        c.check()?;

        let start = c.page_start(addr);
        let end = start + c.page_size;
        if let Some(page) = c.flash.get_mut(start..end) {
            page.iter_mut().for_each(|b| *b = 0xFF);
        }
        c.erased.push(start as u16);
        c.rww_enabled = false;
        c.spm_cycles = SPM_CYCLES;
        Ok(())
    }

    fn page_fill(&mut self, addr: u16, word: u16) -> Result<(), Fault> {
        let mut c = self.0.borrow_mut();
        c.check()?;

        let i = (addr as usize % c.page_size) / 2;
        c.spm_buffer[i] = word;
        Ok(())
    }

    fn page_write(&mut self, addr: u16) -> Result<(), Fault> {
        let mut c = self.0.borrow_mut();
        c.check()?;

        let start = c.page_start(addr);
        let blank = vec![0xFFFF; c.page_size / 2];
        let words = std::mem::replace(&mut c.spm_buffer, blank);
        for (i, w) in words.iter().enumerate() {
            let [lo, hi] = w.to_le_bytes();
            // Programming only clears bits
            if let Some(b) = c.flash.get_mut(start + 2 * i) {
                *b &= lo;
            }
            if let Some(b) = c.flash.get_mut(start + 2 * i + 1) {
                *b &= hi;
            }
        }
        c.rww_enabled = false;
        c.spm_cycles = SPM_CYCLES;
        Ok(())
    }

    fn spm_busy(&mut self) -> nb::Result<(), Fault> {
        let mut c = self.0.borrow_mut();
        if c.spm_cycles > 0 {
            c.spm_cycles -= 1;
            return Err(nb::Error::WouldBlock);
        }
        Ok(())
    }

    fn rww_enable(&mut self) -> Result<(), Fault> {
        self.0.borrow_mut().rww_enabled = true;
        Ok(())
    }

    fn read_byte(&mut self, addr: u16) -> u8 {
        let c = self.0.borrow();
        c.flash.get(addr as usize).copied().unwrap_or(0xFF)
    }
}

impl Eeprom<Fault> for SimMemory {
    fn read(&mut self, addr: u16) -> Result<u8, Fault> {
        let c = self.0.borrow();
        c.check()?;

        // Unused address bits are ignored
        match (addr as usize).checked_rem(c.eeprom.len()) {
            Some(i) => Ok(c.eeprom[i]),
            None => Ok(0xFF),
        }
    }

    fn write(&mut self, addr: u16, value: u8) -> Result<(), Fault> {
        let mut c = self.0.borrow_mut();
        c.check()?;

        if let Some(i) = (addr as usize).checked_rem(c.eeprom.len()) {
            c.eeprom[i] = value;
            c.eeprom_cycles = EEPROM_CYCLES;
        }
        Ok(())
    }

    fn eeprom_busy(&mut self) -> nb::Result<(), Fault> {
        let mut c = self.0.borrow_mut();
        if c.eeprom_cycles > 0 {
            c.eeprom_cycles -= 1;
            return Err(nb::Error::WouldBlock);
        }
        Ok(())
    }
}

pub struct SimTwi(Handle);

impl TwiSlave for SimTwi {
    fn enable(&mut self, address: u8) {
        let mut c = self.0.borrow_mut();
        c.twi.address = address;
        c.twi.enabled = true;
        c.twi.ack = true;
    }

    fn status(&mut self) -> u8 {
        self.0.borrow().twi.status
    }

    fn data(&mut self) -> u8 {
        self.0.borrow().twi.data
    }

    fn reply(&mut self, reply: Reply) {
        let mut c = self.0.borrow_mut();
        match reply {
            Reply::Ack => c.twi.ack = true,
            Reply::Nack => c.twi.ack = false,
            Reply::Transmit(b) => {
                c.twi.data = b;
                c.twi.ack = true;
            }
            Reply::ResetBus => {
                c.twi.resets += 1;
                c.twi.ack = true;
            }
        }
    }

    fn disable(&mut self) {
        let mut c = self.0.borrow_mut();
        c.twi.enabled = false;
        c.twi.ack = false;
    }
}

pub struct SimTimer(Handle);

impl Ticker for SimTimer {
    fn start(&mut self, reload: u8) {
        let mut c = self.0.borrow_mut();
        c.timer.reload = reload;
        c.timer.running = true;
    }

    fn restart(&mut self) {
        self.0.borrow_mut().timer.restarts += 1;
    }

    fn stop(&mut self) {
        self.0.borrow_mut().timer.running = false;
    }
}

/// Address the application was entered at
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Jump(pub u16);

pub struct SimPlatform(Handle);

impl Platform for SimPlatform {
    fn disable_watchdog(&mut self) {
        self.0.borrow_mut().watchdog = false;
    }

    fn select_vectors(&mut self, table: VectorTable) {
        self.0.borrow_mut().vectors = table;
    }

    fn set_interrupts(&mut self, enabled: bool) {
        self.0.borrow_mut().interrupts = enabled;
    }

    fn jump(&mut self, addr: u16) -> ! {
        // Unwinds without invoking the panic hook, caught by `Simulator::handoff`
        panic::resume_unwind(Box::new(Jump(addr)))
    }
}

pub struct SimPin {
    chip: Handle,
    index: usize,
}

impl OutputPin for SimPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        self.chip.borrow_mut().pins[self.index] = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.chip.borrow_mut().pins[self.index] = true;
        Ok(())
    }
}

impl ToggleableOutputPin for SimPin {
    type Error = Infallible;

    fn toggle(&mut self) -> Result<(), Infallible> {
        let mut c = self.chip.borrow_mut();
        let level = !c.pins[self.index];
        c.pins[self.index] = level;
        c.toggles[self.index] += 1;
        Ok(())
    }
}

pub struct SimDelay(Handle);

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.0.borrow_mut().delayed_ms += ms;
    }
}

pub type SimLoader<'a, const PAGE: usize> =
    Bootloader<'a, SimMemory, SimTwi, SimTimer, SimPlatform, SimPin, SimDelay, Fault, PAGE>;

/// Outcome of a write transaction
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Transfer {
    /// Bytes acknowledged by the slave
    pub acked: usize,
    /// The slave refused further bytes
    pub terminated: bool,
}

/// Final state of a chip that entered its application
#[derive(Clone, Debug)]
pub struct Handoff {
    pub entry: u16,
    pub chip: Chip,
}

/// A simulated chip running the bootloader, driven by a simulated bus master
pub struct Simulator<'a, const PAGE: usize> {
    loader: SimLoader<'a, PAGE>,
    chip: Handle,
}

impl<'a, const PAGE: usize> Simulator<'a, PAGE> {
    /// Power up a blank chip and run the bootloader startup
    pub fn new(config: &Config, shared: &'a Shared) -> Result<Self, ConfigError> {
        Self::with_chip(config, shared, Chip::new(config))
    }

    /// Power up an existing chip, for example one with an application loaded
    pub fn with_chip(config: &Config, shared: &'a Shared, chip: Chip) -> Result<Self, ConfigError> {
        let chip = chip.shared();
        let parts = Parts {
            memory: SimMemory(chip.clone()),
            twi: SimTwi(chip.clone()),
            ticker: SimTimer(chip.clone()),
            platform: SimPlatform(chip.clone()),
            heartbeat: SimPin {
                chip: chip.clone(),
                index: HEARTBEAT,
            },
            activity: SimPin {
                chip: chip.clone(),
                index: ACTIVITY,
            },
            delay: SimDelay(chip.clone()),
        };

        let mut loader = Bootloader::new(shared, config.clone(), parts)?;
        loader.init();

        Ok(Self { loader, chip })
    }

    pub fn chip(&self) -> std::cell::Ref<'_, Chip> {
        self.chip.borrow()
    }

    pub fn chip_mut(&mut self) -> std::cell::RefMut<'_, Chip> {
        self.chip.borrow_mut()
    }

    pub fn loader(&self) -> &SimLoader<'a, PAGE> {
        &self.loader
    }

    /// Raise a TWI interrupt with the given status, if it is enabled
    fn interrupt(&mut self, status: u8, data: u8) -> bool {
        {
            let mut c = self.chip.borrow_mut();
            if !c.twi.enabled || !c.interrupts {
                return false;
            }
            c.twi.status = status;
            c.twi.data = data;
        }
        self.loader.on_bus_interrupt();
        true
    }

    fn acking(&self) -> bool {
        let c = self.chip.borrow();
        c.twi.enabled && c.twi.ack
    }

    /// SLA+W and data bytes, without the closing condition.
    /// Returns None if the address was not acknowledged.
    fn write_phase(&mut self, bytes: &[u8]) -> Option<Transfer> {
        if !self.acking() || !self.interrupt(TW_SR_SLA_ACK, 0) {
            return None;
        }

        let mut t = Transfer {
            acked: 0,
            terminated: false,
        };
        for b in bytes {
            if !self.acking() {
                // The byte is not acknowledged and the slave leaves the transaction
                self.interrupt(TW_SR_DATA_NACK, *b);
                t.terminated = true;
                return Some(t);
            }
            self.interrupt(TW_SR_DATA_ACK, *b);
            t.acked += 1;
        }
        t.terminated = !self.acking();
        // STOP or repeated START
        self.interrupt(TW_SR_STOP, 0);

        Some(t)
    }

    /// SLA+R and `n` data bytes, the master NACKs the last one
    fn read_phase(&mut self, n: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(n);
        if n == 0 || !self.acking() {
            return data;
        }

        for i in 0..n {
            let status = if i == 0 { TW_ST_SLA_ACK } else { TW_ST_DATA_ACK };
            if !self.interrupt(status, 0) {
                break;
            }
            data.push(self.chip.borrow().twi.data);
        }
        self.interrupt(TW_ST_DATA_NACK, 0);

        data
    }

    /// `START, SLA+W, bytes.., STOP`
    pub fn write(&mut self, bytes: &[u8]) -> Option<Transfer> {
        self.write_phase(bytes)
    }

    /// `START, SLA+R, {n bytes}, STOP`
    pub fn read(&mut self, n: usize) -> Vec<u8> {
        self.read_phase(n)
    }

    /// `START, SLA+W, bytes.., START, SLA+R, {n bytes}, STOP`
    pub fn write_read(&mut self, bytes: &[u8], n: usize) -> Vec<u8> {
        match self.write_phase(bytes) {
            Some(_) => self.read_phase(n),
            None => Vec::new(),
        }
    }

    /// Raise a TWI interrupt with an illegal bus state
    pub fn bus_error(&mut self) {
        self.interrupt(TW_BUS_ERROR, 0);
    }

    /// Deliver `n` timer overflow interrupts
    pub fn tick(&mut self, n: usize) {
        for _ in 0..n {
            {
                let c = self.chip.borrow();
                if !c.timer.running || !c.interrupts {
                    return;
                }
            }
            self.loader.on_timer_interrupt();
        }
    }

    pub fn boot_requested(&self) -> bool {
        self.loader.shared().boot_requested()
    }

    /// Run the handoff once a boot has been requested.
    ///
    /// Returns the simulator unchanged if the main loop would still be waiting.
    pub fn handoff(self) -> Result<Handoff, Self> {
        if !self.boot_requested() {
            return Err(self);
        }

        let Self { loader, chip } = self;
        let r: std::thread::Result<()> =
            panic::catch_unwind(AssertUnwindSafe(move || loader.handoff()));
        let payload: Box<dyn Any + Send> = match r {
            Ok(()) => unreachable!("handoff returned"),
            Err(p) => p,
        };

        match payload.downcast::<Jump>() {
            Ok(j) => {
                let chip = chip.borrow().clone();
                Ok(Handoff { entry: j.0, chip })
            }
            Err(p) => panic::resume_unwind(p),
        }
    }
}
