//! TWI slave transaction state machine.
//!
//! Each interrupt of the bus controller is decoded into a [`BusEvent`] and fed
//! to [`Transaction::handle`], which returns the [`Reply`] to write back to
//! the controller. Nothing in here touches the bus hardware.

use core::fmt::Debug;

use crate::engine::Engine;
use crate::hal::{Eeprom, Reply, SelfProgram};
use crate::protocol::*;
use crate::state::Shared;
use crate::Error;

/// SLA+W received, ACK returned
pub const TW_SR_SLA_ACK: u8 = 0x60;
/// Data received, ACK returned
pub const TW_SR_DATA_ACK: u8 = 0x80;
/// Data received, NACK returned
pub const TW_SR_DATA_NACK: u8 = 0x88;
/// STOP or repeated START received while addressed
pub const TW_SR_STOP: u8 = 0xA0;
/// SLA+R received, ACK returned
pub const TW_ST_SLA_ACK: u8 = 0xA8;
/// Data transmitted, ACK received
pub const TW_ST_DATA_ACK: u8 = 0xB8;
/// Data transmitted, NACK received
pub const TW_ST_DATA_NACK: u8 = 0xC0;
/// Last data transmitted, ACK received
pub const TW_ST_LAST_DATA: u8 = 0xC8;
/// Illegal START or STOP
pub const TW_BUS_ERROR: u8 = 0x00;

/// Bus condition reported by the controller
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum BusEvent {
    /// Addressed for writing, a new transaction starts
    AddressedWrite,
    /// Byte received from the master
    Received(u8),
    /// Addressed for reading, a new transaction starts and a byte is requested
    AddressedRead,
    /// Next byte requested by the master
    Transmit,
    /// Transaction over, by STOP, repeated START or NACK
    Stop,
    /// Illegal or unknown controller state
    BusError,
}

impl BusEvent {
    /// Decode a status code, `data` is the data register content
    pub fn decode(status: u8, data: u8) -> Self {
        match status & 0xF8 {
            TW_SR_SLA_ACK => BusEvent::AddressedWrite,
            TW_SR_DATA_ACK => BusEvent::Received(data),
            TW_ST_SLA_ACK => BusEvent::AddressedRead,
            TW_ST_DATA_ACK => BusEvent::Transmit,
            TW_SR_STOP | TW_SR_DATA_NACK | TW_ST_DATA_NACK | TW_ST_LAST_DATA => BusEvent::Stop,
            _ => BusEvent::BusError,
        }
    }
}

/// Outcome of a received byte
#[derive(Copy, Clone, PartialEq, Debug)]
enum Step {
    /// Byte consumed, advance to the next position
    Next,
    /// Byte consumed, the next byte is a command again
    Stay,
    /// Terminate the transaction
    End,
}

/// Per-transaction protocol state
pub struct Transaction<const PAGE: usize> {
    position: u16,
    addr: u16,
    buf: [u8; PAGE],
    version: [u8; VERSION_LEN],
    chip_info: [u8; CHIPINFO_LEN],
}

impl<const PAGE: usize> Transaction<PAGE> {
    pub fn new(version: [u8; VERSION_LEN], chip_info: [u8; CHIPINFO_LEN]) -> Self {
        Self {
            position: 0,
            addr: 0,
            buf: [0xFF; PAGE],
            version,
            chip_info,
        }
    }

    /// Byte position within the current transaction
    pub fn position(&self) -> u16 {
        self.position
    }

    /// Target address register
    pub fn address(&self) -> u16 {
        self.addr
    }

    /// Handle one bus event
    pub fn handle<M, E>(
        &mut self,
        event: BusEvent,
        shared: &Shared,
        engine: &mut Engine<M, E>,
    ) -> Reply
    where
        M: SelfProgram<E> + Eeprom<E>,
        E: Debug,
    {
        match event {
            BusEvent::AddressedWrite => {
                self.position = 0;
                Reply::Ack
            }
            BusEvent::Received(data) => match self.receive(data, shared, engine) {
                Step::Next => {
                    self.position = self.position.saturating_add(1);
                    Reply::Ack
                }
                Step::Stay => Reply::Ack,
                Step::End => {
                    self.position = 0;
                    Reply::Nack
                }
            },
            BusEvent::AddressedRead => {
                self.position = 0;
                Reply::Transmit(self.transmit(shared, engine))
            }
            BusEvent::Transmit => Reply::Transmit(self.transmit(shared, engine)),
            BusEvent::Stop => Reply::Ack,
            BusEvent::BusError => {
                warn!("TWI bus error, releasing bus");
                Reply::ResetBus
            }
        }
    }

    /// Write phase
    fn receive<M, E>(&mut self, data: u8, shared: &Shared, engine: &mut Engine<M, E>) -> Step
    where
        M: SelfProgram<E> + Eeprom<E>,
        E: Debug,
    {
        match self.position {
            0 => self.select(data, shared),
            1 => self.parameter(data, shared),
            2 | 3 => {
                self.addr = (self.addr << 8) | data as u16;
                Step::Next
            }
            _ => self.payload(data, shared, engine),
        }
    }

    fn select(&mut self, data: u8, shared: &Shared) -> Step {
        // Any byte addressed to us stops the boot timeout
        shared.disarm();

        match data {
            CMD_SWITCH_APPLICATION => {
                shared.set_command(Command::Version);
                Step::Next
            }
            CMD_ACCESS_MEMORY => {
                shared.set_command(Command::Memory);
                Step::Next
            }
            CMD_WAIT => {
                shared.set_command(Command::Wait);
                Step::Stay
            }
            _ => {
                debug!("Unknown command 0x{:02x}, starting application", data);
                shared.request_boot();
                Step::End
            }
        }
    }

    fn parameter(&mut self, data: u8, shared: &Shared) -> Step {
        match shared.command() {
            Command::Version => {
                if data == BOOTTYPE_APPLICATION {
                    debug!("Application boot requested");
                    shared.request_boot();
                }
                Step::End
            }
            Command::Memory => match Command::memory(data) {
                Some(c) => {
                    shared.set_command(c);
                    Step::Next
                }
                None => {
                    debug!("Unknown memory type 0x{:02x}", data);
                    Step::End
                }
            },
            _ => Step::End,
        }
    }

    fn payload<M, E>(&mut self, data: u8, shared: &Shared, engine: &mut Engine<M, E>) -> Step
    where
        M: SelfProgram<E> + Eeprom<E>,
        E: Debug,
    {
        match shared.command() {
            Command::Flash => {
                let offset = (self.position - 4) as usize;
                self.buf[offset] = data;
                if offset + 1 < PAGE {
                    return Step::Next;
                }

                match engine.write_page(&mut self.addr, &self.buf) {
                    Ok(()) => (),
                    Err(Error::Protected(a)) => {
                        warn!("Refusing to write bootloader page 0x{:04x}", a)
                    }
                    Err(e) => error!("Page write failed: {:?}", e),
                }
                Step::End
            }
            Command::Eeprom => match engine.write_eeprom(&mut self.addr, data) {
                Ok(()) => Step::Next,
                Err(e) => {
                    error!("EEPROM write failed: {:?}", e);
                    Step::End
                }
            },
            _ => Step::End,
        }
    }

    /// Read phase
    fn transmit<M, E>(&mut self, shared: &Shared, engine: &mut Engine<M, E>) -> u8
    where
        M: SelfProgram<E> + Eeprom<E>,
        E: Debug,
    {
        match shared.command() {
            Command::Version => self.cycle(VERSION_LEN, |t, i| t.version[i]),
            Command::ChipInfo => self.cycle(CHIPINFO_LEN, |t, i| t.chip_info[i]),
            Command::Flash => engine.read_flash(&mut self.addr),
            Command::Eeprom => match engine.read_eeprom(&mut self.addr) {
                Ok(v) => v,
                Err(e) => {
                    error!("EEPROM read failed: {:?}", e);
                    NO_DATA
                }
            },
            _ => NO_DATA,
        }
    }

    /// Read a fixed record, wrapping at its end
    fn cycle(&mut self, len: usize, f: impl Fn(&Self, usize) -> u8) -> u8 {
        let i = self.position as usize % len;
        self.position = ((i + 1) % len) as u16;
        f(self, i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ATMEGA88;
    use crate::sim::{Chip, Fault, SimMemory};

    const PAGE: usize = 64;

    struct Fixture {
        shared: Shared,
        chip: crate::sim::Handle,
        engine: Engine<SimMemory, Fault>,
        t: Transaction<PAGE>,
    }

    impl Fixture {
        fn new() -> Self {
            let chip = Chip::new(&ATMEGA88).shared();
            Self {
                shared: Shared::new(),
                engine: Engine::new(SimMemory::new(chip.clone()), ATMEGA88.app_end),
                chip,
                t: Transaction::new(ATMEGA88.version, ATMEGA88.chip_info()),
            }
        }

        fn event(&mut self, e: BusEvent) -> Reply {
            self.t.handle(e, &self.shared, &mut self.engine)
        }

        /// Write phase, returns the reply to each byte
        fn write(&mut self, bytes: &[u8]) -> Vec<Reply> {
            assert_eq!(self.event(BusEvent::AddressedWrite), Reply::Ack);
            bytes
                .iter()
                .map(|b| self.event(BusEvent::Received(*b)))
                .collect()
        }

        fn read(&mut self, n: usize) -> Vec<u8> {
            (0..n)
                .map(|i| {
                    let e = if i == 0 {
                        BusEvent::AddressedRead
                    } else {
                        BusEvent::Transmit
                    };
                    match self.event(e) {
                        Reply::Transmit(b) => b,
                        r => panic!("unexpected reply {:?}", r),
                    }
                })
                .collect()
        }
    }

    #[test]
    fn decode_status() {
        assert_eq!(BusEvent::decode(0x60, 0), BusEvent::AddressedWrite);
        assert_eq!(BusEvent::decode(0x80, 0x12), BusEvent::Received(0x12));
        assert_eq!(BusEvent::decode(0x83, 0x12), BusEvent::Received(0x12));
        assert_eq!(BusEvent::decode(0xA8, 0), BusEvent::AddressedRead);
        assert_eq!(BusEvent::decode(0xB8, 0), BusEvent::Transmit);
        assert_eq!(BusEvent::decode(0xA0, 0), BusEvent::Stop);
        assert_eq!(BusEvent::decode(0xC0, 0), BusEvent::Stop);
        assert_eq!(BusEvent::decode(0x88, 0), BusEvent::Stop);
        assert_eq!(BusEvent::decode(0x00, 0), BusEvent::BusError);
        assert_eq!(BusEvent::decode(0xF8, 0), BusEvent::BusError);
    }

    #[test]
    fn unknown_command_boots() {
        for cmd in 0x03..=0xFFu8 {
            let mut f = Fixture::new();
            assert_eq!(f.write(&[cmd]), vec![Reply::Nack]);
            assert!(f.shared.boot_requested());
            assert_eq!(f.t.position(), 0);
        }
    }

    #[test]
    fn switch_application() {
        let mut f = Fixture::new();
        assert_eq!(f.write(&[0x01, 0x80]), vec![Reply::Ack, Reply::Nack]);
        assert!(f.shared.boot_requested());
    }

    #[test]
    fn other_boot_types_do_not_boot() {
        for t in (0x00..=0xFFu8).filter(|t| *t != BOOTTYPE_APPLICATION) {
            let mut f = Fixture::new();
            assert_eq!(f.write(&[0x01, t]), vec![Reply::Ack, Reply::Nack]);
            assert!(!f.shared.boot_requested());
        }
    }

    #[test]
    fn wait_keeps_command_position() {
        let mut f = Fixture::new();
        assert_eq!(
            f.write(&[0x00, 0x00, 0x01, 0x80]),
            vec![Reply::Ack, Reply::Ack, Reply::Ack, Reply::Nack]
        );
        assert!(f.shared.disarmed());
        assert!(f.shared.boot_requested());
    }

    #[test]
    fn version_cycles() {
        let mut f = Fixture::new();
        f.write(&[0x01]);
        assert_eq!(f.event(BusEvent::Stop), Reply::Ack);

        let v = f.read(20);
        assert_eq!(&v[..16], &ATMEGA88.version[..]);
        assert_eq!(&v[16..], &ATMEGA88.version[..4]);
    }

    #[test]
    fn chip_info_cycles() {
        let mut f = Fixture::new();
        f.write(&[0x02, 0x00]);
        let v = f.read(10);
        assert_eq!(&v[..8], &ATMEGA88.chip_info()[..]);
        assert_eq!(&v[8..], &ATMEGA88.chip_info()[..2]);
    }

    #[test]
    fn unknown_memory_type() {
        let mut f = Fixture::new();
        assert_eq!(f.write(&[0x02, 0x07]), vec![Reply::Ack, Reply::Nack]);
        assert_eq!(f.shared.command(), Command::Memory);
        assert_eq!(f.read(2), vec![NO_DATA, NO_DATA]);
    }

    #[test]
    fn address_is_big_endian() {
        let mut f = Fixture::new();
        f.write(&[0x02, 0x01, 0x12, 0x34]);
        assert_eq!(f.t.address(), 0x1234);
    }

    #[test]
    fn flash_page_commits_when_full() {
        let mut f = Fixture::new();
        let page: Vec<u8> = (0..PAGE).map(|i| i as u8 ^ 0xA5).collect();

        let mut bytes = vec![0x02, 0x01, 0x01, 0x00];
        bytes.extend_from_slice(&page);
        let replies = f.write(&bytes);

        assert!(replies[..bytes.len() - 1].iter().all(|r| *r == Reply::Ack));
        assert_eq!(replies[bytes.len() - 1], Reply::Nack);
        assert_eq!(&f.chip.borrow().flash[0x100..0x100 + PAGE], &page[..]);
    }

    #[test]
    fn short_page_is_not_committed() {
        let mut f = Fixture::new();
        let mut bytes = vec![0x02, 0x01, 0x01, 0x00];
        bytes.extend_from_slice(&[0u8; PAGE - 1]);

        assert!(f.write(&bytes).iter().all(|r| *r == Reply::Ack));
        f.event(BusEvent::Stop);
        assert!(f.chip.borrow().erased.is_empty());
        assert!(f.chip.borrow().flash[0x100..0x100 + PAGE].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn protected_page_is_dropped() {
        let mut f = Fixture::new();
        let mut bytes = vec![0x02, 0x01, 0x1C, 0x00];
        bytes.extend_from_slice(&[0u8; PAGE]);

        assert_eq!(f.write(&bytes).last(), Some(&Reply::Nack));
        assert!(f.chip.borrow().erased.is_empty());
    }

    #[test]
    fn flash_read_increments() {
        let mut f = Fixture::new();
        f.chip.borrow_mut().flash[0x200..0x204].copy_from_slice(&[1, 2, 3, 4]);

        f.write(&[0x02, 0x01, 0x02, 0x00]);
        assert_eq!(f.read(4), vec![1, 2, 3, 4]);
        assert_eq!(f.t.address(), 0x204);
    }

    #[cfg(feature = "eeprom")]
    #[test]
    fn eeprom_write_unbounded() {
        let mut f = Fixture::new();
        let data: Vec<u8> = (0..100).collect();

        let mut bytes = vec![0x02, 0x02, 0x00, 0x10];
        bytes.extend_from_slice(&data);
        assert!(f.write(&bytes).iter().all(|r| *r == Reply::Ack));

        assert_eq!(&f.chip.borrow().eeprom[0x10..0x10 + 100], &data[..]);
        assert_eq!(f.t.address(), 0x10 + 100);
    }

    #[cfg(feature = "eeprom")]
    #[test]
    fn eeprom_fault_terminates() {
        let mut f = Fixture::new();
        f.chip.borrow_mut().fault = true;
        assert_eq!(
            f.write(&[0x02, 0x02, 0x00, 0x00, 0x42]),
            vec![Reply::Ack, Reply::Ack, Reply::Ack, Reply::Ack, Reply::Nack]
        );
    }

    #[test]
    fn payload_for_read_only_command() {
        let mut f = Fixture::new();
        assert_eq!(
            f.write(&[0x02, 0x00, 0x00, 0x00, 0x42]),
            vec![Reply::Ack, Reply::Ack, Reply::Ack, Reply::Ack, Reply::Nack]
        );
    }

    #[test]
    fn idle_read_returns_no_data() {
        let mut f = Fixture::new();
        assert_eq!(f.read(3), vec![NO_DATA; 3]);
        assert_eq!(f.t.position(), 0);
    }

    #[test]
    fn bus_error_resets() {
        let mut f = Fixture::new();
        assert_eq!(f.event(BusEvent::BusError), Reply::ResetBus);
    }
}
