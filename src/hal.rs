//! Hardware primitives the bootloader is built on.
//!
//! Register level access is left to the platform crate, these traits only
//! describe what the core needs. Status indicators use the `embedded-hal`
//! digital traits directly.

use embedded_hal::digital::v2::{OutputPin, ToggleableOutputPin};

/// Self programming (SPM) access to flash
pub trait SelfProgram<E> {
    /// Erase the page containing `addr`
    fn page_erase(&mut self, addr: u16) -> Result<(), E>;

    /// Load one little-endian word into the temporary page buffer
    fn page_fill(&mut self, addr: u16, word: u16) -> Result<(), E>;

    /// Write the temporary page buffer to the page containing `addr`
    fn page_write(&mut self, addr: u16) -> Result<(), E>;

    /// Poll for completion of the last erase or write
    fn spm_busy(&mut self) -> nb::Result<(), E>;

    /// Re-enable reads of the read-while-write section
    fn rww_enable(&mut self) -> Result<(), E>;

    /// Read a byte of program memory
    fn read_byte(&mut self, addr: u16) -> u8;
}

/// Byte-wise EEPROM access
pub trait Eeprom<E> {
    fn read(&mut self, addr: u16) -> Result<u8, E>;

    /// Start a write, completion is signalled by `eeprom_busy`
    fn write(&mut self, addr: u16, value: u8) -> Result<(), E>;

    fn eeprom_busy(&mut self) -> nb::Result<(), E>;
}

/// Response to a bus event, written back to the TWI control register
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Reply {
    /// Continue, acknowledge the next byte
    Ack,
    /// Terminate the transaction, do not acknowledge
    Nack,
    /// Load a byte into the data register and continue
    Transmit(u8),
    /// Force a stop condition and re-arm for the next address match
    ResetBus,
}

/// TWI peripheral in slave mode
pub trait TwiSlave {
    /// Set the slave address and enable the peripheral with auto-ACK and interrupts
    fn enable(&mut self, address: u8);

    /// Status register with the prescaler bits masked
    fn status(&mut self) -> u8;

    /// Data register
    fn data(&mut self) -> u8;

    /// Clear the interrupt flag with the given reply
    fn reply(&mut self, reply: Reply);

    /// Disable the peripheral and its interrupt, the address register is kept
    fn disable(&mut self);
}

/// Periodic tick timer
pub trait Ticker {
    /// Start counting from `reload` with the overflow interrupt enabled
    fn start(&mut self, reload: u8);

    /// Restart the current period, called from the overflow interrupt
    fn restart(&mut self);

    /// Stop the timer and disable its interrupt
    fn stop(&mut self);
}

/// Interrupt vector table selection
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum VectorTable {
    Application,
    Bootloader,
}

/// Core level control of the microcontroller
pub trait Platform {
    /// Stop the watchdog, which stays enabled across a watchdog reset
    fn disable_watchdog(&mut self);

    fn select_vectors(&mut self, table: VectorTable);

    /// Global interrupt enable
    fn set_interrupts(&mut self, enabled: bool);

    /// Transfer control to `addr` as if the chip had reset there
    fn jump(&mut self, addr: u16) -> !;
}

/// Heartbeat and bus activity indicators
pub struct Indicators<L> {
    heartbeat: L,
    activity: L,
}

impl<L> Indicators<L>
where
    L: OutputPin + ToggleableOutputPin,
{
    pub fn new(heartbeat: L, activity: L) -> Self {
        Self {
            heartbeat,
            activity,
        }
    }

    pub fn heartbeat_on(&mut self) {
        if self.heartbeat.set_high().is_err() {
            warn!("Failed to set heartbeat indicator");
        }
    }

    pub fn toggle_heartbeat(&mut self) {
        if self.heartbeat.toggle().is_err() {
            warn!("Failed to toggle heartbeat indicator");
        }
    }

    #[cfg_attr(not(feature = "activity-led"), allow(unused_variables))]
    pub fn activity(&mut self, on: bool) {
        #[cfg(feature = "activity-led")]
        {
            let r = if on {
                self.activity.set_high()
            } else {
                self.activity.set_low()
            };
            if r.is_err() {
                warn!("Failed to set activity indicator");
            }
        }
    }

    /// Turn everything off
    pub fn clear(&mut self) {
        let heartbeat = self.heartbeat.set_low().is_ok();
        let activity = self.activity.set_low().is_ok();
        if !(heartbeat && activity) {
            warn!("Failed to clear indicators");
        }
    }
}
