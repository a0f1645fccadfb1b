//! TWI (I2C) slave bootloader for 8-bit AVR microcontrollers.
//!
//! The bootloader lives in the protected boot section of flash and answers on
//! the TWI bus as a slave device. A bus master can read the version string
//! and chip info, read and write flash and EEPROM, and start the application.
//! If nobody talks to the bootloader within the boot timeout the application
//! is started on its own.
//!
//! The firmware glue keeps a [`Shared`] in a static, calls
//! [`Bootloader::on_bus_interrupt`] and [`Bootloader::on_timer_interrupt`]
//! from the TWI and timer interrupts, spins on [`Shared::wait_for_boot`] in
//! the main loop and finally calls [`Bootloader::handoff`].

#![cfg_attr(not(any(test, feature = "std")), no_std)]

use core::fmt::Debug;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::{OutputPin, ToggleableOutputPin};

use thiserror::Error as TError;

pub mod config;
pub mod engine;
pub mod hal;
pub mod handoff;
pub mod machine;
pub mod protocol;
pub mod sequencer;
pub mod state;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use config::{Config, ConfigError};
pub use engine::Engine;
pub use hal::{Reply, VectorTable};
pub use machine::{BusEvent, Transaction};
pub use protocol::Command;
pub use sequencer::BootSequencer;
pub use state::Shared;

use hal::{Eeprom, Indicators, Platform, SelfProgram, Ticker, TwiSlave};

#[derive(Clone, PartialEq, Debug, TError)]
pub enum Error<E> {
    #[error("hardware error: {0:?}")]
    Hal(E),

    #[error("page 0x{0:04x} lies in the bootloader section")]
    Protected(u16),
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Hal(e)
    }
}

/// Hardware the bootloader runs on
pub struct Parts<M, T, K, P, L, D> {
    /// Flash and EEPROM
    pub memory: M,
    pub twi: T,
    /// Tick timer for the heartbeat and boot timeout
    pub ticker: K,
    pub platform: P,
    pub heartbeat: L,
    pub activity: L,
    /// Busy-wait delay used before the handoff
    pub delay: D,
}

pub struct Bootloader<'a, M, T, K, P, L, D, E, const PAGE: usize> {
    shared: &'a Shared,
    config: Config,
    engine: Engine<M, E>,
    transaction: Transaction<PAGE>,
    sequencer: BootSequencer,
    twi: T,
    ticker: K,
    platform: P,
    indicators: Indicators<L>,
    delay: D,
}

impl<'a, M, T, K, P, L, D, E, const PAGE: usize> Bootloader<'a, M, T, K, P, L, D, E, PAGE>
where
    M: SelfProgram<E> + Eeprom<E>,
    T: TwiSlave,
    K: Ticker,
    P: Platform,
    L: OutputPin + ToggleableOutputPin,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new bootloader instance, `PAGE` must match the configured page size
    pub fn new(
        shared: &'a Shared,
        config: Config,
        parts: Parts<M, T, K, P, L, D>,
    ) -> Result<Self, ConfigError> {
        config.validate::<PAGE>()?;

        Ok(Self {
            shared,
            engine: Engine::new(parts.memory, config.app_end),
            transaction: Transaction::new(config.version, config.chip_info()),
            sequencer: BootSequencer::new(config.timeout_ticks),
            twi: parts.twi,
            ticker: parts.ticker,
            platform: parts.platform,
            indicators: Indicators::new(parts.heartbeat, parts.activity),
            delay: parts.delay,
            config,
        })
    }

    /// Bring up the peripherals and enable interrupts
    pub fn init(&mut self) {
        // The watchdog survives a reset on newer parts
        self.platform.disable_watchdog();

        self.indicators.heartbeat_on();

        self.platform.select_vectors(VectorTable::Bootloader);

        self.ticker.start(self.config.timer_reload);

        self.twi.enable(self.config.twi_address);

        debug!(
            "Bootloader listening on 0x{:02x}, timeout {} ticks",
            self.config.twi_address, self.config.timeout_ticks
        );

        self.platform.set_interrupts(true);
    }

    /// TWI interrupt handler
    pub fn on_bus_interrupt(&mut self) {
        let status = self.twi.status();
        let data = self.twi.data();
        let event = BusEvent::decode(status, data);

        trace!("TWI status 0x{:02x}: {:?}", status, event);

        match event {
            BusEvent::AddressedWrite | BusEvent::AddressedRead => self.indicators.activity(true),
            BusEvent::Stop => self.indicators.activity(false),
            _ => (),
        }

        let reply = self
            .transaction
            .handle(event, self.shared, &mut self.engine);
        self.twi.reply(reply);
    }

    /// Timer overflow interrupt handler
    pub fn on_timer_interrupt(&mut self) {
        self.ticker.restart();
        self.indicators.toggle_heartbeat();
        self.sequencer.tick(self.shared);
    }

    pub fn shared(&self) -> &'a Shared {
        self.shared
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Engine<M, E> {
        &self.engine
    }

    pub fn transaction(&self) -> &Transaction<PAGE> {
        &self.transaction
    }

    pub fn sequencer(&self) -> &BootSequencer {
        &self.sequencer
    }
}
