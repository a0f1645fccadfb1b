//! Transfer of control from the bootloader to the application.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::{OutputPin, ToggleableOutputPin};

use crate::hal::{Eeprom, Platform, SelfProgram, Ticker, TwiSlave, VectorTable};
use crate::Bootloader;

/// Reset vector of the application
pub const APPLICATION_ENTRY: u16 = 0x0000;

/// Settle delay before the jump, in steps of `SETTLE_STEP_MS`
const SETTLE_STEPS: u32 = 10;
const SETTLE_STEP_MS: u32 = 10;

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
    /// Put the peripherals back the way the application expects them.
    ///
    /// The TWI address register is left intact so the application (or a
    /// debugger) can still see which address the bootloader answered on.
    pub fn shutdown(&mut self) {
        self.platform.set_interrupts(false);

        self.twi.disable();
        self.ticker.stop();

        self.platform.select_vectors(VectorTable::Application);

        self.indicators.clear();

        for _ in 0..SETTLE_STEPS {
            self.delay.delay_ms(SETTLE_STEP_MS);
        }
    }

    /// Shut down and start the application, never returns.
    ///
    /// No check is made that an application is present.
    pub fn handoff(mut self) -> ! {
        info!("Starting application");

        self.shutdown();
        self.platform.jump(APPLICATION_ENTRY)
    }
}
