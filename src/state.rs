//! State shared between the bus interrupt, the timer interrupt and the main
//! loop.
//!
//! Every field is a single byte so plain atomic loads and stores are enough,
//! no read-modify-write is ever needed. The bus handler is the only writer of
//! `disarmed`; the active command is written by the bus handler and, only to
//! request the application, by the timer.

use core::convert::TryFrom;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::protocol::Command;

pub struct Shared {
    command: AtomicU8,
    disarmed: AtomicBool,
}

impl Shared {
    pub const fn new() -> Self {
        Self {
            command: AtomicU8::new(Command::Wait as u8),
            disarmed: AtomicBool::new(false),
        }
    }

    /// Current value of the active command register
    pub fn command(&self) -> Command {
        let v = self.command.load(Ordering::SeqCst);
        Command::try_from(v).unwrap_or(Command::Wait)
    }

    /// Update the active command, a pending application boot is never replaced
    pub fn set_command(&self, command: Command) {
        if self.boot_requested() {
            return;
        }
        self.command.store(command as u8, Ordering::SeqCst);
    }

    pub fn request_boot(&self) {
        self.command
            .store(Command::BootApplication as u8, Ordering::SeqCst);
    }

    pub fn boot_requested(&self) -> bool {
        self.command.load(Ordering::SeqCst) == Command::BootApplication as u8
    }

    /// Permanently stop the boot timeout
    pub fn disarm(&self) {
        self.disarmed.store(true, Ordering::SeqCst);
    }

    pub fn disarmed(&self) -> bool {
        self.disarmed.load(Ordering::SeqCst)
    }

    /// Spin until an application boot has been requested
    pub fn wait_for_boot(&self) {
        while !self.boot_requested() {
            core::hint::spin_loop();
        }
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}
