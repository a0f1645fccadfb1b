//! Boot timeout countdown.

use crate::state::Shared;

/// Counts timer ticks down to an autonomous application boot.
///
/// Once the bus handler disarms the timeout the counter is forced to zero and
/// stays there, activity never reloads it.
#[derive(Clone, Debug)]
pub struct BootSequencer {
    remaining: u8,
}

impl BootSequencer {
    pub fn new(timeout_ticks: u8) -> Self {
        Self {
            remaining: timeout_ticks,
        }
    }

    /// Ticks left before the application is started, zero once disarmed or fired
    pub fn remaining(&self, shared: &Shared) -> u8 {
        if shared.disarmed() {
            0
        } else {
            self.remaining
        }
    }

    /// Handle one timer tick, returns true when this tick requested the boot
    pub fn tick(&mut self, shared: &Shared) -> bool {
        if shared.disarmed() {
            self.remaining = 0;
        }

        match self.remaining {
            0 => false,
            1 => {
                debug!("Boot timeout expired");
                self.remaining = 0;
                shared.request_boot();
                true
            }
            _ => {
                self.remaining -= 1;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    #[test]
    fn fires_after_timeout() {
        let shared = Shared::new();
        let mut s = BootSequencer::new(40);

        for _ in 0..39 {
            assert!(!s.tick(&shared));
            assert!(!shared.boot_requested());
        }
        assert!(s.tick(&shared));
        assert!(shared.boot_requested());
    }

    #[test]
    fn fires_once() {
        let shared = Shared::new();
        let mut s = BootSequencer::new(3);

        let fired = (0..100).filter(|_| s.tick(&shared)).count();
        assert_eq!(fired, 1);
        assert_eq!(s.remaining(&shared), 0);
        assert_eq!(shared.command(), Command::BootApplication);
    }

    #[test]
    fn disarm_is_permanent() {
        let shared = Shared::new();
        let mut s = BootSequencer::new(40);

        s.tick(&shared);
        assert_eq!(s.remaining(&shared), 39);

        shared.disarm();
        assert_eq!(s.remaining(&shared), 0);

        for _ in 0..41 {
            assert!(!s.tick(&shared));
        }
        assert_eq!(s.remaining(&shared), 0);
        assert!(!shared.boot_requested());
    }
}
