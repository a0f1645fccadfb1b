//! Build-time device configuration.
//!
//! Nothing here is parsed at runtime, a firmware image picks one of the
//! presets (or builds its own `Config`) as a `const`.

use thiserror::Error;

use crate::protocol::{CHIPINFO_LEN, VERSION_LEN};

/// Timer0 reload value, 25ms per overflow at 8MHz with a /1024 prescaler
pub const TIMER_RELOAD: u8 = 0xFF - 195;

/// Ticks before the application is started, 40 * 25ms = 1s
pub const TIMEOUT_TICKS: u8 = 40;

/// Default 7-bit bus address
pub const TWI_ADDRESS: u8 = 0x29;

#[derive(Clone, PartialEq, Debug)]
pub struct Config {
    /// Version record returned by `CMD_SWITCH_APPLICATION` reads
    pub version: [u8; VERSION_LEN],

    /// Device signature bytes
    pub signature: [u8; 3],

    /// Flash page size in bytes
    pub page_size: usize,

    /// Total flash size in bytes
    pub flash_size: u32,

    /// First address of the protected bootloader region
    pub app_end: u16,

    /// EEPROM size in bytes
    pub eeprom_size: u16,

    /// 7-bit slave address
    pub twi_address: u8,

    /// Timer counter reload value, sets the tick period
    pub timer_reload: u8,

    /// Number of ticks before autonomous boot
    pub timeout_ticks: u8,
}

#[derive(Clone, PartialEq, Debug, Error)]
pub enum ConfigError {
    #[error("page buffer holds {buffer} bytes but the device page is {device} bytes")]
    PageSize { buffer: usize, device: usize },

    #[error("page size {0} does not fit the chip info record")]
    PageTooLarge(usize),

    #[error("bootloader start {0:#06x} is not page aligned")]
    Unaligned(u16),

    #[error("bootloader start {0:#06x} lies outside flash")]
    OutOfFlash(u16),

    #[error("timeout of {0} ticks never fires")]
    Timeout(u8),

    #[error("EEPROM access enabled on a part without EEPROM")]
    NoEeprom,
}

impl Config {
    /// Check the configuration against the page buffer size in use
    pub fn validate<const PAGE: usize>(&self) -> Result<(), ConfigError> {
        if self.page_size != PAGE {
            return Err(ConfigError::PageSize {
                buffer: PAGE,
                device: self.page_size,
            });
        }
        if self.page_size == 0 || self.page_size > u8::MAX as usize {
            return Err(ConfigError::PageTooLarge(self.page_size));
        }
        if self.app_end as usize % self.page_size != 0 {
            return Err(ConfigError::Unaligned(self.app_end));
        }
        if self.app_end as u32 >= self.flash_size {
            return Err(ConfigError::OutOfFlash(self.app_end));
        }
        if self.timeout_ticks == 0 {
            return Err(ConfigError::Timeout(self.timeout_ticks));
        }
        if cfg!(feature = "eeprom") && self.eeprom_size == 0 {
            return Err(ConfigError::NoEeprom);
        }
        Ok(())
    }

    /// Chip info record: signature, page size, bootloader start and eeprom size
    pub fn chip_info(&self) -> [u8; CHIPINFO_LEN] {
        let app_end = self.app_end.to_be_bytes();
        let eeprom_size = self.eeprom_size.to_be_bytes();

        [
            self.signature[0],
            self.signature[1],
            self.signature[2],
            self.page_size as u8,
            app_end[0],
            app_end[1],
            eeprom_size[0],
            eeprom_size[1],
        ]
    }
}

/// Pad a version string into a fixed record
const fn version(s: &[u8]) -> [u8; VERSION_LEN] {
    let mut v = [0u8; VERSION_LEN];
    let mut i = 0;
    while i < s.len() && i < VERSION_LEN - 1 {
        v[i] = s[i];
        i += 1;
    }
    v
}

/// ATmega8, 512 words bootloader
pub const ATMEGA8: Config = Config {
    version: version(b"TWIBOOT m8-v21"),
    signature: [0x1E, 0x93, 0x07],
    page_size: 64,
    flash_size: 0x2000,
    app_end: 0x1C00,
    eeprom_size: 512,
    twi_address: TWI_ADDRESS,
    timer_reload: TIMER_RELOAD,
    timeout_ticks: TIMEOUT_TICKS,
};

/// ATmega88, 512 words bootloader
pub const ATMEGA88: Config = Config {
    version: version(b"TWIBOOT m88-v21"),
    signature: [0x1E, 0x93, 0x0A],
    page_size: 64,
    flash_size: 0x2000,
    app_end: 0x1C00,
    eeprom_size: 512,
    twi_address: TWI_ADDRESS,
    timer_reload: TIMER_RELOAD,
    timeout_ticks: TIMEOUT_TICKS,
};

/// ATmega168, 512 words bootloader
pub const ATMEGA168: Config = Config {
    version: version(b"TWIBOOT m168-v2"),
    signature: [0x1E, 0x94, 0x06],
    page_size: 128,
    flash_size: 0x4000,
    app_end: 0x3C00,
    eeprom_size: 512,
    twi_address: TWI_ADDRESS,
    timer_reload: TIMER_RELOAD,
    timeout_ticks: TIMEOUT_TICKS,
};

/// ATmega328P, 512 words bootloader
pub const ATMEGA328P: Config = Config {
    version: version(b"TWIBOOT m328-v2"),
    signature: [0x1E, 0x95, 0x0F],
    page_size: 128,
    flash_size: 0x8000,
    app_end: 0x7C00,
    eeprom_size: 1024,
    twi_address: TWI_ADDRESS,
    timer_reload: TIMER_RELOAD,
    timeout_ticks: TIMEOUT_TICKS,
};

/// Look up a preset by part name
pub fn chip(name: &str) -> Option<&'static Config> {
    match name {
        "atmega8" | "m8" => Some(&ATMEGA8),
        "atmega88" | "m88" => Some(&ATMEGA88),
        "atmega168" | "m168" => Some(&ATMEGA168),
        "atmega328p" | "m328p" => Some(&ATMEGA328P),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        assert_eq!(ATMEGA8.validate::<64>(), Ok(()));
        assert_eq!(ATMEGA88.validate::<64>(), Ok(()));
        assert_eq!(ATMEGA168.validate::<128>(), Ok(()));
        assert_eq!(ATMEGA328P.validate::<128>(), Ok(()));
    }

    #[test]
    fn page_buffer_mismatch() {
        assert_eq!(
            ATMEGA88.validate::<128>(),
            Err(ConfigError::PageSize {
                buffer: 128,
                device: 64
            })
        );
    }

    #[test]
    fn unaligned_app_end() {
        let mut c = ATMEGA88.clone();
        c.app_end = 0x1C20;
        assert_eq!(c.validate::<64>(), Err(ConfigError::Unaligned(0x1C20)));
    }

    #[test]
    fn eeprom_size_required() {
        let mut c = ATMEGA88.clone();
        c.eeprom_size = 0;

        let expected = if cfg!(feature = "eeprom") {
            Err(ConfigError::NoEeprom)
        } else {
            Ok(())
        };
        assert_eq!(c.validate::<64>(), expected);
    }

    #[test]
    fn chip_info_layout() {
        assert_eq!(
            ATMEGA88.chip_info(),
            [0x1E, 0x93, 0x0A, 64, 0x1C, 0x00, 0x02, 0x00]
        );
    }

    #[test]
    fn version_is_terminated() {
        assert_eq!(&ATMEGA88.version[..15], b"TWIBOOT m88-v21");
        assert_eq!(ATMEGA88.version[15], 0);
        assert_eq!(ATMEGA328P.version[15], 0);
    }

    #[test]
    fn lookup() {
        assert_eq!(chip("m168"), Some(&ATMEGA168));
        assert_eq!(chip("attiny85"), None);
    }
}
