//! Wire protocol constants and the active command register encoding.
//!
//! ```text
//! abort boot timeout:   SLA+W, 0x00, STO
//! read version:         SLA+W, 0x01, SLA+R, {16 bytes}, STO
//! start application:    SLA+W, 0x01, 0x80, STO
//! read chip info:       SLA+W, 0x02, 0x00, SLA+R, {8 bytes}, STO
//! read flash:           SLA+W, 0x02, 0x01, addrh, addrl, SLA+R, {* bytes}, STO
//! read eeprom:          SLA+W, 0x02, 0x02, addrh, addrl, SLA+R, {* bytes}, STO
//! write one flash page: SLA+W, 0x02, 0x01, addrh, addrl, {page bytes}, STO
//! write eeprom:         SLA+W, 0x02, 0x02, addrh, addrl, {* bytes}, STO
//! ```

use core::convert::TryFrom;

/// Abort the boot timeout
pub const CMD_WAIT: u8 = 0x00;
/// Read the version string (SLA+R) or switch application (SLA+W)
pub const CMD_SWITCH_APPLICATION: u8 = 0x01;
/// Read (SLA+R) or write (SLA+W) a memory
pub const CMD_ACCESS_MEMORY: u8 = 0x02;

/// `CMD_SWITCH_APPLICATION` parameter, only handled by an application
pub const BOOTTYPE_BOOTLOADER: u8 = 0x00;
/// `CMD_SWITCH_APPLICATION` parameter
pub const BOOTTYPE_APPLICATION: u8 = 0x80;

/// `CMD_ACCESS_MEMORY` parameters
pub const MEMTYPE_CHIPINFO: u8 = 0x00;
pub const MEMTYPE_FLASH: u8 = 0x01;
pub const MEMTYPE_EEPROM: u8 = 0x02;

/// Byte returned when nothing readable is selected
pub const NO_DATA: u8 = 0xFF;

/// Length of the version record
pub const VERSION_LEN: usize = 16;
/// Length of the chip info record
pub const CHIPINFO_LEN: usize = 8;

/// Value of the active command register.
///
/// A write phase selects the command, a following read phase (after a
/// repeated start) reads whatever the write phase selected, so read and
/// write selections share a single value.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Command {
    /// Idle, nothing selected
    Wait = 0x00,

    /// Version string selected, or a boot type is expected next
    Version = 0x01,

    /// A memory type is expected next
    Memory = 0x02,

    /// Chip info record, read only
    ChipInfo = 0x12,

    /// Flash at the target address
    Flash = 0x22,

    /// EEPROM at the target address
    Eeprom = 0x32,

    /// Re-enter the bootloader, only issued by an application
    BootBootloader = 0x11,

    /// Leave the bootloader and start the application
    BootApplication = 0x21,
}

impl Command {
    /// Refine a pending `Memory` command with the memory type byte
    pub fn memory(memtype: u8) -> Option<Self> {
        match memtype {
            MEMTYPE_CHIPINFO => Some(Command::ChipInfo),
            MEMTYPE_FLASH => Some(Command::Flash),
            #[cfg(feature = "eeprom")]
            MEMTYPE_EEPROM => Some(Command::Eeprom),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        let c = match v {
            0x00 => Command::Wait,
            0x01 => Command::Version,
            0x02 => Command::Memory,
            0x12 => Command::ChipInfo,
            0x22 => Command::Flash,
            0x32 => Command::Eeprom,
            0x11 => Command::BootBootloader,
            0x21 => Command::BootApplication,
            _ => return Err(v),
        };
        Ok(c)
    }
}
