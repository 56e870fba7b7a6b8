//! USB Mass Storage subclasses
//!
//! A subclass driver interprets the command blocks carried by the transport. It never touches
//! the USB endpoints: the transport asks it what a command needs ([process_command]) and then
//! moves the data stage chunk by chunk through [read_data] and [write_data].
//!
//! Each call gets exclusive access to the per-LUN state of the addressed logical unit.
//!
//! [process_command]: SubclassDriver::process_command
//! [read_data]: SubclassDriver::read_data
//! [write_data]: SubclassDriver::write_data

use crate::transport::DataDirection;
use core::fmt;

#[cfg(feature = "scsi")]
pub mod scsi;

/// The command failed, details are kept by the driver (e.g. as sense data)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandFailed;

impl fmt::Display for CommandFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command failed")
    }
}

impl std::error::Error for CommandFailed {}

/// What the device intends to do in the data stage of a command
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Response {
    pub len: u32,
    pub direction: DataDirection,
}

impl Response {
    /// No data stage
    pub const fn none() -> Self {
        Self {
            len: 0,
            direction: DataDirection::NotExpected,
        }
    }

    /// `len` bytes to the host
    pub const fn to_host(len: u32) -> Self {
        Self {
            len,
            direction: DataDirection::In,
        }
    }

    /// `len` bytes from the host
    pub const fn from_host(len: u32) -> Self {
        Self {
            len,
            direction: DataDirection::Out,
        }
    }
}

/// Mass Storage subclass driver
pub trait SubclassDriver: Send + Sync + 'static {
    /// Interface subclass code
    const SUBCLASS: u8;

    /// Per logical unit state
    type Lun: Send + 'static;

    /// The host selected a configuration containing this unit
    fn enable(&self, _lun: &mut Self::Lun) {}

    /// The configuration was deselected or the device disconnected
    fn disable(&self, _lun: &mut Self::Lun) {}

    /// Interprets a command block and reports the data stage it needs
    fn process_command(
        &self,
        lun: &mut Self::Lun,
        cb: &[u8; 16],
    ) -> Result<Response, CommandFailed>;

    /// Fills `buf` with the next chunk of data for the host
    fn read_data(&self, lun: &mut Self::Lun, opcode: u8, buf: &mut [u8])
        -> Result<(), CommandFailed>;

    /// Consumes the next chunk of data received from the host
    fn write_data(&self, lun: &mut Self::Lun, opcode: u8, buf: &[u8]) -> Result<(), CommandFailed>;
}
