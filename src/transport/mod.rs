//! USB Mass Storage transports
//!
//! The [UsbCore] trait is everything the engine needs from the underlying USB device core:
//! interface/endpoint registration, synchronous bulk and control transfers and endpoint halt
//! control. The core is expected to report configuration changes, endpoint state changes and
//! class requests back through [Msc].
//!
//! [Msc]: crate::class::Msc

use crate::os::Timeout;
use core::fmt;
use num_enum::TryFromPrimitive;
use usb_device::device::UsbDeviceState;
use usb_device::endpoint::EndpointAddress;
use usb_device::{UsbDirection, UsbError};

pub mod bbb;

/// Interface descriptor fields the class asks the core to register
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceInfo<'a> {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub name: &'a str,
    /// Communication slot the core must pass back with every callback for this interface
    pub comm: usize,
}

/// USB device core
///
/// All transfer methods block the calling thread until the transfer completes, fails or
/// `timeout` elapses. Implementations must be callable from several threads at once.
pub trait UsbCore: Send + Sync + 'static {
    /// Current device state
    fn device_state(&self) -> UsbDeviceState;

    /// Device serial number string, if any
    fn serial_number(&self) -> Option<&str>;

    /// Adds an interface to configuration `config` and returns its number.
    fn add_interface(&self, config: u8, info: InterfaceInfo<'_>) -> Result<u8, XferError>;

    /// Adds a bulk endpoint to `interface` and returns its address.
    fn add_bulk_endpoint(
        &self,
        config: u8,
        interface: u8,
        direction: UsbDirection,
    ) -> Result<EndpointAddress, XferError>;

    fn read_bulk(
        &self,
        ep: EndpointAddress,
        buf: &mut [u8],
        timeout: Timeout,
    ) -> Result<usize, XferError>;

    fn write_bulk(&self, ep: EndpointAddress, buf: &[u8], timeout: Timeout)
        -> Result<usize, XferError>;

    /// Sends the data stage of the control request being processed.
    fn write_control(&self, buf: &[u8], timeout: Timeout) -> Result<usize, XferError>;

    /// Sets or clears the halt condition of `ep`.
    fn stall_endpoint(&self, ep: EndpointAddress, stall: bool) -> Result<(), XferError>;

    fn is_endpoint_stalled(&self, ep: EndpointAddress) -> Result<bool, XferError>;

    /// Aborts every transfer queued on `ep`.
    fn abort_endpoint(&self, ep: EndpointAddress) -> Result<(), XferError>;
}

/// Transfer error reported by a [UsbCore]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum XferError {
    /// The timeout elapsed before completion
    Timeout,
    /// The transfer was aborted, e.g. by a Mass Storage Reset
    Aborted,
    /// The host sent more data than the buffer fits
    Overflow,
    /// Garbled reception (CRC, bit stuffing, babble)
    Rx,
    /// Endpoint is halted or not open
    InvalidEndpointState,
    /// Device left the configured state
    InvalidDeviceState,
    /// Controller is not ready for the request
    NotReady,
    /// The transfer could not be queued
    Queuing,
    /// USB stack error
    Usb(UsbError),
}

/// What a failed CBW read means for the session
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CbwFault {
    /// Transient, read the CBW again
    Retry,
    /// Garbled or oversized CBW, stall both endpoints and wait for Reset Recovery
    ResetRecovery,
    /// Bulk-OUT failed, stall it and wait until the host clears it
    StallOut,
}

impl XferError {
    /// Classifies an error returned while reading a CBW
    pub fn cbw_fault(&self) -> CbwFault {
        match self {
            XferError::Timeout
            | XferError::Aborted
            | XferError::InvalidEndpointState
            | XferError::InvalidDeviceState
            | XferError::Usb(UsbError::WouldBlock)
            | XferError::Usb(UsbError::InvalidEndpoint)
            | XferError::Usb(UsbError::InvalidState) => CbwFault::Retry,
            XferError::Overflow
            | XferError::Rx
            | XferError::Usb(UsbError::BufferOverflow)
            | XferError::Usb(UsbError::ParseError) => CbwFault::ResetRecovery,
            XferError::NotReady | XferError::Queuing | XferError::Usb(_) => CbwFault::StallOut,
        }
    }
}

impl fmt::Display for XferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "Transfer timed out"),
            Self::Aborted => write!(f, "Transfer aborted"),
            Self::Overflow => write!(f, "Buffer overflow"),
            Self::Rx => write!(f, "Reception error"),
            Self::InvalidEndpointState => write!(f, "Invalid endpoint state"),
            Self::InvalidDeviceState => write!(f, "Invalid device state"),
            Self::NotReady => write!(f, "Controller not ready"),
            Self::Queuing => write!(f, "Transfer queuing failed"),
            Self::Usb(err) => write!(f, "USB error: {:?}", err),
        }
    }
}

impl std::error::Error for XferError {}

impl From<UsbError> for XferError {
    fn from(err: UsbError) -> Self {
        XferError::Usb(err)
    }
}

/// The status of a Mass Storage command.
///
/// Refer to the USB-MS doc.
#[repr(u8)]
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandStatus {
    #[default]
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

/// Data stage direction, as seen by the host
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataDirection {
    /// Host to device
    Out,
    /// Device to host
    In,
    #[default]
    NotExpected,
}
