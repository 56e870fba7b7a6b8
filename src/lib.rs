//! USB Mass Storage Class Bulk-Only Transport engine for threaded USB device stacks
//!
//! The engine sits between a USB device core (the [UsbCore] trait) and a command set
//! interpreter (the [SubclassDriver] trait). It owns the Bulk-Only Transport protocol: CBW
//! reception and validation, the data stage, CSW emission, endpoint stalls and reset recovery.
//!
//! # Subclasses:
//! * [SCSI] - SCSI transparent command set over a [BlockDevice]
//! * [Vendor Specific subclass] - implement [SubclassDriver] trait
//!
//! # Transports:
//! * [Bulk Only]
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `scsi` | Include SCSI subclass (default)        |
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//! | `log` | Enable logging via [log](https://crates.io/crates/log) crate |
//!
//! [SCSI]: crate::subclass::scsi
//! [BlockDevice]: crate::subclass::scsi::BlockDevice
//! [Vendor Specific subclass]: crate::subclass
//! [Bulk Only]: crate::transport::bbb
//! [UsbCore]: crate::transport::UsbCore
//! [SubclassDriver]: crate::subclass::SubclassDriver

pub(crate) mod fmt;

pub mod class;
pub mod lun;
pub mod os;
pub mod subclass;
pub mod transport;

pub use class::{ClassError, CommId, InstanceId, Msc, MscConfig, TaskConfig};
pub use os::Timeout;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;
