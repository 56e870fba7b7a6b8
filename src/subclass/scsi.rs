//! USB SCSI
//!
//! A SCSI transparent command set driver over any [BlockDevice]. Every logical unit is a
//! [ScsiLun] holding the device, its media state and the sense data of the last command.

use crate::fmt::{debug, info, trace, warning};
use crate::subclass::{CommandFailed, Response, SubclassDriver};
use core::cmp::min;
use core::fmt;
use core::marker::PhantomData;
use num_enum::TryFromPrimitive;

/// SCSI device subclass code
pub const SUBCLASS_SCSI: u8 = 0x06; // SCSI Transparent command set

/* SCSI codes */

/* SPC */
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const MODE_SENSE_6: u8 = 0x1A;
const START_STOP_UNIT: u8 = 0x1B;
const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
const MODE_SENSE_10: u8 = 0x5A;

/* SBC */
const READ_10: u8 = 0x28;
const READ_12: u8 = 0xA8;
const READ_16: u8 = 0x88;
const READ_CAPACITY_10: u8 = 0x25;
const SERVICE_ACTION_IN_16: u8 = 0x9E;
const WRITE_10: u8 = 0x2A;
const WRITE_12: u8 = 0xAA;
const WRITE_16: u8 = 0x8A;
const VERIFY_10: u8 = 0x2F;
const SYNCHRONIZE_CACHE_10: u8 = 0x35;

/* MMC */
const READ_FORMAT_CAPACITIES: u8 = 0x23;

const SA_READ_CAPACITY_16: u8 = 0x10;

/* Mode pages */
const PAGE_READ_WRITE_ERROR_RECOVERY: u8 = 0x01;
const PAGE_INFORMATIONAL_EXCEPTIONS: u8 = 0x1C;
const PAGE_ALL: u8 = 0x3F;

const INQUIRY_LEN: usize = 36;
const REQUEST_SENSE_LEN: usize = 18;
const READ_CAPACITY_10_LEN: usize = 8;
const READ_CAPACITY_16_LEN: usize = 32;
const READ_FORMAT_CAPACITIES_LEN: usize = 12;
const RESPONSE_LEN: usize = 64;

/// Sense keys. SPC 4.5.6
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const DATA_PROTECT: u8 = 0x07;
}

/// Additional sense codes
pub mod asc {
    pub const NO_ADDITIONAL_SENSE_INFO: u8 = 0x00;
    pub const WRITE_ERROR: u8 = 0x0C;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const WRITE_PROTECTED: u8 = 0x27;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
    pub const MEDIUM_REMOVAL_PREVENTED: u8 = 0x53;
}

/// SCSI command
///
/// Refer to specifications (SPC,SAM,SBC,MMC,etc.)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ScsiCommand {
    Unknown,

    /* SPC */
    Inquiry {
        evpd: bool,
        page_code: u8,
        alloc_len: u16,
    },
    TestUnitReady,
    RequestSense {
        desc: bool,
        alloc_len: u8,
    },
    ModeSense6 {
        dbd: bool,
        page_control: PageControl,
        page_code: u8,
        subpage_code: u8,
        alloc_len: u8,
    },
    ModeSense10 {
        dbd: bool,
        page_control: PageControl,
        page_code: u8,
        subpage_code: u8,
        alloc_len: u16,
    },
    StartStopUnit {
        load_eject: bool,
        start: bool,
    },
    PreventAllowMediumRemoval {
        prevent: bool,
    },

    /* SBC */
    ReadCapacity10,
    ReadCapacity16 {
        alloc_len: u32,
    },
    Read {
        lba: u64,
        len: u64,
    },
    Write {
        lba: u64,
        len: u64,
    },
    Verify {
        lba: u64,
        len: u64,
        byte_check: bool,
    },
    SynchronizeCache,

    /* MMC */
    ReadFormatCapacities {
        alloc_len: u16,
    },
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageControl {
    CurrentValues = 0b00,
    ChangeableValues = 0b01,
    DefaultValues = 0b10,
    SavedValues = 0b11,
}

impl PageControl {
    fn from_cb(byte: u8) -> Self {
        match byte >> 6 {
            0b00 => PageControl::CurrentValues,
            0b01 => PageControl::ChangeableValues,
            0b10 => PageControl::DefaultValues,
            _ => PageControl::SavedValues,
        }
    }
}

fn be_u32(cb: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([cb[at], cb[at + 1], cb[at + 2], cb[at + 3]])
}

fn be_u64(cb: &[u8], at: usize) -> u64 {
    (be_u32(cb, at) as u64) << 32 | be_u32(cb, at + 4) as u64
}

fn be_u16(cb: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([cb[at], cb[at + 1]])
}

/// Decodes a command block
pub fn parse_cb(cb: &[u8; 16]) -> ScsiCommand {
    match cb[0] {
        TEST_UNIT_READY => ScsiCommand::TestUnitReady,
        INQUIRY => ScsiCommand::Inquiry {
            evpd: (cb[1] & 0b00000001) != 0,
            page_code: cb[2],
            alloc_len: be_u16(cb, 3),
        },
        REQUEST_SENSE => ScsiCommand::RequestSense {
            desc: (cb[1] & 0b00000001) != 0,
            alloc_len: cb[4],
        },
        READ_CAPACITY_10 => ScsiCommand::ReadCapacity10,
        SERVICE_ACTION_IN_16 if cb[1] & 0b00011111 == SA_READ_CAPACITY_16 => {
            ScsiCommand::ReadCapacity16 {
                alloc_len: be_u32(cb, 10),
            }
        }
        READ_10 => ScsiCommand::Read {
            lba: be_u32(cb, 2) as u64,
            len: be_u16(cb, 7) as u64,
        },
        READ_12 => ScsiCommand::Read {
            lba: be_u32(cb, 2) as u64,
            len: be_u32(cb, 6) as u64,
        },
        READ_16 => ScsiCommand::Read {
            lba: be_u64(cb, 2),
            len: be_u32(cb, 10) as u64,
        },
        WRITE_10 => ScsiCommand::Write {
            lba: be_u32(cb, 2) as u64,
            len: be_u16(cb, 7) as u64,
        },
        WRITE_12 => ScsiCommand::Write {
            lba: be_u32(cb, 2) as u64,
            len: be_u32(cb, 6) as u64,
        },
        WRITE_16 => ScsiCommand::Write {
            lba: be_u64(cb, 2),
            len: be_u32(cb, 10) as u64,
        },
        VERIFY_10 => ScsiCommand::Verify {
            lba: be_u32(cb, 2) as u64,
            len: be_u16(cb, 7) as u64,
            byte_check: (cb[1] & 0b00000010) != 0,
        },
        SYNCHRONIZE_CACHE_10 => ScsiCommand::SynchronizeCache,
        MODE_SENSE_6 => ScsiCommand::ModeSense6 {
            dbd: (cb[1] & 0b00001000) != 0,
            page_control: PageControl::from_cb(cb[2]),
            page_code: cb[2] & 0b00111111,
            subpage_code: cb[3],
            alloc_len: cb[4],
        },
        MODE_SENSE_10 => ScsiCommand::ModeSense10 {
            dbd: (cb[1] & 0b00001000) != 0,
            page_control: PageControl::from_cb(cb[2]),
            page_code: cb[2] & 0b00111111,
            subpage_code: cb[3],
            alloc_len: be_u16(cb, 7),
        },
        START_STOP_UNIT => ScsiCommand::StartStopUnit {
            load_eject: (cb[4] & 0b00000010) != 0,
            start: (cb[4] & 0b00000001) != 0,
        },
        PREVENT_ALLOW_MEDIUM_REMOVAL => ScsiCommand::PreventAllowMediumRemoval {
            prevent: (cb[4] & 0b00000011) != 0,
        },
        READ_FORMAT_CAPACITIES => ScsiCommand::ReadFormatCapacities {
            alloc_len: be_u16(cb, 7),
        },
        _ => ScsiCommand::Unknown,
    }
}

/// Block device I/O failed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockDeviceError;

impl fmt::Display for BlockDeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block device I/O error")
    }
}

impl std::error::Error for BlockDeviceError {}

/// Storage behind a SCSI logical unit
pub trait BlockDevice: Send + 'static {
    /// Bytes per block
    fn block_size(&self) -> u32;

    fn block_count(&self) -> u64;

    fn is_read_only(&self) -> bool {
        false
    }

    /// Reads `buf.len() / block_size` blocks starting at `lba`
    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), BlockDeviceError>;

    /// Writes `buf.len() / block_size` blocks starting at `lba`
    fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<(), BlockDeviceError>;

    fn flush(&mut self) -> Result<(), BlockDeviceError> {
        Ok(())
    }
}

/// Standard INQUIRY identification, space padded on the wire
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LunInfo {
    pub vendor_id: &'static str,
    pub product_id: &'static str,
    pub revision: &'static str,
    pub removable: bool,
}

impl Default for LunInfo {
    fn default() -> Self {
        Self {
            vendor_id: "Generic",
            product_id: "Mass Storage",
            revision: "1.00",
            removable: true,
        }
    }
}

/// Sense data of the last command
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Transfer {
    Idle,
    Response { len: usize, pos: usize },
    Read,
    Write,
}

/// SCSI logical unit
pub struct ScsiLun<B: BlockDevice> {
    device: B,
    info: LunInfo,
    attached: bool,
    ejected: bool,
    prevent_removal: bool,
    sense: Sense,
    transfer: Transfer,
    // current block address and offset inside it
    lba: u64,
    offset: usize,
    block: Vec<u8>,
    response: [u8; RESPONSE_LEN],
}

impl<B: BlockDevice> ScsiLun<B> {
    /// Creates a unit with its media attached
    pub fn new(device: B, info: LunInfo) -> Self {
        let block_size = device.block_size() as usize;
        Self {
            device,
            info,
            attached: true,
            ejected: false,
            prevent_removal: false,
            sense: Sense::default(),
            transfer: Transfer::Idle,
            lba: 0,
            offset: 0,
            block: vec![0; block_size],
            response: [0; RESPONSE_LEN],
        }
    }

    /// Media is attached and not ejected by the host
    pub fn is_present(&self) -> bool {
        self.attached && !self.ejected
    }

    /// The host ejected the media with START STOP UNIT
    pub fn is_ejected(&self) -> bool {
        self.ejected
    }

    pub fn attach(&mut self) {
        self.attached = true;
        self.ejected = false;
    }

    pub fn detach(&mut self) {
        self.attached = false;
        self.transfer = Transfer::Idle;
    }

    /// The host forbids media removal
    pub fn is_removal_prevented(&self) -> bool {
        self.prevent_removal
    }

    pub fn sense(&self) -> Sense {
        self.sense
    }

    pub fn device(&self) -> &B {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut B {
        &mut self.device
    }

    fn set_sense(&mut self, key: u8, asc: u8) {
        self.sense = Sense { key, asc, ascq: 0 };
    }

    fn fail(&mut self, key: u8, asc: u8) -> Result<Response, CommandFailed> {
        warning!("usb: scsi: Command failed, key: {}, asc: {}", key, asc);
        self.set_sense(key, asc);
        Err(CommandFailed)
    }

    fn require_media(&mut self) -> Result<(), CommandFailed> {
        if self.is_present() {
            Ok(())
        } else {
            self.set_sense(sense_key::NOT_READY, asc::MEDIUM_NOT_PRESENT);
            Err(CommandFailed)
        }
    }

    fn respond(&mut self, len: usize, alloc_len: usize) -> Result<Response, CommandFailed> {
        let len = min(len, alloc_len);
        self.transfer = Transfer::Response { len, pos: 0 };
        Ok(Response::to_host(len as u32))
    }

    fn inquiry(&mut self) {
        let buf = &mut self.response[..INQUIRY_LEN];
        buf.fill(0);
        buf[0] = 0x00; // direct access block device
        buf[1] = if self.info.removable { 0x80 } else { 0x00 };
        buf[2] = 0x04; // SPC-2
        buf[3] = 0x02; // response data format
        buf[4] = (INQUIRY_LEN - 5) as u8;
        pad(&mut buf[8..16], self.info.vendor_id);
        pad(&mut buf[16..32], self.info.product_id);
        pad(&mut buf[32..36], self.info.revision);
    }

    fn request_sense(&mut self) {
        let buf = &mut self.response[..REQUEST_SENSE_LEN];
        buf.fill(0);
        buf[0] = 0x70; // current errors, fixed format
        buf[2] = self.sense.key;
        buf[7] = (REQUEST_SENSE_LEN - 8) as u8;
        buf[12] = self.sense.asc;
        buf[13] = self.sense.ascq;
    }

    /// Fills the mode parameter list, returning its length or `None` for an unsupported page
    fn mode_sense(&mut self, page_code: u8, ten: bool) -> Option<usize> {
        let header_len = if ten { 8 } else { 4 };
        let mut len = header_len;
        self.response.fill(0);

        if matches!(page_code, PAGE_READ_WRITE_ERROR_RECOVERY | PAGE_ALL) {
            self.response[len..len + 12].copy_from_slice(&[
                PAGE_READ_WRITE_ERROR_RECOVERY,
                0x0A,
                0x80, // AWRE
                3,    // read retry count
                0,
                0,
                0,
                0,
                3, // write retry count
                0,
                0,
                0,
            ]);
            len += 12;
        }
        if matches!(page_code, PAGE_INFORMATIONAL_EXCEPTIONS | PAGE_ALL) {
            self.response[len..len + 12].copy_from_slice(&[
                PAGE_INFORMATIONAL_EXCEPTIONS,
                0x0A,
                0x00,
                0x05, // MRIE: generate no sense
                0,
                0,
                0,
                0,
                0,
                0,
                0,
                0,
            ]);
            len += 12;
        }
        if len == header_len {
            return None;
        }

        let write_protect = if self.device.is_read_only() { 0x80 } else { 0x00 };
        if ten {
            self.response[..2].copy_from_slice(&((len - 2) as u16).to_be_bytes());
            self.response[3] = write_protect;
        } else {
            self.response[0] = (len - 1) as u8;
            self.response[2] = write_protect;
        }
        Some(len)
    }

    /// Validates a block range and positions the unit at its start
    fn seek(&mut self, lba: u64, len: u64) -> Result<u32, CommandFailed> {
        let in_range = lba
            .checked_add(len)
            .map_or(false, |end| end <= self.device.block_count());
        if !in_range {
            self.set_sense(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE);
            return Err(CommandFailed);
        }
        let Ok(bytes) = u32::try_from(len * self.device.block_size() as u64) else {
            self.set_sense(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
            return Err(CommandFailed);
        };
        self.lba = lba;
        self.offset = 0;
        Ok(bytes)
    }

    fn execute(&mut self, cmd: ScsiCommand) -> Result<Response, CommandFailed> {
        let block_size = self.device.block_size();
        match cmd {
            ScsiCommand::TestUnitReady => {
                self.require_media()?;
                Ok(Response::none())
            }
            ScsiCommand::RequestSense { alloc_len, .. } => {
                self.request_sense();
                self.respond(REQUEST_SENSE_LEN, alloc_len as usize)
            }
            ScsiCommand::Inquiry {
                evpd: false,
                page_code: 0,
                alloc_len,
            } => {
                self.inquiry();
                self.respond(INQUIRY_LEN, alloc_len as usize)
            }
            ScsiCommand::Inquiry { .. } => {
                self.fail(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB)
            }
            ScsiCommand::ModeSense6 {
                page_code,
                alloc_len,
                ..
            } => {
                self.require_media()?;
                match self.mode_sense(page_code, false) {
                    Some(len) => self.respond(len, alloc_len as usize),
                    None => self.fail(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB),
                }
            }
            ScsiCommand::ModeSense10 {
                page_code,
                alloc_len,
                ..
            } => {
                self.require_media()?;
                match self.mode_sense(page_code, true) {
                    Some(len) => self.respond(len, alloc_len as usize),
                    None => self.fail(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB),
                }
            }
            ScsiCommand::StartStopUnit {
                load_eject: true,
                start: false,
            } => {
                if self.prevent_removal {
                    return self.fail(sense_key::ILLEGAL_REQUEST, asc::MEDIUM_REMOVAL_PREVENTED);
                }
                info!("usb: scsi: Media ejected");
                self.ejected = true;
                Ok(Response::none())
            }
            ScsiCommand::StartStopUnit {
                load_eject: true,
                start: true,
            } => {
                self.ejected = false;
                self.require_media()?;
                Ok(Response::none())
            }
            ScsiCommand::StartStopUnit { .. } => Ok(Response::none()),
            ScsiCommand::PreventAllowMediumRemoval { prevent } => {
                self.prevent_removal = prevent;
                Ok(Response::none())
            }
            ScsiCommand::ReadCapacity10 => {
                self.require_media()?;
                let last_lba = self.device.block_count().saturating_sub(1);
                let last_lba = u32::try_from(last_lba).unwrap_or(u32::MAX);
                self.response[..4].copy_from_slice(&last_lba.to_be_bytes());
                self.response[4..8].copy_from_slice(&block_size.to_be_bytes());
                self.respond(READ_CAPACITY_10_LEN, READ_CAPACITY_10_LEN)
            }
            ScsiCommand::ReadCapacity16 { alloc_len } => {
                self.require_media()?;
                let last_lba = self.device.block_count().saturating_sub(1);
                self.response[..READ_CAPACITY_16_LEN].fill(0);
                self.response[..8].copy_from_slice(&last_lba.to_be_bytes());
                self.response[8..12].copy_from_slice(&block_size.to_be_bytes());
                self.respond(READ_CAPACITY_16_LEN, alloc_len as usize)
            }
            ScsiCommand::ReadFormatCapacities { alloc_len } => {
                self.require_media()?;
                let blocks = u32::try_from(self.device.block_count()).unwrap_or(u32::MAX);
                let buf = &mut self.response[..READ_FORMAT_CAPACITIES_LEN];
                buf.fill(0);
                buf[3] = 8; // capacity list length
                buf[4..8].copy_from_slice(&blocks.to_be_bytes());
                buf[8] = 0x02; // formatted media
                buf[9..12].copy_from_slice(&block_size.to_be_bytes()[1..]);
                self.respond(READ_FORMAT_CAPACITIES_LEN, alloc_len as usize)
            }
            ScsiCommand::Read { lba, len } => {
                self.require_media()?;
                let bytes = self.seek(lba, len)?;
                self.transfer = Transfer::Read;
                Ok(Response::to_host(bytes))
            }
            ScsiCommand::Write { lba, len } => {
                self.require_media()?;
                if self.device.is_read_only() {
                    return self.fail(sense_key::DATA_PROTECT, asc::WRITE_PROTECTED);
                }
                let bytes = self.seek(lba, len)?;
                self.transfer = Transfer::Write;
                Ok(Response::from_host(bytes))
            }
            ScsiCommand::Verify {
                byte_check: true, ..
            } => self.fail(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB),
            ScsiCommand::Verify { lba, len, .. } => {
                self.require_media()?;
                self.seek(lba, len)?;
                Ok(Response::none())
            }
            ScsiCommand::SynchronizeCache => {
                self.require_media()?;
                if self.device.flush().is_err() {
                    return self.fail(sense_key::MEDIUM_ERROR, asc::WRITE_ERROR);
                }
                Ok(Response::none())
            }
            ScsiCommand::Unknown => {
                self.fail(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE)
            }
        }
    }

    fn read_blocks(&mut self, buf: &mut [u8]) -> Result<(), BlockDeviceError> {
        let block_size = self.block.len();
        let mut done = 0;
        while done < buf.len() {
            let rest = &mut buf[done..];
            if self.offset == 0 && rest.len() >= block_size {
                let whole = rest.len() / block_size * block_size;
                self.device.read_blocks(self.lba, &mut rest[..whole])?;
                self.lba += (whole / block_size) as u64;
                done += whole;
                continue;
            }
            if self.offset == 0 {
                self.device.read_blocks(self.lba, &mut self.block)?;
            }
            let count = min(block_size - self.offset, rest.len());
            rest[..count].copy_from_slice(&self.block[self.offset..self.offset + count]);
            self.offset += count;
            done += count;
            if self.offset == block_size {
                self.offset = 0;
                self.lba += 1;
            }
        }
        Ok(())
    }

    fn write_blocks(&mut self, buf: &[u8]) -> Result<(), BlockDeviceError> {
        let block_size = self.block.len();
        let mut done = 0;
        while done < buf.len() {
            let rest = &buf[done..];
            if self.offset == 0 && rest.len() >= block_size {
                let whole = rest.len() / block_size * block_size;
                self.device.write_blocks(self.lba, &rest[..whole])?;
                self.lba += (whole / block_size) as u64;
                done += whole;
                continue;
            }
            let count = min(block_size - self.offset, rest.len());
            self.block[self.offset..self.offset + count].copy_from_slice(&rest[..count]);
            self.offset += count;
            done += count;
            if self.offset == block_size {
                self.device.write_blocks(self.lba, &self.block)?;
                self.offset = 0;
                self.lba += 1;
            }
        }
        Ok(())
    }
}

fn pad(dst: &mut [u8], src: &str) {
    dst.fill(b' ');
    let len = min(dst.len(), src.len());
    dst[..len].copy_from_slice(&src.as_bytes()[..len]);
}

/// SCSI USB Mass Storage subclass
pub struct Scsi<B> {
    _device: PhantomData<fn() -> B>,
}

impl<B> Scsi<B> {
    pub const fn new() -> Self {
        Self {
            _device: PhantomData,
        }
    }
}

impl<B> Default for Scsi<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: BlockDevice> SubclassDriver for Scsi<B> {
    const SUBCLASS: u8 = SUBCLASS_SCSI;
    type Lun = ScsiLun<B>;

    fn enable(&self, lun: &mut Self::Lun) {
        lun.transfer = Transfer::Idle;
        lun.sense = Sense::default();
    }

    fn disable(&self, lun: &mut Self::Lun) {
        lun.transfer = Transfer::Idle;
        lun.prevent_removal = false;
    }

    fn process_command(
        &self,
        lun: &mut Self::Lun,
        cb: &[u8; 16],
    ) -> Result<Response, CommandFailed> {
        let cmd = parse_cb(cb);
        debug!("usb: scsi: Command: {:?}", cmd);

        lun.transfer = Transfer::Idle;
        if !matches!(cmd, ScsiCommand::RequestSense { .. }) {
            lun.sense = Sense::default();
        }
        lun.execute(cmd)
    }

    fn read_data(
        &self,
        lun: &mut Self::Lun,
        opcode: u8,
        buf: &mut [u8],
    ) -> Result<(), CommandFailed> {
        trace!("usb: scsi: Read data, opcode: {}, len: {}", opcode, buf.len());
        match lun.transfer {
            Transfer::Response { len, pos } => {
                let count = min(buf.len(), len - pos);
                buf[..count].copy_from_slice(&lun.response[pos..pos + count]);
                buf[count..].fill(0);
                lun.transfer = Transfer::Response {
                    len,
                    pos: pos + count,
                };
                Ok(())
            }
            Transfer::Read => lun.read_blocks(buf).map_err(|_| {
                lun.set_sense(sense_key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR);
                CommandFailed
            }),
            Transfer::Idle | Transfer::Write => Err(CommandFailed),
        }
    }

    fn write_data(&self, lun: &mut Self::Lun, opcode: u8, buf: &[u8]) -> Result<(), CommandFailed> {
        trace!("usb: scsi: Write data, opcode: {}, len: {}", opcode, buf.len());
        match lun.transfer {
            Transfer::Write => lun.write_blocks(buf).map_err(|_| {
                lun.set_sense(sense_key::MEDIUM_ERROR, asc::WRITE_ERROR);
                CommandFailed
            }),
            _ => Err(CommandFailed),
        }
    }
}
