//! Bulk Only Transport (BBB/BOT)
//!
//! One [BulkOnly] session exists per configured Mass Storage interface. It is driven by a single
//! worker thread calling [BulkOnly::step] in a loop, while the USB core reports endpoint halt
//! changes and class requests from other threads. Every state change happens under the session
//! lock, so the worker and the callbacks always agree on the current state.
//!
//! A session moves through:
//! * `AwaitingCommand` - reading a CBW from bulk-OUT
//! * `DataStage` - running the command and moving its data
//! * `StatusStage` - writing the CSW to bulk-IN
//!
//! and parks in one of the stalled states until the host clears the halt condition.

use crate::fmt::{debug, info, trace, warning};
use crate::lun::LunTable;
use crate::os::{Signal, Timeout};
use crate::subclass::{Response, SubclassDriver};
use crate::transport::{CbwFault, CommandStatus, DataDirection, UsbCore};
use core::cmp::min;
use core::fmt;
use num_enum::TryFromPrimitive;
use std::sync::{Mutex, MutexGuard, PoisonError};
use usb_device::endpoint::EndpointAddress;

/// Bulk Only Transport interface protocol
pub const TRANSPORT_BBB: u8 = 0x50;

const CBW_SIGNATURE: u32 = 0x43425355;
const CSW_SIGNATURE: u32 = 0x53425355;

pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

const FLAGS_DIR_IN: u8 = 1 << 7;

/// Class specific requests. USB MSC BOT 3
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClassRequest {
    MassStorageReset = 0xFF,
    GetMaxLun = 0xFE,
}

/// Why a CBW was rejected. USB MSC BOT 6.2
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CbwError {
    /// Not exactly 31 bytes
    Length,
    Signature,
    /// Reserved bits of bCBWLUN or bCBWCBLength are set
    ReservedBits,
    /// LUN is not below the number of registered logical units
    LunOutOfRange,
}

impl fmt::Display for CbwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length => write!(f, "CBW length is not {}", CBW_LEN),
            Self::Signature => write!(f, "Invalid CBW signature"),
            Self::ReservedBits => write!(f, "Reserved CBW bits set"),
            Self::LunOutOfRange => write!(f, "LUN out of range"),
        }
    }
}

impl std::error::Error for CbwError {}

/// Command Block Wrapper
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cbw {
    pub tag: u32,
    pub data_transfer_len: u32,
    pub flags: u8,
    pub lun: u8,
    pub block_len: u8,
    pub block: [u8; 16],
}

impl Cbw {
    /// Parses and validates a raw CBW. USB MSC BOT 6.2.1 and 6.2.2
    pub fn parse(raw: &[u8], max_lun: u8) -> Result<Self, CbwError> {
        if raw.len() != CBW_LEN {
            return Err(CbwError::Length);
        }
        if raw[..4] != CBW_SIGNATURE.to_le_bytes() {
            return Err(CbwError::Signature);
        }

        let mut block = [0u8; 16];
        block.copy_from_slice(&raw[15..]);
        let cbw = Cbw {
            tag: le_u32(raw, 4),
            data_transfer_len: le_u32(raw, 8),
            flags: raw[12],
            lun: raw[13],
            block_len: raw[14],
            block,
        };

        if cbw.lun & 0xF0 != 0 || cbw.block_len & 0xE0 != 0 {
            return Err(CbwError::ReservedBits);
        }
        if cbw.lun >= max_lun {
            return Err(CbwError::LunOutOfRange);
        }
        Ok(cbw)
    }

    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut raw = [0u8; CBW_LEN];
        raw[..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        raw[4..8].copy_from_slice(&self.tag.to_le_bytes());
        raw[8..12].copy_from_slice(&self.data_transfer_len.to_le_bytes());
        raw[12] = self.flags;
        raw[13] = self.lun;
        raw[14] = self.block_len;
        raw[15..].copy_from_slice(&self.block);
        raw
    }

    /// Data stage direction the host expects
    pub fn direction(&self) -> DataDirection {
        if self.data_transfer_len == 0 {
            DataDirection::NotExpected
        } else if self.flags & FLAGS_DIR_IN != 0 {
            DataDirection::In
        } else {
            DataDirection::Out
        }
    }

    /// Meaningful part of the command block
    pub fn command(&self) -> &[u8] {
        &self.block[..min(self.block_len as usize, self.block.len())]
    }
}

/// Command Status Wrapper
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Csw {
    pub tag: u32,
    pub data_residue: u32,
    pub status: CommandStatus,
}

impl Csw {
    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut raw = [0u8; CSW_LEN];
        raw[..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        raw[4..8].copy_from_slice(&self.tag.to_le_bytes());
        raw[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        raw[12] = self.status as u8;
        raw
    }

    /// Host side parsing, `None` if `raw` is not a well-formed CSW
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() != CSW_LEN || raw[..4] != CSW_SIGNATURE.to_le_bytes() {
            return None;
        }
        Some(Csw {
            tag: le_u32(raw, 4),
            data_residue: le_u32(raw, 8),
            status: CommandStatus::try_from_primitive(raw[12]).ok()?,
        })
    }
}

fn le_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

/// Outcome of matching the host's expectation against the device's intent
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Verdict {
    pub status: CommandStatus,
    /// Halt the data pipe (in the host's direction) once `bytes` have been moved
    pub stall: bool,
    /// Bytes to move in the host's direction
    pub bytes: u32,
}

impl Verdict {
    const fn new(status: CommandStatus, stall: bool, bytes: u32) -> Self {
        Self {
            status,
            stall,
            bytes,
        }
    }

    /// The subclass driver failed the command before any data was moved
    pub fn failed(cbw: &Cbw) -> Self {
        Self::new(CommandStatus::Failed, cbw.data_transfer_len > 0, 0)
    }

    fn compare(host_len: u32, dev_len: u32) -> Self {
        if host_len > dev_len {
            Self::new(CommandStatus::Passed, true, dev_len)
        } else if host_len < dev_len {
            Self::new(CommandStatus::PhaseError, false, host_len)
        } else {
            Self::new(CommandStatus::Passed, false, dev_len)
        }
    }
}

/// The thirteen cases. USB MSC BOT 6.7
pub fn verify_response(cbw: &Cbw, response: Response) -> Verdict {
    use CommandStatus::*;
    use DataDirection::*;

    let dev_dir = if response.len == 0 {
        NotExpected
    } else {
        response.direction
    };

    match (cbw.direction(), dev_dir) {
        // 1: Hn = Dn
        (NotExpected, NotExpected) => Verdict::new(Passed, false, 0),
        // 2, 3: Hn < Di, Hn < Do
        (NotExpected, _) => Verdict::new(PhaseError, false, 0),
        // 4: Hi > Dn
        (In, NotExpected) => Verdict::new(Failed, true, 0),
        // 5, 6, 7: Hi > Di, Hi = Di, Hi < Di
        (In, In) => Verdict::compare(cbw.data_transfer_len, response.len),
        // 9: Ho > Dn
        (Out, NotExpected) => Verdict::new(Passed, true, 0),
        // 11, 12, 13: Ho > Do, Ho = Do, Ho < Do
        (Out, Out) => Verdict::compare(cbw.data_transfer_len, response.len),
        // 8, 10: Hi <> Do, Ho <> Di
        (In, Out) | (Out, In) => Verdict::new(PhaseError, true, 0),
    }
}

/// Session state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Configuration not selected
    Inactive,
    AwaitingCommand,
    DataStage,
    StatusStage,
    /// Waiting for Clear Feature HALT on bulk-IN, then the CSW goes out
    BulkInStalled,
    /// Waiting for Clear Feature HALT on bulk-OUT. No CSW is pending when the CBW read failed
    BulkOutStalled { csw_pending: bool },
    ResetRecoveryBulkInStalled,
    ResetRecoveryBulkOutStalled,
    /// Waiting for Mass Storage Reset and both pipes unhalted
    ResetRecovery,
}

impl State {
    /// Whether the worker blocks until an endpoint state change
    pub fn is_stalled(&self) -> bool {
        matches!(
            self,
            State::BulkInStalled
                | State::BulkOutStalled { .. }
                | State::ResetRecoveryBulkInStalled
                | State::ResetRecoveryBulkOutStalled
                | State::ResetRecovery
        )
    }
}

/// Result of a single [BulkOnly::step]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    /// Call `step` again
    Progress,
    /// Call [BulkOnly::wait_unstall] before stepping again
    WaitUnstall,
    /// Session is not active
    Inactive,
}

struct Comm {
    state: State,
    // bumped on every enable, disable and reset; stale worker transitions are dropped
    epoch: u32,
    cbw: Cbw,
    csw: Csw,
    bytes_to_xfer: u32,
    stall: bool,
    reset_received: bool,
}

struct Scratch {
    cbw: [u8; CBW_LEN],
    csw: [u8; CSW_LEN],
    data: Box<[u8]>,
}

/// Bulk Only Transport session
pub struct BulkOnly {
    interface: u8,
    in_ep: EndpointAddress,
    out_ep: EndpointAddress,
    timeout: Timeout,
    comm: Mutex<Comm>,
    scratch: Mutex<Scratch>,
    unstalled: Signal,
}

impl BulkOnly {
    /// Creates an inactive session
    ///
    /// # Arguments
    /// * `interface` - interface number the session answers class requests for
    /// * `in_ep`, `out_ep` - bulk endpoint pair
    /// * `data_buf_len` - size of the data stage staging buffer, data moves in chunks of this size
    /// * `timeout` - timeout of every bulk transfer
    pub fn new(
        interface: u8,
        in_ep: EndpointAddress,
        out_ep: EndpointAddress,
        data_buf_len: usize,
        timeout: Timeout,
    ) -> Self {
        Self {
            interface,
            in_ep,
            out_ep,
            timeout,
            comm: Mutex::new(Comm {
                state: State::Inactive,
                epoch: 0,
                cbw: Default::default(),
                csw: Default::default(),
                bytes_to_xfer: 0,
                stall: false,
                reset_received: false,
            }),
            scratch: Mutex::new(Scratch {
                cbw: [0; CBW_LEN],
                csw: [0; CSW_LEN],
                data: vec![0; data_buf_len].into_boxed_slice(),
            }),
            unstalled: Signal::new(),
        }
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn in_ep(&self) -> EndpointAddress {
        self.in_ep
    }

    pub fn out_ep(&self) -> EndpointAddress {
        self.out_ep
    }

    pub fn state(&self) -> State {
        self.comm().state
    }

    /// The CSW of the current (or last) command
    pub fn csw(&self) -> Csw {
        self.comm().csw
    }

    /// Bytes left in the current data stage
    pub fn bytes_to_xfer(&self) -> u32 {
        self.comm().bytes_to_xfer
    }

    /// Whether the current data stage ends with a halted pipe
    pub fn stall_pending(&self) -> bool {
        self.comm().stall
    }

    /// The host selected the configuration
    pub fn enable(&self) {
        let mut comm = self.comm();
        comm.epoch = comm.epoch.wrapping_add(1);
        comm.state = State::AwaitingCommand;
        comm.bytes_to_xfer = 0;
        comm.stall = false;
        comm.reset_received = false;
        info!("usb: bbb: Interface {} enabled", self.interface);
    }

    /// The configuration was deselected or the device disconnected
    pub fn disable(&self) {
        let was_stalled = {
            let mut comm = self.comm();
            let was_stalled = comm.state.is_stalled();
            comm.epoch = comm.epoch.wrapping_add(1);
            comm.state = State::Inactive;
            was_stalled
        };
        info!("usb: bbb: Interface {} disabled", self.interface);
        if was_stalled {
            self.unstalled.post();
        }
    }

    /// Releases a worker blocked in [wait_unstall]
    ///
    /// [wait_unstall]: BulkOnly::wait_unstall
    pub fn release(&self) {
        self.unstalled.post();
    }

    /// Blocks until an endpoint state change (or [disable]) may have moved the session on
    ///
    /// [disable]: BulkOnly::disable
    pub fn wait_unstall(&self) {
        let _ = self.unstalled.pend(Timeout::INFINITE);
    }

    /// Runs one step of the state machine
    ///
    /// Blocks in bulk transfers for at most the session timeout each. Must be called from one
    /// thread only.
    pub fn step<C, D>(&self, core: &C, driver: &D, luns: &LunTable<D::Lun>) -> Step
    where
        C: UsbCore,
        D: SubclassDriver,
    {
        let (state, epoch) = {
            let comm = self.comm();
            (comm.state, comm.epoch)
        };
        let mut scratch = self.scratch.lock().unwrap_or_else(PoisonError::into_inner);

        match state {
            State::AwaitingCommand => self.receive_cbw(core, luns.len(), &mut scratch, epoch),
            State::DataStage => self.process_command(core, driver, luns, &mut scratch, epoch),
            State::StatusStage => self.send_csw(core, &mut scratch, epoch),
            State::Inactive => return Step::Inactive,
            _ => return Step::WaitUnstall,
        }
        Step::Progress
    }

    /// Endpoint halt state of `ep` changed, usually a Clear Feature HALT from the host
    pub fn endpoint_state_changed<C: UsbCore>(&self, core: &C, ep: EndpointAddress) {
        let in_stalled = self.is_stalled(core, self.in_ep);
        let out_stalled = self.is_stalled(core, self.out_ep);

        let mut restall = None;
        let mut release = false;
        let mut clear = false;
        {
            let mut comm = self.comm();
            match comm.state {
                State::BulkInStalled if ep == self.in_ep && !in_stalled => {
                    comm.state = State::StatusStage;
                    release = true;
                }
                State::BulkOutStalled { csw_pending } if ep == self.out_ep && !out_stalled => {
                    comm.state = if csw_pending {
                        State::StatusStage
                    } else {
                        State::AwaitingCommand
                    };
                    release = true;
                }
                // cleared without a Mass Storage Reset first. USB MSC BOT 6.6.1
                State::ResetRecoveryBulkInStalled if ep == self.in_ep && !in_stalled => {
                    comm.state = State::ResetRecoveryBulkOutStalled;
                    restall = Some(self.in_ep);
                }
                State::ResetRecoveryBulkOutStalled if ep == self.out_ep && !out_stalled => {
                    comm.state = State::ResetRecovery;
                    restall = Some(self.out_ep);
                }
                State::ResetRecovery if comm.reset_received && !in_stalled && !out_stalled => {
                    comm.state = State::AwaitingCommand;
                    release = true;
                }
                State::Inactive => clear = true,
                _ => {}
            }
            trace!("usb: bbb: EP {:?} state changed, now {:?}", ep, comm.state);
        }

        if let Some(ep) = restall {
            self.stall(core, ep);
        }
        if clear {
            self.clear_stall(core, self.in_ep);
            self.clear_stall(core, self.out_ep);
        }
        if release {
            self.unstalled.post();
        }
    }

    /// Bulk-Only Mass Storage Reset. USB MSC BOT 3.1
    ///
    /// Aborts both bulk pipes and readies the session for the next CBW once the host has cleared
    /// any halted pipe. Returns `false` if an endpoint could not be aborted.
    pub fn mass_storage_reset<C: UsbCore>(&self, core: &C) -> bool {
        info!("usb: bbb: Recv Mass Storage Reset");
        let in_aborted = core.abort_endpoint(self.in_ep);
        let out_aborted = core.abort_endpoint(self.out_ep);

        let in_stalled = self.is_stalled(core, self.in_ep);
        let out_stalled = self.is_stalled(core, self.out_ep);

        let release = {
            let mut comm = self.comm();
            comm.reset_received = true;
            match comm.state {
                State::Inactive | State::AwaitingCommand => {}
                State::DataStage | State::StatusStage => {
                    comm.epoch = comm.epoch.wrapping_add(1);
                    comm.state = State::AwaitingCommand;
                }
                _ => comm.state = State::ResetRecovery,
            }
            if comm.state == State::ResetRecovery && !in_stalled && !out_stalled {
                comm.state = State::AwaitingCommand;
                true
            } else {
                false
            }
        };
        if release {
            self.unstalled.post();
        }

        in_aborted.is_ok() && out_aborted.is_ok()
    }

    fn receive_cbw<C: UsbCore>(&self, core: &C, max_lun: u8, scratch: &mut Scratch, epoch: u32) {
        let len = match core.read_bulk(self.out_ep, &mut scratch.cbw, self.timeout) {
            Ok(len) => len,
            Err(err) => {
                match err.cbw_fault() {
                    CbwFault::Retry => {
                        trace!("usb: bbb: CBW read interrupted: {:?}", err);
                    }
                    CbwFault::ResetRecovery => {
                        warning!("usb: bbb: CBW read failed: {:?}", err);
                        self.enter_reset_recovery(core, epoch);
                    }
                    CbwFault::StallOut => {
                        warning!("usb: bbb: CBW read failed: {:?}", err);
                        let next = State::BulkOutStalled { csw_pending: false };
                        if self.enter(epoch, next) {
                            self.stall(core, self.out_ep);
                        }
                    }
                }
                return;
            }
        };

        match Cbw::parse(&scratch.cbw[..len], max_lun) {
            Ok(cbw) => {
                info!("usb: bbb: Recv CBW: {:?}", cbw);
                self.update(epoch, |comm| {
                    comm.cbw = cbw;
                    comm.csw = Csw {
                        tag: cbw.tag,
                        data_residue: cbw.data_transfer_len,
                        status: CommandStatus::Passed,
                    };
                    comm.bytes_to_xfer = 0;
                    comm.stall = false;
                    comm.state = State::DataStage;
                });
            }
            Err(err) => {
                // USB MSC BOT 6.6.1
                warning!("usb: bbb: Invalid CBW: {:?}", err);
                self.enter_reset_recovery(core, epoch);
            }
        }
    }

    fn process_command<C, D>(
        &self,
        core: &C,
        driver: &D,
        luns: &LunTable<D::Lun>,
        scratch: &mut Scratch,
        epoch: u32,
    ) where
        C: UsbCore,
        D: SubclassDriver,
    {
        let cbw = self.comm().cbw;

        let verdict = match luns.with_lock(cbw.lun, |lun| driver.process_command(lun, &cbw.block)) {
            Some(Ok(response)) => {
                debug!("usb: bbb: Command response: {:?}", response);
                verify_response(&cbw, response)
            }
            Some(Err(_)) | None => Verdict::failed(&cbw),
        };
        debug!("usb: bbb: {:?}", verdict);

        let applied = self.update(epoch, |comm| {
            comm.csw.status = verdict.status;
            comm.stall = verdict.stall;
            comm.bytes_to_xfer = verdict.bytes;
        });
        if !applied {
            return;
        }

        let direction = cbw.direction();
        let stall = match direction {
            _ if verdict.bytes == 0 => verdict.stall,
            DataDirection::In => self.send_data(core, driver, luns, &cbw, scratch, epoch),
            DataDirection::Out => self.receive_data(core, driver, luns, &cbw, scratch, epoch),
            DataDirection::NotExpected => false,
        };

        if !stall {
            self.enter(epoch, State::StatusStage);
            return;
        }
        // USB MSC BOT 6.7.2 and 6.7.3
        match direction {
            DataDirection::In => {
                if self.enter(epoch, State::BulkInStalled) {
                    self.stall(core, self.in_ep);
                }
            }
            DataDirection::Out => {
                if self.enter(epoch, State::BulkOutStalled { csw_pending: true }) {
                    self.stall(core, self.out_ep);
                }
            }
            DataDirection::NotExpected => {
                self.enter(epoch, State::StatusStage);
            }
        }
    }

    /// Returns whether bulk-IN must be halted before the CSW
    fn send_data<C, D>(
        &self,
        core: &C,
        driver: &D,
        luns: &LunTable<D::Lun>,
        cbw: &Cbw,
        scratch: &mut Scratch,
        epoch: u32,
    ) -> bool
    where
        C: UsbCore,
        D: SubclassDriver,
    {
        let opcode = cbw.block[0];
        let mut remaining = self.comm().bytes_to_xfer;

        while remaining > 0 {
            if !self.is_current(epoch) {
                return true;
            }
            let chunk = min(remaining as usize, scratch.data.len());

            let read = luns.with_lock(cbw.lun, |lun| {
                driver.read_data(lun, opcode, &mut scratch.data[..chunk])
            });
            if !matches!(read, Some(Ok(()))) {
                warning!("usb: bbb: Data read failed");
                self.update(epoch, |comm| comm.csw.status = CommandStatus::Failed);
                return true;
            }

            let written = match core.write_bulk(self.in_ep, &scratch.data[..chunk], self.timeout) {
                Ok(count) => min(count, chunk),
                Err(err) => {
                    warning!("usb: bbb: Data write failed: {:?}", err);
                    return true;
                }
            };
            remaining -= written as u32;
            self.account(epoch, remaining, written);
            trace!("usb: bbb: Wrote bytes: {}, remaining: {}", written, remaining);

            if written < chunk {
                return true;
            }
        }

        self.comm().stall
    }

    /// Returns whether bulk-OUT must be halted before the CSW
    fn receive_data<C, D>(
        &self,
        core: &C,
        driver: &D,
        luns: &LunTable<D::Lun>,
        cbw: &Cbw,
        scratch: &mut Scratch,
        epoch: u32,
    ) -> bool
    where
        C: UsbCore,
        D: SubclassDriver,
    {
        let opcode = cbw.block[0];
        let mut remaining = self.comm().bytes_to_xfer;

        while remaining > 0 {
            if !self.is_current(epoch) {
                return true;
            }
            let chunk = min(remaining as usize, scratch.data.len());

            let buf = &mut scratch.data[..chunk];
            let received = match core.read_bulk(self.out_ep, buf, self.timeout) {
                Ok(count) => min(count, chunk),
                Err(err) => {
                    warning!("usb: bbb: Data read failed: {:?}", err);
                    return true;
                }
            };
            remaining -= received as u32;
            self.account(epoch, remaining, received);
            trace!("usb: bbb: Read bytes: {}, remaining: {}", received, remaining);

            if received == 0 {
                return true;
            }

            let write = luns.with_lock(cbw.lun, |lun| {
                driver.write_data(lun, opcode, &scratch.data[..received])
            });
            if !matches!(write, Some(Ok(()))) {
                warning!("usb: bbb: Data write failed");
                self.update(epoch, |comm| comm.csw.status = CommandStatus::Failed);
                return true;
            }
        }

        self.comm().stall
    }

    fn send_csw<C: UsbCore>(&self, core: &C, scratch: &mut Scratch, epoch: u32) {
        let csw = {
            let comm = self.comm();
            if comm.epoch != epoch {
                return;
            }
            comm.csw
        };
        scratch.csw = csw.to_bytes();

        match core.write_bulk(self.in_ep, &scratch.csw, self.timeout) {
            Err(err) => {
                warning!("usb: bbb: CSW write failed: {:?}", err);
                if self.enter(epoch, State::BulkInStalled) {
                    self.stall(core, self.in_ep);
                }
            }
            Ok(_) if csw.status == CommandStatus::PhaseError => {
                info!("usb: bbb: Sent CSW: {:?}, awaiting reset", csw);
                self.update(epoch, |comm| {
                    comm.reset_received = false;
                    comm.state = State::ResetRecovery;
                });
            }
            Ok(_) => {
                info!("usb: bbb: Sent CSW: {:?}", csw);
                self.enter(epoch, State::AwaitingCommand);
            }
        }
    }

    fn enter_reset_recovery<C: UsbCore>(&self, core: &C, epoch: u32) {
        let entered = self.update(epoch, |comm| {
            comm.reset_received = false;
            comm.state = State::ResetRecoveryBulkInStalled;
        });
        if entered {
            self.stall(core, self.in_ep);
            self.stall(core, self.out_ep);
        }
    }

    fn account(&self, epoch: u32, remaining: u32, moved: usize) {
        self.update(epoch, |comm| {
            comm.bytes_to_xfer = remaining;
            comm.csw.data_residue = comm.csw.data_residue.saturating_sub(moved as u32);
        });
    }

    fn comm(&self) -> MutexGuard<'_, Comm> {
        self.comm.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, epoch: u32) -> bool {
        self.comm().epoch == epoch
    }

    /// Applies `f` unless the session was enabled, disabled or reset since `epoch`
    fn update(&self, epoch: u32, f: impl FnOnce(&mut Comm)) -> bool {
        let mut comm = self.comm();
        if comm.epoch != epoch {
            trace!("usb: bbb: Dropping stale transition");
            return false;
        }
        f(&mut comm);
        true
    }

    fn enter(&self, epoch: u32, state: State) -> bool {
        let entered = self.update(epoch, |comm| comm.state = state);
        if entered {
            info!("usb: bbb: Enter state: {:?}", state);
        }
        entered
    }

    fn is_stalled<C: UsbCore>(&self, core: &C, ep: EndpointAddress) -> bool {
        core.is_endpoint_stalled(ep).unwrap_or(true)
    }

    fn stall<C: UsbCore>(&self, core: &C, ep: EndpointAddress) {
        info!("usb: bbb: Stall EP {:?}", ep);
        if let Err(err) = core.stall_endpoint(ep, true) {
            warning!("usb: bbb: Stall EP {:?} failed: {:?}", ep, err);
        }
    }

    fn clear_stall<C: UsbCore>(&self, core: &C, ep: EndpointAddress) {
        if let Err(err) = core.stall_endpoint(ep, false) {
            warning!("usb: bbb: Clear stall EP {:?} failed: {:?}", ep, err);
        }
    }
}
