//! Mass Storage class instances
//!
//! [Msc] owns every class instance of one device image. Instances and communication slots come
//! from pools sized by [MscConfig] when the device configuration is built, and are never
//! reclaimed. Each instance gets one worker thread running its [BulkOnly] session.
//!
//! The USB core drives the class through:
//! * [Msc::enable] / [Msc::disable] - configuration selected / deselected or disconnect
//! * [Msc::endpoint_state_changed] - halt condition of a bulk endpoint changed
//! * [Msc::class_request] - class specific control request addressed to an interface

use crate::fmt::{error, info, trace, warning};
use crate::lun::LunTable;
use crate::os::{Signal, Timeout};
use crate::subclass::SubclassDriver;
use crate::transport::bbb::{BulkOnly, ClassRequest, Step, TRANSPORT_BBB};
use crate::transport::{InterfaceInfo, UsbCore, XferError};
use crate::CLASS_MASS_STORAGE;
use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::device::UsbDeviceState;
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

/// Data stage timeout of class requests
const CTRL_TIMEOUT: Timeout = Timeout::from_millis(5000);
const SUSPEND_POLL: Timeout = Timeout::from_millis(10);

const MAX_LUN_QTY: u8 = 16;
const BULK_MAX_PACKET_SIZE: usize = 64;
const MIN_SERIAL_NUMBER_LEN: usize = 12;

const INTERFACE_NAME: &str = "USB Mass Storage Interface";

/// Class configuration
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MscConfig {
    /// Class instances
    pub instance_qty: u8,
    /// Device configurations an instance may be bound to
    pub config_qty: u8,
    /// Logical units per instance, at most 16
    pub lun_qty: u8,
    /// Data stage staging buffer size, a multiple of the bulk max packet size
    pub data_buf_len: usize,
    /// Timeout of every bulk transfer
    pub bulk_timeout: Timeout,
}

impl Default for MscConfig {
    fn default() -> Self {
        Self {
            instance_qty: 1,
            config_qty: 1,
            lun_qty: 1,
            data_buf_len: 512,
            bulk_timeout: Timeout::INFINITE,
        }
    }
}

impl MscConfig {
    fn validate(&self) -> Result<(), ClassError> {
        let valid = self.instance_qty > 0
            && self.config_qty > 0
            && (1..=MAX_LUN_QTY).contains(&self.lun_qty)
            && self.data_buf_len > 0
            && self.data_buf_len % BULK_MAX_PACKET_SIZE == 0;
        if valid {
            Ok(())
        } else {
            Err(ClassError::InvalidConfig)
        }
    }

    fn comm_qty(&self) -> usize {
        self.instance_qty as usize * self.config_qty as usize
    }
}

/// Worker thread resources
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskConfig {
    /// Defaults to `usb-msc-<instance>`
    pub name: Option<String>,
    /// Defaults to the platform's thread stack size
    pub stack_size: Option<usize>,
}

/// Class instance handle
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InstanceId(u8);

impl InstanceId {
    pub const fn index(&self) -> u8 {
        self.0
    }
}

/// Communication slot handle, one per interface registered with the core
///
/// The core receives the slot index in [InterfaceInfo::comm] and must pass it back with every
/// callback for that interface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommId(usize);

impl CommId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> usize {
        self.0
    }
}

/// Class instance manager error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClassError {
    InvalidConfig,
    /// Class instance pool exhausted
    InstanceAlloc,
    /// Communication slot pool exhausted
    CommAlloc,
    /// Logical unit table of the instance is full
    LunAlloc,
    InvalidInstance,
    InvalidComm,
    InvalidLun,
    /// Device serial number is missing or not at least 12 lowercase hex digits
    InvalidSerialNumber,
    /// Worker thread could not be created
    Spawn,
    Usb(XferError),
}

impl fmt::Display for ClassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig => write!(f, "Invalid class configuration"),
            Self::InstanceAlloc => write!(f, "No class instance available"),
            Self::CommAlloc => write!(f, "No communication slot available"),
            Self::LunAlloc => write!(f, "No logical unit available"),
            Self::InvalidInstance => write!(f, "Invalid class instance"),
            Self::InvalidComm => write!(f, "Invalid communication slot"),
            Self::InvalidLun => write!(f, "Invalid logical unit"),
            Self::InvalidSerialNumber => write!(f, "Invalid device serial number"),
            Self::Spawn => write!(f, "Worker spawn failed"),
            Self::Usb(err) => write!(f, "USB core error: {}", err),
        }
    }
}

impl std::error::Error for ClassError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Usb(err) => Some(err),
            _ => None,
        }
    }
}

impl From<XferError> for ClassError {
    fn from(err: XferError) -> Self {
        ClassError::Usb(err)
    }
}

/// Serial numbers must be at least 12 hex digits. USB MSC BOT 4.1.1
pub fn is_valid_serial_number(serial: &str) -> bool {
    serial.len() >= MIN_SERIAL_NUMBER_LEN
        && serial
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

struct Instance<D: SubclassDriver> {
    id: InstanceId,
    driver: D,
    luns: LunTable<D::Lun>,
    active: Mutex<Option<Arc<BulkOnly>>>,
    enabled: Signal,
}

impl<D: SubclassDriver> Instance<D> {
    fn active(&self) -> MutexGuard<'_, Option<Arc<BulkOnly>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct CommSlot {
    instance: InstanceId,
    session: Arc<BulkOnly>,
}

struct Shared<C, D: SubclassDriver> {
    core: C,
    config: MscConfig,
    instances: Mutex<Vec<Arc<Instance<D>>>>,
    comms: Mutex<Vec<CommSlot>>,
    shutdown: AtomicBool,
}

impl<C: UsbCore, D: SubclassDriver> Shared<C, D> {
    fn instances(&self) -> MutexGuard<'_, Vec<Arc<Instance<D>>>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn comms(&self) -> MutexGuard<'_, Vec<CommSlot>> {
        self.comms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn instance(&self, id: InstanceId) -> Result<Arc<Instance<D>>, ClassError> {
        self.instances()
            .get(id.0 as usize)
            .cloned()
            .ok_or(ClassError::InvalidInstance)
    }

    fn slot(&self, comm: CommId) -> Result<(Arc<Instance<D>>, Arc<BulkOnly>), ClassError> {
        let (id, session) = {
            let comms = self.comms();
            let slot = comms.get(comm.0).ok_or(ClassError::InvalidComm)?;
            (slot.instance, slot.session.clone())
        };
        Ok((self.instance(id)?, session))
    }

    fn is_configured(&self) -> bool {
        self.core.device_state() == UsbDeviceState::Configured
    }

    fn is_enabled(&self, instance: &Instance<D>) -> bool {
        self.is_configured() && instance.active().is_some()
    }
}

/// USB Mass Storage class
pub struct Msc<C: UsbCore, D: SubclassDriver> {
    shared: Arc<Shared<C, D>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: UsbCore, D: SubclassDriver> Msc<C, D> {
    /// Creates the class with empty instance and communication slot pools
    pub fn new(core: C, config: MscConfig) -> Result<Self, ClassError> {
        config.validate()?;
        info!(
            "usb: msc: Init, instances: {}, configurations: {}, LUNs: {}",
            config.instance_qty,
            config.config_qty,
            config.lun_qty
        );
        Ok(Self {
            shared: Arc::new(Shared {
                core,
                config,
                instances: Mutex::new(Vec::with_capacity(config.instance_qty as usize)),
                comms: Mutex::new(Vec::with_capacity(config.comm_qty())),
                shutdown: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn core(&self) -> &C {
        &self.shared.core
    }

    pub fn config(&self) -> &MscConfig {
        &self.shared.config
    }

    /// Allocates a class instance served by `driver` and starts its worker
    pub fn create_instance(&self, driver: D, task: TaskConfig) -> Result<InstanceId, ClassError> {
        let mut instances = self.shared.instances();
        if instances.len() >= self.shared.config.instance_qty as usize {
            warning!("usb: msc: Instance pool exhausted");
            return Err(ClassError::InstanceAlloc);
        }

        let id = InstanceId(instances.len() as u8);
        let instance = Arc::new(Instance {
            id,
            driver,
            luns: LunTable::with_capacity(self.shared.config.lun_qty),
            active: Mutex::new(None),
            enabled: Signal::new(),
        });

        let mut builder = thread::Builder::new()
            .name(task.name.unwrap_or_else(|| format!("usb-msc-{}", id.0)));
        if let Some(stack_size) = task.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let worker = {
            let shared = self.shared.clone();
            let instance = instance.clone();
            builder.spawn(move || run_worker(shared, instance))
        };
        let worker = worker.map_err(|_| {
            error!("usb: msc: Worker spawn failed, instance: {}", id.0);
            ClassError::Spawn
        })?;

        instances.push(instance);
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(worker);
        info!("usb: msc: Created instance {}", id.0);
        Ok(id)
    }

    /// Registers the interface of `instance` and its bulk endpoint pair in configuration `config`
    pub fn bind_to_configuration(
        &self,
        instance: InstanceId,
        config: u8,
    ) -> Result<CommId, ClassError> {
        self.shared.instance(instance)?;
        if config >= self.shared.config.config_qty {
            return Err(ClassError::InvalidConfig);
        }
        match self.shared.core.serial_number() {
            Some(serial) if is_valid_serial_number(serial) => {}
            _ => {
                warning!("usb: msc: Serial number must be at least 12 lowercase hex digits");
                return Err(ClassError::InvalidSerialNumber);
            }
        }

        let mut comms = self.shared.comms();
        if comms.len() >= self.shared.config.comm_qty() {
            warning!("usb: msc: Communication slot pool exhausted");
            return Err(ClassError::CommAlloc);
        }
        let comm = CommId(comms.len());

        let core = &self.shared.core;
        let interface = core.add_interface(
            config,
            InterfaceInfo {
                class: CLASS_MASS_STORAGE,
                subclass: D::SUBCLASS,
                protocol: TRANSPORT_BBB,
                name: INTERFACE_NAME,
                comm: comm.0,
            },
        )?;
        let in_ep = core.add_bulk_endpoint(config, interface, UsbDirection::In)?;
        let out_ep = core.add_bulk_endpoint(config, interface, UsbDirection::Out)?;

        comms.push(CommSlot {
            instance,
            session: Arc::new(BulkOnly::new(
                interface,
                in_ep,
                out_ep,
                self.shared.config.data_buf_len,
                self.shared.config.bulk_timeout,
            )),
        });
        info!(
            "usb: msc: Instance {} bound to configuration {}, interface: {}",
            instance.0,
            config,
            interface
        );
        Ok(comm)
    }

    /// Adds a logical unit to `instance`, returning its number
    pub fn add_logical_unit(&self, instance: InstanceId, lun: D::Lun) -> Result<u8, ClassError> {
        let instance = self.shared.instance(instance)?;
        let number = instance.luns.add(lun).map_err(|_| ClassError::LunAlloc)?;
        info!("usb: msc: Instance {} added LUN {}", instance.id.0, number);
        Ok(number)
    }

    /// Runs `f` with exclusive access to logical unit `lun` of `instance`
    pub fn with_logical_unit<R>(
        &self,
        instance: InstanceId,
        lun: u8,
        f: impl FnOnce(&mut D::Lun) -> R,
    ) -> Result<R, ClassError> {
        self.shared
            .instance(instance)?
            .luns
            .with_lock(lun, f)
            .ok_or(ClassError::InvalidLun)
    }

    /// The device is configured and `instance` has an active session
    pub fn is_enabled(&self, instance: InstanceId) -> bool {
        self.shared
            .instance(instance)
            .map(|instance| self.shared.is_enabled(&instance))
            .unwrap_or(false)
    }

    /// The session of communication slot `comm`
    pub fn session(&self, comm: CommId) -> Result<Arc<BulkOnly>, ClassError> {
        self.shared.slot(comm).map(|(_, session)| session)
    }

    /// The host selected the configuration containing `comm`
    pub fn enable(&self, comm: CommId) -> Result<(), ClassError> {
        let (instance, session) = self.shared.slot(comm)?;
        session.enable();
        *instance.active() = Some(session);
        instance.luns.for_each(|_, lun| instance.driver.enable(lun));
        instance.enabled.post();
        Ok(())
    }

    /// The configuration containing `comm` was deselected or the device disconnected
    pub fn disable(&self, comm: CommId) -> Result<(), ClassError> {
        let (instance, session) = self.shared.slot(comm)?;
        {
            let mut active = instance.active();
            if active
                .as_ref()
                .map_or(false, |active| Arc::ptr_eq(active, &session))
            {
                *active = None;
            }
        }
        session.disable();
        abort_bulk(&self.shared.core, &session);
        instance.luns.for_each(|_, lun| instance.driver.disable(lun));
        Ok(())
    }

    /// Halt condition of endpoint `ep` (of the interface of `comm`) changed
    pub fn endpoint_state_changed(
        &self,
        comm: CommId,
        ep: EndpointAddress,
    ) -> Result<(), ClassError> {
        let (_, session) = self.shared.slot(comm)?;
        session.endpoint_state_changed(&self.shared.core, ep);
        Ok(())
    }

    /// Handles a class specific request addressed to the interface of `comm`
    ///
    /// Returns `false` if the request is rejected, the core should stall the control pipe.
    pub fn class_request(&self, comm: CommId, req: &Request) -> bool {
        let Ok((instance, session)) = self.shared.slot(comm) else {
            return false;
        };
        if req.request_type != RequestType::Class
            || req.recipient != Recipient::Interface
            || req.index != session.interface() as u16
        {
            return false;
        }

        match ClassRequest::try_from(req.request) {
            Ok(ClassRequest::MassStorageReset)
                if req.direction == UsbDirection::Out && req.value == 0 && req.length == 0 =>
            {
                session.mass_storage_reset(&self.shared.core)
            }
            Ok(ClassRequest::GetMaxLun)
                if req.direction == UsbDirection::In && req.value == 0 && req.length == 1 =>
            {
                let lun_qty = instance.luns.len();
                if lun_qty == 0 || !self.shared.is_configured() {
                    return false;
                }
                info!("usb: msc: Get Max LUN: {}", lun_qty - 1);
                match self.shared.core.write_control(&[lun_qty - 1], CTRL_TIMEOUT) {
                    Ok(_) => true,
                    Err(err) => {
                        warning!("usb: msc: Get Max LUN write failed: {:?}", err);
                        false
                    }
                }
            }
            _ => {
                warning!("usb: msc: Rejected class request: {}", req.request);
                false
            }
        }
    }

    /// Stops every worker and waits for them to exit
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("usb: msc: Shutdown");

        for instance in self.shared.instances().iter() {
            instance.enabled.post();
        }
        for slot in self.shared.comms().iter() {
            slot.session.release();
            abort_bulk(&self.shared.core, &slot.session);
        }

        let workers = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            core::mem::take(&mut *workers)
        };
        for worker in workers {
            if worker.join().is_err() {
                error!("usb: msc: Worker panicked");
            }
        }
    }
}

impl<C: UsbCore, D: SubclassDriver> Drop for Msc<C, D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn abort_bulk<C: UsbCore>(core: &C, session: &BulkOnly) {
    for ep in [session.in_ep(), session.out_ep()] {
        if let Err(err) = core.abort_endpoint(ep) {
            trace!("usb: msc: Abort EP {:?} failed: {:?}", ep, err);
        }
    }
}

fn run_worker<C: UsbCore, D: SubclassDriver>(
    shared: Arc<Shared<C, D>>,
    instance: Arc<Instance<D>>,
) {
    info!("usb: msc: Worker {} started", instance.id.0);

    while !shared.shutdown.load(Ordering::Acquire) {
        if !shared.is_enabled(&instance) {
            // a suspended device comes back configured without a new enable
            let wait = if instance.active().is_some() {
                SUSPEND_POLL
            } else {
                Timeout::INFINITE
            };
            let _ = instance.enabled.pend(wait);
            continue;
        }
        let Some(session) = instance.active().clone() else {
            continue;
        };

        match session.step(&shared.core, &instance.driver, &instance.luns) {
            Step::Progress | Step::Inactive => {}
            Step::WaitUnstall => session.wait_unstall(),
        }
    }

    info!("usb: msc: Worker {} stopped", instance.id.0);
}
