use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use usb_device::device::UsbDeviceState;
use usb_device::endpoint::EndpointAddress;
use usb_device::{UsbDirection, UsbError};
use usbd_msc::os::Timeout;
use usbd_msc::transport::bbb::{Cbw, Csw, CSW_LEN};
use usbd_msc::transport::{InterfaceInfo, UsbCore, XferError};

pub const MAX_PACKET_SIZE: usize = 64;

const HOST_WAIT: Duration = Duration::from_secs(1);

/// Host side CBW
pub fn cbw(tag: u32, data_transfer_len: u32, dir_in: bool, lun: u8, cb: &[u8]) -> Cbw {
    assert!((1..=16).contains(&cb.len()));
    let mut block = [0u8; 16];
    block[..cb.len()].copy_from_slice(cb);
    Cbw {
        tag,
        data_transfer_len,
        flags: if dir_in { 1 << 7 } else { 0 },
        lun,
        block_len: cb.len() as u8,
        block,
    }
}

#[derive(Default)]
pub struct DummyEp {
    stalled: bool,
    aborted: bool,
    aborts: usize,
    packets: VecDeque<Vec<u8>>,
}

impl DummyEp {
    fn write_bytes(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(MAX_PACKET_SIZE) {
            self.packets.push_back(chunk.to_vec());
        }
        if bytes.is_empty() {
            self.packets.push_back(vec![]);
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Interface {
    pub config: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub comm: usize,
}

struct Inner {
    state: UsbDeviceState,
    interfaces: Vec<Interface>,
    next_ep: usize,
    eps: HashMap<u8, DummyEp>,
    control: Vec<Vec<u8>>,
}

struct Shared {
    inner: Mutex<Inner>,
    changed: Condvar,
}

/// USB device core with both ends of every bulk pipe in memory
#[derive(Clone)]
pub struct DummyCore {
    shared: Arc<Shared>,
    serial: Option<String>,
}

impl DummyCore {
    pub fn new() -> Self {
        Self::with_serial(Some("0123456789abcdef"))
    }

    pub fn with_serial(serial: Option<&str>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: UsbDeviceState::Default,
                    interfaces: vec![],
                    next_ep: 1,
                    eps: HashMap::new(),
                    control: vec![],
                }),
                changed: Condvar::new(),
            }),
            serial: serial.map(str::to_owned),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap()
    }

    fn ep<'a>(inner: &'a mut Inner, ep: EndpointAddress) -> Result<&'a mut DummyEp, XferError> {
        inner
            .eps
            .get_mut(&u8::from(ep))
            .ok_or(XferError::Usb(UsbError::InvalidEndpoint))
    }

    pub fn set_state(&self, state: UsbDeviceState) {
        self.lock().state = state;
        self.shared.changed.notify_all();
    }

    pub fn interfaces(&self) -> Vec<Interface> {
        self.lock().interfaces.clone()
    }

    /// Data stages of control IN requests answered so far
    pub fn control_writes(&self) -> Vec<Vec<u8>> {
        self.lock().control.clone()
    }

    pub fn aborts(&self, ep: EndpointAddress) -> usize {
        self.lock().eps[&u8::from(ep)].aborts
    }

    /// Host sends a Command Block Wrapper
    pub fn send_cbw(&self, cbw: &Cbw) {
        self.send_raw(cbw.to_bytes().as_slice());
    }

    /// Host sends raw bytes as a single transfer to the first OUT endpoint
    pub fn send_raw(&self, bytes: &[u8]) {
        let ep = self.out_ep();
        self.send_to(ep, bytes);
    }

    pub fn send_to(&self, ep: EndpointAddress, bytes: &[u8]) {
        {
            let mut inner = self.lock();
            inner.eps.get_mut(&u8::from(ep)).unwrap().write_bytes(bytes);
        }
        self.shared.changed.notify_all();
    }

    /// Host sends a zero length packet
    pub fn send_zlp(&self) {
        self.send_raw(&[]);
    }

    /// Host reads up to `n` bytes from the first IN endpoint, waiting for the device to send them
    pub fn recv(&self, n: usize) -> Vec<u8> {
        let ep = self.in_ep();
        self.recv_from(ep, n)
    }

    pub fn recv_from(&self, ep: EndpointAddress, n: usize) -> Vec<u8> {
        let deadline = Instant::now() + HOST_WAIT;
        let mut bytes = vec![];
        let mut inner = self.lock();
        while bytes.len() < n {
            let dummy = inner.eps.get_mut(&u8::from(ep)).unwrap();
            match dummy.packets.pop_front() {
                Some(mut packet) => bytes.append(&mut packet),
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    inner = self.shared.changed.wait_timeout(inner, deadline - now).unwrap().0;
                }
            }
        }
        bytes
    }

    /// Host reads a Command Status Wrapper, `None` if the device sent none
    pub fn recv_csw(&self) -> Option<Csw> {
        let bytes = self.recv(CSW_LEN);
        if bytes.is_empty() {
            None
        } else {
            Some(Csw::parse(&bytes).expect("malformed CSW"))
        }
    }

    /// Bytes the device queued on the first IN endpoint, without waiting
    pub fn pending_in(&self) -> usize {
        let ep = self.in_ep();
        self.lock().eps[&u8::from(ep)].packets.iter().map(Vec::len).sum()
    }

    pub fn is_halted(&self, ep: EndpointAddress) -> bool {
        self.lock().eps[&u8::from(ep)].stalled
    }

    /// Host issues Clear Feature ENDPOINT_HALT
    pub fn clear_halt(&self, ep: EndpointAddress) {
        self.lock().eps.get_mut(&u8::from(ep)).unwrap().stalled = false;
        self.shared.changed.notify_all();
    }

    pub fn in_ep(&self) -> EndpointAddress {
        self.first_ep(UsbDirection::In)
    }

    pub fn out_ep(&self) -> EndpointAddress {
        self.first_ep(UsbDirection::Out)
    }

    fn first_ep(&self, dir: UsbDirection) -> EndpointAddress {
        EndpointAddress::from_parts(1, dir)
    }

    /// Opens a bulk endpoint pair without an interface, for driving a session directly
    pub fn open_bulk_pair(&self) -> (EndpointAddress, EndpointAddress) {
        let index = {
            let mut inner = self.lock();
            let index = inner.next_ep;
            inner.next_ep += 1;
            inner.eps.insert(
                u8::from(EndpointAddress::from_parts(index, UsbDirection::In)),
                DummyEp::default(),
            );
            inner.eps.insert(
                u8::from(EndpointAddress::from_parts(index, UsbDirection::Out)),
                DummyEp::default(),
            );
            index
        };
        (
            EndpointAddress::from_parts(index, UsbDirection::In),
            EndpointAddress::from_parts(index, UsbDirection::Out),
        )
    }
}

impl UsbCore for DummyCore {
    fn device_state(&self) -> UsbDeviceState {
        self.lock().state
    }

    fn serial_number(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn add_interface(&self, config: u8, info: InterfaceInfo<'_>) -> Result<u8, XferError> {
        let mut inner = self.lock();
        inner.interfaces.push(Interface {
            config,
            class: info.class,
            subclass: info.subclass,
            protocol: info.protocol,
            comm: info.comm,
        });
        Ok((inner.interfaces.len() - 1) as u8)
    }

    fn add_bulk_endpoint(
        &self,
        _config: u8,
        _interface: u8,
        direction: UsbDirection,
    ) -> Result<EndpointAddress, XferError> {
        let mut inner = self.lock();
        // IN and OUT of one interface share an index
        let index = match direction {
            UsbDirection::In => inner.next_ep,
            UsbDirection::Out => {
                let index = inner.next_ep;
                inner.next_ep += 1;
                index
            }
        };
        let addr = EndpointAddress::from_parts(index, direction);
        inner.eps.insert(u8::from(addr), DummyEp::default());
        Ok(addr)
    }

    fn read_bulk(
        &self,
        ep: EndpointAddress,
        buf: &mut [u8],
        timeout: Timeout,
    ) -> Result<usize, XferError> {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let mut inner = self.lock();
        let mut count = 0;
        loop {
            if inner.state != UsbDeviceState::Configured {
                return Err(XferError::InvalidDeviceState);
            }
            let dummy = Self::ep(&mut inner, ep)?;
            if dummy.aborted {
                dummy.aborted = false;
                return Err(XferError::Aborted);
            }

            if let Some(len) = dummy.packets.front().map(Vec::len) {
                if count + len > buf.len() {
                    if count > 0 {
                        return Ok(count);
                    }
                    dummy.packets.pop_front();
                    return Err(XferError::Overflow);
                }
                let packet = dummy.packets.pop_front().unwrap();
                buf[count..count + len].copy_from_slice(&packet);
                count += len;
                // a short packet ends the transfer
                if len < MAX_PACKET_SIZE || count == buf.len() {
                    return Ok(count);
                }
                continue;
            }

            match deadline {
                None => inner = self.shared.changed.wait(inner).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return if count > 0 {
                            Ok(count)
                        } else {
                            Err(XferError::Timeout)
                        };
                    }
                    inner = self.shared.changed.wait_timeout(inner, deadline - now).unwrap().0;
                }
            }
        }
    }

    fn write_bulk(
        &self,
        ep: EndpointAddress,
        buf: &[u8],
        _timeout: Timeout,
    ) -> Result<usize, XferError> {
        {
            let mut inner = self.lock();
            if inner.state != UsbDeviceState::Configured {
                return Err(XferError::InvalidDeviceState);
            }
            let dummy = Self::ep(&mut inner, ep)?;
            if dummy.stalled {
                return Err(XferError::InvalidEndpointState);
            }
            dummy.write_bytes(buf);
        }
        self.shared.changed.notify_all();
        Ok(buf.len())
    }

    fn write_control(&self, buf: &[u8], _timeout: Timeout) -> Result<usize, XferError> {
        self.lock().control.push(buf.to_vec());
        Ok(buf.len())
    }

    fn stall_endpoint(&self, ep: EndpointAddress, stall: bool) -> Result<(), XferError> {
        {
            let mut inner = self.lock();
            let dummy = Self::ep(&mut inner, ep)?;
            dummy.stalled = stall;
            // the host's pending OUT transfer ends at the halt
            if stall && ep.is_out() {
                dummy.packets.clear();
            }
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    fn is_endpoint_stalled(&self, ep: EndpointAddress) -> Result<bool, XferError> {
        let mut inner = self.lock();
        Ok(Self::ep(&mut inner, ep)?.stalled)
    }

    fn abort_endpoint(&self, ep: EndpointAddress) -> Result<(), XferError> {
        {
            let mut inner = self.lock();
            let dummy = Self::ep(&mut inner, ep)?;
            dummy.aborts += 1;
            dummy.packets.clear();
            dummy.aborted = ep.is_out();
        }
        self.shared.changed.notify_all();
        Ok(())
    }
}

