#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::sync_channel;
use std::thread;
use std::time::{Duration, Instant};
use usbd_msc::lun::LunTable;
use usbd_msc::subclass::{CommandFailed, Response, SubclassDriver};
use usbd_msc::transport::bbb::{BulkOnly, State, Step};

pub mod bbb;
#[cfg(feature = "scsi")]
pub mod scsi;

pub use bbb::{cbw, DummyCore};

/// Bulk transfer timeout of sessions under test
pub const BULK_TIMEOUT_MS: u32 = 10;

pub fn timeout<F, T>(timeout: Duration, f: F)
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = sync_channel(0);
    thread::spawn(move || {
        f();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(timeout).expect("timeout");
}

/// Polls `f` until it holds
pub fn wait_for(f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while !f() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Scripted logical unit
pub struct MockLun {
    /// What the next command answers
    pub response: Result<Response, CommandFailed>,
    pub fail_read: bool,
    pub fail_write: bool,
    /// Data sent to the host, repeated as needed
    pub data_in: Vec<u8>,
    pub data_out: Vec<u8>,
    pub commands: Vec<[u8; 16]>,
    pub enabled: bool,
    read_pos: usize,
}

impl MockLun {
    pub fn new(response: Result<Response, CommandFailed>) -> Self {
        Self {
            response,
            fail_read: false,
            fail_write: false,
            data_in: (0..=255).collect(),
            data_out: vec![],
            commands: vec![],
            enabled: false,
            read_pos: 0,
        }
    }
}

impl Default for MockLun {
    fn default() -> Self {
        Self::new(Ok(Response::none()))
    }
}

#[derive(Default)]
pub struct MockDriver {
    pub enables: AtomicUsize,
    pub disables: AtomicUsize,
}

impl SubclassDriver for MockDriver {
    const SUBCLASS: u8 = 0xFF;
    type Lun = MockLun;

    fn enable(&self, lun: &mut MockLun) {
        self.enables.fetch_add(1, Ordering::SeqCst);
        lun.enabled = true;
    }

    fn disable(&self, lun: &mut MockLun) {
        self.disables.fetch_add(1, Ordering::SeqCst);
        lun.enabled = false;
    }

    fn process_command(&self, lun: &mut MockLun, cb: &[u8; 16]) -> Result<Response, CommandFailed> {
        lun.commands.push(*cb);
        lun.read_pos = 0;
        lun.response
    }

    fn read_data(
        &self,
        lun: &mut MockLun,
        _opcode: u8,
        buf: &mut [u8],
    ) -> Result<(), CommandFailed> {
        if lun.fail_read {
            return Err(CommandFailed);
        }
        for byte in buf.iter_mut() {
            *byte = lun.data_in[lun.read_pos % lun.data_in.len()];
            lun.read_pos += 1;
        }
        Ok(())
    }

    fn write_data(&self, lun: &mut MockLun, _opcode: u8, buf: &[u8]) -> Result<(), CommandFailed> {
        if lun.fail_write {
            return Err(CommandFailed);
        }
        lun.data_out.extend_from_slice(buf);
        Ok(())
    }
}

/// Steps `session` until it finishes a command or has to wait for the host
pub fn drive(
    session: &BulkOnly,
    core: &DummyCore,
    driver: &MockDriver,
    luns: &LunTable<MockLun>,
) -> State {
    for _ in 0..16 {
        let before = session.state();
        if session.step(core, driver, luns) != Step::Progress {
            break;
        }
        let after = session.state();
        if after == State::AwaitingCommand && before != State::AwaitingCommand {
            break;
        }
    }
    session.state()
}
