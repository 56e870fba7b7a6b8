//! Blocking primitives used by the class workers

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Timeout of a blocking operation
///
/// Zero milliseconds is the "wait forever" sentinel, as with most device cores.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timeout {
    ms: u32,
}

impl Timeout {
    /// Block until the operation completes
    pub const INFINITE: Timeout = Timeout { ms: 0 };

    pub const fn from_millis(ms: u32) -> Self {
        Self { ms }
    }

    pub const fn is_infinite(&self) -> bool {
        self.ms == 0
    }

    pub const fn as_millis(&self) -> u32 {
        self.ms
    }

    /// `None` for [Timeout::INFINITE]
    pub fn as_duration(&self) -> Option<Duration> {
        (!self.is_infinite()).then(|| Duration::from_millis(self.ms as u64))
    }

    /// Converts to scheduler ticks, rounding up so a timeout never expires early.
    ///
    /// Returns `0` (wait forever) for [Timeout::INFINITE].
    pub fn to_ticks(&self, tick_rate_hz: u32) -> u32 {
        let ticks = (self.ms as u64 * tick_rate_hz as u64).div_ceil(1000);
        u32::try_from(ticks).unwrap_or(u32::MAX)
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::INFINITE
    }
}

/// Pending on a [Signal] timed out
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Elapsed;

/// Binary semaphore
///
/// Posts coalesce: any number of posts before a pend release exactly one pend.
pub struct Signal {
    tx: SyncSender<()>,
    rx: Mutex<Receiver<()>>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, rx) = sync_channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn post(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            // receiver lives as long as `self`
            Err(TrySendError::Disconnected(())) => {}
        }
    }

    /// Blocks the caller until [post] is called or `timeout` elapses.
    ///
    /// [post]: Signal::post
    pub fn pend(&self, timeout: Timeout) -> Result<(), Elapsed> {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        match timeout.as_duration() {
            None => rx.recv().map_err(|_| Elapsed),
            Some(duration) => rx.recv_timeout(duration).map_err(|err| match err {
                RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected => Elapsed,
            }),
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
