//! Logical Unit registry

use crate::fmt::trace;
use std::sync::{Mutex, PoisonError, RwLock};

/// Logical unit table is full
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LunTableFull;

/// Fixed capacity table of logical units
///
/// Every unit sits behind its own mutex so a slow operation on one unit never blocks another.
/// Units can be added but never removed.
pub struct LunTable<T> {
    units: RwLock<Vec<Mutex<T>>>,
    capacity: u8,
}

impl<T> LunTable<T> {
    pub fn with_capacity(capacity: u8) -> Self {
        Self {
            units: RwLock::new(Vec::with_capacity(capacity as usize)),
            capacity,
        }
    }

    /// Appends a unit returning its logical unit number
    pub fn add(&self, unit: T) -> Result<u8, LunTableFull> {
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        if units.len() >= self.capacity as usize {
            return Err(LunTableFull);
        }
        units.push(Mutex::new(unit));
        Ok((units.len() - 1) as u8)
    }

    /// Number of units added so far
    pub fn len(&self) -> u8 {
        self.units.read().unwrap_or_else(PoisonError::into_inner).len() as u8
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    /// Runs `f` with exclusive access to unit `lun`
    ///
    /// Blocks until the unit is free. The lock is released when `f` returns or unwinds; a unit
    /// whose previous holder panicked stays usable. Returns `None` if `lun` does not exist.
    pub fn with_lock<R>(&self, lun: u8, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let units = self.units.read().unwrap_or_else(PoisonError::into_inner);
        let unit = units.get(lun as usize)?;
        let mut guard = unit.lock().unwrap_or_else(PoisonError::into_inner);
        trace!("usb: msc: LUN {} locked", lun);
        Some(f(&mut guard))
    }

    /// Runs `f` on every unit in order, locking one unit at a time
    pub fn for_each(&self, mut f: impl FnMut(u8, &mut T)) {
        let units = self.units.read().unwrap_or_else(PoisonError::into_inner);
        for (lun, unit) in units.iter().enumerate() {
            let mut guard = unit.lock().unwrap_or_else(PoisonError::into_inner);
            f(lun as u8, &mut guard);
        }
    }
}
