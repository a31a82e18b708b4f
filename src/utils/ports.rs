use std::{collections::BTreeSet, sync::Mutex};

use crate::{
    config::PortRange,
    error::{Error, WorkerErrorKind},
};

/// Hands out ports of the worker's RTC range. A port stays taken until the
/// transport holding it is closed.
#[derive(Debug)]
pub(crate) struct PortAllocator {
    range: PortRange,
    used: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub(crate) fn new(range: PortRange) -> Self {
        Self {
            range,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    pub(crate) fn allocate(&self) -> Result<u16, Error> {
        let mut used = self.lock();
        let port = (self.range.min..=self.range.max)
            .find(|port| !used.contains(port))
            .ok_or(Error::new_worker(
                format!(
                    "No free port in range {}-{}",
                    self.range.min, self.range.max
                ),
                WorkerErrorKind::PortExhaustedError,
            ))?;
        used.insert(port);
        Ok(port)
    }

    pub(crate) fn release(&self, port: u16) {
        self.lock().remove(&port);
    }

    pub(crate) fn in_use(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        // The set stays consistent even if a holder panicked.
        self.used.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn allocate_until_exhausted() {
        let allocator = PortAllocator::new(PortRange { min: 2000, max: 2001 });
        assert_eq!(allocator.allocate().unwrap(), 2000);
        assert_eq!(allocator.allocate().unwrap(), 2001);

        let err = allocator.allocate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::WorkerError(WorkerErrorKind::PortExhaustedError));

        allocator.release(2000);
        assert_eq!(allocator.in_use(), 1);
        assert_eq!(allocator.allocate().unwrap(), 2000);
    }
}
