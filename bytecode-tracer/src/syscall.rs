//! Guest pseudo-syscall dispatch
//!
//! The guest talks to the analysis through a custom instruction carrying a
//! syscall id, a data word and a size. Consumers register the id ranges they
//! handle and the monitor routes each syscall to every matching range.

use crate::error::TracerError;
use crate::Result;

/// First calibration syscall: begin recording memory operations
pub const SYSCALL_CALIBRATION_START: u64 = 0x1000;
/// Calibration checkpoint, `data` holds the number of exercised instructions
pub const SYSCALL_CALIBRATION_CHECKPOINT: u64 = 0x1001;
/// Calibration end: stop recording and run detection
pub const SYSCALL_CALIBRATION_END: u64 = 0x1002;

/// Thread announcement, the payload is a thread descriptor
pub const SYSCALL_THREAD_START: u64 = 0xBEEF;
/// Thread exit, `data` holds the tid
pub const SYSCALL_THREAD_EXIT: u64 = 0xBEF0;
/// Memory area allocation, the payload is a memory area descriptor
pub const SYSCALL_VM_ALLOC: u64 = 0xBEF1;

/// A decoded guest pseudo-syscall
///
/// `payload` holds the guest buffer at `data` (of length `size`) when the
/// host could read it, and is empty otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestSyscall {
    pub id: u64,
    pub data: u64,
    pub size: u64,
    pub payload: Vec<u8>,
}

impl GuestSyscall {
    /// Syscall with only a data word
    pub fn new(id: u64, data: u64) -> Self {
        Self {
            id,
            data,
            size: 0,
            payload: Vec::new(),
        }
    }

    /// Syscall carrying a guest buffer
    pub fn with_payload(id: u64, data: u64, payload: Vec<u8>) -> Self {
        Self {
            id,
            data,
            size: payload.len() as u64,
            payload,
        }
    }
}

/// Handle of a registered syscall range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RangeHandle(usize);

/// Half-open range `[lower, upper)` of syscall ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRange {
    pub lower: u64,
    pub upper: u64,
}

impl SyscallRange {
    /// Whether `id` falls inside the range
    pub fn contains(&self, id: u64) -> bool {
        id >= self.lower && id < self.upper
    }
}

/// Routes guest syscalls to registered id ranges
#[derive(Debug, Default)]
pub struct SyscallMonitor {
    ranges: Vec<(RangeHandle, SyscallRange)>,
    next_handle: usize,
}

impl SyscallMonitor {
    /// Create a monitor with no registered ranges
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in syscall ids `[lower, upper)`
    pub fn register_range(&mut self, lower: u64, upper: u64) -> Result<RangeHandle> {
        if lower >= upper {
            return Err(TracerError::InvalidSyscallRange { lower, upper }.into());
        }
        let handle = RangeHandle(self.next_handle);
        self.next_handle += 1;
        self.ranges.push((handle, SyscallRange { lower, upper }));
        tracing::debug!("Registered syscall range [{:#x}, {:#x})", lower, upper);
        Ok(handle)
    }

    /// Remove a previously registered range
    pub fn deregister(&mut self, handle: RangeHandle) -> Result<()> {
        let position = self
            .ranges
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or(TracerError::UnknownSyscallRange(handle.0))?;
        self.ranges.remove(position);
        Ok(())
    }

    /// The range registered under `handle`
    pub fn range(&self, handle: RangeHandle) -> Option<SyscallRange> {
        self.ranges
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, range)| *range)
    }

    /// Every registered range containing the syscall id, in registration order
    pub fn dispatch(&self, syscall: &GuestSyscall) -> Vec<RangeHandle> {
        let targets: Vec<RangeHandle> = self
            .ranges
            .iter()
            .filter(|(_, range)| range.contains(syscall.id))
            .map(|(handle, _)| *handle)
            .collect();
        if targets.is_empty() {
            tracing::trace!("Unclaimed guest syscall {:#x}", syscall.id);
        }
        targets
    }
}

/// Read a little-endian `u32` at `offset`
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(raw.try_into().ok()?))
}

/// Read a little-endian `u64` at `offset`
pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let raw = bytes.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(raw.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_to_overlapping_ranges() {
        let mut monitor = SyscallMonitor::new();
        let calibration = monitor
            .register_range(SYSCALL_CALIBRATION_START, SYSCALL_CALIBRATION_END + 1)
            .unwrap();
        let wide = monitor.register_range(0x0, 0x2000).unwrap();

        let targets = monitor.dispatch(&GuestSyscall::new(SYSCALL_CALIBRATION_CHECKPOINT, 3));
        assert_eq!(targets, vec![calibration, wide]);

        let targets = monitor.dispatch(&GuestSyscall::new(SYSCALL_CALIBRATION_END + 1, 0));
        assert_eq!(targets, vec![wide], "Upper bound is exclusive");
    }

    #[test]
    fn test_deregister() {
        let mut monitor = SyscallMonitor::new();
        let handle = monitor.register_range(10, 20).unwrap();
        monitor.deregister(handle).unwrap();

        assert!(monitor.dispatch(&GuestSyscall::new(15, 0)).is_empty());
        assert!(monitor.deregister(handle).is_err(), "Double deregistration must fail");
    }

    #[test]
    fn test_invalid_range() {
        let mut monitor = SyscallMonitor::new();
        assert!(monitor.register_range(5, 5).is_err());
        assert!(monitor.register_range(6, 5).is_err());
    }

    #[test]
    fn test_little_endian_readers() {
        let bytes = [0x01, 0x00, 0x00, 0x00, 0xff, 0xee, 0xdd, 0xcc, 0, 0, 0, 0];
        assert_eq!(read_u32(&bytes, 0), Some(1));
        assert_eq!(read_u64(&bytes, 4), Some(0xccdd_eeff));
        assert_eq!(read_u64(&bytes, 8), None);
    }
}
