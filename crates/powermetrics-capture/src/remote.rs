//! Bounded reads of a task's virtual memory.

use powermetrics_types::KernStatus;
use std::error::Error;
use std::fmt;

/// Something whose address space can be read a few bytes at a time.
pub trait TaskMemory {
    /// Fill `buf` from `address`. Anything short of a complete read is an error.
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), KernStatus>;
}

impl<T: TaskMemory + ?Sized> TaskMemory for &T {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), KernStatus> {
        (**self).read_into(address, buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    AddressOverflow { base: u64, offset: i64, length: usize },
    KernelRejected(KernStatus),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressOverflow {
                base,
                offset,
                length,
            } => write!(
                f,
                "address overflow reading {length} bytes at 0x{base:x} {offset:+}"
            ),
            Self::KernelRejected(status) => write!(f, "remote read rejected: {status}"),
        }
    }
}

impl Error for ReadError {}

/// `base + offset`, or `None` if the result leaves the 64-bit address space.
pub fn apply_offset(base: u64, offset: i64) -> Option<u64> {
    base.checked_add_signed(offset)
}

/// Read `length` bytes at `base + offset` from `task`.
///
/// The effective range is checked before anything is read: a frame chain
/// that points off either end of the address space yields
/// [`ReadError::AddressOverflow`] without touching the task.
pub fn read_remote<T: TaskMemory + ?Sized>(
    task: &T,
    base: u64,
    offset: i64,
    length: usize,
) -> Result<Vec<u8>, ReadError> {
    let target = checked_target(base, offset, length)?;
    let mut buf = vec![0u8; length];
    task.read_into(target, &mut buf).map_err(ReadError::KernelRejected)?;
    Ok(buf)
}

/// Read one native-endian 64-bit word at `base + offset`.
pub fn read_remote_u64<T: TaskMemory + ?Sized>(
    task: &T,
    base: u64,
    offset: i64,
) -> Result<u64, ReadError> {
    let target = checked_target(base, offset, 8)?;
    let mut word = [0u8; 8];
    task.read_into(target, &mut word).map_err(ReadError::KernelRejected)?;
    Ok(u64::from_ne_bytes(word))
}

fn checked_target(base: u64, offset: i64, length: usize) -> Result<u64, ReadError> {
    let overflow = ReadError::AddressOverflow {
        base,
        offset,
        length,
    };
    let target = apply_offset(base, offset).ok_or(overflow)?;
    target.checked_add(length as u64).ok_or(overflow)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMemory;

    #[test]
    fn apply_offset_checks_both_directions() {
        assert_eq!(apply_offset(0x1000, 8), Some(0x1008));
        assert_eq!(apply_offset(0x1000, -0x1000), Some(0));
        assert_eq!(apply_offset(0x10, -0x11), None);
        assert_eq!(apply_offset(u64::MAX - 4, 8), None);
    }

    #[test]
    fn overflow_never_reaches_the_task() {
        let memory = FakeMemory::new();
        let err = read_remote(&memory, u64::MAX - 3, 8, 8).unwrap_err();
        assert!(matches!(err, ReadError::AddressOverflow { .. }));
        let err = read_remote_u64(&memory, 4, -8).unwrap_err();
        assert!(matches!(err, ReadError::AddressOverflow { .. }));
        // Target itself fits but the read would run off the end.
        let err = read_remote_u64(&memory, u64::MAX - 3, 0).unwrap_err();
        assert!(matches!(err, ReadError::AddressOverflow { .. }));
        assert_eq!(memory.read_count(), 0);
    }

    #[test]
    fn reads_words_and_reports_rejections() {
        let mut memory = FakeMemory::new();
        memory.write_u64(0x1000, 0xdead_beef);
        assert_eq!(read_remote_u64(&memory, 0x0ff8, 8), Ok(0xdead_beef));
        assert_eq!(
            read_remote(&memory, 0x1000, 0, 8),
            Ok(0xdead_beef_u64.to_ne_bytes().to_vec())
        );
        assert_eq!(
            read_remote_u64(&memory, 0x2000, 0),
            Err(ReadError::KernelRejected(KernStatus::INVALID_ADDRESS))
        );
        assert_eq!(memory.read_count(), 3);
    }
}
