//! Direct access to the calling thread's own stack.

use crate::remote::TaskMemory;
use powermetrics_types::KernStatus;
use std::ops::Range;

/// Reads restricted to a range of the caller's stack that is known to be
/// mapped, so a corrupt frame chain can never fault.
pub struct LocalStack {
    bounds: Range<u64>,
}

impl LocalStack {
    /// # Safety
    ///
    /// Every byte in `bounds` must stay readable for the lifetime of the
    /// returned value.
    pub unsafe fn new(bounds: Range<u64>) -> Self {
        Self { bounds }
    }

    /// The live part of the calling thread's stack: from (roughly) the current
    /// stack pointer up to the top of the stack. `None` if `frame_pointer`
    /// does not point into it.
    #[inline(never)]
    pub fn current(frame_pointer: u64) -> Option<Self> {
        let marker = 0u8;
        let stack_pointer = std::hint::black_box(&marker) as *const u8 as u64;
        let stack = current_stack_bounds()?;
        let bounds = stack_pointer.max(stack.start)..stack.end;
        if !bounds.contains(&frame_pointer) {
            return None;
        }
        Some(Self { bounds })
    }
}

impl TaskMemory for LocalStack {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), KernStatus> {
        let end = address
            .checked_add(buf.len() as u64)
            .ok_or(KernStatus::INVALID_ADDRESS)?;
        if address % std::mem::align_of::<u64>() as u64 != 0
            || address < self.bounds.start
            || end > self.bounds.end
        {
            return Err(KernStatus::INVALID_ADDRESS);
        }
        // Bounds were established as readable when this value was created.
        unsafe {
            std::ptr::copy_nonoverlapping(
                address as usize as *const u8,
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub(crate) fn read_frame_pointer() -> Option<u64> {
    let frame_ptr: usize;
    unsafe {
        core::arch::asm!(
            "mov {}, rbp",
            out(reg) frame_ptr,
            options(nomem, nostack, preserves_flags)
        );
    }
    Some(frame_ptr as u64)
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub(crate) fn read_frame_pointer() -> Option<u64> {
    let frame_ptr: usize;
    unsafe {
        core::arch::asm!(
            "mov {}, x29",
            out(reg) frame_ptr,
            options(nomem, nostack, preserves_flags)
        );
    }
    Some(frame_ptr as u64)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub(crate) fn read_frame_pointer() -> Option<u64> {
    None
}

#[cfg(target_vendor = "apple")]
fn current_stack_bounds() -> Option<Range<u64>> {
    unsafe {
        let thread = libc::pthread_self();
        // The stack address is the top of the stack on Darwin.
        let top = libc::pthread_get_stackaddr_np(thread) as u64;
        let size = libc::pthread_get_stacksize_np(thread) as u64;
        Some(top.checked_sub(size)?..top)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn current_stack_bounds() -> Option<Range<u64>> {
    unsafe {
        let mut attr = std::mem::MaybeUninit::<libc::pthread_attr_t>::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
            return None;
        }
        let mut low: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(attr.as_ptr(), &mut low, &mut size);
        libc::pthread_attr_destroy(attr.as_mut_ptr());
        if rc != 0 {
            return None;
        }
        let low = low as u64;
        Some(low..low.checked_add(size as u64)?)
    }
}

#[cfg(not(any(target_vendor = "apple", target_os = "linux", target_os = "android")))]
fn current_stack_bounds() -> Option<Range<u64>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::read_remote_u64;

    #[test]
    fn reads_outside_bounds_are_rejected() {
        let words = [0x11u64, 0x22, 0x33];
        let base = words.as_ptr() as u64;
        let stack = unsafe { LocalStack::new(base..base + 16) };
        assert_eq!(read_remote_u64(&stack, base, 8), Ok(0x22));
        assert!(read_remote_u64(&stack, base, 16).is_err());
        assert!(read_remote_u64(&stack, base, 4).is_err());
        assert!(read_remote_u64(&stack, base, -8).is_err());
    }

    #[test]
    fn current_stack_contains_locals() {
        let local = 0u64;
        let address = std::hint::black_box(&local) as *const u64 as u64;
        if let Some(bounds) = current_stack_bounds() {
            assert!(bounds.contains(&address));
        }
    }
}
