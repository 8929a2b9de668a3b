//! Frame-pointer stack unwinding for the calling thread and for suspended
//! sibling threads.

use crate::local;
use crate::remote::{ReadError, TaskMemory, read_remote_u64};
use powermetrics_types::{KernStatus, MAX_FRAME_DEPTH, StackTrace};
use std::num::NonZeroUsize;
use tracing::{debug, warn};

/// Strips pointer-authentication bits from user-space pointers on Apple arm64.
pub const APPLE_ARM64_POINTER_MASK: u64 = 0x0000_000F_FFFF_FFFF;
/// 48-bit virtual addresses, used everywhere else.
pub const GENERIC_POINTER_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

pub fn native_pointer_mask() -> u64 {
    if cfg!(all(target_vendor = "apple", target_arch = "aarch64")) {
        APPLE_ARM64_POINTER_MASK
    } else {
        GENERIC_POINTER_MASK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindOptions {
    pub max_depth: NonZeroUsize,
    pub pointer_mask: u64,
}

impl Default for UnwindOptions {
    fn default() -> Self {
        Self {
            max_depth: NonZeroUsize::new(MAX_FRAME_DEPTH)
                .expect("invariant violated: default max_depth must be non-zero"),
            pointer_mask: native_pointer_mask(),
        }
    }
}

/// The registers needed to start a frame walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRegisters {
    pub frame_pointer: u64,
    /// `None` on architectures that keep the return address on the stack.
    pub link_register: Option<u64>,
}

/// Why a walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    NullFrame,
    MaxDepth,
    ReadFailed(ReadError),
    SuspendFailed(KernStatus),
    RegistersUnavailable(KernStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwind {
    pub trace: StackTrace,
    pub termination: Termination,
    /// Set when the thread could not be resumed after the walk.
    pub resume_failure: Option<KernStatus>,
}

impl Unwind {
    fn empty(termination: Termination) -> Self {
        Self {
            trace: StackTrace::new(),
            termination,
            resume_failure: None,
        }
    }
}

/// Suspend/resume and register access for the threads of one task.
pub trait ThreadControl {
    type Thread;

    fn is_current_thread(&self, thread: &Self::Thread) -> bool;
    fn suspend(&self, thread: &Self::Thread) -> Result<(), KernStatus>;
    fn resume(&self, thread: &Self::Thread) -> Result<(), KernStatus>;
    fn frame_registers(&self, thread: &Self::Thread) -> Result<FrameRegisters, KernStatus>;
}

/// Keeps a thread suspended; resumes it exactly once, either through
/// [`SuspendGuard::resume`] or on drop.
pub struct SuspendGuard<'a, C: ThreadControl + ?Sized> {
    control: &'a C,
    thread: &'a C::Thread,
    resumed: bool,
}

impl<'a, C: ThreadControl + ?Sized> SuspendGuard<'a, C> {
    pub fn suspend(control: &'a C, thread: &'a C::Thread) -> Result<Self, KernStatus> {
        control.suspend(thread)?;
        Ok(Self {
            control,
            thread,
            resumed: false,
        })
    }

    pub fn resume(mut self) -> Result<(), KernStatus> {
        self.resumed = true;
        self.control.resume(self.thread)
    }
}

impl<C: ThreadControl + ?Sized> Drop for SuspendGuard<'_, C> {
    fn drop(&mut self) {
        if self.resumed {
            return;
        }
        self.resumed = true;
        if let Err(status) = self.control.resume(self.thread) {
            warn!(%status, "failed to resume thread after aborted unwind");
        }
    }
}

/// Walk a frame-pointer chain through `memory`, newest frame first, appending
/// at most `options.max_depth` return addresses to `trace`.
///
/// Nothing here allocates as long as `trace` has room for `max_depth` more
/// entries, so it is safe to call while another thread of the task is
/// suspended.
pub fn walk_frame_chain<M: TaskMemory + ?Sized>(
    memory: &M,
    registers: FrameRegisters,
    options: &UnwindOptions,
    trace: &mut StackTrace,
) -> Termination {
    let mask = options.pointer_mask;
    let max_depth = options.max_depth.get();
    let mut frame_pointer = registers.frame_pointer;
    let mut depth = 0usize;

    loop {
        let current = frame_pointer & mask;
        if current == 0 {
            return Termination::NullFrame;
        }

        let next = match read_remote_u64(memory, current, 0) {
            Ok(next) => next,
            Err(err) => return Termination::ReadFailed(err),
        };

        // The saved link register at fp+8 disagrees with the live register
        // when the thread is stopped in a leaf or a prologue.
        let link_register = registers
            .link_register
            .map(|lr| lr & mask)
            .filter(|&lr| depth == 0 && lr != 0);
        let caller = match link_register {
            Some(lr) => Some(lr),
            None => read_remote_u64(memory, current, 8)
                .ok()
                .map(|address| address & mask),
        };
        if let Some(caller) = caller {
            trace.push(caller);
        }

        depth += 1;
        if depth >= max_depth {
            return Termination::MaxDepth;
        }
        frame_pointer = next;
    }
}

/// Unwind `thread`. The calling thread is captured in place; any other thread
/// is suspended for the duration of the walk.
pub fn unwind_thread<S>(system: &S, thread: &S::Thread, options: &UnwindOptions) -> Unwind
where
    S: ThreadControl + TaskMemory + ?Sized,
{
    if system.is_current_thread(thread) {
        let (trace, termination) = capture_current_with_termination(options);
        return Unwind {
            trace,
            termination,
            resume_failure: None,
        };
    }

    // Reserved up front: the target may be holding the allocator lock.
    let mut trace = StackTrace::with_capacity(options.max_depth.get());

    let guard = match SuspendGuard::suspend(system, thread) {
        Ok(guard) => guard,
        Err(status) => {
            debug!(%status, "thread suspend failed; skipping stack");
            return Unwind::empty(Termination::SuspendFailed(status));
        }
    };

    // Until the thread is resumed: no allocation, no locks, no logging. The
    // suspended thread may own any of them and we would never get it back.
    let termination = match system.frame_registers(thread) {
        Ok(registers) => walk_frame_chain(system, registers, options, &mut trace),
        Err(status) => Termination::RegistersUnavailable(status),
    };
    let resume_failure = guard.resume().err();

    if let Termination::RegistersUnavailable(status) = termination {
        debug!(%status, "thread register state unavailable");
    }
    if let Some(status) = resume_failure {
        warn!(%status, "failed to resume sampled thread");
    }
    Unwind {
        trace,
        termination,
        resume_failure,
    }
}

/// Capture the calling thread's stack. The first entry is the return address
/// into the function that called `capture_current`.
#[inline(never)]
pub fn capture_current(options: &UnwindOptions) -> StackTrace {
    capture_current_with_termination(options).0
}

#[inline(always)]
fn capture_current_with_termination(options: &UnwindOptions) -> (StackTrace, Termination) {
    let Some(frame_pointer) = local::read_frame_pointer() else {
        return (StackTrace::new(), Termination::NullFrame);
    };
    let Some(stack) = local::LocalStack::current(frame_pointer) else {
        return (StackTrace::new(), Termination::NullFrame);
    };
    let mut trace = StackTrace::with_capacity(options.max_depth.get());
    let termination = walk_frame_chain(
        &stack,
        FrameRegisters {
            frame_pointer,
            link_register: None,
        },
        options,
        &mut trace,
    );
    (trace, termination)
}
