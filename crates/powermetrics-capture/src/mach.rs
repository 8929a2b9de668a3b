//! Mach backend: the calling task's threads, memory and counters.

use crate::remote::TaskMemory;
use crate::sampler::{RawCoreCounters, RawThreadCounters, ThreadSystem};
use crate::unwind::{FrameRegisters, ThreadControl};
use mach2::kern_return::{KERN_SUCCESS, kern_return_t};
use mach2::mach_init::mach_thread_self;
use mach2::mach_port::mach_port_deallocate;
use mach2::mach_types::{thread_act_array_t, thread_act_t};
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::task::task_threads;
use mach2::thread_act::{thread_get_state, thread_resume, thread_suspend};
use mach2::traps::mach_task_self;
use mach2::vm::{mach_vm_deallocate, mach_vm_read_overwrite};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use powermetrics_types::{CoreTicks, CoreUsageSnapshot, KernStatus, LoadBias, QUEUE_LABEL_MAX_BYTES};
use std::ffi::{c_char, c_void};
use std::mem::size_of;
use tracing::debug;

fn check(ret: kern_return_t) -> Result<(), KernStatus> {
    if ret == KERN_SUCCESS {
        Ok(())
    } else {
        Err(KernStatus::new(ret))
    }
}

// ── Memory ───────────────────────────────────────────────────────

/// A task port whose memory is read with `mach_vm_read_overwrite`, which
/// reports unmapped pages instead of faulting.
#[derive(Debug, Clone, Copy)]
pub struct MachTask {
    port: mach_port_t,
}

impl MachTask {
    pub fn current() -> Self {
        Self {
            port: unsafe { mach_task_self() },
        }
    }
}

impl TaskMemory for MachTask {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), KernStatus> {
        let mut copied: mach_vm_size_t = 0;
        check(unsafe {
            mach_vm_read_overwrite(
                self.port,
                address as mach_vm_address_t,
                buf.len() as mach_vm_size_t,
                buf.as_mut_ptr() as mach_vm_address_t,
                &mut copied,
            )
        })?;
        if copied as usize != buf.len() {
            return Err(KernStatus::INVALID_ADDRESS);
        }
        Ok(())
    }
}

// ── Threads ──────────────────────────────────────────────────────

/// A send right to a thread or host port, released on drop.
#[derive(Debug)]
pub struct Port(mach_port_t);

impl Port {
    pub fn raw(&self) -> mach_port_t {
        self.0
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        unsafe {
            mach_port_deallocate(mach_task_self(), self.0);
        }
    }
}

// Private in xnu: bsd/sys/proc_info.h.
const PROC_PIDTHREADCOUNTS: libc::c_int = 34;
const MAX_PERF_LEVELS: usize = 20;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct ProcThreadCountsData {
    _instructions: u64,
    cycles: u64,
    user_time_mach: u64,
    system_time_mach: u64,
    energy_nj: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ProcThreadCounts {
    len: u16,
    _reserved0: u16,
    _reserved1: u32,
    counts: [ProcThreadCountsData; MAX_PERF_LEVELS],
}

impl From<&ProcThreadCountsData> for RawCoreCounters {
    fn from(data: &ProcThreadCountsData) -> Self {
        Self {
            cycles: data.cycles,
            user_time_ticks: data.user_time_mach,
            system_time_ticks: data.system_time_mach,
            energy_nanojoules: data.energy_nj,
        }
    }
}

unsafe extern "C" {
    fn dispatch_queue_get_label(queue: *const c_void) -> *const c_char;
}

/// The calling process, seen through Mach.
#[derive(Debug, Clone, Copy)]
pub struct MachThreads {
    task: MachTask,
    pid: i32,
}

impl Default for MachThreads {
    fn default() -> Self {
        Self::current()
    }
}

impl MachThreads {
    pub fn current() -> Self {
        Self {
            task: MachTask::current(),
            pid: std::process::id() as i32,
        }
    }

    fn identifier_info(&self, thread: &Port) -> Result<libc::thread_identifier_info, KernStatus> {
        let mut info: libc::thread_identifier_info = unsafe { std::mem::zeroed() };
        let mut count = libc::THREAD_IDENTIFIER_INFO_COUNT;
        check(unsafe {
            libc::thread_info(
                thread.raw(),
                libc::THREAD_IDENTIFIER_INFO as libc::thread_flavor_t,
                &mut info as *mut _ as libc::thread_info_t,
                &mut count,
            )
        })?;
        Ok(info)
    }
}

impl TaskMemory for MachThreads {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), KernStatus> {
        self.task.read_into(address, buf)
    }
}

impl ThreadControl for MachThreads {
    type Thread = Port;

    fn is_current_thread(&self, thread: &Port) -> bool {
        let this = Port(unsafe { mach_thread_self() });
        this.raw() == thread.raw()
    }

    fn suspend(&self, thread: &Port) -> Result<(), KernStatus> {
        check(unsafe { thread_suspend(thread.raw()) })
    }

    fn resume(&self, thread: &Port) -> Result<(), KernStatus> {
        check(unsafe { thread_resume(thread.raw()) })
    }

    #[cfg(target_arch = "aarch64")]
    fn frame_registers(&self, thread: &Port) -> Result<FrameRegisters, KernStatus> {
        let mut state = mach2::structs::arm_thread_state64_t::new();
        let mut count = mach2::structs::arm_thread_state64_t::count();
        check(unsafe {
            thread_get_state(
                thread.raw(),
                mach2::thread_status::ARM_THREAD_STATE64,
                (&mut state) as *mut _ as *mut _,
                &mut count,
            )
        })?;
        Ok(FrameRegisters {
            frame_pointer: state.__fp,
            link_register: Some(state.__lr),
        })
    }

    #[cfg(target_arch = "x86_64")]
    fn frame_registers(&self, thread: &Port) -> Result<FrameRegisters, KernStatus> {
        let mut state = mach2::structs::x86_thread_state64_t::new();
        let mut count = mach2::structs::x86_thread_state64_t::count();
        check(unsafe {
            thread_get_state(
                thread.raw(),
                mach2::thread_status::x86_THREAD_STATE64,
                (&mut state) as *mut _ as *mut _,
                &mut count,
            )
        })?;
        Ok(FrameRegisters {
            frame_pointer: state.__rbp,
            link_register: None,
        })
    }
}

impl ThreadSystem for MachThreads {
    fn process_id(&self) -> i32 {
        self.pid
    }

    fn threads(&self) -> Result<Vec<Port>, KernStatus> {
        let mut list: thread_act_array_t = std::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        check(unsafe { task_threads(self.task.port, &mut list, &mut count) })?;

        let ports = unsafe { std::slice::from_raw_parts(list, count as usize) }
            .iter()
            .map(|&port| Port(port))
            .collect();
        let ret = unsafe {
            mach_vm_deallocate(
                self.task.port,
                list as mach_vm_address_t,
                (count as usize * size_of::<thread_act_t>()) as mach_vm_size_t,
            )
        };
        if let Err(status) = check(ret) {
            debug!(%status, "failed to release thread list");
        }
        Ok(ports)
    }

    fn thread_id(&self, thread: &Port) -> Result<u64, KernStatus> {
        Ok(self.identifier_info(thread)?.thread_id)
    }

    fn thread_name(&self, thread: &Port) -> Result<Vec<u8>, KernStatus> {
        let mut info: libc::thread_extended_info = unsafe { std::mem::zeroed() };
        let mut count = libc::THREAD_EXTENDED_INFO_COUNT;
        check(unsafe {
            libc::thread_info(
                thread.raw(),
                libc::THREAD_EXTENDED_INFO as libc::thread_flavor_t,
                &mut info as *mut _ as libc::thread_info_t,
                &mut count,
            )
        })?;
        Ok(info.pth_name.iter().map(|&c| c as u8).collect())
    }

    fn queue_label(&self, thread: &Port) -> Result<Option<Vec<u8>>, KernStatus> {
        let info = self.identifier_info(thread)?;
        if info.dispatch_qaddr == 0 {
            return Ok(None);
        }
        // dispatch_qaddr points at the thread's current queue slot; read it
        // through the kernel so a stale slot fails instead of faulting.
        let mut slot = [0u8; 8];
        self.task.read_into(info.dispatch_qaddr, &mut slot)?;
        let queue = u64::from_ne_bytes(slot);
        if queue == 0 {
            return Ok(None);
        }
        let label = unsafe { dispatch_queue_get_label(queue as usize as *const c_void) };
        if label.is_null() {
            return Ok(None);
        }
        let len = unsafe { libc::strnlen(label, QUEUE_LABEL_MAX_BYTES) };
        let bytes = unsafe { std::slice::from_raw_parts(label as *const u8, len) };
        Ok(Some(bytes.to_vec()))
    }

    fn thread_counters(&self, pid: i32, thread_id: u64) -> Result<RawThreadCounters, KernStatus> {
        let mut counts = ProcThreadCounts {
            len: 0,
            _reserved0: 0,
            _reserved1: 0,
            counts: [ProcThreadCountsData::default(); MAX_PERF_LEVELS],
        };
        let copied = unsafe {
            libc::proc_pidinfo(
                pid,
                PROC_PIDTHREADCOUNTS,
                thread_id,
                &mut counts as *mut _ as *mut c_void,
                size_of::<ProcThreadCounts>() as libc::c_int,
            )
        };
        if copied <= 0 {
            return Err(KernStatus::FAILURE);
        }
        let levels = (counts.len as usize).min(MAX_PERF_LEVELS);
        // Perf level 0 is the performance cluster, 1 the efficiency cluster.
        let level = |index: usize| {
            if index < levels {
                RawCoreCounters::from(&counts.counts[index])
            } else {
                RawCoreCounters::default()
            }
        };
        Ok(RawThreadCounters {
            performance: level(0),
            efficiency: level(1),
        })
    }

    fn load_bias(&self) -> LoadBias {
        compute_load_bias()
    }
}

// ── Process-wide queries ─────────────────────────────────────────

/// Load address of the main executable (dyld image 0), or zero.
pub fn compute_load_bias() -> LoadBias {
    unsafe {
        if libc::_dyld_image_count() == 0 {
            return LoadBias::ZERO;
        }
        let header = libc::_dyld_get_image_header(0);
        if header.is_null() {
            return LoadBias::ZERO;
        }
        LoadBias::new(header as usize as u64)
    }
}

pub fn cpu_usage_snapshot() -> Result<CoreUsageSnapshot, KernStatus> {
    let host = Port(unsafe { libc::mach_host_self() });
    let mut cpu_count: libc::natural_t = 0;
    let mut info: libc::processor_info_array_t = std::ptr::null_mut();
    let mut info_count: mach_msg_type_number_t = 0;
    check(unsafe {
        libc::host_processor_info(
            host.raw(),
            libc::PROCESSOR_CPU_LOAD_INFO,
            &mut cpu_count,
            &mut info,
            &mut info_count,
        )
    })?;

    let raw = unsafe { std::slice::from_raw_parts(info, info_count as usize) };
    let states = libc::CPU_STATE_MAX as usize;
    let tick = |cpu: usize, state: libc::c_int| -> u64 {
        raw.get(cpu * states + state as usize)
            .map(|&t| t as u32 as u64)
            .unwrap_or(0)
    };
    let cores = (0..cpu_count as usize)
        .map(|cpu| CoreTicks {
            system: tick(cpu, libc::CPU_STATE_SYSTEM),
            user: tick(cpu, libc::CPU_STATE_USER),
            nice: tick(cpu, libc::CPU_STATE_NICE),
            idle: tick(cpu, libc::CPU_STATE_IDLE),
        })
        .collect();

    let ret = unsafe {
        mach_vm_deallocate(
            mach_task_self(),
            info as mach_vm_address_t,
            (info_count as usize * size_of::<libc::integer_t>()) as mach_vm_size_t,
        )
    };
    if let Err(status) = check(ret) {
        debug!(%status, "failed to release processor info");
    }

    Ok(CoreUsageSnapshot { cores })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{SampleOptions, Sampler};
    use crate::timebase::Timebase;
    use std::sync::mpsc;

    #[test]
    fn samples_own_threads() {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let worker = std::thread::Builder::new()
            .name("pm-live-worker".into())
            .spawn(move || {
                ready_tx.send(()).unwrap();
                let _ = stop_rx.recv();
            })
            .unwrap();
        ready_rx.recv().unwrap();

        let sampler = Sampler::new(MachThreads::current(), Timebase::native());
        let options = SampleOptions {
            capture_queue_labels: true,
            capture_stacks: true,
            ..SampleOptions::default()
        };
        let report = sampler
            .sample(std::process::id() as i32, &options)
            .expect("own threads are always enumerable");

        assert!(report.thread_count() >= 2);
        assert!(report.threads.iter().any(|t| t.name.as_str() == "pm-live-worker"));
        assert!(
            report
                .threads
                .iter()
                .all(|t| t.backtrace.as_ref().is_some_and(|b| b.len() <= 128))
        );

        stop_tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn cpu_usage_has_cores() {
        let snapshot = cpu_usage_snapshot().expect("host_processor_info on own host");
        assert!(snapshot.core_count() > 0);
    }

    #[test]
    fn load_bias_is_nonzero() {
        assert_ne!(compute_load_bias(), LoadBias::ZERO);
    }
}
