//! Thread sampling for the calling process: per-thread counters split by
//! core class, thread identity, and frame-pointer stacks of suspended
//! sibling threads.

mod local;
mod remote;
mod sampler;
mod timebase;
mod unwind;

#[cfg(target_os = "macos")]
mod mach;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use local::LocalStack;
pub use remote::{ReadError, TaskMemory, apply_offset, read_remote, read_remote_u64};
pub use sampler::{
    RawCoreCounters, RawThreadCounters, SampleError, SampleOptions, Sampler, ThreadSystem,
};
pub use timebase::Timebase;
pub use unwind::{
    APPLE_ARM64_POINTER_MASK, FrameRegisters, GENERIC_POINTER_MASK, SuspendGuard, Termination,
    ThreadControl, Unwind, UnwindOptions, capture_current, native_pointer_mask, unwind_thread,
    walk_frame_chain,
};

#[cfg(target_os = "macos")]
pub use mach::{MachTask, MachThreads, Port};

use powermetrics_types::{CoreUsageSnapshot, KernStatus, LoadBias, SampleReport};

/// Load address of the main executable, subtracted from captured addresses
/// so stacks compare across launches. Zero when it cannot be determined.
pub fn compute_load_bias() -> LoadBias {
    platform::compute_load_bias_impl()
}

/// Cumulative per-core tick counters of the host.
pub fn cpu_usage_snapshot() -> Result<CoreUsageSnapshot, KernStatus> {
    platform::cpu_usage_snapshot_impl()
}

/// Sample every thread of the calling process with the native backend.
pub fn sample_current_process(options: &SampleOptions) -> Result<SampleReport, SampleError> {
    platform::sample_current_process_impl(options)
}

#[cfg(target_os = "macos")]
mod platform {
    use super::{SampleError, SampleOptions, Sampler, ThreadSystem, Timebase, mach};
    use powermetrics_types::{CoreUsageSnapshot, KernStatus, LoadBias, SampleReport};

    pub fn compute_load_bias_impl() -> LoadBias {
        mach::compute_load_bias()
    }

    pub fn cpu_usage_snapshot_impl() -> Result<CoreUsageSnapshot, KernStatus> {
        mach::cpu_usage_snapshot()
    }

    pub fn sample_current_process_impl(
        options: &SampleOptions,
    ) -> Result<SampleReport, SampleError> {
        let sampler = Sampler::new(mach::MachThreads::current(), Timebase::native());
        let pid = sampler.system().process_id();
        sampler.sample(pid, options)
    }
}

#[cfg(not(target_os = "macos"))]
mod platform {
    use super::{SampleError, SampleOptions};
    use powermetrics_types::{CoreUsageSnapshot, KernStatus, LoadBias, SampleReport};

    pub fn compute_load_bias_impl() -> LoadBias {
        LoadBias::ZERO
    }

    pub fn cpu_usage_snapshot_impl() -> Result<CoreUsageSnapshot, KernStatus> {
        Err(KernStatus::FAILURE)
    }

    pub fn sample_current_process_impl(
        _options: &SampleOptions,
    ) -> Result<SampleReport, SampleError> {
        Err(SampleError::UnsupportedPlatform {
            target_os: std::env::consts::OS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn native_entry_points_degrade_off_macos() {
        assert_eq!(compute_load_bias(), LoadBias::ZERO);
        assert_eq!(cpu_usage_snapshot(), Err(KernStatus::FAILURE));
        assert_eq!(
            sample_current_process(&SampleOptions::default()),
            Err(SampleError::UnsupportedPlatform {
                target_os: std::env::consts::OS
            })
        );
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn native_pass_over_own_process() {
        let report = sample_current_process(&SampleOptions::default())
            .expect("own process is always sampleable");
        assert_eq!(report.pid, std::process::id() as i32);
        assert!(report.thread_count() >= 1);
    }
}
