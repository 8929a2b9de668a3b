//! One sampling pass over every thread of the calling process.

use crate::remote::TaskMemory;
use crate::timebase::Timebase;
use crate::unwind::{Termination, ThreadControl, UnwindOptions, unwind_thread};
use powermetrics_types::{
    CoreCounters, KernStatus, LoadBias, QueueLabel, SampleReport, ThreadFault, ThreadName,
    ThreadSample,
};
use std::error::Error;
use std::fmt;
use tracing::{debug, warn};

/// Counters for one perf level as the kernel reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawCoreCounters {
    pub cycles: u64,
    pub user_time_ticks: u64,
    pub system_time_ticks: u64,
    pub energy_nanojoules: u64,
}

impl RawCoreCounters {
    pub fn convert(&self, timebase: Timebase) -> CoreCounters {
        CoreCounters {
            cycles: self.cycles,
            energy_joules: self.energy_nanojoules as f64 / 1e9,
            time_seconds: timebase
                .ticks_to_seconds(self.user_time_ticks.saturating_add(self.system_time_ticks)),
        }
    }
}

/// Raw counters of one thread, split by perf level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawThreadCounters {
    pub performance: RawCoreCounters,
    pub efficiency: RawCoreCounters,
}

/// Everything the sampler needs from the operating system.
pub trait ThreadSystem: ThreadControl + TaskMemory {
    fn process_id(&self) -> i32;
    fn threads(&self) -> Result<Vec<Self::Thread>, KernStatus>;
    fn thread_id(&self, thread: &Self::Thread) -> Result<u64, KernStatus>;
    /// Raw, possibly NUL-terminated pthread name. Empty when unnamed.
    fn thread_name(&self, thread: &Self::Thread) -> Result<Vec<u8>, KernStatus>;
    /// Raw label of the dispatch queue the thread is servicing, if any.
    fn queue_label(&self, thread: &Self::Thread) -> Result<Option<Vec<u8>>, KernStatus>;
    fn thread_counters(&self, pid: i32, thread_id: u64) -> Result<RawThreadCounters, KernStatus>;
    fn load_bias(&self) -> LoadBias;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleOptions {
    pub capture_queue_labels: bool,
    pub capture_stacks: bool,
    pub unwind: UnwindOptions,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            capture_queue_labels: true,
            capture_stacks: false,
            unwind: UnwindOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    Enumeration(KernStatus),
    ForeignProcess { requested: i32, current: i32 },
    UnsupportedPlatform { target_os: &'static str },
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enumeration(status) => write!(f, "failed to enumerate threads: {status}"),
            Self::ForeignProcess { requested, current } => write!(
                f,
                "cannot sample pid {requested}: only the calling process ({current}) can be introspected"
            ),
            Self::UnsupportedPlatform { target_os } => {
                write!(
                    f,
                    "unsupported platform for thread sampling: {target_os}; only macOS is implemented"
                )
            }
        }
    }
}

impl Error for SampleError {}

pub struct Sampler<S> {
    system: S,
    timebase: Timebase,
}

impl<S: ThreadSystem> Sampler<S> {
    pub fn new(system: S, timebase: Timebase) -> Self {
        Self { system, timebase }
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    pub fn timebase(&self) -> Timebase {
        self.timebase
    }

    /// Sample every thread of `pid`, which must be the calling process.
    ///
    /// Only a failed thread enumeration fails the pass; everything else is
    /// recorded as a [`ThreadFault`] on the affected thread.
    pub fn sample(&self, pid: i32, options: &SampleOptions) -> Result<SampleReport, SampleError> {
        let current = self.system.process_id();
        if pid != current {
            return Err(SampleError::ForeignProcess {
                requested: pid,
                current,
            });
        }

        let threads = self.system.threads().map_err(SampleError::Enumeration)?;
        let load_bias = if options.capture_stacks {
            self.system.load_bias()
        } else {
            LoadBias::ZERO
        };

        let samples: Vec<ThreadSample> = threads
            .iter()
            .map(|thread| self.sample_thread(pid, thread, options))
            .collect();

        debug!(
            pid,
            threads = samples.len(),
            faulted = samples.iter().filter(|s| !s.faults.is_empty()).count(),
            "sampling pass complete"
        );

        Ok(SampleReport {
            pid,
            load_bias,
            threads: samples,
        })
    }

    fn sample_thread(&self, pid: i32, thread: &S::Thread, options: &SampleOptions) -> ThreadSample {
        let system = &self.system;

        let mut sample = match system.thread_id(thread) {
            Ok(thread_id) => ThreadSample::new(thread_id),
            Err(status) => {
                warn!(%status, "thread identifier unavailable");
                let mut sample = ThreadSample::new(ThreadSample::UNKNOWN_THREAD_ID);
                sample.faults.push(ThreadFault::Identifier(status));
                sample
            }
        };
        let thread_id = sample.thread_id;

        match system.thread_name(thread) {
            Ok(bytes) => sample.name = ThreadName::from_bytes(&bytes),
            Err(status) => {
                debug!(thread_id, %status, "thread name unavailable");
                sample.faults.push(ThreadFault::Name(status));
            }
        }

        if options.capture_queue_labels {
            match system.queue_label(thread) {
                Ok(Some(bytes)) => sample.queue_label = QueueLabel::from_bytes(&bytes),
                Ok(None) => {}
                Err(status) => {
                    debug!(thread_id, %status, "queue label unavailable");
                    sample.faults.push(ThreadFault::QueueLabel(status));
                }
            }
        }

        let counters = if sample.has_known_id() {
            system.thread_counters(pid, thread_id)
        } else {
            Err(KernStatus::INVALID_ARGUMENT)
        };
        match counters {
            Ok(raw) => {
                sample.performance = raw.performance.convert(self.timebase);
                sample.efficiency = raw.efficiency.convert(self.timebase);
            }
            Err(status) => {
                debug!(thread_id, %status, "thread counters unavailable; reporting zero");
                sample.faults.push(ThreadFault::Counters(status));
            }
        }

        if options.capture_stacks {
            let unwind = unwind_thread(system, thread, &options.unwind);
            match unwind.termination {
                Termination::SuspendFailed(status) => {
                    sample.faults.push(ThreadFault::Suspend(status));
                }
                Termination::RegistersUnavailable(status) => {
                    sample.faults.push(ThreadFault::Registers(status));
                }
                Termination::NullFrame | Termination::MaxDepth | Termination::ReadFailed(_) => {}
            }
            if let Some(status) = unwind.resume_failure {
                sample.faults.push(ThreadFault::Resume(status));
            }
            sample.backtrace = Some(unwind.trace);
        }

        sample
    }
}
