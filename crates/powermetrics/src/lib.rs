//! Power accounting on top of `powermetrics-capture`: watts per thread and
//! core class between passes, a bounded history, and an energy-weighted call
//! tree of sampled stacks.

mod config;
mod graph;
mod history;
mod power;
mod usage;

pub use config::{
    ConfigError, HISTORY_ENV, INTERVAL_ENV, MAX_FRAMES_ENV, PowerMetricsConfig, QUEUE_LABELS_ENV,
    STACKS_ENV,
};
pub use graph::{BacktraceGraph, CallNode};
pub use history::{RingBuffer, SampleHistory};
pub use power::{CombinedPower, PowerSample, PowerTracker, ThreadPower};
pub use usage::{CpuUsage, CpuUsageTracker};

pub use powermetrics_capture::{SampleError, SampleOptions, Sampler, ThreadSystem, Timebase};
pub use powermetrics_types as types;

use parking_lot::Mutex;
use powermetrics_types::SampleReport;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// The outcome of one [`PowerMetrics::sample_once`] call.
#[derive(Debug, Clone)]
pub struct Pass {
    pub report: SampleReport,
    pub power: PowerSample,
}

pub struct PowerMetrics<S> {
    sampler: Sampler<S>,
    config: PowerMetricsConfig,
    options: SampleOptions,
    power: PowerTracker,
    history: Arc<Mutex<SampleHistory>>,
    graph: BacktraceGraph,
}

impl<S: ThreadSystem> PowerMetrics<S> {
    pub fn new(sampler: Sampler<S>, config: PowerMetricsConfig) -> Self {
        Self {
            options: config.sample_options(),
            history: Arc::new(Mutex::new(SampleHistory::new(config.stored_samples))),
            sampler,
            config,
            power: PowerTracker::new(),
            graph: BacktraceGraph::new(),
        }
    }

    pub fn config(&self) -> &PowerMetricsConfig {
        &self.config
    }

    pub fn sampler(&self) -> &Sampler<S> {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> &mut Sampler<S> {
        &mut self.sampler
    }

    /// Shared handle to the stored samples, readable from other threads.
    pub fn history(&self) -> Arc<Mutex<SampleHistory>> {
        Arc::clone(&self.history)
    }

    pub fn graph(&self) -> &BacktraceGraph {
        &self.graph
    }

    pub fn total_energy_wh(&self) -> f64 {
        self.power.total_energy_wh()
    }

    pub fn reset_energy(&mut self) {
        self.power.reset_energy();
    }

    /// Sample the calling process once. `now` should come from the same
    /// monotonic clock on every call; power is computed against the previous
    /// call's `now`.
    pub fn sample_once(&mut self, now: Instant) -> Result<Pass, SampleError> {
        let pid = self.sampler.system().process_id();
        let report = self.sampler.sample(pid, &self.options)?;
        let power = self.power.ingest(&report, now);

        if self.options.capture_stacks {
            for thread in &report.threads {
                let (Some(trace), Some(thread_power)) =
                    (&thread.backtrace, power.thread(thread.thread_id))
                else {
                    continue;
                };
                self.graph.insert(trace, report.load_bias, thread_power.energy_wh);
            }
        }

        self.history.lock().add(power.clone());
        debug!(
            threads = report.thread_count(),
            watts = power.all_threads.total(),
            total_energy_wh = self.power.total_energy_wh(),
            "pass recorded"
        );
        Ok(Pass { report, power })
    }
}

#[cfg(target_os = "macos")]
impl PowerMetrics<powermetrics_capture::MachThreads> {
    /// Sampling of the calling process through Mach.
    pub fn native(config: PowerMetricsConfig) -> Self {
        let sampler = Sampler::new(
            powermetrics_capture::MachThreads::current(),
            Timebase::native(),
        );
        Self::new(sampler, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powermetrics_capture::testing::{FakeSystem, FakeThread, FakeThreadHandle};
    use powermetrics_capture::{RawCoreCounters, RawThreadCounters};
    use powermetrics_types::LoadBias;
    use std::num::NonZeroUsize;
    use std::time::Duration;

    const BIAS: u64 = 0x1_0000_0000;

    fn counters(p_nanojoules: u64, e_nanojoules: u64) -> RawThreadCounters {
        RawThreadCounters {
            performance: RawCoreCounters {
                energy_nanojoules: p_nanojoules,
                ..RawCoreCounters::default()
            },
            efficiency: RawCoreCounters {
                energy_nanojoules: e_nanojoules,
                ..RawCoreCounters::default()
            },
        }
    }

    fn worker(p_nanojoules: u64) -> FakeThread {
        FakeThread::new(11)
            .named("worker")
            .with_frame_pointer(0x7000)
            .with_counters(counters(p_nanojoules, 0))
    }

    fn metrics(config: PowerMetricsConfig) -> (PowerMetrics<FakeSystem>, FakeThreadHandle) {
        let mut system = FakeSystem::new();
        system.set_load_bias(LoadBias::new(BIAS));
        // The middle frame lies below the image, e.g. in a JIT region.
        system
            .memory
            .push_frame_chain(0x7000, &[BIAS + 0x30, 0x2000, BIAS + 0x10]);
        let handle = system.add_thread(worker(0));
        system.add_thread(FakeThread::new(12).named("idle"));
        let sampler = Sampler::new(system, Timebase::NANOSECONDS);
        (PowerMetrics::new(sampler, config), handle)
    }

    fn with_stacks() -> PowerMetricsConfig {
        PowerMetricsConfig {
            capture_stacks: true,
            ..PowerMetricsConfig::default()
        }
    }

    #[test]
    fn power_between_passes() {
        let (mut metrics, handle) = metrics(PowerMetricsConfig::default());
        let t0 = Instant::now();

        let first = metrics.sample_once(t0).unwrap();
        assert_eq!(first.report.thread_count(), 2);
        assert!(first.power.threads.is_empty());

        metrics
            .sampler_mut()
            .system_mut()
            .update_thread(handle, worker(2_000_000_000));
        let second = metrics.sample_once(t0 + Duration::from_secs(1)).unwrap();

        let worker = second.power.thread(11).unwrap();
        assert_eq!(worker.name.as_str(), "worker");
        assert!((worker.power.performance - 2.0).abs() < 1e-9);
        assert!((second.power.all_threads.total() - 2.0).abs() < 1e-9);
        assert!((metrics.total_energy_wh() - 2.0 / 3600.0).abs() < 1e-12);
        assert!(second.report.threads.iter().all(|t| t.backtrace.is_none()));
        assert!(metrics.graph().is_empty());
    }

    #[test]
    fn stacks_feed_the_graph_with_thread_energy() {
        let (mut metrics, handle) = metrics(with_stacks());
        let t0 = Instant::now();
        metrics.sample_once(t0).unwrap();
        assert!(metrics.graph().is_empty());

        metrics
            .sampler_mut()
            .system_mut()
            .update_thread(handle, worker(3_600_000_000));
        metrics.sample_once(t0 + Duration::from_secs(1)).unwrap();

        let graph = metrics.graph();
        assert_eq!(graph.roots().len(), 1);
        let root = graph.root(0x10).unwrap();
        assert!((root.energy_wh - 0.001).abs() < 1e-12);
        let leaf = root.child(0x2000).and_then(|n| n.child(0x30)).unwrap();
        assert!((leaf.energy_wh - 0.001).abs() < 1e-12);
    }

    #[test]
    fn history_is_shared_and_bounded() {
        let config = PowerMetricsConfig {
            stored_samples: NonZeroUsize::new(2).unwrap(),
            ..PowerMetricsConfig::default()
        };
        let (mut metrics, _) = metrics(config);
        let history = metrics.history();
        let t0 = Instant::now();
        for i in 0..3 {
            metrics.sample_once(t0 + Duration::from_millis(500 * i)).unwrap();
        }

        let reader = std::thread::spawn(move || history.lock().len());
        assert_eq!(reader.join().unwrap(), 2);
    }

    #[test]
    fn reset_energy_clears_running_total() {
        let (mut metrics, handle) = metrics(PowerMetricsConfig::default());
        let t0 = Instant::now();
        metrics.sample_once(t0).unwrap();
        metrics
            .sampler_mut()
            .system_mut()
            .update_thread(handle, worker(1_000_000_000));
        metrics.sample_once(t0 + Duration::from_secs(1)).unwrap();
        assert!(metrics.total_energy_wh() > 0.0);
        metrics.reset_energy();
        assert_eq!(metrics.total_energy_wh(), 0.0);
    }

    #[test]
    fn enumeration_failure_propagates() {
        let (mut metrics, _) = metrics(PowerMetricsConfig::default());
        metrics
            .sampler_mut()
            .system_mut()
            .fail_enumeration(powermetrics_types::KernStatus::FAILURE);
        assert!(matches!(
            metrics.sample_once(Instant::now()),
            Err(SampleError::Enumeration(_))
        ));
    }
}
