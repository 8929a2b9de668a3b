//! Power drawn between two consecutive sampling passes.

use facet::Facet;
use powermetrics_types::{
    CoreClass, QueueLabel, SampleReport, ThreadFault, ThreadName, ThreadSample,
};
use std::collections::HashMap;
use std::ops::{Add, AddAssign};
use std::time::Instant;
use tracing::debug;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Watts, split by core class.
#[derive(Facet, Debug, Clone, Copy, Default, PartialEq)]
pub struct CombinedPower {
    pub performance: f64,
    pub efficiency: f64,
}

impl CombinedPower {
    pub const ZERO: Self = Self {
        performance: 0.0,
        efficiency: 0.0,
    };

    pub fn total(&self) -> f64 {
        self.performance + self.efficiency
    }

    pub fn get(&self, class: CoreClass) -> f64 {
        match class {
            CoreClass::Performance => self.performance,
            CoreClass::Efficiency => self.efficiency,
        }
    }

    pub fn get_mut(&mut self, class: CoreClass) -> &mut f64 {
        match class {
            CoreClass::Performance => &mut self.performance,
            CoreClass::Efficiency => &mut self.efficiency,
        }
    }
}

impl Add for CombinedPower {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            performance: self.performance + rhs.performance,
            efficiency: self.efficiency + rhs.efficiency,
        }
    }
}

impl AddAssign for CombinedPower {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

#[derive(Facet, Debug, Clone, PartialEq)]
pub struct ThreadPower {
    pub thread_id: u64,
    /// Small stable number handed out in order of first appearance.
    pub counter: u32,
    pub name: ThreadName,
    pub queue_label: QueueLabel,
    pub power: CombinedPower,
    /// Energy used since the previous pass, in watt-hours.
    pub energy_wh: f64,
}

#[derive(Facet, Debug, Clone, Default, PartialEq)]
pub struct PowerSample {
    pub elapsed_seconds: f64,
    pub all_threads: CombinedPower,
    /// Threads seen in both this pass and the previous one, sorted by id.
    pub threads: Vec<ThreadPower>,
    /// Every thread enumerated in this pass.
    pub thread_count: usize,
    pub energy_wh: f64,
}

impl PowerSample {
    pub fn thread(&self, thread_id: u64) -> Option<&ThreadPower> {
        self.threads.iter().find(|t| t.thread_id == thread_id)
    }
}

/// Cumulative joules of one thread, indexed like [`CoreClass::ALL`].
type ClassEnergy = [f64; CoreClass::ALL.len()];

#[derive(Debug, Default)]
pub struct PowerTracker {
    previous: HashMap<u64, ClassEnergy>,
    last_pass: Option<Instant>,
    counters: HashMap<u64, u32>,
    last_counter: u32,
    total_energy_wh: f64,
}

impl PowerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Energy used by all sampled threads since creation or the last
    /// [`reset_energy`](Self::reset_energy), in watt-hours.
    pub fn total_energy_wh(&self) -> f64 {
        self.total_energy_wh
    }

    pub fn reset_energy(&mut self) {
        self.total_energy_wh = 0.0;
    }

    pub fn ingest(&mut self, report: &SampleReport, now: Instant) -> PowerSample {
        let elapsed_seconds = self
            .last_pass
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);

        let mut ordered: Vec<&ThreadSample> = report
            .threads
            .iter()
            .filter(|t| t.has_known_id())
            .collect();
        ordered.sort_by_key(|t| t.thread_id);

        let mut sample = PowerSample {
            elapsed_seconds,
            thread_count: report.thread_count(),
            ..PowerSample::default()
        };
        let mut next = HashMap::with_capacity(ordered.len());

        for thread in ordered {
            let counter = self.counter_for(thread.thread_id);
            if has_counter_fault(thread) {
                continue;
            }
            let current: ClassEnergy =
                CoreClass::ALL.map(|class| thread.counters(class).energy_joules);
            next.insert(thread.thread_id, current);

            let Some(previous) = self.previous.get(&thread.thread_id) else {
                continue;
            };

            let mut power = CombinedPower::ZERO;
            let mut joules = 0.0;
            for (i, class) in CoreClass::ALL.into_iter().enumerate() {
                let delta = energy_delta(previous[i], current[i]);
                *power.get_mut(class) = watts(delta, elapsed_seconds);
                joules += delta;
            }
            let energy_wh = joules / SECONDS_PER_HOUR;

            sample.all_threads += power;
            sample.energy_wh += energy_wh;
            sample.threads.push(ThreadPower {
                thread_id: thread.thread_id,
                counter,
                name: thread.name.clone(),
                queue_label: thread.queue_label.clone(),
                power,
                energy_wh,
            });
        }

        self.previous = next;
        self.last_pass = Some(now);
        self.total_energy_wh += sample.energy_wh;

        debug!(
            threads = sample.threads.len(),
            watts = sample.all_threads.total(),
            elapsed_seconds,
            "power computed"
        );
        sample
    }

    fn counter_for(&mut self, thread_id: u64) -> u32 {
        let last_counter = &mut self.last_counter;
        *self.counters.entry(thread_id).or_insert_with(|| {
            *last_counter += 1;
            *last_counter
        })
    }
}

fn has_counter_fault(thread: &ThreadSample) -> bool {
    thread
        .faults
        .iter()
        .any(|fault| matches!(fault, ThreadFault::Counters(_)))
}

/// Joules consumed between two readings. Counters only grow, so a drop means
/// the id now names a different thread and the reading starts over.
fn energy_delta(previous: f64, current: f64) -> f64 {
    (current - previous).max(0.0)
}

fn watts(joules: f64, seconds: f64) -> f64 {
    if joules == 0.0 || seconds <= 0.0 {
        0.0
    } else {
        joules / seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powermetrics_types::{KernStatus, LoadBias};
    use std::time::Duration;

    fn thread(id: u64, p_joules: f64, e_joules: f64) -> ThreadSample {
        let mut sample = ThreadSample::new(id);
        sample.performance.energy_joules = p_joules;
        sample.efficiency.energy_joules = e_joules;
        sample
    }

    fn report(threads: Vec<ThreadSample>) -> SampleReport {
        SampleReport {
            pid: 1,
            load_bias: LoadBias::ZERO,
            threads,
        }
    }

    #[test]
    fn first_pass_reports_no_power() {
        let mut tracker = PowerTracker::new();
        let sample = tracker.ingest(&report(vec![thread(1, 5.0, 1.0)]), Instant::now());
        assert!(sample.threads.is_empty());
        assert_eq!(sample.thread_count, 1);
        assert_eq!(sample.all_threads, CombinedPower::ZERO);
    }

    #[test]
    fn two_joules_over_one_second_is_two_watts() {
        let t0 = Instant::now();
        let mut tracker = PowerTracker::new();
        tracker.ingest(&report(vec![thread(1, 10.0, 3.0)]), t0);
        let sample = tracker.ingest(
            &report(vec![thread(1, 12.0, 3.0)]),
            t0 + Duration::from_secs(1),
        );

        let power = sample.thread(1).unwrap().power;
        assert!((power.get(CoreClass::Performance) - 2.0).abs() < 1e-9);
        assert_eq!(power.get(CoreClass::Efficiency), 0.0);
        assert!((sample.all_threads.total() - 2.0).abs() < 1e-9);
        assert!((sample.energy_wh - 2.0 / 3600.0).abs() < 1e-12);
        assert!((tracker.total_energy_wh() - 2.0 / 3600.0).abs() < 1e-12);

        tracker.reset_energy();
        assert_eq!(tracker.total_energy_wh(), 0.0);
    }

    #[test]
    fn new_threads_contribute_from_their_second_pass() {
        let t0 = Instant::now();
        let second = Duration::from_secs(1);
        let mut tracker = PowerTracker::new();
        tracker.ingest(&report(vec![thread(1, 0.0, 0.0)]), t0);
        let sample = tracker.ingest(
            &report(vec![thread(1, 1.0, 0.0), thread(2, 50.0, 0.0)]),
            t0 + second,
        );
        assert_eq!(sample.threads.len(), 1);
        assert_eq!(sample.thread_count, 2);

        let sample = tracker.ingest(
            &report(vec![thread(2, 51.0, 0.5), thread(1, 1.0, 0.0)]),
            t0 + second * 2,
        );
        let ids: Vec<u64> = sample.threads.iter().map(|t| t.thread_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!((sample.thread(2).unwrap().power.total() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn counters_are_stable_and_monotonic() {
        let t0 = Instant::now();
        let mut tracker = PowerTracker::new();
        tracker.ingest(&report(vec![thread(30, 0.0, 0.0), thread(10, 0.0, 0.0)]), t0);
        let sample = tracker.ingest(
            &report(vec![thread(10, 0.0, 0.0), thread(30, 0.0, 0.0), thread(20, 0.0, 0.0)]),
            t0 + Duration::from_millis(500),
        );
        assert_eq!(sample.thread(10).unwrap().counter, 1);
        assert_eq!(sample.thread(30).unwrap().counter, 2);
        assert_eq!(tracker.counter_for(20), 3);
    }

    #[test]
    fn unknown_and_faulted_threads_are_skipped() {
        let t0 = Instant::now();
        let mut faulted = thread(2, 0.0, 0.0);
        faulted.faults.push(ThreadFault::Counters(KernStatus::FAILURE));
        let unknown = thread(ThreadSample::UNKNOWN_THREAD_ID, 0.0, 0.0);

        let mut tracker = PowerTracker::new();
        tracker.ingest(&report(vec![thread(2, 10.0, 0.0), unknown.clone()]), t0);
        let sample = tracker.ingest(
            &report(vec![faulted, thread(ThreadSample::UNKNOWN_THREAD_ID, 9.0, 9.0)]),
            t0 + Duration::from_secs(1),
        );
        assert!(sample.threads.is_empty());
        assert_eq!(sample.all_threads, CombinedPower::ZERO);
    }

    #[test]
    fn zero_elapsed_time_yields_zero_power() {
        let t0 = Instant::now();
        let mut tracker = PowerTracker::new();
        tracker.ingest(&report(vec![thread(1, 0.0, 0.0)]), t0);
        let sample = tracker.ingest(&report(vec![thread(1, 3.0, 0.0)]), t0);
        assert_eq!(sample.thread(1).unwrap().power, CombinedPower::ZERO);
        assert!(sample.energy_wh > 0.0);
    }
}
