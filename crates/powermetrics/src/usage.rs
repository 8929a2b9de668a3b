use facet::Facet;
use powermetrics_types::{CoreTicks, CoreUsageSnapshot};
use tracing::debug;

/// Ticks spent by each core between two snapshots.
#[derive(Facet, Debug, Clone, Default, PartialEq)]
pub struct CpuUsage {
    pub cores: Vec<CoreTicks>,
}

impl CpuUsage {
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Busy share of all ticks across every core, from 0 to 1.
    pub fn overall(&self) -> f64 {
        let (busy, total) = self
            .cores
            .iter()
            .fold((0u64, 0u64), |(busy, total), core| {
                (busy + core.busy(), total + core.total())
            });
        if total == 0 {
            0.0
        } else {
            busy as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct CpuUsageTracker {
    previous: Option<CoreUsageSnapshot>,
}

impl CpuUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `snapshot` as the new baseline and return the per-core deltas
    /// since the previous one. `None` on the first call, or when the core
    /// count changed in between.
    pub fn update(&mut self, snapshot: CoreUsageSnapshot) -> Option<CpuUsage> {
        let previous = self.previous.replace(snapshot);
        let (Some(previous), Some(current)) = (previous, self.previous.as_ref()) else {
            return None;
        };
        if previous.core_count() != current.core_count() {
            debug!(
                before = previous.core_count(),
                after = current.core_count(),
                "core count changed; restarting usage baseline"
            );
            return None;
        }
        Some(CpuUsage {
            cores: current
                .cores
                .iter()
                .zip(&previous.cores)
                .map(|(now, before)| now.saturating_sub(before))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticks(system: u64, user: u64, nice: u64, idle: u64) -> CoreTicks {
        CoreTicks {
            system,
            user,
            nice,
            idle,
        }
    }

    fn snapshot(cores: Vec<CoreTicks>) -> CoreUsageSnapshot {
        CoreUsageSnapshot { cores }
    }

    #[test]
    fn first_update_is_baseline() {
        let mut tracker = CpuUsageTracker::new();
        assert!(tracker.update(snapshot(vec![ticks(1, 1, 0, 8)])).is_none());
    }

    #[test]
    fn deltas_between_snapshots() {
        let mut tracker = CpuUsageTracker::new();
        tracker.update(snapshot(vec![ticks(10, 20, 0, 70), ticks(0, 0, 0, 100)]));
        let usage = tracker
            .update(snapshot(vec![ticks(15, 30, 0, 75), ticks(0, 50, 0, 150)]))
            .unwrap();
        assert_eq!(usage.core_count(), 2);
        assert_eq!(usage.cores[0], ticks(5, 10, 0, 5));
        assert_eq!(usage.cores[0].usage(), 0.75);
        assert_eq!(usage.cores[1].usage(), 0.5);
        assert!((usage.overall() - 65.0 / 120.0).abs() < 1e-12);
    }

    #[test]
    fn counter_wrap_saturates() {
        let mut tracker = CpuUsageTracker::new();
        tracker.update(snapshot(vec![ticks(100, 100, 100, 100)]));
        let usage = tracker.update(snapshot(vec![ticks(5, 200, 100, 100)])).unwrap();
        assert_eq!(usage.cores[0], ticks(0, 100, 0, 0));
    }

    #[test]
    fn core_count_change_restarts_baseline() {
        let mut tracker = CpuUsageTracker::new();
        tracker.update(snapshot(vec![ticks(1, 1, 1, 1)]));
        assert!(tracker.update(snapshot(vec![ticks(1, 1, 1, 1); 2])).is_none());
        assert!(tracker.update(snapshot(vec![ticks(2, 2, 2, 2); 2])).is_some());
    }
}
