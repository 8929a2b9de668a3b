use crate::power::PowerSample;
use std::collections::VecDeque;
use std::num::NonZeroUsize;

/// Fixed-capacity buffer that overwrites its oldest element when full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    elements: VecDeque<T>,
    capacity: NonZeroUsize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            elements: VecDeque::with_capacity(capacity.get()),
            capacity,
        }
    }

    pub fn push(&mut self, element: T) {
        if self.elements.len() == self.capacity.get() {
            self.elements.pop_front();
        }
        self.elements.push_back(element);
    }

    /// Oldest first.
    pub fn elements(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator + '_ {
        self.elements.iter()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Recent power samples and the highest total power among them.
#[derive(Debug, Clone)]
pub struct SampleHistory {
    samples: RingBuffer<PowerSample>,
    max_power: f64,
}

impl SampleHistory {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            samples: RingBuffer::new(capacity),
            max_power: 0.0,
        }
    }

    pub fn add(&mut self, sample: PowerSample) {
        self.samples.push(sample);
        self.max_power = self
            .samples
            .elements()
            .map(|s| s.all_threads.total())
            .fold(0.0, f64::max);
    }

    pub fn samples(
        &self,
    ) -> impl DoubleEndedIterator<Item = &PowerSample> + ExactSizeIterator + '_ {
        self.samples.elements()
    }

    /// Highest total power of any stored sample, in watts.
    pub fn max_power(&self) -> f64 {
        self.max_power
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::CombinedPower;

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn sample(watts: f64) -> PowerSample {
        PowerSample {
            all_threads: CombinedPower {
                performance: watts,
                efficiency: 0.0,
            },
            ..PowerSample::default()
        }
    }

    #[test]
    fn ring_buffer_keeps_insertion_order_until_full() {
        let mut ring = RingBuffer::new(capacity(3));
        assert!(ring.is_empty());
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.elements().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn ring_buffer_overwrites_oldest() {
        let mut ring = RingBuffer::new(capacity(3));
        for i in 1..=5 {
            ring.push(i);
        }
        assert_eq!(ring.elements().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(ring.elements().next_back(), Some(&5));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn capacity_of_one() {
        let mut ring = RingBuffer::new(capacity(1));
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.elements().collect::<Vec<_>>(), vec![&"b"]);
    }

    #[test]
    fn max_power_tracks_stored_samples_only() {
        let mut history = SampleHistory::new(capacity(2));
        history.add(sample(9.0));
        history.add(sample(1.0));
        assert_eq!(history.max_power(), 9.0);
        history.add(sample(2.0));
        assert_eq!(history.max_power(), 2.0);
        let stored: Vec<f64> = history.samples().map(|s| s.all_threads.total()).collect();
        assert_eq!(stored, vec![1.0, 2.0]);
    }
}
