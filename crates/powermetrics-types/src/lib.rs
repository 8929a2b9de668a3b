use facet::Facet;
use std::error::Error;
use std::fmt;

/// Default upper bound on the number of frames kept in a [`StackTrace`].
pub const MAX_FRAME_DEPTH: usize = 128;
/// Maximum byte length of a [`ThreadName`].
pub const THREAD_NAME_MAX_BYTES: usize = 64;
/// Maximum byte length of a [`QueueLabel`].
pub const QUEUE_LABEL_MAX_BYTES: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    ZeroAddress,
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroAddress => write!(f, "address must be non-zero"),
        }
    }
}

impl Error for InvariantError {}

/// A raw kernel status code (`kern_return_t`).
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernStatus(i32);

impl KernStatus {
    pub const SUCCESS: Self = Self(0);
    pub const INVALID_ADDRESS: Self = Self(1);
    pub const INVALID_ARGUMENT: Self = Self(4);
    pub const FAILURE: Self = Self(5);
    pub const TERMINATED: Self = Self(37);

    pub fn new(code: i32) -> Self {
        Self(code)
    }
}

impl fmt::Display for KernStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::SUCCESS => "KERN_SUCCESS",
            Self::INVALID_ADDRESS => "KERN_INVALID_ADDRESS",
            Self::INVALID_ARGUMENT => "KERN_INVALID_ARGUMENT",
            Self::FAILURE => "KERN_FAILURE",
            Self::TERMINATED => "KERN_TERMINATED",
            _ => return write!(f, "kern_return {}", self.0),
        };
        write!(f, "{name} ({})", self.0)
    }
}

// ── Stacks ───────────────────────────────────────────────────────

/// One return address captured while unwinding.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressRecord(u64);

impl AddressRecord {
    pub fn new(address: u64) -> Result<Self, InvariantError> {
        if address == 0 {
            return Err(InvariantError::ZeroAddress);
        }
        Ok(Self(address))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Load address of the main executable image, subtracted from captured
/// addresses to make them comparable across runs.
#[derive(Facet, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LoadBias(u64);

impl LoadBias {
    pub const ZERO: Self = Self(0);

    pub fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn normalize(self, address: u64) -> u64 {
        address.saturating_sub(self.0)
    }

    /// Offset of `address` into the main image, or `address` itself when it
    /// lies below the image and has no meaningful offset.
    pub fn relative(self, address: u64) -> u64 {
        match address.checked_sub(self.0) {
            Some(offset) if offset != 0 => offset,
            _ => address,
        }
    }
}

/// A call stack for one thread at one instant, newest frame first.
#[derive(Facet, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StackTrace {
    pub addresses: Vec<AddressRecord>,
}

impl StackTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            addresses: Vec::with_capacity(capacity),
        }
    }

    /// Appends `address`; null addresses are dropped. Returns whether it was kept.
    pub fn push(&mut self, address: u64) -> bool {
        match AddressRecord::new(address) {
            Ok(record) => {
                self.addresses.push(record);
                true
            }
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn raw(&self) -> impl DoubleEndedIterator<Item = u64> + ExactSizeIterator + '_ {
        self.addresses.iter().map(|record| record.get())
    }

    pub fn normalized(&self, bias: LoadBias) -> Vec<u64> {
        self.raw().map(|address| bias.normalize(address)).collect()
    }
}

impl FromIterator<u64> for StackTrace {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut trace = StackTrace::new();
        for address in iter {
            trace.push(address);
        }
        trace
    }
}

// ── Counters ─────────────────────────────────────────────────────

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum CoreClass {
    Performance,
    Efficiency,
}

impl CoreClass {
    pub const ALL: [CoreClass; 2] = [CoreClass::Performance, CoreClass::Efficiency];

    pub fn short_name(self) -> &'static str {
        match self {
            Self::Performance => "P",
            Self::Efficiency => "E",
        }
    }
}

/// Execution counters attributed to one core class.
#[derive(Facet, Debug, Clone, Copy, Default, PartialEq)]
pub struct CoreCounters {
    pub cycles: u64,
    pub energy_joules: f64,
    pub time_seconds: f64,
}

// ── Names ────────────────────────────────────────────────────────

/// Decodes a possibly NUL-terminated byte buffer and truncates the result to
/// at most `max_bytes`, backing off to a char boundary.
fn bounded_text(bytes: &[u8], max_bytes: usize) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let mut text = String::from_utf8_lossy(&bytes[..end]).into_owned();
    if text.len() > max_bytes {
        let mut cut = max_bytes;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

/// The pthread name of a thread, at most [`THREAD_NAME_MAX_BYTES`] bytes.
#[derive(Facet, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ThreadName(String);

impl ThreadName {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bounded_text(bytes, THREAD_NAME_MAX_BYTES))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ThreadName {
    fn from(value: &str) -> Self {
        Self::from_bytes(value.as_bytes())
    }
}

/// The label of the dispatch queue a thread was servicing, at most
/// [`QUEUE_LABEL_MAX_BYTES`] bytes.
#[derive(Facet, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueueLabel(String);

impl QueueLabel {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let text = bounded_text(bytes, QUEUE_LABEL_MAX_BYTES);
        // libdispatch hands out garbage labels starting with a newline for
        // some internal queues.
        if text.starts_with('\n') {
            return Self::default();
        }
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for QueueLabel {
    fn from(value: &str) -> Self {
        Self::from_bytes(value.as_bytes())
    }
}

// ── Samples ──────────────────────────────────────────────────────

/// A per-thread failure that was recovered locally during a sampling pass.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum ThreadFault {
    Identifier(KernStatus),
    Name(KernStatus),
    QueueLabel(KernStatus),
    Counters(KernStatus),
    Suspend(KernStatus),
    Registers(KernStatus),
    Resume(KernStatus),
}

impl fmt::Display for ThreadFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identifier(status) => write!(f, "thread identifier unavailable: {status}"),
            Self::Name(status) => write!(f, "thread name unavailable: {status}"),
            Self::QueueLabel(status) => write!(f, "queue label unavailable: {status}"),
            Self::Counters(status) => write!(f, "thread counters unavailable: {status}"),
            Self::Suspend(status) => write!(f, "thread suspend failed: {status}"),
            Self::Registers(status) => write!(f, "thread register state unavailable: {status}"),
            Self::Resume(status) => write!(f, "thread resume failed: {status}"),
        }
    }
}

/// One thread's sampled state.
#[derive(Facet, Debug, Clone, PartialEq)]
pub struct ThreadSample {
    pub thread_id: u64,
    pub name: ThreadName,
    pub queue_label: QueueLabel,
    pub performance: CoreCounters,
    pub efficiency: CoreCounters,
    pub backtrace: Option<StackTrace>,
    pub faults: Vec<ThreadFault>,
}

impl ThreadSample {
    /// Stored when the kernel thread identifier could not be resolved.
    pub const UNKNOWN_THREAD_ID: u64 = u64::MAX;

    pub fn new(thread_id: u64) -> Self {
        Self {
            thread_id,
            name: ThreadName::default(),
            queue_label: QueueLabel::default(),
            performance: CoreCounters::default(),
            efficiency: CoreCounters::default(),
            backtrace: None,
            faults: Vec::new(),
        }
    }

    pub fn has_known_id(&self) -> bool {
        self.thread_id != Self::UNKNOWN_THREAD_ID
    }

    pub fn counters(&self, class: CoreClass) -> &CoreCounters {
        match class {
            CoreClass::Performance => &self.performance,
            CoreClass::Efficiency => &self.efficiency,
        }
    }

    /// The thread name if one is set, otherwise the thread identifier.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.as_str().to_string();
        }
        if self.has_known_id() {
            format!("Thread 0x{:x}", self.thread_id)
        } else {
            "Thread <unknown>".to_string()
        }
    }
}

/// Output of one sampling pass.
#[derive(Facet, Debug, Clone, PartialEq)]
pub struct SampleReport {
    pub pid: i32,
    pub load_bias: LoadBias,
    pub threads: Vec<ThreadSample>,
}

impl SampleReport {
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn thread(&self, thread_id: u64) -> Option<&ThreadSample> {
        self.threads.iter().find(|t| t.thread_id == thread_id)
    }
}

// ── CPU usage ────────────────────────────────────────────────────

/// Tick counters of a single core.
#[derive(Facet, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreTicks {
    pub system: u64,
    pub user: u64,
    pub nice: u64,
    pub idle: u64,
}

impl CoreTicks {
    pub fn busy(&self) -> u64 {
        self.system + self.user + self.nice
    }

    pub fn total(&self) -> u64 {
        self.busy() + self.idle
    }

    /// Fraction of non-idle ticks, in `0.0..=1.0`.
    pub fn usage(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.busy() as f64 / total as f64,
        }
    }

    /// Fraction of system ticks, in `0.0..=1.0`.
    pub fn system_usage(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.system as f64 / total as f64,
        }
    }

    pub fn saturating_sub(&self, earlier: &CoreTicks) -> CoreTicks {
        CoreTicks {
            system: self.system.saturating_sub(earlier.system),
            user: self.user.saturating_sub(earlier.user),
            nice: self.nice.saturating_sub(earlier.nice),
            idle: self.idle.saturating_sub(earlier.idle),
        }
    }
}

/// Machine-wide per-core tick counters.
#[derive(Facet, Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreUsageSnapshot {
    pub cores: Vec<CoreTicks>,
}

impl CoreUsageSnapshot {
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_trace_drops_null_addresses() {
        let trace: StackTrace = [0x1000, 0, 0x2000, 0].into_iter().collect();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.raw().collect::<Vec<_>>(), vec![0x1000, 0x2000]);
    }

    #[test]
    fn normalized_subtracts_bias_and_saturates() {
        let trace: StackTrace = [0x1_0000_4000, 0x10].into_iter().collect();
        let bias = LoadBias::new(0x1_0000_0000);
        assert_eq!(trace.normalized(bias), vec![0x4000, 0]);
    }

    #[test]
    fn relative_keeps_addresses_below_the_image() {
        let bias = LoadBias::new(0x1_0000_0000);
        assert_eq!(bias.relative(0x1_0000_4000), 0x4000);
        assert_eq!(bias.relative(0x10), 0x10);
        assert_eq!(LoadBias::ZERO.relative(0x10), 0x10);
    }

    #[test]
    fn counters_by_class() {
        let mut sample = ThreadSample::new(1);
        sample.performance.cycles = 7;
        sample.efficiency.cycles = 3;
        let cycles = CoreClass::ALL.map(|class| sample.counters(class).cycles);
        assert_eq!(cycles, [7, 3]);
        assert_eq!(CoreClass::Efficiency.short_name(), "E");
    }

    #[test]
    fn overlong_thread_name_is_truncated() {
        let long = "w".repeat(THREAD_NAME_MAX_BYTES + 40);
        let name = ThreadName::from(long.as_str());
        assert_eq!(name.as_str().len(), THREAD_NAME_MAX_BYTES);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 63 ASCII bytes then a 3-byte char straddling the limit.
        let mut text = "a".repeat(THREAD_NAME_MAX_BYTES - 1);
        text.push('€');
        let name = ThreadName::from(text.as_str());
        assert_eq!(name.as_str(), "a".repeat(THREAD_NAME_MAX_BYTES - 1));
    }

    #[test]
    fn names_stop_at_nul() {
        let name = ThreadName::from_bytes(b"main\0garbage");
        assert_eq!(name.as_str(), "main");
    }

    #[test]
    fn newline_queue_labels_are_empty() {
        assert!(QueueLabel::from_bytes(b"\n\x01junk").is_empty());
        assert_eq!(
            QueueLabel::from("com.apple.main-thread").as_str(),
            "com.apple.main-thread"
        );
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let mut sample = ThreadSample::new(0x2a);
        assert_eq!(sample.display_name(), "Thread 0x2a");
        sample.name = ThreadName::from("worker");
        assert_eq!(sample.display_name(), "worker");
    }

    #[test]
    fn core_ticks_usage() {
        let ticks = CoreTicks {
            system: 10,
            user: 20,
            nice: 10,
            idle: 60,
        };
        assert!((ticks.usage() - 0.4).abs() < 1e-9);
        assert!((ticks.system_usage() - 0.1).abs() < 1e-9);
        assert_eq!(CoreTicks::default().usage(), 0.0);
    }

    #[test]
    fn kern_status_display() {
        assert_eq!(KernStatus::FAILURE.to_string(), "KERN_FAILURE (5)");
        assert_eq!(KernStatus::new(268435459).to_string(), "kern_return 268435459");
    }
}
