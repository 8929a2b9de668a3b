/// Conversion between monotonic clock ticks and nanoseconds.
///
/// Query it once with [`Timebase::native`] and hand it to the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    pub numer: u32,
    pub denom: u32,
}

impl Default for Timebase {
    fn default() -> Self {
        Self::NANOSECONDS
    }
}

impl Timebase {
    /// One tick per nanosecond.
    pub const NANOSECONDS: Self = Self { numer: 1, denom: 1 };

    pub fn new(numer: u32, denom: u32) -> Self {
        Self { numer, denom }
    }

    #[cfg(target_os = "macos")]
    pub fn native() -> Self {
        let mut info = libc::mach_timebase_info_data_t { numer: 0, denom: 0 };
        let rc = unsafe { libc::mach_timebase_info(&mut info) };
        if rc != 0 || info.numer == 0 || info.denom == 0 {
            tracing::warn!(rc, "mach_timebase_info failed; assuming nanosecond ticks");
            return Self::NANOSECONDS;
        }
        Self::new(info.numer, info.denom)
    }

    #[cfg(not(target_os = "macos"))]
    pub fn native() -> Self {
        Self::NANOSECONDS
    }

    pub fn ticks_to_nanos(self, ticks: u64) -> f64 {
        let denom = self.denom.max(1);
        ticks as f64 * f64::from(self.numer) / f64::from(denom)
    }

    pub fn ticks_to_seconds(self, ticks: u64) -> f64 {
        self.ticks_to_nanos(ticks) / 1e9
    }
}
