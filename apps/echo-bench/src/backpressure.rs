pub const DEFAULT_THRESHOLD: usize = 32 * 1024;

/// Drop decision for outbound pongs; fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressurePolicy {
    pub enabled: bool,
    pub threshold: usize,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl BackpressurePolicy {
    pub fn should_send(&self, buffered_bytes: usize) -> bool {
        should_send(buffered_bytes, self.enabled, self.threshold)
    }
}

pub fn should_send(buffered_bytes: usize, enabled: bool, threshold: usize) -> bool {
    !(enabled && buffered_bytes > threshold)
}
