use std::time::Duration;
use tokio::time::Instant;

/// Decides which progress reports reach the queue
///
/// A report passes when `interval` has elapsed since the last one that
/// passed, or when `chunk_bytes` more bytes have moved, whichever comes
/// first. The first report always passes.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    chunk_bytes: u64,
    last_emit: Option<(Instant, u64)>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, chunk_bytes: u64) -> Self {
        Self {
            interval,
            chunk_bytes: chunk_bytes.max(1),
            last_emit: None,
        }
    }

    pub fn should_emit(&mut self, now: Instant, transferred: u64) -> bool {
        let due = match self.last_emit {
            None => true,
            Some((at, bytes)) => {
                now.saturating_duration_since(at) >= self.interval
                    || transferred.saturating_sub(bytes) >= self.chunk_bytes
            }
        };
        if due {
            self.last_emit = Some((now, transferred));
        }
        due
    }
}
