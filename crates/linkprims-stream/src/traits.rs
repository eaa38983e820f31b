use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::error::Result;

/// Timeouts and buffer sizing shared by all streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// `None` blocks until data arrives or the stream is disconnected.
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Maximum bytes returned by one `read`.
    pub read_chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: Some(Duration::from_secs(10)),
            connect_timeout: Duration::from_secs(5),
            read_chunk_size: 64 * 1024,
        }
    }
}

impl StreamConfig {
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// A raw, unframed byte link.
///
/// All methods take `&self`: implementations lock their read and write halves
/// separately so one thread can block in [`Stream::read`] while another
/// writes, and [`Stream::disconnect`] from any thread wakes a blocked reader.
pub trait Stream: Send + Sync {
    /// Short transport name for diagnostics.
    fn name(&self) -> &'static str;

    fn connect(&self) -> Result<()>;

    fn connected(&self) -> bool;

    /// Block for the next available bytes.
    ///
    /// Returns `Err(StreamError::Closed)` at end of stream and
    /// `Err(StreamError::Timeout)` when the read timeout elapses.
    fn read(&self) -> Result<BytesMut>;

    /// Write all of `data`.
    fn write(&self, data: &[u8]) -> Result<()>;

    fn disconnect(&self);
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Park a reader of a one-directional stream until it is disconnected.
pub(crate) fn wait_until_disconnected(connected: impl Fn() -> bool) -> Result<BytesMut> {
    while connected() {
        std::thread::sleep(IDLE_POLL_INTERVAL);
    }
    Err(crate::error::StreamError::Closed)
}

/// Time left before `deadline`, `None` meaning no deadline.
pub(crate) fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}
