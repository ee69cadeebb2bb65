// ABOUTME: Connection-level configuration consumed by the transport and multiplexer
// ABOUTME: Mirrors the recognized options table from the external interfaces section

use std::fmt;
use std::sync::Arc;

use crate::status::StatusCode;

/// Structured log event, delivered to an optional embedder-supplied sink in
/// addition to (not instead of) this crate's own `tracing` instrumentation.
#[derive(Debug, Clone)]
pub enum LogEvent {
    StreamOpened { stream_id: u16, method: String },
    StreamClosed { stream_id: u16, code: StatusCode },
    ProtocolViolation { stream_id: u16, detail: String },
    ConnectionClosed { cause: Option<String> },
}

/// Sentinel for `output_buffer_size`: use the transport's built-in default.
pub const OUTPUT_BUFFER_SIZE_DEFAULT: i64 = -1;

/// Recognized configuration options for a connection.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Bytes of write coalescing; `0` disables, negative uses the default.
    pub output_buffer_size: i64,
    /// Permit the transport to coalesce multiple queued frames into one
    /// underlying write.
    pub merge_writes: bool,
    /// Bounds the stream-id search on wraparound.
    pub max_concurrent_streams: u32,
    /// Initial lease size requested from the buffer pool.
    pub default_buffer_size: usize,
    /// Optional bound on the outbound writer queue; `None` is unbounded
    /// (the default), matching the "bound is the transport write rate"
    /// back-pressure model.
    pub outbound_queue_bound: Option<usize>,
    /// Optional structured log sink.
    pub logger: Option<Arc<dyn Fn(LogEvent) + Send + Sync>>,
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("output_buffer_size", &self.output_buffer_size)
            .field("merge_writes", &self.merge_writes)
            .field("max_concurrent_streams", &self.max_concurrent_streams)
            .field("default_buffer_size", &self.default_buffer_size)
            .field("outbound_queue_bound", &self.outbound_queue_bound)
            .field("logger", &self.logger.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            output_buffer_size: OUTPUT_BUFFER_SIZE_DEFAULT,
            merge_writes: true,
            max_concurrent_streams: 1024,
            default_buffer_size: 8 * 1024,
            outbound_queue_bound: None,
            logger: None,
        }
    }
}

impl ConnectionOptions {
    pub fn output_buffer_size(mut self, size: i64) -> Self {
        self.output_buffer_size = size;
        self
    }

    pub fn merge_writes(mut self, merge: bool) -> Self {
        self.merge_writes = merge;
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn default_buffer_size(mut self, size: usize) -> Self {
        self.default_buffer_size = size;
        self
    }

    pub fn outbound_queue_bound(mut self, bound: Option<usize>) -> Self {
        self.outbound_queue_bound = bound;
        self
    }

    pub fn logger<F>(mut self, logger: F) -> Self
    where
        F: Fn(LogEvent) + Send + Sync + 'static,
    {
        self.logger = Some(Arc::new(logger));
        self
    }

    pub(crate) fn emit(&self, event: LogEvent) {
        if let Some(logger) = &self.logger {
            logger(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recognized_option_defaults() {
        let opts = ConnectionOptions::default();
        assert_eq!(opts.max_concurrent_streams, 1024);
        assert!(opts.merge_writes);
        assert_eq!(opts.output_buffer_size, OUTPUT_BUFFER_SIZE_DEFAULT);
    }

    #[test]
    fn builder_setters_chain() {
        let opts = ConnectionOptions::default()
            .max_concurrent_streams(16)
            .merge_writes(false)
            .default_buffer_size(4096);
        assert_eq!(opts.max_concurrent_streams, 16);
        assert!(!opts.merge_writes);
        assert_eq!(opts.default_buffer_size, 4096);
    }

    #[test]
    fn logger_callback_is_invoked() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let opts = ConnectionOptions::default().logger(move |_event| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        opts.emit(LogEvent::ConnectionClosed { cause: None });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
