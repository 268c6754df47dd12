//! Kernel logging
//!
//! Each record is formatted on the stack as
//! `[LEVEL target] message\r\n` and handed to the registered [`LogSink`].
//! Nothing is buffered; records logged before a sink exists are lost.

use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Once;

/// Longest formatted record; longer ones are truncated
pub const MAX_RECORD_LEN: usize = 256;

/// Byte-oriented output, usually the UART transmit routine
pub type LogSink = fn(&[u8]);

/// Stack buffer a record is formatted into
pub struct MessageBuffer {
    data: [u8; MAX_RECORD_LEN],
    len: usize,
}

impl MessageBuffer {
    /// Empty buffer
    pub const fn new() -> Self {
        Self {
            data: [0; MAX_RECORD_LEN],
            len: 0,
        }
    }

    /// Formatted bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Whether the buffer filled up
    pub fn is_full(&self) -> bool {
        self.len == MAX_RECORD_LEN
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let to_copy = bytes.len().min(MAX_RECORD_LEN - self.len);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

impl core::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageBuffer").field("len", &self.len).finish()
    }
}

/// The `log` backend
#[derive(Debug)]
pub struct KernelLogger {
    sink: Once<LogSink>,
}

impl KernelLogger {
    /// Logger without a sink
    pub const fn new() -> Self {
        Self { sink: Once::new() }
    }

    /// Route output to `sink`; only the first call has an effect
    pub fn set_sink(&self, sink: LogSink) {
        self.sink.call_once(|| sink);
    }

    /// Format `record` the way it is written out
    pub fn format(record: &Record<'_>) -> MessageBuffer {
        let mut buf = MessageBuffer::new();
        let _ = write!(buf, "[{:<5} {}] {}", record.level(), record.target(), record.args());
        if buf.is_full() {
            buf.len = MAX_RECORD_LEN - 2;
        }
        let _ = buf.write_str("\r\n");
        buf
    }
}

impl Default for KernelLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = self.sink.get() {
            sink(Self::format(record).as_bytes());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger::new();

/// Install the kernel logger writing to `sink` at `level`
pub fn init_logger(sink: LogSink, level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.set_sink(sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;
    use spin::Mutex;

    static CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    fn capture(bytes: &[u8]) {
        CAPTURED.lock().extend_from_slice(bytes);
    }

    #[test]
    fn test_record_format() {
        let buf = KernelLogger::format(
            &Record::builder()
                .level(Level::Warn)
                .target("emmc")
                .args(format_args!("retry {}", 2))
                .build(),
        );
        assert_eq!(buf.as_bytes(), b"[WARN  emmc] retry 2\r\n");
    }

    #[test]
    fn test_long_record_truncated() {
        let long = "x".repeat(400);
        let buf = KernelLogger::format(
            &Record::builder()
                .level(Level::Info)
                .target("t")
                .args(format_args!("{}", long))
                .build(),
        );
        assert_eq!(buf.as_bytes().len(), MAX_RECORD_LEN);
        assert!(buf.as_bytes().ends_with(b"xx\r\n"));
    }

    #[test]
    fn test_logger_without_sink_drops_records() {
        let logger = KernelLogger::new();
        logger.log(&Record::builder().level(Level::Error).args(format_args!("lost")).build());
        assert!(logger.sink.get().is_none());
    }

    #[test]
    fn test_init_logger_routes_to_sink() {
        init_logger(capture, LevelFilter::Info).unwrap();
        log::debug!(target: "test", "hidden");
        log::info!(target: "test", "hello {}", 42);

        let captured = CAPTURED.lock();
        let text = core::str::from_utf8(&captured).unwrap();
        assert!(text.contains("[INFO  test] hello 42\r\n"));
        assert!(!text.contains("hidden"));

        // A second logger cannot be installed
        assert!(init_logger(capture, LevelFilter::Trace).is_err());
    }
}
