//! Assertion sink for expectation mismatches, timeouts, and driver
//! failures.
//!
//! The harness never aborts on a failed expectation; it formats a message
//! and hands it to the installed sink. The hosting test runtime decides
//! what a report means. The default sink routes to the `log` facade.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use lazy_static::lazy_static;
use log::error;

/// Receiver for failure reports.
pub trait FailureSink: Send + Sync {
    fn report(&self, message: &str);
}

struct LogSink;

impl FailureSink for LogSink {
    fn report(&self, message: &str) {
        error!("test failure: {}", message);
    }
}

lazy_static! {
    static ref SINK: RwLock<Arc<dyn FailureSink>> = RwLock::new(Arc::new(LogSink));
}

/// Install a process-wide sink, returning the previous one.
pub fn set_sink(sink: Arc<dyn FailureSink>) -> Arc<dyn FailureSink> {
    std::mem::replace(&mut *SINK.write().unwrap(), sink)
}

/// Format and deliver a failure report to the global sink. Prefer the
/// [`test_failure!`](crate::test_failure) macro.
pub fn report(args: fmt::Arguments<'_>) {
    let sink = Arc::clone(&*SINK.read().unwrap());
    sink.report(&args.to_string());
}

/// Report a formatted test failure to the global sink.
#[macro_export]
macro_rules! test_failure {
    ($($arg:tt)*) => {
        $crate::failure::report(::core::format_args!($($arg)*))
    };
}

/// Sink that accumulates reports for later inspection by tests.
#[derive(Default)]
pub struct FailureRecorder {
    messages: Mutex<Vec<String>>,
}

impl FailureRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return everything reported so far.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.messages.lock().unwrap())
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.contains(needle))
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().unwrap().is_empty()
    }
}

impl FailureSink for FailureRecorder {
    fn report(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}
