//! Guest-facing log level filtering.
//!
//! The crate's own diagnostics go through the regular `log` facade (see the
//! `#[macro_use] extern crate log;` in `lib.rs`, same as the teacher). The
//! guest's `log_trace`/`log_debug`/... ABI calls are a separate, lower-trust
//! channel: they are filtered against a configured priority threshold and
//! handed to whatever [`Logger`] the host installed via
//! [`crate::options::PluginOptions::logger`], defaulting to forwarding into
//! `log` itself.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    /// Never forwards anything; used to fully mute guest logging.
    Silent,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Warn
    }
}

/// Receives guest-originated log lines that passed the configured
/// [`LogLevel`] threshold.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Forwards into the process-wide `log` facade, matching the teacher's
/// default behavior of logging unrouted guest console output at `info`.
pub struct DefaultLogger;

impl Logger for DefaultLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => trace!("[guest] {}", message),
            LogLevel::Debug => debug!("[guest] {}", message),
            LogLevel::Info => info!("[guest] {}", message),
            LogLevel::Warn => warn!("[guest] {}", message),
            LogLevel::Error => error!("[guest] {}", message),
            LogLevel::Silent => {}
        }
    }
}

/// Bundles a [`Logger`] with the threshold it should be filtered at.
#[derive(Clone)]
pub struct LogSink {
    pub logger: Arc<dyn Logger>,
    pub level: LogLevel,
}

impl Default for LogSink {
    fn default() -> Self {
        LogSink {
            logger: Arc::new(DefaultLogger),
            level: LogLevel::default(),
        }
    }
}

impl LogSink {
    pub fn new(logger: Arc<dyn Logger>, level: LogLevel) -> Self {
        LogSink { logger, level }
    }

    /// Forwards `message` at `level` iff it passes the configured threshold.
    pub fn emit(&self, level: LogLevel, message: &str) {
        if self.level == LogLevel::Silent {
            return;
        }
        if level >= self.level {
            self.logger.log(level, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CapturingLogger(Mutex<Vec<(LogLevel, String)>>);

    impl Logger for CapturingLogger {
        fn log(&self, level: LogLevel, message: &str) {
            self.0.lock().unwrap().push((level, message.to_string()));
        }
    }

    #[test]
    fn filters_below_threshold() {
        let captured = Arc::new(CapturingLogger(Mutex::new(Vec::new())));
        let sink = LogSink::new(captured.clone(), LogLevel::Warn);
        sink.emit(LogLevel::Debug, "should be dropped");
        sink.emit(LogLevel::Error, "should pass");
        let got = captured.0.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, "should pass");
    }

    #[test]
    fn silent_drops_everything() {
        let captured = Arc::new(CapturingLogger(Mutex::new(Vec::new())));
        let sink = LogSink::new(captured.clone(), LogLevel::Silent);
        sink.emit(LogLevel::Error, "dropped too");
        assert!(captured.0.lock().unwrap().is_empty());
    }
}
