//! Error reporter and the debug flag it shares with the rest of the runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::CoreError;

/// Runtime-wide debug switch.
///
/// When set, method and handler decoration is skipped and [`ErrorReporter::report`]
/// returns the error instead of logging it.
#[derive(Clone, Debug, Default)]
pub struct DebugFlag(Arc<AtomicBool>);

impl DebugFlag {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }
}

/// Logs runtime errors, or hands them back to the caller in debug mode.
#[derive(Clone, Debug, Default)]
pub struct ErrorReporter {
    debug: DebugFlag,
}

impl ErrorReporter {
    pub fn new(debug: DebugFlag) -> Self {
        Self { debug }
    }

    pub fn debug_flag(&self) -> &DebugFlag {
        &self.debug
    }

    pub fn is_debug(&self) -> bool {
        self.debug.is_enabled()
    }

    /// Logs an error message.
    pub fn log(&self, msg: impl AsRef<str>) {
        tracing::error!(target: "corekit", "{}", msg.as_ref());
    }

    /// Returns the error in debug mode, logs it otherwise.
    pub fn report(&self, err: CoreError) -> Result<(), CoreError> {
        if self.is_debug() {
            return Err(err);
        }
        self.log(err.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_logs_outside_debug_mode() {
        let reporter = ErrorReporter::new(DebugFlag::new(false));
        assert!(reporter.report(CoreError::not_found("x")).is_ok());
    }

    #[test]
    fn report_returns_error_in_debug_mode() {
        let flag = DebugFlag::new(false);
        let reporter = ErrorReporter::new(flag.clone());
        flag.set(true);

        let err = reporter.report(CoreError::not_found("x")).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { module } if module == "x"));
    }
}
