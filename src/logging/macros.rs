// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging macros; the format arguments are only evaluated when the level is enabled

/// ```ignore
/// log_error!(logger, Facility::Builder, "no interface for flow {}", flow_id);
/// ```
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $facility:expr, $($arg:tt)+) => {
        if $logger.enabled($crate::logging::Severity::Error, $facility) {
            $logger.error($facility, &format!($($arg)+))
        }
    };
}

#[macro_export]
macro_rules! log_warning {
    ($logger:expr, $facility:expr, $($arg:tt)+) => {
        if $logger.enabled($crate::logging::Severity::Warning, $facility) {
            $logger.warning($facility, &format!($($arg)+))
        }
    };
}

#[macro_export]
macro_rules! log_notice {
    ($logger:expr, $facility:expr, $($arg:tt)+) => {
        if $logger.enabled($crate::logging::Severity::Notice, $facility) {
            $logger.notice($facility, &format!($($arg)+))
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $facility:expr, $($arg:tt)+) => {
        if $logger.enabled($crate::logging::Severity::Info, $facility) {
            $logger.info($facility, &format!($($arg)+))
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $facility:expr, $($arg:tt)+) => {
        if $logger.enabled($crate::logging::Severity::Debug, $facility) {
            $logger.debug($facility, &format!($($arg)+))
        }
    };
}

/// Log about a specific flow id
///
/// ```ignore
/// log_flow!(logger, Severity::Debug, Facility::Loss, flow_id, "LOSS gap={}", gap);
/// ```
#[macro_export]
macro_rules! log_flow {
    ($logger:expr, $severity:expr, $facility:expr, $flow:expr, $($arg:tt)+) => {
        if $logger.enabled($severity, $facility) {
            $logger.log_flow($severity, $facility, $flow, &format!($($arg)+))
        }
    };
}
