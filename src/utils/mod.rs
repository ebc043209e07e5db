//! Shared utilities: logging and crate-wide macros.

pub mod log;

/// Logs an info-level message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::utils::log::log($crate::utils::log::Level::Info, &format!($($arg)*))
    };
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::utils::log::log($crate::utils::log::Level::Warn, &format!($($arg)*))
    };
}

/// Logs an error-level message.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::utils::log::log($crate::utils::log::Level::Error, &format!($($arg)*))
    };
}

/// Logs an error-level message and aborts the process.
///
/// Reserved for invariant violations where continuing would silently corrupt
/// consensus-critical state (e.g. a failed sharded state merge).
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::utils::log::log($crate::utils::log::Level::Error, &format!($($arg)*));
        ::std::process::abort();
    }};
}
