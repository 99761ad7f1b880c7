//! Crate-internal logging macros.
//!
//! With the `logging` feature each level forwards to the matching `tracing`
//! macro, so events keep their module path as target. Without it only errors
//! reach stderr; the other levels still type-check their arguments but emit
//! nothing.

#![allow(unused_macros)]

#[cfg(feature = "logging")]
macro_rules! log_at {
    (error, $($arg:tt)*) => { tracing::error!($($arg)*) };
    (warn, $($arg:tt)*) => { tracing::warn!($($arg)*) };
    (info, $($arg:tt)*) => { tracing::info!($($arg)*) };
    (debug, $($arg:tt)*) => { tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_at {
    (error, $($arg:tt)*) => {
        eprintln!("labwire: {}", format_args!($($arg)*))
    };
    ($level:ident, $($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => { $crate::macros::log_at!(error, $($arg)*) };
}

macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::macros::log_at!(warn, $($arg)*) };
}

macro_rules! log_info {
    ($($arg:tt)*) => { $crate::macros::log_at!(info, $($arg)*) };
}

macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::macros::log_at!(debug, $($arg)*) };
}

pub(crate) use log_at;
pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
