//! Leveled diagnostic logging.
//!
//! The heap reports notable events (initialization, pool escalation, ignored
//! or rejected releases) through the `trace!`..`error!` macros. Messages are
//! forwarded to a sink installed once by the firmware, typically a UART or
//! RTT writer. Until a sink is installed every message is dropped.
//!
//! [`LockedHeap`](crate::LockedHeap) calls the sink only after releasing its
//! lock, so a sink may allocate from the heap it observes.

use core::fmt;

use spin::Once;

macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log($level, format_args!($($arg)*));
    };
}

macro_rules! trace {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Trace, $($arg)*);
    };
}

macro_rules! debug {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Debug, $($arg)*);
    };
}

macro_rules! info {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Info, $($arg)*);
    };
}

macro_rules! warn {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Warn, $($arg)*);
    };
}

macro_rules! error {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Error, $($arg)*);
    };
}

/// Receives every message at or above the configured level.
pub type Sink = fn(LogLevel, fmt::Arguments<'_>);

struct Logger {
    sink: Sink,
    min_level: LogLevel,
}

static LOGGER: Once<Logger> = Once::new();

/// Installs the log sink.
///
/// Only the first call has an effect; returns `false` if a sink was already
/// installed. The sink never runs while a [`LockedHeap`](crate::LockedHeap)
/// lock is held.
pub fn set_sink(sink: Sink, min_level: LogLevel) -> bool {
    let mut installed = false;
    LOGGER.call_once(|| {
        installed = true;
        Logger { sink, min_level }
    });
    installed
}

pub fn log(level: LogLevel, message: fmt::Arguments<'_>) {
    if let Some(logger) = LOGGER.get().filter(|logger| level >= logger.min_level) {
        (logger.sink)(level, message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}
