//! Minimal pluggable logging, in the spirit of the bespoke `println!`/`info!`/
//! `error!` macros of a framebuffer-backed bootloader, but retargeted at a
//! `Logger` trait object the embedding application installs instead of a
//! VGA console. Defaults to a no-op sink so the crate works standalone.

use core::fmt::Arguments;
use spin::Once;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A sink for core log records. Implementations must be safe to call from
/// within the single global volume mutex: no reentrant calls back into the
/// core.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, target: &str, args: Arguments<'_>);
}

struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: Level, _target: &str, _args: Arguments<'_>) {}
}

static NULL_LOGGER: NullLogger = NullLogger;
static LOGGER: Once<&'static dyn Logger> = Once::new();

/// Install the process-wide logger. Only the first call has effect; later
/// calls are ignored rather than panicking, so logging before
/// `set_logger` is simply discarded.
pub fn set_logger(logger: &'static dyn Logger) {
    LOGGER.call_once(|| logger);
}

#[doc(hidden)]
pub fn dispatch(level: Level, target: &str, args: Arguments<'_>) {
    let logger = *LOGGER.get().unwrap_or(&(&NULL_LOGGER as &dyn Logger));
    logger.log(level, target, args);
}

#[macro_export]
macro_rules! trace {
    ($target:literal, $($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Level::Trace, $target, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($target:literal, $($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Level::Debug, $target, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($target:literal, $($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Level::Info, $target, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($target:literal, $($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Level::Warn, $target, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($target:literal, $($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Level::Error, $target, format_args!($($arg)*))
    };
}
