//! Kernel-style logging: plain stderr writes gated by an env-configured
//! level, no `log`/`tracing` facade underneath.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use crate::env::{env_get_bool, env_get_str};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> LogLevel {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Reads `VEO_LOG_DEBUG` (bool, shorthand for level=Debug) and
/// `VEO_LOG_LEVEL` (0-5, takes precedence if set) plus `VEO_LOG_FLUSH` and
/// `VEO_LOG_TIME`. Idempotent; safe to call from every macro invocation.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }
    START_TIME.get_or_init(Instant::now);

    let mut level = if env_get_bool("VEO_LOG_DEBUG", false) {
        LogLevel::Debug
    } else {
        LogLevel::Warn
    };
    if let Some(raw) = env_get_str("VEO_LOG_LEVEL") {
        if let Ok(n) = raw.parse::<u8>() {
            level = LogLevel::from_u8(n);
        }
    }
    LOG_LEVEL.store(level as u8, Ordering::Release);
    FLUSH_ENABLED.store(env_get_bool("VEO_LOG_FLUSH", false), Ordering::Release);
    TIME_ENABLED.store(env_get_bool("VEO_LOG_TIME", false), Ordering::Release);
}

pub fn set_level(level: LogLevel) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Release);
}

pub fn current_level() -> LogLevel {
    init();
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Acquire))
}

pub fn enabled(level: LogLevel) -> bool {
    init();
    (level as u8) <= LOG_LEVEL.load(Ordering::Acquire)
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    init();
    if !enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut lock = stderr.lock();
    if TIME_ENABLED.load(Ordering::Acquire) {
        let elapsed = START_TIME.get().map(|t| t.elapsed()).unwrap_or_default();
        let _ = write!(lock, "[{:>10.6}] ", elapsed.as_secs_f64());
    }
    let _ = writeln!(lock, "[aveo:{}] {}", level.prefix(), args);
    if FLUSH_ENABLED.load(Ordering::Acquire) {
        let _ = lock.flush();
    }
}

#[macro_export]
macro_rules! veo_error {
    ($($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! veo_warn {
    ($($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! veo_info {
    ($($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! veo_debug {
    ($($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! veo_trace {
    ($($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Trace, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn from_u8_saturates_to_trace() {
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
    }

    #[test]
    fn set_level_changes_enabled() {
        set_level(LogLevel::Error);
        assert!(enabled(LogLevel::Error));
        assert!(!enabled(LogLevel::Trace));
        set_level(LogLevel::Trace);
        assert!(enabled(LogLevel::Trace));
    }

    #[test]
    fn macros_do_not_panic() {
        set_level(LogLevel::Trace);
        veo_error!("err {}", 1);
        veo_warn!("warn");
        veo_info!("info {}", "x");
        veo_debug!("debug");
        veo_trace!("trace");
    }
}
