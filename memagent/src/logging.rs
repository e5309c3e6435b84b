//! Level-tagged logging that either prints (`Normal` mode) or forwards every
//! record to the host runtime (`Embedded` mode).

use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{Level, LevelFilter, Metadata, Record};

use crate::config::{AgentConfig, ServerMode};

/// Host log sink. Levels follow the wire enum:
/// 0 = TRACE, 1 = DEBUG, 2 = INFO, 3 = WARN, 4 = ERROR.
pub type HostLogFn = extern "C" fn(level: c_int, message: *const c_char);

// Stored as usize so registration is lock-free; 0 means "no handler".
static HOST_LOG: AtomicUsize = AtomicUsize::new(0);

pub fn set_host_handler(handler: Option<HostLogFn>) {
    let raw = handler.map_or(0, |f| f as usize);
    HOST_LOG.store(raw, Ordering::Release);
}

fn host_handler() -> Option<HostLogFn> {
    let raw = HOST_LOG.load(Ordering::Acquire);
    if raw == 0 {
        None
    } else {
        // Round-trips the fn pointer stored by set_host_handler.
        Some(unsafe { std::mem::transmute::<usize, HostLogFn>(raw) })
    }
}

pub fn level_to_wire(level: Level) -> c_int {
    match level {
        Level::Trace => 0,
        Level::Debug => 1,
        Level::Info => 2,
        Level::Warn => 3,
        Level::Error => 4,
    }
}

struct HostForwardLogger;

impl log::Log for HostForwardLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let Some(handler) = host_handler() else {
            // Embedded mode without a registered sink: drop the record
            // rather than touching stdout.
            return;
        };
        let message = format!("[memagent] {}", record.args());
        if let Ok(c_message) = CString::new(message) {
            handler(level_to_wire(record.level()), c_message.as_ptr());
        }
    }

    fn flush(&self) {}
}

static HOST_FORWARD_LOGGER: HostForwardLogger = HostForwardLogger;

/// Install the logger for the given mode. Safe to call more than once; only
/// the first installation takes effect.
pub fn init(mode: ServerMode) {
    match mode {
        ServerMode::Normal => {
            let cfg = AgentConfig::from_env();
            let _ = env_logger::Builder::new()
                .parse_filters(&cfg.log_filter)
                .try_init();
        }
        ServerMode::Embedded => {
            if log::set_logger(&HOST_FORWARD_LOGGER).is_ok() {
                log::set_max_level(LevelFilter::Debug);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    static LAST_LEVEL: AtomicI32 = AtomicI32::new(-1);

    extern "C" fn capture(level: c_int, message: *const c_char) {
        assert!(!message.is_null());
        LAST_LEVEL.store(level, Ordering::SeqCst);
    }

    #[test]
    fn wire_levels_match_host_enum() {
        assert_eq!(level_to_wire(Level::Trace), 0);
        assert_eq!(level_to_wire(Level::Debug), 1);
        assert_eq!(level_to_wire(Level::Info), 2);
        assert_eq!(level_to_wire(Level::Warn), 3);
        assert_eq!(level_to_wire(Level::Error), 4);
    }

    #[test]
    fn handler_registration_round_trip() {
        // Without a handler, records are dropped rather than written out.
        set_host_handler(None);
        log::Log::log(
            &HOST_FORWARD_LOGGER,
            &Record::builder()
                .args(format_args!("ignored"))
                .level(Level::Info)
                .build(),
        );
        assert_eq!(LAST_LEVEL.load(Ordering::SeqCst), -1);

        set_host_handler(Some(capture));
        log::Log::log(
            &HOST_FORWARD_LOGGER,
            &Record::builder()
                .args(format_args!("hello"))
                .level(Level::Warn)
                .build(),
        );
        assert_eq!(LAST_LEVEL.load(Ordering::SeqCst), 3);
        set_host_handler(None);
    }
}
