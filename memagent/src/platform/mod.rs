//! Uniform process-introspection contract over the three OS models.
//!
//! Each backend exposes the same operations with identical semantics:
//! process/module enumeration, a normalized region map, memory I/O with the
//! short-read/`-errno` contract, suspend/resume, and binary path lookup.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;
        pub use linux::*;
    } else if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        mod darwin;
        pub use darwin::*;
    } else if #[cfg(windows)] {
        mod windows;
        pub use windows::*;
    } else {
        compile_error!("unsupported target platform");
    }
}

/// PID of the process hosting the agent.
pub fn current_pid() -> i32 {
    std::process::id() as i32
}

#[cfg(unix)]
pub fn page_size() -> usize {
    // _SC_PAGESIZE is always available; fall back to the common page size
    // should the sysconf ever report an error.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

#[cfg(windows)]
pub fn page_size() -> usize {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_matches_std() {
        assert_eq!(current_pid(), std::process::id() as i32);
    }

    #[test]
    fn page_size_is_a_power_of_two() {
        let sz = page_size();
        assert!(sz >= 4096);
        assert_eq!(sz & (sz - 1), 0);
    }
}
