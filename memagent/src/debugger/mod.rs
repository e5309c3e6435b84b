//! Hardware debugger core: a fixed set of watchpoint/breakpoint slots
//! multiplexed across all threads of one attached target, an exception
//! server, and the disable → single-step → re-arm resume pattern.
//!
//! The slot table and register encodings are portable; the thread-state and
//! exception-port plumbing is ARM64 Mach. Other platforms expose the same
//! entry points and report `KERN_FAILURE`.

pub mod arm64;
pub mod slots;

#[cfg(all(any(target_os = "macos", target_os = "ios"), target_arch = "aarch64"))]
mod mach;

use slots::SlotError;

// Kernel status codes surfaced through the ABI. Numerically identical to
// the Mach constants on every platform.
pub const KERN_SUCCESS: i32 = 0;
pub const KERN_INVALID_ARGUMENT: i32 = 4;
pub const KERN_FAILURE: i32 = 5;
pub const KERN_RESOURCE_SHORTAGE: i32 = 6;

/// Map a slot-table error onto the kernel status surfaced through the ABI.
pub fn status_for(err: &SlotError) -> i32 {
    match err {
        SlotError::InvalidSize(_) | SlotError::InvalidHitCount => KERN_INVALID_ARGUMENT,
        SlotError::Exhausted(_) => KERN_RESOURCE_SHORTAGE,
    }
}

/// Debug event reported to the host as one JSON line through the log path,
/// addresses in hex.
#[derive(serde::Serialize)]
struct DebugEvent<'a> {
    event: &'a str,
    index: usize,
    address: String,
    pc: String,
}

pub fn notification_json(event: &str, index: usize, address: u64, pc: u64) -> String {
    serde_json::to_string(&DebugEvent {
        event,
        index,
        address: format!("{address:#x}"),
        pc: format!("{pc:#x}"),
    })
    .unwrap_or_default()
}

cfg_if::cfg_if! {
    if #[cfg(all(any(target_os = "macos", target_os = "ios"), target_arch = "aarch64"))] {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::{Arc, Mutex};
        use std::thread::JoinHandle;

        use log::{error, info, warn};
        use once_cell::sync::OnceCell;

        use slots::{Hit, SlotKind, SlotTable, StepState, WatchKind};

        static DEBUGGER: OnceCell<Mutex<Debugger>> = OnceCell::new();

        pub struct Debugger {
            pid: i32,
            task: mach::TaskPort,
            exception_port: mach::PortName,
            slots: SlotTable,
            shutdown: Arc<AtomicBool>,
            server: Option<JoinHandle<()>>,
        }

        impl Debugger {
            fn attach(pid: i32) -> Result<Self, i32> {
                let task = mach::task_port(pid)?;
                let exception_port = mach::install_exception_port(task)?;
                let shutdown = Arc::new(AtomicBool::new(false));
                let server = mach::spawn_exception_server(exception_port, Arc::clone(&shutdown));
                info!("[memagent] debugger attached to pid {pid}");
                Ok(Self {
                    pid,
                    task,
                    exception_port,
                    slots: SlotTable::new(),
                    shutdown,
                    server: Some(server),
                })
            }

            fn set_watchpoint(&mut self, address: u64, size: u8, kind: WatchKind) -> i32 {
                let install = match self.slots.install_watchpoint(address, size, kind) {
                    Ok(install) => install,
                    Err(err) => {
                        warn!("[memagent] set_watchpoint({address:#x}): {err}");
                        return status_for(&err);
                    }
                };
                if install.already_installed {
                    return KERN_SUCCESS;
                }
                self.program_watchpoint(install.index, address, size, kind);
                KERN_SUCCESS
            }

            fn remove_watchpoint(&mut self, address: u64) -> i32 {
                let Some(index) = self.slots.remove_watchpoint(address) else {
                    return KERN_INVALID_ARGUMENT;
                };
                self.clear_slot(SlotKind::Watchpoint, index);
                KERN_SUCCESS
            }

            fn set_breakpoint(&mut self, address: u64, target_count: u64) -> i32 {
                let install = match self.slots.install_breakpoint(address, target_count) {
                    Ok(install) => install,
                    Err(err) => {
                        warn!("[memagent] set_breakpoint({address:#x}): {err}");
                        return status_for(&err);
                    }
                };
                if install.already_installed {
                    return KERN_SUCCESS;
                }
                self.program_breakpoint(install.index, address);
                KERN_SUCCESS
            }

            fn remove_breakpoint(&mut self, address: u64) -> i32 {
                let Some(index) = self.slots.remove_breakpoint(address) else {
                    return KERN_INVALID_ARGUMENT;
                };
                self.clear_slot(SlotKind::Breakpoint, index);
                KERN_SUCCESS
            }

            /// Program one watchpoint slot on every thread of the task.
            /// Per-thread failures are logged and skipped so a single dead
            /// thread does not abort the whole install.
            fn program_watchpoint(&self, index: usize, address: u64, size: u8, kind: WatchKind) {
                let value = arm64::watch_value(address);
                let control = arm64::watch_control(address, size, kind);
                for thread in mach::task_thread_list(self.task) {
                    if let Err(kr) = mach::write_watch_slot(thread, index, value, control) {
                        warn!(
                            "[memagent] failed to program watchpoint {index} on thread {thread}: {kr}"
                        );
                    }
                    mach::release_port(thread);
                }
            }

            fn program_breakpoint(&self, index: usize, address: u64) {
                let value = arm64::break_value(address);
                let control = arm64::break_control();
                for thread in mach::task_thread_list(self.task) {
                    if let Err(kr) = mach::write_break_slot(thread, index, value, control) {
                        warn!(
                            "[memagent] failed to program breakpoint {index} on thread {thread}: {kr}"
                        );
                    }
                    mach::release_port(thread);
                }
            }

            fn clear_slot(&self, kind: SlotKind, index: usize) {
                for thread in mach::task_thread_list(self.task) {
                    let result = match kind {
                        SlotKind::Watchpoint => mach::write_watch_slot(thread, index, 0, 0),
                        SlotKind::Breakpoint => mach::write_break_slot(thread, index, 0, 0),
                    };
                    if let Err(kr) = result {
                        warn!("[memagent] failed to clear slot {index} on thread {thread}: {kr}");
                    }
                    mach::release_port(thread);
                }
            }

            /// Exception dispatch. Runs with the debugger lock held; returns
            /// the status the exception server sends back to the kernel.
            fn handle_exception(&mut self, thread: mach::PortName, exception: i32, code: &[i64]) -> i32 {
                if exception != mach::EXC_BREAKPOINT {
                    return KERN_FAILURE;
                }

                match self.slots.step_state() {
                    StepState::None => {
                        if code.first() == Some(&mach::EXC_ARM_DA_DEBUG) {
                            let data_address = code.get(1).copied().unwrap_or(0) as u64;
                            match self.slots.on_watchpoint_hit(data_address) {
                                Some(hit) => self.begin_step(thread, hit, data_address),
                                None => {
                                    warn!(
                                        "[memagent] unmatched watchpoint exception at {data_address:#x}"
                                    );
                                    KERN_SUCCESS
                                }
                            }
                        } else {
                            let pc = mach::thread_pc(thread).unwrap_or(0);
                            match self.slots.on_breakpoint_hit(pc) {
                                Some(hit) => self.begin_step(thread, hit, pc),
                                None => {
                                    // A step exception whose slot was removed
                                    // mid-flight lands here; leaving SS set
                                    // would re-raise forever.
                                    let _ = mach::set_single_step(thread, false);
                                    warn!("[memagent] unmatched breakpoint exception at {pc:#x}");
                                    KERN_SUCCESS
                                }
                            }
                        }
                    }
                    StepState::Watchpoint(_) | StepState::Breakpoint(_) => self.complete_step(thread),
                }
            }

            /// Disable the fired slot on this thread and arm a one-instruction
            /// step; re-entering the faulting instruction with the trigger
            /// still armed would loop forever.
            fn begin_step(&mut self, thread: mach::PortName, hit: Hit, address: u64) -> i32 {
                let pc = mach::thread_pc(thread).unwrap_or(0);
                if hit.notify {
                    let event = match hit.kind {
                        SlotKind::Watchpoint => "watchpoint",
                        SlotKind::Breakpoint => "breakpoint",
                    };
                    info!("{}", notification_json(event, hit.index, address, pc));
                }

                let result = match hit.kind {
                    SlotKind::Watchpoint => mach::write_watch_slot(thread, hit.index, 0, 0),
                    SlotKind::Breakpoint => mach::write_break_slot(thread, hit.index, 0, 0),
                };
                if let Err(kr) = result {
                    error!("[memagent] failed to disable slot {} for stepping: {kr}", hit.index);
                }
                if let Err(kr) = mach::set_single_step(thread, true) {
                    error!("[memagent] failed to arm single step: {kr}");
                }
                KERN_SUCCESS
            }

            /// The step retired: re-arm the recorded slot and drop out of
            /// single-step mode.
            fn complete_step(&mut self, thread: mach::PortName) -> i32 {
                let Some(done) = self.slots.on_single_step() else {
                    let _ = mach::set_single_step(thread, false);
                    return KERN_SUCCESS;
                };
                let result = match done.kind {
                    SlotKind::Watchpoint => match self.slots.watchpoint(done.index) {
                        Some(slot) => mach::write_watch_slot(
                            thread,
                            done.index,
                            arm64::watch_value(slot.address),
                            arm64::watch_control(slot.address, slot.size, slot.kind),
                        ),
                        None => Ok(()),
                    },
                    SlotKind::Breakpoint => match self.slots.breakpoint(done.index) {
                        Some(slot) => mach::write_break_slot(
                            thread,
                            done.index,
                            arm64::break_value(slot.address),
                            arm64::break_control(),
                        ),
                        None => Ok(()),
                    },
                };
                if let Err(kr) = result {
                    error!("[memagent] failed to re-arm slot {} after step: {kr}", done.index);
                }
                if let Err(kr) = mach::set_single_step(thread, false) {
                    error!("[memagent] failed to clear single step: {kr}");
                }
                if done.kind == SlotKind::Watchpoint {
                    info!("{}", notification_json("resumed", done.index, 0, mach::thread_pc(thread).unwrap_or(0)));
                }
                KERN_SUCCESS
            }
        }

        impl Drop for Debugger {
            fn drop(&mut self) {
                info!("[memagent] shutting down debugger for pid {}", self.pid);
                self.shutdown.store(true, Ordering::SeqCst);
                if let Some(server) = self.server.take() {
                    let _ = server.join();
                }
                mach::release_port(self.exception_port);
                mach::release_port(self.task);
            }
        }

        /// Attach the process-wide debugger. Idempotent: a second call is a
        /// successful no-op and allocates no new exception port.
        pub fn attach(pid: i32) -> bool {
            DEBUGGER
                .get_or_try_init(|| Debugger::attach(pid).map(Mutex::new))
                .map(|_| true)
                .unwrap_or_else(|kr: i32| {
                    error!("[memagent] debugger attach to pid {pid} failed: {kr}");
                    false
                })
        }

        fn with_debugger(f: impl FnOnce(&mut Debugger) -> i32) -> i32 {
            match DEBUGGER.get() {
                Some(debugger) => match debugger.lock() {
                    Ok(mut guard) => f(&mut guard),
                    Err(_) => KERN_FAILURE,
                },
                None => {
                    error!("[memagent] debugger not attached");
                    KERN_FAILURE
                }
            }
        }

        pub fn set_watchpoint(address: u64, size: i32, kind: i32) -> i32 {
            let Some(kind) = WatchKind::from_raw(kind) else {
                return KERN_INVALID_ARGUMENT;
            };
            let Ok(size) = u8::try_from(size) else {
                return KERN_INVALID_ARGUMENT;
            };
            with_debugger(|d| d.set_watchpoint(address, size, kind))
        }

        pub fn remove_watchpoint(address: u64) -> i32 {
            with_debugger(|d| d.remove_watchpoint(address))
        }

        pub fn set_breakpoint(address: u64, target_count: i32) -> i32 {
            if target_count < 1 {
                return KERN_INVALID_ARGUMENT;
            }
            with_debugger(|d| d.set_breakpoint(address, target_count as u64))
        }

        pub fn remove_breakpoint(address: u64) -> i32 {
            with_debugger(|d| d.remove_breakpoint(address))
        }

        /// Entry point for the exception server thread.
        pub(crate) fn dispatch_exception(thread: mach::PortName, exception: i32, code: &[i64]) -> i32 {
            with_debugger(|d| d.handle_exception(thread, exception, code))
        }
    } else {
        use log::error;

        /// Hardware debug registers are not exposed on this platform; the
        /// slot table and encodings above stay available to embedders, but
        /// attachment always fails.
        pub fn attach(pid: i32) -> bool {
            error!("[memagent] hardware debugger is not supported on this platform (pid {pid})");
            false
        }

        pub fn set_watchpoint(_address: u64, _size: i32, _kind: i32) -> i32 {
            KERN_FAILURE
        }

        pub fn remove_watchpoint(_address: u64) -> i32 {
            KERN_FAILURE
        }

        pub fn set_breakpoint(_address: u64, _target_count: i32) -> i32 {
            KERN_FAILURE
        }

        pub fn remove_breakpoint(_address: u64) -> i32 {
            KERN_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_errors_map_to_kernel_codes() {
        assert_eq!(status_for(&SlotError::InvalidSize(3)), KERN_INVALID_ARGUMENT);
        assert_eq!(status_for(&SlotError::InvalidHitCount), KERN_INVALID_ARGUMENT);
        assert_eq!(
            status_for(&SlotError::Exhausted("watchpoint")),
            KERN_RESOURCE_SHORTAGE
        );
    }

    #[test]
    fn notification_lines_are_json_with_hex_addresses() {
        let line = notification_json("watchpoint", 2, 0x1000, 0x4_0000);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "watchpoint");
        assert_eq!(value["index"], 2);
        assert_eq!(value["address"], "0x1000");
        assert_eq!(value["pc"], "0x40000");
    }
}
