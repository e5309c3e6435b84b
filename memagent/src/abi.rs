//! Stable C-callable entry points consumed by the host runtime.
//!
//! Pure forwarding plus return-code normalization: every operation lives in
//! the platform, file, or debugger modules. Heap pointers handed across the
//! boundary have a dedicated release symbol; the host must never `free()`
//! them directly. Panics never cross the boundary.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use log::{error, warn};

use crate::config::{self, ServerMode};
use crate::debugger;
use crate::files;
use crate::logging::{self, HostLogFn};
use crate::platform;
use crate::records::render_regions;

#[repr(C)]
pub struct CProcessInfo {
    pub pid: c_int,
    pub name: *mut c_char,
}

#[repr(C)]
pub struct CModuleInfo {
    pub base: u64,
    pub size: u64,
    pub is_64bit: bool,
    pub name: *mut c_char,
}

fn guarded<T>(default: T, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error!("[memagent] panic caught at the ABI boundary");
            default
        }
    }
}

fn into_c_string(s: String) -> *mut c_char {
    // Interior NULs cannot cross the boundary; degrade to an empty string.
    CString::new(s).unwrap_or_default().into_raw()
}

/// Register (or clear) the host's log sink. Embedded-mode records are
/// forwarded here and never reach stdout.
#[no_mangle]
pub extern "C" fn set_native_log_handler(handler: Option<HostLogFn>) {
    logging::set_host_handler(handler);
}

/// Initialize the agent. `mode` 0 is standalone, 1 is embedded. Returns 1
/// on success, -1 on failure. Idempotent; the first mode wins.
#[no_mangle]
pub extern "C" fn native_init(mode: c_int) -> c_int {
    guarded(-1, || {
        let Some(mode) = ServerMode::from_raw(mode) else {
            return -1;
        };
        let mode = config::init_server_state(mode);
        logging::init(mode);

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Err(err) = platform::resolve_vm_syscalls() {
            error!("[memagent] native_init failed: {err:#}");
            return -1;
        }

        1
    })
}

#[no_mangle]
pub extern "C" fn get_pid_native() -> c_int {
    platform::current_pid()
}

/// Read `size` bytes of the target at `address` into `buffer`. Returns the
/// byte count actually read (short reads allowed) or a negative errno.
///
/// # Safety
/// `buffer` must be valid for writes of `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn read_memory_native(
    pid: c_int,
    address: u64,
    size: usize,
    buffer: *mut u8,
) -> isize {
    if size == 0 {
        return 0;
    }
    if buffer.is_null() {
        return -1;
    }
    let buf = std::slice::from_raw_parts_mut(buffer, size);
    guarded(-1, || platform::read_memory(pid, address, buf))
}

/// Write `size` bytes into the target at `address`. Returns the byte count
/// written or -1.
///
/// # Safety
/// `buffer` must be valid for reads of `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn write_memory_native(
    pid: c_int,
    address: u64,
    size: usize,
    buffer: *const u8,
) -> isize {
    if size == 0 {
        return 0;
    }
    if buffer.is_null() {
        return -1;
    }
    let data = std::slice::from_raw_parts(buffer, size);
    guarded(-1, || platform::write_memory(pid, address, data))
}

fn copy_text_to_buffer(text: &str, buffer: *mut c_char, buffer_size: usize) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(buffer_size - 1);
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer as *mut u8, len);
        *buffer.add(len) = 0;
    }
}

/// Write the target's normalized region map as NUL-terminated text. When
/// the buffer fills up, emission stops at the last complete line.
///
/// # Safety
/// `buffer` must be valid for writes of `buffer_size` bytes.
#[no_mangle]
pub unsafe extern "C" fn enumerate_regions_to_buffer(
    pid: c_int,
    buffer: *mut c_char,
    buffer_size: usize,
) {
    if buffer.is_null() || buffer_size == 0 {
        return;
    }
    guarded((), || match platform::regions(pid) {
        Ok(regions) => {
            let (text, truncated) = render_regions(&regions, buffer_size - 1);
            if truncated {
                warn!(
                    "[memagent] region buffer of {buffer_size} bytes too small for pid {pid}"
                );
            }
            copy_text_to_buffer(&text, buffer, buffer_size);
        }
        Err(err) => {
            error!("[memagent] region enumeration for pid {pid} failed: {err:#}");
            copy_text_to_buffer(
                &format!("Failed to enumerate regions for pid {pid}"),
                buffer,
                buffer_size,
            );
        }
    })
}

/// List all processes. The returned array (and the strings inside) belong
/// to the caller and are released with `free_process_list`.
///
/// # Safety
/// `count` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn enumprocess_native(count: *mut usize) -> *mut CProcessInfo {
    if count.is_null() {
        return std::ptr::null_mut();
    }
    *count = 0;
    guarded(std::ptr::null_mut(), || match platform::list_processes() {
        Ok(processes) => {
            let records: Vec<CProcessInfo> = processes
                .into_iter()
                .map(|p| CProcessInfo {
                    pid: p.pid,
                    name: into_c_string(p.name),
                })
                .collect();
            unsafe { *count = records.len() };
            Box::into_raw(records.into_boxed_slice()) as *mut CProcessInfo
        }
        Err(err) => {
            error!("[memagent] process enumeration failed: {err:#}");
            std::ptr::null_mut()
        }
    })
}

/// Release an array returned by `enumprocess_native`.
///
/// # Safety
/// `list`/`count` must come from `enumprocess_native`, unmodified.
#[no_mangle]
pub unsafe extern "C" fn free_process_list(list: *mut CProcessInfo, count: usize) {
    if list.is_null() {
        return;
    }
    let slice = Box::from_raw(std::ptr::slice_from_raw_parts_mut(list, count));
    for record in slice.iter() {
        if !record.name.is_null() {
            drop(CString::from_raw(record.name));
        }
    }
}

/// List the modules of `pid`. Released with `free_module_list`.
///
/// # Safety
/// `count` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn enummodule_native(pid: c_int, count: *mut usize) -> *mut CModuleInfo {
    if count.is_null() {
        return std::ptr::null_mut();
    }
    *count = 0;
    guarded(std::ptr::null_mut(), || match platform::list_modules(pid) {
        Ok(modules) => {
            let records: Vec<CModuleInfo> = modules
                .into_iter()
                .map(|m| CModuleInfo {
                    base: m.base,
                    size: m.size,
                    is_64bit: m.is_64bit,
                    name: into_c_string(m.path),
                })
                .collect();
            unsafe { *count = records.len() };
            Box::into_raw(records.into_boxed_slice()) as *mut CModuleInfo
        }
        Err(err) => {
            error!("[memagent] module enumeration for pid {pid} failed: {err:#}");
            std::ptr::null_mut()
        }
    })
}

/// Release an array returned by `enummodule_native`.
///
/// # Safety
/// `list`/`count` must come from `enummodule_native`, unmodified.
#[no_mangle]
pub unsafe extern "C" fn free_module_list(list: *mut CModuleInfo, count: usize) {
    if list.is_null() {
        return;
    }
    let slice = Box::from_raw(std::ptr::slice_from_raw_parts_mut(list, count));
    for record in slice.iter() {
        if !record.name.is_null() {
            drop(CString::from_raw(record.name));
        }
    }
}

#[no_mangle]
pub extern "C" fn suspend_process(pid: c_int) -> bool {
    guarded(false, || platform::suspend(pid))
}

#[no_mangle]
pub extern "C" fn resume_process(pid: c_int) -> bool {
    guarded(false, || platform::resume(pid))
}

/// Depth-indented directory listing; released with `free_cstring`.
///
/// # Safety
/// `path` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn explore_directory(path: *const c_char, max_depth: c_int) -> *mut c_char {
    if path.is_null() {
        return std::ptr::null_mut();
    }
    let path = CStr::from_ptr(path).to_string_lossy().into_owned();
    guarded(std::ptr::null_mut(), || {
        into_c_string(files::explore_directory(Path::new(&path), max_depth))
    })
}

/// Read a whole file. On success returns the bytes (released with
/// `free_file_buffer`) and stores the length; on failure returns null and
/// stores a message in `error_message` (released with `free_cstring`).
///
/// # Safety
/// `path` must be a valid NUL-terminated string; `size` and
/// `error_message` must be valid pointers.
#[no_mangle]
pub unsafe extern "C" fn read_file(
    path: *const c_char,
    size: *mut usize,
    error_message: *mut *mut c_char,
) -> *mut u8 {
    if path.is_null() || size.is_null() || error_message.is_null() {
        return std::ptr::null_mut();
    }
    *size = 0;
    *error_message = std::ptr::null_mut();

    let path = CStr::from_ptr(path).to_string_lossy().into_owned();
    guarded(std::ptr::null_mut(), || {
        match files::read_file(Path::new(&path)) {
            Ok(data) => {
                unsafe { *size = data.len() };
                Box::into_raw(data.into_boxed_slice()) as *mut u8
            }
            Err(err) => {
                unsafe { *error_message = into_c_string(format!("Error: {err:#}")) };
                std::ptr::null_mut()
            }
        }
    })
}

/// Release a buffer returned by `read_file`.
///
/// # Safety
/// `buffer`/`size` must come from `read_file`, unmodified.
#[no_mangle]
pub unsafe extern "C" fn free_file_buffer(buffer: *mut u8, size: usize) {
    if buffer.is_null() {
        return;
    }
    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
        buffer, size,
    )));
}

/// `{"BinaryPath": …}` for the target, or an error message. Released with
/// `free_cstring`.
#[no_mangle]
pub extern "C" fn get_application_info_native(pid: c_int) -> *mut c_char {
    guarded(std::ptr::null_mut(), || {
        into_c_string(files::application_info(pid))
    })
}

/// Release a string returned by this ABI.
///
/// # Safety
/// `string` must come from this ABI, unmodified.
#[no_mangle]
pub unsafe extern "C" fn free_cstring(string: *mut c_char) {
    if !string.is_null() {
        drop(CString::from_raw(string));
    }
}

/// Attach the debugger to `pid`. Idempotent: a second call returns true
/// without allocating another exception port.
#[no_mangle]
pub extern "C" fn debugger_new(pid: c_int) -> bool {
    guarded(false, || debugger::attach(pid))
}

#[no_mangle]
pub extern "C" fn set_watchpoint_native(address: u64, size: c_int, watch_type: c_int) -> c_int {
    guarded(debugger::KERN_FAILURE, || {
        debugger::set_watchpoint(address, size, watch_type)
    })
}

#[no_mangle]
pub extern "C" fn remove_watchpoint_native(address: u64) -> c_int {
    guarded(debugger::KERN_FAILURE, || {
        debugger::remove_watchpoint(address)
    })
}

#[no_mangle]
pub extern "C" fn set_breakpoint_native(address: u64, hit_count: c_int) -> c_int {
    guarded(debugger::KERN_FAILURE, || {
        debugger::set_breakpoint(address, hit_count)
    })
}

#[no_mangle]
pub extern "C" fn remove_breakpoint_native(address: u64) -> c_int {
    guarded(debugger::KERN_FAILURE, || {
        debugger::remove_breakpoint(address)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn init_and_pid() {
        assert_eq!(native_init(0), 1);
        // Re-initialization is a success, not a reconfiguration.
        assert_eq!(native_init(1), 1);
        assert_eq!(native_init(42), -1);
        assert_eq!(get_pid_native(), std::process::id() as i32);
    }

    #[test]
    fn memory_round_trip_through_the_abi() {
        let pid = get_pid_native();
        let mut target = vec![0u8; 256];
        let payload: Vec<u8> = (0..64u8).collect();

        let written = unsafe {
            write_memory_native(
                pid,
                target.as_mut_ptr() as u64,
                payload.len(),
                payload.as_ptr(),
            )
        };
        assert_eq!(written, payload.len() as isize);

        let mut out = vec![0u8; payload.len()];
        let read = unsafe {
            read_memory_native(pid, target.as_ptr() as u64, out.len(), out.as_mut_ptr())
        };
        assert_eq!(read, payload.len() as isize);
        assert_eq!(out, payload);
    }

    #[test]
    fn zero_size_and_null_buffer_contracts() {
        let pid = get_pid_native();
        assert_eq!(
            unsafe { read_memory_native(pid, 0x1000, 0, std::ptr::null_mut()) },
            0
        );
        assert_eq!(
            unsafe { read_memory_native(pid, 0x1000, 8, std::ptr::null_mut()) },
            -1
        );
        assert_eq!(
            unsafe { write_memory_native(pid, 0x1000, 8, std::ptr::null()) },
            -1
        );
    }

    #[test]
    fn region_text_is_nul_terminated_lines() {
        let mut buffer = vec![0u8; 256 * 1024];
        unsafe {
            enumerate_regions_to_buffer(
                get_pid_native(),
                buffer.as_mut_ptr() as *mut c_char,
                buffer.len(),
            );
        }
        let text = unsafe { CStr::from_ptr(buffer.as_ptr() as *const c_char) }
            .to_str()
            .unwrap();
        assert!(!text.is_empty());
        for line in text.lines() {
            let mut fields = line.split(' ');
            let range = fields.next().unwrap();
            assert!(range.contains('-'));
            assert_eq!(fields.next().unwrap().len(), 4);
            assert_eq!(fields.next().unwrap(), "committed");
        }
    }

    #[test]
    fn region_text_truncates_at_line_boundary() {
        let mut buffer = vec![0u8; 120];
        unsafe {
            enumerate_regions_to_buffer(
                get_pid_native(),
                buffer.as_mut_ptr() as *mut c_char,
                buffer.len(),
            );
        }
        let text = unsafe { CStr::from_ptr(buffer.as_ptr() as *const c_char) }
            .to_str()
            .unwrap();
        assert!(text.is_empty() || text.ends_with('\n'));
        assert!(text.len() < 120);
    }

    #[test]
    fn process_and_module_lists_cross_the_boundary() {
        let mut count = 0usize;
        let list = unsafe { enumprocess_native(&mut count) };
        assert!(!list.is_null());
        assert!(count > 0);
        let own = get_pid_native();
        let slice = unsafe { std::slice::from_raw_parts(list, count) };
        let me = slice.iter().find(|p| p.pid == own).expect("own pid missing");
        let name = unsafe { CStr::from_ptr(me.name) }.to_str().unwrap();
        assert!(!name.is_empty());
        unsafe { free_process_list(list, count) };

        let mut count = 0usize;
        let list = unsafe { enummodule_native(own, &mut count) };
        assert!(!list.is_null());
        assert!(count > 0);
        let slice = unsafe { std::slice::from_raw_parts(list, count) };
        for module in slice {
            assert!(module.size > 0);
            assert!(!module.name.is_null());
        }
        unsafe { free_module_list(list, count) };
    }

    #[test]
    fn directory_listing_and_file_read() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("payload.bin");
        std::fs::File::create(&file_path)
            .unwrap()
            .write_all(b"\x01\x02\x03")
            .unwrap();

        let c_dir = CString::new(dir.path().to_str().unwrap()).unwrap();
        let listing = unsafe { explore_directory(c_dir.as_ptr(), 2) };
        assert!(!listing.is_null());
        let text = unsafe { CStr::from_ptr(listing) }.to_str().unwrap().to_owned();
        assert!(text.contains("file:payload.bin,3,"));
        unsafe { free_cstring(listing) };

        let c_file = CString::new(file_path.to_str().unwrap()).unwrap();
        let mut size = 0usize;
        let mut err: *mut c_char = std::ptr::null_mut();
        let data = unsafe { read_file(c_file.as_ptr(), &mut size, &mut err) };
        assert!(!data.is_null());
        assert!(err.is_null());
        assert_eq!(size, 3);
        assert_eq!(unsafe { std::slice::from_raw_parts(data, size) }, b"\x01\x02\x03");
        unsafe { free_file_buffer(data, size) };

        let missing = CString::new("/nonexistent/memagent-abi-test").unwrap();
        let data = unsafe { read_file(missing.as_ptr(), &mut size, &mut err) };
        assert!(data.is_null());
        assert_eq!(size, 0);
        assert!(!err.is_null());
        let message = unsafe { CStr::from_ptr(err) }.to_str().unwrap();
        assert!(message.starts_with("Error:"));
        unsafe { free_cstring(err) };
    }

    #[test]
    fn application_info_for_self() {
        let info = get_application_info_native(get_pid_native());
        assert!(!info.is_null());
        let text = unsafe { CStr::from_ptr(info) }.to_str().unwrap().to_owned();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value["BinaryPath"].as_str().unwrap().contains("memagent"));
        unsafe { free_cstring(info) };
    }

    #[cfg(not(all(any(target_os = "macos", target_os = "ios"), target_arch = "aarch64")))]
    #[test]
    fn debugger_reports_unsupported_platform() {
        assert!(!debugger_new(get_pid_native()));
        assert_eq!(
            set_watchpoint_native(0x1000, 4, 2),
            debugger::KERN_FAILURE
        );
        assert_eq!(remove_watchpoint_native(0x1000), debugger::KERN_FAILURE);
        assert_eq!(set_breakpoint_native(0x1000, 1), debugger::KERN_FAILURE);
        assert_eq!(remove_breakpoint_native(0x1000), debugger::KERN_FAILURE);
    }

    #[test]
    fn free_functions_tolerate_null() {
        unsafe {
            free_cstring(std::ptr::null_mut());
            free_process_list(std::ptr::null_mut(), 0);
            free_module_list(std::ptr::null_mut(), 0);
            free_file_buffer(std::ptr::null_mut(), 0);
        }
    }
}
