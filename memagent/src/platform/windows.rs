//! Windows backend: toolhelp snapshots, `VirtualQueryEx` walks, and
//! `ReadProcessMemory`/`WriteProcessMemory` with protection widening.

use std::ffi::c_void;
use std::io::Error as OsError;
use std::mem;

use anyhow::{bail, Result};
use log::{debug, error, warn};

use winapi::shared::minwindef::{DWORD, FALSE, MAX_PATH};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::{
    ReadProcessMemory, VirtualProtectEx, VirtualQueryEx, WriteProcessMemory,
};
use winapi::um::processthreadsapi::{OpenProcess, OpenThread, ResumeThread, SuspendThread};
use winapi::um::psapi::{GetMappedFileNameA, GetModuleFileNameExW};
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, Process32FirstW, Process32NextW,
    Thread32First, Thread32Next, MODULEENTRY32W, PROCESSENTRY32W, TH32CS_SNAPMODULE,
    TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use winapi::um::winnt::{
    HANDLE, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_FREE, MEM_MAPPED, MEM_PRIVATE, MEM_RESERVE,
    PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
    PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY, PROCESS_QUERY_INFORMATION,
    PROCESS_VM_OPERATION, PROCESS_VM_READ, PROCESS_VM_WRITE, THREAD_SUSPEND_RESUME,
};

use crate::records::{ModuleRecord, Perms, ProcessRecord, RegionRecord, RegionState, ShareMode};

const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D;
const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550;
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

/// Closes the wrapped handle on scope exit. Handles are opened per call and
/// never cached.
struct HandleGuard(HANDLE);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(self.0) };
        }
    }
}

fn open_process(pid: i32, access: DWORD) -> Option<HandleGuard> {
    let handle = unsafe { OpenProcess(access, FALSE, pid as DWORD) };
    if handle.is_null() {
        None
    } else {
        Some(HandleGuard(handle))
    }
}

fn wide_to_string(wide: &[u16]) -> Option<String> {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16(&wide[..len]).ok()
}

pub fn read_memory(pid: i32, address: u64, buf: &mut [u8]) -> isize {
    if buf.is_empty() {
        return 0;
    }
    let Some(process) = open_process(pid, PROCESS_VM_READ) else {
        debug!(
            "[memagent] failed to open pid {pid} for reading: {}",
            OsError::last_os_error()
        );
        return -1;
    };

    let mut bytes_read: usize = 0;
    let ok = unsafe {
        ReadProcessMemory(
            process.0,
            address as *const c_void,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            &mut bytes_read,
        )
    };
    if ok == 0 {
        debug!(
            "[memagent] ReadProcessMemory of {address:#x} from pid {pid} failed: {}",
            OsError::last_os_error()
        );
        return -1;
    }
    if bytes_read < buf.len() {
        warn!(
            "[memagent] partial read from pid {pid}: requested {} bytes, got {bytes_read}",
            buf.len()
        );
    }
    bytes_read as isize
}

pub fn write_memory(pid: i32, address: u64, data: &[u8]) -> isize {
    if data.is_empty() {
        return 0;
    }
    let Some(process) = open_process(
        pid,
        PROCESS_VM_WRITE | PROCESS_VM_OPERATION | PROCESS_QUERY_INFORMATION,
    ) else {
        error!(
            "[memagent] failed to open pid {pid} for writing: {}",
            OsError::last_os_error()
        );
        return -1;
    };

    let mut old_protect: DWORD = 0;
    let ok = unsafe {
        VirtualProtectEx(
            process.0,
            address as *mut c_void,
            data.len(),
            PAGE_EXECUTE_READWRITE,
            &mut old_protect,
        )
    };
    if ok == 0 {
        error!(
            "[memagent] VirtualProtectEx of {address:#x} in pid {pid} failed: {}",
            OsError::last_os_error()
        );
        return -1;
    }

    let mut bytes_written: usize = 0;
    let ok = unsafe {
        WriteProcessMemory(
            process.0,
            address as *mut c_void,
            data.as_ptr() as *const c_void,
            data.len(),
            &mut bytes_written,
        )
    };

    // Best-effort restore on both success and failure paths.
    let mut scratch: DWORD = 0;
    let restored = unsafe {
        VirtualProtectEx(
            process.0,
            address as *mut c_void,
            data.len(),
            old_protect,
            &mut scratch,
        )
    };
    if restored == 0 {
        warn!(
            "[memagent] failed to restore protection of {address:#x} in pid {pid}: {}",
            OsError::last_os_error()
        );
    }

    if ok == 0 {
        error!(
            "[memagent] WriteProcessMemory to {address:#x} in pid {pid} failed: {}",
            OsError::last_os_error()
        );
        return -1;
    }
    bytes_written as isize
}

fn perms_from_protect(protect: DWORD, region_type: DWORD) -> Perms {
    Perms {
        read: protect
            & (PAGE_READONLY | PAGE_READWRITE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE)
            != 0,
        write: protect
            & (PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY)
            != 0,
        execute: protect
            & (PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY)
            != 0,
        share: match region_type {
            MEM_MAPPED => ShareMode::Shared,
            MEM_PRIVATE => ShareMode::Private,
            _ => ShareMode::Unknown,
        },
    }
}

fn mapped_backing(process: HANDLE, address: u64) -> Option<String> {
    let mut name = [0u8; MAX_PATH];
    let len = unsafe {
        GetMappedFileNameA(
            process,
            address as *mut c_void,
            name.as_mut_ptr() as *mut i8,
            name.len() as DWORD,
        )
    };
    if len == 0 {
        return None;
    }
    std::str::from_utf8(&name[..len as usize])
        .ok()
        .map(|s| s.to_string())
}

/// Walk the address space from 0 with `VirtualQueryEx` until it reports
/// nothing more. States map to the three explicit tokens.
pub fn regions(pid: i32) -> Result<Vec<RegionRecord>> {
    let Some(process) = open_process(pid, PROCESS_QUERY_INFORMATION | PROCESS_VM_READ) else {
        bail!("failed to open pid {pid}: {}", OsError::last_os_error());
    };

    let mut out = Vec::new();
    let mut address: u64 = 0;
    loop {
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
        let filled = unsafe {
            VirtualQueryEx(
                process.0,
                address as *const c_void,
                &mut info,
                mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if filled == 0 {
            break;
        }

        let state = match info.State {
            MEM_COMMIT => RegionState::Committed,
            MEM_RESERVE => RegionState::Reserved,
            MEM_FREE => RegionState::Free,
            _ => RegionState::Free,
        };
        let backing = if info.Type == MEM_MAPPED {
            mapped_backing(process.0, info.BaseAddress as u64)
        } else {
            None
        };

        let start = info.BaseAddress as u64;
        out.push(RegionRecord {
            start,
            end: start + info.RegionSize as u64,
            perms: perms_from_protect(info.Protect, info.Type),
            state,
            backing,
        });

        address = start + info.RegionSize as u64;
    }
    Ok(out)
}

/// Toolhelp process snapshot. Names that cannot be converted from UTF-16
/// become `"Unknown"` but the record is still returned.
pub fn list_processes() -> Result<Vec<ProcessRecord>> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        bail!(
            "failed to snapshot processes: {}",
            OsError::last_os_error()
        );
    }
    let snapshot = HandleGuard(snapshot);

    let mut entry: PROCESSENTRY32W = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<PROCESSENTRY32W>() as DWORD;
    if unsafe { Process32FirstW(snapshot.0, &mut entry) } == 0 {
        bail!(
            "failed to read first process entry: {}",
            OsError::last_os_error()
        );
    }

    let mut processes = Vec::new();
    loop {
        let name = wide_to_string(&entry.szExeFile).unwrap_or_else(|| {
            warn!(
                "[memagent] process name for pid {} is not valid UTF-16",
                entry.th32ProcessID
            );
            "Unknown".to_string()
        });
        processes.push(ProcessRecord {
            pid: entry.th32ProcessID as i32,
            name,
        });
        if unsafe { Process32NextW(snapshot.0, &mut entry) } == 0 {
            break;
        }
    }
    processes.sort_by_key(|p| p.pid);
    Ok(processes)
}

fn read_remote<T: Copy>(process: HANDLE, address: u64) -> Option<T> {
    let mut value: T = unsafe { mem::zeroed() };
    let ok = unsafe {
        ReadProcessMemory(
            process,
            address as *const c_void,
            &mut value as *mut T as *mut c_void,
            mem::size_of::<T>(),
            std::ptr::null_mut(),
        )
    };
    (ok != 0).then_some(value)
}

/// Derive bitness by reading the PE headers out of the target.
fn is_pe_64bit(process: HANDLE, base: u64) -> bool {
    // IMAGE_DOS_HEADER: e_magic at +0, e_lfanew at +0x3c.
    let Some(e_magic) = read_remote::<u16>(process, base) else {
        return false;
    };
    if e_magic != IMAGE_DOS_SIGNATURE {
        return false;
    }
    let Some(e_lfanew) = read_remote::<i32>(process, base + 0x3c) else {
        return false;
    };
    let nt = base + e_lfanew as u64;
    let Some(signature) = read_remote::<u32>(process, nt) else {
        return false;
    };
    if signature != IMAGE_NT_SIGNATURE {
        return false;
    }
    // IMAGE_FILE_HEADER.Machine immediately follows the signature.
    let Some(machine) = read_remote::<u16>(process, nt + 4) else {
        return false;
    };
    machine == IMAGE_FILE_MACHINE_AMD64
}

pub fn list_modules(pid: i32) -> Result<Vec<ModuleRecord>> {
    let snapshot =
        unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid as DWORD) };
    if snapshot == INVALID_HANDLE_VALUE {
        bail!(
            "failed to snapshot modules of pid {pid}: {}",
            OsError::last_os_error()
        );
    }
    let snapshot = HandleGuard(snapshot);

    let mut entry: MODULEENTRY32W = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<MODULEENTRY32W>() as DWORD;
    if unsafe { Module32FirstW(snapshot.0, &mut entry) } == 0 {
        bail!(
            "failed to read first module entry for pid {pid}: {}",
            OsError::last_os_error()
        );
    }

    let process = open_process(pid, PROCESS_VM_READ);
    let mut modules = Vec::new();
    loop {
        let base = entry.modBaseAddr as u64;
        modules.push(ModuleRecord {
            base,
            size: entry.modBaseSize as u64,
            is_64bit: process
                .as_ref()
                .is_some_and(|p| is_pe_64bit(p.0, base)),
            path: wide_to_string(&entry.szModule).unwrap_or_else(|| "Unknown".to_string()),
        });
        if unsafe { Module32NextW(snapshot.0, &mut entry) } == 0 {
            break;
        }
    }
    Ok(modules)
}

/// Walk the target's threads and apply `op` to each. Returns true iff at
/// least one thread was affected.
fn for_each_thread(pid: i32, op: unsafe extern "system" fn(HANDLE) -> DWORD) -> bool {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        error!(
            "[memagent] failed to snapshot threads of pid {pid}: {}",
            OsError::last_os_error()
        );
        return false;
    }
    let snapshot = HandleGuard(snapshot);

    let mut entry: THREADENTRY32 = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<THREADENTRY32>() as DWORD;
    if unsafe { Thread32First(snapshot.0, &mut entry) } == 0 {
        error!(
            "[memagent] failed to read first thread entry: {}",
            OsError::last_os_error()
        );
        return false;
    }

    let mut affected = false;
    loop {
        if entry.th32OwnerProcessID == pid as DWORD {
            let thread = unsafe { OpenThread(THREAD_SUSPEND_RESUME, FALSE, entry.th32ThreadID) };
            if thread.is_null() {
                error!(
                    "[memagent] failed to open thread {} of pid {pid}: {}",
                    entry.th32ThreadID,
                    OsError::last_os_error()
                );
            } else {
                let thread = HandleGuard(thread);
                if unsafe { op(thread.0) } == DWORD::MAX {
                    error!(
                        "[memagent] thread operation on {} of pid {pid} failed: {}",
                        entry.th32ThreadID,
                        OsError::last_os_error()
                    );
                } else {
                    affected = true;
                }
            }
        }
        if unsafe { Thread32Next(snapshot.0, &mut entry) } == 0 {
            break;
        }
    }
    affected
}

pub fn suspend(pid: i32) -> bool {
    for_each_thread(pid, SuspendThread)
}

pub fn resume(pid: i32) -> bool {
    for_each_thread(pid, ResumeThread)
}

pub fn binary_path(pid: i32) -> Result<String> {
    let Some(process) = open_process(pid, PROCESS_QUERY_INFORMATION | PROCESS_VM_READ) else {
        bail!("failed to open pid {pid}: {}", OsError::last_os_error());
    };
    let mut path = [0u16; 1024];
    let len = unsafe {
        GetModuleFileNameExW(
            process.0,
            std::ptr::null_mut(),
            path.as_mut_ptr(),
            path.len() as DWORD,
        )
    };
    if len == 0 {
        bail!(
            "GetModuleFileNameExW for pid {pid} failed: {}",
            OsError::last_os_error()
        );
    }
    wide_to_string(&path[..len as usize])
        .ok_or_else(|| anyhow::anyhow!("binary path for pid {pid} is not valid UTF-16"))
}
