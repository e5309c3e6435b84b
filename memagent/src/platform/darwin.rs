//! macOS/iOS backend: Mach task ports for memory I/O and region walks,
//! `sysctl` for the process list, dyld's image table for modules.

use std::ffi::CStr;
use std::mem;

use anyhow::{bail, Context, Result};
use log::{debug, error, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use mach2::kern_return::KERN_SUCCESS;
use mach2::port::mach_port_t;
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::{mach_vm_protect, mach_vm_read_overwrite, mach_vm_region_recurse, mach_vm_write};
use mach2::vm_prot::{VM_PROT_COPY, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_region::vm_region_submap_info_64;
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t, natural_t};

use crate::records::{ModuleRecord, Perms, ProcessRecord, RegionRecord, RegionState, ShareMode};

const MH_MAGIC_64: u32 = 0xfeed_facf;

// task_info(TASK_DYLD_INFO) is not covered by mach2.
const TASK_DYLD_INFO: u32 = 17;

#[repr(C)]
#[derive(Default)]
struct TaskDyldInfo {
    all_image_info_addr: u64,
    all_image_info_size: u64,
    all_image_info_format: i32,
}

extern "C" {
    fn task_info(
        task: mach_port_t,
        flavor: u32,
        info: *mut libc::c_int,
        count: *mut u32,
    ) -> i32;
}

/// Obtain the target's task port. Requires the usual entitlements / root.
pub(crate) fn task_port(pid: i32) -> Result<mach_port_t> {
    let mut task: mach_port_t = 0;
    let kr = unsafe { task_for_pid(mach_task_self(), pid, &mut task) };
    if kr != KERN_SUCCESS {
        bail!("task_for_pid({pid}) failed: kern_return {kr}");
    }
    Ok(task)
}

/// Read out of the target with `mach_vm_read_overwrite`. Short reads are
/// permitted; failures return -1.
pub fn read_memory(pid: i32, address: u64, buf: &mut [u8]) -> isize {
    if buf.is_empty() {
        return 0;
    }
    let task = match task_port(pid) {
        Ok(task) => task,
        Err(err) => {
            debug!("[memagent] {err:#}");
            return -1;
        }
    };

    let mut out_size: mach_vm_size_t = 0;
    let kr = unsafe {
        mach_vm_read_overwrite(
            task,
            address,
            buf.len() as mach_vm_size_t,
            buf.as_mut_ptr() as mach_vm_address_t,
            &mut out_size,
        )
    };
    if kr != KERN_SUCCESS {
        debug!("[memagent] mach_vm_read_overwrite of {address:#x} from pid {pid} failed: {kr}");
        return -1;
    }
    if (out_size as usize) < buf.len() {
        warn!(
            "[memagent] partial read from pid {pid}: requested {} bytes, got {out_size}",
            buf.len()
        );
    }
    out_size as isize
}

/// Write into the target after widening the protection of the covering span.
pub fn write_memory(pid: i32, address: u64, data: &[u8]) -> isize {
    if data.is_empty() {
        return 0;
    }
    let task = match task_port(pid) {
        Ok(task) => task,
        Err(err) => {
            error!("[memagent] {err:#}");
            return -1;
        }
    };

    let kr = unsafe {
        mach_vm_protect(
            task,
            address,
            data.len() as mach_vm_size_t,
            0,
            VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY,
        )
    };
    if kr != KERN_SUCCESS {
        warn!("[memagent] mach_vm_protect of {address:#x} failed: {kr}");
    }

    let kr = unsafe {
        mach_vm_write(
            task,
            address,
            data.as_ptr() as usize,
            data.len() as u32,
        )
    };
    if kr != KERN_SUCCESS {
        error!("[memagent] mach_vm_write to {address:#x} in pid {pid} failed: {kr}");
        return -1;
    }
    data.len() as isize
}

fn perms_from_protection(protection: i32) -> Perms {
    Perms {
        read: protection & VM_PROT_READ != 0,
        write: protection & VM_PROT_WRITE != 0,
        execute: protection & VM_PROT_EXECUTE != 0,
        share: ShareMode::Unknown,
    }
}

#[cfg(target_os = "macos")]
fn region_backing(pid: i32, address: u64) -> Option<String> {
    let mut buf = [0u8; libc::PATH_MAX as usize];
    let len = unsafe {
        libc::proc_regionfilename(
            pid,
            address,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len() as u32,
        )
    };
    if len <= 0 {
        return None;
    }
    std::str::from_utf8(&buf[..len as usize])
        .ok()
        .map(|s| s.to_string())
}

#[cfg(not(target_os = "macos"))]
fn region_backing(_pid: i32, _address: u64) -> Option<String> {
    None
}

/// Walk the task's VM map, descending into submaps.
pub fn regions(pid: i32) -> Result<Vec<RegionRecord>> {
    let task = task_port(pid)?;

    let mut out = Vec::new();
    let mut address: mach_vm_address_t = 0;
    let mut depth: natural_t = 1;
    loop {
        let mut size: mach_vm_size_t = 0;
        let mut info: vm_region_submap_info_64 = unsafe { mem::zeroed() };
        let mut count =
            (mem::size_of::<vm_region_submap_info_64>() / mem::size_of::<natural_t>()) as u32;
        let kr = unsafe {
            mach_vm_region_recurse(
                task,
                &mut address,
                &mut size,
                &mut depth,
                &mut info as *mut _ as *mut i32,
                &mut count,
            )
        };
        if kr != KERN_SUCCESS {
            break;
        }

        if info.is_submap != 0 {
            depth += 1;
            continue;
        }

        out.push(RegionRecord {
            start: address,
            end: address + size,
            perms: perms_from_protection(info.protection),
            state: RegionState::Committed,
            backing: region_backing(pid, address),
        });
        address += size;
    }
    Ok(out)
}

/// Process list via `sysctl(CTL_KERN, KERN_PROC, KERN_PROC_ALL)`.
pub fn list_processes() -> Result<Vec<ProcessRecord>> {
    let mut mib = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_ALL];

    // The table can grow between the size probe and the fetch; retry on
    // ENOMEM the way every sysctl consumer does.
    for _ in 0..4 {
        let mut length: libc::size_t = 0;
        let rc = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                mib.len() as u32,
                std::ptr::null_mut(),
                &mut length,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc != 0 {
            bail!("sysctl size probe failed: {}", std::io::Error::last_os_error());
        }

        let count = length / mem::size_of::<libc::kinfo_proc>();
        let mut table: Vec<libc::kinfo_proc> = Vec::with_capacity(count + 8);
        length = table.capacity() * mem::size_of::<libc::kinfo_proc>();
        let rc = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                mib.len() as u32,
                table.as_mut_ptr() as *mut libc::c_void,
                &mut length,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOMEM) {
                continue;
            }
            bail!("sysctl fetch failed: {err}");
        }

        let fetched = length / mem::size_of::<libc::kinfo_proc>();
        unsafe { table.set_len(fetched) };

        let mut processes: Vec<ProcessRecord> = table
            .iter()
            .map(|info| {
                let comm = unsafe { CStr::from_ptr(info.kp_proc.p_comm.as_ptr()) };
                ProcessRecord {
                    pid: info.kp_proc.p_pid,
                    name: comm.to_string_lossy().into_owned(),
                }
            })
            .collect();
        processes.sort_by_key(|p| p.pid);
        return Ok(processes);
    }
    bail!("sysctl kept reporting ENOMEM");
}

// dyld_all_image_infos layout for 64-bit targets, first fields only.
#[repr(C)]
#[derive(Clone, Copy)]
struct AllImageInfosHead {
    version: u32,
    info_array_count: u32,
    info_array_addr: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ImageInfo64 {
    load_address: u64,
    file_path_addr: u64,
    file_mod_date: u64,
}

fn read_struct<T: Copy>(pid: i32, address: u64) -> Option<T> {
    let mut buf = vec![0u8; mem::size_of::<T>()];
    if read_memory(pid, address, &mut buf) != buf.len() as isize {
        return None;
    }
    Some(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) })
}

fn read_remote_cstring(pid: i32, address: u64) -> Option<String> {
    let mut buf = vec![0u8; 1024];
    let n = read_memory(pid, address, &mut buf);
    if n <= 0 {
        return None;
    }
    let buf = &buf[..n as usize];
    let end = buf.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&buf[..end]).ok().map(|s| s.to_string())
}

fn region_size_at(map: &[RegionRecord], base: u64) -> u64 {
    map.iter()
        .find(|r| r.start <= base && base < r.end)
        .map(|r| r.end - base)
        .unwrap_or(0)
}

/// Module list from the target's `dyld_all_image_infos` table.
pub fn list_modules(pid: i32) -> Result<Vec<ModuleRecord>> {
    let task = task_port(pid)?;

    let mut dyld_info = TaskDyldInfo::default();
    let mut count = (mem::size_of::<TaskDyldInfo>() / mem::size_of::<natural_t>()) as u32;
    let kr = unsafe {
        task_info(
            task,
            TASK_DYLD_INFO,
            &mut dyld_info as *mut _ as *mut libc::c_int,
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        bail!("task_info(TASK_DYLD_INFO) for pid {pid} failed: {kr}");
    }

    let head: AllImageInfosHead = read_struct(pid, dyld_info.all_image_info_addr)
        .context("failed to read dyld_all_image_infos")?;

    // One region walk shared by every size lookup below.
    let map = regions(pid)?;

    let mut modules = Vec::new();
    for index in 0..head.info_array_count as u64 {
        let entry_addr = head.info_array_addr + index * mem::size_of::<ImageInfo64>() as u64;
        let Some(entry) = read_struct::<ImageInfo64>(pid, entry_addr) else {
            warn!("[memagent] failed to read dyld image info {index} of pid {pid}");
            continue;
        };
        let Some(path) = read_remote_cstring(pid, entry.file_path_addr) else {
            warn!(
                "[memagent] failed to read path of image at {:#x} in pid {pid}",
                entry.load_address
            );
            continue;
        };

        let mut magic = [0u8; 4];
        if read_memory(pid, entry.load_address, &mut magic) != 4 {
            warn!(
                "[memagent] failed to read Mach-O header of {path} at {:#x} in pid {pid}",
                entry.load_address
            );
            continue;
        }
        modules.push(ModuleRecord {
            base: entry.load_address,
            size: region_size_at(&map, entry.load_address),
            is_64bit: u32::from_le_bytes(magic) == MH_MAGIC_64,
            path,
        });
    }
    Ok(modules)
}

pub fn suspend(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), Signal::SIGSTOP) {
        Ok(()) => true,
        Err(errno) => {
            error!("[memagent] failed to suspend pid {pid}: {errno}");
            false
        }
    }
}

pub fn resume(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), Signal::SIGCONT) {
        Ok(()) => true,
        Err(errno) => {
            error!("[memagent] failed to resume pid {pid}: {errno}");
            false
        }
    }
}

pub fn binary_path(pid: i32) -> Result<String> {
    let mut buf = [0u8; 4 * libc::PATH_MAX as usize];
    let len = unsafe {
        libc::proc_pidpath(pid, buf.as_mut_ptr() as *mut libc::c_void, buf.len() as u32)
    };
    if len <= 0 {
        bail!(
            "proc_pidpath({pid}) failed: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(String::from_utf8_lossy(&buf[..len as usize]).into_owned())
}
