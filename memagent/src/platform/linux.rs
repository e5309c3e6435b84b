//! Linux/Android backend: `/proc` parsing, `process_vm_readv`/`writev` bulk
//! copies, and a ptrace word loop for cross-process writes.

use std::fs;
use std::io::Read;

use anyhow::{Context, Result};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::platform::{current_pid, page_size};
use crate::records::{ModuleRecord, Perms, ProcessRecord, RegionRecord, RegionState, ShareMode};

const ELF64_EHDR_SIZE: usize = 64;
const EI_CLASS: usize = 4;
const ELFCLASS64: u8 = 2;

// ---------------------------------------------------------------------------
// process_vm_readv / process_vm_writev
//
// Bionic's libc headers did not expose these for years, so on Android the
// symbols are resolved from libc.so once at native_init and cached.
// ---------------------------------------------------------------------------

cfg_if::cfg_if! {
    if #[cfg(target_os = "android")] {
        use once_cell::sync::OnceCell;
        use std::ffi::CString;

        type VmIoFn = unsafe extern "C" fn(
            libc::pid_t,
            *const libc::iovec,
            libc::c_ulong,
            *const libc::iovec,
            libc::c_ulong,
            libc::c_ulong,
        ) -> libc::ssize_t;

        struct VmIoFns {
            readv: VmIoFn,
            writev: VmIoFn,
        }

        static VM_IO: OnceCell<VmIoFns> = OnceCell::new();

        fn resolve_symbol(handle: *mut libc::c_void, name: &str) -> Result<VmIoFn> {
            let c_name = CString::new(name).unwrap();
            let sym = unsafe { libc::dlsym(handle, c_name.as_ptr()) };
            if sym.is_null() {
                anyhow::bail!("symbol {name} not found in libc.so");
            }
            Ok(unsafe { std::mem::transmute::<*mut libc::c_void, VmIoFn>(sym) })
        }

        /// Resolve the bulk-copy syscall wrappers from libc.so. Called once
        /// from `native_init`; subsequent calls are no-ops.
        pub fn resolve_vm_syscalls() -> Result<()> {
            if VM_IO.get().is_some() {
                return Ok(());
            }
            let lib = CString::new("libc.so").unwrap();
            let handle = unsafe { libc::dlopen(lib.as_ptr(), libc::RTLD_NOW) };
            if handle.is_null() {
                anyhow::bail!("failed to open libc.so");
            }
            let readv = resolve_symbol(handle, "process_vm_readv")?;
            let writev = resolve_symbol(handle, "process_vm_writev")?;
            let _ = VM_IO.set(VmIoFns { readv, writev });
            Ok(())
        }

        fn vm_readv(pid: i32, local: &mut [u8], remote: u64) -> std::result::Result<usize, Errno> {
            let Some(fns) = VM_IO.get() else {
                return Err(Errno::ENOSYS);
            };
            let local_iov = libc::iovec {
                iov_base: local.as_mut_ptr().cast(),
                iov_len: local.len(),
            };
            let remote_iov = libc::iovec {
                iov_base: remote as *mut libc::c_void,
                iov_len: local.len(),
            };
            let n = unsafe { (fns.readv)(pid, &local_iov, 1, &remote_iov, 1, 0) };
            if n < 0 {
                Err(Errno::last())
            } else {
                Ok(n as usize)
            }
        }

        fn vm_writev(pid: i32, local: &[u8], remote: u64) -> std::result::Result<usize, Errno> {
            let Some(fns) = VM_IO.get() else {
                return Err(Errno::ENOSYS);
            };
            let local_iov = libc::iovec {
                iov_base: local.as_ptr() as *mut libc::c_void,
                iov_len: local.len(),
            };
            let remote_iov = libc::iovec {
                iov_base: remote as *mut libc::c_void,
                iov_len: local.len(),
            };
            let n = unsafe { (fns.writev)(pid, &local_iov, 1, &remote_iov, 1, 0) };
            if n < 0 {
                Err(Errno::last())
            } else {
                Ok(n as usize)
            }
        }
    } else {
        use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
        use std::io::{IoSlice, IoSliceMut};

        pub fn resolve_vm_syscalls() -> Result<()> {
            Ok(())
        }

        fn vm_readv(pid: i32, local: &mut [u8], remote: u64) -> std::result::Result<usize, Errno> {
            let len = local.len();
            process_vm_readv(
                Pid::from_raw(pid),
                &mut [IoSliceMut::new(local)],
                &[RemoteIoVec {
                    base: remote as usize,
                    len,
                }],
            )
        }

        fn vm_writev(pid: i32, local: &[u8], remote: u64) -> std::result::Result<usize, Errno> {
            process_vm_writev(
                Pid::from_raw(pid),
                &[IoSlice::new(local)],
                &[RemoteIoVec {
                    base: remote as usize,
                    len: local.len(),
                }],
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Memory I/O
// ---------------------------------------------------------------------------

/// Read `buf.len()` bytes out of the target. Returns the actual count (short
/// reads are permitted) or `-errno`.
pub fn read_memory(pid: i32, address: u64, buf: &mut [u8]) -> isize {
    if buf.is_empty() {
        return 0;
    }
    match vm_readv(pid, buf, address) {
        Ok(nread) => {
            if nread < buf.len() {
                warn!(
                    "[memagent] partial read from pid {pid}: requested {} bytes, got {nread}",
                    buf.len()
                );
            }
            nread as isize
        }
        Err(errno) => {
            debug!("[memagent] read of {:#x} from pid {pid} failed: {errno}", address);
            -(errno as i32) as isize
        }
    }
}

/// Write `data` into the target. Self-process writes go through
/// `process_vm_writev` after forcing the covering pages `R+W+X`; the
/// protection is intentionally left in place so injected code stays
/// executable. Cross-process writes use a ptrace word loop.
pub fn write_memory(pid: i32, address: u64, data: &[u8]) -> isize {
    if data.is_empty() {
        return 0;
    }
    if pid == current_pid() {
        write_own_memory(address, data)
    } else {
        ptrace_write(Pid::from_raw(pid), address, data)
    }
}

fn write_own_memory(address: u64, data: &[u8]) -> isize {
    use nix::sys::mman::ProtFlags;
    use std::ptr::NonNull;

    let page = page_size() as u64;
    let page_start = address & !(page - 1);
    let page_end = (address + data.len() as u64 + page - 1) & !(page - 1);

    let Some(start) = NonNull::new(page_start as *mut libc::c_void) else {
        error!("[memagent] refusing self-write to the null page");
        return -1;
    };
    let span = (page_end - page_start) as usize;
    let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC;
    if let Err(errno) = unsafe { nix::sys::mman::mprotect(start, span, prot) } {
        error!("[memagent] mprotect of {page_start:#x}+{span:#x} failed: {errno}");
        return -1;
    }

    match vm_writev(current_pid(), data, address) {
        Ok(written) => {
            debug!("[memagent] wrote {written} bytes to own memory at {address:#x}");
            written as isize
        }
        Err(errno) => {
            error!("[memagent] process_vm_writev to self failed: {errno}");
            -1
        }
    }
}

/// Detaches on drop so every exit path of the word loop releases the target.
struct DetachGuard {
    pid: Pid,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        if let Err(errno) = ptrace::detach(self.pid, None) {
            warn!("[memagent] failed to detach from pid {}: {errno}", self.pid);
        }
    }
}

fn peek_word(pid: Pid, addr: u64) -> std::result::Result<libc::c_long, Errno> {
    Errno::clear();
    let value = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKDATA,
            libc::pid_t::from(pid.as_raw()),
            addr as *mut libc::c_void,
            0 as libc::c_long,
        )
    };
    if value == -1 && Errno::last() != Errno::UnknownErrno {
        Err(Errno::last())
    } else {
        Ok(value)
    }
}

fn poke_word(pid: Pid, addr: u64, word: libc::c_long) -> std::result::Result<(), Errno> {
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEDATA,
            libc::pid_t::from(pid.as_raw()),
            addr as *mut libc::c_void,
            word,
        )
    };
    if rc == -1 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

fn ptrace_write(pid: Pid, address: u64, data: &[u8]) -> isize {
    const WORD: usize = std::mem::size_of::<libc::c_long>();

    if let Err(errno) = ptrace::attach(pid) {
        error!("[memagent] failed to attach to pid {pid}: {errno}");
        return -1;
    }
    let _guard = DetachGuard { pid };
    if let Err(errno) = waitpid(pid, None) {
        error!("[memagent] waitpid after attach to pid {pid} failed: {errno}");
        return -1;
    }

    let mut written: usize = 0;
    let mut offset: usize = 0;
    while offset < data.len() {
        let target = address + offset as u64;
        let remaining = data.len() - offset;
        if remaining < WORD {
            // Sub-word tail: read, merge, write back.
            let orig = match peek_word(pid, target) {
                Ok(word) => word,
                Err(errno) => {
                    error!("[memagent] PEEKDATA at {target:#x} failed: {errno}");
                    return -1;
                }
            };
            let mut bytes = orig.to_ne_bytes();
            bytes[..remaining].copy_from_slice(&data[offset..]);
            if let Err(errno) = poke_word(pid, target, libc::c_long::from_ne_bytes(bytes)) {
                error!("[memagent] POKEDATA at {target:#x} failed: {errno}");
                return -1;
            }
            written += remaining;
        } else {
            let mut bytes = [0u8; WORD];
            bytes.copy_from_slice(&data[offset..offset + WORD]);
            if let Err(errno) = poke_word(pid, target, libc::c_long::from_ne_bytes(bytes)) {
                error!("[memagent] POKEDATA at {target:#x} failed: {errno}");
                return -1;
            }
            written += WORD;
        }
        offset += WORD;
    }

    written as isize
}

// ---------------------------------------------------------------------------
// /proc parsing
// ---------------------------------------------------------------------------

struct MapsEntry {
    start: u64,
    end: u64,
    perms: Perms,
    path: Option<String>,
}

fn parse_maps_line(line: &str) -> Option<MapsEntry> {
    // <start>-<end> <perms> <offset> <dev> <inode> [path]
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?.as_bytes();
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().map(|p| p.to_string());

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;

    Some(MapsEntry {
        start,
        end,
        perms: Perms {
            read: perms.first() == Some(&b'r'),
            write: perms.get(1) == Some(&b'w'),
            execute: perms.get(2) == Some(&b'x'),
            share: match perms.get(3) {
                Some(&b's') => ShareMode::Shared,
                Some(&b'p') => ShareMode::Private,
                _ => ShareMode::Unknown,
            },
        },
        path,
    })
}

fn read_maps(pid: i32) -> Result<Vec<MapsEntry>> {
    let path = format!("/proc/{pid}/maps");
    let contents = fs::read_to_string(&path).with_context(|| format!("failed to open {path}"))?;
    Ok(contents.lines().filter_map(parse_maps_line).collect())
}

/// All processes visible in `/proc`, named by their `comm`.
pub fn list_processes() -> Result<Vec<ProcessRecord>> {
    let mut processes = Vec::new();
    for entry in fs::read_dir("/proc").context("failed to open /proc")? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        match fs::read_to_string(entry.path().join("comm")) {
            Ok(comm) => processes.push(ProcessRecord {
                pid,
                name: comm.trim_end_matches('\n').to_string(),
            }),
            // The process may have exited between readdir and the open.
            Err(err) => debug!("[memagent] could not read comm for pid {pid}: {err}"),
        }
    }
    processes.sort_by_key(|p| p.pid);
    Ok(processes)
}

fn headers_match(pid: i32, base: u64, path: &str) -> bool {
    let mut mem_header = [0u8; ELF64_EHDR_SIZE];
    if read_memory(pid, base, &mut mem_header) != ELF64_EHDR_SIZE as isize {
        return false;
    }

    let mut file_header = [0u8; ELF64_EHDR_SIZE];
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    if file.read_exact(&mut file_header).is_err() {
        return false;
    }

    mem_header == file_header
}

fn file_is_elf64(path: &str) -> bool {
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let mut ident = [0u8; 16];
    if file.read_exact(&mut ident).is_err() {
        return false;
    }
    ident[EI_CLASS] == ELFCLASS64
}

/// Modules of the target, admitted only when the on-disk ELF header
/// byte-matches the in-memory header at the mapping base. This filters
/// anonymous and JIT mappings and deduplicates segment splits.
pub fn list_modules(pid: i32) -> Result<Vec<ModuleRecord>> {
    let mut modules = Vec::new();
    for entry in read_maps(pid)? {
        let Some(path) = entry.path.as_deref() else {
            continue;
        };
        if !entry.perms.read || path.is_empty() {
            continue;
        }
        if headers_match(pid, entry.start, path) {
            modules.push(ModuleRecord {
                base: entry.start,
                size: entry.end - entry.start,
                is_64bit: file_is_elf64(path),
                path: path.to_string(),
            });
        }
    }
    Ok(modules)
}

/// The normalized region map. `/proc` mappings are committed by definition.
pub fn regions(pid: i32) -> Result<Vec<RegionRecord>> {
    Ok(read_maps(pid)?
        .into_iter()
        .map(|entry| RegionRecord {
            start: entry.start,
            end: entry.end,
            perms: entry.perms,
            state: RegionState::Committed,
            backing: entry.path,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Process control and info
// ---------------------------------------------------------------------------

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
    let link = format!("/proc/{pid}/exe");
    let path = fs::read_link(&link).with_context(|| format!("failed to readlink {link}"))?;
    Ok(path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::WaitPidFlag;
    use nix::unistd::{fork, ForkResult};
    use std::ptr;
    use std::time::Duration;

    fn own_pid() -> i32 {
        current_pid()
    }

    #[test]
    fn maps_line_parsing() {
        let entry =
            parse_maps_line("00400000-0040b000 r-xp 00000000 08:01 131104 /usr/bin/cat").unwrap();
        assert_eq!(entry.start, 0x400000);
        assert_eq!(entry.end, 0x40b000);
        assert!(entry.perms.read && entry.perms.execute && !entry.perms.write);
        assert_eq!(entry.perms.share, ShareMode::Private);
        assert_eq!(entry.path.as_deref(), Some("/usr/bin/cat"));

        let anon = parse_maps_line("7f0000000000-7f0000001000 rw-s 00000000 00:00 0").unwrap();
        assert!(anon.path.is_none());
        assert_eq!(anon.perms.share, ShareMode::Shared);

        assert!(parse_maps_line("garbage").is_none());
    }

    #[test]
    fn read_own_memory_round_trip() {
        let pattern: Vec<u8> = (0..64u8).collect();
        let mut out = vec![0u8; pattern.len()];
        let n = read_memory(own_pid(), pattern.as_ptr() as u64, &mut out);
        assert_eq!(n, pattern.len() as isize);
        assert_eq!(out, pattern);
    }

    #[test]
    fn zero_sized_ops_are_noops() {
        assert_eq!(read_memory(own_pid(), 0x1000, &mut []), 0);
        assert_eq!(write_memory(own_pid(), 0x1000, &[]), 0);
    }

    #[test]
    fn unmapped_read_returns_negative_errno() {
        let mut out = [0u8; 8];
        let n = read_memory(own_pid(), 0x10, &mut out);
        assert!(n < 0);
    }

    #[test]
    fn write_own_memory_round_trip() {
        let mut target = vec![0xAAu8; 4096];
        let addr = target.as_mut_ptr() as u64;

        let payload = [0x55u8; 16];
        let written = write_memory(own_pid(), addr + 100, &payload);
        assert_eq!(written, payload.len() as isize);

        let mut check = [0u8; 16];
        assert_eq!(read_memory(own_pid(), addr + 100, &mut check), 16);
        assert_eq!(check, payload);
        assert_eq!(target[99], 0xAA);
        assert_eq!(target[116], 0xAA);
    }

    // Keeps the child alive until the parent kills it.
    fn spin_child() -> ! {
        loop {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn cross_process_write_with_subword_tail() {
        // 17 bytes exercises two full words plus the read-modify-write tail.
        static TARGET: [u8; 32] = [0xEE; 32];
        let addr = TARGET.as_ptr() as u64;

        match unsafe { fork() }.expect("fork failed") {
            ForkResult::Child => spin_child(),
            ForkResult::Parent { child } => {
                std::thread::sleep(Duration::from_millis(50));

                let payload: Vec<u8> = (1..=17u8).collect();
                let written = ptrace_write(child, addr, &payload);
                assert_eq!(written, 17);

                let mut check = [0u8; 32];
                assert_eq!(read_memory(child.as_raw(), addr, &mut check), 32);
                assert_eq!(&check[..17], payload.as_slice());
                // Bytes past the tail keep their original value.
                assert_eq!(&check[17..], &[0xEE; 15]);

                kill(child, Signal::SIGKILL).unwrap();
                waitpid(child, None).unwrap();
            }
        }
    }

    #[test]
    fn suspend_freezes_and_resume_thaws() {
        static mut COUNTER: u64 = 0;
        let addr = ptr::addr_of!(COUNTER) as u64;

        match unsafe { fork() }.expect("fork failed") {
            ForkResult::Child => loop {
                unsafe {
                    let v = ptr::read_volatile(ptr::addr_of!(COUNTER));
                    ptr::write_volatile(ptr::addr_of_mut!(COUNTER), v + 1);
                }
            },
            ForkResult::Parent { child } => {
                std::thread::sleep(Duration::from_millis(50));

                assert!(suspend(child.as_raw()));
                let status = waitpid(child, Some(WaitPidFlag::WUNTRACED)).unwrap();
                assert!(matches!(status, nix::sys::wait::WaitStatus::Stopped(_, _)));

                let read_counter = || {
                    let mut buf = [0u8; 8];
                    assert_eq!(read_memory(child.as_raw(), addr, &mut buf), 8);
                    u64::from_ne_bytes(buf)
                };
                let first = read_counter();
                std::thread::sleep(Duration::from_millis(20));
                let second = read_counter();
                assert_eq!(first, second);

                assert!(resume(child.as_raw()));
                kill(child, Signal::SIGKILL).unwrap();
                waitpid(child, None).unwrap();
            }
        }
    }

    #[test]
    fn process_list_contains_self_with_comm_name() {
        let processes = list_processes().unwrap();
        let me = processes
            .iter()
            .find(|p| p.pid == own_pid())
            .expect("own pid missing from process list");
        let comm = fs::read_to_string("/proc/self/comm").unwrap();
        assert_eq!(me.name, comm.trim_end_matches('\n'));
    }

    #[test]
    fn modules_are_elf_backed_and_inside_readable_regions() {
        let modules = list_modules(own_pid()).unwrap();
        assert!(!modules.is_empty(), "expected at least the test binary");

        // Every admitted module still byte-matches its file header.
        for module in &modules {
            assert!(headers_match(own_pid(), module.base, &module.path));
            assert!(module.is_64bit == file_is_elf64(&module.path));
        }

        // Module bases fall inside a readable region of the map.
        let map = regions(own_pid()).unwrap();
        for module in &modules {
            assert!(
                map.iter()
                    .any(|r| r.perms.read && r.start <= module.base && module.base < r.end),
                "module {} at {:#x} not covered by a readable region",
                module.path,
                module.base
            );
        }
    }

    #[test]
    fn regions_are_sorted_and_committed() {
        let map = regions(own_pid()).unwrap();
        assert!(!map.is_empty());
        assert!(map.windows(2).all(|w| w[0].start <= w[1].start));
        assert!(map.iter().all(|r| r.state == RegionState::Committed));
    }
}
