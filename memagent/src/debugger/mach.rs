//! Mach plumbing for the ARM64 debugger: task and thread ports, the
//! exception port receiving `mach_exception_raise` messages, and thread
//! state read/write for the three flavors the resume dance touches.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error, warn};
use mach2::exception_types::{EXCEPTION_DEFAULT, EXC_MASK_BREAKPOINT, MACH_EXCEPTION_CODES};
use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::mach_port::{mach_port_allocate, mach_port_deallocate, mach_port_insert_right};
use mach2::message::{
    mach_msg, mach_msg_body_t, mach_msg_header_t, mach_msg_port_descriptor_t,
    MACH_MSGH_BITS_REMOTE_MASK, MACH_MSG_SUCCESS, MACH_MSG_TYPE_MAKE_SEND, MACH_RCV_MSG,
    MACH_RCV_TIMED_OUT, MACH_RCV_TIMEOUT, MACH_SEND_MSG,
};
use mach2::port::{mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_RECEIVE};
use mach2::task::{task_set_exception_ports, task_threads};
use mach2::thread_act::{thread_get_state, thread_set_state};
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::mach_vm_deallocate;
use mach2::vm_types::natural_t;

use super::arm64::{CPSR_SS, MDSCR_SS};
use super::KERN_FAILURE;

pub type PortName = mach_port_t;
pub type TaskPort = mach_port_t;

pub const EXC_BREAKPOINT: i32 = 6;
pub const EXC_ARM_DA_DEBUG: i64 = 0x102;

const ARM_THREAD_STATE64: u32 = 6;
const ARM_DEBUG_STATE64: u32 = 15;

// Receive slot sized for the largest trailer the kernel may append.
const TRAILER_SPACE: usize = 64;
// msgh id of mach_exception_raise; the reply id is offset by 100.
const EXCEPTION_RAISE_ID: i32 = 2405;
const RECEIVE_TIMEOUT_MS: u32 = 100;

#[repr(C)]
#[derive(Clone, Copy)]
struct ArmThreadState64 {
    x: [u64; 29],
    fp: u64,
    lr: u64,
    sp: u64,
    pc: u64,
    cpsr: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ArmDebugState64 {
    bvr: [u64; 16],
    bcr: [u64; 16],
    wvr: [u64; 16],
    wcr: [u64; 16],
    mdscr_el1: u64,
}

fn state_count<T>() -> u32 {
    (mem::size_of::<T>() / mem::size_of::<natural_t>()) as u32
}

// Wire layout of mach_exception_raise with MACH_EXCEPTION_CODES; mach
// messages are 4-byte packed, so the 64-bit codes sit unaligned.
#[repr(C, packed(4))]
struct ExceptionRequest {
    header: mach_msg_header_t,
    body: mach_msg_body_t,
    thread: mach_msg_port_descriptor_t,
    task: mach_msg_port_descriptor_t,
    ndr: [u8; 8],
    exception: i32,
    code_count: u32,
    code: [i64; 2],
    trailer: [u8; TRAILER_SPACE],
}

#[repr(C, packed(4))]
struct ExceptionReply {
    header: mach_msg_header_t,
    ndr: [u8; 8],
    ret_code: kern_return_t,
}

pub fn task_port(pid: i32) -> Result<TaskPort, i32> {
    let mut task: mach_port_t = 0;
    let kr = unsafe { task_for_pid(mach_task_self(), pid, &mut task) };
    if kr != KERN_SUCCESS {
        error!("[memagent] task_for_pid({pid}) failed: {kr}");
        return Err(kr);
    }
    Ok(task)
}

/// Allocate the exception port and route the task's breakpoint exceptions
/// to it, codes in 64-bit form, thread state flavor ARM_THREAD_STATE64.
pub fn install_exception_port(task: TaskPort) -> Result<PortName, i32> {
    let me = unsafe { mach_task_self() };
    let mut port: mach_port_t = 0;

    let kr = unsafe { mach_port_allocate(me, MACH_PORT_RIGHT_RECEIVE, &mut port) };
    if kr != KERN_SUCCESS {
        error!("[memagent] mach_port_allocate failed: {kr}");
        return Err(kr);
    }

    let kr = unsafe { mach_port_insert_right(me, port, port, MACH_MSG_TYPE_MAKE_SEND) };
    if kr != KERN_SUCCESS {
        error!("[memagent] mach_port_insert_right failed: {kr}");
        release_port(port);
        return Err(kr);
    }

    let kr = unsafe {
        task_set_exception_ports(
            task,
            EXC_MASK_BREAKPOINT,
            port,
            (EXCEPTION_DEFAULT as u32 | MACH_EXCEPTION_CODES as u32) as _,
            ARM_THREAD_STATE64 as _,
        )
    };
    if kr != KERN_SUCCESS {
        error!("[memagent] task_set_exception_ports failed: {kr}");
        release_port(port);
        return Err(kr);
    }

    Ok(port)
}

pub fn release_port(port: PortName) {
    if port != MACH_PORT_NULL {
        unsafe { mach_port_deallocate(mach_task_self(), port) };
    }
}

/// Snapshot of the task's thread ports. The kernel-allocated array is
/// released here; the port rights themselves are the caller's to release.
pub fn task_thread_list(task: TaskPort) -> Vec<PortName> {
    let mut threads: *mut mach_port_t = std::ptr::null_mut();
    let mut count: u32 = 0;
    let kr = unsafe { task_threads(task, &mut threads, &mut count) };
    if kr != KERN_SUCCESS {
        warn!("[memagent] task_threads failed: {kr}");
        return Vec::new();
    }

    let list = unsafe { std::slice::from_raw_parts(threads, count as usize) }.to_vec();
    unsafe {
        mach_vm_deallocate(
            mach_task_self(),
            threads as u64,
            (count as usize * mem::size_of::<mach_port_t>()) as u64,
        );
    }
    list
}

fn get_state<T: Copy>(thread: PortName, flavor: u32) -> Result<T, kern_return_t> {
    let mut state: T = unsafe { mem::zeroed() };
    let mut count = state_count::<T>();
    let kr = unsafe {
        thread_get_state(
            thread,
            flavor as _,
            &mut state as *mut T as *mut natural_t,
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        return Err(kr);
    }
    Ok(state)
}

fn set_state<T: Copy>(thread: PortName, flavor: u32, state: &T) -> Result<(), kern_return_t> {
    let kr = unsafe {
        thread_set_state(
            thread,
            flavor as _,
            state as *const T as *mut natural_t,
            state_count::<T>(),
        )
    };
    if kr != KERN_SUCCESS {
        return Err(kr);
    }
    Ok(())
}

pub fn thread_pc(thread: PortName) -> Result<u64, kern_return_t> {
    get_state::<ArmThreadState64>(thread, ARM_THREAD_STATE64).map(|s| s.pc)
}

/// Program one DBGWVR/DBGWCR pair on a thread. Zero value and control
/// disable the slot.
pub fn write_watch_slot(
    thread: PortName,
    index: usize,
    value: u64,
    control: u64,
) -> Result<(), kern_return_t> {
    if index >= 16 {
        return Err(KERN_FAILURE);
    }
    let mut state = get_state::<ArmDebugState64>(thread, ARM_DEBUG_STATE64)?;
    state.wvr[index] = value;
    state.wcr[index] = control;
    set_state(thread, ARM_DEBUG_STATE64, &state)
}

pub fn write_break_slot(
    thread: PortName,
    index: usize,
    value: u64,
    control: u64,
) -> Result<(), kern_return_t> {
    if index >= 16 {
        return Err(KERN_FAILURE);
    }
    let mut state = get_state::<ArmDebugState64>(thread, ARM_DEBUG_STATE64)?;
    state.bvr[index] = value;
    state.bcr[index] = control;
    set_state(thread, ARM_DEBUG_STATE64, &state)
}

/// Arm or clear the one-instruction step: MDSCR_EL1.SS in the debug state
/// plus PSTATE.SS in the saved CPSR.
pub fn set_single_step(thread: PortName, enable: bool) -> Result<(), kern_return_t> {
    let mut debug = get_state::<ArmDebugState64>(thread, ARM_DEBUG_STATE64)?;
    if enable {
        debug.mdscr_el1 |= MDSCR_SS;
    } else {
        debug.mdscr_el1 &= !MDSCR_SS;
    }
    set_state(thread, ARM_DEBUG_STATE64, &debug)?;

    let mut state = get_state::<ArmThreadState64>(thread, ARM_THREAD_STATE64)?;
    if enable {
        state.cpsr |= CPSR_SS as u32;
    } else {
        state.cpsr &= !(CPSR_SS as u32);
    }
    set_state(thread, ARM_THREAD_STATE64, &state)
}

pub fn spawn_exception_server(port: PortName, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("memagent-exc".to_string())
        .spawn(move || exception_server_loop(port, shutdown))
        .expect("failed to spawn exception server thread")
}

/// Blocking receive loop with a short timeout so the shutdown flag is
/// honored. Each request is dispatched into the debugger and answered with
/// the handler's status; the kernel resumes the thread on KERN_SUCCESS.
fn exception_server_loop(port: PortName, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Acquire) {
        let mut request: ExceptionRequest = unsafe { mem::zeroed() };
        let kr = unsafe {
            mach_msg(
                &mut request.header,
                MACH_RCV_MSG | MACH_RCV_TIMEOUT,
                0,
                mem::size_of::<ExceptionRequest>() as u32,
                port,
                RECEIVE_TIMEOUT_MS,
                MACH_PORT_NULL,
            )
        };
        if kr == MACH_RCV_TIMED_OUT {
            continue;
        }
        if kr != MACH_MSG_SUCCESS {
            warn!("[memagent] exception receive failed: {kr:#x}");
            continue;
        }

        // Copy out of the packed message before touching the fields.
        let header = request.header;
        let thread = request.thread.name;
        let task = request.task.name;
        let exception = request.exception;
        let codes = request.code;
        let code_count = (request.code_count as usize).min(codes.len());

        if header.msgh_id != EXCEPTION_RAISE_ID {
            debug!("[memagent] unexpected message id {}", header.msgh_id);
        }

        let status = super::dispatch_exception(thread, exception, &codes[..code_count]);
        send_reply(&request, status);

        release_port(thread);
        release_port(task);
    }
}

fn send_reply(request: &ExceptionRequest, status: kern_return_t) {
    let header = request.header;
    let mut reply: ExceptionReply = unsafe { mem::zeroed() };
    reply.header.msgh_bits = header.msgh_bits & MACH_MSGH_BITS_REMOTE_MASK;
    reply.header.msgh_remote_port = header.msgh_remote_port;
    reply.header.msgh_local_port = MACH_PORT_NULL;
    reply.header.msgh_id = header.msgh_id + 100;
    reply.header.msgh_size = mem::size_of::<ExceptionReply>() as u32;
    reply.ndr = request.ndr;
    reply.ret_code = status;

    let kr = unsafe {
        mach_msg(
            &mut reply.header,
            MACH_SEND_MSG,
            mem::size_of::<ExceptionReply>() as u32,
            0,
            MACH_PORT_NULL,
            0,
            MACH_PORT_NULL,
        )
    };
    if kr != MACH_MSG_SUCCESS {
        error!("[memagent] exception reply failed: {kr:#x}");
    }
}
