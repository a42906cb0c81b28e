//! Syscall dispatch.
//!
//! Convention: `a7` holds the number, `a0..a5` the arguments, the return
//! value goes back in `a0` and the `ecall` is skipped on return.
//! `SYS_EXEC` never reaches this table; the trap dispatcher handles it
//! inline because it rewrites the trap return address.

use crate::error::SyscallError;
use crate::layout::{PAGE_SIZE, PER_PROC_HEAP};
use crate::proc::KillResult;
use crate::vmm::{MapFlags, Vmm};
use crate::Kernel;
use hematite_vm::devices::uart::{LSR, LSR_DATA_READY, RBR, THR, UART_BASE};
use hematite_vm::{Hart, Memory, PhysAddr, VirtAddr};
use log::{debug, warn};

pub const SYS_READ: u64 = 63;
pub const SYS_WRITE: u64 = 64;
pub const SYS_EXIT: u64 = 93;
pub const SYS_KILL: u64 = 129;
pub const SYS_GETPID: u64 = 172;
pub const SYS_SBRK: u64 = 214;
pub const SYS_FORK: u64 = 220;
pub const SYS_EXEC: u64 = 221;
pub const SYS_WAIT: u64 = 260;
pub const SYS_PS: u64 = 300;
pub const SYS_SUSPEND: u64 = 301;

const ERR: u64 = u64::MAX; // -1

/// How a syscall left the machine.
pub enum SyscallOutcome {
    /// Value for the caller's `a0`; the caller resumes past the `ecall`.
    Return(u64),
    /// The caller was blocked or terminated and another task now owns the
    /// hart; its trap frame must not be touched.
    Scheduled,
}

pub fn dispatch(
    kernel: &mut Kernel,
    hart: &mut Hart,
    memory: &mut dyn Memory,
    num: u64,
    args: [u64; 6],
    mepc: u64,
) -> SyscallOutcome {
    debug!("syscall: num={} a0={:#x} a1={:#x}", num, args[0], args[1]);
    match num {
        SYS_WRITE => SyscallOutcome::Return(sys_write(kernel, memory, args)),
        SYS_READ => SyscallOutcome::Return(sys_read(kernel, memory, args)),
        SYS_EXIT => {
            kernel.procs.exit_current(
                hart,
                &mut kernel.palloc,
                &mut kernel.vmm,
                memory,
            );
            SyscallOutcome::Scheduled
        }
        SYS_KILL => sys_kill(kernel, hart, memory, args[0] as i64),
        SYS_GETPID => SyscallOutcome::Return(
            kernel
                .procs
                .current_pid()
                .map(|pid| pid as u64)
                .unwrap_or(ERR),
        ),
        SYS_SBRK => SyscallOutcome::Return(sys_sbrk(kernel, memory, args[0] as i64)),
        SYS_FORK => {
            let forked = kernel.procs.fork(
                hart,
                &mut kernel.palloc,
                &mut kernel.vmm,
                memory,
                mepc,
            );
            match forked {
                Ok(child) => SyscallOutcome::Return(child as u64),
                Err(e) => {
                    warn!("fork failed: {}", e);
                    SyscallOutcome::Return(ERR)
                }
            }
        }
        SYS_WAIT => sys_wait(kernel, hart, memory),
        SYS_PS => {
            kernel.procs.dump();
            SyscallOutcome::Return(0)
        }
        SYS_SUSPEND => {
            // Resumes after the ecall if the task is ever woken again.
            if let Some(pcb) = kernel.procs.current_mut() {
                pcb.regstat.sepc = mepc + 4;
                pcb.regstat.x10 = 0;
            }
            let caller = kernel.procs.current_pid();
            kernel.procs.suspend_current(
                hart,
                &mut kernel.palloc,
                &mut kernel.vmm,
                memory,
            );
            if kernel.procs.current_pid() == caller {
                // idle refused to suspend
                SyscallOutcome::Return(0)
            } else {
                SyscallOutcome::Scheduled
            }
        }
        other => {
            warn!("{}", SyscallError::InvalidSyscallNumber(other));
            SyscallOutcome::Return(ERR)
        }
    }
}

fn sys_write(kernel: &mut Kernel, memory: &mut dyn Memory, args: [u64; 6]) -> u64 {
    let (_fd, buf_ptr, len) = (args[0], args[1], args[2] as usize);
    let len = len.min(4096);
    let mut buf = vec![0u8; len];
    if copy_from_user(&kernel.vmm, memory, VirtAddr::new(buf_ptr), &mut buf).is_err() {
        return ERR;
    }
    console_write(memory, &buf);
    len as u64
}

fn sys_read(kernel: &mut Kernel, memory: &mut dyn Memory, args: [u64; 6]) -> u64 {
    let (_fd, buf_ptr, len) = (args[0], args[1], args[2] as usize);
    if len == 0 {
        return 0;
    }

    let mut read_buf = Vec::new();

    // First byte; nothing buffered means nothing to return.
    let val = match memory.read_word(PhysAddr::new(UART_BASE + RBR)) {
        Ok(v) => v,
        Err(_) => return ERR,
    };
    if val == 0 {
        return 0;
    }
    read_buf.push(val as u8);

    // Drain what is already there, up to the buffer or a line end.
    let limit = len.min(1024);
    while read_buf.len() < limit {
        let lsr = match memory.read_word(PhysAddr::new(UART_BASE + LSR)) {
            Ok(v) => v,
            Err(_) => break,
        };
        if lsr & LSR_DATA_READY == 0 {
            break;
        }
        let val = match memory.read_word(PhysAddr::new(UART_BASE + RBR)) {
            Ok(v) => v,
            Err(_) => break,
        };
        if val == 0 {
            break;
        }
        read_buf.push(val as u8);
        if val == 10 || val == 13 {
            break;
        }
    }

    if copy_to_user(&kernel.vmm, memory, &read_buf, VirtAddr::new(buf_ptr)).is_err() {
        return ERR;
    }
    read_buf.len() as u64
}

fn sys_kill(
    kernel: &mut Kernel,
    hart: &mut Hart,
    memory: &mut dyn Memory,
    pid: i64,
) -> SyscallOutcome {
    let result = kernel.procs.kill(
        hart,
        &mut kernel.palloc,
        &mut kernel.vmm,
        memory,
        pid as i32,
    );
    match result {
        KillResult::Killed => SyscallOutcome::Return(0),
        KillResult::KilledSelf => SyscallOutcome::Scheduled,
        KillResult::NotFound => SyscallOutcome::Return(ERR),
    }
}

/// Wait for a child to exit and reap it. With no zombie child available
/// the caller blocks; its saved `sepc` still points at the `ecall` (the
/// trap entry snapshot), so being woken re-runs the scan.
fn sys_wait(kernel: &mut Kernel, hart: &mut Hart, memory: &mut dyn Memory) -> SyscallOutcome {
    let reaped = kernel.procs.reap_child(
        hart,
        &mut kernel.palloc,
        &mut kernel.vmm,
        memory,
    );
    match reaped {
        Some(pid) => SyscallOutcome::Return(pid as u64),
        None => {
            kernel.procs.block_current(
                hart,
                &mut kernel.palloc,
                &mut kernel.vmm,
                memory,
            );
            SyscallOutcome::Scheduled
        }
    }
}

/// Grow the user heap. The first growth claims this process's heap
/// window; growth is page-granular and capped at the per-process limit.
/// Returns the old break, or -1 on failure (shrinking is unsupported).
fn sys_sbrk(kernel: &mut Kernel, memory: &mut dyn Memory, increment: i64) -> u64 {
    let Some(pcb) = kernel.procs.current_mut() else {
        return ERR;
    };
    if pcb.brk_base == 0 {
        pcb.brk_base = crate::layout::HEAP_USER_BASE + pcb.pid as u64 * PER_PROC_HEAP;
    }
    let brk_base = pcb.brk_base;
    let brk_size = pcb.brk_size;
    let old_break = brk_base + brk_size;

    if increment == 0 {
        return old_break;
    }
    if increment < 0 {
        return ERR;
    }

    let new_size = brk_size + increment as u64;
    if new_size > PER_PROC_HEAP {
        return ERR;
    }

    let old_pages = brk_size.div_ceil(PAGE_SIZE);
    let new_pages = new_size.div_ceil(PAGE_SIZE);
    for i in old_pages..new_pages {
        let va = VirtAddr::new(brk_base + i * PAGE_SIZE);
        if let Err(e) = kernel.vmm.map_page(
            &mut kernel.palloc,
            memory,
            va,
            MapFlags::RW | MapFlags::USER,
        ) {
            warn!("sbrk: map failed at {:#x}: {}", va.val(), e);
            for j in old_pages..i {
                let rollback = VirtAddr::new(brk_base + j * PAGE_SIZE);
                let _ = kernel.vmm.unmap(&mut kernel.palloc, memory, rollback, true);
            }
            return ERR;
        }
    }

    kernel.procs.current_mut().unwrap().brk_size = new_size;
    old_break
}

pub(crate) fn console_write(memory: &mut dyn Memory, bytes: &[u8]) {
    for &b in bytes {
        let _ = memory.write_word(PhysAddr::new(UART_BASE + THR), b as u32);
    }
}

// User memory access goes through the kernel page table, one byte at a
// time; user buffers are not necessarily identity-mapped (the sbrk heap
// is not).

pub(crate) fn copy_from_user(
    vmm: &Vmm,
    memory: &mut dyn Memory,
    src: VirtAddr,
    dest: &mut [u8],
) -> Result<(), SyscallError> {
    for (i, byte) in dest.iter_mut().enumerate() {
        let va = src + i as u64;
        let pa = vmm
            .translate(memory, va)
            .ok_or(SyscallError::BadAddress(va.val()))?;
        *byte = memory
            .read_byte(pa)
            .map_err(|_| SyscallError::BadAddress(va.val()))?;
    }
    Ok(())
}

pub(crate) fn copy_to_user(
    vmm: &Vmm,
    memory: &mut dyn Memory,
    src: &[u8],
    dest: VirtAddr,
) -> Result<(), SyscallError> {
    for (i, byte) in src.iter().enumerate() {
        let va = dest + i as u64;
        let pa = vmm
            .translate(memory, va)
            .ok_or(SyscallError::BadAddress(va.val()))?;
        memory
            .write_byte(pa, *byte)
            .map_err(|_| SyscallError::BadAddress(va.val()))?;
    }
    Ok(())
}

/// Read a NUL-terminated string out of user memory (bounded).
pub(crate) fn read_user_cstr(
    vmm: &Vmm,
    memory: &mut dyn Memory,
    ptr: VirtAddr,
    max: usize,
) -> Result<String, SyscallError> {
    let mut bytes = Vec::new();
    for i in 0..max {
        let mut byte = [0u8];
        copy_from_user(vmm, memory, ptr + i as u64, &mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
