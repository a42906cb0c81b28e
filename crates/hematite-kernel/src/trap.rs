//! Machine-mode trap dispatcher.
//!
//! Every trap carves a 128-byte frame on the interrupted stack in guest
//! memory (slot order `ra, t0, t1, t2, a0..a5, a6, a7`), mirrors it into
//! the current PCB's saved context, and dispatches on `mcause`:
//! environment calls go to the syscall table (`exec` is special-cased
//! here because it rewrites the trap return address), the timer tick
//! drives the scheduler, external interrupts are claimed from the PLIC
//! and routed to the block driver.
//!
//! On the way out, either the frame is popped and `mret` applied (no
//! context switch happened), or the hart already carries the next task's
//! restored context and is left alone.

use crate::syscall::{self, SyscallOutcome, SYS_EXEC};
use crate::Kernel;
use hematite_vm::devices::plic::{PLIC_BASE, PLIC_CLAIM};
use hematite_vm::{
    Hart, Memory, MemoryError, PhysAddr, Register, TrapCause, TrapError, VirtAddr, CSR_MEPC,
    MCAUSE_INTERRUPT_BIT,
};
use log::{debug, error, warn};

pub const TRAP_FRAME_SIZE: u64 = 128;

/// Registers saved in the trap frame, in slot order.
const FRAME_REGS: [Register; 12] = [
    Register::RA,
    Register::T0,
    Register::T1,
    Register::T2,
    Register::A0,
    Register::A1,
    Register::A2,
    Register::A3,
    Register::A4,
    Register::A5,
    Register::A6,
    Register::A7,
];

const A0_SLOT: u64 = 4;
const A1_SLOT: u64 = 5;

fn push_frame(hart: &mut Hart, memory: &mut dyn Memory) -> Result<u64, MemoryError> {
    let sp = hart.read_reg(Register::SP);
    let tf = sp - TRAP_FRAME_SIZE;
    for (i, reg) in FRAME_REGS.iter().enumerate() {
        memory.write_dword(PhysAddr::new(tf + i as u64 * 8), hart.read_reg(*reg))?;
    }
    hart.write_reg(Register::SP, tf);
    Ok(tf)
}

fn pop_frame(hart: &mut Hart, memory: &mut dyn Memory, tf: u64) -> Result<(), MemoryError> {
    for (i, reg) in FRAME_REGS.iter().enumerate() {
        let val = memory.read_dword(PhysAddr::new(tf + i as u64 * 8))?;
        hart.write_reg(*reg, val);
    }
    hart.write_reg(Register::SP, tf + TRAP_FRAME_SIZE);
    Ok(())
}

fn read_frame(memory: &mut dyn Memory, tf: u64) -> Result<[u64; 12], MemoryError> {
    let mut frame = [0u64; 12];
    for (i, slot) in frame.iter_mut().enumerate() {
        *slot = memory.read_dword(PhysAddr::new(tf + i as u64 * 8))?;
    }
    Ok(frame)
}

fn write_slot(
    memory: &mut dyn Memory,
    tf: u64,
    slot: u64,
    val: u64,
) -> Result<(), MemoryError> {
    memory.write_dword(PhysAddr::new(tf + slot * 8), val)
}

fn frame_err(e: MemoryError) -> TrapError {
    TrapError::Fatal(format!("trap frame access failed: {}", e))
}

pub fn handle(
    kernel: &mut Kernel,
    _cause: TrapCause,
    hart: &mut Hart,
    memory: &mut dyn Memory,
) -> Result<VirtAddr, TrapError> {
    // Cause decode goes through the latched CSRs, same as the hardware
    // path would.
    let mcause = hart.csr.mcause;
    let mepc = hart.csr.mepc;
    let mtval = hart.csr.mtval;
    let mstatus = hart.csr.mstatus;

    let entry_current = kernel.procs.current_pid();
    let tf = push_frame(hart, memory).map_err(frame_err)?;
    let frame = read_frame(memory, tf).map_err(frame_err)?;

    // The saved context must reflect the state at trap time: fork copies
    // it, and a context switch resumes from it. The real stack pointer
    // before the trap is tf + frame size.
    kernel
        .procs
        .update_current_regstat(&frame, mepc, tf + TRAP_FRAME_SIZE, mstatus);

    let is_interrupt = mcause & MCAUSE_INTERRUPT_BIT != 0;
    let code = mcause & !MCAUSE_INTERRUPT_BIT;

    if !is_interrupt {
        match code {
            // ecall from U- or M-mode
            8 | 11 => {
                let num = frame[11]; // a7
                let args = [frame[4], frame[5], frame[6], frame[7], frame[8], frame[9]];

                if num == SYS_EXEC {
                    handle_exec(kernel, hart, memory, tf, frame[4], mepc)?;
                } else {
                    match syscall::dispatch(kernel, hart, memory, num, args, mepc) {
                        SyscallOutcome::Return(ret) => {
                            write_slot(memory, tf, A0_SLOT, ret).map_err(frame_err)?;
                            hart.csr_write(CSR_MEPC, mepc + 4);
                        }
                        SyscallOutcome::Scheduled => {}
                    }
                }
            }
            _ => {
                // Any other exception collapses the offending process so a
                // fault loop cannot wedge the machine.
                error!(
                    "trap: exception code={} mepc={:#x} mtval={:#x}",
                    code, mepc, mtval
                );
                match kernel.procs.current_pid() {
                    Some(pid) => {
                        error!("trap: process {} faulted, exiting", pid);
                        kernel.procs.exit_current(
                            hart,
                            &mut kernel.palloc,
                            &mut kernel.vmm,
                            memory,
                        );
                    }
                    None => return Err(TrapError::Halt),
                }
            }
        }
    } else {
        match code {
            // machine timer: reprogram the next tick, then round-robin
            7 => {
                kernel.set_next_timer(memory);
                kernel.procs.schedule(
                    hart,
                    &mut kernel.palloc,
                    &mut kernel.vmm,
                    memory,
                );
            }
            // machine external: claim, route, complete
            11 => handle_external(kernel, memory),
            _ => {
                error!("trap: unknown interrupt code={}", code);
                return Err(TrapError::Halt);
            }
        }
    }

    // No switch: pop the frame (picking up any written return slot) and
    // return past the trap. Otherwise the hart already holds the next
    // task's context.
    if kernel.procs.current_pid() == entry_current {
        pop_frame(hart, memory, tf).map_err(frame_err)?;
        hart.mret();
    }
    Ok(VirtAddr::new(hart.pc))
}

/// `exec`: look the program up by name and rewrite the trap return so the
/// caller resumes at the new entry point with `a0 = 0, a1 = 0`. The
/// process image (PCB, stack, heap) is otherwise unchanged. On a failed
/// lookup the caller gets -1 and resumes past the `ecall`.
fn handle_exec(
    kernel: &mut Kernel,
    hart: &mut Hart,
    memory: &mut dyn Memory,
    tf: u64,
    name_ptr: u64,
    mepc: u64,
) -> Result<(), TrapError> {
    let name = syscall::read_user_cstr(&kernel.vmm, memory, VirtAddr::new(name_ptr), 32);
    let entry = match &name {
        Ok(name) => kernel.fs.lookup(name),
        Err(_) => None,
    };

    match entry {
        Some(entry) => {
            debug!("exec: {:?} -> {:#x}", name.as_deref().unwrap_or("?"), entry);
            write_slot(memory, tf, A0_SLOT, 0).map_err(frame_err)?;
            write_slot(memory, tf, A1_SLOT, 0).map_err(frame_err)?;
            hart.csr_write(CSR_MEPC, entry);
        }
        None => {
            warn!("exec: lookup failed for {:?}", name.as_deref().unwrap_or("?"));
            write_slot(memory, tf, A0_SLOT, u64::MAX).map_err(frame_err)?;
            hart.csr_write(CSR_MEPC, mepc + 4);
        }
    }
    Ok(())
}

fn handle_external(kernel: &mut Kernel, memory: &mut dyn Memory) {
    let claim_addr = PhysAddr::new(PLIC_BASE + PLIC_CLAIM);
    let irq = match memory.read_word(claim_addr) {
        Ok(irq) => irq,
        Err(e) => {
            warn!("plic claim failed: {}", e);
            return;
        }
    };
    if irq == 0 {
        return;
    }

    if (1..=8).contains(&irq) {
        kernel.blk.intr(memory);
    } else {
        warn!("trap: unexpected irq {}", irq);
    }

    // Completion is mandatory or the source stays masked.
    if let Err(e) = memory.write_word(claim_addr, irq) {
        warn!("plic complete failed: {}", e);
    }
}
