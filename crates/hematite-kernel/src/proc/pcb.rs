use hematite_vm::{Hart, Register, CSR_MEPC, CSR_MSTATUS, MSTATUS_MPIE, MSTATUS_MPP_MACHINE};

/// Process identifier. Pid 0 is reserved for the idle process.
pub type Pid = i32;

pub const IDLE_PID: Pid = 0;

/// Process name limit: 19 bytes plus the implicit terminator of the
/// original layout.
pub const NAME_MAX: usize = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// Saved context of a suspended task: the integer register subset the
/// trap path actually carries (`ra`, `t0..t2`, `a0..a7`), the stack
/// pointer, the resume pc (`sepc`) and `mstatus`.
///
/// Registers outside this set do not survive a context switch; the
/// restore zeroes them so nothing leaks between tasks and nothing can
/// rely on them by accident.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegState {
    pub x1: u64, // ra
    pub x5: u64, // t0
    pub x6: u64, // t1
    pub x7: u64, // t2
    pub x10: u64, // a0
    pub x11: u64,
    pub x12: u64,
    pub x13: u64,
    pub x14: u64,
    pub x15: u64,
    pub x16: u64,
    pub x17: u64, // a7
    pub sp: u64,
    pub sepc: u64,
    pub mstatus: u64,
}

impl RegState {
    /// Initial context for a fresh task: resume at `entrypoint` with the
    /// given stack, previous-privilege machine and previous-interrupt
    /// enable set, so the first restore enters the task with interrupts on.
    pub fn initial(entrypoint: u64, stacktop: u64) -> Self {
        Self {
            sepc: entrypoint,
            sp: stacktop,
            mstatus: MSTATUS_MPP_MACHINE | MSTATUS_MPIE,
            ..Self::default()
        }
    }

    /// Load this context into the hart and perform the `mret`: pc from
    /// `sepc`, interrupt enable from the saved MPIE.
    pub fn restore_to(&self, hart: &mut Hart) {
        hart.regs = [0; 32];
        hart.write_reg(Register::RA, self.x1);
        hart.write_reg(Register::T0, self.x5);
        hart.write_reg(Register::T1, self.x6);
        hart.write_reg(Register::T2, self.x7);
        hart.write_reg(Register::A0, self.x10);
        hart.write_reg(Register::A1, self.x11);
        hart.write_reg(Register::A2, self.x12);
        hart.write_reg(Register::A3, self.x13);
        hart.write_reg(Register::A4, self.x14);
        hart.write_reg(Register::A5, self.x15);
        hart.write_reg(Register::A6, self.x16);
        hart.write_reg(Register::A7, self.x17);
        hart.write_reg(Register::SP, self.sp);
        hart.csr_write(CSR_MSTATUS, self.mstatus);
        hart.csr_write(CSR_MEPC, self.sepc);
        hart.mret();
    }

    /// Snapshot the hart (used for the boot context on the first switch).
    pub fn capture_from(hart: &Hart) -> Self {
        Self {
            x1: hart.read_reg(Register::RA),
            x5: hart.read_reg(Register::T0),
            x6: hart.read_reg(Register::T1),
            x7: hart.read_reg(Register::T2),
            x10: hart.read_reg(Register::A0),
            x11: hart.read_reg(Register::A1),
            x12: hart.read_reg(Register::A2),
            x13: hart.read_reg(Register::A3),
            x14: hart.read_reg(Register::A4),
            x15: hart.read_reg(Register::A5),
            x16: hart.read_reg(Register::A6),
            x17: hart.read_reg(Register::A7),
            sp: hart.read_reg(Register::SP),
            sepc: hart.csr.mepc,
            mstatus: hart.csr.mstatus,
        }
    }
}

/// Process control block.
pub struct Pcb {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: String,
    pub state: ProcState,
    pub prior: i32,
    pub entrypoint: u64,
    pub regstat: RegState,
    /// One past the end of the kernel stack page.
    pub stacktop: u64,
    /// User heap: base virtual address and current byte length.
    pub brk_base: u64,
    pub brk_size: u64,
}

impl Pcb {
    pub fn stack_base(&self) -> u64 {
        self.stacktop - crate::layout::PAGE_SIZE
    }

    pub fn heap_pages(&self) -> u64 {
        self.brk_size.div_ceil(crate::layout::PAGE_SIZE)
    }
}

/// Cap a process name at `NAME_MAX` bytes (not characters); a multi-byte
/// character straddling the cap is dropped whole so the result stays
/// valid UTF-8 within the byte limit.
pub fn truncate_name(name: &str) -> String {
    let mut n = name.len().min(NAME_MAX);
    while !name.is_char_boundary(n) {
        n -= 1;
    }
    name[..n].to_string()
}
