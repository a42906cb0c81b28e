//! The Hematite kernel.
//!
//! A host-run teaching kernel for a simulated RV64 machine: the kernel is
//! the machine's trap handler, and everything architecturally visible
//! (page tables, kernel stacks, user heaps, trap frames) lives in guest
//! physical memory. One hart, machine mode only, identity-mapped Sv39,
//! round-robin preemptive scheduling, a UNIX-style process lifecycle.

pub mod blk;
pub mod error;
pub mod fs;
pub mod layout;
pub mod palloc;
pub mod proc;
pub mod syscall;
pub mod trap;
pub mod vmm;

use blk::BlkDriver;
use error::KernelError;
use fs::ProgramTable;
use hematite_vm::devices::clint::{CLINT_MTIME, CLINT_MTIMECMP};
use hematite_vm::devices::plic::{PLIC_BASE, PLIC_ENABLE, PLIC_PRIORITY_BASE, PLIC_THRESHOLD};
use hematite_vm::{
    Hart, Memory, PhysAddr, Register, TrapCause, TrapError, TrapHandler, VirtAddr, CSR_MIE,
    MIE_MEIE, MIE_MTIE, RAM_BASE,
};
use layout::{BOOT_PARK, BOOT_STACK_TOP, HEAP_START, RAM_SIZE_DEFAULT, TIMER_INTERVAL};
use log::info;
use palloc::FrameAllocator;
use proc::ProcManager;
use vmm::Vmm;

/// Boot parking loop, pre-encoded: `wfi; j -4`. The boot hart sits here
/// until the first timer tick schedules real work.
const PARK_CODE: [u32; 2] = [0x1050_0073, 0xffdf_f06f];

pub struct KernelConfig {
    /// Kernel page heap extent (the platform's `_heap_start`/`_heap_end`).
    pub heap_start: u64,
    pub heap_end: u64,
    /// mtime units between scheduler ticks.
    pub timer_interval: u64,
}

impl KernelConfig {
    pub fn for_ram_size(ram_size: u64) -> Self {
        Self {
            heap_start: HEAP_START,
            heap_end: RAM_BASE + ram_size,
            timer_interval: TIMER_INTERVAL,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::for_ram_size(RAM_SIZE_DEFAULT)
    }
}

pub struct Kernel {
    pub config: KernelConfig,
    pub palloc: FrameAllocator,
    pub vmm: Vmm,
    pub procs: ProcManager,
    pub fs: ProgramTable,
    pub blk: BlkDriver,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            palloc: FrameAllocator::new(),
            vmm: Vmm::new(),
            procs: ProcManager::new(),
            fs: ProgramTable::new(),
            blk: BlkDriver::new(),
        }
    }

    /// Bring the machine up: console, traps, PLIC, the physical
    /// allocator, the VMM (built and activated), the scheduler, the block
    /// device and the program table; then create the shell and park the
    /// boot hart with interrupts enabled. The first timer tick performs
    /// the first switch.
    ///
    /// `programs` are built-in flat binaries (name, image) registered
    /// before the disk directory is consulted.
    pub fn boot(
        &mut self,
        hart: &mut Hart,
        memory: &mut dyn Memory,
        programs: &[(&str, &[u8])],
    ) -> Result<(), KernelError> {
        syscall::console_write(memory, b"hematite kernel booting\n");
        info!("boot: initializing kernel");

        self.trap_init(hart, memory);
        plic_init(memory);

        self.palloc.init(self.config.heap_start, self.config.heap_end);
        let ram_size = self.config.heap_end - RAM_BASE;
        self.vmm.init(&mut self.palloc, memory, ram_size)?;
        self.vmm.activate(hart);

        self.procs.init(&mut self.palloc, memory)?;

        self.blk.init(memory);
        for (name, code) in programs {
            self.fs.load(memory, name, code)?;
        }
        self.fs.init_from_disk(memory, &self.blk);

        match self.fs.lookup("shell") {
            Some(entry) => {
                self.procs.create(&mut self.palloc, "shell", entry, 0)?;
            }
            None => {
                log::warn!("boot: no shell program registered");
            }
        }

        // Park the boot hart; the timer takes it from here.
        for (i, word) in PARK_CODE.iter().enumerate() {
            memory.write_word(PhysAddr::new(BOOT_PARK + i as u64 * 4), *word)?;
        }
        hart.pc = BOOT_PARK;
        hart.write_reg(Register::SP, BOOT_STACK_TOP);

        info!("boot: enabling interrupts");
        hart.intr_on();
        Ok(())
    }

    /// `mtvec` setup in spirit: unmask the timer and external interrupts
    /// and program the first tick. (The trap vector itself is the
    /// registered handler; there is no guest-side trampoline to point at.)
    fn trap_init(&self, hart: &mut Hart, memory: &mut dyn Memory) {
        hart.csr_write(CSR_MIE, hart.csr_read(CSR_MIE) | MIE_MTIE | MIE_MEIE);
        self.set_next_timer(memory);
    }

    /// Reprogram the machine timer one interval ahead; the write also
    /// clears the pending timer interrupt.
    pub(crate) fn set_next_timer(&self, memory: &mut dyn Memory) {
        let now = memory.read_dword(PhysAddr::new(CLINT_MTIME)).unwrap_or(0);
        let _ = memory.write_dword(
            PhysAddr::new(CLINT_MTIMECMP),
            now + self.config.timer_interval,
        );
    }
}

fn plic_init(memory: &mut dyn Memory) {
    // virtio slots 1..8 plus the UART
    let mut enable = 0u32;
    for irq in 1..=10u32 {
        enable |= 1 << irq;
        let _ = memory.write_word(
            PhysAddr::new(PLIC_BASE + PLIC_PRIORITY_BASE + irq as u64 * 4),
            1,
        );
    }
    let _ = memory.write_word(PhysAddr::new(PLIC_BASE + PLIC_ENABLE), enable);
    let _ = memory.write_word(PhysAddr::new(PLIC_BASE + PLIC_THRESHOLD), 0);
    info!("plic: enabled irqs 1..=10");
}

impl TrapHandler for Kernel {
    fn handle_trap(
        &mut self,
        cause: TrapCause,
        hart: &mut Hart,
        memory: &mut dyn Memory,
    ) -> Result<VirtAddr, TrapError> {
        trap::handle(self, cause, hart, memory)
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
