pub mod devices;
pub mod error;
pub mod hart;
pub mod instruction;
pub mod memory;
pub mod mmu;
pub mod system_bus;
pub mod trap;

pub use error::*;
pub use hart::*;
pub use instruction::*;
pub use memory::*;
pub use system_bus::*;
pub use trap::*;

use mmu::AccessType;

pub struct MachineConfig {
    pub memory_size: usize,
    /// Stop after this many executed instructions (None = run until halt).
    pub instret_limit: Option<u64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: 128 * 1024 * 1024,
            instret_limit: None,
        }
    }
}

/// A single-hart RV64 machine: hart + system bus + the kernel as trap
/// handler. The run loop executes instructions, advances `mtime`, and
/// delivers machine interrupts between instructions whenever
/// `mstatus.MIE` and the matching `mie` bit allow it.
pub struct Machine {
    pub hart: Hart,
    pub bus: SystemBus,
    pub trap_handler: Box<dyn TrapHandler>,
    pub config: MachineConfig,
    pub instret: u64,
}

#[derive(Debug, PartialEq)]
pub enum ExitReason {
    /// The trap handler asked the machine to stop.
    Halt,
    /// The configured instruction budget ran out.
    InstretLimit,
}

#[derive(Debug)]
pub enum StepResult {
    Continue,
    Wfi,
    Trap(TrapCause),
}

impl Machine {
    pub fn new(
        config: MachineConfig,
        hart: Hart,
        bus: SystemBus,
        trap_handler: Box<dyn TrapHandler>,
    ) -> Self {
        Self {
            hart,
            bus,
            trap_handler,
            config,
            instret: 0,
        }
    }

    pub fn load_program(&mut self, binary: &[u8], addr: PhysAddr) -> Result<(), VmError> {
        self.bus.load_program(addr, binary)?;
        Ok(())
    }

    fn translate(&mut self, addr: VirtAddr, access: AccessType) -> Result<PhysAddr, TrapCause> {
        mmu::translate(addr, access, self.hart.csr.satp, &mut self.bus)
    }

    fn read_virt(&mut self, va: u64, buf: &mut [u8]) -> Result<(), TrapCause> {
        for (i, b) in buf.iter_mut().enumerate() {
            let vaddr = VirtAddr::new(va.wrapping_add(i as u64));
            let pa = self.translate(vaddr, AccessType::Read)?;
            *b = self
                .bus
                .read_byte(pa)
                .map_err(|_| TrapCause::LoadAccessFault { addr: vaddr })?;
        }
        Ok(())
    }

    fn write_virt(&mut self, va: u64, data: &[u8]) -> Result<(), TrapCause> {
        for (i, b) in data.iter().enumerate() {
            let vaddr = VirtAddr::new(va.wrapping_add(i as u64));
            let pa = self.translate(vaddr, AccessType::Write)?;
            self.bus
                .write_byte(pa, *b)
                .map_err(|_| TrapCause::StoreAccessFault { addr: vaddr })?;
        }
        Ok(())
    }

    fn pending_interrupt(&self) -> Option<TrapCause> {
        if !self.hart.interrupts_enabled() {
            return None;
        }
        if self.hart.csr.mie & MIE_MEIE != 0 && self.bus.plic.has_claimable() {
            return Some(TrapCause::ExternalInterrupt);
        }
        if self.hart.csr.mie & MIE_MTIE != 0 && self.bus.clint.timer_pending() {
            return Some(TrapCause::TimerInterrupt);
        }
        None
    }

    fn dispatch_trap(&mut self, cause: TrapCause) -> Result<Option<ExitReason>, VmError> {
        log::trace!("trap: {:?} at pc={:#x}", cause, self.hart.pc);
        self.hart.trap_enter(&cause);
        match self
            .trap_handler
            .handle_trap(cause, &mut self.hart, &mut self.bus)
        {
            Ok(resume) => {
                self.hart.pc = resume.val();
                Ok(None)
            }
            Err(TrapError::Halt) => Ok(Some(ExitReason::Halt)),
            Err(e) => Err(VmError::Trap(e)),
        }
    }

    pub fn run(&mut self) -> Result<ExitReason, VmError> {
        loop {
            if let Some(limit) = self.config.instret_limit {
                if self.instret >= limit {
                    return Ok(ExitReason::InstretLimit);
                }
            }

            self.bus.poll_devices();

            if self.hart.waiting {
                let mtie = self.hart.csr.mie & MIE_MTIE != 0;
                let external_ready =
                    self.hart.csr.mie & MIE_MEIE != 0 && self.bus.plic.has_claimable();
                if !self.hart.interrupts_enabled() || !(mtie || external_ready) {
                    // Nothing can ever wake the hart
                    return Ok(ExitReason::Halt);
                }
                if mtie {
                    self.bus.clint.fast_forward();
                }
                self.hart.waiting = false;
            }

            if let Some(cause) = self.pending_interrupt() {
                if let Some(exit) = self.dispatch_trap(cause)? {
                    return Ok(exit);
                }
                continue;
            }

            let result = self.step()?;
            self.instret += 1;
            self.bus.clint.advance(1);

            match result {
                StepResult::Continue | StepResult::Wfi => {}
                StepResult::Trap(cause) => {
                    if let Some(exit) = self.dispatch_trap(cause)? {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    pub fn step(&mut self) -> Result<StepResult, VmError> {
        let pc_val = self.hart.pc;

        // Fetch
        let pc_phys = match self.translate(VirtAddr::new(pc_val), AccessType::Execute) {
            Ok(pa) => pa,
            Err(cause) => return Ok(StepResult::Trap(cause)),
        };
        let word = match self.bus.read_word(pc_phys) {
            Ok(w) => w,
            Err(_) => {
                return Ok(StepResult::Trap(TrapCause::InstructionAccessFault {
                    addr: VirtAddr::new(pc_val),
                }))
            }
        };
        let instruction = match Instruction::decode(word) {
            Ok(i) => i,
            Err(_) => {
                return Ok(StepResult::Trap(TrapCause::IllegalInstruction {
                    instruction: word,
                }))
            }
        };

        self.hart.pc = pc_val.wrapping_add(4);

        // Faults during execution rewind the pc so mepc points at the
        // offending instruction.
        macro_rules! trap {
            ($cause:expr) => {{
                self.hart.pc = pc_val;
                return Ok(StepResult::Trap($cause));
            }};
        }

        macro_rules! load {
            ($addr:expr, $n:expr) => {{
                let mut buf = [0u8; 8];
                if let Err(cause) = self.read_virt($addr, &mut buf[..$n]) {
                    trap!(cause);
                }
                u64::from_le_bytes(buf)
            }};
        }

        macro_rules! store {
            ($addr:expr, $val:expr, $n:expr) => {{
                let bytes = ($val as u64).to_le_bytes();
                if let Err(cause) = self.write_virt($addr, &bytes[..$n]) {
                    trap!(cause);
                }
            }};
        }

        match instruction {
            Instruction::Lui { rd, imm } => self.hart.write_reg(rd, imm as u64),
            Instruction::Auipc { rd, imm } => {
                self.hart.write_reg(rd, pc_val.wrapping_add(imm as u64));
            }
            Instruction::Jal { rd, offset } => {
                self.hart.write_reg(rd, pc_val.wrapping_add(4));
                self.hart.pc = pc_val.wrapping_add(offset as i64 as u64);
            }
            Instruction::Jalr { rd, rs1, offset } => {
                let base = self.hart.read_reg(rs1);
                let target = base.wrapping_add(offset as i64 as u64) & !1;
                self.hart.write_reg(rd, pc_val.wrapping_add(4));
                self.hart.pc = target;
            }
            Instruction::Beq { rs1, rs2, offset } => {
                if self.hart.read_reg(rs1) == self.hart.read_reg(rs2) {
                    self.hart.pc = pc_val.wrapping_add(offset as i64 as u64);
                }
            }
            Instruction::Bne { rs1, rs2, offset } => {
                if self.hart.read_reg(rs1) != self.hart.read_reg(rs2) {
                    self.hart.pc = pc_val.wrapping_add(offset as i64 as u64);
                }
            }
            Instruction::Blt { rs1, rs2, offset } => {
                if (self.hart.read_reg(rs1) as i64) < (self.hart.read_reg(rs2) as i64) {
                    self.hart.pc = pc_val.wrapping_add(offset as i64 as u64);
                }
            }
            Instruction::Bge { rs1, rs2, offset } => {
                if (self.hart.read_reg(rs1) as i64) >= (self.hart.read_reg(rs2) as i64) {
                    self.hart.pc = pc_val.wrapping_add(offset as i64 as u64);
                }
            }
            Instruction::Bltu { rs1, rs2, offset } => {
                if self.hart.read_reg(rs1) < self.hart.read_reg(rs2) {
                    self.hart.pc = pc_val.wrapping_add(offset as i64 as u64);
                }
            }
            Instruction::Bgeu { rs1, rs2, offset } => {
                if self.hart.read_reg(rs1) >= self.hart.read_reg(rs2) {
                    self.hart.pc = pc_val.wrapping_add(offset as i64 as u64);
                }
            }
            Instruction::Lb { rd, rs1, offset } => {
                let addr = self.hart.read_reg(rs1).wrapping_add(offset as i64 as u64);
                let val = load!(addr, 1) as u8;
                self.hart.write_reg(rd, val as i8 as i64 as u64);
            }
            Instruction::Lh { rd, rs1, offset } => {
                let addr = self.hart.read_reg(rs1).wrapping_add(offset as i64 as u64);
                let val = load!(addr, 2) as u16;
                self.hart.write_reg(rd, val as i16 as i64 as u64);
            }
            Instruction::Lw { rd, rs1, offset } => {
                let addr = self.hart.read_reg(rs1).wrapping_add(offset as i64 as u64);
                let val = load!(addr, 4) as u32;
                self.hart.write_reg(rd, val as i32 as i64 as u64);
            }
            Instruction::Ld { rd, rs1, offset } => {
                let addr = self.hart.read_reg(rs1).wrapping_add(offset as i64 as u64);
                let val = load!(addr, 8);
                self.hart.write_reg(rd, val);
            }
            Instruction::Lbu { rd, rs1, offset } => {
                let addr = self.hart.read_reg(rs1).wrapping_add(offset as i64 as u64);
                let val = load!(addr, 1);
                self.hart.write_reg(rd, val);
            }
            Instruction::Lhu { rd, rs1, offset } => {
                let addr = self.hart.read_reg(rs1).wrapping_add(offset as i64 as u64);
                let val = load!(addr, 2);
                self.hart.write_reg(rd, val);
            }
            Instruction::Lwu { rd, rs1, offset } => {
                let addr = self.hart.read_reg(rs1).wrapping_add(offset as i64 as u64);
                let val = load!(addr, 4);
                self.hart.write_reg(rd, val);
            }
            Instruction::Sb { rs1, rs2, offset } => {
                let addr = self.hart.read_reg(rs1).wrapping_add(offset as i64 as u64);
                store!(addr, self.hart.read_reg(rs2), 1);
            }
            Instruction::Sh { rs1, rs2, offset } => {
                let addr = self.hart.read_reg(rs1).wrapping_add(offset as i64 as u64);
                store!(addr, self.hart.read_reg(rs2), 2);
            }
            Instruction::Sw { rs1, rs2, offset } => {
                let addr = self.hart.read_reg(rs1).wrapping_add(offset as i64 as u64);
                store!(addr, self.hart.read_reg(rs2), 4);
            }
            Instruction::Sd { rs1, rs2, offset } => {
                let addr = self.hart.read_reg(rs1).wrapping_add(offset as i64 as u64);
                store!(addr, self.hart.read_reg(rs2), 8);
            }
            Instruction::Addi { rd, rs1, imm } => {
                self.hart
                    .write_reg(rd, self.hart.read_reg(rs1).wrapping_add(imm as i64 as u64));
            }
            Instruction::Slti { rd, rs1, imm } => {
                let val = ((self.hart.read_reg(rs1) as i64) < imm as i64) as u64;
                self.hart.write_reg(rd, val);
            }
            Instruction::Sltiu { rd, rs1, imm } => {
                let val = (self.hart.read_reg(rs1) < imm as i64 as u64) as u64;
                self.hart.write_reg(rd, val);
            }
            Instruction::Xori { rd, rs1, imm } => {
                self.hart
                    .write_reg(rd, self.hart.read_reg(rs1) ^ (imm as i64 as u64));
            }
            Instruction::Ori { rd, rs1, imm } => {
                self.hart
                    .write_reg(rd, self.hart.read_reg(rs1) | (imm as i64 as u64));
            }
            Instruction::Andi { rd, rs1, imm } => {
                self.hart
                    .write_reg(rd, self.hart.read_reg(rs1) & (imm as i64 as u64));
            }
            Instruction::Slli { rd, rs1, shamt } => {
                self.hart.write_reg(rd, self.hart.read_reg(rs1) << shamt);
            }
            Instruction::Srli { rd, rs1, shamt } => {
                self.hart.write_reg(rd, self.hart.read_reg(rs1) >> shamt);
            }
            Instruction::Srai { rd, rs1, shamt } => {
                self.hart
                    .write_reg(rd, ((self.hart.read_reg(rs1) as i64) >> shamt) as u64);
            }
            Instruction::Addiw { rd, rs1, imm } => {
                let val = (self.hart.read_reg(rs1) as u32).wrapping_add(imm as u32);
                self.hart.write_reg(rd, val as i32 as i64 as u64);
            }
            Instruction::Slliw { rd, rs1, shamt } => {
                let val = (self.hart.read_reg(rs1) as u32) << shamt;
                self.hart.write_reg(rd, val as i32 as i64 as u64);
            }
            Instruction::Srliw { rd, rs1, shamt } => {
                let val = (self.hart.read_reg(rs1) as u32) >> shamt;
                self.hart.write_reg(rd, val as i32 as i64 as u64);
            }
            Instruction::Sraiw { rd, rs1, shamt } => {
                let val = (self.hart.read_reg(rs1) as i32) >> shamt;
                self.hart.write_reg(rd, val as i64 as u64);
            }
            Instruction::Add { rd, rs1, rs2 } => {
                self.hart.write_reg(
                    rd,
                    self.hart
                        .read_reg(rs1)
                        .wrapping_add(self.hart.read_reg(rs2)),
                );
            }
            Instruction::Sub { rd, rs1, rs2 } => {
                self.hart.write_reg(
                    rd,
                    self.hart
                        .read_reg(rs1)
                        .wrapping_sub(self.hart.read_reg(rs2)),
                );
            }
            Instruction::Sll { rd, rs1, rs2 } => {
                let shamt = self.hart.read_reg(rs2) & 0x3f;
                self.hart.write_reg(rd, self.hart.read_reg(rs1) << shamt);
            }
            Instruction::Slt { rd, rs1, rs2 } => {
                let val =
                    ((self.hart.read_reg(rs1) as i64) < (self.hart.read_reg(rs2) as i64)) as u64;
                self.hart.write_reg(rd, val);
            }
            Instruction::Sltu { rd, rs1, rs2 } => {
                let val = (self.hart.read_reg(rs1) < self.hart.read_reg(rs2)) as u64;
                self.hart.write_reg(rd, val);
            }
            Instruction::Xor { rd, rs1, rs2 } => {
                self.hart
                    .write_reg(rd, self.hart.read_reg(rs1) ^ self.hart.read_reg(rs2));
            }
            Instruction::Srl { rd, rs1, rs2 } => {
                let shamt = self.hart.read_reg(rs2) & 0x3f;
                self.hart.write_reg(rd, self.hart.read_reg(rs1) >> shamt);
            }
            Instruction::Sra { rd, rs1, rs2 } => {
                let shamt = self.hart.read_reg(rs2) & 0x3f;
                self.hart
                    .write_reg(rd, ((self.hart.read_reg(rs1) as i64) >> shamt) as u64);
            }
            Instruction::Or { rd, rs1, rs2 } => {
                self.hart
                    .write_reg(rd, self.hart.read_reg(rs1) | self.hart.read_reg(rs2));
            }
            Instruction::And { rd, rs1, rs2 } => {
                self.hart
                    .write_reg(rd, self.hart.read_reg(rs1) & self.hart.read_reg(rs2));
            }
            Instruction::Addw { rd, rs1, rs2 } => {
                let val =
                    (self.hart.read_reg(rs1) as u32).wrapping_add(self.hart.read_reg(rs2) as u32);
                self.hart.write_reg(rd, val as i32 as i64 as u64);
            }
            Instruction::Subw { rd, rs1, rs2 } => {
                let val =
                    (self.hart.read_reg(rs1) as u32).wrapping_sub(self.hart.read_reg(rs2) as u32);
                self.hart.write_reg(rd, val as i32 as i64 as u64);
            }
            Instruction::Sllw { rd, rs1, rs2 } => {
                let shamt = self.hart.read_reg(rs2) & 0x1f;
                let val = (self.hart.read_reg(rs1) as u32) << shamt;
                self.hart.write_reg(rd, val as i32 as i64 as u64);
            }
            Instruction::Srlw { rd, rs1, rs2 } => {
                let shamt = self.hart.read_reg(rs2) & 0x1f;
                let val = (self.hart.read_reg(rs1) as u32) >> shamt;
                self.hart.write_reg(rd, val as i32 as i64 as u64);
            }
            Instruction::Sraw { rd, rs1, rs2 } => {
                let shamt = self.hart.read_reg(rs2) & 0x1f;
                let val = (self.hart.read_reg(rs1) as i32) >> shamt;
                self.hart.write_reg(rd, val as i64 as u64);
            }
            Instruction::Csrrw { rd, rs1, csr } => {
                let old = self.hart.csr_read(csr);
                self.hart.csr_write(csr, self.hart.read_reg(rs1));
                self.hart.write_reg(rd, old);
            }
            Instruction::Csrrs { rd, rs1, csr } => {
                let old = self.hart.csr_read(csr);
                if rs1 != Register::ZERO {
                    self.hart.csr_write(csr, old | self.hart.read_reg(rs1));
                }
                self.hart.write_reg(rd, old);
            }
            Instruction::Csrrc { rd, rs1, csr } => {
                let old = self.hart.csr_read(csr);
                if rs1 != Register::ZERO {
                    self.hart.csr_write(csr, old & !self.hart.read_reg(rs1));
                }
                self.hart.write_reg(rd, old);
            }
            Instruction::Csrrwi { rd, uimm, csr } => {
                let old = self.hart.csr_read(csr);
                self.hart.csr_write(csr, uimm as u64);
                self.hart.write_reg(rd, old);
            }
            Instruction::Csrrsi { rd, uimm, csr } => {
                let old = self.hart.csr_read(csr);
                if uimm != 0 {
                    self.hart.csr_write(csr, old | uimm as u64);
                }
                self.hart.write_reg(rd, old);
            }
            Instruction::Csrrci { rd, uimm, csr } => {
                let old = self.hart.csr_read(csr);
                if uimm != 0 {
                    self.hart.csr_write(csr, old & !(uimm as u64));
                }
                self.hart.write_reg(rd, old);
            }
            Instruction::Ecall => {
                self.hart.pc = pc_val; // rewind so mepc points at the ecall
                let cause = match self.hart.mode {
                    PrivilegeMode::User => TrapCause::EnvironmentCallFromU,
                    PrivilegeMode::Machine => TrapCause::EnvironmentCallFromM,
                };
                return Ok(StepResult::Trap(cause));
            }
            Instruction::Ebreak => {
                self.hart.pc = pc_val;
                return Ok(StepResult::Trap(TrapCause::Breakpoint));
            }
            Instruction::Wfi => {
                self.hart.waiting = true;
                return Ok(StepResult::Wfi);
            }
        }

        Ok(StepResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hematite_user::asm::{self, Assembler};

    struct HaltOnEcall;

    impl TrapHandler for HaltOnEcall {
        fn handle_trap(
            &mut self,
            cause: TrapCause,
            _hart: &mut Hart,
            _memory: &mut dyn Memory,
        ) -> Result<VirtAddr, TrapError> {
            match cause {
                TrapCause::EnvironmentCallFromM => Err(TrapError::Halt),
                other => Err(TrapError::Unhandled(other)),
            }
        }

        fn as_any(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    fn machine_with(program: &[u8]) -> Machine {
        let bus = SystemBus::new(1024 * 1024);
        let hart = Hart::new(RAM_BASE);
        let mut machine = Machine::new(
            MachineConfig {
                memory_size: 1024 * 1024,
                instret_limit: Some(10_000),
            },
            hart,
            bus,
            Box::new(HaltOnEcall),
        );
        machine.load_program(program, PhysAddr::new(RAM_BASE)).unwrap();
        machine
    }

    #[test]
    fn arithmetic_loop_runs_to_ecall() {
        // a0 = 0; a1 = 5; loop: a0 += a1; a1 -= 1; bne a1, x0, loop; ecall
        let mut a = Assembler::new(RAM_BASE);
        a.li(asm::A0, 0);
        a.li(asm::A1, 5);
        let top = a.label();
        a.add(asm::A0, asm::A0, asm::A1);
        a.addi(asm::A1, asm::A1, -1);
        a.bne(asm::A1, asm::ZERO, top);
        a.ecall();

        let mut machine = machine_with(&a.assemble());
        assert_eq!(machine.run().unwrap(), ExitReason::Halt);
        assert_eq!(machine.hart.read_reg(Register::A0), 15);
    }

    #[test]
    fn loads_and_stores_round_trip() {
        let mut a = Assembler::new(RAM_BASE);
        a.li(asm::T0, (RAM_BASE + 0x800) as i64);
        a.li(asm::A0, -2);
        a.sd(asm::T0, asm::A0, 0);
        a.ld(asm::A1, asm::T0, 0);
        a.lb(asm::A2, asm::T0, 7);
        a.ecall();

        let mut machine = machine_with(&a.assemble());
        machine.run().unwrap();
        assert_eq!(machine.hart.read_reg(Register::A1), (-2i64) as u64);
        assert_eq!(machine.hart.read_reg(Register::A2), (-1i64) as u64);
    }

    #[test]
    fn illegal_instruction_reaches_handler() {
        let mut machine = machine_with(&0u32.to_le_bytes());
        let err = machine.run().unwrap_err();
        assert!(matches!(
            err,
            VmError::Trap(TrapError::Unhandled(TrapCause::IllegalInstruction { .. }))
        ));
    }

    #[test]
    fn wfi_with_interrupts_off_halts() {
        let mut a = Assembler::new(RAM_BASE);
        a.wfi();
        let mut machine = machine_with(&a.assemble());
        assert_eq!(machine.run().unwrap(), ExitReason::Halt);
    }
}
