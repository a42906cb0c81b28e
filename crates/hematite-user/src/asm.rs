//! Tiny RV64I assembler.
//!
//! Hematite programs are a handful of instructions each, so rather than
//! cross-compiling them we encode them directly: raw encoder functions for
//! single instructions, and an `Assembler` that adds labels, branch/jump
//! fixups, pc-relative address materialization and inline data.

// Register numbers
pub const ZERO: u8 = 0;
pub const RA: u8 = 1;
pub const SP: u8 = 2;
pub const T0: u8 = 5;
pub const T1: u8 = 6;
pub const T2: u8 = 7;
pub const A0: u8 = 10;
pub const A1: u8 = 11;
pub const A2: u8 = 12;
pub const A3: u8 = 13;
pub const A4: u8 = 14;
pub const A5: u8 = 15;
pub const A6: u8 = 16;
pub const A7: u8 = 17;

fn r_type(funct7: u32, rs2: u8, rs1: u8, funct3: u32, rd: u8, opcode: u32) -> u32 {
    (funct7 << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | (funct3 << 12)
        | ((rd as u32) << 7)
        | opcode
}

fn i_type(imm: i32, rs1: u8, funct3: u32, rd: u8, opcode: u32) -> u32 {
    ((imm as u32 & 0xfff) << 20)
        | ((rs1 as u32) << 15)
        | (funct3 << 12)
        | ((rd as u32) << 7)
        | opcode
}

fn s_type(imm: i32, rs2: u8, rs1: u8, funct3: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 5) & 0x7f) << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | (funct3 << 12)
        | ((imm & 0x1f) << 7)
        | 0x23
}

fn b_type(offset: i32, rs2: u8, rs1: u8, funct3: u32) -> u32 {
    let off = offset as u32;
    (((off >> 12) & 1) << 31)
        | (((off >> 5) & 0x3f) << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | (funct3 << 12)
        | (((off >> 1) & 0xf) << 8)
        | (((off >> 11) & 1) << 7)
        | 0x63
}

fn u_type(imm20: u32, rd: u8, opcode: u32) -> u32 {
    ((imm20 & 0xfffff) << 12) | ((rd as u32) << 7) | opcode
}

fn j_type(offset: i32, rd: u8) -> u32 {
    let off = offset as u32;
    (((off >> 20) & 1) << 31)
        | (((off >> 1) & 0x3ff) << 21)
        | (((off >> 11) & 1) << 20)
        | (((off >> 12) & 0xff) << 12)
        | ((rd as u32) << 7)
        | 0x6f
}

pub fn lui(rd: u8, imm20: u32) -> u32 {
    u_type(imm20, rd, 0x37)
}

pub fn auipc(rd: u8, imm20: u32) -> u32 {
    u_type(imm20, rd, 0x17)
}

pub fn jal(rd: u8, offset: i32) -> u32 {
    j_type(offset, rd)
}

pub fn jalr(rd: u8, rs1: u8, offset: i32) -> u32 {
    i_type(offset, rs1, 0, rd, 0x67)
}

pub fn beq(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b_type(offset, rs2, rs1, 0)
}

pub fn bne(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b_type(offset, rs2, rs1, 1)
}

pub fn blt(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b_type(offset, rs2, rs1, 4)
}

pub fn bge(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b_type(offset, rs2, rs1, 5)
}

pub fn lb(rd: u8, rs1: u8, offset: i32) -> u32 {
    i_type(offset, rs1, 0, rd, 0x03)
}

pub fn lbu(rd: u8, rs1: u8, offset: i32) -> u32 {
    i_type(offset, rs1, 4, rd, 0x03)
}

pub fn lw(rd: u8, rs1: u8, offset: i32) -> u32 {
    i_type(offset, rs1, 2, rd, 0x03)
}

pub fn ld(rd: u8, rs1: u8, offset: i32) -> u32 {
    i_type(offset, rs1, 3, rd, 0x03)
}

pub fn sb(rs1: u8, rs2: u8, offset: i32) -> u32 {
    s_type(offset, rs2, rs1, 0)
}

pub fn sw(rs1: u8, rs2: u8, offset: i32) -> u32 {
    s_type(offset, rs2, rs1, 2)
}

pub fn sd(rs1: u8, rs2: u8, offset: i32) -> u32 {
    s_type(offset, rs2, rs1, 3)
}

pub fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(imm, rs1, 0, rd, 0x13)
}

pub fn andi(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(imm, rs1, 7, rd, 0x13)
}

pub fn slli(rd: u8, rs1: u8, shamt: u8) -> u32 {
    i_type(shamt as i32, rs1, 1, rd, 0x13)
}

pub fn srli(rd: u8, rs1: u8, shamt: u8) -> u32 {
    i_type(shamt as i32, rs1, 5, rd, 0x13)
}

pub fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(0, rs2, rs1, 0, rd, 0x33)
}

pub fn sub(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(0x20, rs2, rs1, 0, rd, 0x33)
}

pub fn ecall() -> u32 {
    0x0000_0073
}

pub fn ebreak() -> u32 {
    0x0010_0073
}

pub fn wfi() -> u32 {
    0x1050_0073
}

pub fn csrrs(rd: u8, csr: u16, rs1: u8) -> u32 {
    ((csr as u32) << 20) | ((rs1 as u32) << 15) | (2 << 12) | ((rd as u32) << 7) | 0x73
}

pub fn csrrsi(rd: u8, csr: u16, uimm: u8) -> u32 {
    ((csr as u32) << 20) | ((uimm as u32) << 15) | (6 << 12) | ((rd as u32) << 7) | 0x73
}

#[derive(Debug, Copy, Clone)]
pub struct Label(usize);

enum FixupKind {
    Branch { funct3: u32, rs1: u8, rs2: u8 },
    Jal { rd: u8 },
    /// auipc+addi pair materializing a pc-relative address
    PcrelHiLo { rd: u8 },
}

struct Fixup {
    at: usize,
    label: Label,
    kind: FixupKind,
}

pub struct Assembler {
    base: u64,
    words: Vec<u32>,
    labels: Vec<Option<u64>>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            words: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn pc(&self) -> u64 {
        self.base + self.words.len() as u64 * 4
    }

    fn emit(&mut self, word: u32) {
        self.words.push(word);
    }

    /// Fresh unbound label; bind it later with `bind`.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Label bound to the current position.
    pub fn label(&mut self) -> Label {
        let l = self.new_label();
        self.bind(l);
        l
    }

    pub fn bind(&mut self, label: Label) {
        assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.pc());
    }

    pub fn addi(&mut self, rd: u8, rs1: u8, imm: i32) {
        self.emit(addi(rd, rs1, imm));
    }

    pub fn mv(&mut self, rd: u8, rs: u8) {
        self.emit(addi(rd, rs, 0));
    }

    pub fn add(&mut self, rd: u8, rs1: u8, rs2: u8) {
        self.emit(add(rd, rs1, rs2));
    }

    pub fn sub(&mut self, rd: u8, rs1: u8, rs2: u8) {
        self.emit(sub(rd, rs1, rs2));
    }

    pub fn ld(&mut self, rd: u8, rs1: u8, offset: i32) {
        self.emit(ld(rd, rs1, offset));
    }

    pub fn lb(&mut self, rd: u8, rs1: u8, offset: i32) {
        self.emit(lb(rd, rs1, offset));
    }

    pub fn lbu(&mut self, rd: u8, rs1: u8, offset: i32) {
        self.emit(lbu(rd, rs1, offset));
    }

    pub fn sd(&mut self, rs1: u8, rs2: u8, offset: i32) {
        self.emit(sd(rs1, rs2, offset));
    }

    pub fn sb(&mut self, rs1: u8, rs2: u8, offset: i32) {
        self.emit(sb(rs1, rs2, offset));
    }

    pub fn ecall(&mut self) {
        self.emit(ecall());
    }

    pub fn wfi(&mut self) {
        self.emit(wfi());
    }

    pub fn csrrsi(&mut self, rd: u8, csr: u16, uimm: u8) {
        self.emit(csrrsi(rd, csr, uimm));
    }

    /// Load an immediate. Values that fit an i32 take at most lui+addi;
    /// positive values with bit 31 set (RAM addresses) get zero-extended
    /// with a shift pair.
    pub fn li(&mut self, rd: u8, val: i64) {
        if (-2048..2048).contains(&val) {
            self.emit(addi(rd, ZERO, val as i32));
        } else if (i32::MIN as i64..=i32::MAX as i64).contains(&val) {
            self.li32(rd, val as i32);
        } else if (0..=u32::MAX as i64).contains(&val) {
            self.li32(rd, val as u32 as i32);
            self.emit(slli(rd, rd, 32));
            self.emit(srli(rd, rd, 32));
        } else {
            unimplemented!("li for constants wider than 32 bits");
        }
    }

    fn li32(&mut self, rd: u8, val: i32) {
        let hi = val.wrapping_add(0x800) >> 12;
        let lo = val.wrapping_sub(hi.wrapping_shl(12));
        if hi == 0 {
            self.emit(addi(rd, ZERO, lo));
        } else {
            self.emit(lui(rd, hi as u32 & 0xfffff));
            if lo != 0 {
                self.emit(addi(rd, rd, lo));
            }
        }
    }

    fn branch(&mut self, funct3: u32, rs1: u8, rs2: u8, target: Label) {
        let at = self.words.len();
        if let Some(addr) = self.labels[target.0] {
            let offset = addr as i64 - self.pc() as i64;
            self.emit(b_type(offset as i32, rs2, rs1, funct3));
        } else {
            self.fixups.push(Fixup {
                at,
                label: target,
                kind: FixupKind::Branch { funct3, rs1, rs2 },
            });
            self.emit(0);
        }
    }

    pub fn beq(&mut self, rs1: u8, rs2: u8, target: Label) {
        self.branch(0, rs1, rs2, target);
    }

    pub fn bne(&mut self, rs1: u8, rs2: u8, target: Label) {
        self.branch(1, rs1, rs2, target);
    }

    pub fn blt(&mut self, rs1: u8, rs2: u8, target: Label) {
        self.branch(4, rs1, rs2, target);
    }

    pub fn bge(&mut self, rs1: u8, rs2: u8, target: Label) {
        self.branch(5, rs1, rs2, target);
    }

    /// Unconditional jump to a label (`jal` with rd = x0, or a link).
    pub fn jal_to(&mut self, rd: u8, target: Label) {
        let at = self.words.len();
        if let Some(addr) = self.labels[target.0] {
            let offset = addr as i64 - self.pc() as i64;
            self.emit(j_type(offset as i32, rd));
        } else {
            self.fixups.push(Fixup {
                at,
                label: target,
                kind: FixupKind::Jal { rd },
            });
            self.emit(0);
        }
    }

    pub fn j(&mut self, target: Label) {
        self.jal_to(ZERO, target);
    }

    /// Materialize the address of a label (auipc + addi). Pc-relative, so
    /// the assembled code is position-independent as long as code and data
    /// move together.
    pub fn la(&mut self, rd: u8, target: Label) {
        let at = self.words.len();
        self.fixups.push(Fixup {
            at,
            label: target,
            kind: FixupKind::PcrelHiLo { rd },
        });
        self.emit(0);
        self.emit(0);
    }

    /// Inline data, padded to instruction alignment.
    pub fn bytes(&mut self, data: &[u8]) {
        let mut padded = data.to_vec();
        while padded.len() % 4 != 0 {
            padded.push(0);
        }
        for chunk in padded.chunks_exact(4) {
            self.emit(u32::from_le_bytes(chunk.try_into().unwrap()));
        }
    }

    pub fn assemble(mut self) -> Vec<u8> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = self.labels[fixup.label.0].expect("unbound label at assemble time");
            let pc = self.base + fixup.at as u64 * 4;
            let offset = target as i64 - pc as i64;
            match fixup.kind {
                FixupKind::Branch { funct3, rs1, rs2 } => {
                    self.words[fixup.at] = b_type(offset as i32, rs2, rs1, funct3);
                }
                FixupKind::Jal { rd } => {
                    self.words[fixup.at] = j_type(offset as i32, rd);
                }
                FixupKind::PcrelHiLo { rd } => {
                    let hi = (offset as i32).wrapping_add(0x800) >> 12;
                    let lo = (offset as i32).wrapping_sub(hi.wrapping_shl(12));
                    self.words[fixup.at] = auipc(rd, hi as u32 & 0xfffff);
                    self.words[fixup.at + 1] = addi(rd, rd, lo);
                }
            }
        }

        self.words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_encodings() {
        // Spot-checked against the ISA listings.
        assert_eq!(ecall(), 0x0000_0073);
        assert_eq!(ebreak(), 0x0010_0073);
        assert_eq!(wfi(), 0x1050_0073);
        assert_eq!(addi(0, 0, 0), 0x0000_0013); // nop
        assert_eq!(jal(0, -4), 0xffdf_f06f);
        assert_eq!(csrrsi(0, 0x300, 8), 0x3004_6073);
    }

    #[test]
    fn forward_and_backward_labels_resolve() {
        let mut a = Assembler::new(0x1000);
        let skip = a.new_label();
        a.beq(A0, ZERO, skip); // +8
        a.addi(A0, A0, 1);
        a.bind(skip);
        let top = a.label();
        a.j(top); // -0 would be a self-loop at offset 0... target is this jal
        let bytes = a.assemble();

        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words[0], beq(A0, ZERO, 8));
        assert_eq!(words[2], jal(ZERO, 0));
    }

    #[test]
    fn li_handles_ram_addresses() {
        let mut a = Assembler::new(0);
        a.li(A0, 0x8040_0000);
        let bytes = a.assemble();
        // lui + shift pair (no addi needed, low bits are zero)
        assert_eq!(bytes.len(), 12);
        let first = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(first, lui(A0, 0x80400));
    }

    #[test]
    fn la_is_position_independent() {
        for base in [0u64, 0x8020_0000] {
            let mut a = Assembler::new(base);
            let data = a.new_label();
            a.la(A1, data);
            a.bind(data);
            a.bytes(b"hi\n");
            let bytes = a.assemble();
            let hi = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
            let lo = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
            // delta from the auipc to the data is 8 regardless of base
            assert_eq!(hi, auipc(A1, 0));
            assert_eq!(lo, addi(A1, A1, 8));
        }
    }
}
