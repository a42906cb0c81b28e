//! Hardware Sv39 page-table walker.
//!
//! The walker reads page-table entries straight out of guest physical
//! memory, so the tables built by the kernel's VMM are the tables the
//! hardware sees. Translation is in effect whenever `satp.MODE == 8`;
//! with MODE 0 the machine runs bare (physical == virtual).

use crate::memory::{Memory, PhysAddr, VirtAddr};
use crate::trap::TrapCause;

pub const SATP_MODE_SV39: u64 = 8;
pub const SATP_MODE_SHIFT: u64 = 60;
pub const SATP_PPN_MASK: u64 = (1 << 44) - 1;

const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_W: u64 = 1 << 2;
const PTE_X: u64 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    fn page_fault(&self, addr: VirtAddr) -> TrapCause {
        match self {
            AccessType::Read => TrapCause::LoadPageFault { addr },
            AccessType::Write => TrapCause::StorePageFault { addr },
            AccessType::Execute => TrapCause::InstructionPageFault { addr },
        }
    }

    fn access_fault(&self, addr: VirtAddr) -> TrapCause {
        match self {
            AccessType::Read => TrapCause::LoadAccessFault { addr },
            AccessType::Write => TrapCause::StoreAccessFault { addr },
            AccessType::Execute => TrapCause::InstructionAccessFault { addr },
        }
    }

    fn permitted(&self, pte: u64) -> bool {
        match self {
            AccessType::Read => pte & PTE_R != 0,
            AccessType::Write => pte & PTE_W != 0,
            AccessType::Execute => pte & PTE_X != 0,
        }
    }
}

pub fn translate(
    addr: VirtAddr,
    access: AccessType,
    satp: u64,
    memory: &mut dyn Memory,
) -> Result<PhysAddr, TrapCause> {
    if satp >> SATP_MODE_SHIFT != SATP_MODE_SV39 {
        return Ok(PhysAddr::new(addr.val()));
    }

    let va = addr.val();
    let mut table = ((satp & SATP_PPN_MASK) << 12) as u64;

    for level in (0..3).rev() {
        let vpn = (va >> (12 + 9 * level)) & 0x1ff;
        let pte_addr = PhysAddr::new(table + vpn * 8);
        let pte = memory
            .read_dword(pte_addr)
            .map_err(|_| access.access_fault(addr))?;

        if pte & PTE_V == 0 {
            return Err(access.page_fault(addr));
        }

        if pte & (PTE_R | PTE_W | PTE_X) != 0 {
            // Leaf. Superpages are not produced by this kernel; a leaf
            // above level 0 is treated as a fault.
            if level != 0 {
                return Err(access.page_fault(addr));
            }
            if !access.permitted(pte) {
                return Err(access.page_fault(addr));
            }
            let ppn = pte >> 10;
            return Ok(PhysAddr::new((ppn << 12) | addr.page_offset()));
        }

        table = (pte >> 10) << 12;
    }

    Err(access.page_fault(addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{SimpleMemory, RAM_BASE};

    fn satp_for(root: u64) -> u64 {
        (SATP_MODE_SV39 << SATP_MODE_SHIFT) | (root >> 12)
    }

    // Hand-build a three-level table mapping one page and check the walk.
    #[test]
    fn walk_finds_leaf() {
        let mut mem = SimpleMemory::new(1024 * 1024);
        let root = RAM_BASE;
        let l1 = RAM_BASE + 0x1000;
        let l0 = RAM_BASE + 0x2000;
        let frame = RAM_BASE + 0x5000;

        let va = VirtAddr::new(0x8040_0000);
        let vpn2 = (va.val() >> 30) & 0x1ff;
        let vpn1 = (va.val() >> 21) & 0x1ff;
        let vpn0 = (va.val() >> 12) & 0x1ff;

        mem.write_dword(PhysAddr::new(root + vpn2 * 8), ((l1 >> 12) << 10) | PTE_V)
            .unwrap();
        mem.write_dword(PhysAddr::new(l1 + vpn1 * 8), ((l0 >> 12) << 10) | PTE_V)
            .unwrap();
        mem.write_dword(
            PhysAddr::new(l0 + vpn0 * 8),
            ((frame >> 12) << 10) | PTE_V | PTE_R | PTE_W,
        )
        .unwrap();

        let pa = translate(
            VirtAddr::new(va.val() + 0x123),
            AccessType::Read,
            satp_for(root),
            &mut mem,
        )
        .unwrap();
        assert_eq!(pa.val(), frame + 0x123);

        // Write allowed, execute refused by the leaf permissions.
        assert!(translate(va, AccessType::Write, satp_for(root), &mut mem).is_ok());
        assert_eq!(
            translate(va, AccessType::Execute, satp_for(root), &mut mem),
            Err(TrapCause::InstructionPageFault { addr: va })
        );
    }

    #[test]
    fn bare_mode_is_identity() {
        let mut mem = SimpleMemory::new(4096);
        let va = VirtAddr::new(0x1234_5678);
        assert_eq!(
            translate(va, AccessType::Read, 0, &mut mem).unwrap(),
            PhysAddr::new(0x1234_5678)
        );
    }

    #[test]
    fn missing_level_faults() {
        let mut mem = SimpleMemory::new(64 * 1024);
        let va = VirtAddr::new(0x8000_0000);
        assert_eq!(
            translate(va, AccessType::Read, satp_for(RAM_BASE), &mut mem),
            Err(TrapCause::LoadPageFault { addr: va })
        );
    }
}
