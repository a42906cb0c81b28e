//! Virtual memory manager: Sv39 three-level page tables.
//!
//! The tables live in guest physical memory (page-table pages come from
//! `kalloc`), so the machine's MMU walks exactly what we build here. The
//! kernel itself runs identity-mapped: a table page's physical address is
//! also the address we read and write it through.
//!
//! ```text
//!   VA[38:30] -> level-2 index (root)
//!   VA[29:21] -> level-1 index
//!   VA[20:12] -> level-0 index
//!   VA[11:0]  -> page offset
//! ```

use crate::error::VmmError;
use crate::layout::{HEAP_USER_BASE, PAGE_SIZE};
use crate::palloc::FrameAllocator;
use bitflags::bitflags;
use hematite_vm::devices::block::{VIRTIO_MMIO_END, VIRTIO_MMIO_START};
use hematite_vm::devices::clint::{CLINT_BASE, CLINT_SIZE};
use hematite_vm::devices::plic::PLIC_BASE;
use hematite_vm::devices::uart::UART_BASE;
use hematite_vm::{Hart, Memory, PhysAddr, VirtAddr, CSR_SATP, RAM_BASE};
use log::{error, info, warn};

// RISC-V PTE flag bits
const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_W: u64 = 1 << 2;
const PTE_X: u64 = 1 << 3;
const PTE_U: u64 = 1 << 4;
const PTE_A: u64 = 1 << 6;
const PTE_D: u64 = 1 << 7;

bitflags! {
    /// Software flags accepted by `map`/`map_page`. Translated to Sv39 PTE
    /// bits internally; the reserved flags exist for source compatibility
    /// and are ignored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const PRESENT = 0x01;
        const RW = 0x02;
        const USER = 0x04;
        const WRITETHRU = 0x08; // reserved
        const CACHEDIS = 0x10; // reserved
        const ACCESSED = 0x20; // reserved
        const DIRTY = 0x40; // reserved
        const PS = 0x80; // reserved
    }
}

/// Translate external flags to Sv39 PTE bits. RW maps to R|W|X: pages
/// that are writable may hold code after `exec`, and a finer split is a
/// non-goal here. Leaves are pre-marked accessed and dirty so the
/// hardware never needs to manage A/D.
fn pte_flags(flags: MapFlags) -> u64 {
    let mut f = 0;
    if flags.contains(MapFlags::PRESENT) {
        f |= PTE_V;
    }
    if flags.contains(MapFlags::RW) {
        f |= PTE_R | PTE_W | PTE_X;
    }
    if flags.contains(MapFlags::USER) {
        f |= PTE_U;
    }
    f | PTE_A | PTE_D
}

fn make_pte(pa: PhysAddr, flags: u64) -> u64 {
    (pa.ppn() << 10) | (flags & 0x3ff)
}

fn pte_phys(pte: u64) -> PhysAddr {
    PhysAddr::new((pte >> 10) << 12)
}

pub struct Vmm {
    /// Physical address of the kernel root table (identity-mapped, so
    /// also its accessible address).
    root: Option<PhysAddr>,
}

impl Vmm {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn root_phys(&self) -> Option<PhysAddr> {
        self.root
    }

    /// Allocate and zero the root table, run the self-test, then install
    /// identity mappings for RAM and the MMIO regions the kernel touches.
    pub fn init(
        &mut self,
        palloc: &mut FrameAllocator,
        memory: &mut dyn Memory,
        ram_size: u64,
    ) -> Result<(), VmmError> {
        if self.root.is_some() {
            return Ok(());
        }
        info!("vmm: initialize");

        let root = alloc_table_page(palloc, memory)?;
        self.root = Some(root);
        info!("vmm: Sv39 root page table at {:#x}", root.val());

        self.self_test(palloc, memory);

        // Identity maps: all of RAM (user-accessible so user code, data
        // and stacks work under Sv39), MMIO kernel-only.
        self.map_identity_range(palloc, memory, RAM_BASE, RAM_BASE + ram_size, MapFlags::RW | MapFlags::USER)?;
        self.map_identity_range(palloc, memory, UART_BASE, UART_BASE + 0x1000, MapFlags::RW)?;
        self.map_identity_range(palloc, memory, VIRTIO_MMIO_START, VIRTIO_MMIO_END, MapFlags::RW)?;
        self.map_identity_range(palloc, memory, CLINT_BASE, CLINT_BASE + CLINT_SIZE, MapFlags::RW)?;
        self.map_identity_range(palloc, memory, PLIC_BASE, PLIC_BASE + 0x20_0000, MapFlags::RW)?;

        Ok(())
    }

    fn map_identity_range(
        &mut self,
        palloc: &mut FrameAllocator,
        memory: &mut dyn Memory,
        start: u64,
        end: u64,
        flags: MapFlags,
    ) -> Result<(), VmmError> {
        let mut addr = start & !(PAGE_SIZE - 1);
        while addr < end {
            self.map(palloc, memory, VirtAddr::new(addr), PhysAddr::new(addr), flags)?;
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Map one page. Both addresses must be page aligned; intermediate
    /// tables are allocated on demand.
    pub fn map(
        &mut self,
        palloc: &mut FrameAllocator,
        memory: &mut dyn Memory,
        va: VirtAddr,
        pa: PhysAddr,
        flags: MapFlags,
    ) -> Result<(), VmmError> {
        let root = self.root.ok_or(VmmError::RootMissing)?;
        if !va.is_page_aligned() {
            return Err(VmmError::Misaligned(va.val()));
        }
        if !pa.is_page_aligned() {
            return Err(VmmError::Misaligned(pa.val()));
        }

        let l1 = next_level(memory, root, vpn2(va), Some(&mut *palloc))?
            .ok_or(VmmError::OutOfMemory)?;
        let l0 = next_level(memory, l1, vpn1(va), Some(palloc))?
            .ok_or(VmmError::OutOfMemory)?;

        let pte = make_pte(pa, pte_flags(flags | MapFlags::PRESENT));
        memory.write_dword(l0 + vpn0(va) * 8, pte)?;
        Ok(())
    }

    /// Allocate a physical page, zero it, and map it at `va`. The page is
    /// freed again if the map fails.
    pub fn map_page(
        &mut self,
        palloc: &mut FrameAllocator,
        memory: &mut dyn Memory,
        va: VirtAddr,
        flags: MapFlags,
    ) -> Result<(), VmmError> {
        let page = palloc.kalloc().ok_or(VmmError::OutOfMemory)?;
        if let Err(e) = page_zero(memory, page) {
            palloc.kfree(page);
            return Err(e.into());
        }
        if let Err(e) = self.map(palloc, memory, va, page, flags) {
            palloc.kfree(page);
            return Err(e);
        }
        Ok(())
    }

    /// Clear the leaf PTE for `va`; optionally release the physical page
    /// it pointed to. Intermediate tables are never reclaimed.
    pub fn unmap(
        &mut self,
        palloc: &mut FrameAllocator,
        memory: &mut dyn Memory,
        va: VirtAddr,
        free_phys: bool,
    ) -> Result<(), VmmError> {
        let root = self.root.ok_or(VmmError::RootMissing)?;
        if !va.is_page_aligned() {
            return Err(VmmError::Misaligned(va.val()));
        }

        let l1 = next_level(memory, root, vpn2(va), None)?
            .ok_or(VmmError::NotMapped(va.val()))?;
        let l0 = next_level(memory, l1, vpn1(va), None)?
            .ok_or(VmmError::NotMapped(va.val()))?;

        let pte_addr = l0 + vpn0(va) * 8;
        let pte = memory.read_dword(pte_addr)?;
        if pte & PTE_V == 0 {
            return Err(VmmError::NotMapped(va.val()));
        }

        memory.write_dword(pte_addr, 0)?;
        if free_phys {
            palloc.kfree(pte_phys(pte));
        }
        Ok(())
    }

    /// Walk without allocating; `None` if any level is absent or the leaf
    /// is invalid.
    pub fn translate(&self, memory: &mut dyn Memory, va: VirtAddr) -> Option<PhysAddr> {
        let root = self.root?;
        let l1 = next_level(memory, root, vpn2(va), None).ok()??;
        let l0 = next_level(memory, l1, vpn1(va), None).ok()??;
        let pte = memory.read_dword(l0 + vpn0(va) * 8).ok()?;
        if pte & PTE_V == 0 {
            return None;
        }
        Some(PhysAddr::new(pte_phys(pte).val() | va.page_offset()))
    }

    /// Point `satp` at the root table (Sv39 mode, ASID 0). Identity
    /// mappings mean no address changes meaning; translation just turns on.
    pub fn activate(&self, hart: &mut Hart) {
        let Some(root) = self.root else {
            warn!("vmm: activate before init");
            return;
        };
        let satp = (8u64 << 60) | (root.ppn() & ((1 << 44) - 1));
        hart.csr_write(CSR_SATP, satp);
        // sfence.vma x0, x0 would go here; the simulated MMU has no TLB.
        info!("vmm: Sv39 activated, satp={:#x}", satp);
    }

    /// Exercise map/translate/unmap once against a scratch page before any
    /// real mappings exist. Failures are logged, not fatal.
    fn self_test(&mut self, palloc: &mut FrameAllocator, memory: &mut dyn Memory) {
        let test_va = VirtAddr::new(HEAP_USER_BASE);

        let Some(page) = palloc.kalloc() else {
            warn!("vmm self-test: kalloc failed, skipping");
            return;
        };

        if self
            .map(palloc, memory, test_va, page, MapFlags::RW | MapFlags::USER)
            .is_err()
        {
            warn!("vmm self-test: map failed, skipping");
            palloc.kfree(page);
            return;
        }

        expect(
            self.translate(memory, test_va) == Some(page),
            "vmm_translate returns mapped physical page",
        );
        expect(
            self.unmap(palloc, memory, test_va, true).is_ok(),
            "vmm_unmap returns ok on mapped page",
        );
        expect(
            self.translate(memory, test_va).is_none(),
            "vmm_translate returns none after unmap",
        );
    }
}

impl Default for Vmm {
    fn default() -> Self {
        Self::new()
    }
}

fn expect(cond: bool, msg: &str) {
    if cond {
        info!("[ok] {}", msg);
    } else {
        error!("SELF-TEST FAILED: {}", msg);
    }
}

fn vpn2(va: VirtAddr) -> u64 {
    (va.val() >> 30) & 0x1ff
}

fn vpn1(va: VirtAddr) -> u64 {
    (va.val() >> 21) & 0x1ff
}

fn vpn0(va: VirtAddr) -> u64 {
    (va.val() >> 12) & 0x1ff
}

fn page_zero(memory: &mut dyn Memory, page: PhysAddr) -> Result<(), hematite_vm::MemoryError> {
    for i in 0..(PAGE_SIZE / 8) {
        memory.write_dword(page + i * 8, 0)?;
    }
    Ok(())
}

fn alloc_table_page(
    palloc: &mut FrameAllocator,
    memory: &mut dyn Memory,
) -> Result<PhysAddr, VmmError> {
    let page = palloc.kalloc().ok_or(VmmError::OutOfMemory)?;
    if let Err(e) = page_zero(memory, page) {
        palloc.kfree(page);
        return Err(e.into());
    }
    Ok(page)
}

/// Walk one level down; with an allocator, missing tables are created
/// (intermediate PTEs carry V only, per Sv39 non-leaf rules). Returns the
/// next table's physical address, or `None` for a missing entry on a
/// read-only walk.
fn next_level(
    memory: &mut dyn Memory,
    table: PhysAddr,
    idx: u64,
    palloc: Option<&mut FrameAllocator>,
) -> Result<Option<PhysAddr>, VmmError> {
    let pte_addr = table + idx * 8;
    let pte = memory.read_dword(pte_addr)?;
    if pte & PTE_V == 0 {
        let Some(palloc) = palloc else {
            return Ok(None);
        };
        let page = match alloc_table_page(palloc, memory) {
            Ok(p) => p,
            Err(VmmError::OutOfMemory) => return Ok(None),
            Err(e) => return Err(e),
        };
        memory.write_dword(pte_addr, make_pte(page, PTE_V))?;
        return Ok(Some(page));
    }
    Ok(Some(pte_phys(pte)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hematite_vm::SimpleMemory;
    use proptest::prelude::*;

    const TEST_RAM: usize = 32 * 1024 * 1024;
    const TEST_HEAP_START: u64 = RAM_BASE + 0x0010_0000;

    fn fixture() -> (Vmm, FrameAllocator, SimpleMemory) {
        let mut palloc = FrameAllocator::new();
        palloc.init(TEST_HEAP_START, RAM_BASE + TEST_RAM as u64);
        (Vmm::new(), palloc, SimpleMemory::new(TEST_RAM))
    }

    fn fixture_with_root() -> (Vmm, FrameAllocator, SimpleMemory) {
        let (mut vmm, mut palloc, mut mem) = fixture();
        let root = alloc_table_page(&mut palloc, &mut mem).unwrap();
        vmm.root = Some(root);
        (vmm, palloc, mem)
    }

    #[test]
    fn map_translate_unmap_round_trip() {
        let (mut vmm, mut palloc, mut mem) = fixture_with_root();
        let va = VirtAddr::new(0x8040_0000);
        let pa = palloc.kalloc().unwrap();

        vmm.map(&mut palloc, &mut mem, va, pa, MapFlags::RW | MapFlags::USER)
            .unwrap();
        assert_eq!(vmm.translate(&mut mem, va), Some(pa));
        assert_eq!(
            vmm.translate(&mut mem, VirtAddr::new(va.val() + 0x777)),
            Some(pa + 0x777)
        );

        vmm.unmap(&mut palloc, &mut mem, va, true).unwrap();
        assert_eq!(vmm.translate(&mut mem, va), None);

        // map; unmap; map over the same VA is always legal
        let pa2 = palloc.kalloc().unwrap();
        vmm.map(&mut palloc, &mut mem, va, pa2, MapFlags::RW).unwrap();
        assert_eq!(vmm.translate(&mut mem, va), Some(pa2));
    }

    #[test]
    fn alignment_is_enforced() {
        let (mut vmm, mut palloc, mut mem) = fixture_with_root();
        let pa = palloc.kalloc().unwrap();
        assert_eq!(
            vmm.map(&mut palloc, &mut mem, VirtAddr::new(0x8040_0001), pa, MapFlags::RW),
            Err(VmmError::Misaligned(0x8040_0001))
        );
        assert_eq!(
            vmm.map(&mut palloc, &mut mem, VirtAddr::new(0x8040_0000), PhysAddr::new(pa.val() + 1), MapFlags::RW),
            Err(VmmError::Misaligned(pa.val() + 1))
        );
        assert!(matches!(
            vmm.unmap(&mut palloc, &mut mem, VirtAddr::new(0x8040_0800), false),
            Err(VmmError::Misaligned(_))
        ));
    }

    #[test]
    fn unmap_of_unmapped_fails() {
        let (mut vmm, mut palloc, mut mem) = fixture_with_root();
        assert!(matches!(
            vmm.unmap(&mut palloc, &mut mem, VirtAddr::new(0x8040_0000), false),
            Err(VmmError::NotMapped(_))
        ));
    }

    #[test]
    fn map_before_init_fails() {
        let (mut vmm, mut palloc, mut mem) = fixture();
        let pa = palloc.kalloc().unwrap();
        assert_eq!(
            vmm.map(&mut palloc, &mut mem, VirtAddr::new(0x8040_0000), pa, MapFlags::RW),
            Err(VmmError::RootMissing)
        );
    }

    #[test]
    fn last_page_of_region_allocates_next_table() {
        let (mut vmm, mut palloc, mut mem) = fixture_with_root();
        // both VAs share VPN2 but sit in adjacent 2 MiB regions, so the
        // second map needs a fresh level-0 table
        let va_last = VirtAddr::new(0x805f_f000);
        let va_next = VirtAddr::new(0x8060_0000);

        let pa1 = palloc.kalloc().unwrap();
        vmm.map(&mut palloc, &mut mem, va_last, pa1, MapFlags::RW).unwrap();
        let tables_before = palloc.free_pages();

        let pa2 = palloc.kalloc().unwrap();
        vmm.map(&mut palloc, &mut mem, va_next, pa2, MapFlags::RW).unwrap();
        // one page was handed out above, one more went to the new table
        assert_eq!(palloc.free_pages(), tables_before - 2);

        assert_eq!(vmm.translate(&mut mem, va_last), Some(pa1));
        assert_eq!(vmm.translate(&mut mem, va_next), Some(pa2));
    }

    #[test]
    fn map_page_zeroes_the_frame() {
        let (mut vmm, mut palloc, mut mem) = fixture_with_root();
        let va = VirtAddr::new(0x8040_2000);
        vmm.map_page(&mut palloc, &mut mem, va, MapFlags::RW | MapFlags::USER)
            .unwrap();
        let pa = vmm.translate(&mut mem, va).unwrap();
        for i in 0..(PAGE_SIZE / 8) {
            assert_eq!(mem.read_dword(pa + i * 8).unwrap(), 0);
        }
    }

    #[test]
    fn map_page_failure_releases_the_frame() {
        let (mut vmm, mut palloc, mut mem) = fixture_with_root();
        // drain the allocator so the intermediate tables cannot be built
        while palloc.free_pages() > 1 {
            palloc.kalloc();
        }
        let before = palloc.free_pages();
        assert!(vmm
            .map_page(&mut palloc, &mut mem, VirtAddr::new(0x8040_0000), MapFlags::RW)
            .is_err());
        assert_eq!(palloc.free_pages(), before);
    }

    #[test]
    fn init_installs_identity_maps_and_self_test_cleans_up() {
        let (mut vmm, mut palloc, mut mem) = fixture();
        vmm.init(&mut palloc, &mut mem, 16 * 1024 * 1024).unwrap();

        // RAM identity
        let va = VirtAddr::new(RAM_BASE + 0x1234);
        assert_eq!(vmm.translate(&mut mem, va), Some(PhysAddr::new(RAM_BASE + 0x1234)));
        // MMIO identity
        for base in [UART_BASE, CLINT_BASE, PLIC_BASE, VIRTIO_MMIO_START] {
            assert_eq!(
                vmm.translate(&mut mem, VirtAddr::new(base)),
                Some(PhysAddr::new(base)),
                "identity map missing at {:#x}",
                base
            );
        }
        // outside the mapped RAM size nothing translates
        assert_eq!(
            vmm.translate(&mut mem, VirtAddr::new(RAM_BASE + 17 * 1024 * 1024)),
            None
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // distinct page-aligned VAs map to their PAs and translate back
        #[test]
        fn mapped_addresses_translate(
            slots in proptest::collection::hash_set(0u64..4096, 1..24)
        ) {
            let (mut vmm, mut palloc, mut mem) = fixture_with_root();
            let mut pairs = Vec::new();
            for slot in slots {
                let va = VirtAddr::new(0x8040_0000 + slot * PAGE_SIZE);
                let pa = palloc.kalloc().unwrap();
                vmm.map(&mut palloc, &mut mem, va, pa, MapFlags::RW | MapFlags::USER).unwrap();
                pairs.push((va, pa));
            }
            for (va, pa) in &pairs {
                prop_assert_eq!(vmm.translate(&mut mem, *va), Some(*pa));
            }
            // unmapping one mapping does not disturb the others
            let (va0, _) = pairs[0];
            vmm.unmap(&mut palloc, &mut mem, va0, true).unwrap();
            prop_assert_eq!(vmm.translate(&mut mem, va0), None);
            for (va, pa) in &pairs[1..] {
                prop_assert_eq!(vmm.translate(&mut mem, *va), Some(*pa));
            }
        }
    }
}
