//! Physical memory layout of the platform.
//!
//! ```text
//! 0x0200_0000  CLINT (mtime / mtimecmp)
//! 0x0c00_0000  PLIC
//! 0x1000_0000  UART
//! 0x1000_1000  VirtIO MMIO slots
//! 0x8000_0000  RAM
//!   0x8000_1000  boot parking loop (wfi)
//!   0x8000_2000  idle loop
//!   ..0x8020_0000  boot stack (grows down from the top of this region)
//!   0x8020_0000  program images loaded by the filesystem
//!   0x8040_0000  per-process user heap windows (virtual; 8 KiB per pid)
//!   0x8080_0000  kernel page heap (kalloc/kfree) up to the end of RAM
//! ```
//!
//! The user-heap window is virtual-only: its backing frames come from the
//! page heap, so the two regions cannot collide.

pub const PAGE_SIZE: u64 = hematite_vm::PAGE_SIZE;

pub const RAM_BASE: u64 = hematite_vm::RAM_BASE;
pub const RAM_SIZE_DEFAULT: u64 = 128 * 1024 * 1024;

/// `wfi` loop the boot hart parks on once the kernel is up.
pub const BOOT_PARK: u64 = RAM_BASE + 0x1000;

/// Entry point of the idle process (pid 0).
pub const IDLE_ENTRY: u64 = RAM_BASE + 0x2000;

pub const BOOT_STACK_TOP: u64 = RAM_BASE + 0x0020_0000;

/// Program images are loaded here by the filesystem.
pub const PROG_AREA_START: u64 = RAM_BASE + 0x0020_0000;
pub const PROG_AREA_END: u64 = RAM_BASE + 0x0040_0000;

/// Base of the per-process user heap windows.
pub const HEAP_USER_BASE: u64 = RAM_BASE + 0x0040_0000;
/// Each process owns 8 KiB of heap at `HEAP_USER_BASE + pid * PER_PROC_HEAP`.
pub const PER_PROC_HEAP: u64 = 8 * 1024;

/// Default extent of the kernel page heap (the hosted analogue of the
/// linker's `_heap_start`/`_heap_end`).
pub const HEAP_START: u64 = RAM_BASE + 0x0080_0000;

/// mtime units between scheduler ticks.
pub const TIMER_INTERVAL: u64 = 1_000_000;
