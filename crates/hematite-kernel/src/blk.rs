//! Block device driver (PIO against the virtio-style MMIO window).

use crate::error::KernelError;
use hematite_vm::devices::block::{
    BUF_OFFSET, CMD_READ, CMD_WRITE, REG_COMMAND, REG_SECTOR, REG_STATUS, SECTOR_SIZE,
    STATUS_DONE, VIRTIO_MMIO_START,
};
use hematite_vm::{Memory, PhysAddr};
use log::{debug, info, warn};

const BLK_BASE: u64 = VIRTIO_MMIO_START;
const POLL_LIMIT: u32 = 10_000;

pub struct BlkDriver {
    present: bool,
}

impl BlkDriver {
    pub fn new() -> Self {
        Self { present: false }
    }

    pub fn present(&self) -> bool {
        self.present
    }

    /// Probe the MMIO slot; a machine without a disk is fine.
    pub fn init(&mut self, memory: &mut dyn Memory) {
        match memory.read_word(PhysAddr::new(BLK_BASE + REG_STATUS)) {
            Ok(_) => {
                self.present = true;
                info!("blk: device at {:#x}", BLK_BASE);
            }
            Err(_) => {
                warn!("blk: no block device attached");
            }
        }
    }

    pub fn read_sector(
        &self,
        memory: &mut dyn Memory,
        sector: u32,
        buf: &mut [u8; SECTOR_SIZE],
    ) -> Result<(), KernelError> {
        self.submit(memory, sector, CMD_READ)?;
        for i in 0..SECTOR_SIZE / 4 {
            let word = memory.read_word(PhysAddr::new(BLK_BASE + BUF_OFFSET + i as u64 * 4))?;
            buf[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        self.ack(memory);
        Ok(())
    }

    pub fn write_sector(
        &self,
        memory: &mut dyn Memory,
        sector: u32,
        buf: &[u8; SECTOR_SIZE],
    ) -> Result<(), KernelError> {
        if !self.present {
            return Err(KernelError::Init("no block device".into()));
        }
        for i in 0..SECTOR_SIZE / 4 {
            let word = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
            memory.write_word(PhysAddr::new(BLK_BASE + BUF_OFFSET + i as u64 * 4), word)?;
        }
        self.submit(memory, sector, CMD_WRITE)?;
        self.ack(memory);
        Ok(())
    }

    fn submit(&self, memory: &mut dyn Memory, sector: u32, cmd: u32) -> Result<(), KernelError> {
        if !self.present {
            return Err(KernelError::Init("no block device".into()));
        }
        memory.write_word(PhysAddr::new(BLK_BASE + REG_SECTOR), sector)?;
        memory.write_word(PhysAddr::new(BLK_BASE + REG_COMMAND), cmd)?;

        // The simulated device completes synchronously; the bounded poll
        // keeps the contract honest anyway.
        for _ in 0..POLL_LIMIT {
            let status = memory.read_word(PhysAddr::new(BLK_BASE + REG_STATUS))?;
            if status & STATUS_DONE != 0 {
                return Ok(());
            }
        }
        Err(KernelError::Init("block device timeout".into()))
    }

    fn ack(&self, memory: &mut dyn Memory) {
        let _ = memory.write_word(PhysAddr::new(BLK_BASE + REG_STATUS), 0);
    }

    /// Interrupt service routine, reached through PLIC IRQs 1..8. The
    /// PIO path has usually consumed the completion already; the ack here
    /// covers requests finishing after a poll gave up.
    pub fn intr(&mut self, memory: &mut dyn Memory) {
        match memory.read_word(PhysAddr::new(BLK_BASE + REG_STATUS)) {
            Ok(status) if status & STATUS_DONE != 0 => {
                debug!("blk: completion interrupt");
                self.ack(memory);
            }
            Ok(_) => debug!("blk: interrupt with no pending completion"),
            Err(e) => warn!("blk: interrupt but status unreadable: {}", e),
        }
    }
}

impl Default for BlkDriver {
    fn default() -> Self {
        Self::new()
    }
}
