use crate::devices::clint::{Clint, CLINT_BASE, CLINT_SIZE};
use crate::devices::plic::{Plic, PLIC_BASE, PLIC_SIZE};
use crate::devices::uart::{UartDevice, UART_BASE, UART_SIZE};
use crate::devices::{Device, DeviceManager};
use crate::error::MemoryError;
use crate::memory::{Memory, PhysAddr, SimpleMemory, RAM_BASE};

/// Physical address space: RAM at `0x8000_0000`, CLINT, PLIC, UART and
/// MMIO devices below. The CLINT, PLIC and UART are named members (the
/// machine loop and tests need direct access to them); everything else
/// (the block device) goes through the generic device manager.
pub struct SystemBus {
    ram: SimpleMemory,
    pub clint: Clint,
    pub plic: Plic,
    pub uart: UartDevice,
    devices: DeviceManager,
}

impl SystemBus {
    pub fn new(memory_size: usize) -> Self {
        Self {
            ram: SimpleMemory::new(memory_size),
            clint: Clint::new(),
            plic: Plic::new(),
            uart: UartDevice::new(),
            devices: DeviceManager::new(),
        }
    }

    pub fn with_uart(memory_size: usize, uart: UartDevice) -> Self {
        Self {
            ram: SimpleMemory::new(memory_size),
            clint: Clint::new(),
            plic: Plic::new(),
            uart,
            devices: DeviceManager::new(),
        }
    }

    pub fn ram_size(&self) -> usize {
        self.ram.size()
    }

    pub fn add_device(&mut self, base_addr: u64, size: u64, device: Box<dyn Device>) {
        self.devices.add_device(base_addr, size, device);
    }

    pub fn load_program(&mut self, addr: PhysAddr, data: &[u8]) -> Result<(), MemoryError> {
        self.ram.load(addr, data)
    }

    /// Poll every interrupt source and latch raised IRQs into the PLIC.
    pub fn poll_devices(&mut self) {
        if let Ok(Some(irq)) = self.uart.tick() {
            self.plic.raise(irq.irq_number);
        }
        for irq in self.devices.tick_all() {
            self.plic.raise(irq.irq_number);
        }
    }

    fn in_clint(addr: u64) -> bool {
        (CLINT_BASE..CLINT_BASE + CLINT_SIZE).contains(&addr)
    }

    fn in_plic(addr: u64) -> bool {
        (PLIC_BASE..PLIC_BASE + PLIC_SIZE).contains(&addr)
    }

    fn in_uart(addr: u64) -> bool {
        (UART_BASE..UART_BASE + UART_SIZE).contains(&addr)
    }
}

impl Memory for SystemBus {
    fn read_byte(&mut self, addr: PhysAddr) -> Result<u8, MemoryError> {
        let a = addr.val();
        if a >= RAM_BASE {
            self.ram.read_byte(addr)
        } else if Self::in_uart(a) {
            // UART registers are byte-wide
            Ok(self.uart.read(a - UART_BASE)? as u8)
        } else {
            let word = self.read_word(PhysAddr::new(a & !3))?;
            let shift = (a % 4) * 8;
            Ok(((word >> shift) & 0xff) as u8)
        }
    }

    fn write_byte(&mut self, addr: PhysAddr, val: u8) -> Result<(), MemoryError> {
        let a = addr.val();
        if a >= RAM_BASE {
            self.ram.write_byte(addr, val)
        } else if Self::in_uart(a) {
            self.uart.write(a - UART_BASE, val as u32)?;
            Ok(())
        } else {
            if a % 4 != 0 {
                return Err(MemoryError::Misaligned {
                    addr: a,
                    alignment: 4,
                });
            }
            self.write_word(addr, val as u32)
        }
    }

    fn read_word(&mut self, addr: PhysAddr) -> Result<u32, MemoryError> {
        let a = addr.val();
        if a >= RAM_BASE {
            self.ram.read_word(addr)
        } else if Self::in_clint(a) {
            Ok(self.clint.read_word(a)?)
        } else if Self::in_plic(a) {
            Ok(self.plic.read_word(a - PLIC_BASE)?)
        } else if Self::in_uart(a) {
            Ok(self.uart.read(a - UART_BASE)?)
        } else {
            Ok(self.devices.read_word(a)?)
        }
    }

    fn write_word(&mut self, addr: PhysAddr, val: u32) -> Result<(), MemoryError> {
        let a = addr.val();
        if a >= RAM_BASE {
            self.ram.write_word(addr, val)
        } else if Self::in_clint(a) {
            Ok(self.clint.write_word(a, val)?)
        } else if Self::in_plic(a) {
            Ok(self.plic.write_word(a - PLIC_BASE, val)?)
        } else if Self::in_uart(a) {
            Ok(self.uart.write(a - UART_BASE, val)?)
        } else {
            Ok(self.devices.write_word(a, val)?)
        }
    }

    fn read_dword(&mut self, addr: PhysAddr) -> Result<u64, MemoryError> {
        let a = addr.val();
        if a >= RAM_BASE {
            self.ram.read_dword(addr)
        } else if Self::in_clint(a) {
            Ok(self.clint.read_dword(a)?)
        } else {
            let lo = self.read_word(addr)? as u64;
            let hi = self.read_word(addr + 4)? as u64;
            Ok((hi << 32) | lo)
        }
    }

    fn write_dword(&mut self, addr: PhysAddr, val: u64) -> Result<(), MemoryError> {
        let a = addr.val();
        if a >= RAM_BASE {
            self.ram.write_dword(addr, val)
        } else if Self::in_clint(a) {
            Ok(self.clint.write_dword(a, val)?)
        } else {
            self.write_word(addr, val as u32)?;
            self.write_word(addr + 4, (val >> 32) as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::clint::CLINT_MTIMECMP;
    use crate::devices::plic::PLIC_CLAIM;

    #[test]
    fn routes_to_clint_and_plic() {
        let mut bus = SystemBus::new(4096);
        bus.write_dword(PhysAddr::new(CLINT_MTIMECMP), 1234).unwrap();
        assert_eq!(bus.clint.mtimecmp(), 1234);
        assert_eq!(bus.read_word(PhysAddr::new(PLIC_BASE + PLIC_CLAIM)).unwrap(), 0);
    }

    #[test]
    fn unmapped_address_errors() {
        let mut bus = SystemBus::new(4096);
        assert!(bus.read_word(PhysAddr::new(0x4000_0000)).is_err());
    }
}
