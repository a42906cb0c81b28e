use crate::devices::{Device, DeviceInterrupt};
use crate::error::DeviceError;
use std::collections::VecDeque;
use std::io::{self, Write};

pub const UART_BASE: u64 = 0x1000_0000;
pub const UART_SIZE: u64 = 0x100;
pub const UART_IRQ: u32 = 10;

// Register offsets
pub const RBR: u64 = 0x00; // Receiver Buffer Register (Read Only)
pub const THR: u64 = 0x00; // Transmitter Holding Register (Write Only)
pub const LSR: u64 = 0x05; // Line Status Register

pub const LSR_DATA_READY: u32 = 1 << 0;
pub const LSR_THR_EMPTY: u32 = 1 << 5;

/// Where transmitted bytes go.
enum OutputSink {
    Stdout,
    Buffer(Vec<u8>),
}

/// 16550-flavoured UART. Input is fed in by the host (CLI or tests)
/// rather than read from stdin inside the register handler, so runs are
/// deterministic; newly available input raises IRQ 10 once.
pub struct UartDevice {
    input_buffer: VecDeque<u8>,
    output: OutputSink,
    irq_pending: bool,
}

impl Default for UartDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl UartDevice {
    pub fn new() -> Self {
        Self {
            input_buffer: VecDeque::new(),
            output: OutputSink::Stdout,
            irq_pending: false,
        }
    }

    /// UART whose output is captured instead of printed (used by tests).
    pub fn buffered() -> Self {
        Self {
            input_buffer: VecDeque::new(),
            output: OutputSink::Buffer(Vec::new()),
            irq_pending: false,
        }
    }

    pub fn feed_input(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.irq_pending = true;
        }
        self.input_buffer.extend(data.iter().copied());
    }

    /// Everything transmitted so far (buffered sink only).
    pub fn output(&self) -> &[u8] {
        match &self.output {
            OutputSink::Buffer(buf) => buf,
            OutputSink::Stdout => &[],
        }
    }
}

impl Device for UartDevice {
    fn name(&self) -> &str {
        "UART0"
    }

    fn read(&mut self, offset: u64) -> Result<u32, DeviceError> {
        match offset {
            RBR => {
                if let Some(byte) = self.input_buffer.pop_front() {
                    // CRLF normalization (terminal artifact)
                    if byte == 13 {
                        if self.input_buffer.front() == Some(&10) {
                            self.input_buffer.pop_front();
                        }
                        Ok(10)
                    } else {
                        Ok(byte as u32)
                    }
                } else {
                    Ok(0)
                }
            }
            LSR => {
                let dr = if !self.input_buffer.is_empty() {
                    LSR_DATA_READY
                } else {
                    0
                };
                Ok(dr | LSR_THR_EMPTY)
            }
            _ => Ok(0),
        }
    }

    fn write(&mut self, offset: u64, value: u32) -> Result<(), DeviceError> {
        match offset {
            THR => {
                let byte = (value & 0xff) as u8;
                match &mut self.output {
                    OutputSink::Buffer(buf) => buf.push(byte),
                    OutputSink::Stdout => {
                        print!("{}", byte as char);
                        io::stdout()
                            .flush()
                            .map_err(|e| DeviceError::Io(e.to_string()))?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn tick(&mut self) -> Result<Option<DeviceInterrupt>, DeviceError> {
        if self.irq_pending {
            self.irq_pending = false;
            return Ok(Some(DeviceInterrupt {
                device_name: self.name().into(),
                irq_number: UART_IRQ,
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmit_is_captured() {
        let mut uart = UartDevice::buffered();
        for b in b"ok" {
            uart.write(THR, *b as u32).unwrap();
        }
        assert_eq!(uart.output(), b"ok");
    }

    #[test]
    fn receive_reports_data_ready() {
        let mut uart = UartDevice::buffered();
        assert_eq!(uart.read(LSR).unwrap() & LSR_DATA_READY, 0);
        uart.feed_input(b"a");
        assert_ne!(uart.read(LSR).unwrap() & LSR_DATA_READY, 0);
        assert_eq!(uart.read(RBR).unwrap(), b'a' as u32);
        assert_eq!(uart.read(RBR).unwrap(), 0);
        // one interrupt per feed
        assert!(uart.tick().unwrap().is_some());
        assert!(uart.tick().unwrap().is_none());
    }

    #[test]
    fn crlf_is_normalized() {
        let mut uart = UartDevice::buffered();
        uart.feed_input(b"\r\nx");
        assert_eq!(uart.read(RBR).unwrap(), 10);
        assert_eq!(uart.read(RBR).unwrap(), b'x' as u32);
    }
}
