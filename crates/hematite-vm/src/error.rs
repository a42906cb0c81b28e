use core::fmt;

/// Raised by MMIO device models.
#[derive(Debug, PartialEq)]
pub enum DeviceError {
    UnknownRegister(u64),
    Io(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::UnknownRegister(off) => {
                write!(f, "no register at device offset {:#x}", off)
            }
            DeviceError::Io(msg) => write!(f, "host i/o: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Physical address-space errors from the system bus.
#[derive(Debug, PartialEq)]
pub enum MemoryError {
    /// Address belongs to neither RAM nor any MMIO window.
    Unmapped(u64),
    Misaligned { addr: u64, alignment: u64 },
    Device(DeviceError),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::Unmapped(addr) => {
                write!(f, "{:#x} is neither ram nor mmio", addr)
            }
            MemoryError::Misaligned { addr, alignment } => {
                write!(f, "access at {:#x} needs {}-byte alignment", addr, alignment)
            }
            MemoryError::Device(e) => write!(f, "mmio: {}", e),
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<DeviceError> for MemoryError {
    fn from(e: DeviceError) -> Self {
        MemoryError::Device(e)
    }
}

#[derive(Debug, PartialEq)]
pub enum TrapError {
    /// The handler wants the machine stopped (clean shutdown).
    Halt,
    /// The handler hit a condition it cannot recover from.
    Fatal(String),
    Unhandled(crate::trap::TrapCause),
}

impl fmt::Display for TrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapError::Halt => write!(f, "trap handler requested shutdown"),
            TrapError::Fatal(msg) => write!(f, "fatal kernel condition: {}", msg),
            TrapError::Unhandled(cause) => write!(f, "nothing handled trap {:?}", cause),
        }
    }
}

impl std::error::Error for TrapError {}

#[derive(Debug, PartialEq)]
pub enum DecodeError {
    UnknownOpcode(u32),
    MalformedInstruction(u32),
    BadRegister(u32),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownOpcode(op) => {
                write!(f, "no instruction with opcode {:#04x}", op)
            }
            DecodeError::MalformedInstruction(word) => {
                write!(f, "cannot decode instruction word {:#010x}", word)
            }
            DecodeError::BadRegister(idx) => {
                write!(f, "register index {} out of range", idx)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, PartialEq)]
pub enum VmError {
    Memory(MemoryError),
    Trap(TrapError),
    Decode(DecodeError),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Memory(e) => write!(f, "bus: {}", e),
            VmError::Trap(e) => write!(f, "trap: {}", e),
            VmError::Decode(e) => write!(f, "decode: {}", e),
        }
    }
}

impl std::error::Error for VmError {}

impl From<MemoryError> for VmError {
    fn from(e: MemoryError) -> Self {
        VmError::Memory(e)
    }
}

impl From<TrapError> for VmError {
    fn from(e: TrapError) -> Self {
        VmError::Trap(e)
    }
}

impl From<DecodeError> for VmError {
    fn from(e: DecodeError) -> Self {
        VmError::Decode(e)
    }
}
