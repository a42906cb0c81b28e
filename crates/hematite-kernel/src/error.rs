use hematite_vm::MemoryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("out of physical memory")]
    OutOfMemory,

    #[error("initialization error: {0}")]
    Init(String),

    #[error("no current process")]
    NoCurrentProcess,

    #[error("vmm error: {0}")]
    Vmm(#[from] VmmError),

    #[error("guest memory error: {0}")]
    Memory(#[from] MemoryError),
}

#[derive(Debug, Error, PartialEq)]
pub enum VmmError {
    #[error("vmm not initialized")]
    RootMissing,

    #[error("address not page aligned: {0:#x}")]
    Misaligned(u64),

    #[error("out of physical memory")]
    OutOfMemory,

    #[error("no mapping for address {0:#x}")]
    NotMapped(u64),

    #[error("guest memory error: {0}")]
    Memory(String),
}

impl From<MemoryError> for VmmError {
    fn from(e: MemoryError) -> Self {
        VmmError::Memory(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SyscallError {
    #[error("invalid syscall number: {0}")]
    InvalidSyscallNumber(u64),

    #[error("bad user address: {0:#x}")]
    BadAddress(u64),
}
