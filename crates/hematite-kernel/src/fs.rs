//! Program filesystem: a flat name -> entry-point table.
//!
//! Programs are position-independent flat binaries. Built-ins are handed
//! to the kernel at boot; a program disk, when attached, carries a
//! directory in sector 0 followed by the packed images:
//!
//! ```text
//! sector 0:  DiskHeader { magic "HMFS", count }
//!            count * DirEntry { name[20], size }
//! sector 1+: images, each starting on a sector boundary
//! ```

use crate::blk::BlkDriver;
use crate::error::KernelError;
use crate::layout::{PAGE_SIZE, PROG_AREA_END, PROG_AREA_START};
use hematite_vm::devices::block::SECTOR_SIZE;
use hematite_vm::{Memory, PhysAddr};
use log::{info, warn};
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const FS_MAGIC: u32 = u32::from_le_bytes(*b"HMFS");

pub const NAME_LEN: usize = 20;

#[derive(FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DiskHeader {
    pub magic: U32<LittleEndian>,
    pub count: U32<LittleEndian>,
}

#[derive(FromBytes, FromZeroes, AsBytes, Unaligned, Clone)]
#[repr(C)]
pub struct DirEntry {
    pub name: [u8; NAME_LEN],
    pub size: U32<LittleEndian>,
}

pub const DIR_ENTRY_SIZE: usize = std::mem::size_of::<DirEntry>();
pub const MAX_DIR_ENTRIES: usize = (SECTOR_SIZE - std::mem::size_of::<DiskHeader>()) / DIR_ENTRY_SIZE;

pub struct Program {
    pub name: String,
    pub entry: u64,
    pub size: u64,
}

/// Loaded-program registry; serves the `exec` lookup.
pub struct ProgramTable {
    programs: Vec<Program>,
    next_load: u64,
}

impl ProgramTable {
    pub fn new() -> Self {
        Self {
            programs: Vec::new(),
            next_load: PROG_AREA_START,
        }
    }

    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.programs
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.entry)
    }

    /// Copy a flat binary into the program area and register it. Returns
    /// the entry point (the load address).
    pub fn load(
        &mut self,
        memory: &mut dyn Memory,
        name: &str,
        code: &[u8],
    ) -> Result<u64, KernelError> {
        if self.lookup(name).is_some() {
            return Err(KernelError::Init(format!("program {:?} already loaded", name)));
        }
        let entry = self.next_load;
        let end = entry + code.len() as u64;
        if end > PROG_AREA_END {
            return Err(KernelError::Init("program area exhausted".into()));
        }

        memory.write_bytes(PhysAddr::new(entry), code)?;
        self.next_load = (end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        self.programs.push(Program {
            name: name.into(),
            entry,
            size: code.len() as u64,
        });
        info!("fs: loaded {:?} at {:#x} ({} bytes)", name, entry, code.len());
        Ok(entry)
    }

    /// Mount the program disk, if one is attached and carries a valid
    /// directory. Missing or foreign disks are not an error.
    pub fn init_from_disk(&mut self, memory: &mut dyn Memory, blk: &BlkDriver) {
        if !blk.present() {
            return;
        }
        let mut sector = [0u8; SECTOR_SIZE];
        if blk.read_sector(memory, 0, &mut sector).is_err() {
            warn!("fs: directory sector unreadable");
            return;
        }

        let Some(header) = DiskHeader::read_from_prefix(&sector[..]) else {
            return;
        };
        if header.magic.get() != FS_MAGIC {
            info!("fs: no program disk (bad magic)");
            return;
        }

        let count = (header.count.get() as usize).min(MAX_DIR_ENTRIES);
        let mut data_sector = 1u32;
        for i in 0..count {
            let off = std::mem::size_of::<DiskHeader>() + i * DIR_ENTRY_SIZE;
            let Some(entry) = DirEntry::read_from_prefix(&sector[off..]) else {
                break;
            };
            let size = entry.size.get() as usize;
            let name = cstr_name(&entry.name);

            let sectors = size.div_ceil(SECTOR_SIZE) as u32;
            let mut code = vec![0u8; sectors as usize * SECTOR_SIZE];
            let mut ok = true;
            for s in 0..sectors {
                let mut buf = [0u8; SECTOR_SIZE];
                if blk.read_sector(memory, data_sector + s, &mut buf).is_err() {
                    warn!("fs: read failed for {:?}", name);
                    ok = false;
                    break;
                }
                let at = s as usize * SECTOR_SIZE;
                code[at..at + SECTOR_SIZE].copy_from_slice(&buf);
            }
            data_sector += sectors;
            if !ok {
                continue;
            }
            code.truncate(size);
            if let Err(e) = self.load(memory, &name, &code) {
                warn!("fs: load failed for {:?}: {}", name, e);
            }
        }
        info!("fs: {} programs registered", self.programs.len());
    }
}

impl Default for ProgramTable {
    fn default() -> Self {
        Self::new()
    }
}

fn cstr_name(raw: &[u8; NAME_LEN]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Build a program-disk image (used by the host `mkdisk` tool and tests).
pub fn build_disk_image(programs: &[(&str, Vec<u8>)]) -> Vec<u8> {
    assert!(programs.len() <= MAX_DIR_ENTRIES, "too many programs for the directory");

    let mut directory = vec![0u8; SECTOR_SIZE];
    let header = DiskHeader {
        magic: U32::new(FS_MAGIC),
        count: U32::new(programs.len() as u32),
    };
    directory[..std::mem::size_of::<DiskHeader>()].copy_from_slice(header.as_bytes());

    let mut image = directory;
    for (i, (name, code)) in programs.iter().enumerate() {
        let mut entry = DirEntry {
            name: [0; NAME_LEN],
            size: U32::new(code.len() as u32),
        };
        let n = name.len().min(NAME_LEN - 1);
        entry.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        let off = std::mem::size_of::<DiskHeader>() + i * DIR_ENTRY_SIZE;
        image[off..off + DIR_ENTRY_SIZE].copy_from_slice(entry.as_bytes());

        let mut padded = code.clone();
        while padded.len() % SECTOR_SIZE != 0 {
            padded.push(0);
        }
        image.extend_from_slice(&padded);
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use hematite_vm::SimpleMemory;

    #[test]
    fn load_and_lookup() {
        let mut mem = SimpleMemory::new(8 * 1024 * 1024);
        let mut table = ProgramTable::new();
        let entry = table.load(&mut mem, "shell", &[1, 2, 3, 4]).unwrap();
        assert_eq!(entry, PROG_AREA_START);
        assert_eq!(table.lookup("shell"), Some(entry));
        assert_eq!(table.lookup("nope"), None);

        // images land on page boundaries
        let entry2 = table.load(&mut mem, "hello", &[5; 5000]).unwrap();
        assert_eq!(entry2 % PAGE_SIZE, 0);
        assert!(entry2 >= entry + 4);

        // duplicate names are refused
        assert!(table.load(&mut mem, "shell", &[9]).is_err());

        // the bytes are in guest memory
        assert_eq!(mem.read_byte(PhysAddr::new(entry)).unwrap(), 1);
    }

    #[test]
    fn disk_image_round_trips_through_header() {
        let image = build_disk_image(&[("shell", vec![0x13; 700]), ("hello", vec![0x73; 12])]);
        let header = DiskHeader::read_from_prefix(&image[..]).unwrap();
        assert_eq!(header.magic.get(), FS_MAGIC);
        assert_eq!(header.count.get(), 2);
        // 700 bytes -> 2 data sectors, then hello starts at sector 3
        assert_eq!(image.len(), SECTOR_SIZE * 4);
        assert_eq!(image[SECTOR_SIZE], 0x13);
        assert_eq!(image[3 * SECTOR_SIZE], 0x73);
    }
}
