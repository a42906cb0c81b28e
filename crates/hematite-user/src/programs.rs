//! Built-in guest programs, assembled at load time.
//!
//! Everything here is position-independent (pc-relative addressing only),
//! so the kernel can place the images wherever its program area allocator
//! decides.

use crate::asm::{Assembler, A0, A1, A2, A7, T0, ZERO};
use crate::nr;

/// Convenience: write(1, msg, len) for a string bound behind `data`.
fn emit_write(a: &mut Assembler, msg: &[u8]) -> crate::asm::Label {
    let data = a.new_label();
    a.li(A0, 1);
    a.la(A1, data);
    a.li(A2, msg.len() as i64);
    a.li(A7, nr::WRITE as i64);
    a.ecall();
    data
}

fn emit_exit(a: &mut Assembler) {
    a.li(A7, nr::EXIT as i64);
    a.ecall();
}

/// Prints a greeting and exits. The usual `exec` target.
pub fn hello() -> Vec<u8> {
    let msg = b"hello from exec\n";
    let mut a = Assembler::new(0);
    let data = emit_write(&mut a, msg);
    emit_exit(&mut a);
    a.bind(data);
    a.bytes(msg);
    a.assemble()
}

/// Burns a few thousand cycles, then exits. Exists to have something for
/// the scheduler to preempt.
pub fn spin() -> Vec<u8> {
    let mut a = Assembler::new(0);
    a.li(T0, 20_000);
    let top = a.label();
    a.addi(T0, T0, -1);
    a.bne(T0, ZERO, top);
    emit_exit(&mut a);
    a.assemble()
}

/// The demo shell: banner, fork, child execs `hello`, parent waits and
/// reports, dumps the process table, exits.
pub fn shell() -> Vec<u8> {
    let banner = b"hematite: shell starting\n";
    let reaped = b"shell: child reaped\n";
    let exec_name = b"hello\0";

    let mut a = Assembler::new(0);
    let banner_data = emit_write(&mut a, banner);

    a.li(A7, nr::FORK as i64);
    a.ecall();
    let parent = a.new_label();
    a.bne(A0, ZERO, parent);

    // child: exec("hello"); exec only returns on failure
    let name_data = a.new_label();
    a.la(A0, name_data);
    a.li(A7, nr::EXEC as i64);
    a.ecall();
    emit_exit(&mut a);

    a.bind(parent);
    a.li(A7, nr::WAIT as i64);
    a.ecall();
    let reaped_data = emit_write(&mut a, reaped);
    a.li(A7, nr::PS as i64);
    a.ecall();
    emit_exit(&mut a);

    a.bind(banner_data);
    a.bytes(banner);
    a.bind(reaped_data);
    a.bytes(reaped);
    a.bind(name_data);
    a.bytes(exec_name);
    a.assemble()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programs_assemble() {
        assert!(!hello().is_empty());
        assert!(!spin().is_empty());
        assert!(!shell().is_empty());
        // instruction stream is word-aligned
        assert_eq!(shell().len() % 4, 0);
    }
}
