//! Full-machine scenarios: boot the kernel on the simulated hart and let
//! assembled guest programs drive the trap paths for real.

use hematite_kernel::proc::pcb::{ProcState, IDLE_PID};
use hematite_kernel::{fs, Kernel, KernelConfig};
use hematite_user::asm::{self, Assembler};
use hematite_user::{nr, programs};
use hematite_vm::devices::block::{VirtioBlkDevice, VIRTIO_BLK_SIZE, VIRTIO_MMIO_START};
use hematite_vm::devices::uart::UartDevice;
use hematite_vm::{
    ExitReason, Hart, Machine, MachineConfig, SystemBus, RAM_BASE,
};

const RAM: usize = 16 * 1024 * 1024;

struct Setup {
    bus: SystemBus,
    hart: Hart,
    kernel: Kernel,
}

fn setup(programs: &[(&str, Vec<u8>)], timer_interval: u64) -> Setup {
    let _ = env_logger::builder().is_test(true).try_init();

    let bus = SystemBus::with_uart(RAM, UartDevice::buffered());
    let hart = Hart::new(RAM_BASE);
    let mut config = KernelConfig::for_ram_size(RAM as u64);
    config.timer_interval = timer_interval;
    let kernel = Kernel::new(config);
    let mut s = Setup { bus, hart, kernel };

    let list: Vec<(&str, &[u8])> = programs.iter().map(|(n, c)| (*n, c.as_slice())).collect();
    s.kernel
        .boot(&mut s.hart, &mut s.bus, &list)
        .expect("boot failed");
    s
}

fn run(s: Setup, limit: u64) -> Machine {
    let mut machine = Machine::new(
        MachineConfig {
            memory_size: RAM,
            instret_limit: Some(limit),
        },
        s.hart,
        s.bus,
        Box::new(s.kernel),
    );
    let exit = machine.run().expect("vm error");
    assert_eq!(exit, ExitReason::InstretLimit);
    machine
}

fn kernel_of(machine: &mut Machine) -> &mut Kernel {
    machine
        .trap_handler
        .as_any()
        .downcast_mut::<Kernel>()
        .unwrap()
}

fn console(machine: &Machine) -> String {
    String::from_utf8_lossy(machine.bus.uart.output()).into_owned()
}

fn exit_sequence(a: &mut Assembler) {
    a.li(asm::A7, nr::EXIT as i64);
    a.ecall();
}

// Boot, fork, exec, wait, exit: the whole demo path, ending with only
// idle alive and every pid handed back.
#[test]
fn shell_demo_end_to_end() {
    let s = setup(
        &[("shell", programs::shell()), ("hello", programs::hello())],
        1_000_000,
    );
    let mut machine = run(s, 300_000);

    let out = console(&machine);
    assert!(out.contains("hematite kernel booting"), "missing banner: {out}");
    assert!(out.contains("hematite: shell starting"), "missing shell banner: {out}");
    assert!(out.contains("hello from exec"), "exec child never ran: {out}");
    assert!(out.contains("shell: child reaped"), "wait never returned: {out}");

    let kernel = kernel_of(&mut machine);
    assert_eq!(kernel.procs.pids(), vec![IDLE_PID]);
    assert_eq!(kernel.procs.current_pid(), Some(IDLE_PID));
    assert!(kernel.procs.zombie_list().is_empty());
    assert_eq!(kernel.procs.next_pid_value(), 1);
}

// A child runs into a zero word (illegal instruction); the trap path
// kills it and only it. The parent reaps the corpse and carries on.
#[test]
fn illegal_instruction_kills_offender_only() {
    let msg = b"survivor\n";
    let mut a = Assembler::new(0);
    a.li(asm::A7, nr::FORK as i64);
    a.ecall();
    let parent = a.new_label();
    a.bne(asm::A0, asm::ZERO, parent);

    // child: walk straight into garbage
    let garbage = a.new_label();
    a.j(garbage);

    a.bind(parent);
    a.li(asm::A7, nr::WAIT as i64);
    a.ecall();
    let msg_data = a.new_label();
    a.li(asm::A0, 1);
    a.la(asm::A1, msg_data);
    a.li(asm::A2, msg.len() as i64);
    a.li(asm::A7, nr::WRITE as i64);
    a.ecall();
    exit_sequence(&mut a);

    a.bind(garbage);
    a.bytes(&[0, 0, 0, 0]);
    a.bind(msg_data);
    a.bytes(msg);

    let s = setup(&[("shell", a.assemble())], 1_000_000);
    let mut machine = run(s, 200_000);

    let out = console(&machine);
    assert!(out.contains("survivor"), "parent did not survive: {out}");
    let kernel = kernel_of(&mut machine);
    assert_eq!(kernel.procs.pids(), vec![IDLE_PID]);
}

// Two compute-bound tasks under a short timer slice both run to
// completion; preemption keeps rotating them until they exit.
#[test]
fn preemption_lets_both_spinners_finish() {
    let mut s = setup(
        &[("shell", programs::spin()), ("spin2", programs::spin())],
        1_000,
    );
    let entry = s.kernel.fs.lookup("spin2").unwrap();
    s.kernel
        .procs
        .create(&mut s.kernel.palloc, "spin2", entry, 0)
        .unwrap();

    let mut machine = run(s, 400_000);
    let kernel = kernel_of(&mut machine);
    assert_eq!(kernel.procs.pids(), vec![IDLE_PID]);
    assert_eq!(kernel.procs.current_pid(), Some(IDLE_PID));
}

// sbrk hands out the per-process heap window; the guest stores through
// the new Sv39 mapping and the console syscall reads it back out.
#[test]
fn sbrk_heap_store_and_write_back() {
    let mut a = Assembler::new(0);
    a.li(asm::A0, 16);
    a.li(asm::A7, nr::SBRK as i64);
    a.ecall();
    a.mv(asm::T0, asm::A0);
    a.li(asm::T1, b'Z' as i64);
    a.sb(asm::T0, asm::T1, 0);
    a.li(asm::A0, 1);
    a.mv(asm::A1, asm::T0);
    a.li(asm::A2, 1);
    a.li(asm::A7, nr::WRITE as i64);
    a.ecall();
    exit_sequence(&mut a);

    let s = setup(&[("shell", a.assemble())], 1_000_000);
    let mut machine = run(s, 100_000);

    let out = console(&machine);
    assert!(out.contains('Z'), "heap byte lost: {out}");
    let kernel = kernel_of(&mut machine);
    assert_eq!(kernel.procs.pids(), vec![IDLE_PID]);
    // Once the orphan sweep ran, the only pages still held are idle's
    // stack and the never-reclaimed page-table pages.
    let held = kernel.palloc.total_pages() - kernel.palloc.free_pages();
    assert!(held < 64, "heap or stack pages leaked: {held} held");
}

// A waiter with no children stays blocked forever.
#[test]
fn wait_with_no_children_blocks_caller() {
    let mut a = Assembler::new(0);
    a.li(asm::A7, nr::WAIT as i64);
    a.ecall();
    // never reached
    exit_sequence(&mut a);

    let s = setup(&[("shell", a.assemble())], 1_000_000);
    let mut machine = run(s, 100_000);

    let kernel = kernel_of(&mut machine);
    assert_eq!(kernel.procs.current_pid(), Some(IDLE_PID));
    assert_eq!(kernel.procs.blocked_list(), &[1]);
    assert_eq!(kernel.procs.get(1).unwrap().state, ProcState::Blocked);
}

// exec with an unknown name returns -1 and resumes past the ecall.
#[test]
fn exec_lookup_failure_returns_minus_one() {
    let msg = b"exec failed\n";
    let mut a = Assembler::new(0);
    let name = a.new_label();
    a.la(asm::A0, name);
    a.li(asm::A7, nr::EXEC as i64);
    a.ecall();
    // a0 == -1 means the lookup failed
    a.addi(asm::A0, asm::A0, 1);
    let skip = a.new_label();
    a.bne(asm::A0, asm::ZERO, skip);
    let msg_data = a.new_label();
    a.li(asm::A0, 1);
    a.la(asm::A1, msg_data);
    a.li(asm::A2, msg.len() as i64);
    a.li(asm::A7, nr::WRITE as i64);
    a.ecall();
    a.bind(skip);
    exit_sequence(&mut a);

    a.bind(name);
    a.bytes(b"no-such-program\0");
    a.bind(msg_data);
    a.bytes(msg);

    let s = setup(&[("shell", a.assemble())], 1_000_000);
    let machine = run(s, 100_000);
    assert!(console(&machine).contains("exec failed"));
}

// Programs can come off the disk: directory in sector 0, images after,
// completion interrupts claimed and completed through the PLIC.
#[test]
fn disk_backed_programs_boot() {
    let image = fs::build_disk_image(&[("shell", programs::hello())]);

    let _ = env_logger::builder().is_test(true).try_init();
    let mut bus = SystemBus::with_uart(RAM, UartDevice::buffered());
    bus.add_device(
        VIRTIO_MMIO_START,
        VIRTIO_BLK_SIZE,
        Box::new(VirtioBlkDevice::with_image(image)),
    );
    let mut hart = Hart::new(RAM_BASE);
    let mut kernel = Kernel::new(KernelConfig::for_ram_size(RAM as u64));
    kernel.boot(&mut hart, &mut bus, &[]).expect("boot failed");
    assert_eq!(kernel.fs.lookup("shell"), kernel.fs.programs().first().map(|p| p.entry));

    let s = Setup { bus, hart, kernel };
    let machine = run(s, 100_000);
    assert!(console(&machine).contains("hello from exec"));
}
