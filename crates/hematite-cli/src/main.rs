use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hematite_kernel::{fs, Kernel, KernelConfig};
use hematite_user::programs;
use hematite_vm::devices::block::{VirtioBlkDevice, VIRTIO_BLK_SIZE, VIRTIO_MMIO_START};
use hematite_vm::{ExitReason, Hart, Machine, MachineConfig, SystemBus, RAM_BASE};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the kernel and run the demo workload
    Run {
        /// Program disk image to attach (built with `mkdisk`)
        #[arg(long)]
        disk: Option<PathBuf>,

        /// RAM size in bytes
        #[arg(long, default_value_t = 128 * 1024 * 1024)]
        memory: usize,

        /// Stop after this many instructions
        #[arg(long, default_value_t = 5_000_000)]
        max_instructions: u64,

        /// mtime units between scheduler ticks
        #[arg(long, default_value_t = 1_000_000)]
        timer_interval: u64,

        /// Skip registering the built-in programs
        #[arg(long)]
        no_builtins: bool,
    },
    /// Write a program disk image holding the built-in programs
    Mkdisk {
        /// Output path
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Commands::Run {
            disk,
            memory,
            max_instructions,
            timer_interval,
            no_builtins,
        } => run(disk, memory, max_instructions, timer_interval, no_builtins),
        Commands::Mkdisk { output } => mkdisk(&output),
    }
}

fn run(
    disk: Option<PathBuf>,
    memory: usize,
    max_instructions: u64,
    timer_interval: u64,
    no_builtins: bool,
) -> Result<()> {
    let mut bus = SystemBus::new(memory);
    if let Some(path) = disk {
        let device = VirtioBlkDevice::open(path.to_str().context("non-utf8 disk path")?)
            .with_context(|| format!("opening disk image {:?}", path))?;
        bus.add_device(VIRTIO_MMIO_START, VIRTIO_BLK_SIZE, Box::new(device));
    }

    let mut hart = Hart::new(RAM_BASE);
    let mut config = KernelConfig::for_ram_size(memory as u64);
    config.timer_interval = timer_interval;
    let mut kernel = Kernel::new(config);

    let builtins = builtin_programs();
    let programs: Vec<(&str, &[u8])> = if no_builtins {
        Vec::new()
    } else {
        builtins.iter().map(|(n, c)| (*n, c.as_slice())).collect()
    };
    kernel
        .boot(&mut hart, &mut bus, &programs)
        .context("kernel boot failed")?;

    let mut machine = Machine::new(
        MachineConfig {
            memory_size: memory,
            instret_limit: Some(max_instructions),
        },
        hart,
        bus,
        Box::new(kernel),
    );

    match machine.run()? {
        ExitReason::Halt => println!("\n[machine stopped after {} instructions]", machine.instret),
        ExitReason::InstretLimit => println!(
            "\n[instruction budget ({}) exhausted]",
            machine.instret
        ),
    }
    Ok(())
}

fn mkdisk(output: &PathBuf) -> Result<()> {
    let builtins = builtin_programs();
    let image = fs::build_disk_image(&builtins);
    std::fs::write(output, &image)
        .with_context(|| format!("writing disk image {:?}", output))?;
    println!(
        "wrote {:?}: {} programs, {} bytes",
        output,
        builtins.len(),
        image.len()
    );
    Ok(())
}

fn builtin_programs() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("shell", programs::shell()),
        ("hello", programs::hello()),
        ("spin", programs::spin()),
    ]
}
