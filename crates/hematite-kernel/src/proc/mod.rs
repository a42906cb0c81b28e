//! Process subsystem: PCBs, the ready/blocked/zombie lists, the
//! round-robin scheduler and the UNIX-style lifecycle
//! (create / fork / exit / wait / kill / reap).
//!
//! Bookkeeping lives here; kernel stacks and user heap pages live in
//! guest memory. Every PCB sits on exactly one of: `current`, the ready
//! queue, the blocked list, the zombie list. The idle process (pid 0) is
//! the standing exception: it is `current` or nothing, and is never
//! enqueued.

pub mod pcb;

use crate::error::KernelError;
use crate::layout::{HEAP_USER_BASE, IDLE_ENTRY, PAGE_SIZE, PER_PROC_HEAP};
use crate::palloc::FrameAllocator;
use crate::vmm::{MapFlags, Vmm};
use hematite_vm::{Hart, Memory, PhysAddr, VirtAddr};
use log::{debug, info, warn};
use pcb::{truncate_name, Pcb, Pid, ProcState, RegState, IDLE_PID};
use std::collections::{BTreeMap, VecDeque};

/// Idle loop, pre-encoded: `csrrsi x0, mstatus, 8; wfi; j -8`.
/// Enables interrupts, parks, loops.
const IDLE_CODE: [u32; 3] = [0x3004_6073, 0x1050_0073, 0xff9f_f06f];

#[derive(Debug, PartialEq, Eq)]
pub enum KillResult {
    Killed,
    /// The caller asked to kill itself; it is now a zombie and the hart
    /// runs another task.
    KilledSelf,
    NotFound,
}

pub struct ProcManager {
    procs: BTreeMap<Pid, Pcb>,
    ready: VecDeque<Pid>,
    blocked: Vec<Pid>,
    zombies: Vec<Pid>,
    current: Option<Pid>,
    next_pid: Pid,
    /// Context of the boot hart, parked on the first-ever switch.
    boot_ctx: RegState,
}

impl ProcManager {
    pub fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
            ready: VecDeque::new(),
            blocked: Vec::new(),
            zombies: Vec::new(),
            current: None,
            next_pid: 1,
            boot_ctx: RegState::default(),
        }
    }

    /// Scheduler init: emit the idle loop into guest memory and create
    /// the idle PCB (pid 0). Idle is never enqueued; `schedule` reaches
    /// it only through its explicit fallback.
    pub fn init(
        &mut self,
        palloc: &mut FrameAllocator,
        memory: &mut dyn Memory,
    ) -> Result<(), KernelError> {
        if self.procs.contains_key(&IDLE_PID) {
            return Ok(());
        }
        info!("scheduler: init");

        for (i, word) in IDLE_CODE.iter().enumerate() {
            memory.write_word(PhysAddr::new(IDLE_ENTRY + i as u64 * 4), *word)?;
        }

        let stack = palloc.kalloc().ok_or(KernelError::OutOfMemory)?;
        let stacktop = stack.val() + PAGE_SIZE;
        self.procs.insert(
            IDLE_PID,
            Pcb {
                pid: IDLE_PID,
                ppid: 0,
                name: "IDLE".into(),
                state: ProcState::Ready,
                prior: 0,
                entrypoint: IDLE_ENTRY,
                regstat: RegState::initial(IDLE_ENTRY, stacktop),
                stacktop,
                brk_base: 0,
                brk_size: 0,
            },
        );
        info!("scheduler: idle process initialized");
        Ok(())
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current
    }

    pub fn current(&self) -> Option<&Pcb> {
        self.current.and_then(|pid| self.procs.get(&pid))
    }

    pub fn current_mut(&mut self) -> Option<&mut Pcb> {
        let pid = self.current?;
        self.procs.get_mut(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.procs.get(&pid)
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.procs.keys().copied().collect()
    }

    pub fn ready_queue(&self) -> &VecDeque<Pid> {
        &self.ready
    }

    pub fn blocked_list(&self) -> &[Pid] {
        &self.blocked
    }

    pub fn zombie_list(&self) -> &[Pid] {
        &self.zombies
    }

    pub fn next_pid_value(&self) -> Pid {
        self.next_pid
    }

    /// The boot hart's context, parked on the first-ever switch.
    pub fn boot_context(&self) -> &RegState {
        &self.boot_ctx
    }

    fn state(&self, pid: Pid) -> Option<ProcState> {
        self.procs.get(&pid).map(|p| p.state)
    }

    fn set_state(&mut self, pid: Pid, state: ProcState) {
        if let Some(pcb) = self.procs.get_mut(&pid) {
            pcb.state = state;
        }
    }

    /// Refresh the current process's saved context from the live trap
    /// frame, so anything that copies it (fork, a context switch) sees
    /// the state at trap time rather than a stale snapshot.
    pub fn update_current_regstat(&mut self, frame: &[u64; 12], sepc: u64, sp: u64, mstatus: u64) {
        if let Some(pcb) = self.current_mut() {
            let rs = &mut pcb.regstat;
            rs.x1 = frame[0];
            rs.x5 = frame[1];
            rs.x6 = frame[2];
            rs.x7 = frame[3];
            rs.x10 = frame[4];
            rs.x11 = frame[5];
            rs.x12 = frame[6];
            rs.x13 = frame[7];
            rs.x14 = frame[8];
            rs.x15 = frame[9];
            rs.x16 = frame[10];
            rs.x17 = frame[11];
            rs.sepc = sepc;
            rs.sp = sp;
            rs.mstatus = mstatus;
        }
    }

    /// Create a process and enqueue it. The new task enters `entrypoint`
    /// with a fresh kernel stack on its first scheduling.
    pub fn create(
        &mut self,
        palloc: &mut FrameAllocator,
        name: &str,
        entrypoint: u64,
        prior: i32,
    ) -> Result<Pid, KernelError> {
        let pid = self.next_pid;
        self.next_pid += 1;

        let stack = palloc.kalloc().ok_or(KernelError::OutOfMemory)?;
        let stacktop = stack.val() + PAGE_SIZE;

        self.procs.insert(
            pid,
            Pcb {
                pid,
                ppid: 0,
                name: truncate_name(name),
                state: ProcState::Ready,
                prior,
                entrypoint,
                regstat: RegState::initial(entrypoint, stacktop),
                stacktop,
                brk_base: 0,
                brk_size: 0,
            },
        );
        self.ready.push_back(pid);
        debug!("proc: created pid={} name={:?} entry={:#x}", pid, name, entrypoint);
        Ok(pid)
    }

    /// Fork the current process: duplicate the PCB, byte-copy the kernel
    /// stack (preserving the stack-pointer offset), deep-copy the user
    /// heap into the child's own per-pid window. The child resumes past
    /// the `ecall` with `a0 = 0`.
    pub fn fork(
        &mut self,
        hart: &mut Hart,
        palloc: &mut FrameAllocator,
        vmm: &mut Vmm,
        memory: &mut dyn Memory,
        mepc: u64,
    ) -> Result<Pid, KernelError> {
        hart.intr_off();
        let result = self.fork_inner(palloc, vmm, memory, mepc);
        hart.intr_on();
        result
    }

    fn fork_inner(
        &mut self,
        palloc: &mut FrameAllocator,
        vmm: &mut Vmm,
        memory: &mut dyn Memory,
        mepc: u64,
    ) -> Result<Pid, KernelError> {
        let parent_pid = self.current.ok_or(KernelError::NoCurrentProcess)?;
        let parent = &self.procs[&parent_pid];
        let parent_name = parent.name.clone();
        let parent_prior = parent.prior;
        let parent_entry = parent.entrypoint;
        let parent_regstat = parent.regstat;
        let parent_stacktop = parent.stacktop;
        let parent_brk_base = parent.brk_base;
        let parent_brk_size = parent.brk_size;

        let child_pid = self.next_pid;
        self.next_pid += 1;

        let stack = palloc.kalloc().ok_or(KernelError::OutOfMemory)?;
        let stacktop = stack.val() + PAGE_SIZE;

        // Whole-page stack copy, child sp at the same offset from the top
        let mut page = vec![0u8; PAGE_SIZE as usize];
        let copy = memory
            .read_bytes(PhysAddr::new(parent_stacktop - PAGE_SIZE), &mut page)
            .and_then(|_| memory.write_bytes(stack, &page));
        if let Err(e) = copy {
            palloc.kfree(stack);
            return Err(e.into());
        }

        let mut regstat = parent_regstat;
        regstat.sp = stacktop - (parent_stacktop - parent_regstat.sp);
        regstat.x10 = 0; // fork returns 0 in the child
        regstat.sepc = mepc + 4; // resume past the ecall

        let mut child = Pcb {
            pid: child_pid,
            ppid: parent_pid,
            name: parent_name,
            state: ProcState::Ready,
            prior: parent_prior,
            entrypoint: parent_entry,
            regstat,
            stacktop,
            brk_base: 0,
            brk_size: 0,
        };

        // Deep-copy the user heap into the child's own window
        if parent_brk_size > 0 {
            child.brk_base = HEAP_USER_BASE + child_pid as u64 * PER_PROC_HEAP;
            child.brk_size = parent_brk_size;

            let pages = parent_brk_size.div_ceil(PAGE_SIZE);
            for i in 0..pages {
                let child_va = VirtAddr::new(child.brk_base + i * PAGE_SIZE);
                let parent_va = VirtAddr::new(parent_brk_base + i * PAGE_SIZE);

                let copied = vmm
                    .map_page(palloc, memory, child_va, MapFlags::RW | MapFlags::USER)
                    .map_err(KernelError::from)
                    .and_then(|_| copy_guest_page(vmm, memory, parent_va, child_va));

                if let Err(e) = copied {
                    // Roll back every page already mapped for this child
                    for j in 0..i {
                        let rollback = VirtAddr::new(child.brk_base + j * PAGE_SIZE);
                        if vmm.unmap(palloc, memory, rollback, true).is_err() {
                            warn!("fork: rollback unmap failed at {:#x}", rollback.val());
                        }
                    }
                    palloc.kfree(stack);
                    return Err(e);
                }
            }
        }

        self.procs.insert(child_pid, child);
        self.ready.push_back(child_pid);
        debug!("proc: forked pid={} from pid={}", child_pid, parent_pid);
        Ok(child_pid)
    }

    /// Terminate the current process: move it to the zombie list, wake a
    /// parent blocked in `wait`, and schedule away. The caller's task
    /// never runs again.
    pub fn exit_current(
        &mut self,
        hart: &mut Hart,
        palloc: &mut FrameAllocator,
        vmm: &mut Vmm,
        memory: &mut dyn Memory,
    ) {
        hart.intr_off();
        let Some(cur) = self.current else {
            hart.intr_on();
            return;
        };

        self.set_state(cur, ProcState::Terminated);
        self.zombies.push(cur);
        debug!("proc: process {} exited, added to zombie list", cur);

        // Wake the parent if it is blocked waiting
        let ppid = self.procs[&cur].ppid;
        if ppid != 0 {
            if let Some(pos) = self.blocked.iter().position(|&p| p == ppid) {
                self.blocked.remove(pos);
                self.set_state(ppid, ProcState::Ready);
                self.ready.push_back(ppid);
            }
        }

        self.schedule(hart, palloc, vmm, memory);
    }

    /// One scan of the zombie list for a child of the current process.
    /// Reaps and returns its pid, freeing stack, heap pages and PCB; the
    /// caller blocks and retries when there is nothing to reap yet.
    pub fn reap_child(
        &mut self,
        hart: &mut Hart,
        palloc: &mut FrameAllocator,
        vmm: &mut Vmm,
        memory: &mut dyn Memory,
    ) -> Option<Pid> {
        hart.intr_off();
        let Some(me) = self.current else {
            hart.intr_on();
            return None;
        };

        let found = self
            .zombies
            .iter()
            .position(|&z| self.procs[&z].ppid == me);
        let Some(pos) = found else {
            hart.intr_on();
            return None;
        };

        let child = self.zombies.remove(pos);
        let pcb = self.procs.remove(&child).unwrap();
        debug!("proc: reaping child pid={}", child);
        Self::release(pcb, palloc, vmm, memory);

        // Tail reuse: give back the last pid in the sequence
        if child == self.next_pid - 1 && self.next_pid > 1 {
            self.next_pid -= 1;
        }

        hart.intr_on();
        Some(child)
    }

    /// Block the current process on the blocked list and schedule away.
    pub fn block_current(
        &mut self,
        hart: &mut Hart,
        palloc: &mut FrameAllocator,
        vmm: &mut Vmm,
        memory: &mut dyn Memory,
    ) {
        hart.intr_off();
        let Some(cur) = self.current else {
            hart.intr_on();
            return;
        };
        self.set_state(cur, ProcState::Blocked);
        self.blocked.push(cur);
        self.schedule(hart, palloc, vmm, memory);
    }

    /// Park the current process indefinitely (used by background tasks).
    /// A no-op for idle.
    pub fn suspend_current(
        &mut self,
        hart: &mut Hart,
        palloc: &mut FrameAllocator,
        vmm: &mut Vmm,
        memory: &mut dyn Memory,
    ) {
        hart.intr_off();
        match self.current {
            None | Some(IDLE_PID) => {
                hart.intr_on();
            }
            Some(_) => self.block_current(hart, palloc, vmm, memory),
        }
    }

    /// Hard-kill by pid: no zombie, resources freed immediately. Refuses
    /// idle and negative pids; killing the caller degenerates to exit.
    pub fn kill(
        &mut self,
        hart: &mut Hart,
        palloc: &mut FrameAllocator,
        vmm: &mut Vmm,
        memory: &mut dyn Memory,
        pid: Pid,
    ) -> KillResult {
        hart.intr_off();

        if pid < 0 || pid == IDLE_PID {
            hart.intr_on();
            return KillResult::NotFound;
        }

        if self.current == Some(pid) {
            hart.intr_on();
            self.exit_current(hart, palloc, vmm, memory);
            return KillResult::KilledSelf;
        }

        // ready queue, blocked list, zombie list, in that order
        if let Some(pos) = self.ready.iter().position(|&p| p == pid) {
            self.ready.remove(pos);
        } else if let Some(pos) = self.blocked.iter().position(|&p| p == pid) {
            self.blocked.remove(pos);
        } else if let Some(pos) = self.zombies.iter().position(|&p| p == pid) {
            self.zombies.remove(pos);
        } else {
            hart.intr_on();
            return KillResult::NotFound;
        }

        let pcb = self.procs.remove(&pid).unwrap();
        debug!("proc: killed pid={}", pid);
        Self::release(pcb, palloc, vmm, memory);
        hart.intr_on();
        KillResult::Killed
    }

    /// Reap zombies nobody will wait for (ppid 0). Called from `schedule`
    /// so orphans disappear at the next convenient point.
    pub fn zombies_free(
        &mut self,
        palloc: &mut FrameAllocator,
        vmm: &mut Vmm,
        memory: &mut dyn Memory,
    ) {
        let mut i = 0;
        while i < self.zombies.len() {
            let pid = self.zombies[i];
            if self.procs[&pid].ppid != 0 {
                i += 1;
                continue;
            }
            self.zombies.remove(i);
            let pcb = self.procs.remove(&pid).unwrap();
            debug!("proc: reaping orphan pid={}", pid);
            Self::release(pcb, palloc, vmm, memory);
            if pid == self.next_pid - 1 && self.next_pid > 1 {
                self.next_pid -= 1;
            }
        }
    }

    /// Shutdown path: free every non-idle, non-current process from all
    /// three lists. Caller has interrupts off and never schedules again.
    pub fn shutdown_all(
        &mut self,
        palloc: &mut FrameAllocator,
        vmm: &mut Vmm,
        memory: &mut dyn Memory,
    ) {
        let victims: Vec<Pid> = self
            .ready
            .drain(..)
            .chain(self.blocked.drain(..))
            .chain(self.zombies.drain(..))
            .filter(|&p| p != IDLE_PID && Some(p) != self.current)
            .collect();
        for pid in victims {
            if let Some(pcb) = self.procs.remove(&pid) {
                Self::release(pcb, palloc, vmm, memory);
            }
        }
    }

    /// Round-robin scheduler, preemptive at the timer tick.
    ///
    /// Picks the front of the ready queue; with nothing queued the
    /// current task keeps running if it still can, otherwise idle takes
    /// over. Switching loads the next task's saved context into the hart.
    pub fn schedule(
        &mut self,
        hart: &mut Hart,
        palloc: &mut FrameAllocator,
        vmm: &mut Vmm,
        memory: &mut dyn Memory,
    ) {
        hart.intr_off();

        let next = match self.ready.pop_front() {
            Some(pid) => pid,
            None => match self.current {
                Some(cur)
                    if cur != IDLE_PID && self.state(cur) == Some(ProcState::Running) =>
                {
                    cur
                }
                _ => IDLE_PID,
            },
        };

        if !self.procs.contains_key(&next) {
            // scheduler not initialized yet; nothing to run
            hart.intr_on();
            return;
        }

        // Same task, still running: no switch, just sweep orphans.
        if Some(next) == self.current && self.state(next) == Some(ProcState::Running) {
            self.zombies_free(palloc, vmm, memory);
            hart.intr_on();
            return;
        }

        let Some(old) = self.current else {
            // First-ever switch: park the boot context.
            self.boot_ctx = RegState::capture_from(hart);
            self.set_state(next, ProcState::Running);
            self.current = Some(next);
            self.procs[&next].regstat.restore_to(hart);
            hart.intr_on();
            return;
        };

        // A preempted runner goes back to the queue; idle never does.
        // A terminated old task already sits on the zombie list.
        if self.state(old) == Some(ProcState::Running) {
            self.set_state(old, ProcState::Ready);
            if old != IDLE_PID {
                self.ready.push_back(old);
            }
        }

        self.set_state(next, ProcState::Running);
        self.current = Some(next);
        self.procs[&next].regstat.restore_to(hart);

        self.zombies_free(palloc, vmm, memory);
        hart.intr_on();
    }

    /// Process listing via the logger (the `ps` syscall).
    pub fn dump(&self) {
        info!("==== process list ====");
        if let Some(cur) = self.current() {
            info!(
                "current pid={} state={:?} name={}",
                cur.pid, cur.state, cur.name
            );
        }
        if let Some(idle) = self.procs.get(&IDLE_PID) {
            if self.current != Some(IDLE_PID) {
                info!(
                    "idle    pid={} state={:?} name={}",
                    idle.pid, idle.state, idle.name
                );
            }
        }
        for &pid in &self.ready {
            let p = &self.procs[&pid];
            info!("ready   pid={} state={:?} name={}", p.pid, p.state, p.name);
        }
        for &pid in &self.blocked {
            let p = &self.procs[&pid];
            info!("blocked pid={} state={:?} name={}", p.pid, p.state, p.name);
        }
        for &pid in &self.zombies {
            let p = &self.procs[&pid];
            info!("zombie  pid={} state={:?} name={}", p.pid, p.state, p.name);
        }
    }

    /// Free a PCB's resources: kernel stack, user heap pages, then the
    /// PCB itself. Never called on the running process.
    fn release(
        pcb: Pcb,
        palloc: &mut FrameAllocator,
        vmm: &mut Vmm,
        memory: &mut dyn Memory,
    ) {
        debug!("proc: cleanup pid={}: free stack", pcb.pid);
        palloc.kfree(PhysAddr::new(pcb.stack_base()));

        if pcb.brk_base != 0 && pcb.brk_size > 0 {
            debug!(
                "proc: cleanup pid={}: free heap (size={})",
                pcb.pid, pcb.brk_size
            );
            for i in 0..pcb.heap_pages() {
                let va = VirtAddr::new(pcb.brk_base + i * PAGE_SIZE);
                if vmm.unmap(palloc, memory, va, true).is_err() {
                    warn!(
                        "proc: heap unmap failed for pid {} at {:#x}",
                        pcb.pid,
                        va.val()
                    );
                }
            }
        }
        debug!("proc: cleanup pid={}: free PCB", pcb.pid);
    }
}

impl Default for ProcManager {
    fn default() -> Self {
        Self::new()
    }
}

fn copy_guest_page(
    vmm: &Vmm,
    memory: &mut dyn Memory,
    from_va: VirtAddr,
    to_va: VirtAddr,
) -> Result<(), KernelError> {
    let from = vmm
        .translate(memory, from_va)
        .ok_or(crate::error::VmmError::NotMapped(from_va.val()))?;
    let to = vmm
        .translate(memory, to_va)
        .ok_or(crate::error::VmmError::NotMapped(to_va.val()))?;
    let mut page = vec![0u8; PAGE_SIZE as usize];
    memory.read_bytes(from, &mut page)?;
    memory.write_bytes(to, &page)?;
    Ok(())
}
