//! Process Table & Scheduler
//!
//! A fixed-capacity pool of process slots scheduled round-robin from the
//! timer tick. Each process owns an address space (top-level table
//! copied from the kernel's), a one-frame kernel stack, and a saved
//! register frame that lives at the top of that stack.
//!
//! `schedule` is handed the frame stacked by the IRQ vector and returns
//! the frame to restore; returning a different process's frame is the
//! entire context-switch mechanism.

pub mod loader;

use lumen_arch::IrqSpinMutex;
use lumen_arch::exceptions::TrapFrame;
use lumen_arch::mmu;
use lumen_common::{PAGE_SIZE, PhysAddr, VirtAddr};

use crate::memory::vm::AddressSpace;
use crate::memory::zones;

/// Process pool capacity.
pub const MAX_PROCESSES: usize = 16;

const NAME_CAP: usize = 32;

/// Process lifecycle states. `Exited` slots are never scheduled again;
/// their resources are not reclaimed in the current kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Slot reserved, image not yet loaded.
    Created,
    /// Ready to run.
    Runnable,
    /// Currently on the hart.
    Running,
    /// Called exit; parked forever.
    Exited(i32),
}

impl ProcState {
    /// Whether the scheduler may select this process.
    #[must_use]
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Runnable | Self::Running)
    }
}

/// One process slot.
pub struct Process {
    pid: u32,
    name: [u8; NAME_CAP],
    name_len: usize,
    space: AddressSpace,
    /// Base of the one-frame kernel stack.
    kernel_stack: PhysAddr,
    /// Saved register frame; always inside the kernel stack.
    frame: u64,
    entry: VirtAddr,
    user_stack: VirtAddr,
    state: ProcState,
}

impl Process {
    /// One-based process identifier, stable for the process lifetime.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Process name.
    #[must_use]
    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("?")
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ProcState {
        self.state
    }

    /// The address space.
    pub fn space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    /// Top of the kernel stack (exclusive).
    #[must_use]
    fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack.as_u64() + PAGE_SIZE as u64
    }

    /// The saved register frame.
    ///
    /// # Safety
    ///
    /// The frame is only valid while the process is not running, or from
    /// the exception path that owns it.
    unsafe fn frame_mut(&mut self) -> &mut TrapFrame {
        // SAFETY: frame points into this process's kernel stack
        unsafe { &mut *(self.frame as *mut TrapFrame) }
    }

    /// Record the loaded image's entry and stack, initialize the saved
    /// frame for first entry to EL0 (interrupts unmasked), and mark the
    /// process runnable.
    pub fn finish_load(&mut self, entry: VirtAddr, user_stack: VirtAddr) {
        self.entry = entry;
        self.user_stack = user_stack;
        // SAFETY: the process is not running; the frame is ours
        let frame = unsafe { self.frame_mut() };
        *frame = TrapFrame::zeroed();
        frame.elr = entry.as_u64();
        frame.sp = user_stack.as_u64();
        frame.spsr = 0;
        self.state = ProcState::Runnable;
    }

    /// Give up on a slot whose image failed to load; the scheduler will
    /// never select it.
    pub fn abandon(&mut self) {
        self.state = ProcState::Exited(-1);
    }
}

/// The process pool: a populated prefix of fixed slots.
pub struct ProcessTable {
    slots: [Option<Process>; MAX_PROCESSES],
    count: usize,
    current: Option<usize>,
}

impl ProcessTable {
    const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PROCESSES],
            count: 0,
            current: None,
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut Process {
        self.slots[index].as_mut().expect("populated prefix hole")
    }
}

static TABLE: IrqSpinMutex<ProcessTable> = IrqSpinMutex::new(ProcessTable::new());

/// Round-robin selection: the first schedulable slot after `current`,
/// wrapping, including `current` itself as the last resort.
#[must_use]
fn next_runnable(states: &[ProcState], current: usize) -> Option<usize> {
    let count = states.len();
    if count == 0 {
        return None;
    }
    for step in 1..=count {
        let idx = (current + step) % count;
        if states[idx].is_schedulable() {
            return Some(idx);
        }
    }
    None
}

/// Reserve a slot and build the process skeleton: address space with the
/// kernel half copied in, a kernel stack frame, and a zeroed saved frame
/// at the top of that stack.
///
/// Returns the new pid, or `None` if the pool or memory is exhausted.
#[must_use]
pub fn create(name: &str) -> Option<u32> {
    let mut table = TABLE.lock();
    if table.count >= MAX_PROCESSES {
        log::error!("task: process pool full");
        return None;
    }

    let space = AddressSpace::new()?;
    let kernel_stack = match zones::alloc_frame() {
        Some(frame) => frame,
        None => {
            space.destroy();
            return None;
        }
    };

    let index = table.count;
    let pid = (index + 1) as u32;
    let frame = kernel_stack.as_u64() + PAGE_SIZE as u64 - core::mem::size_of::<TrapFrame>() as u64;

    let mut name_buf = [0u8; NAME_CAP];
    let name_len = name.len().min(NAME_CAP);
    name_buf[..name_len].copy_from_slice(&name.as_bytes()[..name_len]);

    table.slots[index] = Some(Process {
        pid,
        name: name_buf,
        name_len,
        space,
        kernel_stack,
        frame,
        entry: VirtAddr::new(0),
        user_stack: VirtAddr::new(0),
        state: ProcState::Created,
    });
    table.count = index + 1;

    log::info!("task: created process {} '{}'", pid, name);
    Some(pid)
}

/// Run `f` with mutable access to the process with the given pid.
pub fn with_process<R>(pid: u32, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let mut table = TABLE.lock();
    let index = pid.checked_sub(1)? as usize;
    if index >= table.count {
        return None;
    }
    Some(f(table.slot_mut(index)))
}

/// Pid of the process currently on the hart, if any.
#[must_use]
pub fn current_pid() -> Option<u32> {
    let mut table = TABLE.lock();
    let index = table.current?;
    Some(table.slot_mut(index).pid())
}

/// Mark the current process exited. The caller must not return to user
/// mode afterwards; the next tick schedules away permanently.
pub fn exit_current(status: i32) {
    let mut table = TABLE.lock();
    if let Some(index) = table.current {
        let proc = table.slot_mut(index);
        log::info!("task: process {} exited with status {}", proc.pid(), status);
        proc.state = ProcState::Exited(status);
    }
}

/// The scheduler, invoked from the timer tick with interrupts masked.
///
/// 1. record the interrupted frame as the current process's saved frame
/// 2. advance round-robin to the next schedulable slot
/// 3. install its translation table and invalidate the TLB
/// 4. return its saved frame for the vector epilogue to restore
pub fn schedule(frame: *mut TrapFrame) -> *mut TrapFrame {
    let mut table = TABLE.lock();
    if table.count == 0 {
        return frame;
    }

    let current = match table.current {
        Some(index) => {
            let proc = table.slot_mut(index);
            proc.frame = frame as u64;
            if proc.state == ProcState::Running {
                proc.state = ProcState::Runnable;
            }
            index
        }
        // Boot context: the idle loop's frame is not a process; it is
        // abandoned once the first process is selected.
        None => table.count - 1,
    };

    let mut states = [ProcState::Created; MAX_PROCESSES];
    for (i, slot) in table.slots[..table.count].iter().enumerate() {
        states[i] = slot.as_ref().map_or(ProcState::Created, |p| p.state);
    }

    let Some(next) = next_runnable(&states[..table.count], current) else {
        // Nothing runnable: resume whatever was interrupted.
        return frame;
    };

    table.current = Some(next);
    let proc = table.slot_mut(next);
    proc.state = ProcState::Running;

    mmu::set_ttbr0(proc.space.root().as_u64());
    mmu::invalidate_tlb_all();

    proc.frame as *mut TrapFrame
}

/// Install the first process and drop to EL0. Does not return.
///
/// # Panics
///
/// Panics if the pid does not name a runnable process.
pub fn start_user_process(pid: u32) -> ! {
    let (root, entry, user_stack, kernel_stack_top) = {
        let mut table = TABLE.lock();
        let index = (pid - 1) as usize;
        assert!(index < table.count, "start of unknown pid {pid}");
        table.current = Some(index);
        let proc = table.slot_mut(index);
        assert!(proc.state == ProcState::Runnable, "start of unloaded pid {pid}");
        proc.state = ProcState::Running;
        (
            proc.space.root().as_u64(),
            proc.entry.as_u64(),
            proc.user_stack.as_u64(),
            proc.kernel_stack_top(),
        )
    };

    log::info!(
        "task: entering user process {} at {:#x} (sp {:#x})",
        pid,
        entry,
        user_stack
    );

    mmu::set_ttbr0(root);
    mmu::invalidate_tlb_all();

    // SAFETY: The loader established a valid user context for this pid.
    unsafe { enter_user(entry, user_stack, kernel_stack_top) }
}

/// Load ELR/SP_EL0/SPSR, point SP at the process kernel stack, clear the
/// general registers, and take the exception return to EL0.
///
/// # Safety
///
/// All three values must form a valid EL0 execution context.
#[cfg(target_arch = "aarch64")]
unsafe fn enter_user(entry: u64, user_sp: u64, kernel_sp: u64) -> ! {
    // SAFETY: Caller contract; this diverges via eret.
    unsafe {
        core::arch::asm!(
            "msr elr_el1, {entry}",
            "msr sp_el0, {usp}",
            "msr spsr_el1, xzr",
            "mov sp, {ksp}",
            "mov x0, #0",
            "mov x1, #0",
            "mov x2, #0",
            "mov x3, #0",
            "mov x4, #0",
            "mov x5, #0",
            "mov x6, #0",
            "mov x7, #0",
            "mov x8, #0",
            "mov x9, #0",
            "mov x10, #0",
            "mov x11, #0",
            "mov x12, #0",
            "mov x13, #0",
            "mov x14, #0",
            "mov x15, #0",
            "mov x16, #0",
            "mov x17, #0",
            "mov x18, #0",
            "mov x19, #0",
            "mov x20, #0",
            "mov x21, #0",
            "mov x22, #0",
            "mov x23, #0",
            "mov x24, #0",
            "mov x25, #0",
            "mov x26, #0",
            "mov x27, #0",
            "mov x28, #0",
            "mov x29, #0",
            "mov x30, #0",
            "eret",
            entry = in(reg) entry,
            usp = in(reg) user_sp,
            ksp = in(reg) kernel_sp,
            options(noreturn)
        );
    }
}

#[cfg(not(target_arch = "aarch64"))]
unsafe fn enter_user(_entry: u64, _user_sp: u64, _kernel_sp: u64) -> ! {
    unreachable!("user entry is aarch64-only");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_cycles_in_order() {
        let states = [ProcState::Runnable; 3];
        assert_eq!(next_runnable(&states, 0), Some(1));
        assert_eq!(next_runnable(&states, 1), Some(2));
        assert_eq!(next_runnable(&states, 2), Some(0));
    }

    #[test]
    fn test_exited_slots_are_skipped() {
        let states = [
            ProcState::Runnable,
            ProcState::Exited(0),
            ProcState::Runnable,
        ];
        assert_eq!(next_runnable(&states, 0), Some(2));
        assert_eq!(next_runnable(&states, 2), Some(0));
    }

    #[test]
    fn test_created_slots_are_not_scheduled() {
        let states = [ProcState::Running, ProcState::Created];
        assert_eq!(next_runnable(&states, 0), Some(0));
    }

    #[test]
    fn test_no_runnable_means_none() {
        let states = [ProcState::Exited(-1), ProcState::Exited(0)];
        assert_eq!(next_runnable(&states, 0), None);
        assert_eq!(next_runnable(&[], 0), None);
    }

    #[test]
    fn test_fair_share_over_full_cycles() {
        // Property: over N*k ticks, each of N runnable processes is
        // selected exactly k times.
        let states = [ProcState::Runnable; 5];
        let mut counts = [0usize; 5];
        let mut current = 0;
        for _ in 0..5 * 40 {
            let next = next_runnable(&states, current).unwrap();
            counts[next] += 1;
            current = next;
        }
        assert_eq!(counts, [40; 5]);
    }
}
