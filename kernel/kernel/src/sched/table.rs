//! The fixed task table and its scheduling policy.
//!
//! Pure bookkeeping: no locking, no interrupts, no per-CPU lookups.
//! The runtime glue in the parent module wraps this in a spin lock and
//! feeds it the CPU index and tick count, which keeps every policy
//! decision testable on the host.

use alloc::alloc::{Layout, alloc, dealloc};

use crate::config::{MAX_CPUS, MAX_TASKS, TASK_STACK_SIZE};

/// Task entry point. The argument is whatever was passed to `create`.
pub type TaskEntry = extern "C" fn(usize);

/// Lifecycle of one table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot is free.
    Unused,
    /// Runnable, waiting to be picked.
    Ready,
    /// Currently on a CPU.
    Running,
    /// Waiting for `wake_tick`.
    Sleeping,
    /// Finished; stack reclaimed at the next scheduler entry.
    Zombie,
}

/// One task table entry.
struct Task {
    state: TaskState,
    /// Saved stack pointer; points at a full saved frame (see
    /// [`build_initial_frame`]) whenever the task is not running.
    rsp: u64,
    wake_tick: u64,
    name: &'static str,
    entry: Option<TaskEntry>,
    arg: usize,
    stack: *mut u8,
    /// CPU index this task is pinned to, or -1 for any.
    cpu_affinity: i32,
    /// CPU index currently executing the task, or -1.
    running_cpu: i32,
    is_idle: bool,
}

impl Task {
    const fn unused() -> Self {
        Self {
            state: TaskState::Unused,
            rsp: 0,
            wake_tick: 0,
            name: "",
            entry: None,
            arg: 0,
            stack: core::ptr::null_mut(),
            cpu_affinity: -1,
            running_cpu: -1,
            is_idle: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Initial frame
// ---------------------------------------------------------------------------

/// Words in a saved frame: 15 general-purpose registers plus the
/// five-word `iretq` frame (RIP, CS, RFLAGS, RSP, SS). The layout is a
/// contract with the scheduler vector's naked stub
/// (`arch::x86_64::interrupts::sched_stub`); the two must match
/// bit-exactly so one restore path serves fresh and preempted tasks.
pub const FRAME_WORDS: usize = 20;

/// Index of RIP within the frame.
pub const FRAME_RIP: usize = 15;
/// Index of CS within the frame.
pub const FRAME_CS: usize = 16;
/// Index of RFLAGS within the frame.
pub const FRAME_RFLAGS: usize = 17;
/// Index of the restored RSP within the frame.
pub const FRAME_RSP: usize = 18;
/// Index of SS within the frame.
pub const FRAME_SS: usize = 19;

/// RFLAGS for a fresh task: interrupts enabled plus the always-one bit.
const INITIAL_RFLAGS: u64 = 0x202;

/// Hand-builds the saved frame a fresh task is resumed from.
///
/// Returns the `rsp` to store in the task: the first scheduler switch
/// into it pops fifteen zeroed registers and `iretq`s into
/// `trampoline` on its own stack with interrupts enabled.
fn build_initial_frame(stack: *mut u8, trampoline: u64, cs: u16, ss: u16) -> u64 {
    let top = (stack as u64 + TASK_STACK_SIZE as u64) & !0xF;
    let frame = (top - (FRAME_WORDS * 8) as u64) as *mut u64;
    // SAFETY: the frame lies inside the freshly allocated stack.
    unsafe {
        for i in 0..FRAME_RIP {
            frame.add(i).write(0);
        }
        frame.add(FRAME_RIP).write(trampoline);
        frame.add(FRAME_CS).write(u64::from(cs));
        frame.add(FRAME_RFLAGS).write(INITIAL_RFLAGS);
        frame.add(FRAME_RSP).write(top);
        frame.add(FRAME_SS).write(u64::from(ss));
    }
    frame as u64
}

fn stack_layout() -> Layout {
    // SAFETY: size and alignment are non-zero powers-of-two constants.
    unsafe { Layout::from_size_align_unchecked(TASK_STACK_SIZE, 16) }
}

// ---------------------------------------------------------------------------
// TaskTable
// ---------------------------------------------------------------------------

/// The fixed-size task table with per-CPU scheduling state.
pub struct TaskTable {
    tasks: [Task; MAX_TASKS],
    /// Index of the task running on each CPU, or -1.
    current: [i32; MAX_CPUS],
    /// Index of each CPU's idle task.
    idle: [i32; MAX_CPUS],
    /// Last slot each CPU picked; the scan resumes after it.
    last_pick: [i32; MAX_CPUS],
    cpu_count: usize,
    cs: u16,
    ss: u16,
    trampoline: u64,
}

// SAFETY: the raw stack pointers are owned by the table and only
// touched under the lock the parent module wraps it in.
unsafe impl Send for TaskTable {}

impl TaskTable {
    /// Creates an empty table.
    ///
    /// `cs`/`ss` are the kernel selectors baked into fresh frames;
    /// `trampoline` is the address every new task first returns into.
    pub fn new(cpu_count: usize, cs: u16, ss: u16, trampoline: u64) -> Self {
        Self {
            tasks: [const { Task::unused() }; MAX_TASKS],
            current: [-1; MAX_CPUS],
            idle: [-1; MAX_CPUS],
            last_pick: [-1; MAX_CPUS],
            cpu_count: cpu_count.min(MAX_CPUS),
            cs,
            ss,
            trampoline,
        }
    }

    /// Creates the per-CPU idle tasks. Call once before the first
    /// dispatch.
    pub fn create_idle_tasks(&mut self, idle_entry: TaskEntry) -> bool {
        for cpu in 0..self.cpu_count {
            let Some(idx) = self.create_pinned("idle", idle_entry, 0, cpu as i32) else {
                return false;
            };
            self.tasks[idx].is_idle = true;
            self.idle[cpu] = idx as i32;
        }
        true
    }

    /// Creates a task runnable on any CPU.
    pub fn create(&mut self, name: &'static str, entry: TaskEntry, arg: usize) -> Option<usize> {
        self.create_pinned(name, entry, arg, -1)
    }

    /// Creates a task pinned to `cpu` (-1 for any). Returns the slot
    /// index, or `None` when the table or the heap is exhausted.
    pub fn create_pinned(
        &mut self,
        name: &'static str,
        entry: TaskEntry,
        arg: usize,
        cpu: i32,
    ) -> Option<usize> {
        let idx = self
            .tasks
            .iter()
            .position(|t| t.state == TaskState::Unused)?;

        // SAFETY: stack_layout is valid and non-zero.
        let stack = unsafe { alloc(stack_layout()) };
        if stack.is_null() {
            return None;
        }

        let task = &mut self.tasks[idx];
        task.state = TaskState::Ready;
        task.name = name;
        task.entry = Some(entry);
        task.arg = arg;
        task.stack = stack;
        task.wake_tick = 0;
        task.cpu_affinity = cpu;
        task.running_cpu = -1;
        task.is_idle = false;
        task.rsp = build_initial_frame(stack, self.trampoline, self.cs, self.ss);
        Some(idx)
    }

    /// Marks `cpu`'s idle task as its current running task. Each CPU
    /// does this right before its first dispatch.
    pub fn adopt_idle(&mut self, cpu: usize) {
        let idx = self.idle[cpu];
        if idx >= 0 {
            self.current[cpu] = idx;
            self.tasks[idx as usize].state = TaskState::Running;
            self.tasks[idx as usize].running_cpu = cpu as i32;
        }
    }

    /// Wakes every sleeper whose deadline has passed. Runs on the
    /// timer tick.
    pub fn tick(&mut self, now: u64) {
        for task in &mut self.tasks {
            if task.state == TaskState::Sleeping && now >= task.wake_tick {
                task.state = TaskState::Ready;
            }
        }
    }

    /// Puts `cpu`'s current task to sleep until `now + ticks`. The
    /// caller must follow up with a yield.
    pub fn sleep_current(&mut self, cpu: usize, now: u64, ticks: u64) {
        let idx = self.current[cpu];
        if idx >= 0 {
            let task = &mut self.tasks[idx as usize];
            task.state = TaskState::Sleeping;
            task.wake_tick = now + ticks;
            task.running_cpu = -1;
        }
    }

    /// Marks `cpu`'s current task finished. The stack is reclaimed at
    /// the next scheduler entry; the caller yields and never returns.
    pub fn exit_current(&mut self, cpu: usize) {
        let idx = self.current[cpu];
        if idx >= 0 {
            let task = &mut self.tasks[idx as usize];
            task.state = TaskState::Zombie;
            task.running_cpu = -1;
        }
    }

    /// Entry point and argument of `cpu`'s current task (used by the
    /// trampoline).
    #[must_use]
    pub fn current_entry(&self, cpu: usize) -> Option<(TaskEntry, usize)> {
        let idx = self.current[cpu];
        if idx < 0 {
            return None;
        }
        let task = &self.tasks[idx as usize];
        task.entry.map(|e| (e, task.arg))
    }

    /// Name of `cpu`'s current task.
    #[must_use]
    pub fn current_name(&self, cpu: usize) -> &'static str {
        let idx = self.current[cpu];
        if idx < 0 {
            "none"
        } else {
            self.tasks[idx as usize].name
        }
    }

    /// Frees the stacks of finished tasks and recycles their slots.
    ///
    /// A zombie that is still some CPU's current task is mid-switch:
    /// the scheduler entry that will replace it is running on that very
    /// stack. It is skipped here and reclaimed at the following entry,
    /// once `current` has moved on.
    fn reap_zombies(&mut self) {
        for idx in 0..MAX_TASKS {
            if self.tasks[idx].state != TaskState::Zombie {
                continue;
            }
            if self.current.contains(&(idx as i32)) {
                continue;
            }
            let task = &mut self.tasks[idx];
            if !task.stack.is_null() {
                // SAFETY: the stack came from `alloc` with the same
                // layout, and nothing can be running on it anymore.
                unsafe { dealloc(task.stack, stack_layout()) };
                task.stack = core::ptr::null_mut();
            }
            task.state = TaskState::Unused;
            task.running_cpu = -1;
            task.entry = None;
        }
    }

    /// Round-robin pick for `cpu`: the first ready, unclaimed,
    /// affinity-compatible task after `last_pick`, preferring any
    /// non-idle task over idle ones.
    fn pick_next(&mut self, cpu: usize) -> Option<usize> {
        let start = (self.last_pick[cpu] + 1).rem_euclid(MAX_TASKS as i32) as usize;
        let mut idle_candidate = None;
        for n in 0..MAX_TASKS {
            let i = (start + n) % MAX_TASKS;
            let task = &self.tasks[i];
            if task.state != TaskState::Ready || task.running_cpu != -1 {
                continue;
            }
            if task.cpu_affinity >= 0 && task.cpu_affinity != cpu as i32 {
                continue;
            }
            if !task.is_idle {
                self.last_pick[cpu] = i as i32;
                return Some(i);
            }
            if idle_candidate.is_none() {
                idle_candidate = Some(i);
            }
        }
        if let Some(i) = idle_candidate {
            self.last_pick[cpu] = i as i32;
        }
        idle_candidate
    }

    /// The scheduler proper, called with the interrupted task's `rsp`.
    ///
    /// Saves `rsp` into the outgoing task, transitions it back to ready
    /// (unless it is sleeping or finished), picks the next task for
    /// `cpu`, and returns the stack pointer to resume from. When
    /// nothing else is runnable the interrupted frame is returned
    /// unchanged.
    pub fn schedule(&mut self, cpu: usize, rsp: u64) -> u64 {
        self.reap_zombies();

        let prev = self.current[cpu];
        if prev >= 0 {
            let task = &mut self.tasks[prev as usize];
            task.rsp = rsp;
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
                task.running_cpu = -1;
            }
        }

        let Some(next) = self.pick_next(cpu) else {
            // Nothing runnable here (the idle task may be mid-reap on
            // another CPU); keep running the interrupted frame.
            if prev >= 0 && self.tasks[prev as usize].state == TaskState::Ready {
                let task = &mut self.tasks[prev as usize];
                task.state = TaskState::Running;
                task.running_cpu = cpu as i32;
            }
            return rsp;
        };

        let task = &mut self.tasks[next];
        task.state = TaskState::Running;
        task.running_cpu = cpu as i32;
        self.current[cpu] = next as i32;
        let next_rsp = self.tasks[next].rsp;
        if next_rsp == 0 { rsp } else { next_rsp }
    }

    /// State of the slot at `idx` (diagnostics and tests).
    #[must_use]
    pub fn state_of(&self, idx: usize) -> TaskState {
        self.tasks[idx].state
    }

    /// Number of live (non-unused) slots.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.state != TaskState::Unused)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop_entry(_arg: usize) {}

    const TRAMPOLINE: u64 = 0xFFFF_8000_DEAD_0000;
    const CS: u16 = 0x28;
    const SS: u16 = 0x30;

    fn table(cpus: usize) -> TaskTable {
        let mut table = TaskTable::new(cpus, CS, SS, TRAMPOLINE);
        assert!(table.create_idle_tasks(noop_entry));
        for cpu in 0..cpus {
            table.adopt_idle(cpu);
        }
        table
    }

    #[test]
    fn initial_frame_matches_stub_contract() {
        let mut t = TaskTable::new(1, CS, SS, TRAMPOLINE);
        let idx = t.create("probe", noop_entry, 7).unwrap();
        let rsp = t.tasks[idx].rsp;
        let frame = rsp as *const u64;
        // SAFETY: the frame sits inside the task's live stack.
        unsafe {
            for i in 0..FRAME_RIP {
                assert_eq!(frame.add(i).read(), 0, "GPR slot {i} must be zero");
            }
            assert_eq!(frame.add(FRAME_RIP).read(), TRAMPOLINE);
            assert_eq!(frame.add(FRAME_CS).read(), u64::from(CS));
            assert_eq!(frame.add(FRAME_RFLAGS).read(), 0x202);
            let top = frame.add(FRAME_RSP).read();
            assert_eq!(top % 16, 0);
            assert_eq!(top - rsp, (FRAME_WORDS * 8) as u64);
            assert_eq!(frame.add(FRAME_SS).read(), u64::from(SS));
        }
    }

    #[test]
    fn first_schedule_prefers_new_task_over_idle() {
        let mut t = table(1);
        let a = t.create("a", noop_entry, 0).unwrap();
        let a_rsp = t.tasks[a].rsp;
        let picked = t.schedule(0, 0x1000);
        assert_eq!(picked, a_rsp);
        assert_eq!(t.state_of(a), TaskState::Running);
        assert_eq!(t.current_name(0), "a");
    }

    #[test]
    fn round_robin_alternates_between_ready_tasks() {
        let mut t = table(1);
        let a = t.create("a", noop_entry, 0).unwrap();
        let b = t.create("b", noop_entry, 0).unwrap();

        t.schedule(0, 0x1000);
        assert_eq!(t.state_of(a), TaskState::Running);
        t.schedule(0, 0x2000);
        assert_eq!(t.state_of(b), TaskState::Running);
        assert_eq!(t.state_of(a), TaskState::Ready);
        t.schedule(0, 0x3000);
        assert_eq!(t.state_of(a), TaskState::Running);
    }

    #[test]
    fn earlier_task_runs_before_later_created() {
        let mut t = table(1);
        let a = t.create("first", noop_entry, 0).unwrap();
        let _b = t.create("second", noop_entry, 0).unwrap();
        t.schedule(0, 0x1000);
        assert_eq!(t.state_of(a), TaskState::Running);
    }

    #[test]
    fn saved_rsp_round_trips_through_switch() {
        let mut t = table(1);
        let a = t.create("a", noop_entry, 0).unwrap();
        let _b = t.create("b", noop_entry, 0).unwrap();
        t.schedule(0, 0xAAA0); // idle's frame saved, a runs
        t.schedule(0, 0xBBB0); // a's frame saved, b runs
        assert_eq!(t.tasks[a].rsp, 0xBBB0);
        let resumed = t.schedule(0, 0xCCC0); // b's frame saved, a resumes
        assert_eq!(resumed, 0xBBB0, "a resumes from its saved frame");
    }

    #[test]
    fn sleeping_task_skipped_until_deadline() {
        let mut t = table(1);
        let a = t.create("a", noop_entry, 0).unwrap();
        t.schedule(0, 0x1000);
        t.sleep_current(0, 10, 5);
        t.schedule(0, 0x2000);
        assert_eq!(t.state_of(a), TaskState::Sleeping);

        t.tick(14);
        assert_eq!(t.state_of(a), TaskState::Sleeping);
        t.schedule(0, 0x3000);
        assert_ne!(t.state_of(a), TaskState::Running);

        t.tick(15);
        assert_eq!(t.state_of(a), TaskState::Ready);
        t.schedule(0, 0x4000);
        assert_eq!(t.state_of(a), TaskState::Running);
    }

    #[test]
    fn affinity_restricts_to_named_cpu() {
        let mut t = table(2);
        let pinned = t.create_pinned("pinned", noop_entry, 0, 1).unwrap();

        t.schedule(0, 0x1000);
        assert_ne!(t.state_of(pinned), TaskState::Running);

        t.schedule(1, 0x2000);
        assert_eq!(t.state_of(pinned), TaskState::Running);
        assert_eq!(t.current_name(1), "pinned");
    }

    #[test]
    fn busy_cpu_skips_idle_while_others_idle_on() {
        let mut t = table(2);
        let busy = t.create_pinned("busy", noop_entry, 0, 0).unwrap();

        // CPU 0 always picks the busy task over its idle.
        for pass in 0..3 {
            t.schedule(0, 0x1000 + pass);
            assert_eq!(t.current_name(0), "busy");
            assert_eq!(t.state_of(busy), TaskState::Running);
        }
        // CPU 1 keeps running its own idle, not starved.
        t.schedule(1, 0x2000);
        assert_eq!(t.current_name(1), "idle");
    }

    #[test]
    fn running_task_is_not_stolen_by_other_cpu() {
        let mut t = table(2);
        let a = t.create("a", noop_entry, 0).unwrap();
        t.schedule(0, 0x1000);
        assert_eq!(t.state_of(a), TaskState::Running);
        // CPU 1 must not pick a while it runs on CPU 0.
        t.schedule(1, 0x2000);
        assert_eq!(t.current_name(1), "idle");
    }

    #[test]
    fn zombie_slot_is_reaped_and_reusable() {
        let mut t = table(1);
        let a = t.create("a", noop_entry, 0).unwrap();
        t.schedule(0, 0x1000);
        t.exit_current(0);
        assert_eq!(t.state_of(a), TaskState::Zombie);

        // First entry switches away but must not free the stack the
        // switch itself is running on; the next entry reclaims it.
        t.schedule(0, 0x2000);
        assert_eq!(t.state_of(a), TaskState::Zombie);
        t.schedule(0, 0x3000);
        assert_eq!(t.state_of(a), TaskState::Unused);

        let b = t.create("b", noop_entry, 0).unwrap();
        assert_eq!(a, b, "freed slot is handed out again");
    }

    #[test]
    fn table_fills_up_and_recovers() {
        let mut t = table(1);
        let mut created = Vec::new();
        while let Some(idx) = t.create("filler", noop_entry, 0) {
            created.push(idx);
        }
        assert_eq!(created.len(), MAX_TASKS - 1); // idle holds one slot
        // Kill one and the table accepts again.
        t.tasks[created[0]].state = TaskState::Zombie;
        t.reap_zombies();
        assert!(t.create("late", noop_entry, 0).is_some());
    }

    #[test]
    fn zero_rsp_falls_back_to_interrupted_frame() {
        let mut t = table(1);
        let a = t.create("a", noop_entry, 0).unwrap();
        t.tasks[a].rsp = 0;
        assert_eq!(t.schedule(0, 0x1234), 0x1234);
    }
}
