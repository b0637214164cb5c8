//! SMP preemptive scheduler.
//!
//! Policy and bookkeeping live in the host-testable [`table`]; this
//! module adds the lock, the per-CPU entry points, and the pieces that
//! need the hardware: the yield interrupt, the task trampoline, and the
//! ISR entry called by the scheduler vector's naked stub.
//!
//! Preemption is cooperative-via-interrupt: the only context switch
//! point is vector 0xF0, raised either by `int` (yield, sleep) or by
//! the LAPIC timer. Inside the ISR the table lock is only ever
//! `try_lock`ed; on contention the interrupted task simply keeps
//! running until the next tick.

pub mod table;

pub use table::{TaskEntry, TaskState, TaskTable};

#[cfg(target_os = "none")]
pub use runtime::{Scheduler, sched_isr_entry};

#[cfg(target_os = "none")]
mod runtime {
    use core::sync::atomic::{AtomicBool, Ordering};

    use quasar_core::sync::SpinLock;

    use super::table::{TaskEntry, TaskTable};
    use crate::arch::x86_64::instructions;
    use crate::percpu;

    /// The lock-wrapped task table plus the dispatch-enable flag.
    pub struct Scheduler {
        table: SpinLock<TaskTable>,
        active: AtomicBool,
    }

    impl Scheduler {
        /// Builds the scheduler and its per-CPU idle tasks.
        pub fn new(cpu_count: usize) -> Self {
            let mut table = TaskTable::new(
                cpu_count,
                instructions::read_cs(),
                instructions::read_ss(),
                task_trampoline as usize as u64,
            );
            if !table.create_idle_tasks(idle_entry) {
                crate::kfatal!("sched: failed to allocate idle task stacks");
                instructions::halt_forever();
            }
            Self {
                table: SpinLock::new(table),
                active: AtomicBool::new(false),
            }
        }

        /// Spawns a task runnable on any CPU.
        pub fn spawn(&self, name: &'static str, entry: TaskEntry, arg: usize) -> Option<usize> {
            self.table.lock().create(name, entry, arg)
        }

        /// Spawns a task pinned to one CPU.
        pub fn spawn_pinned(
            &self,
            name: &'static str,
            entry: TaskEntry,
            arg: usize,
            cpu: i32,
        ) -> Option<usize> {
            self.table.lock().create_pinned(name, entry, arg, cpu)
        }

        /// Enters the scheduler on the bootstrap CPU. Never returns;
        /// the boot stack is abandoned at the first dispatch.
        pub fn start_bsp(&self) -> ! {
            self.start_cpu(0)
        }

        /// Enters the scheduler on an application CPU.
        pub fn start_ap(&self, cpu: usize) -> ! {
            self.start_cpu(cpu)
        }

        fn start_cpu(&self, cpu: usize) -> ! {
            self.table.lock().adopt_idle(cpu);
            self.active.store(true, Ordering::Release);
            instructions::yield_interrupt();
            // The first dispatch replaces this stack; nothing below
            // ever executes once switching works.
            loop {
                instructions::halt();
            }
        }

        /// Voluntarily gives up the CPU.
        pub fn yield_now(&self) {
            if self.active.load(Ordering::Acquire) {
                instructions::yield_interrupt();
            }
        }

        /// Sleeps the current task for at least `ticks` timer ticks.
        pub fn sleep(&self, ticks: u64) {
            if !self.active.load(Ordering::Acquire) {
                return;
            }
            {
                let mut table = self.table.lock();
                table.sleep_current(percpu::cpu_index(), crate::time::ticks(), ticks);
            }
            instructions::yield_interrupt();
        }

        /// Timer-tick hook: wakes due sleepers. Skipped entirely when
        /// the table lock is contended; the next tick catches up.
        pub fn on_tick(&self, now: u64) {
            if !self.active.load(Ordering::Acquire) {
                return;
            }
            if let Some(mut table) = self.table.try_lock() {
                table.tick(now);
            }
        }

        /// Name of the task running on this CPU.
        pub fn current_name(&self) -> &'static str {
            self.table.lock().current_name(percpu::cpu_index())
        }

        /// The 0xF0 service path: reschedule if the lock is free,
        /// otherwise keep the interrupted frame.
        fn schedule_isr(&self, rsp: u64) -> u64 {
            if !self.active.load(Ordering::Acquire) {
                return rsp;
            }
            match self.table.try_lock() {
                Some(mut table) => table.schedule(percpu::cpu_index(), rsp),
                None => rsp,
            }
        }
    }

    /// Called from the naked stub with the interrupted `rsp`; returns
    /// the `rsp` to resume. Must stay callable before the kernel value
    /// exists (early spurious vectors).
    pub extern "C" fn sched_isr_entry(rsp: u64) -> u64 {
        match crate::kernel::try_kernel() {
            Some(kernel) => kernel.sched.schedule_isr(rsp),
            None => rsp,
        }
    }

    /// Idle task body: halt until something happens.
    extern "C" fn idle_entry(_arg: usize) {
        loop {
            instructions::halt();
        }
    }

    /// First instruction of every new task.
    ///
    /// Runs on the task's own stack, entered via the frame
    /// [`super::table::FRAME_WORDS`] layout describes. Reloads the data
    /// segments, runs the task body, then retires the slot.
    extern "C" fn task_trampoline() -> ! {
        let ds = instructions::read_ss();
        // SAFETY: ds holds the selector this kernel already runs with.
        unsafe {
            core::arch::asm!(
                "mov ds, {0:x}",
                "mov es, {0:x}",
                in(reg) ds,
                options(nostack, preserves_flags)
            );
        }

        let kernel = crate::kernel::kernel();
        let entry = kernel
            .sched
            .table
            .lock()
            .current_entry(percpu::cpu_index());
        if let Some((entry, arg)) = entry {
            entry(arg);
        }

        kernel
            .sched
            .table
            .lock()
            .exit_current(percpu::cpu_index());
        instructions::yield_interrupt();
        // A zombie is never picked again; this only runs if dispatch
        // raced the exit, and the next tick reaps it.
        loop {
            instructions::halt();
        }
    }
}
