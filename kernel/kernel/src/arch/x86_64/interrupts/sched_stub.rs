//! The naked scheduler vector (0xF0) entry.
//!
//! Stack layout contract, shared bit-for-bit with
//! [`crate::sched::build_initial_frame`] — the same restore path must
//! handle both a preempted task and one that has never run:
//!
//! ```text
//! rsp + 0x00  r15            ┐
//! rsp + 0x08  r14            │ 15 general-purpose registers
//! ...                        │ pushed by this stub
//! rsp + 0x68  rbx            │
//! rsp + 0x70  rax            ┘
//! rsp + 0x78  RIP            ┐
//! rsp + 0x80  CS             │ interrupt frame pushed by the CPU
//! rsp + 0x88  RFLAGS         │ (and rebuilt by hand for fresh tasks)
//! rsp + 0x90  RSP            │
//! rsp + 0x98  SS             ┘
//! ```
//!
//! The scheduler receives the post-push `rsp`, stores it into the
//! outgoing task, and returns the incoming task's saved `rsp`. Before
//! adopting the returned frame the stub sanity-checks its CS (non-null
//! ring 0), the always-one RFLAGS bit, and that RIP is canonical; on
//! any mismatch it falls back to the interrupted stack, so a corrupt
//! table entry degrades into "no switch" instead of a wild `iretq`.

/// Byte offset of RIP in the saved frame.
pub const FRAME_RIP: usize = 0x78;
/// Byte offset of CS in the saved frame.
pub const FRAME_CS: usize = 0x80;
/// Byte offset of RFLAGS in the saved frame.
pub const FRAME_RFLAGS: usize = 0x88;
/// Total frame size: 15 registers plus the five CPU-pushed words.
pub const FRAME_WORDS: usize = 20;

/// Naked scheduler entry: save, reschedule, EOI, validate, restore.
#[unsafe(naked)]
unsafe extern "C" fn sched_vector_stub() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // r12 keeps the interrupted stack for the fallback path; rbx
        // carries the scheduler's choice across the EOI call. Both are
        // callee-saved and already captured above.
        "mov r12, rsp",
        "mov rdi, rsp",
        "call {schedule}",
        "mov rbx, rax",
        "call {eoi}",
        "test rbx, rbx",
        "jz 1f",
        // CS: present, ring 0.
        "mov rax, [rbx + 0x80]",
        "test rax, rax",
        "jz 1f",
        "test al, 3",
        "jnz 1f",
        // RFLAGS: bit 1 is architecturally always one.
        "mov rax, [rbx + 0x88]",
        "test rax, 2",
        "jz 1f",
        // RIP: canonical in either half.
        "mov rax, [rbx + 0x78]",
        "shr rax, 48",
        "cmp rax, 0xFFFF",
        "je 2f",
        "test rax, rax",
        "jz 2f",
        "1:",
        "mov rbx, r12",
        "2:",
        "mov rsp, rbx",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        schedule = sym crate::sched::sched_isr_entry,
        eoi = sym crate::drivers::lapic::eoi_current,
    );
}

/// Installs the stub on the scheduler vector.
pub(super) fn install() {
    // SAFETY: the stub saves and restores the full register state and
    // returns via iretq, as the vector requires.
    unsafe {
        super::super::idt::set_vector(
            crate::config::SCHED_VECTOR,
            sched_vector_stub as usize as u64,
        );
    }
}
