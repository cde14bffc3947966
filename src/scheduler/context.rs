use core::arch::naked_asm;

/// CPU register context saved/restored across a context switch: the
/// callee-saved registers of the System V x86_64 ABI plus the resume RIP.
/// Caller-saved state is already on the switched-out thread's stack.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CpuContext {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl CpuContext {
    /// Context for a thread that has never run; filled in by the first
    /// switch away from it.
    pub const fn empty() -> Self {
        CpuContext {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
        }
    }

    /// Context that enters `entry` on a fresh stack ending at `stack_top`.
    ///
    /// The stack pointer lands 8 bytes below a 16-byte boundary so the
    /// ABI's call-alignment invariant holds when `entry` starts executing.
    pub fn fresh(entry: u64, stack_top: u64) -> Self {
        let rsp = (stack_top & !0xF) - 8;
        CpuContext {
            rsp,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: entry,
        }
    }
}

/// Switch from the context in `old` to the one in `new`.
///
/// Saves the callee-saved registers into `old` and resumes `new` at its
/// stored RIP; returns (to `old`'s owner) when something switches back.
///
/// # Safety
/// Both pointers must reference live, correctly initialised contexts whose
/// stacks stay valid; interrupts must be disabled across the call.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut CpuContext, new: *const CpuContext) {
    naked_asm!(
        // rdi = old: save our callee-saved state.
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        // rsi = new: adopt its stack and registers.
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp [rsi + 0x38]",
        // Resume point for the switched-out thread.
        "2:",
        "ret",
    );
}

/// Enter the context in `new` without saving the current one. Used when
/// the current thread has terminated and its stack is being abandoned.
///
/// # Safety
/// As for [`switch_context`].
#[unsafe(naked)]
pub unsafe extern "C" fn enter_context(new: *const CpuContext) -> ! {
    naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "jmp [rdi + 0x38]",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_contexts_keep_the_abi_stack_alignment() {
        let ctx = CpuContext::fresh(0x1000, 0x8000_0000);
        assert_eq!(ctx.rsp % 16, 8);
        assert_eq!(ctx.rip, 0x1000);

        let ctx = CpuContext::fresh(0x1000, 0x8000_0004);
        assert_eq!(ctx.rsp % 16, 8);
        assert!(ctx.rsp < 0x8000_0004);
    }
}
