// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! x86_64 specifics for light core files.

use super::Arch;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

// amd64 machine
pub const EM_X86_64: u16 = 62;

/// General purpose registers, `struct user_regs_struct`
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct elf_gregset_t {
    pub(crate) r15: u64,
    pub(crate) r14: u64,
    pub(crate) r13: u64,
    pub(crate) r12: u64,
    pub(crate) rbp: u64,
    pub(crate) rbx: u64,
    pub(crate) r11: u64,
    pub(crate) r10: u64,
    pub(crate) r9: u64,
    pub(crate) r8: u64,
    pub(crate) rax: u64,
    pub(crate) rcx: u64,
    pub(crate) rdx: u64,
    pub(crate) rsi: u64,
    pub(crate) rdi: u64,
    pub(crate) orig_rax: u64,
    pub(crate) rip: u64,
    pub(crate) cs: u64,
    pub(crate) eflags: u64,
    pub(crate) rsp: u64,
    pub(crate) ss: u64,
    pub(crate) fs_base: u64,
    pub(crate) gs_base: u64,
    pub(crate) ds: u64,
    pub(crate) es: u64,
    pub(crate) fs: u64,
    pub(crate) gs: u64,
}

pub(crate) struct X86_64;

impl Arch for X86_64 {
    const EM_ELF_MACHINE: u16 = EM_X86_64;

    fn name() -> &'static str {
        "x86_64"
    }

    fn registers_from_context(context: &libc::ucontext_t) -> elf_gregset_t {
        let gregs = &context.uc_mcontext.gregs;
        let reg = |index: libc::c_int| gregs[index as usize] as u64;

        // cs, gs and fs are packed into one slot of the signal frame.
        let csgsfs = reg(libc::REG_CSGSFS);

        elf_gregset_t {
            r15: reg(libc::REG_R15),
            r14: reg(libc::REG_R14),
            r13: reg(libc::REG_R13),
            r12: reg(libc::REG_R12),
            rbp: reg(libc::REG_RBP),
            rbx: reg(libc::REG_RBX),
            r11: reg(libc::REG_R11),
            r10: reg(libc::REG_R10),
            r9: reg(libc::REG_R9),
            r8: reg(libc::REG_R8),
            rax: reg(libc::REG_RAX),
            rcx: reg(libc::REG_RCX),
            rdx: reg(libc::REG_RDX),
            rsi: reg(libc::REG_RSI),
            rdi: reg(libc::REG_RDI),
            orig_rax: 0,
            rip: reg(libc::REG_RIP),
            cs: csgsfs & 0xffff,
            eflags: reg(libc::REG_EFL),
            rsp: reg(libc::REG_RSP),
            ss: 0,
            fs_base: 0,
            gs_base: 0,
            ds: 0,
            es: 0,
            fs: (csgsfs >> 32) & 0xffff,
            gs: (csgsfs >> 16) & 0xffff,
        }
    }

    fn stack_pointer(regs: &elf_gregset_t) -> usize {
        regs.rsp as usize
    }
}
