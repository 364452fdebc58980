// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! i386 specifics for light core files.

use super::Arch;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

// i386 machine
pub const EM_386: u16 = 3;

/// General purpose registers, `struct user_regs_struct`
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct elf_gregset_t {
    pub(crate) ebx: u32,
    pub(crate) ecx: u32,
    pub(crate) edx: u32,
    pub(crate) esi: u32,
    pub(crate) edi: u32,
    pub(crate) ebp: u32,
    pub(crate) eax: u32,
    pub(crate) xds: u32,
    pub(crate) xes: u32,
    pub(crate) xfs: u32,
    pub(crate) xgs: u32,
    pub(crate) orig_eax: u32,
    pub(crate) eip: u32,
    pub(crate) xcs: u32,
    pub(crate) eflags: u32,
    pub(crate) esp: u32,
    pub(crate) xss: u32,
}

pub(crate) struct X86;

impl Arch for X86 {
    const EM_ELF_MACHINE: u16 = EM_386;

    fn name() -> &'static str {
        "x86"
    }

    fn registers_from_context(context: &libc::ucontext_t) -> elf_gregset_t {
        let gregs = &context.uc_mcontext.gregs;
        let reg = |index: libc::c_int| gregs[index as usize] as u32;

        elf_gregset_t {
            ebx: reg(libc::REG_EBX),
            ecx: reg(libc::REG_ECX),
            edx: reg(libc::REG_EDX),
            esi: reg(libc::REG_ESI),
            edi: reg(libc::REG_EDI),
            ebp: reg(libc::REG_EBP),
            eax: reg(libc::REG_EAX),
            xds: reg(libc::REG_DS),
            xes: reg(libc::REG_ES),
            xfs: reg(libc::REG_FS),
            xgs: reg(libc::REG_GS),
            orig_eax: 0,
            eip: reg(libc::REG_EIP),
            xcs: reg(libc::REG_CS),
            eflags: reg(libc::REG_EFL),
            esp: reg(libc::REG_ESP),
            xss: reg(libc::REG_SS),
        }
    }

    fn stack_pointer(regs: &elf_gregset_t) -> usize {
        regs.esp as usize
    }
}
