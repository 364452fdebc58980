// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Machine-specific code for light core files.
//!
//! Each supported architecture provides the ABI register block and one
//! conversion from a signal context into it.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::elf_gregset_t;
#[cfg(target_arch = "x86_64")]
pub(crate) type NativeArch = x86_64::X86_64;

#[cfg(target_arch = "x86")]
mod x86;
#[cfg(target_arch = "x86")]
pub use x86::elf_gregset_t;
#[cfg(target_arch = "x86")]
pub(crate) type NativeArch = x86::X86;

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
compile_error!("light core files are supported on x86_64 and x86 only");

pub(crate) trait Arch {
    /// `e_machine` of the produced file
    const EM_ELF_MACHINE: u16;

    fn name() -> &'static str;

    /// Captures the general purpose registers saved in a signal context.
    fn registers_from_context(context: &libc::ucontext_t) -> elf_gregset_t;

    fn stack_pointer(regs: &elf_gregset_t) -> usize;
}
