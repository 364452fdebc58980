// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The crash context handed over by the signal handler.

use crate::arch::elf_gregset_t;
use crate::arch::Arch;
use crate::arch::NativeArch;
use crate::CoreError;

/// Layout of the serialized crash context: what the signal handler
/// received, and the id of the thread it ran on.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawCrashContext {
    /// Signal information
    pub siginfo: libc::siginfo_t,
    /// Thread that received the signal
    pub tid: libc::pid_t,
    /// Saved machine context
    pub context: libc::ucontext_t,
    /// Saved floating point state
    pub float_state: libc::_libc_fpstate,
}

/// What is known about the crash: the faulting thread, the signal and the
/// registers at the time of the fault.
#[derive(Clone, Copy, Debug)]
pub struct CrashContext {
    /// Thread that received the fatal signal
    pub tid: i32,
    /// The fatal signal
    pub signal: i32,
    /// Faulting address for memory errors
    pub fault_address: usize,
    /// General purpose registers of the faulting thread
    pub registers: elf_gregset_t,
}

impl CrashContext {
    /// Deserializes a [`RawCrashContext`], which must be exactly as large as
    /// the one this crate is built with.
    pub fn from_blob(blob: &[u8]) -> Result<Self, CoreError> {
        let expected = std::mem::size_of::<RawCrashContext>();
        if blob.len() != expected {
            return Err(CoreError::BadContextSize {
                expected,
                actual: blob.len(),
            });
        }

        // SAFETY: the length is checked above, the read tolerates any
        // alignment and the structure is made of integers and raw pointers,
        // valid for every bit pattern.
        let raw = unsafe { std::ptr::read_unaligned(blob.as_ptr() as *const RawCrashContext) };

        Ok(Self::from_raw(&raw))
    }

    /// Decodes the signal information and registers of `raw`.
    pub fn from_raw(raw: &RawCrashContext) -> Self {
        // SAFETY: si_addr is read from the union of a fully initialized
        // siginfo_t; for signals without an address it is just a number.
        let fault_address = unsafe { raw.siginfo.si_addr() } as usize;

        Self {
            tid: raw.tid,
            signal: raw.siginfo.si_signo,
            fault_address,
            registers: NativeArch::registers_from_context(&raw.context),
        }
    }

    /// Stack pointer at the time of the crash
    pub fn stack_pointer(&self) -> usize {
        NativeArch::stack_pointer(&self.registers)
    }
}
