// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process trace helpers, not machine-specific ones.

use std::ffi::c_void;
use std::ptr;

use crate::arch::elf_gregset_t;
use crate::elf::NT_PRSTATUS;
use crate::CoreError;
use nix::sys;
use nix::sys::ptrace::Request;
use nix::sys::ptrace::RequestType;
use nix::unistd::Pid;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Reads the register set `set` of a stopped thread straight into `out`.
pub fn ptrace_get_reg_set<T: IntoBytes + FromBytes>(
    pid: Pid,
    set: u32,
    out: &mut T,
) -> Result<(), CoreError> {
    let bytes = out.as_mut_bytes();
    let expected = bytes.len();
    let mut vec = nix::libc::iovec {
        iov_base: bytes.as_mut_ptr() as *mut c_void,
        iov_len: expected,
    };

    // SAFETY: Using FFI with the process trace API, the kernel writes at most
    // `iov_len` bytes into the buffer described by `vec`.
    let err = unsafe {
        nix::libc::ptrace(
            Request::PTRACE_GETREGSET as RequestType,
            nix::libc::pid_t::from(pid),
            set as usize as *mut c_void,
            &mut vec as *mut _ as *mut c_void,
        )
    };
    nix::errno::Errno::result(err)?;

    if vec.iov_len != expected {
        tracing::error!(
            "Register set {} of thread {} is {} bytes, expected {}",
            set,
            pid,
            vec.iov_len,
            expected
        );
        return Err(CoreError::InternalError("unexpected register set size"));
    }

    Ok(())
}

pub fn ptrace_interrupt(pid: Pid) -> Result<(), CoreError> {
    // SAFETY: Using FFI with the process trace API to read raw bytes.
    let ret = unsafe {
        nix::errno::Errno::clear();
        nix::libc::ptrace(
            nix::libc::PTRACE_INTERRUPT as sys::ptrace::RequestType,
            nix::libc::pid_t::from(pid),
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    };
    match nix::errno::Errno::result(ret) {
        Ok(..) => Ok(()),
        Err(e) => Err(CoreError::NixError(e)),
    }
}

pub fn get_gp_reg_set(pid: Pid) -> Result<elf_gregset_t, CoreError> {
    let mut regs = elf_gregset_t::default();
    ptrace_get_reg_set(pid, NT_PRSTATUS, &mut regs)?;
    Ok(regs)
}
