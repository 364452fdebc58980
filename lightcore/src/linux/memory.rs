// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This submodule contains the `memory` handling functionality for a linux
//! process.

use crate::procinfo::ProcPath;
use crate::CoreError;
use nix::sys::uio::process_vm_readv;
use nix::sys::uio::RemoteIoVec;
use nix::unistd::Pid;
use std::fs::File;
use std::io::IoSliceMut;
use std::os::unix::fs::FileExt;

/// Reads the memory of a stopped process.
pub(crate) enum MemoryReader {
    /// Employs the `process_vm_readv` system call available on Linux 3.2+.
    /// It might be disabled on some systems in the kernel configuration.
    Fast(Pid),
    /// Slow but more compatible, uses the `/proc/<pid>/mem` file.
    Slow(File),
}

impl MemoryReader {
    pub fn new(pid: Pid) -> Result<Self, CoreError> {
        if process_vm_readv_works() {
            tracing::info!("Using the fast process memory read on this system");
            return Ok(Self::Fast(pid));
        }

        tracing::info!("Using the slow process memory read on this system");
        let path = ProcPath::new(pid.as_raw(), "mem")?;
        let file = File::open(path.as_path()).map_err(CoreError::IoError)?;
        Ok(Self::Slow(file))
    }

    pub fn read(&self, base: usize, buf: &mut [u8]) -> Result<usize, CoreError> {
        match self {
            Self::Fast(pid) => {
                let len = buf.len();
                process_vm_readv(
                    *pid,
                    &mut [IoSliceMut::new(buf)],
                    &[RemoteIoVec { base, len }],
                )
                .map_err(CoreError::NixError)
            }
            Self::Slow(file) => {
                file.read_exact_at(buf, base as u64)
                    .map_err(CoreError::IoError)?;
                Ok(buf.len())
            }
        }
    }
}

/// The `process_vm_readv` system call might be unavailable. An extra check is made to be
/// sure the ABI works.
pub(crate) fn process_vm_readv_works() -> bool {
    let probe_in = [0xc1c2c3c4c5c6c7c8_u64];
    let mut probe_out = 0u64.to_le_bytes();

    let result = process_vm_readv(
        nix::unistd::getpid(),
        &mut [IoSliceMut::new(&mut probe_out)],
        &[RemoteIoVec {
            base: probe_in.as_ptr() as usize,
            len: std::mem::size_of_val(&probe_in),
        }],
    );

    if let Err(e) = result {
        tracing::debug!("process_vm_readv has not succeeded, error {e:?}, won't be using it");
        return false;
    }

    if probe_in[0] != u64::from_le_bytes(probe_out) {
        tracing::debug!(
            "process_vm_readv did not return expected data: {probe_in:x?} != {probe_out:x?}, won't be using it"
        );
        return false;
    }

    true
}
