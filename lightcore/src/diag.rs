// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixed-shape diagnostics.
//!
//! Every failure the generator can run into is reported through one of these
//! functions so the lines stay uniform and the call sites do no formatting of
//! their own. Events go to `tracing` under the `lightcore` target; nothing
//! here allocates.

use crate::arch::Arch;
use crate::arch::NativeArch;
use crate::CrashContext;
use std::path::Path;

pub(crate) fn greet(pid: i32, context: &CrashContext) {
    tracing::warn!(
        target: "lightcore",
        "[pid={}, tid={}] crash caught (signal {}) at 0x{:x}, arch {}",
        pid,
        context.tid,
        context.signal,
        context.fault_address,
        NativeArch::name()
    );
}

pub(crate) fn open_failed(path: &Path, error: &std::io::Error) {
    tracing::error!(target: "lightcore", "can't open '{}': {}", path.display(), error);
}

pub(crate) fn read_failed(path: &Path) {
    tracing::error!(target: "lightcore", "read from '{}' failed", path.display());
}

pub(crate) fn write_failed(len: usize, error: &std::io::Error) {
    tracing::error!(target: "lightcore", "write of {} bytes failed: {}", len, error);
}

pub(crate) fn remote_read_failed(tid: i32, address: usize, len: usize) {
    tracing::error!(
        target: "lightcore",
        "copy of {} bytes at 0x{:x} from thread {} failed",
        len,
        address,
        tid
    );
}

pub(crate) fn stack_not_found(tid: i32, stack_pointer: usize) {
    tracing::error!(
        target: "lightcore",
        "stack bottom is not found for SP=0x{:x} of thread {}",
        stack_pointer,
        tid
    );
}

pub(crate) fn thread_count_mismatch(threads: usize, stacks: usize) {
    tracing::warn!(
        target: "lightcore",
        "threads number is {} but stacks number is {}",
        threads,
        stacks
    );
}

pub(crate) fn say(text: &'static str) {
    tracing::warn!(target: "lightcore", "{}", text);
}
