// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Threads of the target: a `NT_PRSTATUS` record and a stack each.

use crate::arena::ArenaVec;
use crate::diag;
use crate::elf::prstatus_t;
use crate::elf::NT_PRSTATUS;
use crate::note::NoteRecord;
use crate::region::MemoryRegion;
use crate::CoreError;
use crate::CrashContext;
use crate::ProcessDebugger;
use crate::SessionOptions;
use crate::ThreadInfo;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// One thread: its status record and its stack.
#[derive(Clone, Copy)]
pub struct ThreadSnapshot {
    index: Option<usize>,
    tid: i32,
    stack_pointer: usize,
    status: prstatus_t,
    stack: MemoryRegion<'static>,
}

impl ThreadSnapshot {
    fn new(
        index: Option<usize>,
        tid: i32,
        info: &ThreadInfo,
        signal: i32,
        stack: MemoryRegion<'static>,
    ) -> Self {
        let mut status = prstatus_t::new_zeroed();
        status.si_signo = signal as u32;
        status.pr_cursig = signal as u16;
        status.pr_pid = tid as u32;
        status.pr_ppid = info.ppid as u32;
        status.pr_pgrp = info.tgid as u32;
        status.pr_reg = info.regs;

        Self {
            index,
            tid,
            stack_pointer: info.stack_pointer,
            status,
            stack,
        }
    }

    /// Position in the debugger's thread list, `None` for a crashed thread
    /// the list misses
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Thread id
    pub fn tid(&self) -> i32 {
        self.tid
    }

    /// Stack pointer from the registers
    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer
    }

    /// Stack region to dump
    pub fn stack(&self) -> MemoryRegion<'static> {
        self.stack
    }

    /// The `NT_PRSTATUS` note
    pub fn note(&self) -> NoteRecord<'_> {
        NoteRecord::new(NT_PRSTATUS, self.status.as_bytes())
    }
}

impl std::fmt::Debug for ThreadSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSnapshot")
            .field("index", &self.index)
            .field("tid", &self.tid)
            .field("stack_pointer", &format_args!("0x{:x}", self.stack_pointer))
            .field("stack", &self.stack)
            .finish()
    }
}

/// Every thread of the target, the crashed one first.
#[derive(Debug)]
pub struct ThreadSet<'a> {
    snapshots: ArenaVec<'a, ThreadSnapshot>,
}

impl<'a> ThreadSet<'a> {
    /// Captures all threads. With a crash context, the registers of the
    /// crashed thread are the ones saved by the signal handler, otherwise
    /// every thread is read live.
    pub fn gather<D: ProcessDebugger + ?Sized>(
        debugger: &'a D,
        pid: i32,
        context: Option<&CrashContext>,
        options: &SessionOptions,
    ) -> Result<Self, CoreError> {
        options.validate()?;

        let threads = debugger.threads();
        let crash_tid = context.map_or_else(|| debugger.crash_thread(), |c| c.tid);
        let signal = context.map_or_else(|| debugger.crash_signal(), |c| c.signal);
        let crash_index = threads.iter().position(|&tid| tid == crash_tid);

        let mut snapshots = debugger.allocator().vec(threads.len() + 1)?;

        match (crash_index, context) {
            (Some(index), _) => {
                let mut info = debugger.thread_info_by_index(index)?;
                if let Some(context) = context {
                    info.regs = context.registers;
                    info.stack_pointer = context.stack_pointer();
                }
                let stack = stack_region(debugger, crash_tid, info.stack_pointer, options)?;
                snapshots.push(ThreadSnapshot::new(Some(index), crash_tid, &info, signal, stack))?;
            }
            (None, Some(context)) => {
                tracing::warn!("Crashed thread {} is not in the thread list", crash_tid);
                let ppid = if threads.is_empty() {
                    0
                } else {
                    debugger.thread_info_by_index(0)?.ppid
                };
                let info = ThreadInfo {
                    tgid: pid,
                    ppid,
                    regs: context.registers,
                    stack_pointer: context.stack_pointer(),
                };
                let stack = stack_region(debugger, crash_tid, info.stack_pointer, options)?;
                snapshots.push(ThreadSnapshot::new(None, crash_tid, &info, signal, stack))?;
            }
            (None, None) => {
                tracing::debug!("No crashed thread, keeping the enumeration order");
            }
        }

        for (index, &tid) in threads.iter().enumerate() {
            if Some(index) == crash_index {
                continue;
            }

            let info = debugger.thread_info_by_index(index)?;
            let stack = stack_region(debugger, tid, info.stack_pointer, options)?;
            snapshots.push(ThreadSnapshot::new(Some(index), tid, &info, signal, stack))?;
        }

        if snapshots.len() != threads.len() {
            diag::thread_count_mismatch(threads.len(), snapshots.len());
        }

        for snapshot in snapshots.iter() {
            tracing::debug!("Thread state: {:x?}", snapshot);
        }

        Ok(Self { snapshots })
    }

    /// Snapshots in note order
    pub fn snapshots(&self) -> &[ThreadSnapshot] {
        self.snapshots.as_slice()
    }

    /// The thread whose status note goes first
    pub fn crash_thread(&self) -> Option<&ThreadSnapshot> {
        self.snapshots.first()
    }

    /// Number of snapshots
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// True when no thread was captured
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// From the page of the stack pointer to the end of its mapping.
fn stack_region<D: ProcessDebugger + ?Sized>(
    debugger: &D,
    tid: i32,
    stack_pointer: usize,
    options: &SessionOptions,
) -> Result<MemoryRegion<'static>, CoreError> {
    let mapping = match debugger.find_mapping(stack_pointer) {
        Some(mapping) => mapping,
        None => {
            diag::stack_not_found(tid, stack_pointer);
            return Err(CoreError::StackNotFound { tid, stack_pointer });
        }
    };

    let start = mapping
        .start_addr
        .max(stack_pointer & !(options.page_size - 1));
    let mut size = mapping.end_addr() - start;
    if let Some(max_size) = options.max_stack_size {
        size = size.min(max_size);
    }

    Ok(MemoryRegion::remote(start, size, tid))
}
