// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The heap of a crashed process may be corrupted, so inspecting a target
//! must not allocate from it.

#![cfg(target_os = "linux")]

use lightcore::CoreError;
use lightcore::ProcessDebugger;
use lightcore::PtraceDebugger;
use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::fork;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use std::alloc::GlobalAlloc;
use std::alloc::Layout;
use std::alloc::System;
use std::cell::Cell;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

struct CountingAllocator;

static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);
static ALLOCATED_BYTES: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static COUNTING: Cell<bool> = const { Cell::new(false) };
}

fn record(size: usize) {
    if COUNTING.try_with(Cell::get).unwrap_or(false) {
        ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        ALLOCATED_BYTES.fetch_add(size, Ordering::Relaxed);
    }
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        record(layout.size());
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        record(layout.size());
        System.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        record(new_size);
        System.realloc(ptr, layout, new_size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

/// Runs `f` and returns its result with the number and total size of the
/// heap allocations it made on this thread.
fn count_heap_use<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    ALLOCATIONS.store(0, Ordering::Relaxed);
    ALLOCATED_BYTES.store(0, Ordering::Relaxed);

    COUNTING.with(|c| c.set(true));
    let result = f();
    COUNTING.with(|c| c.set(false));

    (
        result,
        ALLOCATIONS.load(Ordering::Relaxed),
        ALLOCATED_BYTES.load(Ordering::Relaxed),
    )
}

/// Forks a child with `count` extra one page mappings and waits until they
/// are in place.
fn spawn_with_mappings(count: usize) -> Pid {
    let (read_fd, write_fd) = nix::unistd::pipe().unwrap();

    // SAFETY: the child only makes raw system calls and never returns.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            for i in 0..count {
                // Alternating protections keep neighbours from merging.
                let prot = if i % 2 == 0 {
                    libc::PROT_READ
                } else {
                    libc::PROT_READ | libc::PROT_WRITE
                };
                // SAFETY: a fresh anonymous mapping aliases nothing.
                unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        4096,
                        prot,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    );
                }
            }

            // SAFETY: writes one byte from a static buffer, then sleeps until
            // killed.
            unsafe {
                libc::write(write_fd, b"r".as_ptr().cast(), 1);
                loop {
                    libc::pause();
                }
            }
        }
        ForkResult::Parent { child } => {
            nix::unistd::close(write_fd).unwrap();
            let mut ready = [0u8; 1];
            assert_eq!(nix::unistd::read(read_fd, &mut ready).unwrap(), 1);
            nix::unistd::close(read_fd).unwrap();
            child
        }
    }
}

fn inspect(pid: Pid) -> Result<PtraceDebugger, CoreError> {
    let mut debugger = PtraceDebugger::new(pid.as_raw(), 1 << 20)?;
    debugger.init()?;
    Ok(debugger)
}

#[test]
fn many_mappings_do_not_touch_the_heap() {
    let child = spawn_with_mappings(400);

    // The first run also registers the tracing callsites.
    let warm_up = inspect(child).map(|d| d.mappings().len());
    let (debugger, allocations, bytes) = count_heap_use(|| inspect(child));

    kill(child, Signal::SIGKILL).unwrap();
    waitpid(child, None).unwrap();

    let debugger = debugger.unwrap();
    assert!(warm_up.unwrap() > 400);
    assert!(debugger.mappings().len() > 400);
    assert_eq!(debugger.threads(), &[child.as_raw()]);
    assert_eq!(
        (allocations, bytes),
        (0, 0),
        "{} mappings, {} heap allocations of {} bytes",
        debugger.mappings().len(),
        allocations,
        bytes
    );
}
