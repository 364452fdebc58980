// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A Rust library for writing light ELF core files of a crashed process.
//!
//! A light core holds the registers of every thread, the process and
//! auxiliary vector notes, each thread's stack and the dynamic linker's module
//! list (`.dynamic`, `r_debug`, the link-map nodes and their path strings).
//! That is enough for a debugger to unwind the threads and find the loaded
//! libraries, at a fraction of the size of a full core dump.
//!
//! The generator runs right after a fatal signal, so it sticks to
//! synchronous system calls and takes scratch memory from a [`ScratchArena`]
//! reserved in advance instead of the general heap.

#![cfg(target_os = "linux")]
#![warn(missing_docs)]

mod arch;
mod arena;
mod context;
mod coredump;
mod diag;
mod elf;
mod error;
mod linux;
mod modules;
mod note;
mod output;
mod procinfo;
mod region;
mod session;
mod threads;

#[cfg(test)]
mod test_support;

pub use arch::elf_gregset_t;
pub use arena::ArenaVec;
pub use arena::ScratchArena;
pub use context::CrashContext;
pub use context::RawCrashContext;
pub use coredump::CoreFileWriter;
pub use coredump::CoreLayout;
pub use coredump::CoreRecord;
pub use error::CoreError;
pub use linux::PtraceDebugger;
pub use linux::MAX_MAPPINGS;
pub use linux::MAX_THREADS;
pub use modules::ModuleEntry;
pub use modules::ModuleEntryKind;
pub use modules::ModuleList;
pub use modules::ModuleWalker;
pub use note::NoteRecord;
pub use output::OutputFile;
pub use procinfo::locate_vdso;
pub use procinfo::AuxVectorNote;
pub use procinfo::ProcPath;
pub use procinfo::ProcessInfoNote;
pub use region::MemoryRegion;
pub use region::RegionSource;
pub use session::generate_core;
pub use session::generate_live_core;
pub use session::try_generate_core;
pub use session::try_generate_live_core;
pub use session::CrashSession;
pub use session::SessionOptions;
pub use threads::ThreadSet;
pub use threads::ThreadSnapshot;

/// Trait for those able to read the process virtual memory.
pub trait ReadProcessMemory {
    /// Read process memory into `buf` starting at the virtual address `base`
    /// on behalf of thread `tid`, and returns the number of bytes and or the
    /// error.
    fn read_process_memory(&self, tid: i32, base: usize, buf: &mut [u8])
        -> Result<usize, CoreError>;
}

/// A mapping of the target's address space
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingInfo {
    /// First address of the mapping
    pub start_addr: usize,
    /// Length in bytes
    pub size: usize,
    /// Offset into the mapped file
    pub offset: usize,
}

impl MappingInfo {
    /// One past the last address of the mapping
    pub fn end_addr(&self) -> usize {
        self.start_addr + self.size
    }

    /// Whether `address` falls inside the mapping
    pub fn contains(&self, address: usize) -> bool {
        self.start_addr <= address && address < self.end_addr()
    }
}

/// State of a thread as seen by the debugger
#[derive(Clone, Copy, Debug)]
pub struct ThreadInfo {
    /// Thread group id
    pub tgid: i32,
    /// Parent process id
    pub ppid: i32,
    /// General purpose registers
    pub regs: elf_gregset_t,
    /// Stack pointer taken from `regs`
    pub stack_pointer: usize,
}

/// The process-debugging collaborator.
///
/// It stops and resumes the target, and gives synchronous access to its
/// threads, memory, mappings and auxiliary vector. Every error it reports is
/// fatal for the core file being written.
///
/// Example, an in-memory process with a single thread:
///
/// ```rust
/// use lightcore::{
///     CoreError, CrashSession, MappingInfo, OutputFile, ProcPath, ProcessDebugger,
///     ReadProcessMemory, ScratchArena, SessionOptions, ThreadInfo,
/// };
///
/// struct InMemoryProcess {
///     stack_base: usize,
///     stack: Vec<u8>,
///     threads: [i32; 1],
///     regs: lightcore::elf_gregset_t,
///     proc_dir: std::path::PathBuf,
///     arena: ScratchArena,
/// }
///
/// impl ReadProcessMemory for InMemoryProcess {
///     fn read_process_memory(&self, _tid: i32, base: usize, buf: &mut [u8]) -> Result<usize, CoreError> {
///         let start = base - self.stack_base;
///         buf.copy_from_slice(&self.stack[start..start + buf.len()]);
///         Ok(buf.len())
///     }
/// }
///
/// impl ProcessDebugger for InMemoryProcess {
///     fn init(&mut self) -> Result<(), CoreError> { Ok(()) }
///     fn suspend_threads(&mut self) -> Result<(), CoreError> { Ok(()) }
///     fn resume_threads(&mut self) -> Result<(), CoreError> { Ok(()) }
///     fn threads(&self) -> &[i32] { &self.threads }
///     fn thread_info_by_index(&self, index: usize) -> Result<ThreadInfo, CoreError> {
///         if index != 0 {
///             return Err(CoreError::NoSuchThread(index));
///         }
///         Ok(ThreadInfo { tgid: 42, ppid: 1, regs: self.regs, stack_pointer: self.stack_base + 0x800 })
///     }
///     fn find_mapping(&self, address: usize) -> Option<MappingInfo> {
///         let mapping = MappingInfo { start_addr: self.stack_base, size: self.stack.len(), offset: 0 };
///         mapping.contains(address).then_some(mapping)
///     }
///     fn build_proc_path(&self, _pid: i32, leaf: &str) -> Result<ProcPath, CoreError> {
///         ProcPath::from_path(&self.proc_dir.join(leaf))
///     }
///     fn auxv(&self, _a_type: usize) -> usize { 0 }
///     fn crash_thread(&self) -> i32 { 42 }
///     fn crash_signal(&self) -> i32 { 11 }
///     fn allocator(&self) -> &ScratchArena { &self.arena }
/// }
///
/// let proc_dir = std::env::temp_dir().join(format!("lightcore-doc-{}", std::process::id()));
/// std::fs::create_dir_all(&proc_dir).unwrap();
/// std::fs::write(proc_dir.join("cmdline"), b"/bin/example\0--flag\0").unwrap();
/// std::fs::write(proc_dir.join("auxv"), [0u8; 16]).unwrap();
///
/// let process = InMemoryProcess {
///     stack_base: 0x7000_0000,
///     stack: vec![0x5a; 0x1000],
///     threads: [42],
///     regs: Default::default(),
///     proc_dir: proc_dir.clone(),
///     arena: ScratchArena::with_capacity(1 << 20).unwrap(),
/// };
///
/// let options = SessionOptions { page_size: 0x1000, ..Default::default() };
/// let mut session = CrashSession::new(42, process, OutputFile::new(Vec::new()), options);
/// let written = session.run(None).unwrap();
///
/// // Headers and notes fit in the first page, the stack page follows.
/// assert_eq!(written, 0x1000 + 0x1000);
/// std::fs::remove_dir_all(proc_dir).unwrap();
/// ```
pub trait ProcessDebugger: ReadProcessMemory {
    /// One-time initialization: enumerate threads, mappings and the
    /// auxiliary vector.
    fn init(&mut self) -> Result<(), CoreError>;
    /// Stops every thread of the target.
    fn suspend_threads(&mut self) -> Result<(), CoreError>;
    /// Lets every stopped thread run again.
    fn resume_threads(&mut self) -> Result<(), CoreError>;
    /// Thread ids of the target, in enumeration order
    fn threads(&self) -> &[i32];
    /// Registers and ids of the thread at `index` in [`Self::threads`]
    fn thread_info_by_index(&self, index: usize) -> Result<ThreadInfo, CoreError>;
    /// The mapping containing `address`, if any
    fn find_mapping(&self, address: usize) -> Option<MappingInfo>;
    /// Path of the `/proc` file `leaf` for `pid`
    fn build_proc_path(&self, pid: i32, leaf: &str) -> Result<ProcPath, CoreError> {
        ProcPath::new(pid, leaf)
    }
    /// Value of the auxiliary vector entry `a_type`, zero when absent
    fn auxv(&self, a_type: usize) -> usize;
    /// Id of the thread that received the fatal signal
    fn crash_thread(&self) -> i32;
    /// The fatal signal
    fn crash_signal(&self) -> i32;
    /// Scratch memory reserved before the crash
    fn allocator(&self) -> &ScratchArena;
}
