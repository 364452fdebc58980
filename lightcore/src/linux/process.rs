// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Code for linux specific functionality
//!
//! A process debugger built on `ptrace` and `/proc`.

use super::memory::MemoryReader;
use super::procfs::for_each_dir_entry;
use super::procfs::for_each_line;
use super::procfs::parse_first_number;
use super::procfs::parse_hex;
use super::procfs::read_file_prefix;
use super::ptrace::get_gp_reg_set;
use super::ptrace::ptrace_interrupt;
use crate::arch::Arch;
use crate::arch::NativeArch;
use crate::arena::MappedVec;
use crate::procinfo::ProcPath;
use crate::CoreError;
use crate::MappingInfo;
use crate::ProcessDebugger;
use crate::ReadProcessMemory;
use crate::ScratchArena;
use crate::ThreadInfo;
use nix::sys;
use nix::sys::ptrace::seize;
use nix::sys::ptrace::Options;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use smallvec::SmallVec;
use zerocopy::IntoBytes;

type ThreadIds = MappedVec<i32>;
type Mappings = MappedVec<MappingInfo>;
type AuxVector = SmallVec<[(usize, usize); AUXV_ENTRIES]>;

// Each entry of the auxiliary vector is a type and a value.
const AUXV_WORDS: usize = 512;
const AUXV_ENTRIES: usize = AUXV_WORDS / 2;

/// Upper bound on the threads of a target process.
pub const MAX_THREADS: usize = 32768;

/// Upper bound on the mappings of a target process, the default of
/// `vm.max_map_count`.
pub const MAX_MAPPINGS: usize = 65530;

fn get_thread_ids(pid: Pid) -> Result<ThreadIds, CoreError> {
    let mut threads = ThreadIds::with_capacity(MAX_THREADS)?;
    let task_dir = ProcPath::new(pid.as_raw(), "task")?;
    tracing::debug!("Reading {:?}", task_dir);

    tracing::debug!(
        "Enumerating threads(light-weight processes) for the process {}",
        pid
    );

    for_each_dir_entry(task_dir.as_path(), |name| {
        if name.is_empty() || !name.iter().all(u8::is_ascii_digit) {
            return Ok(());
        }

        let tid = parse_first_number(name) as i32;
        tracing::debug!("Found thread {}", tid);
        threads.push(tid)
    })?;

    threads.as_mut_slice().sort_unstable();
    Ok(threads)
}

fn get_aux_vector(pid: Pid) -> Result<AuxVector, CoreError> {
    let mut auxv = AuxVector::new();
    let mut words = [0_usize; AUXV_WORDS];

    let path = ProcPath::new(pid.as_raw(), "auxv")?;
    tracing::debug!("Reading {:?}", path);
    let len = read_file_prefix(path.as_path(), words.as_mut_bytes())?;

    for pair in words[..len / std::mem::size_of::<usize>()].chunks_exact(2) {
        if pair[0] == 0 {
            break;
        }
        auxv.push((pair[0], pair[1]));
    }

    Ok(auxv)
}

fn parse_mapping(line: &[u8]) -> Result<MappingInfo, CoreError> {
    let mut fields = line.split(|&b| b == b' ').filter(|f| !f.is_empty());

    let range = fields.next().ok_or(CoreError::ProcParsingError)?;
    let dash = range
        .iter()
        .position(|&b| b == b'-')
        .ok_or(CoreError::ProcParsingError)?;
    let begin = parse_hex(&range[..dash])?;
    let end = parse_hex(&range[dash + 1..])?;

    // Permissions, then the offset
    fields.next().ok_or(CoreError::ProcParsingError)?;
    let offset = parse_hex(fields.next().ok_or(CoreError::ProcParsingError)?)?;

    if end < begin {
        return Err(CoreError::ProcParsingError);
    }

    Ok(MappingInfo {
        start_addr: begin,
        size: end - begin,
        offset,
    })
}

fn get_mappings(pid: Pid) -> Result<Mappings, CoreError> {
    let mut maps = Mappings::with_capacity(MAX_MAPPINGS)?;

    let maps_path = ProcPath::new(pid.as_raw(), "maps")?;
    tracing::debug!("Reading {:?}", maps_path);

    for_each_line(maps_path.as_path(), |line| {
        let mapping = parse_mapping(line)?;
        tracing::debug!(
            "Memory map [0x{:x}; 0x{:x})",
            mapping.start_addr,
            mapping.end_addr()
        );
        maps.push(mapping)
    })?;

    Ok(maps)
}

/// Thread group and parent ids from `/proc/<pid>/task/<tid>/status`
fn get_thread_ids_of(pid: Pid, tid: i32) -> Result<(i32, i32), CoreError> {
    let mut buf = [0_u8; 4096];
    let status_path = ProcPath::task(pid.as_raw(), tid, "status")?;
    tracing::debug!("Reading {:?}", status_path);
    let len = read_file_prefix(status_path.as_path(), &mut buf)?;

    // The common trait for the lines is a prefix followed by the tab
    // character and then there is a number.
    let mut tgid = None;
    let mut ppid = None;
    for line in buf[..len].split(|&b| b == b'\n') {
        if let Some(s) = line.strip_prefix(b"Tgid:\t") {
            tgid = Some(parse_first_number(s) as i32);
        } else if let Some(s) = line.strip_prefix(b"PPid:\t") {
            ppid = Some(parse_first_number(s) as i32);
        }
    }

    match (tgid, ppid) {
        (Some(tgid), Some(ppid)) => Ok((tgid, ppid)),
        _ => {
            tracing::error!("Unsupported format of the procfs status file {:?}", status_path);
            Err(CoreError::ProcParsingError)
        }
    }
}

/// Debugger of a Linux process, attached through `ptrace`.
///
/// The thread and mapping tables live in their own anonymous mappings and the
/// auxiliary vector in inline storage, so neither creating nor using the
/// debugger touches the heap of the calling process. A target with more than
/// [`MAX_THREADS`] threads or [`MAX_MAPPINGS`] mappings is an error.
pub struct PtraceDebugger {
    pid: Pid,
    tids: ThreadIds,
    seized: ThreadIds,
    mappings: Mappings,
    // Auxiliary vector types.
    // The kernel exposes some system configuration using it.
    aux_vector: AuxVector,
    crash_thread: i32,
    crash_signal: i32,
    memory: MemoryReader,
    arena: ScratchArena,
}

impl PtraceDebugger {
    /// Creates new debugger
    ///
    /// # Arguments
    /// * `pid` - process ID
    /// * `arena_capacity` - bytes of scratch memory to reserve
    ///
    pub fn new(pid: libc::pid_t, arena_capacity: usize) -> Result<Self, CoreError> {
        let pid = Pid::from_raw(pid);

        Ok(Self {
            pid,
            tids: ThreadIds::with_capacity(MAX_THREADS)?,
            seized: ThreadIds::with_capacity(MAX_THREADS)?,
            mappings: Mappings::with_capacity(MAX_MAPPINGS)?,
            aux_vector: AuxVector::new(),
            crash_thread: pid.as_raw(),
            crash_signal: 0,
            memory: MemoryReader::new(pid)?,
            arena: ScratchArena::with_capacity(arena_capacity)?,
        })
    }

    /// Records the thread that received the fatal signal.
    pub fn set_crash_thread(&mut self, tid: i32, signal: i32) {
        self.crash_thread = tid;
        self.crash_signal = signal;
    }

    /// The mappings read by [`ProcessDebugger::init`].
    pub fn mappings(&self) -> &[MappingInfo] {
        &self.mappings
    }

    fn detach_all(&mut self) -> Result<(), CoreError> {
        let mut result = Ok(());

        for &tid in self.seized.iter() {
            match sys::ptrace::detach(Pid::from_raw(tid), None) {
                Ok(_) => {
                    tracing::debug!("Thread {} resumed", tid);
                }
                Err(e) => {
                    tracing::error!("Thread {} failed to resume: {:?}", tid, e);
                    if result.is_ok() {
                        result = Err(CoreError::NixError(e));
                    }
                }
            };
        }

        self.seized.clear();
        result
    }
}

impl ReadProcessMemory for PtraceDebugger {
    fn read_process_memory(
        &self,
        _tid: i32,
        base: usize,
        buf: &mut [u8],
    ) -> Result<usize, CoreError> {
        self.memory.read(base, buf)
    }
}

impl ProcessDebugger for PtraceDebugger {
    fn init(&mut self) -> Result<(), CoreError> {
        let tids = get_thread_ids(self.pid)?;

        // Guard against calling for itself. Fail early as the seizing the threads
        // will fail with -EPERM later.
        if tids.binary_search(&nix::unistd::getpid().as_raw()).is_ok() {
            return Err(CoreError::CantDumpItself);
        };

        self.tids = tids;
        self.mappings = get_mappings(self.pid)?;
        self.aux_vector = get_aux_vector(self.pid)?;

        tracing::debug!("Auxiliary vector {:x?}", self.aux_vector);

        Ok(())
    }

    fn suspend_threads(&mut self) -> Result<(), CoreError> {
        tracing::info!(
            "Attaching to {} threads of process {}",
            self.tids.len(),
            self.pid
        );

        for i in 0..self.tids.len() {
            let tid = Pid::from_raw(self.tids[i]);
            tracing::debug!("Seizing thread {}", tid);

            if let Err(e) = seize(tid, Options::empty()) {
                tracing::error!("Seizing thread {} failed, error {}", tid, e);
                return Err(CoreError::NixError(e));
            }
            self.seized.push(tid.as_raw())?;

            tracing::debug!("Interrupting thread {}", tid);

            ptrace_interrupt(tid)?;

            tracing::debug!("Waiting for thread {} to stop", tid);

            match waitpid(tid, None) {
                Ok(s) => {
                    tracing::debug!("Thread {} stopped, status {:?}", tid, s);
                }
                Err(e) => {
                    tracing::error!("Waiting for thread {} failed, error {}", tid, e);
                    return Err(CoreError::NixError(e));
                }
            }
        }

        // There is a race here:
        //  1) us stopping threads,
        //  2) the process that might be creating new ones,
        //  3) the existing threads might exit.
        // See if the threads ids are still the same. Not bullet-proof as thread ids
        // might be re-used.
        if get_thread_ids(self.pid)?.as_slice() != self.tids.as_slice() {
            return Err(CoreError::RaceTryAgain);
        }

        Ok(())
    }

    fn resume_threads(&mut self) -> Result<(), CoreError> {
        tracing::info!(
            "Detaching from {} threads of process {}",
            self.seized.len(),
            self.pid
        );

        self.detach_all()
    }

    fn threads(&self) -> &[i32] {
        &self.tids
    }

    fn thread_info_by_index(&self, index: usize) -> Result<ThreadInfo, CoreError> {
        let tid = *self.tids.get(index).ok_or(CoreError::NoSuchThread(index))?;

        let regs = get_gp_reg_set(Pid::from_raw(tid))?;
        let (tgid, ppid) = get_thread_ids_of(self.pid, tid)?;

        Ok(ThreadInfo {
            tgid,
            ppid,
            regs,
            stack_pointer: NativeArch::stack_pointer(&regs),
        })
    }

    fn find_mapping(&self, address: usize) -> Option<MappingInfo> {
        self.mappings.iter().copied().find(|m| m.contains(address))
    }

    fn auxv(&self, a_type: usize) -> usize {
        self.aux_vector
            .iter()
            .find(|(t, _)| *t == a_type)
            .map_or(0, |(_, v)| *v)
    }

    fn crash_thread(&self) -> i32 {
        self.crash_thread
    }

    fn crash_signal(&self) -> i32 {
        self.crash_signal
    }

    fn allocator(&self) -> &ScratchArena {
        &self.arena
    }
}

impl Drop for PtraceDebugger {
    fn drop(&mut self) {
        if !self.seized.is_empty() {
            let _ = self.detach_all();
        }
    }
}
