// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! One run of the generator against one process, and the entry points.

use crate::coredump::CoreFileWriter;
use crate::diag;
use crate::modules::ModuleWalker;
use crate::output::OutputFile;
use crate::procinfo::locate_vdso;
use crate::procinfo::AuxVectorNote;
use crate::procinfo::ProcessInfoNote;
use crate::threads::ThreadSet;
use crate::CoreError;
use crate::CrashContext;
use crate::ProcessDebugger;
use crate::PtraceDebugger;
use std::io::Write;
use std::path::Path;

/// Settings of a run, decided before the crash.
///
/// The scratch arena holds the module list (about 90 KiB on 64-bit targets),
/// one snapshot of a few hundred bytes per thread, two `/proc` file buffers
/// and one page of copy buffer. The default of 1 MiB is enough for about
/// 2000 threads; a run against a larger process fails with
/// [`CoreError::ArenaExhausted`] unless `arena_capacity` is raised.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Alignment of the payload and of the stack starts, a power of two
    pub page_size: usize,
    /// Size of the scratch arena reserved for the run, see above
    pub arena_capacity: usize,
    /// Rename `libpthread.so*` in the module paths
    pub mask_threading_runtime: bool,
    /// Upper bound of each dumped stack
    pub max_stack_size: Option<usize>,
    /// Dump the vDSO as the last segment
    pub include_vdso: bool,
    /// Delete the output file when the run fails
    pub remove_partial_output: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        let page_size = match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
            Ok(Some(size)) if size > 0 => size as usize,
            _ => 0x1000,
        };

        Self {
            page_size,
            arena_capacity: 1 << 20,
            mask_threading_runtime: true,
            max_stack_size: None,
            include_vdso: cfg!(target_arch = "x86"),
            remove_partial_output: true,
        }
    }
}

impl SessionOptions {
    /// Rejects settings the layout arithmetic cannot work with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.page_size.is_power_of_two() {
            return Err(CoreError::InternalError("page size is not a power of two"));
        }

        Ok(())
    }
}

/// Generates one light core of `pid` into `output`.
pub struct CrashSession<D: ProcessDebugger, W: Write> {
    pid: i32,
    debugger: D,
    output: OutputFile<W>,
    options: SessionOptions,
}

impl<D: ProcessDebugger, W: Write> CrashSession<D, W> {
    /// The debugger is expected to be initialized.
    pub fn new(pid: i32, debugger: D, output: OutputFile<W>, options: SessionOptions) -> Self {
        Self {
            pid,
            debugger,
            output,
            options,
        }
    }

    /// Stops the target, writes the core and lets the target go. Without a
    /// crash context every thread is read live.
    pub fn run(&mut self, context: Option<&CrashContext>) -> Result<usize, CoreError> {
        self.options.validate()?;

        if let Err(e) = self.debugger.suspend_threads() {
            if let Err(resume_error) = self.debugger.resume_threads() {
                tracing::warn!("Failed to resume threads: {}", resume_error);
            }
            return Err(e);
        }

        let result = write_core(
            self.pid,
            &self.debugger,
            &mut self.output,
            &self.options,
            context,
        );

        if let Err(e) = self.debugger.resume_threads() {
            tracing::warn!("Failed to resume threads: {}", e);
        }

        let written = result?;
        tracing::info!("Light core of process {} is {} bytes", self.pid, written);
        Ok(written)
    }

    /// Gives back the output and the debugger.
    pub fn into_parts(self) -> (D, OutputFile<W>) {
        (self.debugger, self.output)
    }
}

fn write_core<D: ProcessDebugger, W: Write>(
    pid: i32,
    debugger: &D,
    out: &mut OutputFile<W>,
    options: &SessionOptions,
    context: Option<&CrashContext>,
) -> Result<usize, CoreError> {
    let threads = ThreadSet::gather(debugger, pid, context, options)?;
    let modules = ModuleWalker::new(debugger, options.page_size, options.mask_threading_runtime)
        .walk()?;
    tracing::debug!("{} module entries", modules.len());

    let process_info = ProcessInfoNote::read(debugger, pid)?;
    let auxv = AuxVectorNote::read(debugger, pid)?;
    let vdso = if options.include_vdso {
        locate_vdso(debugger)
    } else {
        None
    };

    let writer = CoreFileWriter::new(
        threads.snapshots(),
        modules.entries(),
        process_info.note(),
        auxv.note(),
        vdso,
        options.page_size,
    );

    writer.emit(out, debugger, debugger.allocator())
}

/// Writes a light core of `pid` at `path` for the crash described by
/// `crash_blob`, a serialized [`crate::RawCrashContext`].
///
/// Returns `false` on any failure; details are in the log.
pub fn generate_core(path: &Path, pid: i32, crash_blob: &[u8]) -> bool {
    match try_generate_core(path, pid, crash_blob, &SessionOptions::default()) {
        Ok(_) => true,
        Err(e) => {
            tracing::error!("Light core generation failed: {}", e);
            false
        }
    }
}

/// Like [`generate_core`], with the error and the size of the file.
pub fn try_generate_core(
    path: &Path,
    pid: i32,
    crash_blob: &[u8],
    options: &SessionOptions,
) -> Result<usize, CoreError> {
    options.validate()?;
    let context = CrashContext::from_blob(crash_blob)?;
    diag::greet(pid, &context);

    let mut debugger = PtraceDebugger::new(pid, options.arena_capacity)?;
    debugger.set_crash_thread(context.tid, context.signal);
    debugger.init()?;

    write_file(path, pid, debugger, options, Some(&context))
}

/// Writes a light core of the running process `pid` at `path`. The first
/// thread goes first and no signal is recorded.
pub fn generate_live_core(path: &Path, pid: i32) -> bool {
    match try_generate_live_core(path, pid, &SessionOptions::default()) {
        Ok(_) => true,
        Err(e) => {
            tracing::error!("Light core generation failed: {}", e);
            false
        }
    }
}

/// Like [`generate_live_core`], with the error and the size of the file.
pub fn try_generate_live_core(
    path: &Path,
    pid: i32,
    options: &SessionOptions,
) -> Result<usize, CoreError> {
    options.validate()?;
    let mut debugger = PtraceDebugger::new(pid, options.arena_capacity)?;
    debugger.init()?;

    write_file(path, pid, debugger, options, None)
}

fn write_file(
    path: &Path,
    pid: i32,
    debugger: PtraceDebugger,
    options: &SessionOptions,
    context: Option<&CrashContext>,
) -> Result<usize, CoreError> {
    let output = OutputFile::create(path)?;
    let mut session = CrashSession::new(pid, debugger, output, options.clone());

    let result = session.run(context);
    drop(session);

    if result.is_err() && options.remove_partial_output {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove '{}': {}", path.display(), e);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::*;
    use crate::test_support::crash_blob;
    use crate::test_support::parse_core;
    use crate::test_support::FakeProcess;
    use zerocopy::FromBytes;

    fn options() -> SessionOptions {
        SessionOptions {
            page_size: 0x1000,
            ..Default::default()
        }
    }

    fn run(
        process: FakeProcess,
        options: SessionOptions,
        context: Option<&CrashContext>,
    ) -> (Result<usize, CoreError>, FakeProcess, Vec<u8>) {
        let mut session = CrashSession::new(
            FakeProcess::PID,
            process,
            OutputFile::new(Vec::new()),
            options,
        );
        let result = session.run(context);
        let (process, output) = session.into_parts();
        (result, process, output.into_inner())
    }

    #[test]
    fn defaults() {
        let options = SessionOptions::default();

        assert!(options.page_size.is_power_of_two());
        assert!(options.mask_threading_runtime);
        assert!(options.remove_partial_output);
        assert_eq!(options.max_stack_size, None);
        assert_eq!(options.include_vdso, cfg!(target_arch = "x86"));
    }

    #[test]
    fn single_threaded_crash() {
        let process = FakeProcess::single_threaded();
        let context = CrashContext::from_blob(&crash_blob(
            FakeProcess::PID,
            libc::SIGSEGV,
            FakeProcess::STACK_POINTER,
        ))
        .unwrap();

        let (result, process, bytes) = run(process, options(), Some(&context));
        let core = parse_core(&bytes);

        assert_eq!(result.unwrap(), bytes.len());
        assert_eq!((process.suspended, process.resumed), (1, 1));
        assert_eq!({ core.header.e_phnum }, 2);

        let types: Vec<u32> = core.notes.iter().map(|n| n.0).collect();
        assert_eq!(types, vec![NT_PRSTATUS, NT_PRPSINFO, NT_AUXV]);

        let info = prpsinfo_t::read_from_bytes(&core.notes[1].1).unwrap();
        assert_eq!(&info.pr_fname[..7], b"crashy\0");
        assert_eq!(&info.pr_psargs[..22], b"/usr/bin/crashy --fast");

        let stack = core.loads().next().unwrap();
        assert_eq!({ stack.p_vaddr } as usize, FakeProcess::STACK_BASE + 0x2000);
        assert_eq!({ stack.p_filesz }, 0x2000);
        assert_eq!(bytes.len(), 0x1000 + 0x2000);
    }

    #[test]
    fn modules_are_dumped_before_stacks() {
        let mut process = FakeProcess::single_threaded();
        process.install_modules(&["", "/lib/libpthread.so.0"]);

        let (result, _, bytes) = run(process, options(), None);
        result.unwrap();
        let core = parse_core(&bytes);

        let addresses: Vec<usize> = core.loads().map(|p| p.p_vaddr as usize).collect();
        assert_eq!(addresses[0], FakeProcess::DYNAMIC_ADDR);
        assert_eq!(addresses[1], FakeProcess::R_DEBUG_ADDR);
        assert_eq!(*addresses.last().unwrap(), FakeProcess::STACK_BASE + 0x2000);

        let masked = b"/lib/libathread.so.0\0";
        assert!(bytes.windows(masked.len()).any(|w| w == masked));
    }

    #[test]
    fn no_program_headers_still_writes_threads() {
        let mut process = FakeProcess::single_threaded();
        process.install_modules(&["/lib/libc.so.6"]);
        process.set_auxv(AT_PHNUM, 0);

        let (result, _, bytes) = run(process, options(), None);

        assert!(result.is_ok());
        assert_eq!({ parse_core(&bytes).header.e_phnum }, 2);
    }

    #[test]
    fn failed_read_resumes_the_threads() {
        let mut process = FakeProcess::single_threaded();
        process.fail_reads_at(FakeProcess::STACK_BASE + 0x3800);

        let (result, process, _) = run(process, options(), None);

        assert!(result.is_err());
        assert_eq!((process.suspended, process.resumed), (1, 1));
    }

    #[test]
    fn page_size_must_be_a_power_of_two() {
        for page_size in [0, 0x1800] {
            let options = SessionOptions {
                page_size,
                ..options()
            };

            let (result, process, bytes) = run(FakeProcess::single_threaded(), options, None);

            assert!(matches!(result, Err(CoreError::InternalError(_))));
            assert_eq!((process.suspended, process.resumed), (0, 0));
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn page_size_is_checked_before_attaching() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core");
        let options = SessionOptions {
            page_size: 0,
            ..options()
        };

        let err = try_generate_live_core(&path, i32::MAX, &options).unwrap_err();

        assert!(matches!(err, CoreError::InternalError(_)));
        assert!(!path.exists());
    }

    #[test]
    fn too_many_threads_for_the_arena() {
        let mut process = FakeProcess::single_threaded();
        for tid in 1..8000 {
            process.add_thread(FakeProcess::PID + tid, FakeProcess::STACK_POINTER);
        }

        let (result, process, _) = run(process, options(), None);

        assert!(matches!(result, Err(CoreError::ArenaExhausted { .. })));
        assert_eq!((process.suspended, process.resumed), (1, 1));
    }

    #[test]
    fn missing_proc_file_is_fatal() {
        let process = FakeProcess::single_threaded();
        std::fs::remove_file(process.proc_file(FakeProcess::PID, "auxv")).unwrap();

        let (result, process, _) = run(process, options(), None);

        assert!(matches!(result, Err(CoreError::IoError(_))));
        assert_eq!(process.resumed, 1);
    }

    #[test]
    fn vdso_when_asked() {
        let mut process = FakeProcess::single_threaded();
        process.map(0xb7ff_0000, &[0x90; 0x1000]);
        process.set_auxv(AT_SYSINFO_EHDR, 0xb7ff_0000);
        let options = SessionOptions {
            include_vdso: true,
            ..options()
        };

        let (result, _, bytes) = run(process, options, None);
        result.unwrap();
        let core = parse_core(&bytes);

        assert_eq!({ core.header.e_phnum }, 3);
        assert_eq!({ core.loads().last().unwrap().p_vaddr } as usize, 0xb7ff_0000);
    }

    #[test]
    fn runs_are_identical() {
        let mut first = FakeProcess::single_threaded();
        first.install_modules(&["", "/lib/libc.so.6"]);
        let mut second = FakeProcess::single_threaded();
        second.install_modules(&["", "/lib/libc.so.6"]);

        let (_, _, first) = run(first, options(), None);
        let (_, _, second) = run(second, options(), None);

        assert_eq!(first, second);
    }

    #[test]
    fn bad_blob_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core");

        assert!(!generate_core(&path, std::process::id() as i32, &[0; 3]));
        assert!(!path.exists());
    }

    #[test]
    fn dumping_itself_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core");

        let err = try_generate_live_core(&path, std::process::id() as i32, &options()).unwrap_err();

        assert!(matches!(err, CoreError::CantDumpItself));
        assert!(!path.exists());
    }
}
