// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process-wide notes and the vDSO.
//!
//! `NT_PRPSINFO` is built from `/proc/<pid>/cmdline`, `NT_AUXV` is the raw
//! content of `/proc/<pid>/auxv`. Both files are read into the scratch arena.

use crate::diag;
use crate::elf::prpsinfo_t;
use crate::elf::AT_SYSINFO;
use crate::elf::AT_SYSINFO_EHDR;
use crate::elf::NT_AUXV;
use crate::elf::NT_PRPSINFO;
use crate::linux::read_file_prefix;
use crate::note::NoteRecord;
use crate::region::MemoryRegion;
use crate::CoreError;
use crate::ProcessDebugger;
use std::ffi::OsStr;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Most bytes taken from a `/proc` file
pub const MAX_PROC_FILE_SIZE: usize = 4024;

const PROC_PATH_MAX: usize = 256;

// ELF_PRARGSZ
const PSARGS_LEN: usize = 80;

/// A path in `/proc` kept in a fixed buffer.
#[derive(Clone, Copy)]
pub struct ProcPath {
    buf: [u8; PROC_PATH_MAX],
    len: usize,
}

impl ProcPath {
    /// `/proc/<pid>/<leaf>`
    pub fn new(pid: i32, leaf: &str) -> Result<Self, CoreError> {
        Self::format(format_args!("/proc/{pid}/{leaf}"))
    }

    /// `/proc/<pid>/task/<tid>/<leaf>`
    pub fn task(pid: i32, tid: i32, leaf: &str) -> Result<Self, CoreError> {
        Self::format(format_args!("/proc/{pid}/task/{tid}/{leaf}"))
    }

    /// Copies an arbitrary path, e.g. into a directory standing in for `/proc`.
    pub fn from_path(path: &Path) -> Result<Self, CoreError> {
        let bytes = path.as_os_str().as_bytes();
        if bytes.len() > PROC_PATH_MAX {
            return Err(CoreError::ProcPathTooLong);
        }

        let mut buf = [0; PROC_PATH_MAX];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            buf,
            len: bytes.len(),
        })
    }

    fn format(args: std::fmt::Arguments<'_>) -> Result<Self, CoreError> {
        let mut buf = [0; PROC_PATH_MAX];
        let left = {
            let mut cursor = &mut buf[..];
            cursor
                .write_fmt(args)
                .map_err(|_| CoreError::ProcPathTooLong)?;
            cursor.len()
        };

        Ok(Self {
            buf,
            len: PROC_PATH_MAX - left,
        })
    }

    /// The path
    pub fn as_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(&self.buf[..self.len]))
    }
}

impl std::fmt::Debug for ProcPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_path().fmt(f)
    }
}

/// Reads the beginning of `/proc/<pid>/<leaf>` into `buf`. An empty file is
/// as fatal as a missing one.
pub(crate) fn read_proc_file<D: ProcessDebugger + ?Sized>(
    debugger: &D,
    pid: i32,
    leaf: &'static str,
    buf: &mut [u8],
) -> Result<usize, CoreError> {
    let path = debugger.build_proc_path(pid, leaf)?;
    tracing::debug!("Reading {:?}", path);

    match read_file_prefix(path.as_path(), buf) {
        Ok(0) => {
            diag::read_failed(path.as_path());
            Err(CoreError::EmptyProcFile(leaf))
        }
        Ok(n) => Ok(n),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            diag::open_failed(path.as_path(), &e);
            Err(CoreError::IoError(e))
        }
        Err(e) => {
            diag::read_failed(path.as_path());
            Err(CoreError::IoError(e))
        }
    }
}

/// The `NT_PRPSINFO` note
pub struct ProcessInfoNote {
    info: prpsinfo_t,
}

impl ProcessInfoNote {
    /// Builds the note from `/proc/<pid>/cmdline`.
    pub fn read<D: ProcessDebugger + ?Sized>(debugger: &D, pid: i32) -> Result<Self, CoreError> {
        let cmdline = debugger.allocator().alloc_bytes(MAX_PROC_FILE_SIZE)?;
        let len = read_proc_file(debugger, pid, "cmdline", cmdline)?;
        Ok(Self::from_cmdline(pid, &cmdline[..len]))
    }

    /// Fills the record the way the kernel does: `pr_psargs` holds the
    /// command line with the argument separators shown as spaces and
    /// `pr_fname` the base name of the program.
    pub(crate) fn from_cmdline(pid: i32, cmdline: &[u8]) -> Self {
        let mut info = prpsinfo_t::new_zeroed();
        info.pr_pid = pid as u32;

        let mut args = &cmdline[..cmdline.len().min(PSARGS_LEN)];
        while let [rest @ .., 0] = args {
            args = rest;
        }
        for (dst, &src) in info.pr_psargs.iter_mut().zip(args) {
            *dst = if src == 0 { b' ' } else { src };
        }

        let argv0 = cmdline.split(|&b| b == 0).next().unwrap_or_default();
        let name = argv0.rsplit(|&b| b == b'/').next().unwrap_or_default();
        let len = name.len().min(info.pr_fname.len() - 1);
        info.pr_fname[..len].copy_from_slice(&name[..len]);

        Self { info }
    }

    /// The `NT_PRPSINFO` note
    pub fn note(&self) -> NoteRecord<'_> {
        NoteRecord::new(NT_PRPSINFO, self.info.as_bytes())
    }
}

/// The `NT_AUXV` note, copied verbatim
pub struct AuxVectorNote<'a> {
    data: &'a [u8],
}

impl<'a> AuxVectorNote<'a> {
    /// Copies `/proc/<pid>/auxv` into the scratch arena.
    pub fn read<D: ProcessDebugger + ?Sized>(debugger: &'a D, pid: i32) -> Result<Self, CoreError> {
        let buf = debugger.allocator().alloc_bytes(MAX_PROC_FILE_SIZE)?;
        let len = read_proc_file(debugger, pid, "auxv", &mut *buf)?;

        let data: &'a [u8] = buf;
        Ok(Self { data: &data[..len] })
    }

    /// The `NT_AUXV` note
    pub fn note(&self) -> NoteRecord<'a> {
        NoteRecord::new(NT_AUXV, self.data)
    }
}

/// Finds the mapping of the vDSO. Not finding it only costs the segment.
pub fn locate_vdso<D: ProcessDebugger + ?Sized>(debugger: &D) -> Option<MemoryRegion<'static>> {
    let address = match debugger.auxv(AT_SYSINFO) {
        0 => debugger.auxv(AT_SYSINFO_EHDR),
        address => address,
    };
    if address == 0 {
        diag::say("vDSO is not found in the auxiliary vector");
        return None;
    }

    match debugger.find_mapping(address) {
        Some(mapping) => {
            tracing::debug!(
                "vDSO at [0x{:x}; 0x{:x})",
                mapping.start_addr,
                mapping.end_addr()
            );
            Some(MemoryRegion::remote(
                mapping.start_addr,
                mapping.size,
                debugger.crash_thread(),
            ))
        }
        None => {
            diag::say("vDSO mapping is not found");
            None
        }
    }
}
