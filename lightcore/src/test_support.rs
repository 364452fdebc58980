// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory process for the unit tests.

use crate::arch::elf_gregset_t;
use crate::elf::ElfDyn;
use crate::elf::ElfEhdr;
use crate::elf::ElfPhdr;
use crate::elf::Elf_Nhdr;
use crate::elf::LinkMap;
use crate::elf::RDebug;
use crate::elf::AT_PHDR;
use crate::elf::AT_PHNUM;
use crate::elf::DT_DEBUG;
use crate::elf::DT_NULL;
use crate::elf::PT_DYNAMIC;
use crate::elf::PT_LOAD;
use crate::elf::PT_NOTE;
use crate::elf::PT_PHDR;
use crate::CoreError;
use crate::MappingInfo;
use crate::ProcPath;
use crate::ProcessDebugger;
use crate::RawCrashContext;
use crate::ReadProcessMemory;
use crate::ScratchArena;
use crate::ThreadInfo;
use std::cell::Cell;
use std::path::PathBuf;
use std::ptr::addr_of_mut;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

// `libc` does not export `gregset_t`; this is the type of `mcontext_t::gregs`.
#[cfg(target_arch = "x86_64")]
type Gregset = [libc::greg_t; 23];
#[cfg(target_arch = "x86")]
type Gregset = [libc::greg_t; 19];

/// A serialized crash context
pub(crate) fn crash_blob(tid: i32, signal: i32, stack_pointer: usize) -> Vec<u8> {
    let mut blob = vec![0u8; std::mem::size_of::<RawCrashContext>()];
    let raw = blob.as_mut_ptr() as *mut RawCrashContext;

    // SAFETY: the buffer is exactly one (unaligned) RawCrashContext.
    unsafe {
        addr_of_mut!((*raw).tid).write_unaligned(tid);
        addr_of_mut!((*raw).siginfo.si_signo).write_unaligned(signal);

        let mut gregs: Gregset = std::mem::zeroed();
        #[cfg(target_arch = "x86_64")]
        {
            gregs[libc::REG_RSP as usize] = stack_pointer as i64;
        }
        #[cfg(target_arch = "x86")]
        {
            gregs[libc::REG_ESP as usize] = stack_pointer as i32;
        }
        addr_of_mut!((*raw).context.uc_mcontext.gregs).write_unaligned(gregs);
    }

    blob
}

/// Registers of a thread stopped with `stack_pointer`
pub(crate) fn regs_with_sp(stack_pointer: usize) -> elf_gregset_t {
    #[cfg(target_arch = "x86_64")]
    let regs = elf_gregset_t {
        rsp: stack_pointer as u64,
        rip: 0x0804_9000,
        ..Default::default()
    };
    #[cfg(target_arch = "x86")]
    let regs = elf_gregset_t {
        esp: stack_pointer as u32,
        eip: 0x0804_9000,
        ..Default::default()
    };
    regs
}

pub(crate) struct FakeProcess {
    chunks: Vec<(usize, Vec<u8>)>,
    reads: Cell<usize>,
    fail_at: Option<usize>,
    threads: Vec<i32>,
    infos: Vec<ThreadInfo>,
    auxv: Vec<(usize, usize)>,
    crash_thread: i32,
    crash_signal: i32,
    proc_dir: tempfile::TempDir,
    arena: ScratchArena,
    pub suspended: usize,
    pub resumed: usize,
}

impl FakeProcess {
    pub const PID: i32 = 1000;
    pub const STACK_BASE: usize = 0xbf00_0000;
    pub const STACK_SIZE: usize = 0x4000;
    pub const STACK_POINTER: usize = Self::STACK_BASE + 0x2a10;

    pub const IMAGE_BASE: usize = 0x0804_8000;
    pub const PHDR_ADDR: usize = Self::IMAGE_BASE + 0x40;
    pub const DYNAMIC_ADDR: usize = Self::IMAGE_BASE + 0x2000;
    pub const R_DEBUG_ADDR: usize = 0x0900_0000;
    pub const LINK_MAP_ADDR: usize = Self::R_DEBUG_ADDR + 0x100;
    pub const NAMES_ADDR: usize = 0x0a00_0000;

    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            reads: Cell::new(0),
            fail_at: None,
            threads: Vec::new(),
            infos: Vec::new(),
            auxv: Vec::new(),
            crash_thread: 0,
            crash_signal: 0,
            proc_dir: tempfile::tempdir().unwrap(),
            arena: ScratchArena::with_capacity(1 << 20).unwrap(),
            suspended: 0,
            resumed: 0,
        }
    }

    /// One thread crashed with `SIGSEGV`, a stack and the two `/proc` files,
    /// no modules.
    pub fn single_threaded() -> Self {
        let mut process = Self::new();

        let stack: Vec<u8> = (0..Self::STACK_SIZE).map(|i| (i * 3) as u8).collect();
        process.map(Self::STACK_BASE, &stack);
        process.add_thread(Self::PID, Self::STACK_POINTER);
        process.set_crash(Self::PID, libc::SIGSEGV);

        process.write_proc_file(Self::PID, "cmdline", b"/usr/bin/crashy\0--fast\0");
        let auxv: [usize; 4] = [6, 0x1000, 0, 0];
        process.write_proc_file(Self::PID, "auxv", auxv.as_bytes());

        process
    }

    pub fn map(&mut self, address: usize, data: &[u8]) {
        self.chunks.push((address, data.to_vec()));
    }

    /// Overwrites bytes of an already mapped chunk.
    pub fn poke(&mut self, address: usize, data: &[u8]) {
        let (start, chunk) = self
            .chunks
            .iter_mut()
            .find(|(start, chunk)| *start <= address && address + data.len() <= *start + chunk.len())
            .unwrap();
        let offset = address - *start;
        chunk[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    pub fn fail_reads_at(&mut self, address: usize) {
        self.fail_at = Some(address);
    }

    pub fn add_thread(&mut self, tid: i32, stack_pointer: usize) {
        self.threads.push(tid);
        self.infos.push(ThreadInfo {
            tgid: Self::PID,
            ppid: 1,
            regs: regs_with_sp(stack_pointer),
            stack_pointer,
        });
    }

    pub fn set_crash(&mut self, tid: i32, signal: i32) {
        self.crash_thread = tid;
        self.crash_signal = signal;
    }

    pub fn set_auxv(&mut self, a_type: usize, value: usize) {
        self.auxv.retain(|(t, _)| *t != a_type);
        self.auxv.push((a_type, value));
    }

    pub fn proc_file(&self, pid: i32, leaf: &str) -> PathBuf {
        self.proc_dir.path().join(pid.to_string()).join(leaf)
    }

    pub fn write_proc_file(&self, pid: i32, leaf: &str, data: &[u8]) {
        let path = self.proc_file(pid, leaf);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    /// Lays out program headers, `.dynamic`, `r_debug` and one link-map node
    /// per path, and points the auxiliary vector at them.
    pub fn install_modules(&mut self, paths: &[&str]) {
        let dyn_size = std::mem::size_of::<ElfDyn>();

        let mut phdrs = [ElfPhdr::new_zeroed(); 3];
        phdrs[0].p_type = PT_PHDR;
        phdrs[0].p_offset = 0x40;
        phdrs[0].p_vaddr = 0x40;
        phdrs[1].p_type = PT_LOAD;
        phdrs[1].p_memsz = 0x3000;
        phdrs[2].p_type = PT_DYNAMIC;
        phdrs[2].p_offset = 0x2000;
        phdrs[2].p_vaddr = 0x2000;
        phdrs[2].p_memsz = (4 * dyn_size) as _;

        self.map(Self::IMAGE_BASE, &[0; 0x3000]);
        self.poke(Self::PHDR_ADDR, phdrs.as_bytes());

        let dynamic = [
            ElfDyn { d_tag: 1, d_val: 5 },
            ElfDyn {
                d_tag: DT_DEBUG,
                d_val: Self::R_DEBUG_ADDR,
            },
            ElfDyn {
                d_tag: DT_NULL,
                d_val: 0,
            },
            ElfDyn {
                d_tag: DT_DEBUG,
                d_val: 0xdead,
            },
        ];
        self.poke(Self::DYNAMIC_ADDR, dynamic.as_bytes());

        let node_size = std::mem::size_of::<LinkMap>();
        self.map(Self::R_DEBUG_ADDR, &[0; 0x2000]);
        let r_debug = RDebug {
            r_version: 1,
            r_map: if paths.is_empty() { 0 } else { Self::LINK_MAP_ADDR },
            r_brk: 0x0804_9100,
            r_state: 0,
            r_ldbase: 0xb7f0_0000,
        };
        self.poke(Self::R_DEBUG_ADDR, r_debug.as_bytes());

        self.map(Self::NAMES_ADDR, &vec![0; (paths.len() + 1) * 0x100]);
        for (i, path) in paths.iter().enumerate() {
            let node = LinkMap {
                l_addr: 0x0b00_0000 + i * 0x10_0000,
                l_name: Self::NAMES_ADDR + i * 0x100,
                l_ld: 0,
                l_next: if i + 1 < paths.len() {
                    Self::LINK_MAP_ADDR + (i + 1) * node_size
                } else {
                    0
                },
                l_prev: if i > 0 {
                    Self::LINK_MAP_ADDR + (i - 1) * node_size
                } else {
                    0
                },
            };
            self.poke(Self::LINK_MAP_ADDR + i * node_size, node.as_bytes());
            self.poke(Self::NAMES_ADDR + i * 0x100, path.as_bytes());
        }

        self.set_auxv(AT_PHDR, Self::PHDR_ADDR);
        self.set_auxv(AT_PHNUM, phdrs.len());
    }
}

impl ReadProcessMemory for FakeProcess {
    fn read_process_memory(
        &self,
        _tid: i32,
        base: usize,
        buf: &mut [u8],
    ) -> Result<usize, CoreError> {
        self.reads.set(self.reads.get() + 1);

        if let Some(address) = self.fail_at {
            if base <= address && address < base + buf.len() {
                return Err(CoreError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected failure",
                )));
            }
        }

        let (start, chunk) = self
            .chunks
            .iter()
            .find(|(start, chunk)| *start <= base && base < *start + chunk.len())
            .ok_or(CoreError::NixError(nix::Error::EFAULT))?;

        let offset = base - start;
        let len = buf.len().min(chunk.len() - offset);
        buf[..len].copy_from_slice(&chunk[offset..offset + len]);
        Ok(len)
    }
}

impl ProcessDebugger for FakeProcess {
    fn init(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    fn suspend_threads(&mut self) -> Result<(), CoreError> {
        self.suspended += 1;
        Ok(())
    }

    fn resume_threads(&mut self) -> Result<(), CoreError> {
        self.resumed += 1;
        Ok(())
    }

    fn threads(&self) -> &[i32] {
        &self.threads
    }

    fn thread_info_by_index(&self, index: usize) -> Result<ThreadInfo, CoreError> {
        self.infos
            .get(index)
            .copied()
            .ok_or(CoreError::NoSuchThread(index))
    }

    fn find_mapping(&self, address: usize) -> Option<MappingInfo> {
        self.chunks
            .iter()
            .map(|(start, chunk)| MappingInfo {
                start_addr: *start,
                size: chunk.len(),
                offset: 0,
            })
            .find(|m| m.contains(address))
    }

    fn build_proc_path(&self, pid: i32, leaf: &str) -> Result<ProcPath, CoreError> {
        ProcPath::from_path(&self.proc_file(pid, leaf))
    }

    fn auxv(&self, a_type: usize) -> usize {
        self.auxv
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

/// A light core file taken apart
pub(crate) struct ParsedCore {
    pub header: ElfEhdr,
    pub phdrs: Vec<ElfPhdr>,
    pub notes: Vec<(u32, Vec<u8>)>,
}

impl ParsedCore {
    pub fn loads(&self) -> impl Iterator<Item = &ElfPhdr> {
        self.phdrs.iter().filter(|p| p.p_type == PT_LOAD)
    }
}

pub(crate) fn parse_core(bytes: &[u8]) -> ParsedCore {
    let (header, _) = ElfEhdr::read_from_prefix(bytes).unwrap();

    let phdr_size = std::mem::size_of::<ElfPhdr>();
    let phdrs: Vec<ElfPhdr> = (0..header.e_phnum as usize)
        .map(|i| {
            let offset = header.e_phoff as usize + i * phdr_size;
            ElfPhdr::read_from_prefix(&bytes[offset..]).unwrap().0
        })
        .collect();

    let mut notes = Vec::new();
    if let Some(segment) = phdrs.iter().find(|p| p.p_type == PT_NOTE) {
        let mut offset = segment.p_offset as usize;
        let end = offset + segment.p_filesz as usize;
        while offset < end {
            let (nhdr, _) = Elf_Nhdr::read_from_prefix(&bytes[offset..]).unwrap();
            let desc_start = offset + 12 + (nhdr.namesz as usize).div_ceil(4) * 4;
            let desc_end = desc_start + nhdr.descsz as usize;
            assert_eq!(&bytes[offset + 12..offset + 17], b"CORE\0");
            notes.push((nhdr.ntype, bytes[desc_start..desc_end].to_vec()));
            offset = desc_start + (nhdr.descsz as usize).div_ceil(4) * 4;
        }
    }

    ParsedCore {
        header,
        phdrs,
        notes,
    }
}
