// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The dynamic linker's module list.
//!
//! The walk starts at the program headers named by the auxiliary vector,
//! follows `PT_DYNAMIC` to the `DT_DEBUG` entry and from there the `r_map`
//! list of `struct link_map` nodes. Every structure on the way is dumped so a
//! debugger can repeat the same walk on the core file.
//!
//! A process without `PT_DYNAMIC` or `DT_DEBUG` (e.g. statically linked) just
//! has fewer entries; a failed remote read anywhere in the walk is fatal.

use crate::arena::ArenaVec;
use crate::diag;
use crate::elf::ElfDyn;
use crate::elf::ElfPhdr;
use crate::elf::LinkMap;
use crate::elf::RDebug;
use crate::elf::AT_PHDR;
use crate::elf::AT_PHNUM;
use crate::elf::DT_DEBUG;
use crate::elf::DT_NULL;
use crate::elf::PT_DYNAMIC;
use crate::elf::PT_LOAD;
use crate::elf::PT_PHDR;
use crate::region::read_exact;
use crate::region::read_value;
use crate::region::MemoryRegion;
use crate::CoreError;
use crate::ProcessDebugger;
use std::mem::size_of;

/// Bound on the nodes followed, a corrupted list may be circular.
pub const MAX_LINK_MAP_NODES: usize = 1024;

/// Path strings are cut to this length, terminating NUL included.
const MAX_PATH_LEN: usize = 256;

// Program headers are at most PN_XNUM.
const MAX_PHNUM: usize = 0xffff;

/// What a module entry stands for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleEntryKind {
    /// The `.dynamic` section of the executable
    Dynamic,
    /// The `r_debug` rendezvous structure
    Debug,
    /// One loaded object
    LinkMap,
}

/// One structure of the module list and the memory dumped for it.
#[derive(Clone, Copy, Debug)]
pub struct ModuleEntry<'a> {
    /// What the entry stands for
    pub kind: ModuleEntryKind,
    /// Address of the structure in the target
    pub address: usize,
    /// Load bias of the object (`l_addr`), or of the executable for the
    /// synthetic entries
    pub load_bias: usize,
    /// The structure itself
    pub node: MemoryRegion<'a>,
    /// The path string, placed at `l_name`
    pub path: Option<MemoryRegion<'a>>,
}

impl<'a> ModuleEntry<'a> {
    /// The node, then its path
    pub fn regions(&self) -> impl Iterator<Item = MemoryRegion<'a>> {
        std::iter::once(self.node).chain(self.path)
    }

    /// The path without its terminating NUL
    pub fn path_bytes(&self) -> Option<&'a [u8]> {
        match self.path?.source() {
            crate::RegionSource::Local(bytes) => Some(bytes.strip_suffix(b"\0").unwrap_or(bytes)),
            crate::RegionSource::Remote { .. } => None,
        }
    }
}

/// Module entries in traversal order
pub struct ModuleList<'a> {
    entries: ArenaVec<'a, ModuleEntry<'a>>,
}

impl<'a> ModuleList<'a> {
    /// The entries, `.dynamic` and `r_debug` first
    pub fn entries(&self) -> &[ModuleEntry<'a>] {
        self.entries.as_slice()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the process has no dynamic linker data
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every region to dump, each node followed by its path
    pub fn regions(&self) -> impl Iterator<Item = MemoryRegion<'a>> + '_ {
        self.entries.iter().flat_map(ModuleEntry::regions)
    }
}

/// Follows the dynamic linker structures of a stopped process.
pub struct ModuleWalker<'a, D: ProcessDebugger + ?Sized> {
    debugger: &'a D,
    tid: i32,
    page_size: usize,
    mask_threading_runtime: bool,
}

impl<'a, D: ProcessDebugger + ?Sized> ModuleWalker<'a, D> {
    /// Reads through `debugger` as its crashed thread.
    pub fn new(debugger: &'a D, page_size: usize, mask_threading_runtime: bool) -> Self {
        Self {
            debugger,
            tid: debugger.crash_thread(),
            page_size,
            mask_threading_runtime,
        }
    }

    /// Lists the module entries. A process without program headers or
    /// `.dynamic` yields an empty list.
    pub fn walk(&self) -> Result<ModuleList<'a>, CoreError> {
        if !self.page_size.is_power_of_two() {
            return Err(CoreError::InternalError("page size is not a power of two"));
        }

        let arena = self.debugger.allocator();
        let mut list = ModuleList {
            entries: arena.vec(MAX_LINK_MAP_NODES + 2)?,
        };

        let phdr_addr = self.debugger.auxv(AT_PHDR);
        let phnum = self.debugger.auxv(AT_PHNUM);
        if phdr_addr == 0 || phnum == 0 || phnum > MAX_PHNUM {
            diag::say("program headers are not found in the auxiliary vector");
            return Ok(list);
        }

        let mut phdrs = arena.vec::<ElfPhdr>(phnum)?;
        for i in 0..phnum {
            phdrs.push(read_value(
                self.debugger,
                self.tid,
                phdr_addr + i * size_of::<ElfPhdr>(),
            )?)?;
        }

        let load_bias = self.load_bias(phdr_addr, &phdrs);
        tracing::debug!("Load bias of the executable 0x{:x}", load_bias);

        let dynamic = match phdrs
            .iter()
            .find(|p| p.p_type == PT_DYNAMIC && p.p_vaddr != 0)
        {
            Some(dynamic) => dynamic,
            None => {
                diag::say("PT_DYNAMIC is not found, no modules");
                return Ok(list);
            }
        };

        let dyn_addr = load_bias.wrapping_add(dynamic.p_vaddr as usize);
        let dyn_size = dynamic.p_memsz as usize;
        list.entries.push(ModuleEntry {
            kind: ModuleEntryKind::Dynamic,
            address: dyn_addr,
            load_bias,
            node: MemoryRegion::remote(dyn_addr, dyn_size, self.tid),
            path: None,
        })?;

        let debug_addr = self.find_debug(dyn_addr, dyn_size)?;
        if debug_addr == 0 {
            diag::say("DT_DEBUG is not found, no modules");
            return Ok(list);
        }

        let r_debug: RDebug = read_value(self.debugger, self.tid, debug_addr)?;
        list.entries.push(ModuleEntry {
            kind: ModuleEntryKind::Debug,
            address: debug_addr,
            load_bias,
            node: MemoryRegion::remote(debug_addr, size_of::<RDebug>(), self.tid),
            path: None,
        })?;

        let mut node_addr = r_debug.r_map;
        let mut visited = 0;
        while node_addr != 0 {
            if visited == MAX_LINK_MAP_NODES {
                diag::say("link map list is too long, the rest is skipped");
                break;
            }

            let node: LinkMap = read_value(self.debugger, self.tid, node_addr)?;
            let path = match node.l_name {
                0 => None,
                name => Some(self.read_path(name)?),
            };

            list.entries.push(ModuleEntry {
                kind: ModuleEntryKind::LinkMap,
                address: node_addr,
                load_bias: node.l_addr,
                node: MemoryRegion::remote(node_addr, size_of::<LinkMap>(), self.tid),
                path,
            })?;

            node_addr = node.l_next;
            visited += 1;
        }

        tracing::debug!("Found {} link map nodes", visited);

        Ok(list)
    }

    fn load_bias(&self, phdr_addr: usize, phdrs: &[ElfPhdr]) -> usize {
        if let Some(phdr) = phdrs.iter().find(|p| p.p_type == PT_PHDR) {
            return phdr_addr.wrapping_sub(phdr.p_vaddr as usize);
        }

        // The headers are assumed to sit in the first page of the image.
        match phdrs
            .iter()
            .find(|p| p.p_type == PT_LOAD && p.p_offset == 0)
        {
            Some(load) => (phdr_addr & !(self.page_size - 1)).wrapping_sub(load.p_vaddr as usize),
            None => 0,
        }
    }

    fn find_debug(&self, dyn_addr: usize, dyn_size: usize) -> Result<usize, CoreError> {
        for i in 0..dyn_size / size_of::<ElfDyn>() {
            let entry: ElfDyn =
                read_value(self.debugger, self.tid, dyn_addr + i * size_of::<ElfDyn>())?;
            match entry.d_tag {
                DT_NULL => break,
                DT_DEBUG => return Ok(entry.d_val),
                _ => {}
            }
        }

        Ok(0)
    }

    /// Reads the string at `address` without crossing into a page past its
    /// terminator, and keeps a patched copy in the arena.
    fn read_path(&self, address: usize) -> Result<MemoryRegion<'a>, CoreError> {
        let mut buf = [0_u8; MAX_PATH_LEN];
        let mut len = 0;
        let mut nul = None;

        while len < MAX_PATH_LEN {
            let current = address + len;
            let page_left = self.page_size - (current & (self.page_size - 1));
            let chunk = page_left.min(MAX_PATH_LEN - len);

            let bytes = &mut buf[len..len + chunk];
            read_exact(self.debugger, self.tid, current, bytes)?;
            if let Some(pos) = bytes.iter().position(|&b| b == 0) {
                nul = Some(len + pos);
                break;
            }
            len += chunk;
        }

        let end = nul.unwrap_or(MAX_PATH_LEN - 1);
        buf[end] = 0;
        if self.mask_threading_runtime {
            mask_threading_runtime(&mut buf[..end]);
        }

        let path = self.debugger.allocator().alloc_copy(&buf[..=end])?;
        Ok(MemoryRegion::local(address, path))
    }
}

/// Renames `libpthread.so*` to `libathread.so*` so the threading runtime the
/// process actually ran with is not confused with the system library of the
/// same name when the core is loaded.
pub(crate) fn mask_threading_runtime(path: &mut [u8]) {
    let name_start = path
        .iter()
        .rposition(|&b| b == b'/')
        .map_or(0, |slash| slash + 1);

    if path[name_start..].starts_with(b"libpthread.so") {
        path[name_start + 3] = b'a';
    }
}
