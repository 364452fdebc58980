// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! ELF constants. There is the `object` crate that is pretty large.
//! Need a tiny portion of ELF specification as the code runs after a crash
//! in a very constrained environment.
//!
//! Host and target share the architecture, so the native-width records
//! (`ElfEhdr`, `ElfPhdr`, `ElfDyn`, `RDebug`, `LinkMap`) alias the 32 or 64-bit
//! layout picked at build time.

#![allow(non_camel_case_types)]

use super::arch;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const EI_MAG0: usize = 0;
pub const EI_MAG1: usize = 1;
pub const EI_MAG2: usize = 2;
pub const EI_MAG3: usize = 3;
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const EI_VERSION: usize = 6;
pub const EI_OSABI: usize = 7;

pub const ELFMAG0: u8 = 0x7f;
pub const ELFMAG1: u8 = b'E';
pub const ELFMAG2: u8 = b'L';
pub const ELFMAG3: u8 = b'F';

/// ELF version
pub const EV_CURRENT: u8 = 1;

/// Core file
pub const ET_CORE: u16 = 4;
/// 32-bit objects
#[cfg_attr(target_pointer_width = "64", allow(dead_code))]
pub const ELFCLASS32: u8 = 1;
/// 64-bit objects
#[cfg_attr(target_pointer_width = "32", allow(dead_code))]
pub const ELFCLASS64: u8 = 2;
/// Endianness
pub const ELFDATA2LSB: u8 = 1;
/// Linux ABI
pub const ELFOSABI_LINUX: u8 = 3;

/// Loadable program segment
pub const PT_LOAD: u32 = 1;
/// Dynamic linking information
pub const PT_DYNAMIC: u32 = 2;
/// Auxiliary information
pub const PT_NOTE: u32 = 4;
/// Location of the program header table itself
pub const PT_PHDR: u32 = 6;

pub const PF_X: u32 = 1 << 0;
pub const PF_W: u32 = 1 << 1;
pub const PF_R: u32 = 1 << 2;

/// Marks the end of the dynamic section
pub const DT_NULL: isize = 0;
/// Holds the address of `r_debug` at run time
pub const DT_DEBUG: isize = 21;

// Auxiliary vector types, from auxvec.h

/// Program headers of the executable
pub const AT_PHDR: usize = 3;
/// Number of program headers
pub const AT_PHNUM: usize = 5;
/// Entry point into the vDSO (x86 only)
pub const AT_SYSINFO: usize = 32;
/// Base of the vDSO image
pub const AT_SYSINFO_EHDR: usize = 33;

// ELF note types

/// Program status note
pub const NT_PRSTATUS: u32 = 1;
/// Program information note
pub const NT_PRPSINFO: u32 = 3;
/// Auxiliary vector note
pub const NT_AUXV: u32 = 6;

#[cfg(target_pointer_width = "64")]
type pr_uid_t = u32;
#[cfg(target_pointer_width = "32")]
type pr_uid_t = u16;

/// Program information
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy)]
#[repr(C)]
pub struct prpsinfo_t {
    // total size (bytes):  136 (x86_64), 124 (i386)
    pub pr_state: u8,
    pub pr_sname: u8,
    pub pr_zomb: u8,
    pub pr_nice: u8,
    #[cfg(target_pointer_width = "64")]
    pub pad0: u32,
    pub pr_flag: usize,
    pub pr_uid: pr_uid_t,
    pub pr_gid: pr_uid_t,
    pub pr_pid: u32,
    pub pr_ppid: u32,
    pub pr_pgrp: u32,
    pub pr_sid: u32,
    pub pr_fname: [u8; 16],
    pub pr_psargs: [u8; 80],
}

/// Kernel time value
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy)]
#[repr(C)]
pub struct pr_timeval_t {
    pub tv_sec: usize,
    pub tv_usec: usize,
}

/// Program status
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy)]
#[repr(C)]
pub struct prstatus_t {
    // total size (bytes):  336 (x86_64), 144 (i386)
    pub si_signo: u32,
    pub si_code: u32,
    pub si_errno: u32,
    pub pr_cursig: u16,
    pub pad0: u16,
    pub pr_sigpend: usize,
    pub pr_sighold: usize,
    pub pr_pid: u32,
    pub pr_ppid: u32,
    pub pr_pgrp: u32,
    pub pr_sid: u32,
    pub pr_utime: pr_timeval_t,
    pub pr_stime: pr_timeval_t,
    pub pr_cutime: pr_timeval_t,
    pub pr_cstime: pr_timeval_t,
    pub pr_reg: arch::elf_gregset_t,
    pub pr_fpvalid: u32,
    #[cfg(target_pointer_width = "64")]
    pub pad1: u32,
}

/// ELF note header
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct Elf_Nhdr {
    pub namesz: u32,
    pub descsz: u32,
    pub ntype: u32,
}

/// ELF header
#[cfg_attr(target_pointer_width = "32", allow(dead_code))]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct Elf64_Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF program header
#[cfg_attr(target_pointer_width = "32", allow(dead_code))]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct Elf64_Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// ELF header, 32-bit class
#[cfg_attr(target_pointer_width = "64", allow(dead_code))]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct Elf32_Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF program header, 32-bit class
#[cfg_attr(target_pointer_width = "64", allow(dead_code))]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct Elf32_Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

#[cfg(target_pointer_width = "64")]
pub type ElfEhdr = Elf64_Ehdr;
#[cfg(target_pointer_width = "64")]
pub type ElfPhdr = Elf64_Phdr;
#[cfg(target_pointer_width = "64")]
pub const ELFCLASS_NATIVE: u8 = ELFCLASS64;

#[cfg(target_pointer_width = "32")]
pub type ElfEhdr = Elf32_Ehdr;
#[cfg(target_pointer_width = "32")]
pub type ElfPhdr = Elf32_Phdr;
#[cfg(target_pointer_width = "32")]
pub const ELFCLASS_NATIVE: u8 = ELFCLASS32;

/// Dynamic section entry
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct ElfDyn {
    pub d_tag: isize,
    pub d_val: usize,
}

/// The dynamic linker rendezvous structure, `struct r_debug` from <link.h>.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct RDebug {
    // An int followed by padding on 64-bit targets.
    pub r_version: usize,
    pub r_map: usize,
    pub r_brk: usize,
    // An enum followed by padding on 64-bit targets.
    pub r_state: usize,
    pub r_ldbase: usize,
}

/// The public part of `struct link_map` from <link.h>.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct LinkMap {
    pub l_addr: usize,
    pub l_name: usize,
    pub l_ld: usize,
    pub l_next: usize,
    pub l_prev: usize,
}
