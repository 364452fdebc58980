// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Layout and emission of the light core file.
//!
//! The file is the ELF header, the program headers (one `PT_NOTE`, then one
//! `PT_LOAD` per module region, per thread stack and for the vDSO), the
//! notes, zero padding up to a page boundary, and the payload of every
//! `PT_LOAD` segment in program header order.
//!
//! All offsets are computed before the first byte is written, the file is
//! then produced in a single sequential pass.

use crate::arch::Arch;
use crate::arch::NativeArch;
use crate::elf::*;
use crate::modules::ModuleEntry;
use crate::note::NoteRecord;
use crate::output::round_up;
use crate::output::OutputFile;
use crate::region::MemoryRegion;
use crate::threads::ThreadSnapshot;
use crate::CoreError;
use crate::ReadProcessMemory;
use crate::ScratchArena;
use std::io::Write;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// One piece of the file in front of the payload
#[derive(Clone, Copy, Debug)]
pub enum CoreRecord<'a> {
    /// The file header
    ElfHeader(ElfEhdr),
    /// Program header of the notes
    NoteSegment(ElfPhdr),
    /// Program header of one memory region
    LoadSegment(ElfPhdr),
    /// A note of the `PT_NOTE` segment
    Note(NoteRecord<'a>),
}

impl CoreRecord<'_> {
    /// Bytes taken in the file
    pub fn size(&self) -> usize {
        match self {
            CoreRecord::ElfHeader(_) => std::mem::size_of::<ElfEhdr>(),
            CoreRecord::NoteSegment(_) | CoreRecord::LoadSegment(_) => {
                std::mem::size_of::<ElfPhdr>()
            }
            CoreRecord::Note(note) => note.size(),
        }
    }

    /// Writes the record, returns the number of bytes written
    pub fn write_to<W: Write>(&self, out: &mut OutputFile<W>) -> Result<usize, CoreError> {
        match self {
            CoreRecord::ElfHeader(header) => out.write(header.as_bytes())?,
            CoreRecord::NoteSegment(phdr) | CoreRecord::LoadSegment(phdr) => {
                out.write(phdr.as_bytes())?
            }
            CoreRecord::Note(note) => return note.write_to(out),
        }

        Ok(self.size())
    }
}

/// File offsets of a light core file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreLayout {
    /// Program headers, the note segment included
    pub phnum: usize,
    /// Where the notes start, right after the program headers
    pub note_offset: usize,
    /// Size of the note segment
    pub note_size: usize,
    /// Where the first `PT_LOAD` payload starts, page aligned
    pub payload_offset: usize,
    /// Size of the whole file
    pub file_size: usize,
}

/// Everything that goes into one light core file.
pub struct CoreFileWriter<'a> {
    threads: &'a [ThreadSnapshot],
    modules: &'a [ModuleEntry<'a>],
    process_info: NoteRecord<'a>,
    auxv: NoteRecord<'a>,
    vdso: Option<MemoryRegion<'a>>,
    page_size: usize,
}

impl<'a> CoreFileWriter<'a> {
    /// `threads` starts with the crashed thread.
    pub fn new(
        threads: &'a [ThreadSnapshot],
        modules: &'a [ModuleEntry<'a>],
        process_info: NoteRecord<'a>,
        auxv: NoteRecord<'a>,
        vdso: Option<MemoryRegion<'a>>,
        page_size: usize,
    ) -> Self {
        Self {
            threads,
            modules,
            process_info,
            auxv,
            vdso,
            page_size,
        }
    }

    /// The crashed thread's status, the process info, the auxiliary vector,
    /// then the status of every other thread.
    pub fn notes(&self) -> impl Iterator<Item = NoteRecord<'a>> + '_ {
        let (first, rest) = match self.threads.split_first() {
            Some((first, rest)) => (Some(first), rest),
            None => (None, self.threads),
        };

        first
            .map(ThreadSnapshot::note)
            .into_iter()
            .chain([self.process_info, self.auxv])
            .chain(rest.iter().map(ThreadSnapshot::note))
    }

    /// Module regions, stacks, then the vDSO, in program header order.
    pub fn regions(&self) -> impl Iterator<Item = MemoryRegion<'a>> + '_ {
        self.modules
            .iter()
            .flat_map(ModuleEntry::regions)
            .chain(self.threads.iter().map(|t| t.stack()))
            .chain(self.vdso)
    }

    /// Offsets and sizes of the file to be written
    pub fn layout(&self) -> CoreLayout {
        let phnum = 1 + self.regions().count();
        let note_offset =
            std::mem::size_of::<ElfEhdr>() + phnum * std::mem::size_of::<ElfPhdr>();
        let note_size = self.notes().map(|n| n.size()).sum::<usize>();
        let payload_offset = round_up(note_offset + note_size, self.page_size);
        let file_size = payload_offset + self.regions().map(|r| r.size()).sum::<usize>();

        CoreLayout {
            phnum,
            note_offset,
            note_size,
            payload_offset,
            file_size,
        }
    }

    /// Writes the whole file and returns its size. Remote memory is copied
    /// one page at a time through a buffer taken from `arena`.
    pub fn emit<W: Write, R: ReadProcessMemory + ?Sized>(
        &self,
        out: &mut OutputFile<W>,
        reader: &R,
        arena: &ScratchArena,
    ) -> Result<usize, CoreError> {
        if !self.page_size.is_power_of_two() {
            return Err(CoreError::InternalError("page size is not a power of two"));
        }

        let layout = self.layout();
        tracing::debug!("Core file layout: {:x?}", layout);

        let start = out.position();

        tracing::info!("Writing ELF header at offset {}...", out.position());
        let written = CoreRecord::ElfHeader(elf_header(&layout)?).write_to(out)?;
        tracing::info!("Wrote {} bytes", written);

        tracing::info!("Writing program headers at offset {}...", out.position());
        let mut written = CoreRecord::NoteSegment(note_segment(&layout)).write_to(out)?;
        let mut offset = layout.payload_offset;
        for region in self.regions() {
            written += CoreRecord::LoadSegment(self.load_segment(&region, offset)).write_to(out)?;
            offset += region.size();
        }
        tracing::info!("Wrote {} bytes", written);

        if out.position() - start != layout.note_offset {
            return Err(CoreError::InternalError("program headers size mismatch"));
        }

        tracing::info!("Writing notes at offset {}...", out.position());
        let mut note_written = 0;
        for note in self.notes() {
            note_written += CoreRecord::Note(note).write_to(out)?;
        }
        tracing::info!("Wrote {} bytes", note_written);

        if note_written != layout.note_size {
            return Err(CoreError::InternalError("note segment size mismatch"));
        }

        out.pad(layout.payload_offset - (out.position() - start))?;

        tracing::info!("Writing memory content at offset {}...", out.position());
        let scratch = arena.alloc_bytes(self.page_size)?;
        let mut written = 0;
        for region in self.regions() {
            tracing::debug!(
                "Region [0x{:x}; 0x{:x}) at offset {}",
                region.address(),
                region.end(),
                out.position()
            );
            written += region.write_to(out, reader, scratch)?;
        }
        tracing::info!("Wrote {} bytes", written);

        out.flush()?;

        let total = out.position() - start;
        if total != layout.file_size {
            return Err(CoreError::InternalError("core file size mismatch"));
        }

        Ok(total)
    }

    fn load_segment(&self, region: &MemoryRegion<'_>, offset: usize) -> ElfPhdr {
        let mut phdr = ElfPhdr::new_zeroed();
        phdr.p_type = PT_LOAD;
        phdr.p_flags = PF_R | PF_W | PF_X;
        phdr.p_offset = offset as _;
        phdr.p_vaddr = region.address() as _;
        phdr.p_filesz = region.size() as _;
        phdr.p_memsz = region.size() as _;
        phdr.p_align = self.page_size as _;
        phdr
    }
}

fn elf_header(layout: &CoreLayout) -> Result<ElfEhdr, CoreError> {
    let phnum = u16::try_from(layout.phnum)
        .map_err(|_| CoreError::InternalError("too many program headers"))?;

    let mut header = ElfEhdr::new_zeroed();
    header.e_ident[EI_MAG0] = ELFMAG0;
    header.e_ident[EI_MAG1] = ELFMAG1;
    header.e_ident[EI_MAG2] = ELFMAG2;
    header.e_ident[EI_MAG3] = ELFMAG3;
    header.e_ident[EI_CLASS] = ELFCLASS_NATIVE;
    header.e_ident[EI_DATA] = ELFDATA2LSB;
    header.e_ident[EI_VERSION] = EV_CURRENT;
    header.e_ident[EI_OSABI] = ELFOSABI_LINUX;

    header.e_type = ET_CORE;
    header.e_machine = NativeArch::EM_ELF_MACHINE;
    header.e_version = EV_CURRENT as u32;
    header.e_phoff = std::mem::size_of::<ElfEhdr>() as _;
    header.e_ehsize = std::mem::size_of::<ElfEhdr>() as u16;
    header.e_phentsize = std::mem::size_of::<ElfPhdr>() as u16;
    header.e_phnum = phnum;

    Ok(header)
}

fn note_segment(layout: &CoreLayout) -> ElfPhdr {
    let mut phdr = ElfPhdr::new_zeroed();
    phdr.p_type = PT_NOTE;
    phdr.p_flags = PF_R;
    phdr.p_offset = layout.note_offset as _;
    phdr.p_filesz = layout.note_size as _;
    phdr.p_memsz = layout.note_size as _;
    phdr.p_align = 1;
    phdr
}
