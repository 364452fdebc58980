// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! ELF notes.

use crate::elf::Elf_Nhdr;
use crate::output::round_up;
use crate::output::OutputFile;
use crate::CoreError;
use std::io::Write;
use zerocopy::IntoBytes;

const ELF_NOTE_PADDING: usize = 4;

// ELF-64 Object File Format, Version 1.5 claims the terminating zero is not
// required but readelf and gdb refuse to read the note otherwise.
const NOTE_NAME: &[u8] = b"CORE\0";

/// One typed blob of the `PT_NOTE` segment, always named `CORE`.
#[derive(Clone, Copy, Debug)]
pub struct NoteRecord<'a> {
    note_type: u32,
    desc: &'a [u8],
}

impl<'a> NoteRecord<'a> {
    /// A `CORE` note of `note_type` carrying `desc`
    pub fn new(note_type: u32, desc: &'a [u8]) -> Self {
        Self { note_type, desc }
    }

    /// The `NT_*` type
    pub fn note_type(&self) -> u32 {
        self.note_type
    }

    /// Descriptor bytes, unpadded
    pub fn desc(&self) -> &'a [u8] {
        self.desc
    }

    /// Bytes taken in the file, padding included
    pub fn size(&self) -> usize {
        std::mem::size_of::<Elf_Nhdr>()
            + round_up(NOTE_NAME.len(), ELF_NOTE_PADDING)
            + round_up(self.desc.len(), ELF_NOTE_PADDING)
    }

    /// Writes the header, the name and the descriptor, each padded
    pub fn write_to<W: Write>(&self, out: &mut OutputFile<W>) -> Result<usize, CoreError> {
        let start = out.position();

        let header = Elf_Nhdr {
            namesz: NOTE_NAME.len() as u32,
            descsz: self.desc.len() as u32,
            ntype: self.note_type,
        };

        tracing::debug!(
            "Writing note type {} with {} payload bytes at offset {}...",
            self.note_type,
            self.desc.len(),
            start
        );

        out.write(header.as_bytes())?;
        out.write(NOTE_NAME)?;
        out.align_position(ELF_NOTE_PADDING)?;
        out.write(self.desc)?;
        out.align_position(ELF_NOTE_PADDING)?;

        Ok(out.position() - start)
    }
}
