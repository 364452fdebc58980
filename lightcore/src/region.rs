// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory ranges dumped into `PT_LOAD` segments.

use crate::diag;
use crate::output::OutputFile;
use crate::CoreError;
use crate::ReadProcessMemory;
use std::io::Write;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Where the bytes of a region come from
#[derive(Clone, Copy, Debug)]
pub enum RegionSource<'a> {
    /// Already in the local address space
    Local(&'a [u8]),
    /// Copied out of the target at write time, on behalf of the given thread
    Remote {
        /// Thread the read is made through
        tid: i32,
    },
}

/// A byte range of the target's address space.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion<'a> {
    address: usize,
    size: usize,
    source: RegionSource<'a>,
}

impl<'a> MemoryRegion<'a> {
    /// A region whose content was prepared locally, e.g. a patched string.
    pub fn local(address: usize, data: &'a [u8]) -> Self {
        Self {
            address,
            size: data.len(),
            source: RegionSource::Local(data),
        }
    }

    /// A region read from the target through thread `tid`.
    pub fn remote(address: usize, size: usize, tid: i32) -> Self {
        Self {
            address,
            size,
            source: RegionSource::Remote { tid },
        }
    }

    /// Virtual address of the first byte
    pub fn address(&self) -> usize {
        self.address
    }

    /// Length in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte
    pub fn end(&self) -> usize {
        self.address + self.size
    }

    /// Where the bytes come from
    pub fn source(&self) -> RegionSource<'a> {
        self.source
    }

    /// Writes the content of the region. Remote bytes travel through
    /// `scratch` one chunk at a time; any failed read aborts the region.
    pub fn write_to<W: Write, R: ReadProcessMemory + ?Sized>(
        &self,
        out: &mut OutputFile<W>,
        reader: &R,
        scratch: &mut [u8],
    ) -> Result<usize, CoreError> {
        let tid = match self.source {
            RegionSource::Local(data) => {
                out.write(data)?;
                return Ok(data.len());
            }
            RegionSource::Remote { tid } => tid,
        };

        if scratch.is_empty() {
            return Err(CoreError::InternalError("empty scratch buffer"));
        }

        let mut address = self.address;
        let mut left = self.size;
        while left > 0 {
            let len = std::cmp::min(left, scratch.len());
            let buf = &mut scratch[..len];

            read_exact(reader, tid, address, buf)?;
            out.write(buf)?;

            address += len;
            left -= len;
        }

        Ok(self.size)
    }
}

/// Fills `buf` from the target; anything short of the full length is fatal.
pub(crate) fn read_exact<R: ReadProcessMemory + ?Sized>(
    reader: &R,
    tid: i32,
    address: usize,
    buf: &mut [u8],
) -> Result<(), CoreError> {
    let len = buf.len();
    match reader.read_process_memory(tid, address, buf) {
        Ok(n) if n == len => Ok(()),
        Ok(_) => {
            diag::remote_read_failed(tid, address, len);
            Err(CoreError::ShortRead { address, len })
        }
        Err(e) => {
            diag::remote_read_failed(tid, address, len);
            Err(e)
        }
    }
}

/// Reads one ABI record out of the target.
pub(crate) fn read_value<T, R>(reader: &R, tid: i32, address: usize) -> Result<T, CoreError>
where
    T: FromBytes + IntoBytes,
    R: ReadProcessMemory + ?Sized,
{
    let mut value = T::new_zeroed();
    read_exact(reader, tid, address, value.as_mut_bytes())?;
    Ok(value)
}
