// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The destination of a light core file.
//!
//! Writing is strictly sequential: the file is never seeked backwards, so the
//! content can just as well be streamed into a pipe.

use crate::diag;
use crate::CoreError;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

const ZERO_PAGE: [u8; 0x1000] = [0; 0x1000];

/// Wraps a `Write` and keeps track of the current offset
pub struct OutputFile<W: Write> {
    writer: W,
    written: usize,
}

impl OutputFile<File> {
    /// Creates (or truncates) the file at `path`, readable by the owner only.
    pub fn create(path: &Path) -> Result<Self, CoreError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| {
                diag::open_failed(path, &e);
                CoreError::IoError(e)
            })?;

        Ok(Self::new(file))
    }
}

impl<W: Write> OutputFile<W> {
    /// Starts at offset zero of `writer`
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Writes all of `data`; a short write is fatal.
    pub fn write(&mut self, data: &[u8]) -> Result<(), CoreError> {
        if data.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.writer.write_all(data) {
            diag::write_failed(data.len(), &e);
            return Err(CoreError::IoError(e));
        }
        self.written += data.len();

        Ok(())
    }

    /// Writes `len` zero bytes.
    pub fn pad(&mut self, len: usize) -> Result<(), CoreError> {
        let mut left = len;
        while left > 0 {
            let chunk = std::cmp::min(left, ZERO_PAGE.len());
            self.write(&ZERO_PAGE[..chunk])?;
            left -= chunk;
        }

        Ok(())
    }

    /// Pads with zeroes up to the next multiple of `alignment`.
    pub fn align_position(&mut self, alignment: usize) -> Result<usize, CoreError> {
        let padding = round_up(self.written, alignment) - self.written;
        self.pad(padding)?;
        Ok(padding)
    }

    /// Offset of the next byte to be written
    pub fn position(&self) -> usize {
        self.written
    }

    /// Flushes the writer
    pub fn flush(&mut self) -> Result<(), CoreError> {
        self.writer.flush().map_err(CoreError::IoError)
    }

    /// Gives the writer back
    pub fn into_inner(self) -> W {
        self.writer
    }
}

pub(crate) fn round_up(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }

    value.div_ceil(alignment) * alignment
}
