// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reading `/proc` files into fixed buffers.

use crate::CoreError;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::fs::File;
use std::io::ErrorKind;
use std::io::Read;
use std::os::unix::io::RawFd;
use std::path::Path;
use zerocopy::IntoBytes;

const LINE_BUFFER_SIZE: usize = 4096;

// linux_dirent64: d_ino, d_off, then d_reclen at 16, d_type at 18 and the
// NUL-terminated name from 19.
const DIRENT_RECLEN_OFFSET: usize = 16;
const DIRENT_NAME_OFFSET: usize = 19;
const DIRENT_BUFFER_WORDS: usize = 512;

/// Fills `buf` with the beginning of the file, returns the number of bytes
/// read. Files in `/proc` are produced on the fly and may come in several
/// short reads.
pub(crate) fn read_file_prefix(path: &Path, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut file = File::open(path)?;
    let mut filled = 0;

    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

/// Calls `f` for every line of the file, without the line feed. Lines longer
/// than the internal buffer are cut.
pub(crate) fn for_each_line<F>(path: &Path, mut f: F) -> Result<(), CoreError>
where
    F: FnMut(&[u8]) -> Result<(), CoreError>,
{
    let mut file = File::open(path)?;
    let mut buf = [0_u8; LINE_BUFFER_SIZE];
    let mut filled = 0;
    let mut skipping = false;

    loop {
        let n = match file.read(&mut buf[filled..]) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CoreError::IoError(e)),
        };

        if n == 0 {
            if filled > 0 && !skipping {
                f(&buf[..filled])?;
            }
            return Ok(());
        }
        filled += n;

        let mut start = 0;
        while let Some(pos) = buf[start..filled].iter().position(|&b| b == b'\n') {
            if !skipping {
                f(&buf[start..start + pos])?;
            }
            skipping = false;
            start += pos + 1;
        }

        if start == 0 && filled == buf.len() {
            // No line feed in a full buffer.
            if !skipping {
                f(&buf[..filled])?;
            }
            skipping = true;
            filled = 0;
            continue;
        }

        buf.copy_within(start..filled, 0);
        filled -= start;
    }
}

/// Calls `f` with the name of every entry of the directory, `.` and `..`
/// included. The entries come from `getdents64` into a stack buffer, as a
/// `readdir` stream is allocated on the heap.
pub(crate) fn for_each_dir_entry<F>(path: &Path, mut f: F) -> Result<(), CoreError>
where
    F: FnMut(&[u8]) -> Result<(), CoreError>,
{
    let fd = nix::fcntl::open(
        path,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;

    let result = read_dir_entries(fd, &mut f);
    if let Err(e) = nix::unistd::close(fd) {
        tracing::debug!("Closing {:?} failed: {}", path, e);
    }

    result
}

fn read_dir_entries<F>(fd: RawFd, f: &mut F) -> Result<(), CoreError>
where
    F: FnMut(&[u8]) -> Result<(), CoreError>,
{
    // u64 words keep the records 8-byte aligned.
    let mut buf = [0_u64; DIRENT_BUFFER_WORDS];

    loop {
        // SAFETY: the kernel writes at most the buffer length into the buffer.
        let n = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                buf.as_mut_ptr(),
                std::mem::size_of_val(&buf),
            )
        };

        if n < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                errno => return Err(CoreError::NixError(errno)),
            }
        }
        if n == 0 {
            return Ok(());
        }

        let bytes = &buf.as_bytes()[..n as usize];
        let mut offset = 0;
        while offset < bytes.len() {
            let record = &bytes[offset..];
            if record.len() < DIRENT_NAME_OFFSET {
                return Err(CoreError::ProcParsingError);
            }

            let reclen = u16::from_ne_bytes([
                record[DIRENT_RECLEN_OFFSET],
                record[DIRENT_RECLEN_OFFSET + 1],
            ]) as usize;
            if reclen < DIRENT_NAME_OFFSET || reclen > record.len() {
                return Err(CoreError::ProcParsingError);
            }

            let name = &record[DIRENT_NAME_OFFSET..reclen];
            let name_len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
            f(&name[..name_len])?;

            offset += reclen;
        }
    }
}

/// The number at the start of `s`, e.g. `1234` of `1234\t1234\n`.
pub(crate) fn parse_first_number(s: &[u8]) -> usize {
    s.iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0, |acc: usize, b| acc * 10 + (b - b'0') as usize)
}

/// A hexadecimal field of `/proc/<pid>/maps`.
pub(crate) fn parse_hex(s: &[u8]) -> Result<usize, CoreError> {
    let s = std::str::from_utf8(s).map_err(|_| CoreError::ProcParsingError)?;
    Ok(usize::from_str_radix(s, 16)?)
}
