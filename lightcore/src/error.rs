// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors that might be seen when creating a light core file.

use thiserror::Error;

/// Error encountered during creating a light core file
#[derive(Debug, Error)]
pub enum CoreError {
    /// Race when seizing threads
    #[error("race when seizing threads")]
    RaceTryAgain,
    /// A process cannot dump itself
    #[error("cannot create a core file for the process itself")]
    CantDumpItself,
    /// The crash context blob does not have the expected size
    #[error("crash context is {actual} bytes, expected {expected}")]
    BadContextSize {
        /// Size of the serialized crash context this build expects
        expected: usize,
        /// Size of the blob supplied by the caller
        actual: usize,
    },
    /// The scratch arena cannot satisfy an allocation
    #[error("scratch arena exhausted: requested {requested} bytes, {available} available")]
    ArenaExhausted {
        /// Bytes requested
        requested: usize,
        /// Bytes left in the arena
        available: usize,
    },
    /// No mapping contains the stack pointer of a thread
    #[error("no mapping contains stack pointer 0x{stack_pointer:x} of thread {tid}")]
    StackNotFound {
        /// Thread id
        tid: i32,
        /// Stack pointer of the thread
        stack_pointer: usize,
    },
    /// Reading the target memory returned fewer bytes than requested
    #[error("short read of {len} bytes at 0x{address:x}")]
    ShortRead {
        /// Remote address
        address: usize,
        /// Requested length
        len: usize,
    },
    /// The thread index is outside the thread list
    #[error("no thread at index {0}")]
    NoSuchThread(usize),
    /// A /proc path does not fit in the path buffer
    #[error("/proc path too long")]
    ProcPathTooLong,
    /// A /proc file parsing error
    #[error("/proc parsing error")]
    ProcParsingError,
    /// A /proc file parsing error
    #[error("/proc integer parsing error")]
    ProcIntParsingError(#[from] std::num::ParseIntError),
    /// A /proc file was empty
    #[error("nothing could be read from {0}")]
    EmptyProcFile(&'static str),
    /// Internal error
    #[error("internal error: {0}")]
    InternalError(&'static str),
    /// OS error
    #[error("OS error")]
    NixError(#[from] nix::Error),
    /// I/O error
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}
