// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module contains the functionality for
//! stopping and inspecting a process on Linux systems.

mod memory;
mod process;
mod procfs;
mod ptrace;

pub use process::PtraceDebugger;
pub use process::MAX_MAPPINGS;
pub use process::MAX_THREADS;
pub(crate) use procfs::read_file_prefix;
