// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sample process for writing light core files.
//!
//! `lightcore-sample <pid> <output_path> [max_stack_size]`
//!
//! This command stops process `pid` and writes a light core of it to
//! `output_path`: the registers and stack of every thread and the module
//! list of the dynamic linker.
//!
//! An optional `-v` parameter may be specified before any options to enable
//! debug level tracing.

#![cfg(target_os = "linux")]

use anyhow::Context;
use lightcore::SessionOptions;
use std::path::PathBuf;
use tracing::Level;

pub fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1).peekable();

    let level = if args.peek().map_or(false, |x| x == "-v") {
        args.next();
        Level::DEBUG
    } else {
        Level::WARN
    };

    let pid: i32 = args
        .next()
        .context("missing pid")?
        .parse()
        .context("failed to parse pid")?;

    let output_path: PathBuf = args
        .next()
        .context("missing output_path")?
        .parse()
        .context("failed to parse output_path")?;

    let max_stack_size = args
        .next()
        .map(|size| size.parse::<usize>())
        .transpose()
        .context("failed to parse max_stack_size")?;

    if args.next().is_some() {
        anyhow::bail!("unexpected extra arguments");
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    let options = SessionOptions {
        max_stack_size,
        ..Default::default()
    };
    let n = lightcore::try_generate_live_core(&output_path, pid, &options)
        .with_context(|| format!("unable to write a light core of process {}", pid))?;

    tracing::debug!("wrote {} bytes", n);
    Ok(())
}
