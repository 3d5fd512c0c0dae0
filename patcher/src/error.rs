// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Errors surfaced by the patching pipeline.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    /// The binary cannot even hold the vector table it claims to have.
    #[error("firmware image is {len} bytes, shorter than the {table_size}-byte vector table")]
    ImageTooSmall { len: usize, table_size: usize },

    #[error("cannot read map file {}: {source}", .path.display())]
    MapUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot read firmware binary {}: {source}", .path.display())]
    BinUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write relocated binary {}: {source}", .path.display())]
    OutputUnwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("disassembler error: {0}")]
    Disasm(#[from] capstone::Error),
}
