// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Firmware relocation library
//!
//! The bootloader decides at runtime which flash bank a new image will
//! occupy, so the host must rewrite every absolute address inside an image
//! compiled for one base so that it executes correctly at the other. This
//! crate parses the linker map to learn which address ranges hold code and
//! data, decodes the Thumb instruction stream to find PC-relative constant
//! loads, and patches the vector table, literal pools and switch jump
//! tables accordingly.

pub mod crc32;
pub mod disasm;
mod error;
pub mod map_file;
pub mod relocator;

pub use error::PatchError;
pub use map_file::MapFile;
pub use relocator::{
    relocate, relocate_file, suggested_output_path, write_image, PatchStats, Relocation,
    DEFAULT_VECTOR_TABLE_SIZE,
};
