// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! UART ISP protocol
//!
//! Both the bootloader's ISP session and the running application speak the
//! same 100-byte framing over UART, differing only in their command sets
//! and checksum algorithm. This crate holds the frame codec, the command
//! bytes, the metadata wire schemas, and a small serial client.

pub mod client;
pub mod commands;
pub mod frame;
pub mod metadata;

pub use client::{IspClient, IspError};
pub use frame::{build_frame, parse_frame, ChecksumKind, Frame, FrameError, FRAME_LEN, PAYLOAD_LEN};
