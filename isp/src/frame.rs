// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! 100-byte ISP frame codec
//!
//! Layout on the wire, identical in both directions:
//! `[0x55][center_id][cmd][seq][94-byte payload][checksum][0x0A]`.
//! The payload is right-padded with `0xFF`. The checksum covers the first
//! 98 bytes; the bootloader session sums them, the application session
//! XORs them.

use thiserror::Error;

pub const FRAME_LEN: usize = 100;
pub const PAYLOAD_LEN: usize = 94;
pub const HEADER_BYTE: u8 = 0x55;
pub const TAIL_BYTE: u8 = 0x0A;

const PAYLOAD_OFFSET: usize = 4;
const CHECKSUM_SPAN: usize = 98;

/// Which checksum the peer expects over the first 98 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// Wrapping byte sum; the bootloader ISP session.
    Sum,
    /// Byte XOR; the application session.
    Xor,
}

pub fn checksum(frame: &[u8], kind: ChecksumKind) -> u8 {
    let span = &frame[..CHECKSUM_SPAN];
    match kind {
        ChecksumKind::Sum => span.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)),
        ChecksumKind::Xor => span.iter().fold(0u8, |acc, &b| acc ^ b),
    }
}

/// Build one frame. A payload longer than 94 bytes is truncated; a shorter
/// one is padded with `0xFF`.
pub fn build_frame(
    center_id: u8,
    cmd: u8,
    seq: u8,
    payload: &[u8],
    kind: ChecksumKind,
) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    buf[0] = HEADER_BYTE;
    buf[1] = center_id;
    buf[2] = cmd;
    buf[3] = seq;
    let take = payload.len().min(PAYLOAD_LEN);
    buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + take].copy_from_slice(&payload[..take]);
    buf[PAYLOAD_OFFSET + take..PAYLOAD_OFFSET + PAYLOAD_LEN].fill(0xFF);
    buf[CHECKSUM_SPAN] = checksum(&buf, kind);
    buf[FRAME_LEN - 1] = TAIL_BYTE;
    buf
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is {0} bytes, expected {FRAME_LEN}")]
    WrongLength(usize),
    #[error("frame does not start with 0x55")]
    BadHeader,
    #[error("frame does not end with 0x0A")]
    BadTail,
    #[error("frame checksum is 0x{actual:02x}, computed 0x{expected:02x}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

/// A validated view into a received frame.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub center_id: u8,
    pub cmd: u8,
    pub seq: u8,
    pub payload: &'a [u8],
}

pub fn parse_frame(resp: &[u8], kind: ChecksumKind) -> Result<Frame<'_>, FrameError> {
    if resp.len() != FRAME_LEN {
        return Err(FrameError::WrongLength(resp.len()));
    }
    if resp[0] != HEADER_BYTE {
        return Err(FrameError::BadHeader);
    }
    if resp[FRAME_LEN - 1] != TAIL_BYTE {
        return Err(FrameError::BadTail);
    }
    let expected = checksum(resp, kind);
    if resp[CHECKSUM_SPAN] != expected {
        return Err(FrameError::ChecksumMismatch {
            expected,
            actual: resp[CHECKSUM_SPAN],
        });
    }
    Ok(Frame {
        center_id: resp[1],
        cmd: resp[2],
        seq: resp[3],
        payload: &resp[PAYLOAD_OFFSET..PAYLOAD_OFFSET + PAYLOAD_LEN],
    })
}
