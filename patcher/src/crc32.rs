// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CRC-32 engine matching the MCU's hardware checksum unit.
//!
//! The bootloader validates a received image by running its CRC peripheral
//! over the flash contents: polynomial `0x04C11DB7`, seed `0xFFFFFFFF`,
//! final XOR `0xFFFFFFFF`, with the input bit-reversed per byte and the
//! result bit-reversed. Flash reads back erased bytes as `0xFF`, so the
//! host pads a non-word-aligned tail with `0xFF` before summing.

const POLY: u32 = 0x04C1_1DB7;
const SEED: u32 = 0xFFFF_FFFF;
const FINAL_XOR: u32 = 0xFFFF_FFFF;

/// CRC-32 with the device defaults: both input and output reflected.
pub fn crc32(data: &[u8]) -> u32 {
    crc32_with(data, true, true)
}

/// CRC-32 with explicit reflection control, mirroring the configuration
/// bits of the CRC peripheral.
pub fn crc32_with(data: &[u8], reflect_input: bool, reflect_output: bool) -> u32 {
    let mut crc = SEED;
    for &byte in data {
        crc = step(crc, if reflect_input { byte.reverse_bits() } else { byte });
    }
    // Pad the unaligned tail with 0xFF, which reflects to itself.
    let pad = (4 - data.len() % 4) % 4;
    for _ in 0..pad {
        crc = step(crc, 0xFF);
    }
    let out = crc ^ FINAL_XOR;
    if reflect_output {
        out.reverse_bits()
    } else {
        out
    }
}

fn step(crc: u32, byte: u8) -> u32 {
    let mut crc = crc ^ (u32::from(byte) << 24);
    for _ in 0..8 {
        crc = if crc & 0x8000_0000 != 0 {
            (crc << 1) ^ POLY
        } else {
            crc << 1
        };
    }
    crc
}
