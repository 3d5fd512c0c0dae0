// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Wire schemas the device embeds in its response frames.
//!
//! All fields are little-endian `u32`s, mirroring the C structs in the
//! bootloader. The byte ranges below index into the full 100-byte frame.

use std::fmt;
use std::ops::Range;

/// `FWStatus.status` values.
pub const OTA_UPDATE_FLAG: u32 = 0xDDCC_BBAA;
pub const SWITCH_FW_FLAG: u32 = 0xA5A5_BEEF;
pub const OTA_FAILED_FLAG: u32 = 0xDEAD_DEAD;

/// `FWMetadata.flags` bits.
pub const FW_FLAG_INVALID: u32 = 1 << 0;
pub const FW_FLAG_VALID: u32 = 1 << 1;
pub const FW_FLAG_PENDING: u32 = 1 << 2;
pub const FW_FLAG_ACTIVE: u32 = 1 << 3;

/// Where the device places each block inside a response frame.
pub const STATUS_RANGE: Range<usize> = 4..16;
pub const ACK_RANGE: Range<usize> = 8..12;
pub const META1_RANGE: Range<usize> = 20..52;
pub const META2_RANGE: Range<usize> = 52..84;

fn word(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// Boot-time status block: which bank runs and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwStatus {
    pub fw_addr: u32,
    pub fw_meta_addr: u32,
    pub status: u32,
}

impl FwStatus {
    pub const SIZE: usize = 12;

    pub fn parse(data: &[u8]) -> Option<FwStatus> {
        (data.len() >= Self::SIZE).then(|| FwStatus {
            fw_addr: word(data, 0),
            fw_meta_addr: word(data, 4),
            status: word(data, 8),
        })
    }

    pub fn describe(&self) -> &'static str {
        match self.status {
            OTA_UPDATE_FLAG => "OTA Update",
            SWITCH_FW_FLAG => "Switch Firmware",
            OTA_FAILED_FLAG => "OTA Failed",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for FwStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FW_Addr      : 0x{:08X}", self.fw_addr)?;
        writeln!(f, "FW_meta_Addr : 0x{:08X}", self.fw_meta_addr)?;
        write!(
            f,
            "status       : 0x{:08X} ({})",
            self.status,
            self.describe()
        )
    }
}

/// Per-bank firmware metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwMetadata {
    pub flags: u32,
    pub fw_crc32: u32,
    pub fw_version: u32,
    pub fw_start_addr: u32,
    pub fw_size: u32,
    pub trial_counter: u32,
    pub reserved: u32,
    pub meta_crc: u32,
}

impl FwMetadata {
    pub const SIZE: usize = 32;

    pub fn parse(data: &[u8]) -> Option<FwMetadata> {
        (data.len() >= Self::SIZE).then(|| FwMetadata {
            flags: word(data, 0),
            fw_crc32: word(data, 4),
            fw_version: word(data, 8),
            fw_start_addr: word(data, 12),
            fw_size: word(data, 16),
            trial_counter: word(data, 20),
            reserved: word(data, 24),
            meta_crc: word(data, 28),
        })
    }

    pub fn flag_names(&self) -> String {
        let mut names = Vec::new();
        if self.flags & FW_FLAG_INVALID != 0 {
            names.push("INVALID");
        }
        if self.flags & FW_FLAG_VALID != 0 {
            names.push("VALID");
        }
        if self.flags & FW_FLAG_PENDING != 0 {
            names.push("PENDING");
        }
        if self.flags & FW_FLAG_ACTIVE != 0 {
            names.push("ACTIVE");
        }
        if names.is_empty() {
            names.push("None");
        }
        names.join("|")
    }
}

impl fmt::Display for FwMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  flags         : 0x{:08X} ({})",
            self.flags,
            self.flag_names()
        )?;
        writeln!(f, "  fw_crc32      : 0x{:08X}", self.fw_crc32)?;
        writeln!(f, "  fw_version    : 0x{:08X}", self.fw_version)?;
        writeln!(f, "  fw_start_addr : 0x{:08X}", self.fw_start_addr)?;
        writeln!(f, "  fw_size       : {} bytes", self.fw_size)?;
        writeln!(f, "  trial_counter : {}", self.trial_counter)?;
        writeln!(f, "  reserved      : 0x{:08X}", self.reserved)?;
        write!(f, "  meta_crc      : 0x{:08X}", self.meta_crc)
    }
}

/// Reply to `UPDATE_METADATA`: the bank base the device picked for this
/// update. The device answers `0xFFFFFFFF` when the metadata write failed,
/// and an unprogrammed response buffer reads as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataAck {
    pub update_addr: u32,
}

impl MetadataAck {
    pub fn parse(data: &[u8]) -> Option<MetadataAck> {
        (data.len() >= 4).then(|| MetadataAck {
            update_addr: word(data, 0),
        })
    }

    pub fn accepted(&self) -> bool {
        self.update_addr != 0 && self.update_addr != 0xFFFF_FFFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn parses_status_block() {
        let data = words(&[0x0000_2000, 0x0001_F000, OTA_UPDATE_FLAG]);
        let status = FwStatus::parse(&data).unwrap();
        assert_eq!(status.fw_addr, 0x2000);
        assert_eq!(status.fw_meta_addr, 0x1_F000);
        assert_eq!(status.describe(), "OTA Update");
        assert_eq!(FwStatus::parse(&data[..8]), None);
    }

    #[test]
    fn parses_metadata_record() {
        let data = words(&[
            FW_FLAG_VALID | FW_FLAG_ACTIVE,
            0xDEAD_BEEF,
            0x0102_0304,
            0x0001_0000,
            0xE000,
            2,
            0,
            0x1234_5678,
        ]);
        let meta = FwMetadata::parse(&data).unwrap();
        assert_eq!(meta.fw_start_addr, 0x1_0000);
        assert_eq!(meta.fw_size, 0xE000);
        assert_eq!(meta.trial_counter, 2);
        assert_eq!(meta.flag_names(), "VALID|ACTIVE");
    }

    #[test]
    fn empty_flags_render_as_none() {
        let meta = FwMetadata::parse(&words(&[0; 8])).unwrap();
        assert_eq!(meta.flag_names(), "None");
    }

    #[test]
    fn ack_sentinels_are_rejected() {
        assert!(MetadataAck::parse(&words(&[0x0001_0000])).unwrap().accepted());
        assert!(!MetadataAck::parse(&words(&[0])).unwrap().accepted());
        assert!(!MetadataAck::parse(&words(&[0xFFFF_FFFF])).unwrap().accepted());
    }
}
