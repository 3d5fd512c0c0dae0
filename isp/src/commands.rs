// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Command bytes understood by the two UART sessions.

/// Bootloader ISP session (sum checksum).
pub mod boot {
    /// Establish the session.
    pub const CONNECT: u8 = 0xAE;
    /// Switch the active firmware bank.
    pub const SWITCH_FW: u8 = 0xAD;
    /// First firmware chunk; opens APROM programming.
    pub const UPDATE_APROM: u8 = 0xA0;
    /// Subsequent firmware chunks.
    pub const WRITE_FW: u8 = 0x00;
    /// Sent by the device when a chunk must be retransmitted.
    pub const RESEND_PACKET: u8 = 0xFF;
    /// Announce version, CRC and size; the reply carries the bank base.
    pub const UPDATE_METADATA: u8 = 0xA5;
}

/// Application session (XOR checksum).
pub mod app {
    /// Reboot into OTA update mode.
    pub const OTA_UPDATE: u8 = 0xA7;
    /// Reboot into the bootloader.
    pub const TO_BOOTLOADER: u8 = 0xAE;
    /// Switch the active firmware bank on next boot.
    pub const SWITCH_FW: u8 = 0xAD;
    /// Report firmware status and both metadata banks.
    pub const REPORT_STATUS: u8 = 0xAF;
}
