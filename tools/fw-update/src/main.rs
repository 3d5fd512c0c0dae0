// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Firmware update host for the dual-bank UART bootloader
//!
//! The bootloader picks the flash bank a new image will occupy, so the
//! session runs in two phases: announce the update and learn the bank
//! base, then relocate the image to that base and stream it. The `patch`
//! and `crc` subcommands run the same relocation machinery offline.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use log::warn;

use fw_patcher::{crc32, relocate_file, write_image, DEFAULT_VECTOR_TABLE_SIZE};
use isp_proto::commands::boot;
use isp_proto::frame::{build_frame, ChecksumKind, FRAME_LEN};
use isp_proto::metadata::{MetadataAck, ACK_RANGE};
use isp_proto::IspClient;

/// Payload bytes carried per firmware chunk.
const CHUNK_LEN: usize = 92;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(version, about = "Firmware update host for the dual-bank UART bootloader")]
struct Cli {
    /// Log every patched word and protocol step.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the full OTA session against a device in bootloader mode.
    Update {
        /// Serial port the bootloader is listening on.
        port: String,

        #[arg(long, default_value_t = 115_200)]
        baud: u32,

        #[arg(long, default_value_t = 1)]
        center_id: u8,

        /// Firmware binary compiled at --original-base.
        #[arg(long)]
        bin: PathBuf,

        /// Linker map file emitted alongside the binary.
        #[arg(long)]
        map: PathBuf,

        #[arg(long, value_parser = parse_int::parse::<u32>, default_value = "0")]
        original_base: u32,

        #[arg(long, value_parser = parse_int::parse::<u32>, default_value = "0x01020304")]
        fw_version: u32,

        #[arg(long, default_value_t = DEFAULT_VECTOR_TABLE_SIZE)]
        vector_table_size: usize,
    },

    /// Relocate a firmware image on disk without talking to a device.
    Patch {
        #[arg(long)]
        bin: PathBuf,

        #[arg(long)]
        map: PathBuf,

        #[arg(long, value_parser = parse_int::parse::<u32>, default_value = "0")]
        original_base: u32,

        #[arg(long, value_parser = parse_int::parse::<u32>)]
        new_base: u32,

        /// Output path; defaults to `<stem>_at_0x<new-base>.bin` next to
        /// the input.
        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long, default_value_t = DEFAULT_VECTOR_TABLE_SIZE)]
        vector_table_size: usize,
    },

    /// Print the padded CRC-32 of a file.
    Crc { file: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let _ = simple_logger::SimpleLogger::new().with_level(level).init();

    match cli.cmd {
        Cmd::Update {
            port,
            baud,
            center_id,
            bin,
            map,
            original_base,
            fw_version,
            vector_table_size,
        } => update(
            &port,
            baud,
            center_id,
            &bin,
            &map,
            original_base,
            fw_version,
            vector_table_size,
        ),
        Cmd::Patch {
            bin,
            map,
            original_base,
            new_base,
            out,
            vector_table_size,
        } => patch(&bin, &map, original_base, new_base, out, vector_table_size),
        Cmd::Crc { file } => {
            let data =
                fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            println!("0x{:08X}", crc32::crc32(&data));
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn update(
    port: &str,
    baud: u32,
    center_id: u8,
    bin: &Path,
    map: &Path,
    original_base: u32,
    fw_version: u32,
    vector_table_size: usize,
) -> Result<()> {
    let mut client = IspClient::open(port, baud)?;
    connect(&mut client, center_id)?;
    println!("Connected to bootloader on {port}");

    // First announcement with zeroed CRC and size: its only purpose is to
    // learn which bank the device wants the image in.
    let ack = send_metadata(&mut client, center_id, 1, fw_version, 0, 0)?;
    if !ack.accepted() {
        bail!(
            "device returned invalid update address 0x{:08X}",
            ack.update_addr
        );
    }
    println!("Device selected bank at 0x{:08X}", ack.update_addr);

    let (_, relocation) = relocate_file(
        bin,
        map,
        original_base,
        ack.update_addr,
        vector_table_size,
    )?;
    let image = relocation.image;
    let crc = crc32::crc32(&image);
    println!("Relocated {} bytes, CRC32 0x{crc:08X}", image.len());

    send_metadata(&mut client, center_id, 2, fw_version, crc, image.len() as u32)?;
    send_firmware(&mut client, center_id, 3, &image)?;
    println!("Firmware update complete");
    Ok(())
}

fn connect(client: &mut IspClient, center_id: u8) -> Result<()> {
    let pkt = build_frame(center_id, boot::CONNECT, 0, &[], ChecksumKind::Sum);
    let resp = client.txrx(&pkt, RESPONSE_TIMEOUT)?;
    if resp.len() < 3 || resp[2] != boot::CONNECT {
        bail!("bootloader did not answer CONNECT");
    }
    Ok(())
}

fn send_metadata(
    client: &mut IspClient,
    center_id: u8,
    seq: u8,
    fw_version: u32,
    fw_crc: u32,
    fw_size: u32,
) -> Result<MetadataAck> {
    let mut payload = [0u8; 12];
    payload[0..4].copy_from_slice(&fw_version.to_le_bytes());
    payload[4..8].copy_from_slice(&fw_crc.to_le_bytes());
    payload[8..12].copy_from_slice(&fw_size.to_le_bytes());

    let pkt = build_frame(center_id, boot::UPDATE_METADATA, seq, &payload, ChecksumKind::Sum);
    let resp = client.txrx(&pkt, RESPONSE_TIMEOUT)?;
    if resp.len() < FRAME_LEN {
        bail!("metadata response truncated ({} bytes)", resp.len());
    }
    MetadataAck::parse(&resp[ACK_RANGE]).context("metadata response missing update address")
}

fn send_firmware(
    client: &mut IspClient,
    center_id: u8,
    seq_start: u8,
    image: &[u8],
) -> Result<()> {
    let bar = ProgressBar::new(image.len() as u64);
    let mut chunks = image.chunks(CHUNK_LEN);
    let mut seq = seq_start;

    // The first chunk opens APROM programming; the device answers when it
    // has erased the bank.
    if let Some(first) = chunks.next() {
        let pkt = build_frame(center_id, boot::UPDATE_APROM, seq, first, ChecksumKind::Sum);
        client.txrx(&pkt, RESPONSE_TIMEOUT)?;
        bar.inc(first.len() as u64);
        seq = seq.wrapping_add(1);
    }

    for chunk in chunks {
        loop {
            let pkt = build_frame(center_id, boot::WRITE_FW, seq, chunk, ChecksumKind::Sum);
            let resp = client.txrx(&pkt, RESPONSE_TIMEOUT)?;
            if resp.len() >= 3 && resp[2] == boot::RESEND_PACKET {
                warn!("device requested resend of packet {seq}");
                continue;
            }
            break;
        }
        bar.inc(chunk.len() as u64);
        seq = seq.wrapping_add(1);
    }

    bar.finish_and_clear();
    Ok(())
}

fn patch(
    bin: &Path,
    map: &Path,
    original_base: u32,
    new_base: u32,
    out: Option<PathBuf>,
    vector_table_size: usize,
) -> Result<()> {
    let (hint, relocation) =
        relocate_file(bin, map, original_base, new_base, vector_table_size)?;
    let out = out.unwrap_or(hint);
    write_image(&out, &relocation.image)?;
    println!("Patched image written to {}", out.display());
    println!("CRC32 0x{:08X}", crc32::crc32(&relocation.image));
    Ok(())
}
