// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Control console for the application-session UART commands
//!
//! While the application firmware is running it accepts a small command
//! set over the same 100-byte framing the bootloader uses, but with an
//! XOR checksum. Each subcommand performs one exchange and prints the
//! status and metadata blocks from the response.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use isp_proto::commands::app;
use isp_proto::frame::{build_frame, parse_frame, ChecksumKind, FRAME_LEN};
use isp_proto::metadata::{FwMetadata, FwStatus, META1_RANGE, META2_RANGE, STATUS_RANGE};
use isp_proto::IspClient;

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(version, about = "UART control console for the OTA application session")]
struct Cli {
    /// Serial port the application firmware is listening on.
    port: String,

    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    #[arg(long, default_value_t = 1)]
    center_id: u8,

    /// Log frame exchanges.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Query firmware status and both metadata banks.
    Status,
    /// Ask the application to reboot into OTA update mode.
    Ota,
    /// Ask the application to reboot into the bootloader.
    ToBootloader,
    /// Ask the application to switch the active firmware bank.
    SwitchFw,
}

/// Which response blocks a command's reply carries.
enum Show {
    StatusOnly,
    FirstBank,
    BothBanks,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let _ = simple_logger::SimpleLogger::new().with_level(level).init();

    let (cmd, show) = match cli.cmd {
        Cmd::Status => (app::REPORT_STATUS, Show::BothBanks),
        Cmd::Ota => (app::OTA_UPDATE, Show::StatusOnly),
        Cmd::ToBootloader => (app::TO_BOOTLOADER, Show::FirstBank),
        Cmd::SwitchFw => (app::SWITCH_FW, Show::BothBanks),
    };

    let mut client = IspClient::open(&cli.port, cli.baud)?;
    let resp = exchange(&mut client, cli.center_id, cmd)?;
    report(&resp, show)
}

fn exchange(client: &mut IspClient, center_id: u8, cmd: u8) -> Result<Vec<u8>> {
    let pkt = build_frame(center_id, cmd, 0, &[], ChecksumKind::Xor);
    client.drain_input()?;
    let resp = client.txrx(&pkt, RESPONSE_TIMEOUT)?;
    if resp.len() != FRAME_LEN {
        bail!("response truncated ({} of {FRAME_LEN} bytes)", resp.len());
    }
    parse_frame(&resp, ChecksumKind::Xor).context("malformed response frame")?;
    Ok(resp)
}

fn report(resp: &[u8], show: Show) -> Result<()> {
    let status = FwStatus::parse(&resp[STATUS_RANGE]).context("status block truncated")?;
    println!("{status}");
    match show {
        Show::StatusOnly => {}
        Show::FirstBank => print_bank(1, &resp[META1_RANGE])?,
        Show::BothBanks => {
            print_bank(1, &resp[META1_RANGE])?;
            print_bank(2, &resp[META2_RANGE])?;
        }
    }
    Ok(())
}

fn print_bank(index: usize, data: &[u8]) -> Result<()> {
    let meta = FwMetadata::parse(data).context("metadata block truncated")?;
    println!("FWMetadata{index}:");
    println!("{meta}");
    Ok(())
}
