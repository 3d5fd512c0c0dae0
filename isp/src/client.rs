// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Serial transport for ISP exchanges.
//!
//! Every exchange is strict request/response: the host writes one 100-byte
//! frame and collects up to one frame back. The device answers within a
//! few milliseconds when it answers at all, so the port runs with a short
//! poll timeout and the caller bounds the whole exchange with a deadline.

use std::io::{self, ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::debug;
use serialport::{ClearBuffer, SerialPort};
use thiserror::Error;

use crate::frame::FRAME_LEN;

const POLL_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum IspError {
    #[error("cannot open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("serial I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

pub struct IspClient(Box<dyn SerialPort>);

impl IspClient {
    pub fn open(port: &str, baud: u32) -> Result<IspClient, IspError> {
        let inner = serialport::new(port, baud)
            .timeout(POLL_TIMEOUT)
            .open()
            .map_err(|source| IspError::Open {
                port: port.to_string(),
                source,
            })?;
        Ok(IspClient(inner))
    }

    /// Discard bytes the device pushed since the last exchange, so a
    /// response cannot be misaligned against stale output.
    pub fn drain_input(&mut self) -> Result<(), IspError> {
        self.0.clear(ClearBuffer::Input)?;
        Ok(())
    }

    /// Send one frame and collect up to one frame of response until the
    /// deadline. A short or empty response is returned as-is; the caller
    /// decides whether that is fatal.
    pub fn txrx(&mut self, frame: &[u8; FRAME_LEN], overall: Duration) -> Result<Vec<u8>, IspError> {
        debug!("send cmd 0x{:02x} seq {}", frame[2], frame[3]);
        self.0.write_all(frame)?;

        let deadline = Instant::now() + overall;
        let mut resp = Vec::with_capacity(FRAME_LEN);
        let mut buf = [0u8; FRAME_LEN];
        while resp.len() < FRAME_LEN && Instant::now() < deadline {
            match self.0.read(&mut buf[..FRAME_LEN - resp.len()]) {
                Ok(0) => {}
                Ok(n) => resp.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("recv {} bytes", resp.len());
        Ok(resp)
    }
}
