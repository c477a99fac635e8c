// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    audit::TransportLog,
    error::TpmRc,
    marshal::TpmResponse,
    transport::{FileTransport, Transport},
    TpmError,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, trace};
use std::{
    fs::OpenOptions,
    io::{self, IsTerminal},
    path::Path,
    time::Duration,
};

/// Route taken by a command on its way to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Through the transport log, if one is attached.
    Logged,
    /// Straight to the transport. Used by commands issued while making room
    /// for another command so that they do not appear in the log.
    Direct,
}

#[derive(Debug)]
pub struct TpmDevice {
    transport: Box<dyn Transport>,
    log: Option<TransportLog>,
    spinner: bool,
}

impl TpmDevice {
    #[must_use]
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self {
            transport: Box::new(transport),
            log: None,
            spinner: false,
        }
    }

    /// Opens a TPM character device for communication.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError::File` if the path cannot be opened.
    pub fn open(path: &str) -> Result<Self, TpmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Path::new(path))
            .map_err(|e| {
                TpmError::File(
                    path.to_string(),
                    io::Error::new(e.kind(), "could not open device node"),
                )
            })?;
        debug!(target: "tpmkey::device", "opening {path}");
        let mut device = Self::new(FileTransport(file));
        device.spinner = io::stderr().is_terminal();
        Ok(device)
    }

    /// Attaches an empty transport log.
    #[must_use]
    pub fn with_transport_log(mut self, log: TransportLog) -> Self {
        self.log = Some(log);
        self
    }

    #[must_use]
    pub fn transport_log(&self) -> Option<&TransportLog> {
        self.log.as_ref()
    }

    /// Sends a command to the TPM and waits for the response.
    ///
    /// Displays a spinner on stderr when talking to a device from a terminal.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Transport` if the round trip fails,
    /// `TpmError::Protocol` on a malformed header and `TpmError::Tpm` with
    /// the unchanged return code if the device reports an error.
    pub fn execute(
        &mut self,
        command: &[u8],
        name: &str,
        channel: Channel,
    ) -> Result<TpmResponse, TpmError> {
        self.execute_with_handles(command, 0, name, channel)
    }

    /// Like [`TpmDevice::execute`] for a command whose first `handles` words
    /// after the header are handles rather than parameters.
    ///
    /// # Errors
    ///
    /// See [`TpmDevice::execute`].
    pub fn execute_with_handles(
        &mut self,
        command: &[u8],
        handles: usize,
        name: &str,
        channel: Channel,
    ) -> Result<TpmResponse, TpmError> {
        let maybe_pb = if self.spinner {
            let pb = ProgressBar::new_spinner();
            pb.enable_steady_tick(Duration::from_millis(100));
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg}") {
                pb.set_style(
                    style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
                );
            }
            pb.set_message("Waiting for TPM...");
            Some(pb)
        } else {
            None
        };

        trace!(target: "tpmkey::device", "{name}: command {}", hex::encode(command));
        let result = self.transport.transmit(command);
        if let Some(pb) = maybe_pb {
            pb.finish_and_clear();
        }
        let bytes = result?;
        trace!(target: "tpmkey::device", "{name}: response {}", hex::encode(&bytes));

        let response = TpmResponse::parse(bytes)?;

        if channel == Channel::Logged {
            if let Some(log) = self.log.as_mut() {
                log.record(command, handles, &response.bytes);
            }
        }

        if response.rc != 0 {
            let rc = TpmRc(response.rc);
            debug!(target: "tpmkey::device", "{name}: {rc}");
            return Err(TpmError::Tpm(rc));
        }
        Ok(response)
    }
}
