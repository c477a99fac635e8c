// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    constants::{TPM_HEADER_SIZE, TPM_MAX_COMMAND_SIZE},
    TpmError,
};
use std::{
    fmt::Debug,
    fs::File,
    io::{Read, Write},
};

/// A transport layer capable of sending and receiving full TPM commands.
pub trait Transport: Debug {
    /// Sends a complete command buffer to the TPM.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Transport` on I/O failure.
    fn send(&mut self, command: &[u8]) -> Result<(), TpmError>;

    /// Receives a complete response buffer from the TPM.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Transport` on I/O failure or a malformed frame.
    fn receive(&mut self) -> Result<Vec<u8>, TpmError>;

    /// Sends a command and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Transport` if either direction fails.
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TpmError> {
        self.send(command)?;
        self.receive()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, command: &[u8]) -> Result<(), TpmError> {
        (**self).send(command)
    }

    fn receive(&mut self) -> Result<Vec<u8>, TpmError> {
        (**self).receive()
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TpmError> {
        (**self).transmit(command)
    }
}

fn transport_err(e: &std::io::Error) -> TpmError {
    TpmError::Transport(e.to_string())
}

/// Reads one framed response: the 10-byte header, then the remainder as
/// announced by its size field.
///
/// # Errors
///
/// Returns `TpmError::Transport` on I/O failure or an out-of-range size.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, TpmError> {
    let mut header = [0u8; TPM_HEADER_SIZE];
    reader.read_exact(&mut header).map_err(|e| transport_err(&e))?;

    let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if size < header.len() {
        return Err(TpmError::Transport(format!(
            "response size {size} is smaller than the header"
        )));
    }
    if size > TPM_MAX_COMMAND_SIZE {
        return Err(TpmError::Transport(format!(
            "response size {size} exceeds {TPM_MAX_COMMAND_SIZE}"
        )));
    }

    let mut resp_buf = header.to_vec();
    resp_buf.resize(size, 0);
    reader
        .read_exact(&mut resp_buf[header.len()..])
        .map_err(|e| transport_err(&e))?;
    Ok(resp_buf)
}

/// A transport implementation that wraps a character device such as
/// `/dev/tpm0`.
#[derive(Debug)]
pub struct FileTransport(pub File);

impl Transport for FileTransport {
    fn send(&mut self, command: &[u8]) -> Result<(), TpmError> {
        self.0.write_all(command).map_err(|e| transport_err(&e))?;
        self.0.flush().map_err(|e| transport_err(&e))
    }

    fn receive(&mut self) -> Result<Vec<u8>, TpmError> {
        read_frame(&mut self.0)
    }
}
