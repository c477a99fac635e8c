// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Big-endian marshalling for TPM 1.2 commands and structures.

use crate::{
    constants::{TPM_DIGEST_SIZE, TPM_HEADER_SIZE, TPM_NONCE_SIZE},
    TpmError,
};

pub type TpmDigest = [u8; TPM_DIGEST_SIZE];
pub type TpmNonce = [u8; TPM_NONCE_SIZE];

/// A structure with a bit-exact wire encoding.
pub trait TpmEncode {
    /// Appends the wire representation to `buf`.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Protocol` if a length field cannot represent the
    /// value.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, TpmError>;

    /// Encodes into a fresh vector.
    ///
    /// # Errors
    ///
    /// See [`TpmEncode::encode`].
    fn to_vec(&self) -> Result<Vec<u8>, TpmError> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

/// A structure that can be parsed from its wire encoding.
pub trait TpmDecode: Sized {
    /// Parses a value starting at `offset` and returns it with the offset
    /// just past it.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Truncated` if the buffer ends early, or
    /// `TpmError::Protocol` on a malformed value.
    fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize), TpmError>;
}

/// Cursor over a response or structure buffer.
#[derive(Debug)]
pub struct TpmReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TpmReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Borrows the next `len` bytes and advances past them.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Truncated` if fewer than `len` bytes remain.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], TpmError> {
        if self.remaining() < len {
            return Err(TpmError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], TpmError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// # Errors
    ///
    /// Returns `TpmError::Truncated` on a short buffer.
    pub fn read_u8(&mut self) -> Result<u8, TpmError> {
        Ok(self.take(1)?[0])
    }

    /// # Errors
    ///
    /// Returns `TpmError::Truncated` on a short buffer.
    pub fn read_u16(&mut self) -> Result<u16, TpmError> {
        self.take_array().map(u16::from_be_bytes)
    }

    /// # Errors
    ///
    /// Returns `TpmError::Truncated` on a short buffer.
    pub fn read_u32(&mut self) -> Result<u32, TpmError> {
        self.take_array().map(u32::from_be_bytes)
    }

    /// # Errors
    ///
    /// Returns `TpmError::Truncated` on a short buffer.
    pub fn read_u64(&mut self) -> Result<u64, TpmError> {
        self.take_array().map(u64::from_be_bytes)
    }

    /// # Errors
    ///
    /// Returns `TpmError::Truncated` on a short buffer.
    pub fn read_digest(&mut self) -> Result<TpmDigest, TpmError> {
        self.take_array()
    }

    /// Reads a `u32` length followed by that many bytes.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Truncated` on a short buffer.
    pub fn read_sized(&mut self) -> Result<&'a [u8], TpmError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Parses a nested structure at the current position.
    ///
    /// # Errors
    ///
    /// Propagates the error of the nested decoder.
    pub fn read<T: TpmDecode>(&mut self) -> Result<T, TpmError> {
        let (value, next) = T::decode(self.data, self.pos)?;
        self.pos = next;
        Ok(value)
    }

    /// Returns the rest of the buffer.
    #[must_use]
    pub fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        bytes
    }
}

/// Appends big-endian primitives to a byte vector.
pub(crate) trait PutExt {
    fn put_u8(&mut self, v: u8);
    fn put_u16(&mut self, v: u16);
    fn put_u32(&mut self, v: u32);
    fn put_u64(&mut self, v: u64);
    fn put_bytes(&mut self, bytes: &[u8]);
}

impl PutExt for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Converts a length to a `u32` wire field.
///
/// # Errors
///
/// Returns `TpmError::Protocol` if the length does not fit.
pub fn wire_u32(len: usize) -> Result<u32, TpmError> {
    u32::try_from(len).map_err(|_| TpmError::Protocol(format!("length {len} exceeds u32")))
}

/// Builder for a TPM 1.2 command: `tag, size, ordinal, body`.
#[derive(Debug)]
pub struct TpmCommand {
    buf: Vec<u8>,
}

impl TpmCommand {
    #[must_use]
    pub fn new(tag: u16, ordinal: u32) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.put_u16(tag);
        buf.put_u32(0);
        buf.put_u32(ordinal);
        Self { buf }
    }

    pub fn add_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn add_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn add_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_bytes(bytes);
        self
    }

    /// Appends a `u32` length prefix followed by `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Protocol` if the length does not fit in `u32`.
    pub fn add_sized(&mut self, bytes: &[u8]) -> Result<&mut Self, TpmError> {
        self.buf.put_u32(wire_u32(bytes.len())?);
        self.buf.put_bytes(bytes);
        Ok(self)
    }

    /// Writes the final size into the header and returns the buffer.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Protocol` if the command is too large.
    pub fn finalize(mut self) -> Result<Vec<u8>, TpmError> {
        let size = wire_u32(self.buf.len())?;
        self.buf[2..6].copy_from_slice(&size.to_be_bytes());
        Ok(self.buf)
    }
}

/// Parsed response header plus the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmResponse {
    pub tag: u16,
    pub rc: u32,
    pub bytes: Vec<u8>,
}

impl TpmResponse {
    /// Parses the 10-byte header and checks the size field.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Protocol` if the header is short or the size field
    /// disagrees with the buffer length.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, TpmError> {
        if bytes.len() < TPM_HEADER_SIZE {
            return Err(TpmError::Protocol(format!(
                "response of {} bytes is shorter than the header",
                bytes.len()
            )));
        }
        let mut reader = TpmReader::new(&bytes);
        let tag = reader.read_u16()?;
        let size = reader.read_u32()? as usize;
        let rc = reader.read_u32()?;
        if size != bytes.len() {
            return Err(TpmError::Protocol(format!(
                "response size field {size} does not match {} received bytes",
                bytes.len()
            )));
        }
        Ok(Self { tag, rc, bytes })
    }

    /// Response parameters, starting at the data offset.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.bytes[TPM_HEADER_SIZE..]
    }

    #[must_use]
    pub fn reader(&self) -> TpmReader<'_> {
        TpmReader::new(self.data())
    }
}
