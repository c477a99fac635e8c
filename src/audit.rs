// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Transport log structures and the in-memory command audit log.

use crate::{
    constants::{
        tpm_tag, TPM_AUTH_REQUEST_SIZE, TPM_DIGEST_SIZE, TPM_HEADER_SIZE, TPM_U32_SIZE,
    },
    crypto::{random_nonce, sha1_digest},
    marshal::{PutExt, TpmDecode, TpmDigest, TpmEncode, TpmNonce, TpmReader},
    pcr::expect_tag,
    TpmError,
};
use log::trace;
use std::time::Instant;

/// `TPM_CURRENT_TICKS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentTicks {
    pub current_ticks: u64,
    /// Microseconds per tick.
    pub tick_rate: u16,
    pub tick_nonce: TpmNonce,
}

impl TpmEncode for CurrentTicks {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, TpmError> {
        buf.put_u16(tpm_tag::CURRENT_TICKS);
        buf.put_u64(self.current_ticks);
        buf.put_u16(self.tick_rate);
        buf.put_bytes(&self.tick_nonce);
        Ok(2 + 8 + 2 + TPM_DIGEST_SIZE)
    }
}

impl TpmDecode for CurrentTicks {
    fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize), TpmError> {
        let mut reader = TpmReader::at(buf, offset);
        expect_tag(&mut reader, tpm_tag::CURRENT_TICKS, "TPM_CURRENT_TICKS")?;
        let current_ticks = reader.read_u64()?;
        let tick_rate = reader.read_u16()?;
        let tick_nonce = reader.read_digest()?;
        Ok((
            Self {
                current_ticks,
                tick_rate,
                tick_nonce,
            },
            reader.position(),
        ))
    }
}

/// `TPM_TRANSPORT_LOG_IN`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportLogIn {
    pub parameters: TpmDigest,
    pub pub_key_hash: TpmDigest,
}

impl TpmEncode for TransportLogIn {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, TpmError> {
        buf.put_u16(tpm_tag::TRANSPORT_LOG_IN);
        buf.put_bytes(&self.parameters);
        buf.put_bytes(&self.pub_key_hash);
        Ok(2 + 2 * TPM_DIGEST_SIZE)
    }
}

impl TpmDecode for TransportLogIn {
    fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize), TpmError> {
        let mut reader = TpmReader::at(buf, offset);
        expect_tag(&mut reader, tpm_tag::TRANSPORT_LOG_IN, "TPM_TRANSPORT_LOG_IN")?;
        let parameters = reader.read_digest()?;
        let pub_key_hash = reader.read_digest()?;
        Ok((
            Self {
                parameters,
                pub_key_hash,
            },
            reader.position(),
        ))
    }
}

/// `TPM_TRANSPORT_LOG_OUT`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportLogOut {
    pub current_ticks: CurrentTicks,
    pub parameters: TpmDigest,
    pub locality: u32,
}

impl TpmEncode for TransportLogOut {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, TpmError> {
        buf.put_u16(tpm_tag::TRANSPORT_LOG_OUT);
        let ticks = self.current_ticks.encode(buf)?;
        buf.put_bytes(&self.parameters);
        buf.put_u32(self.locality);
        Ok(2 + ticks + TPM_DIGEST_SIZE + 4)
    }
}

impl TpmDecode for TransportLogOut {
    fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize), TpmError> {
        let mut reader = TpmReader::at(buf, offset);
        expect_tag(&mut reader, tpm_tag::TRANSPORT_LOG_OUT, "TPM_TRANSPORT_LOG_OUT")?;
        let current_ticks = reader.read()?;
        let parameters = reader.read_digest()?;
        let locality = reader.read_u32()?;
        Ok((
            Self {
                current_ticks,
                parameters,
                locality,
            },
            reader.position(),
        ))
    }
}

/// One audited command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportLogEntry {
    pub ordinal: u32,
    pub log_in: TransportLogIn,
    pub log_out: TransportLogOut,
}

/// Records a log-in/log-out pair for every command sent over the logged
/// channel of a device.
#[derive(Debug)]
pub struct TransportLog {
    start: Instant,
    tick_nonce: TpmNonce,
    locality: u32,
    entries: Vec<TransportLogEntry>,
}

impl Default for TransportLog {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TransportLog {
    #[must_use]
    pub fn new(locality: u32) -> Self {
        Self {
            start: Instant::now(),
            tick_nonce: random_nonce(),
            locality,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[TransportLogEntry] {
        &self.entries
    }

    /// Records a command and its response. Both buffers must carry a full
    /// header. The first `handles` words after the header are handles and,
    /// like the authorization trailer implied by the tag, stay out of the
    /// input parameter digest.
    pub fn record(&mut self, command: &[u8], handles: usize, response: &[u8]) {
        if command.len() < TPM_HEADER_SIZE || response.len() < TPM_HEADER_SIZE {
            return;
        }
        let ordinal_bytes = &command[6..TPM_HEADER_SIZE];
        let ordinal = u32::from_be_bytes([
            ordinal_bytes[0],
            ordinal_bytes[1],
            ordinal_bytes[2],
            ordinal_bytes[3],
        ]);
        let trailer = match u16::from_be_bytes([command[0], command[1]]) {
            tpm_tag::RQU_AUTH1_COMMAND => TPM_AUTH_REQUEST_SIZE,
            tpm_tag::RQU_AUTH2_COMMAND => 2 * TPM_AUTH_REQUEST_SIZE,
            _ => 0,
        };
        let params_start = (TPM_HEADER_SIZE + handles * TPM_U32_SIZE).min(command.len());
        let params_end = command.len().saturating_sub(trailer).max(params_start);
        let log_in = TransportLogIn {
            parameters: sha1_digest(&[ordinal_bytes, &command[params_start..params_end]]),
            pub_key_hash: [0u8; TPM_DIGEST_SIZE],
        };
        let micros = u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX);
        let log_out = TransportLogOut {
            current_ticks: CurrentTicks {
                current_ticks: micros,
                tick_rate: 1,
                tick_nonce: self.tick_nonce,
            },
            parameters: sha1_digest(&[
                &response[6..TPM_HEADER_SIZE],
                ordinal_bytes,
                &response[TPM_HEADER_SIZE..],
            ]),
            locality: self.locality,
        };
        trace!(target: "tpmkey::audit", "ordinal {ordinal:#010x} at tick {micros}");
        self.entries.push(TransportLogEntry {
            ordinal,
            log_in,
            log_out,
        });
    }
}
