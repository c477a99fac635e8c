// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Platform Configuration Register structures.
//!
//! A selection with an empty mask is not legal wire data. Every encoder in
//! this module writes such a selection as the standard all-zero mask of
//! [`TPM_PCR_SELECT_SIZE`] bytes. Decoders return exactly what was on the
//! wire.

use crate::{
    constants::{tpm_tag, TPM_DIGEST_SIZE, TPM_PCR_SELECT_SIZE},
    marshal::{wire_u32, PutExt, TpmDecode, TpmDigest, TpmEncode, TpmReader},
    TpmError,
};

/// `TPM_PCR_SELECTION`: a bitmask over PCR indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrSelection {
    pub mask: Vec<u8>,
}

impl PcrSelection {
    /// Builds a standard-width selection from a list of PCR indices.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Protocol` if an index is outside the mask.
    pub fn from_indices(indices: &[u32]) -> Result<Self, TpmError> {
        let mut mask = vec![0u8; TPM_PCR_SELECT_SIZE];
        for &index in indices {
            let index = index as usize;
            if index >= TPM_PCR_SELECT_SIZE * 8 {
                return Err(TpmError::Protocol(format!(
                    "PCR index {index} out of range (max is {})",
                    TPM_PCR_SELECT_SIZE * 8 - 1
                )));
            }
            mask[index / 8] |= 1 << (index % 8);
        }
        Ok(Self { mask })
    }

    /// Indices of the selected PCRs in ascending order.
    #[must_use]
    pub fn indices(&self) -> Vec<u32> {
        let mut indices = Vec::new();
        for (byte_idx, &byte) in self.mask.iter().enumerate() {
            for bit_idx in 0..8 {
                if (byte >> bit_idx) & 1 == 1 {
                    #[allow(clippy::cast_possible_truncation)]
                    indices.push((byte_idx * 8 + bit_idx) as u32);
                }
            }
        }
        indices
    }

    /// The mask as it goes on the wire.
    fn wire_mask(&self) -> std::borrow::Cow<'_, [u8]> {
        if self.mask.is_empty() {
            std::borrow::Cow::Owned(vec![0u8; TPM_PCR_SELECT_SIZE])
        } else {
            std::borrow::Cow::Borrowed(&self.mask)
        }
    }
}

impl TpmEncode for PcrSelection {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, TpmError> {
        let mask = self.wire_mask();
        let size = u16::try_from(mask.len()).map_err(|_| {
            TpmError::Protocol(format!("PCR selection of {} bytes", mask.len()))
        })?;
        buf.put_u16(size);
        buf.put_bytes(&mask);
        Ok(2 + mask.len())
    }
}

impl TpmDecode for PcrSelection {
    fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize), TpmError> {
        let mut reader = TpmReader::at(buf, offset);
        let size = reader.read_u16()? as usize;
        let mask = reader.take(size)?.to_vec();
        Ok((Self { mask }, reader.position()))
    }
}

/// `TPM_PCR_COMPOSITE`: a selection with the values of the selected PCRs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrComposite {
    pub select: PcrSelection,
    pub values: Vec<TpmDigest>,
}

impl TpmEncode for PcrComposite {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, TpmError> {
        let mut written = self.select.encode(buf)?;
        let value_size = wire_u32(self.values.len() * TPM_DIGEST_SIZE)?;
        buf.put_u32(value_size);
        for value in &self.values {
            buf.put_bytes(value);
        }
        written += 4 + value_size as usize;
        Ok(written)
    }
}

impl TpmDecode for PcrComposite {
    fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize), TpmError> {
        let mut reader = TpmReader::at(buf, offset);
        let select = reader.read()?;
        let raw = reader.read_sized()?;
        if raw.len() % TPM_DIGEST_SIZE != 0 {
            return Err(TpmError::Protocol(format!(
                "PCR composite value size {} is not a multiple of {TPM_DIGEST_SIZE}",
                raw.len()
            )));
        }
        let values = raw
            .chunks_exact(TPM_DIGEST_SIZE)
            .map(|chunk| {
                let mut digest = [0u8; TPM_DIGEST_SIZE];
                digest.copy_from_slice(chunk);
                digest
            })
            .collect();
        Ok((Self { select, values }, reader.position()))
    }
}

/// `TPM_PCR_INFO`, the TPM 1.1 layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrInfo {
    pub select: PcrSelection,
    pub digest_at_release: TpmDigest,
    pub digest_at_creation: TpmDigest,
}

impl TpmEncode for PcrInfo {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, TpmError> {
        let written = self.select.encode(buf)?;
        buf.put_bytes(&self.digest_at_release);
        buf.put_bytes(&self.digest_at_creation);
        Ok(written + 2 * TPM_DIGEST_SIZE)
    }
}

impl TpmDecode for PcrInfo {
    fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize), TpmError> {
        let mut reader = TpmReader::at(buf, offset);
        let select = reader.read()?;
        let digest_at_release = reader.read_digest()?;
        let digest_at_creation = reader.read_digest()?;
        Ok((
            Self {
                select,
                digest_at_release,
                digest_at_creation,
            },
            reader.position(),
        ))
    }
}

/// `TPM_PCR_INFO_SHORT`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrInfoShort {
    pub select: PcrSelection,
    pub locality_at_release: u8,
    pub digest_at_release: TpmDigest,
}

impl TpmEncode for PcrInfoShort {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, TpmError> {
        let written = self.select.encode(buf)?;
        buf.put_u8(self.locality_at_release);
        buf.put_bytes(&self.digest_at_release);
        Ok(written + 1 + TPM_DIGEST_SIZE)
    }
}

impl TpmDecode for PcrInfoShort {
    fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize), TpmError> {
        let mut reader = TpmReader::at(buf, offset);
        let select = reader.read()?;
        let locality_at_release = reader.read_u8()?;
        let digest_at_release = reader.read_digest()?;
        Ok((
            Self {
                select,
                locality_at_release,
                digest_at_release,
            },
            reader.position(),
        ))
    }
}

/// `TPM_PCR_INFO_LONG`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrInfoLong {
    pub locality_at_creation: u8,
    pub locality_at_release: u8,
    pub creation_select: PcrSelection,
    pub release_select: PcrSelection,
    pub digest_at_creation: TpmDigest,
    pub digest_at_release: TpmDigest,
}

impl TpmEncode for PcrInfoLong {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, TpmError> {
        buf.put_u16(tpm_tag::PCR_INFO_LONG);
        buf.put_u8(self.locality_at_creation);
        buf.put_u8(self.locality_at_release);
        let mut written = 4;
        written += self.creation_select.encode(buf)?;
        written += self.release_select.encode(buf)?;
        buf.put_bytes(&self.digest_at_creation);
        buf.put_bytes(&self.digest_at_release);
        Ok(written + 2 * TPM_DIGEST_SIZE)
    }
}

impl TpmDecode for PcrInfoLong {
    fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize), TpmError> {
        let mut reader = TpmReader::at(buf, offset);
        expect_tag(&mut reader, tpm_tag::PCR_INFO_LONG, "TPM_PCR_INFO_LONG")?;
        let locality_at_creation = reader.read_u8()?;
        let locality_at_release = reader.read_u8()?;
        let creation_select = reader.read()?;
        let release_select = reader.read()?;
        let digest_at_creation = reader.read_digest()?;
        let digest_at_release = reader.read_digest()?;
        Ok((
            Self {
                locality_at_creation,
                locality_at_release,
                creation_select,
                release_select,
                digest_at_creation,
                digest_at_release,
            },
            reader.position(),
        ))
    }
}

/// Reads a structure tag and rejects any other value.
pub(crate) fn expect_tag(
    reader: &mut TpmReader<'_>,
    expected: u16,
    name: &str,
) -> Result<(), TpmError> {
    let tag = reader.read_u16()?;
    if tag == expected {
        Ok(())
    } else {
        Err(TpmError::Protocol(format!(
            "{name}: unexpected tag {tag:#06x} (expected {expected:#06x})"
        )))
    }
}
