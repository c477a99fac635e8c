// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! File-backed store of delegation blobs.
//!
//! The store is a sequence of records, each a fixed header followed by the
//! blob. There is no record count: the first short header read marks the end
//! of valid data. Integers are little-endian. Records are appended by a
//! provisioning step outside of this crate and never rewritten here.

use crate::{
    config::{Config, ENV_KEY_BLOB, ENV_OWNER_BLOB},
    constants::{tpm_et, TPM_DIGEST_SIZE},
    marshal::TpmDigest,
    TpmError,
};
use log::{debug, warn};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

/// Size of a record header on disk.
pub const DELEGATION_HEADER_SIZE: usize = 4 + 4 + TPM_DIGEST_SIZE + 4 + 2 * TPM_DIGEST_SIZE;

/// Header of one store record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelegationHeader {
    pub entity_type: u32,
    pub key_handle: u32,
    pub key_digest: TpmDigest,
    pub blob_size: u32,
    pub pass_hash: TpmDigest,
    pub old_pass_hash: TpmDigest,
}

impl DelegationHeader {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; DELEGATION_HEADER_SIZE] {
        let mut out = [0u8; DELEGATION_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.entity_type.to_le_bytes());
        out[4..8].copy_from_slice(&self.key_handle.to_le_bytes());
        out[8..28].copy_from_slice(&self.key_digest);
        out[28..32].copy_from_slice(&self.blob_size.to_le_bytes());
        out[32..52].copy_from_slice(&self.pass_hash);
        out[52..72].copy_from_slice(&self.old_pass_hash);
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; DELEGATION_HEADER_SIZE]) -> Self {
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let digest_at = |at: usize| {
            let mut digest = [0u8; TPM_DIGEST_SIZE];
            digest.copy_from_slice(&bytes[at..at + TPM_DIGEST_SIZE]);
            digest
        };
        Self {
            entity_type: u32_at(0),
            key_handle: u32_at(4),
            key_digest: digest_at(8),
            blob_size: u32_at(28),
            pass_hash: digest_at(32),
            old_pass_hash: digest_at(52),
        }
    }
}

/// A record found in the store, or the contents of an override file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationEntry {
    /// `None` when the blob came from an override file.
    pub header: Option<DelegationHeader>,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DelegationStore {
    path: PathBuf,
    key_blob_override: Option<PathBuf>,
    owner_blob_override: Option<PathBuf>,
}

impl DelegationStore {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.delegation_file(),
            key_blob_override: config.key_blob_override.clone(),
            owner_blob_override: config.owner_blob_override.clone(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Looks up the blob for `(entity_type, key_handle)`.
    ///
    /// # Errors
    ///
    /// See [`DelegationStore::find_into`].
    pub fn find(&self, entity_type: u32, key_handle: u32) -> Result<DelegationEntry, TpmError> {
        self.lookup(entity_type, key_handle, usize::MAX)
    }

    /// Looks up the blob for `(entity_type, key_handle)` and copies it into
    /// `buf`, returning its length.
    ///
    /// An override file for the entity type is returned verbatim and bypasses
    /// the store. Otherwise the first matching record wins.
    ///
    /// # Errors
    ///
    /// - `TpmError::BufferTooSmall` if `buf` cannot hold the blob.
    /// - `TpmError::NotFound` if no record matches.
    /// - `TpmError::BadFile` if a matching record is cut short.
    /// - `TpmError::EnvVariable` if the entity type has no override set and
    ///   the store file cannot be opened.
    pub fn find_into(
        &self,
        entity_type: u32,
        key_handle: u32,
        buf: &mut [u8],
    ) -> Result<usize, TpmError> {
        let entry = self.lookup(entity_type, key_handle, buf.len())?;
        buf[..entry.blob.len()].copy_from_slice(&entry.blob);
        Ok(entry.blob.len())
    }

    fn lookup(
        &self,
        entity_type: u32,
        key_handle: u32,
        capacity: usize,
    ) -> Result<DelegationEntry, TpmError> {
        let (override_var, override_path) = match u16::try_from(entity_type) {
            Ok(tpm_et::DEL_KEY_BLOB) => (Some(ENV_KEY_BLOB), self.key_blob_override.as_deref()),
            Ok(tpm_et::DEL_OWNER_BLOB) => {
                (Some(ENV_OWNER_BLOB), self.owner_blob_override.as_deref())
            }
            _ => (None, None),
        };

        if let Some(path) = override_path {
            match read_override(path, capacity) {
                Ok(Some(blob)) => {
                    debug!(target: "tpmkey::delegation", "using override file {}", path.display());
                    return Ok(DelegationEntry { header: None, blob });
                }
                Ok(None) => {
                    warn!(target: "tpmkey::delegation", "override file {} is not readable", path.display());
                }
                Err(e) => return Err(e),
            }
        }

        let mut file = match open_store(&self.path) {
            Ok(file) => file,
            Err(e) => {
                return Err(match override_var {
                    Some(var) if override_path.is_none() => TpmError::EnvVariable(var),
                    _ => TpmError::File(self.path.display().to_string(), e),
                })
            }
        };
        scan(&mut file, entity_type, key_handle, capacity)
    }
}

/// Reads an override file. `Ok(None)` means the file could not be opened.
fn read_override(path: &Path, capacity: usize) -> Result<Option<Vec<u8>>, TpmError> {
    let Ok(mut file) = File::open(path) else {
        return Ok(None);
    };
    let size = file
        .metadata()
        .map_err(|e| TpmError::File(path.display().to_string(), e))?
        .len();
    let size = usize::try_from(size).unwrap_or(usize::MAX);
    if size > capacity {
        return Err(TpmError::BufferTooSmall {
            needed: size,
            available: capacity,
        });
    }
    let mut blob = Vec::with_capacity(size);
    file.read_to_end(&mut blob)
        .map_err(|e| TpmError::File(path.display().to_string(), e))?;
    Ok(Some(blob))
}

fn open_store(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o700)
        .open(path)
}

/// Reads exactly `buf.len()` bytes. `Ok(false)` on a short read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, TpmError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(TpmError::Io(e)),
    }
}

fn scan<R: Read + Seek>(
    reader: &mut R,
    entity_type: u32,
    key_handle: u32,
    capacity: usize,
) -> Result<DelegationEntry, TpmError> {
    let mut raw = [0u8; DELEGATION_HEADER_SIZE];
    let mut index = 0usize;
    loop {
        if !read_full(reader, &mut raw)? {
            debug!(target: "tpmkey::delegation", "no match in {index} records");
            return Err(TpmError::NotFound);
        }
        let header = DelegationHeader::from_bytes(&raw);
        if header.entity_type == entity_type && header.key_handle == key_handle {
            let size = header.blob_size as usize;
            if size > capacity {
                return Err(TpmError::BufferTooSmall {
                    needed: size,
                    available: capacity,
                });
            }
            let mut blob = Vec::new();
            reader
                .by_ref()
                .take(u64::from(header.blob_size))
                .read_to_end(&mut blob)?;
            if blob.len() != size {
                return Err(TpmError::BadFile(format!(
                    "record {index}: blob of {size} bytes is truncated"
                )));
            }
            debug!(target: "tpmkey::delegation", "record {index} matches");
            return Ok(DelegationEntry {
                header: Some(header),
                blob,
            });
        }
        reader.seek(SeekFrom::Current(i64::from(header.blob_size)))?;
        index += 1;
    }
}

/// Appends a record to a store file. Used by provisioning tools and tests.
///
/// # Errors
///
/// Returns `TpmError::File` on I/O failure and `TpmError::Protocol` if the
/// blob is larger than the header can describe.
pub fn append_record(
    path: &Path,
    header: &DelegationHeader,
    blob: &[u8],
) -> Result<(), TpmError> {
    use std::io::Write;

    let blob_size = u32::try_from(blob.len())
        .map_err(|_| TpmError::Protocol(format!("blob of {} bytes", blob.len())))?;
    let header = DelegationHeader {
        blob_size,
        ..header.clone()
    };
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o700)
        .open(path)
        .map_err(|e| TpmError::File(path.display().to_string(), e))?;
    file.write_all(&header.to_bytes())
        .and_then(|()| file.write_all(blob))
        .map_err(|e| TpmError::File(path.display().to_string(), e))
}
