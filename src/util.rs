// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::TpmError;
use std::{fs, path::Path};

/// Parses a hex string (with or without a "0x" prefix) into a u32.
///
/// # Errors
///
/// Returns `TpmError::Protocol` if the string is not a valid hex integer.
pub fn parse_hex_u32(s: &str) -> Result<u32, TpmError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(digits, 16)
        .map_err(|e| TpmError::Protocol(format!("invalid hex value '{s}': {e}")))
}

/// Reads a whole file.
///
/// # Errors
///
/// Returns `TpmError::BadFile` if the file cannot be read.
pub fn read_file(path: &Path) -> Result<Vec<u8>, TpmError> {
    fs::read(path).map_err(|e| TpmError::BadFile(format!("{}: {e}", path.display())))
}

/// Writes `data` to a file, replacing its contents. A failed write removes
/// the partial file.
///
/// # Errors
///
/// Returns `TpmError::BadFile` if the file cannot be written.
pub fn write_file(path: &Path, data: &[u8]) -> Result<(), TpmError> {
    fs::write(path, data).map_err(|e| {
        let _ = fs::remove_file(path);
        TpmError::BadFile(format!("{}: {e}", path.display()))
    })
}
