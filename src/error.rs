// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::constants::tpm_rc;
use std::{fmt, io::Error as IoError};
use thiserror::Error;

/// Flag carried by every locally generated error code. Device return codes
/// never have it set.
pub const TPM_LOCAL_ERROR_FLAG: u32 = 0x8000_0000;

/// A return code reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TpmRc(pub u32);

impl TpmRc {
    #[must_use]
    pub fn is_non_fatal(self) -> bool {
        self.0 & tpm_rc::NON_FATAL != 0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            tpm_rc::AUTHFAIL => "TPM_AUTHFAIL",
            tpm_rc::BADINDEX => "TPM_BADINDEX",
            tpm_rc::BAD_PARAMETER => "TPM_BAD_PARAMETER",
            tpm_rc::BAD_ORDINAL => "TPM_BAD_ORDINAL",
            tpm_rc::INVALID_KEYHANDLE => "TPM_INVALID_KEYHANDLE",
            tpm_rc::RESOURCES => "TPM_RESOURCES",
            tpm_rc::BAD_PARAM_SIZE => "TPM_BAD_PARAM_SIZE",
            tpm_rc::AUTH2FAIL => "TPM_AUTH2FAIL",
            tpm_rc::BADTAG => "TPM_BADTAG",
            tpm_rc::INVALID_AUTHHANDLE => "TPM_INVALID_AUTHHANDLE",
            tpm_rc::BADCONTEXT => "TPM_BADCONTEXT",
            _ => return None,
        })
    }
}

impl fmt::Display for TpmRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#010x})", self.0),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

#[derive(Debug, Error)]
pub enum TpmError {
    #[error("authorization failed: response HMAC mismatch")]
    AuthFailed,

    #[error("bad file: {0}")]
    BadFile(String),

    #[error("buffer too small: {needed} bytes needed, {available} available")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("environment variable not set: {0}")]
    EnvVariable(&'static str),

    #[error("'{0}': {1}")]
    File(String, #[source] IoError),

    #[error("HMAC: {0}")]
    Hmac(String),

    #[error("I/O: {0}")]
    Io(#[from] IoError),

    #[error("not found")]
    NotFound,

    #[error("null argument: {0}")]
    NullArgument(&'static str),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("{0}")]
    Tpm(TpmRc),

    #[error("transport: {0}")]
    Transport(String),

    #[error("truncated: {needed} bytes needed, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
}

impl TpmError {
    /// Numeric error code. Local errors carry [`TPM_LOCAL_ERROR_FLAG`], device
    /// return codes are passed through unchanged.
    #[must_use]
    pub fn code(&self) -> u32 {
        let local = match self {
            Self::Tpm(rc) => return rc.0,
            Self::AuthFailed => 0x01,
            Self::NullArgument(_) => 0x02,
            Self::Hmac(_) => 0x04,
            Self::Io(_) | Self::File(..) | Self::Transport(_) => 0x05,
            Self::BadFile(_) => 0x07,
            Self::Truncated { .. } => 0x09,
            Self::BufferTooSmall { .. } => 0x0A,
            Self::Protocol(_) => 0x0B,
            Self::EnvVariable(_) => 0x0D,
            Self::NotFound => 0x0F,
        };
        TPM_LOCAL_ERROR_FLAG | local
    }

    /// Returns `true` if the device answered with the given return code.
    #[must_use]
    pub fn is_tpm_rc(&self, rc: u32) -> bool {
        matches!(self, Self::Tpm(TpmRc(code)) if *code == rc)
    }
}
