// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Settings resolved once from the environment or the command line.

use std::{env, fmt, path::PathBuf, str::FromStr};

pub const ENV_INSTANCE: &str = "TPM_INSTANCE";
pub const ENV_KEY_BLOB: &str = "TPM_DSAP_KEYBLOB";
pub const ENV_OWNER_BLOB: &str = "TPM_DSAP_OWNERBLOB";
pub const ENV_VERSION: &str = "TPM_VERSION";
pub const ENV_DELEGATION_DIR: &str = "TPM_DELEGATION_DIR";

pub const DEFAULT_INSTANCE: &str = "0";
pub const DEFAULT_DELEGATION_DIR: &str = "/tmp";

/// Command set revision spoken by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// TPM 1.1: keys are removed with `TPM_EvictKey`.
    #[default]
    V11,
    /// TPM 1.2: keys are removed with `TPM_FlushSpecific`.
    V12,
}

impl FromStr for ProtocolVersion {
    type Err = std::convert::Infallible;

    /// `"11"` selects 1.1, every other value selects 1.2.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s == "11" { Self::V11 } else { Self::V12 })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V11 => write!(f, "11"),
            Self::V12 => write!(f, "12"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Selects the delegation store file `<dir>/.delegation-<instance>`.
    pub instance: String,
    pub delegation_dir: PathBuf,
    /// File read in place of a store lookup for delegated key blobs.
    pub key_blob_override: Option<PathBuf>,
    /// File read in place of a store lookup for delegated owner blobs.
    pub owner_blob_override: Option<PathBuf>,
    pub version: ProtocolVersion,
    /// Accept a saved context whose length field disagrees with the
    /// response, logging a warning instead of failing.
    pub lenient_context_length: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance: DEFAULT_INSTANCE.to_string(),
            delegation_dir: PathBuf::from(DEFAULT_DELEGATION_DIR),
            key_blob_override: None,
            owner_blob_override: None,
            version: ProtocolVersion::default(),
            lenient_context_length: false,
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var_os(name).map(|v| v.to_string_lossy().into_owned()))
    }

    /// Builds the configuration from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let version = match lookup(ENV_VERSION) {
            Some(v) => v.parse().unwrap_or_default(),
            None => ProtocolVersion::V11,
        };
        Self {
            instance: lookup(ENV_INSTANCE).unwrap_or(defaults.instance),
            delegation_dir: lookup(ENV_DELEGATION_DIR)
                .map_or(defaults.delegation_dir, PathBuf::from),
            key_blob_override: lookup(ENV_KEY_BLOB).map(PathBuf::from),
            owner_blob_override: lookup(ENV_OWNER_BLOB).map(PathBuf::from),
            version,
            lenient_context_length: false,
        }
    }

    /// Path of the delegation store file for this instance.
    #[must_use]
    pub fn delegation_file(&self) -> PathBuf {
        self.delegation_dir
            .join(format!(".delegation-{}", self.instance))
    }
}
