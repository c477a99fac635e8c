// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    config::{
        Config, ProtocolVersion, DEFAULT_DELEGATION_DIR, DEFAULT_INSTANCE, ENV_DELEGATION_DIR,
        ENV_INSTANCE, ENV_KEY_BLOB, ENV_OWNER_BLOB, ENV_VERSION,
    },
    crypto::{auth_from_password, WELL_KNOWN_SECRET},
    nv::NV_DEFAULT_READ_SIZE,
    util::{parse_hex_u32, read_file, write_file},
    TpmContext, TpmError,
};
use clap::{
    builder::styling::{AnsiColor, Color, Style, Styles},
    Parser,
};
use log::info;
use std::{fmt, io::Write, path::PathBuf, str::FromStr};

const STYLES: Styles = Styles::styled()
    .header(Style::new().bold())
    .usage(Style::new().bold())
    .literal(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Green))))
    .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow))));

const USAGE_TEMPLATE: &str = "
{about-with-newline}
{usage-heading} {usage}

{positionals}

{options-heading}
{options}
";

/// Where the sealed blob comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    File(PathBuf),
    Nv(u32),
}

impl FromStr for Source {
    type Err = TpmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("nv:") {
            Some(index) => parse_hex_u32(index).map(Self::Nv),
            None => Ok(Self::File(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Nv(index) => write!(f, "nv:{index:#010x}"),
        }
    }
}

/// Unseal a TPM 1.2 sealed blob
#[derive(Parser, Debug)]
#[command(version, about, styles = STYLES, help_template = USAGE_TEMPLATE)]
pub struct Cli {
    #[arg(value_name = "SOURCE", help = "Sealed blob file or 'nv:<hex index>'")]
    pub source: Source,

    #[arg(value_name = "OUTPUT", help = "Output file (default: stdout)")]
    pub output: Option<PathBuf>,

    #[arg(short = 'd', long, default_value = "/dev/tpm0", help = "TPM device path")]
    pub device: String,

    #[arg(
        long,
        value_parser = parse_hex_u32,
        default_value = "0x40000000",
        help = "Handle of the key the blob is sealed under"
    )]
    pub parent: u32,

    #[arg(long, help = "Password of the parent key (default: well-known secret)")]
    pub key_password: Option<String>,

    #[arg(long, help = "Password of the sealed data (default: well-known secret)")]
    pub data_password: Option<String>,

    #[arg(long, help = "Owner password for reading an owner-protected NV index")]
    pub owner_password: Option<String>,

    #[arg(long, default_value_t = NV_DEFAULT_READ_SIZE, help = "Bytes to read from NV")]
    pub nv_size: u32,

    #[arg(long, env = ENV_INSTANCE, default_value = DEFAULT_INSTANCE, help = "TPM instance")]
    pub instance: String,

    #[arg(
        long,
        env = ENV_DELEGATION_DIR,
        default_value = DEFAULT_DELEGATION_DIR,
        help = "Directory of the delegation store"
    )]
    pub delegation_dir: PathBuf,

    #[arg(long, env = ENV_KEY_BLOB, help = "Delegated key blob file")]
    pub key_blob: Option<PathBuf>,

    #[arg(long, env = ENV_OWNER_BLOB, help = "Delegated owner blob file")]
    pub owner_blob: Option<PathBuf>,

    #[arg(long, env = ENV_VERSION, help = "TPM version ('11' or '12')")]
    pub tpm_version: Option<String>,

    #[arg(long, help = "Accept saved contexts with a mismatching size field")]
    pub lenient_context_length: bool,
}

impl Cli {
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            instance: self.instance.clone(),
            delegation_dir: self.delegation_dir.clone(),
            key_blob_override: self.key_blob.clone(),
            owner_blob_override: self.owner_blob.clone(),
            version: self
                .tpm_version
                .as_deref()
                .map_or(ProtocolVersion::V11, |v| v.parse().unwrap_or_default()),
            lenient_context_length: self.lenient_context_length,
        }
    }

    /// Reads the blob, unseals it and writes the plaintext to the output
    /// file or to `writer`. The output file is only created once the
    /// plaintext is in hand.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if any step fails.
    pub fn run<W: Write>(&self, tpm: &mut TpmContext, writer: &mut W) -> Result<(), TpmError> {
        let owner_auth = self.owner_password.as_deref().map(auth_from_password);
        let key_auth = self
            .key_password
            .as_deref()
            .map_or(WELL_KNOWN_SECRET, auth_from_password);
        let data_auth = self.data_password.as_deref().map(auth_from_password);

        let blob = match &self.source {
            Source::File(path) => read_file(path)?,
            Source::Nv(index) => tpm.nv_read_value(*index, 0, self.nv_size, owner_auth.as_ref())?,
        };
        let data = tpm.unseal_to_vec(self.parent, Some(&key_auth), data_auth.as_ref(), &blob)?;
        info!("unsealed {} bytes from {}", data.len(), self.source);

        match &self.output {
            Some(path) => write_file(path, &data),
            None => {
                writer.write_all(&data)?;
                writer.flush()?;
                Ok(())
            }
        }
    }
}
