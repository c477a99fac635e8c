// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

#![deny(clippy::all)]
#![deny(clippy::pedantic)]

pub mod audit;
pub mod auth;
pub mod cli;
pub mod config;
pub mod constants;
pub mod context;
pub mod crypto;
pub mod delegation;
pub mod device;
pub mod error;
pub mod marshal;
pub mod mocktpm;
pub mod nv;
pub mod pcr;
pub mod room;
pub mod seal;
pub mod session;
pub mod tpm;
pub mod transport;
pub mod util;

pub use crate::{
    config::Config,
    device::TpmDevice,
    error::{TpmError, TpmRc},
    tpm::TpmContext,
};

use crate::cli::Cli;
use clap::Parser;
use std::io;

/// Parses command-line arguments, unseals the requested blob and writes the
/// plaintext out.
///
/// # Errors
///
/// Returns a `TpmError` if opening the device, reading the blob, unsealing
/// or writing the output fails.
pub fn execute_cli() -> Result<(), TpmError> {
    let cli = Cli::parse();
    let device = TpmDevice::open(&cli.device)?;
    let mut tpm = TpmContext::new(device, cli.config());
    cli.run(&mut tpm, &mut io::stdout().lock())
}
