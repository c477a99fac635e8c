// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Saving, loading and evicting device resources.

use crate::{
    config::ProtocolVersion,
    constants::{tpm_ord, tpm_rc, tpm_rt, tpm_tag, TPM_CONTEXT_LABEL_SIZE},
    device::Channel,
    marshal::TpmCommand,
    TpmContext, TpmError,
};
use log::{debug, warn};

/// Whether an operation may first make room for the key it acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Run the room-making hook and go through the logged channel.
    WithRoomManagement,
    /// The handle is known to be resident. Skips the hook and uses the direct
    /// channel. Used by the hook itself.
    AssumeResident,
}

impl Residency {
    fn channel(self) -> Channel {
        match self {
            Self::WithRoomManagement => Channel::Logged,
            Self::AssumeResident => Channel::Direct,
        }
    }
}

/// A saved resource context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBlob {
    pub resource_type: u32,
    pub label: [u8; TPM_CONTEXT_LABEL_SIZE],
    pub blob: Vec<u8>,
}

impl TpmContext {
    /// Saves the context of a resident resource.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Protocol` if the size field of the saved context
    /// disagrees with the response and lenient parsing is off, and device and
    /// transport errors unchanged.
    pub fn save_context(
        &mut self,
        handle: u32,
        resource_type: u32,
        label: &[u8; TPM_CONTEXT_LABEL_SIZE],
        residency: Residency,
    ) -> Result<ContextBlob, TpmError> {
        let mut handle = handle;
        if resource_type == tpm_rt::KEY && residency == Residency::WithRoomManagement {
            handle = self.make_room(handle)?;
        }

        let mut cmd = TpmCommand::new(tpm_tag::RQU_COMMAND, tpm_ord::SAVE_CONTEXT);
        cmd.add_u32(handle).add_u32(resource_type).add_bytes(label);
        let response = self.execute(&cmd.finalize()?, "SaveContext", residency.channel())?;

        let mut reader = response.reader();
        let size = reader.read_u32()? as usize;
        let remaining = reader.remaining();
        if size != remaining {
            if !self.config().lenient_context_length {
                return Err(TpmError::Protocol(format!(
                    "context size {size} does not match {remaining} response bytes"
                )));
            }
            warn!(
                target: "tpmkey::context",
                "context size {size} does not match {remaining} response bytes"
            );
        }
        let blob = reader.take(size.min(remaining))?.to_vec();
        debug!(
            target: "tpmkey::context",
            "saved {handle:#010x} ({} bytes)",
            blob.len()
        );
        Ok(ContextBlob {
            resource_type,
            label: *label,
            blob,
        })
    }

    /// Loads a saved context and returns the handle it was given.
    ///
    /// Never makes room: the room-making hook calls this itself.
    ///
    /// # Errors
    ///
    /// Returns device, transport and protocol errors unchanged.
    pub fn load_context(
        &mut self,
        entity_handle: u32,
        keep_handle: bool,
        context: &ContextBlob,
    ) -> Result<u32, TpmError> {
        let mut cmd = TpmCommand::new(tpm_tag::RQU_COMMAND, tpm_ord::LOAD_CONTEXT);
        cmd.add_u32(entity_handle)
            .add_u8(u8::from(keep_handle))
            .add_sized(&context.blob)?;
        let response = self.execute(&cmd.finalize()?, "LoadContext", Channel::Logged)?;
        let handle = response.reader().read_u32()?;
        debug!(target: "tpmkey::context", "loaded {entity_handle:#010x} as {handle:#010x}");
        Ok(handle)
    }

    /// Removes a key from the device. With room management a swapped-out
    /// key is brought back first so that the device can evict it.
    ///
    /// A 1.1 device gets `TPM_EvictKey`, falling back to
    /// `TPM_FlushSpecific` if it does not know the ordinal. A 1.2 device
    /// gets `TPM_FlushSpecific`.
    ///
    /// # Errors
    ///
    /// Returns device and transport errors unchanged.
    pub fn evict_key(&mut self, key_handle: u32, residency: Residency) -> Result<(), TpmError> {
        let channel = residency.channel();
        let handle = match residency {
            Residency::WithRoomManagement => self.make_room(key_handle)?,
            Residency::AssumeResident => key_handle,
        };
        match self.config().version {
            ProtocolVersion::V11 => {
                let mut cmd = TpmCommand::new(tpm_tag::RQU_COMMAND, tpm_ord::EVICT_KEY);
                cmd.add_u32(handle);
                match self.execute_with_handles(&cmd.finalize()?, 1, "EvictKey", channel) {
                    Ok(_) => {}
                    Err(e) if e.is_tpm_rc(tpm_rc::BAD_ORDINAL) => {
                        debug!(target: "tpmkey::context", "EvictKey unsupported, flushing");
                        self.flush_specific(handle, tpm_rt::KEY, channel)?;
                    }
                    Err(e) => return Err(e),
                }
            }
            ProtocolVersion::V12 => self.flush_specific(handle, tpm_rt::KEY, channel)?,
        }
        if residency == Residency::WithRoomManagement {
            self.forget_key(handle);
            if handle != key_handle {
                self.forget_key(key_handle);
            }
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns device and transport errors unchanged.
    pub fn flush_specific(
        &mut self,
        handle: u32,
        resource_type: u32,
        channel: Channel,
    ) -> Result<(), TpmError> {
        let mut cmd = TpmCommand::new(tpm_tag::RQU_COMMAND, tpm_ord::FLUSH_SPECIFIC);
        cmd.add_u32(handle).add_u32(resource_type);
        self.execute(&cmd.finalize()?, "FlushSpecific", channel)?;
        Ok(())
    }
}
