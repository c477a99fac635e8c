// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::{
    auth::AuthCommand,
    constants::{tpm_et, tpm_kh, tpm_ord, tpm_tag},
    device::Channel,
    marshal::{TpmCommand, TpmDigest, TpmReader},
    session::{with_session, SessionSpec},
    TpmContext, TpmError,
};
use log::debug;

/// Read size used when the caller has no better idea.
pub const NV_DEFAULT_READ_SIZE: u32 = 1024;

impl TpmContext {
    /// Reads `size` bytes at `offset` from an NV index.
    ///
    /// Without `owner_auth` the read is unauthenticated. With it, the read
    /// is authorized by an OSAP session bound to the owner.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::AuthFailed` if the response HMAC does not verify,
    /// and device, transport and protocol errors unchanged.
    pub fn nv_read_value(
        &mut self,
        index: u32,
        offset: u32,
        size: u32,
        owner_auth: Option<&TpmDigest>,
    ) -> Result<Vec<u8>, TpmError> {
        let params = match owner_auth {
            None => {
                let mut cmd = TpmCommand::new(tpm_tag::RQU_COMMAND, tpm_ord::NV_READ_VALUE);
                cmd.add_u32(index).add_u32(offset).add_u32(size);
                let response = self.execute(&cmd.finalize()?, "NV_ReadValue", Channel::Logged)?;
                response.data().to_vec()
            }
            Some(owner_auth) => {
                let mut cmd = AuthCommand::new(tpm_ord::NV_READ_VALUE);
                cmd.add_u32(index).add_u32(offset).add_u32(size);
                with_session(
                    self,
                    SessionSpec::Osap {
                        entity_auth: *owner_auth,
                        entity_type: tpm_et::OWNER,
                        entity_handle: tpm_kh::OWNER,
                    },
                    |tpm, session| tpm.execute_auth1(&cmd, session, "NV_ReadValue - AUTH1"),
                )?
            }
        };
        let data = TpmReader::new(&params).read_sized()?.to_vec();
        debug!(target: "tpmkey::nv", "read {} bytes from {index:#010x}", data.len());
        Ok(data)
    }
}
