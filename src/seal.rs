// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    auth::AuthCommand,
    constants::tpm_ord,
    crypto::WELL_KNOWN_SECRET,
    marshal::{TpmDigest, TpmReader},
    session::{with_session, with_sessions2, SessionSpec},
    TpmContext, TpmError,
};
use log::debug;

impl TpmContext {
    /// Unseals `blob` under `key_handle` into `out` and returns the length of
    /// the plaintext.
    ///
    /// With a key password the command carries two authorizations: a session
    /// bound to the key (delegated if the delegation store has a blob for it)
    /// and an OIAP session for the data password. Without one, a single OIAP
    /// session authorizes the data. A missing data password is the
    /// well-known secret.
    ///
    /// `out` is written only after the response HMACs verify.
    ///
    /// # Errors
    ///
    /// - `TpmError::NullArgument` if `blob` or `out` is missing.
    /// - `TpmError::BufferTooSmall` if `out` is shorter than the plaintext.
    /// - `TpmError::AuthFailed` if a response HMAC does not verify.
    /// - Device, transport and protocol errors unchanged.
    pub fn unseal(
        &mut self,
        key_handle: u32,
        key_auth: Option<&TpmDigest>,
        data_auth: Option<&TpmDigest>,
        blob: Option<&[u8]>,
        out: Option<&mut [u8]>,
    ) -> Result<usize, TpmError> {
        let blob = blob.ok_or(TpmError::NullArgument("blob"))?;
        let out = out.ok_or(TpmError::NullArgument("out"))?;

        let data = self.unseal_inner(key_handle, key_auth, data_auth, blob)?;
        if data.len() > out.len() {
            return Err(TpmError::BufferTooSmall {
                needed: data.len(),
                available: out.len(),
            });
        }
        out[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Unseals `blob` and returns the plaintext.
    ///
    /// # Errors
    ///
    /// See [`TpmContext::unseal`].
    pub fn unseal_to_vec(
        &mut self,
        key_handle: u32,
        key_auth: Option<&TpmDigest>,
        data_auth: Option<&TpmDigest>,
        blob: &[u8],
    ) -> Result<Vec<u8>, TpmError> {
        self.unseal_inner(key_handle, key_auth, data_auth, blob)
    }

    fn unseal_inner(
        &mut self,
        key_handle: u32,
        key_auth: Option<&TpmDigest>,
        data_auth: Option<&TpmDigest>,
        blob: &[u8],
    ) -> Result<Vec<u8>, TpmError> {
        let key_handle = self.make_room(key_handle)?;
        let data_secret = data_auth.copied().unwrap_or(WELL_KNOWN_SECRET);

        let mut cmd = AuthCommand::new(tpm_ord::UNSEAL);
        cmd.add_handle(key_handle).add_bytes(blob);

        let params = match key_auth {
            Some(key_auth) => with_sessions2(
                self,
                SessionSpec::KeyDelegated {
                    key_auth: *key_auth,
                    key_handle,
                },
                SessionSpec::Oiap {
                    secret: data_secret,
                },
                |tpm, key_session, data_session| {
                    tpm.execute_auth2(&cmd, key_session, data_session, "Unseal - AUTH2")
                },
            )?,
            None => with_session(
                self,
                SessionSpec::Oiap {
                    secret: data_secret,
                },
                |tpm, session| tpm.execute_auth1(&cmd, session, "Unseal - AUTH1"),
            )?,
        };

        let mut reader = TpmReader::new(&params);
        let data = reader.read_sized()?.to_vec();
        debug!(target: "tpmkey::seal", "unsealed {} bytes", data.len());
        Ok(data)
    }
}
