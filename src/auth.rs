// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! The HMAC authorization protocol for one- and two-session commands.
//!
//! A request carries one trailer per session, in session order:
//! `handle, odd nonce, continue flag, authdata`. The authdata is
//! `HMAC(secret, SHA1(ordinal || params) || even || odd || continue)`.
//! A response carries `even nonce, continue flag, resAuth` per session, with
//! resAuth computed over `SHA1(rc || ordinal || out params)` and the new even
//! nonce.

use crate::{
    constants::{tpm_tag, TPM_AUTH_RESPONSE_SIZE},
    crypto::{compute_auth, random_nonce, sha1_digest, verify_auth, AuthHmac},
    device::Channel,
    marshal::{wire_u32, PutExt, TpmCommand, TpmDigest, TpmNonce, TpmReader, TpmResponse},
    session::Session,
    TpmContext, TpmError,
};
use log::debug;

/// One request authorization trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBlock {
    pub handle: u32,
    pub odd_nonce: TpmNonce,
    pub continue_session: bool,
    pub auth: TpmDigest,
}

/// One response authorization trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseAuthBlock {
    pub even_nonce: TpmNonce,
    pub continue_session: bool,
    pub auth: TpmDigest,
}

/// A command whose parameters are covered by session authorization.
///
/// Handles follow the ordinal on the wire but are not part of the
/// parameter digest.
#[derive(Debug, Clone)]
pub struct AuthCommand {
    ordinal: u32,
    handles: Vec<u32>,
    params: Vec<u8>,
    continue_session: bool,
}

impl AuthCommand {
    #[must_use]
    pub fn new(ordinal: u32) -> Self {
        Self {
            ordinal,
            handles: Vec::new(),
            params: Vec::new(),
            continue_session: false,
        }
    }

    #[must_use]
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn add_handle(&mut self, handle: u32) -> &mut Self {
        self.handles.push(handle);
        self
    }

    pub fn add_u32(&mut self, v: u32) -> &mut Self {
        self.params.put_u32(v);
        self
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.params.put_bytes(bytes);
        self
    }

    /// Appends a `u32` length prefix and `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Protocol` if the length does not fit.
    pub fn add_sized(&mut self, bytes: &[u8]) -> Result<&mut Self, TpmError> {
        self.params.put_u32(wire_u32(bytes.len())?);
        self.params.put_bytes(bytes);
        Ok(self)
    }

    /// Keep the sessions open on the device after this command.
    pub fn keep_sessions(&mut self, keep: bool) -> &mut Self {
        self.continue_session = keep;
        self
    }

    /// `SHA1(ordinal || params)`.
    #[must_use]
    pub fn param_digest(&self) -> TpmDigest {
        sha1_digest(&[&self.ordinal.to_be_bytes(), &self.params])
    }

    /// Computes the trailer for `session` with a caller-chosen odd nonce.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Hmac` if the primitive fails.
    pub fn authorize(
        &self,
        hmac: &dyn AuthHmac,
        session: &Session,
        odd_nonce: TpmNonce,
    ) -> Result<AuthBlock, TpmError> {
        let state = session.state();
        let auth = compute_auth(
            hmac,
            &state.secret,
            &self.param_digest(),
            &state.even_nonce,
            &odd_nonce,
            self.continue_session,
        )?;
        Ok(AuthBlock {
            handle: state.handle,
            odd_nonce,
            continue_session: self.continue_session,
            auth,
        })
    }

    /// Serializes the command with the given trailers. The tag follows the
    /// number of trailers.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Protocol` for more than two trailers or an
    /// oversized command.
    pub fn build(&self, blocks: &[AuthBlock]) -> Result<Vec<u8>, TpmError> {
        let tag = match blocks.len() {
            0 => tpm_tag::RQU_COMMAND,
            1 => tpm_tag::RQU_AUTH1_COMMAND,
            2 => tpm_tag::RQU_AUTH2_COMMAND,
            n => return Err(TpmError::Protocol(format!("{n} authorization sessions"))),
        };
        let mut cmd = TpmCommand::new(tag, self.ordinal);
        for &handle in &self.handles {
            cmd.add_u32(handle);
        }
        cmd.add_bytes(&self.params);
        for block in blocks {
            cmd.add_u32(block.handle)
                .add_bytes(&block.odd_nonce)
                .add_u8(u8::from(block.continue_session))
                .add_bytes(&block.auth);
        }
        cmd.finalize()
    }
}

/// Splits an authorized response into its output parameters and trailers.
///
/// # Errors
///
/// Returns `TpmError::Protocol` if the tag does not match the number of
/// sessions or the response is too short to hold the trailers.
pub fn split_response(
    response: &TpmResponse,
    sessions: usize,
) -> Result<(&[u8], Vec<ResponseAuthBlock>), TpmError> {
    let expected_tag = match sessions {
        1 => tpm_tag::RSP_AUTH1_COMMAND,
        2 => tpm_tag::RSP_AUTH2_COMMAND,
        n => return Err(TpmError::Protocol(format!("{n} authorization sessions"))),
    };
    if response.tag != expected_tag {
        return Err(TpmError::Protocol(format!(
            "response tag {:#06x} (expected {expected_tag:#06x})",
            response.tag
        )));
    }
    let data = response.data();
    let trailer_len = sessions * TPM_AUTH_RESPONSE_SIZE;
    if data.len() < trailer_len {
        return Err(TpmError::Protocol(format!(
            "response of {} data bytes cannot hold {sessions} authorization blocks",
            data.len()
        )));
    }
    let (params, trailers) = data.split_at(data.len() - trailer_len);
    let mut reader = TpmReader::new(trailers);
    let mut blocks = Vec::with_capacity(sessions);
    for _ in 0..sessions {
        let even_nonce = reader.read_digest()?;
        let continue_session = reader.read_u8()? != 0;
        let auth = reader.read_digest()?;
        blocks.push(ResponseAuthBlock {
            even_nonce,
            continue_session,
            auth,
        });
    }
    Ok((params, blocks))
}

/// Verifies every response trailer against its session, in order, and
/// returns the output parameters. On success each session takes the even
/// nonce returned for it.
///
/// # Errors
///
/// Returns `TpmError::AuthFailed` if any trailer fails to verify; no session
/// is updated in that case.
pub fn verify_response(
    hmac: &dyn AuthHmac,
    ordinal: u32,
    response: &TpmResponse,
    sessions: &mut [&mut Session],
    odd_nonces: &[TpmNonce],
) -> Result<Vec<u8>, TpmError> {
    if sessions.len() != odd_nonces.len() {
        return Err(TpmError::Protocol(format!(
            "{} sessions but {} nonces",
            sessions.len(),
            odd_nonces.len()
        )));
    }
    let (params, blocks) = split_response(response, sessions.len())?;
    let out_digest = sha1_digest(&[&response.rc.to_be_bytes(), &ordinal.to_be_bytes(), params]);

    for (index, ((session, block), odd_nonce)) in
        sessions.iter().zip(&blocks).zip(odd_nonces).enumerate()
    {
        let valid = verify_auth(
            hmac,
            &session.state().secret,
            &out_digest,
            &block.even_nonce,
            odd_nonce,
            block.continue_session,
            &block.auth,
        )?;
        if !valid {
            debug!(
                target: "tpmkey::auth",
                "ordinal {ordinal:#010x}: response HMAC {index} mismatch"
            );
            return Err(TpmError::AuthFailed);
        }
    }

    for (session, block) in sessions.iter_mut().zip(&blocks) {
        session.state_mut().even_nonce = block.even_nonce;
    }
    Ok(params.to_vec())
}

impl TpmContext {
    /// Runs a command authorized by the given sessions and returns its
    /// verified output parameters. For two sessions the first is the key
    /// session and the second the data session.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::AuthFailed` if a response HMAC does not verify, and
    /// transport, protocol and device errors unchanged.
    pub fn execute_authorized(
        &mut self,
        command: &AuthCommand,
        sessions: &mut [&mut Session],
        name: &str,
    ) -> Result<Vec<u8>, TpmError> {
        let mut odd_nonces = Vec::with_capacity(sessions.len());
        let mut blocks = Vec::with_capacity(sessions.len());
        for session in sessions.iter() {
            let odd_nonce = random_nonce();
            blocks.push(command.authorize(self.hmac(), session, odd_nonce)?);
            odd_nonces.push(odd_nonce);
        }
        let bytes = command.build(&blocks)?;
        let response =
            self.execute_with_handles(&bytes, command.handle_count(), name, Channel::Logged)?;
        verify_response(
            self.hmac(),
            command.ordinal(),
            &response,
            sessions,
            &odd_nonces,
        )
    }

    /// One-session authorization.
    ///
    /// # Errors
    ///
    /// See [`TpmContext::execute_authorized`].
    pub fn execute_auth1(
        &mut self,
        command: &AuthCommand,
        session: &mut Session,
        name: &str,
    ) -> Result<Vec<u8>, TpmError> {
        self.execute_authorized(command, &mut [session], name)
    }

    /// Two-session authorization: key session block first, data session
    /// block second.
    ///
    /// # Errors
    ///
    /// See [`TpmContext::execute_authorized`].
    pub fn execute_auth2(
        &mut self,
        command: &AuthCommand,
        key_session: &mut Session,
        data_session: &mut Session,
        name: &str,
    ) -> Result<Vec<u8>, TpmError> {
        self.execute_authorized(command, &mut [key_session, data_session], name)
    }
}
