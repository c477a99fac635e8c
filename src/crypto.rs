// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    constants::TPM_DIGEST_SIZE,
    marshal::{TpmDigest, TpmNonce},
    TpmError,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::{Digest, Sha1};

/// The well-known all-zero authorization value.
///
/// Anyone can compute authorization for an entity protected by this secret,
/// so it only proves that the caller knows the entity exists. The SRK of a
/// provisioned machine commonly uses it.
pub const WELL_KNOWN_SECRET: TpmDigest = [0u8; TPM_DIGEST_SIZE];

/// The keyed digest primitive used by the authorization protocol.
pub trait AuthHmac {
    /// Computes the HMAC of the concatenation of `message` parts.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Hmac` if the primitive fails.
    fn hmac(&self, key: &[u8], message: &[&[u8]]) -> Result<TpmDigest, TpmError>;

    /// Checks `tag` against the HMAC of `message`. The comparison does not
    /// short-circuit.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Hmac` if the primitive fails.
    fn verify(&self, key: &[u8], message: &[&[u8]], tag: &[u8]) -> Result<bool, TpmError> {
        let expected = self.hmac(key, message)?;
        if tag.len() != expected.len() {
            return Ok(false);
        }
        let diff = expected
            .iter()
            .zip(tag)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        Ok(diff == 0)
    }
}

/// HMAC-SHA1 as mandated by TPM 1.2.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1Hmac;

impl Sha1Hmac {
    fn mac(key: &[u8], message: &[&[u8]]) -> Result<Hmac<Sha1>, TpmError> {
        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
            .map_err(|e| TpmError::Hmac(format!("HMAC init error: {e}")))?;
        for part in message {
            mac.update(part);
        }
        Ok(mac)
    }
}

impl AuthHmac for Sha1Hmac {
    fn hmac(&self, key: &[u8], message: &[&[u8]]) -> Result<TpmDigest, TpmError> {
        let bytes = Self::mac(key, message)?.finalize().into_bytes();
        let mut digest = [0u8; TPM_DIGEST_SIZE];
        digest.copy_from_slice(&bytes);
        Ok(digest)
    }

    fn verify(&self, key: &[u8], message: &[&[u8]], tag: &[u8]) -> Result<bool, TpmError> {
        Ok(Self::mac(key, message)?.verify_slice(tag).is_ok())
    }
}

/// SHA-1 over the concatenation of `parts`.
#[must_use]
pub fn sha1_digest(parts: &[&[u8]]) -> TpmDigest {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let mut digest = [0u8; TPM_DIGEST_SIZE];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Derives a 20-byte authorization value from a password string.
#[must_use]
pub fn auth_from_password(password: &str) -> TpmDigest {
    sha1_digest(&[password.as_bytes()])
}

/// Generates a fresh odd nonce.
#[must_use]
pub fn random_nonce() -> TpmNonce {
    let mut nonce = [0u8; TPM_DIGEST_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Computes an authorization HMAC:
/// `HMAC(secret, digest || even_nonce || odd_nonce || continue)`.
///
/// The same layout authorizes requests (`digest` over the input parameters)
/// and responses (`digest` over the output parameters, `even_nonce` from the
/// response).
///
/// # Errors
///
/// Returns `TpmError::Hmac` if the primitive fails.
pub fn compute_auth(
    hmac: &dyn AuthHmac,
    secret: &[u8],
    param_digest: &TpmDigest,
    even_nonce: &TpmNonce,
    odd_nonce: &TpmNonce,
    continue_session: bool,
) -> Result<TpmDigest, TpmError> {
    hmac.hmac(
        secret,
        &[
            param_digest,
            even_nonce,
            odd_nonce,
            &[u8::from(continue_session)],
        ],
    )
}

/// Verifies a response authorization HMAC. See [`compute_auth`].
///
/// # Errors
///
/// Returns `TpmError::Hmac` if the primitive fails.
pub fn verify_auth(
    hmac: &dyn AuthHmac,
    secret: &[u8],
    param_digest: &TpmDigest,
    even_nonce: &TpmNonce,
    odd_nonce: &TpmNonce,
    continue_session: bool,
    auth: &[u8],
) -> Result<bool, TpmError> {
    hmac.verify(
        secret,
        &[
            param_digest,
            even_nonce,
            odd_nonce,
            &[u8::from(continue_session)],
        ],
        auth,
    )
}

/// Derives the OSAP/DSAP shared secret:
/// `HMAC(entity_auth, even_osap || odd_osap)`.
///
/// # Errors
///
/// Returns `TpmError::Hmac` if the primitive fails.
pub fn shared_secret(
    hmac: &dyn AuthHmac,
    entity_auth: &[u8],
    even_osap: &TpmNonce,
    odd_osap: &TpmNonce,
) -> Result<TpmDigest, TpmError> {
    hmac.hmac(entity_auth, &[even_osap, odd_osap])
}
