// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Authorization sessions.
//!
//! A session is opened with one device round trip and closed with another.
//! [`Session::close`] consumes the session, so a closed session cannot be
//! handed to the authorization protocol again. [`with_session`] and
//! [`with_sessions2`] close every session they opened on every exit path.

use crate::{
    constants::{tpm_et, tpm_ord, tpm_tag},
    crypto::{random_nonce, shared_secret},
    delegation::DelegationStore,
    device::Channel,
    marshal::{TpmCommand, TpmDigest, TpmNonce, TpmResponse},
    TpmContext, TpmError,
};
use log::debug;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Oiap,
    Osap,
    Dsap,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oiap => write!(f, "OIAP"),
            Self::Osap => write!(f, "OSAP"),
            Self::Dsap => write!(f, "DSAP"),
        }
    }
}

/// What to open.
#[derive(Debug, Clone)]
pub enum SessionSpec {
    /// Object-independent: the secret is the authorization value of whatever
    /// entity the session will authorize.
    Oiap { secret: TpmDigest },
    /// Object-specific: bound to one entity, the session secret is derived
    /// from the entity's authorization value.
    Osap {
        entity_auth: TpmDigest,
        entity_type: u16,
        entity_handle: u32,
    },
    /// Delegation-specific: bound to a delegation blob. `blob` is taken from
    /// the delegation store when `None`.
    Dsap {
        entity_auth: TpmDigest,
        entity_type: u16,
        key_handle: u32,
        blob: Option<Vec<u8>>,
    },
    /// DSAP when the delegation store has a key blob for `key_handle`,
    /// otherwise OSAP bound to the key.
    KeyDelegated {
        key_auth: TpmDigest,
        key_handle: u32,
    },
}

impl SessionSpec {
    /// Builds a spec from a kind and its bindings. The entity fields are
    /// ignored for OIAP.
    #[must_use]
    pub fn new(kind: SessionKind, secret: TpmDigest, entity_type: u16, entity_handle: u32) -> Self {
        match kind {
            SessionKind::Oiap => Self::Oiap { secret },
            SessionKind::Osap => Self::Osap {
                entity_auth: secret,
                entity_type,
                entity_handle,
            },
            SessionKind::Dsap => Self::Dsap {
                entity_auth: secret,
                entity_type,
                key_handle: entity_handle,
                blob: None,
            },
        }
    }
}

/// State shared by every session kind.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionState {
    pub handle: u32,
    pub secret: TpmDigest,
    pub even_nonce: TpmNonce,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("handle", &format_args!("{:#010x}", self.handle))
            .field("even_nonce", &hex::encode(self.even_nonce))
            .finish_non_exhaustive()
    }
}

/// Binding of an OSAP or DSAP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityBinding {
    pub entity_type: u16,
    pub entity_handle: u32,
}

/// An open authorization session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    Oiap(SessionState),
    Osap(SessionState, EntityBinding),
    Dsap(SessionState, EntityBinding),
}

impl Session {
    /// Opens a session.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Transport` if the round trip fails,
    /// `TpmError::Protocol` or `TpmError::Truncated` if the response cannot be
    /// parsed, and `TpmError::Tpm` for a device error.
    pub fn open(tpm: &mut TpmContext, spec: SessionSpec) -> Result<Self, TpmError> {
        match spec {
            SessionSpec::Oiap { secret } => Self::open_oiap(tpm, secret),
            SessionSpec::Osap {
                entity_auth,
                entity_type,
                entity_handle,
            } => Self::open_osap(tpm, &entity_auth, entity_type, entity_handle),
            SessionSpec::Dsap {
                entity_auth,
                entity_type,
                key_handle,
                blob,
            } => {
                let blob = match blob {
                    Some(blob) => blob,
                    None => DelegationStore::new(tpm.config())
                        .find(u32::from(entity_type), key_handle)?
                        .blob,
                };
                Self::open_dsap(tpm, &entity_auth, entity_type, key_handle, &blob)
            }
            SessionSpec::KeyDelegated {
                key_auth,
                key_handle,
            } => {
                let store = DelegationStore::new(tpm.config());
                match store.find(u32::from(tpm_et::DEL_KEY_BLOB), key_handle) {
                    Ok(entry) => Self::open_dsap(
                        tpm,
                        &key_auth,
                        tpm_et::DEL_KEY_BLOB,
                        key_handle,
                        &entry.blob,
                    ),
                    Err(TpmError::NotFound | TpmError::EnvVariable(_)) => {
                        Self::open_osap(tpm, &key_auth, tpm_et::KEYHANDLE, key_handle)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// # Errors
    ///
    /// See [`Session::open`].
    pub fn open_oiap(tpm: &mut TpmContext, secret: TpmDigest) -> Result<Self, TpmError> {
        let cmd = TpmCommand::new(tpm_tag::RQU_COMMAND, tpm_ord::OIAP).finalize()?;
        let response = tpm.execute(&cmd, "OIAP", Channel::Logged)?;
        let mut reader = response.reader();
        let handle = reader.read_u32()?;
        let even_nonce = reader.read_digest()?;
        debug!(target: "tpmkey::session", "OIAP session {handle:#010x} opened");
        Ok(Self::Oiap(SessionState {
            handle,
            secret,
            even_nonce,
        }))
    }

    /// # Errors
    ///
    /// See [`Session::open`].
    pub fn open_osap(
        tpm: &mut TpmContext,
        entity_auth: &TpmDigest,
        entity_type: u16,
        entity_handle: u32,
    ) -> Result<Self, TpmError> {
        let odd_osap = random_nonce();
        let mut cmd = TpmCommand::new(tpm_tag::RQU_COMMAND, tpm_ord::OSAP);
        cmd.add_u16(entity_type)
            .add_u32(entity_handle)
            .add_bytes(&odd_osap);
        let response = tpm.execute(&cmd.finalize()?, "OSAP", Channel::Logged)?;
        let (state, binding) = Self::read_bound(
            tpm,
            &response,
            entity_auth,
            &odd_osap,
            entity_type,
            entity_handle,
        )?;
        debug!(target: "tpmkey::session", "OSAP session {:#010x} opened", state.handle);
        Ok(Self::Osap(state, binding))
    }

    /// # Errors
    ///
    /// See [`Session::open`].
    pub fn open_dsap(
        tpm: &mut TpmContext,
        entity_auth: &TpmDigest,
        entity_type: u16,
        key_handle: u32,
        blob: &[u8],
    ) -> Result<Self, TpmError> {
        let odd_dsap = random_nonce();
        let mut cmd = TpmCommand::new(tpm_tag::RQU_COMMAND, tpm_ord::DSAP);
        cmd.add_u16(entity_type)
            .add_u32(key_handle)
            .add_bytes(&odd_dsap)
            .add_sized(blob)?;
        let response = tpm.execute(&cmd.finalize()?, "DSAP", Channel::Logged)?;
        let (state, binding) = Self::read_bound(
            tpm,
            &response,
            entity_auth,
            &odd_dsap,
            entity_type,
            key_handle,
        )?;
        debug!(target: "tpmkey::session", "DSAP session {:#010x} opened", state.handle);
        Ok(Self::Dsap(state, binding))
    }

    /// Parses an OSAP or DSAP response and derives the shared secret. The
    /// device session is terminated if the secret cannot be derived.
    fn read_bound(
        tpm: &mut TpmContext,
        response: &TpmResponse,
        entity_auth: &TpmDigest,
        odd_nonce: &TpmNonce,
        entity_type: u16,
        entity_handle: u32,
    ) -> Result<(SessionState, EntityBinding), TpmError> {
        let mut reader = response.reader();
        let handle = reader.read_u32()?;
        let even_nonce = reader.read_digest()?;
        let even_osap = reader.read_digest()?;
        let secret = match shared_secret(tpm.hmac(), entity_auth, &even_osap, odd_nonce) {
            Ok(secret) => secret,
            Err(e) => {
                terminate(tpm, handle, "bound");
                return Err(e);
            }
        };
        Ok((
            SessionState {
                handle,
                secret,
                even_nonce,
            },
            EntityBinding {
                entity_type,
                entity_handle,
            },
        ))
    }

    #[must_use]
    pub fn kind(&self) -> SessionKind {
        match self {
            Self::Oiap(_) => SessionKind::Oiap,
            Self::Osap(..) => SessionKind::Osap,
            Self::Dsap(..) => SessionKind::Dsap,
        }
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        match self {
            Self::Oiap(state) | Self::Osap(state, _) | Self::Dsap(state, _) => state,
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut SessionState {
        match self {
            Self::Oiap(state) | Self::Osap(state, _) | Self::Dsap(state, _) => state,
        }
    }

    #[must_use]
    pub fn handle(&self) -> u32 {
        self.state().handle
    }

    #[must_use]
    pub fn binding(&self) -> Option<EntityBinding> {
        match self {
            Self::Oiap(_) => None,
            Self::Osap(_, binding) | Self::Dsap(_, binding) => Some(*binding),
        }
    }

    /// Terminates the session on the device. A device error is logged and
    /// otherwise ignored: the session may already be gone if the last command
    /// did not ask to keep it.
    pub fn close(self, tpm: &mut TpmContext) {
        terminate(tpm, self.handle(), &self.kind().to_string());
    }
}

fn terminate(tpm: &mut TpmContext, handle: u32, kind: &str) {
    let mut cmd = TpmCommand::new(tpm_tag::RQU_COMMAND, tpm_ord::TERMINATE_HANDLE);
    cmd.add_u32(handle);
    let result = cmd
        .finalize()
        .and_then(|cmd| tpm.execute(&cmd, "Terminate_Handle", Channel::Logged));
    match result {
        Ok(_) => debug!(target: "tpmkey::session", "{kind} session {handle:#010x} closed"),
        Err(e) => debug!(target: "tpmkey::session", "{kind} session {handle:#010x}: {e}"),
    }
}

/// Opens one session, runs `f` with it and closes it, whatever `f` returns.
///
/// # Errors
///
/// Returns the open error or the error of `f`.
pub fn with_session<T, F>(tpm: &mut TpmContext, spec: SessionSpec, f: F) -> Result<T, TpmError>
where
    F: FnOnce(&mut TpmContext, &mut Session) -> Result<T, TpmError>,
{
    let mut session = Session::open(tpm, spec)?;
    let result = f(tpm, &mut session);
    session.close(tpm);
    result
}

/// Opens a key session and a data session, runs `f` with both and closes
/// both, whatever `f` returns. If the data session fails to open the key
/// session is closed before returning.
///
/// # Errors
///
/// Returns the first open error or the error of `f`.
pub fn with_sessions2<T, F>(
    tpm: &mut TpmContext,
    key_spec: SessionSpec,
    data_spec: SessionSpec,
    f: F,
) -> Result<T, TpmError>
where
    F: FnOnce(&mut TpmContext, &mut Session, &mut Session) -> Result<T, TpmError>,
{
    let mut key_session = Session::open(tpm, key_spec)?;
    let mut data_session = match Session::open(tpm, data_spec) {
        Ok(session) => session,
        Err(e) => {
            key_session.close(tpm);
            return Err(e);
        }
    };
    let result = f(tpm, &mut key_session, &mut data_session);
    key_session.close(tpm);
    data_session.close(tpm);
    result
}
