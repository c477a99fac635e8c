// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! In-process TPM 1.2 simulator covering the commands issued by this crate.
//!
//! Authorization HMACs are checked and produced the way a device does. The
//! simulator is shared through an `Arc`, so a test can keep a clone to set
//! it up and inspect it while a [`crate::TpmDevice`] owns another clone.

use crate::{
    constants::{
        tpm_et, tpm_kh, tpm_ord, tpm_rc, tpm_rt, tpm_tag, TPM_AUTH_REQUEST_SIZE,
        TPM_CONTEXT_LABEL_SIZE, TPM_HEADER_SIZE,
    },
    crypto::{
        compute_auth, random_nonce, sha1_digest, shared_secret, verify_auth, Sha1Hmac,
        WELL_KNOWN_SECRET,
    },
    marshal::{PutExt, TpmDigest, TpmNonce, TpmReader},
    session::SessionKind,
    transport::Transport,
    TpmError,
};
use log::{debug, trace};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

const SESSION_HANDLE_FIRST: u32 = 0x0200_0000;
const KEY_HANDLE_FIRST: u32 = 0x0100_0000;

type MockTpmResult = Result<MockReply, u32>;

#[derive(Debug, Clone)]
struct MockSession {
    kind: SessionKind,
    /// Shared secret of an OSAP or DSAP session.
    secret: Option<TpmDigest>,
    bound_handle: Option<u32>,
    bound_type: Option<u16>,
    even_nonce: TpmNonce,
}

#[derive(Debug, Clone)]
struct MockKey {
    /// Survives a save and reload under another handle.
    id: u32,
    auth: TpmDigest,
}

#[derive(Debug, Clone)]
struct MockSealed {
    key_id: u32,
    data_auth: TpmDigest,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct MockAuth {
    handle: u32,
    odd_nonce: TpmNonce,
    continue_session: bool,
    auth: TpmDigest,
}

#[derive(Debug)]
struct MockRequest<'a> {
    ordinal: u32,
    body: &'a [u8],
    auths: Vec<MockAuth>,
}

#[derive(Debug)]
struct MockResponseAuth {
    even_nonce: TpmNonce,
    odd_nonce: TpmNonce,
    continue_session: bool,
    secret: TpmDigest,
}

/// Output parameters plus the sessions whose trailers go into the response.
#[derive(Debug, Default)]
struct MockReply {
    params: Vec<u8>,
    sessions: Vec<MockResponseAuth>,
}

impl MockReply {
    fn params(params: Vec<u8>) -> Self {
        Self {
            params,
            sessions: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct MockTpmState {
    sessions: HashMap<u32, MockSession>,
    keys: HashMap<u32, MockKey>,
    sealed: HashMap<Vec<u8>, MockSealed>,
    contexts: HashMap<Vec<u8>, (u32, MockKey)>,
    delegations: HashMap<Vec<u8>, TpmDigest>,
    nv: HashMap<u32, Vec<u8>>,
    owner_auth: TpmDigest,
    next_session_handle: u32,
    next_key_handle: u32,
    next_blob: u32,
    key_slots: Option<usize>,
    evict_key_supported: bool,
    context_size_skew: bool,
    corrupt_response_auth: bool,
    terminated: HashMap<u32, usize>,
    ordinals: Vec<u32>,
    pending: Option<Vec<u8>>,
}

impl Default for MockTpmState {
    fn default() -> Self {
        let mut keys = HashMap::new();
        keys.insert(
            tpm_kh::SRK,
            MockKey {
                id: 0,
                auth: WELL_KNOWN_SECRET,
            },
        );
        Self {
            sessions: HashMap::new(),
            keys,
            sealed: HashMap::new(),
            contexts: HashMap::new(),
            delegations: HashMap::new(),
            nv: HashMap::new(),
            owner_auth: WELL_KNOWN_SECRET,
            next_session_handle: SESSION_HANDLE_FIRST,
            next_key_handle: KEY_HANDLE_FIRST,
            next_blob: 0,
            key_slots: None,
            evict_key_supported: true,
            context_size_skew: false,
            corrupt_response_auth: false,
            terminated: HashMap::new(),
            ordinals: Vec::new(),
            pending: None,
        }
    }
}

/// Handle to a simulated device. Clones share the same device.
#[derive(Debug, Clone, Default)]
pub struct MockTpm(Arc<Mutex<MockTpmState>>);

impl MockTpm {
    /// A device with the SRK loaded and both the SRK and the owner protected
    /// by the well-known secret.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockTpmState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads a key protected by `auth` and returns its handle.
    #[must_use]
    pub fn add_key(&self, auth: TpmDigest) -> u32 {
        let mut state = self.state();
        let handle = state.next_key_handle;
        state.next_key_handle += 1;
        state.keys.insert(handle, MockKey { id: handle, auth });
        handle
    }

    /// Seals `data` under `key_handle` and returns the sealed blob.
    #[must_use]
    pub fn seal(&self, key_handle: u32, data_auth: TpmDigest, data: &[u8]) -> Vec<u8> {
        let mut state = self.state();
        let key_id = state.keys.get(&key_handle).map_or(key_handle, |k| k.id);
        let blob = state.fresh_blob(b"sealed", key_handle);
        state.sealed.insert(
            blob.clone(),
            MockSealed {
                key_id,
                data_auth,
                data: data.to_vec(),
            },
        );
        blob
    }

    /// Registers a delegation blob whose secret is `auth`.
    pub fn add_delegation(&self, blob: &[u8], auth: TpmDigest) {
        self.state().delegations.insert(blob.to_vec(), auth);
    }

    pub fn set_nv(&self, index: u32, data: &[u8]) {
        self.state().nv.insert(index, data.to_vec());
    }

    pub fn set_owner_auth(&self, auth: TpmDigest) {
        self.state().owner_auth = auth;
    }

    /// Limits the number of loaded non-permanent keys.
    pub fn set_key_slots(&self, slots: Option<usize>) {
        self.state().key_slots = slots;
    }

    /// When unset, `TPM_EvictKey` answers `TPM_BAD_ORDINAL`.
    pub fn set_evict_key_supported(&self, supported: bool) {
        self.state().evict_key_supported = supported;
    }

    /// Announces one byte more than the saved context actually carries.
    pub fn set_context_size_skew(&self, skew: bool) {
        self.state().context_size_skew = skew;
    }

    /// Flips a bit in every response authorization.
    pub fn set_corrupt_response_auth(&self, corrupt: bool) {
        self.state().corrupt_response_auth = corrupt;
    }

    /// Number of `TPM_Terminate_Handle` requests received for `handle`.
    #[must_use]
    pub fn terminate_count(&self, handle: u32) -> usize {
        self.state().terminated.get(&handle).copied().unwrap_or(0)
    }

    /// Every session handle ever issued, with its terminate count.
    #[must_use]
    pub fn session_terminations(&self) -> Vec<(u32, usize)> {
        let state = self.state();
        (SESSION_HANDLE_FIRST..state.next_session_handle)
            .map(|h| (h, state.terminated.get(&h).copied().unwrap_or(0)))
            .collect()
    }

    /// Sessions that are still open on the device.
    #[must_use]
    pub fn open_sessions(&self) -> Vec<u32> {
        let mut handles: Vec<u32> = self.state().sessions.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    #[must_use]
    pub fn is_loaded(&self, key_handle: u32) -> bool {
        self.state().keys.contains_key(&key_handle)
    }

    /// Ordinals received so far, in order.
    #[must_use]
    pub fn ordinals(&self) -> Vec<u32> {
        self.state().ordinals.clone()
    }
}

impl Transport for MockTpm {
    fn send(&mut self, command: &[u8]) -> Result<(), TpmError> {
        let mut state = self.state();
        let response = state.execute(command);
        state.pending = Some(response);
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TpmError> {
        self.state()
            .pending
            .take()
            .ok_or_else(|| TpmError::Transport("no pending response".to_string()))
    }
}

fn mocktpm_parse_request(command: &[u8]) -> Result<MockRequest<'_>, u32> {
    let mut reader = TpmReader::new(command);
    let tag = reader.read_u16().map_err(|_| tpm_rc::BAD_PARAM_SIZE)?;
    let size = reader.read_u32().map_err(|_| tpm_rc::BAD_PARAM_SIZE)? as usize;
    let ordinal = reader.read_u32().map_err(|_| tpm_rc::BAD_PARAM_SIZE)?;
    if size != command.len() {
        return Err(tpm_rc::BAD_PARAM_SIZE);
    }
    let count = match tag {
        tpm_tag::RQU_COMMAND => 0,
        tpm_tag::RQU_AUTH1_COMMAND => 1,
        tpm_tag::RQU_AUTH2_COMMAND => 2,
        _ => return Err(tpm_rc::BADTAG),
    };
    let trailer = count * TPM_AUTH_REQUEST_SIZE;
    if command.len() < TPM_HEADER_SIZE + trailer {
        return Err(tpm_rc::BAD_PARAM_SIZE);
    }
    let body_end = command.len() - trailer;
    let mut reader = TpmReader::at(command, body_end);
    let mut auths = Vec::with_capacity(count);
    for _ in 0..count {
        let parse = |reader: &mut TpmReader<'_>| -> Result<MockAuth, TpmError> {
            Ok(MockAuth {
                handle: reader.read_u32()?,
                odd_nonce: reader.read_digest()?,
                continue_session: reader.read_u8()? != 0,
                auth: reader.read_digest()?,
            })
        };
        auths.push(parse(&mut reader).map_err(|_| tpm_rc::BAD_PARAM_SIZE)?);
    }
    Ok(MockRequest {
        ordinal,
        body: &command[TPM_HEADER_SIZE..body_end],
        auths,
    })
}

fn mocktpm_build_response(rc: u32, ordinal: u32, reply: &MockReply, corrupt: bool) -> Vec<u8> {
    let tag = match reply.sessions.len() {
        0 => tpm_tag::RSP_COMMAND,
        1 => tpm_tag::RSP_AUTH1_COMMAND,
        _ => tpm_tag::RSP_AUTH2_COMMAND,
    };
    let mut buf = Vec::new();
    buf.put_u16(tag);
    buf.put_u32(0);
    buf.put_u32(rc);
    buf.put_bytes(&reply.params);

    let out_digest = sha1_digest(&[&rc.to_be_bytes(), &ordinal.to_be_bytes(), &reply.params]);
    for auth in &reply.sessions {
        let mut res_auth = compute_auth(
            &Sha1Hmac,
            &auth.secret,
            &out_digest,
            &auth.even_nonce,
            &auth.odd_nonce,
            auth.continue_session,
        )
        .unwrap_or_default();
        if corrupt {
            res_auth[0] ^= 0x01;
        }
        buf.put_bytes(&auth.even_nonce);
        buf.put_u8(u8::from(auth.continue_session));
        buf.put_bytes(&res_auth);
    }
    let size = u32::try_from(buf.len()).unwrap_or(u32::MAX);
    buf[2..6].copy_from_slice(&size.to_be_bytes());
    buf
}

impl MockTpmState {
    fn execute(&mut self, command: &[u8]) -> Vec<u8> {
        trace!(target: "tpmkey::mocktpm", "command {}", hex::encode(command));
        let (ordinal, result) = match mocktpm_parse_request(command) {
            Ok(request) => {
                self.ordinals.push(request.ordinal);
                (request.ordinal, self.dispatch(&request))
            }
            Err(rc) => (0, Err(rc)),
        };
        match result {
            Ok(reply) => mocktpm_build_response(0, ordinal, &reply, self.corrupt_response_auth),
            Err(rc) => {
                debug!(target: "tpmkey::mocktpm", "ordinal {ordinal:#010x}: rc {rc:#010x}");
                mocktpm_build_response(rc, ordinal, &MockReply::default(), false)
            }
        }
    }

    fn dispatch(&mut self, request: &MockRequest<'_>) -> MockTpmResult {
        match request.ordinal {
            tpm_ord::OIAP => mocktpm_oiap(self, request),
            tpm_ord::OSAP => mocktpm_osap(self, request),
            tpm_ord::DSAP => mocktpm_dsap(self, request),
            tpm_ord::TERMINATE_HANDLE => mocktpm_terminate_handle(self, request),
            tpm_ord::UNSEAL => mocktpm_unseal(self, request),
            tpm_ord::SAVE_CONTEXT => mocktpm_save_context(self, request),
            tpm_ord::LOAD_CONTEXT => mocktpm_load_context(self, request),
            tpm_ord::EVICT_KEY if self.evict_key_supported => mocktpm_evict_key(self, request),
            tpm_ord::FLUSH_SPECIFIC => mocktpm_flush_specific(self, request),
            tpm_ord::NV_READ_VALUE => mocktpm_nv_read_value(self, request),
            _ => Err(tpm_rc::BAD_ORDINAL),
        }
    }

    fn fresh_blob(&mut self, prefix: &[u8], handle: u32) -> Vec<u8> {
        self.next_blob += 1;
        let mut blob = prefix.to_vec();
        blob.put_u32(handle);
        blob.put_u32(self.next_blob);
        blob
    }

    fn new_session(&mut self, session: MockSession) -> u32 {
        let handle = self.next_session_handle;
        self.next_session_handle += 1;
        self.sessions.insert(handle, session);
        handle
    }

    fn loaded_keys(&self) -> usize {
        self.keys.keys().filter(|&&h| h >> 24 != 0x40).count()
    }

    /// Checks one request trailer. `entity_auth` authorizes OIAP sessions;
    /// OSAP and DSAP sessions must be bound to `entity_handle`.
    fn check_auth(
        &mut self,
        index: usize,
        auth: &MockAuth,
        param_digest: &TpmDigest,
        entity_auth: &TpmDigest,
        entity_handle: u32,
    ) -> Result<MockResponseAuth, u32> {
        let fail = if index == 0 {
            tpm_rc::AUTHFAIL
        } else {
            tpm_rc::AUTH2FAIL
        };
        let session = self
            .sessions
            .get(&auth.handle)
            .cloned()
            .ok_or(tpm_rc::INVALID_AUTHHANDLE)?;
        let secret = match session.kind {
            SessionKind::Oiap => *entity_auth,
            SessionKind::Osap | SessionKind::Dsap => {
                if session.bound_handle != Some(entity_handle) {
                    return Err(fail);
                }
                session.secret.ok_or(fail)?
            }
        };
        let valid = verify_auth(
            &Sha1Hmac,
            &secret,
            param_digest,
            &session.even_nonce,
            &auth.odd_nonce,
            auth.continue_session,
            &auth.auth,
        )
        .map_err(|_| fail)?;
        if !valid {
            self.sessions.remove(&auth.handle);
            return Err(fail);
        }

        let even_nonce = random_nonce();
        if auth.continue_session {
            if let Some(s) = self.sessions.get_mut(&auth.handle) {
                s.even_nonce = even_nonce;
            }
        } else {
            self.sessions.remove(&auth.handle);
        }
        Ok(MockResponseAuth {
            even_nonce,
            odd_nonce: auth.odd_nonce,
            continue_session: auth.continue_session,
            secret,
        })
    }

    fn entity_auth(&self, entity_type: u16, entity_handle: u32) -> Result<TpmDigest, u32> {
        match entity_type {
            tpm_et::OWNER => Ok(self.owner_auth),
            tpm_et::KEYHANDLE | tpm_et::SRK => self
                .keys
                .get(&entity_handle)
                .map(|k| k.auth)
                .ok_or(tpm_rc::INVALID_KEYHANDLE),
            _ => Err(tpm_rc::BAD_PARAMETER),
        }
    }
}

#[allow(clippy::needless_pass_by_value)]
fn bad_size(_: TpmError) -> u32 {
    tpm_rc::BAD_PARAM_SIZE
}

#[allow(clippy::unnecessary_wraps)]
fn mocktpm_oiap(tpm: &mut MockTpmState, _request: &MockRequest<'_>) -> MockTpmResult {
    let even_nonce = random_nonce();
    let handle = tpm.new_session(MockSession {
        kind: SessionKind::Oiap,
        secret: None,
        bound_handle: None,
        bound_type: None,
        even_nonce,
    });
    let mut params = Vec::new();
    params.put_u32(handle);
    params.put_bytes(&even_nonce);
    Ok(MockReply::params(params))
}

fn mocktpm_bound_session(
    tpm: &mut MockTpmState,
    kind: SessionKind,
    entity_type: u16,
    entity_handle: u32,
    entity_auth: &TpmDigest,
    odd_nonce: &TpmNonce,
) -> MockTpmResult {
    let even_nonce = random_nonce();
    let even_osap = random_nonce();
    let secret =
        shared_secret(&Sha1Hmac, entity_auth, &even_osap, odd_nonce).map_err(|_| tpm_rc::AUTHFAIL)?;
    let handle = tpm.new_session(MockSession {
        kind,
        secret: Some(secret),
        bound_handle: Some(entity_handle),
        bound_type: Some(entity_type),
        even_nonce,
    });
    let mut params = Vec::new();
    params.put_u32(handle);
    params.put_bytes(&even_nonce);
    params.put_bytes(&even_osap);
    Ok(MockReply::params(params))
}

fn mocktpm_osap(tpm: &mut MockTpmState, request: &MockRequest<'_>) -> MockTpmResult {
    let mut reader = TpmReader::new(request.body);
    let entity_type = reader.read_u16().map_err(bad_size)?;
    let entity_handle = reader.read_u32().map_err(bad_size)?;
    let odd_osap = reader.read_digest().map_err(bad_size)?;
    let entity_auth = tpm.entity_auth(entity_type, entity_handle)?;
    mocktpm_bound_session(
        tpm,
        SessionKind::Osap,
        entity_type,
        entity_handle,
        &entity_auth,
        &odd_osap,
    )
}

fn mocktpm_dsap(tpm: &mut MockTpmState, request: &MockRequest<'_>) -> MockTpmResult {
    let mut reader = TpmReader::new(request.body);
    let entity_type = reader.read_u16().map_err(bad_size)?;
    let key_handle = reader.read_u32().map_err(bad_size)?;
    let odd_dsap = reader.read_digest().map_err(bad_size)?;
    let blob = reader.read_sized().map_err(bad_size)?;
    if entity_type == tpm_et::DEL_KEY_BLOB && !tpm.keys.contains_key(&key_handle) {
        return Err(tpm_rc::INVALID_KEYHANDLE);
    }
    let auth = *tpm.delegations.get(blob).ok_or(tpm_rc::BAD_PARAMETER)?;
    mocktpm_bound_session(
        tpm,
        SessionKind::Dsap,
        entity_type,
        key_handle,
        &auth,
        &odd_dsap,
    )
}

fn mocktpm_terminate_handle(tpm: &mut MockTpmState, request: &MockRequest<'_>) -> MockTpmResult {
    let mut reader = TpmReader::new(request.body);
    let handle = reader.read_u32().map_err(bad_size)?;
    *tpm.terminated.entry(handle).or_insert(0) += 1;
    tpm.sessions
        .remove(&handle)
        .ok_or(tpm_rc::INVALID_AUTHHANDLE)?;
    Ok(MockReply::default())
}

fn mocktpm_unseal(tpm: &mut MockTpmState, request: &MockRequest<'_>) -> MockTpmResult {
    let mut reader = TpmReader::new(request.body);
    let key_handle = reader.read_u32().map_err(bad_size)?;
    let blob = reader.rest();
    let key = tpm
        .keys
        .get(&key_handle)
        .cloned()
        .ok_or(tpm_rc::INVALID_KEYHANDLE)?;
    let sealed = tpm.sealed.get(blob).cloned().ok_or(tpm_rc::BAD_PARAMETER)?;
    if sealed.key_id != key.id {
        return Err(tpm_rc::BAD_PARAMETER);
    }

    let param_digest = sha1_digest(&[&request.ordinal.to_be_bytes(), blob]);
    let sessions = match request.auths.as_slice() {
        [data] => vec![tpm.check_auth(0, data, &param_digest, &sealed.data_auth, 0)?],
        [key_auth, data] => {
            let key_session =
                tpm.check_auth(0, key_auth, &param_digest, &key.auth, key_handle)?;
            let data_session = tpm.check_auth(1, data, &param_digest, &sealed.data_auth, 0)?;
            vec![key_session, data_session]
        }
        _ => return Err(tpm_rc::BADTAG),
    };

    let mut params = Vec::new();
    params.put_u32(u32::try_from(sealed.data.len()).map_err(|_| tpm_rc::BAD_PARAMETER)?);
    params.put_bytes(&sealed.data);
    Ok(MockReply { params, sessions })
}

fn mocktpm_save_context(tpm: &mut MockTpmState, request: &MockRequest<'_>) -> MockTpmResult {
    let mut reader = TpmReader::new(request.body);
    let handle = reader.read_u32().map_err(bad_size)?;
    let resource_type = reader.read_u32().map_err(bad_size)?;
    reader.take(TPM_CONTEXT_LABEL_SIZE).map_err(bad_size)?;
    if resource_type != tpm_rt::KEY {
        return Err(tpm_rc::BAD_PARAMETER);
    }
    let key = tpm
        .keys
        .get(&handle)
        .cloned()
        .ok_or(tpm_rc::INVALID_KEYHANDLE)?;
    let blob = tpm.fresh_blob(b"context", handle);
    tpm.contexts.insert(blob.clone(), (handle, key));

    let mut size = u32::try_from(blob.len()).map_err(|_| tpm_rc::BAD_PARAMETER)?;
    if tpm.context_size_skew {
        size += 1;
    }
    let mut params = Vec::new();
    params.put_u32(size);
    params.put_bytes(&blob);
    Ok(MockReply::params(params))
}

fn mocktpm_load_context(tpm: &mut MockTpmState, request: &MockRequest<'_>) -> MockTpmResult {
    let mut reader = TpmReader::new(request.body);
    let _entity_handle = reader.read_u32().map_err(bad_size)?;
    let keep_handle = reader.read_u8().map_err(bad_size)? != 0;
    let blob = reader.read_sized().map_err(bad_size)?;
    let (saved_handle, key) = tpm
        .contexts
        .get(blob)
        .cloned()
        .ok_or(tpm_rc::BADCONTEXT)?;
    if let Some(slots) = tpm.key_slots {
        if tpm.loaded_keys() >= slots {
            return Err(tpm_rc::RESOURCES);
        }
    }
    let handle = if keep_handle && !tpm.keys.contains_key(&saved_handle) {
        saved_handle
    } else {
        let handle = tpm.next_key_handle;
        tpm.next_key_handle += 1;
        handle
    };
    tpm.keys.insert(handle, key);
    let mut params = Vec::new();
    params.put_u32(handle);
    Ok(MockReply::params(params))
}

fn mocktpm_remove_key(tpm: &mut MockTpmState, handle: u32) -> MockTpmResult {
    if handle >> 24 == 0x40 {
        return Err(tpm_rc::INVALID_KEYHANDLE);
    }
    tpm.keys.remove(&handle).ok_or(tpm_rc::INVALID_KEYHANDLE)?;
    Ok(MockReply::default())
}

fn mocktpm_evict_key(tpm: &mut MockTpmState, request: &MockRequest<'_>) -> MockTpmResult {
    let mut reader = TpmReader::new(request.body);
    let handle = reader.read_u32().map_err(bad_size)?;
    mocktpm_remove_key(tpm, handle)
}

fn mocktpm_flush_specific(tpm: &mut MockTpmState, request: &MockRequest<'_>) -> MockTpmResult {
    let mut reader = TpmReader::new(request.body);
    let handle = reader.read_u32().map_err(bad_size)?;
    let resource_type = reader.read_u32().map_err(bad_size)?;
    match resource_type {
        tpm_rt::KEY => mocktpm_remove_key(tpm, handle),
        tpm_rt::AUTH => {
            tpm.sessions
                .remove(&handle)
                .ok_or(tpm_rc::INVALID_AUTHHANDLE)?;
            Ok(MockReply::default())
        }
        _ => Err(tpm_rc::BAD_PARAMETER),
    }
}

fn mocktpm_nv_read_value(tpm: &mut MockTpmState, request: &MockRequest<'_>) -> MockTpmResult {
    let mut reader = TpmReader::new(request.body);
    let index = reader.read_u32().map_err(bad_size)?;
    let offset = reader.read_u32().map_err(bad_size)? as usize;
    let size = reader.read_u32().map_err(bad_size)? as usize;

    let sessions = match request.auths.as_slice() {
        [] => Vec::new(),
        [owner] => {
            let param_digest = sha1_digest(&[&request.ordinal.to_be_bytes(), request.body]);
            let owner_auth = tpm.owner_auth;
            let session = tpm
                .sessions
                .get(&owner.handle)
                .ok_or(tpm_rc::INVALID_AUTHHANDLE)?;
            if session.bound_type != Some(tpm_et::OWNER) {
                return Err(tpm_rc::AUTHFAIL);
            }
            vec![tpm.check_auth(0, owner, &param_digest, &owner_auth, tpm_kh::OWNER)?]
        }
        _ => return Err(tpm_rc::BADTAG),
    };

    let data = tpm.nv.get(&index).ok_or(tpm_rc::BADINDEX)?;
    let start = offset.min(data.len());
    let end = start.saturating_add(size).min(data.len());
    let data = data[start..end].to_vec();

    let mut params = Vec::new();
    params.put_u32(u32::try_from(data.len()).map_err(|_| tpm_rc::BAD_PARAMETER)?);
    params.put_bytes(&data);
    Ok(MockReply { params, sessions })
}
