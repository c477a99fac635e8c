// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use rstest::{fixture, rstest};
use tempfile::TempDir;
use tpmkey::{
    constants::{tpm_et, tpm_kh, tpm_ord, tpm_rc},
    crypto::{auth_from_password, AuthHmac, WELL_KNOWN_SECRET},
    delegation::{append_record, DelegationHeader},
    marshal::TpmDigest,
    mocktpm::MockTpm,
    Config, TpmContext, TpmDevice, TpmError,
};

struct Fixture {
    _dir: TempDir,
    mock: MockTpm,
    tpm: TpmContext,
}

#[fixture]
fn fx() -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = Config {
        delegation_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let mock = MockTpm::new();
    let tpm = TpmContext::new(TpmDevice::new(mock.clone()), config);
    Fixture {
        _dir: dir,
        mock,
        tpm,
    }
}

/// Every session the device handed out was terminated exactly once.
fn assert_sessions_closed_once(mock: &MockTpm, expected: usize) {
    let sessions = mock.session_terminations();
    assert_eq!(sessions.len(), expected, "{sessions:x?}");
    for (handle, count) in sessions {
        assert_eq!(count, 1, "session {handle:#010x} closed {count} times");
    }
}

#[rstest]
fn test_unseal_auth1(mut fx: Fixture) {
    let data_auth = auth_from_password("data");
    let key = fx.mock.add_key(auth_from_password("unused"));
    let blob = fx.mock.seal(key, data_auth, b"hello world");

    let mut out = [0u8; 64];
    let len = fx
        .tpm
        .unseal(key, None, Some(&data_auth), Some(&blob), Some(&mut out))
        .unwrap();
    assert_eq!(&out[..len], b"hello world");
    assert_sessions_closed_once(&fx.mock, 1);
    assert_eq!(
        fx.mock.ordinals(),
        vec![tpm_ord::OIAP, tpm_ord::UNSEAL, tpm_ord::TERMINATE_HANDLE]
    );
}

#[rstest]
fn test_unseal_auth2_osap(mut fx: Fixture) {
    let key_auth = auth_from_password("key");
    let key = fx.mock.add_key(key_auth);
    let blob = fx.mock.seal(key, WELL_KNOWN_SECRET, b"payload");

    let data = fx
        .tpm
        .unseal_to_vec(key, Some(&key_auth), None, &blob)
        .unwrap();
    assert_eq!(data, b"payload");
    assert_sessions_closed_once(&fx.mock, 2);
    let ordinals = fx.mock.ordinals();
    assert_eq!(&ordinals[..3], &[tpm_ord::OSAP, tpm_ord::OIAP, tpm_ord::UNSEAL]);
}

#[rstest]
fn test_unseal_under_srk(mut fx: Fixture) {
    let blob = fx.mock.seal(tpm_kh::SRK, WELL_KNOWN_SECRET, b"disk key");
    let data = fx
        .tpm
        .unseal_to_vec(tpm_kh::SRK, Some(&WELL_KNOWN_SECRET), None, &blob)
        .unwrap();
    assert_eq!(data, b"disk key");
}

#[rstest]
fn test_unseal_auth2_delegated(fx: Fixture) {
    let Fixture { _dir, mock, mut tpm } = fx;
    let key_auth = auth_from_password("key");
    let key = mock.add_key(auth_from_password("real key password"));
    let delegation = b"delegation blob".to_vec();
    mock.add_delegation(&delegation, key_auth);
    append_record(
        &tpm.config().delegation_file(),
        &DelegationHeader {
            entity_type: tpm_et::DEL_KEY_BLOB.into(),
            key_handle: key,
            ..DelegationHeader::default()
        },
        &delegation,
    )
    .unwrap();
    let blob = mock.seal(key, WELL_KNOWN_SECRET, b"delegated");

    let data = tpm.unseal_to_vec(key, Some(&key_auth), None, &blob).unwrap();
    assert_eq!(data, b"delegated");
    assert_eq!(mock.ordinals()[0], tpm_ord::DSAP);
    assert_sessions_closed_once(&mock, 2);
}

#[rstest]
fn test_wrong_data_password_auth1(mut fx: Fixture) {
    let key = fx.mock.add_key(WELL_KNOWN_SECRET);
    let blob = fx.mock.seal(key, auth_from_password("right"), b"x");
    let wrong = auth_from_password("wrong");
    let err = fx
        .tpm
        .unseal_to_vec(key, None, Some(&wrong), &blob)
        .unwrap_err();
    assert!(err.is_tpm_rc(tpm_rc::AUTHFAIL), "{err}");
    assert_sessions_closed_once(&fx.mock, 1);
}

#[rstest]
fn test_wrong_data_password_auth2(mut fx: Fixture) {
    let key_auth = auth_from_password("key");
    let key = fx.mock.add_key(key_auth);
    let blob = fx.mock.seal(key, auth_from_password("right"), b"x");
    let wrong = auth_from_password("wrong");
    let err = fx
        .tpm
        .unseal_to_vec(key, Some(&key_auth), Some(&wrong), &blob)
        .unwrap_err();
    assert!(err.is_tpm_rc(tpm_rc::AUTH2FAIL), "{err}");
    assert_sessions_closed_once(&fx.mock, 2);
}

#[rstest]
fn test_missing_arguments(mut fx: Fixture) {
    let mut out = [0u8; 8];
    assert!(matches!(
        fx.tpm.unseal(1, None, None, None, Some(&mut out)),
        Err(TpmError::NullArgument(_))
    ));
    assert!(matches!(
        fx.tpm.unseal(1, None, None, Some(b"blob"), None),
        Err(TpmError::NullArgument(_))
    ));
    assert!(fx.mock.ordinals().is_empty());
}

#[rstest]
fn test_output_buffer_too_small(mut fx: Fixture) {
    let key = fx.mock.add_key(WELL_KNOWN_SECRET);
    let blob = fx.mock.seal(key, WELL_KNOWN_SECRET, b"0123456789");
    let mut out = [0xEEu8; 4];
    let err = fx
        .tpm
        .unseal(key, None, None, Some(&blob), Some(&mut out))
        .unwrap_err();
    assert!(matches!(
        err,
        TpmError::BufferTooSmall {
            needed: 10,
            available: 4
        }
    ));
    assert_eq!(out, [0xEE; 4]);
    assert_sessions_closed_once(&fx.mock, 1);
}

#[rstest]
#[case(false)]
#[case(true)]
fn test_forged_response_is_rejected(mut fx: Fixture, #[case] with_key_password: bool) {
    let key = fx.mock.add_key(WELL_KNOWN_SECRET);
    let blob = fx.mock.seal(key, WELL_KNOWN_SECRET, b"secret");
    fx.mock.set_corrupt_response_auth(true);
    let key_auth = with_key_password.then_some(WELL_KNOWN_SECRET);
    let mut out = [0u8; 16];
    let result = fx
        .tpm
        .unseal(key, key_auth.as_ref(), None, Some(&blob), Some(&mut out));
    assert!(matches!(result, Err(TpmError::AuthFailed)));
    assert_eq!(out, [0u8; 16]);
    assert_sessions_closed_once(&fx.mock, if with_key_password { 2 } else { 1 });
}

#[derive(Debug)]
struct FailingHmac;

impl AuthHmac for FailingHmac {
    fn hmac(&self, _key: &[u8], _message: &[&[u8]]) -> Result<TpmDigest, TpmError> {
        Err(TpmError::Hmac("injected failure".to_string()))
    }
}

#[rstest]
#[case(false, 1)]
#[case(true, 1)]
fn test_no_session_leaks_when_hmac_fails(
    fx: Fixture,
    #[case] with_key_password: bool,
    #[case] sessions: usize,
) {
    let Fixture { _dir, mock, tpm } = fx;
    let mut tpm = tpm.with_hmac(FailingHmac);
    let key = mock.add_key(WELL_KNOWN_SECRET);
    let blob = mock.seal(key, WELL_KNOWN_SECRET, b"secret");
    let key_auth = with_key_password.then_some(WELL_KNOWN_SECRET);

    let result = tpm.unseal_to_vec(key, key_auth.as_ref(), None, &blob);
    assert!(matches!(result, Err(TpmError::Hmac(_))));
    assert_sessions_closed_once(&mock, sessions);
    assert!(mock.open_sessions().is_empty());
    assert!(!mock.ordinals().contains(&tpm_ord::UNSEAL));
}

#[rstest]
fn test_nv_read_unauthenticated(mut fx: Fixture) {
    fx.mock.set_nv(0x0001_0000, b"nv contents");
    let data = fx.tpm.nv_read_value(0x0001_0000, 3, 1024, None).unwrap();
    assert_eq!(data, b"contents");
    assert!(fx.mock.session_terminations().is_empty());
}

#[rstest]
fn test_nv_read_with_owner(mut fx: Fixture) {
    let owner = auth_from_password("owner");
    fx.mock.set_owner_auth(owner);
    fx.mock.set_nv(0x0001_0000, b"owner data");

    let data = fx
        .tpm
        .nv_read_value(0x0001_0000, 0, 1024, Some(&owner))
        .unwrap();
    assert_eq!(data, b"owner data");
    assert_sessions_closed_once(&fx.mock, 1);

    let wrong = auth_from_password("nope");
    let err = fx
        .tpm
        .nv_read_value(0x0001_0000, 0, 1024, Some(&wrong))
        .unwrap_err();
    assert!(err.is_tpm_rc(tpm_rc::AUTHFAIL), "{err}");
    assert_sessions_closed_once(&fx.mock, 2);
}

#[rstest]
fn test_nv_read_bad_index(mut fx: Fixture) {
    let err = fx.tpm.nv_read_value(0x0bad, 0, 16, None).unwrap_err();
    assert!(err.is_tpm_rc(tpm_rc::BADINDEX));
    assert_eq!(err.code(), tpm_rc::BADINDEX);
}
