// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use rstest::{fixture, rstest};
use std::fs;
use tempfile::TempDir;
use tpmkey::{
    constants::{tpm_et, tpm_kh, tpm_ord, tpm_rc},
    crypto::{auth_from_password, WELL_KNOWN_SECRET},
    delegation::{append_record, DelegationHeader},
    mocktpm::MockTpm,
    session::{with_session, with_sessions2, Session, SessionKind, SessionSpec},
    Config, TpmContext, TpmDevice, TpmError,
};

struct Fixture {
    dir: TempDir,
    mock: MockTpm,
}

impl Fixture {
    fn tpm(&self, config: Config) -> TpmContext {
        TpmContext::new(TpmDevice::new(self.mock.clone()), config)
    }

    fn config(&self) -> Config {
        Config {
            delegation_dir: self.dir.path().to_path_buf(),
            ..Config::default()
        }
    }
}

#[fixture]
fn fx() -> Fixture {
    Fixture {
        dir: TempDir::new().unwrap(),
        mock: MockTpm::new(),
    }
}

#[rstest]
fn test_open_and_close_oiap(fx: Fixture) {
    let mut tpm = fx.tpm(fx.config());
    let session = Session::open(
        &mut tpm,
        SessionSpec::Oiap {
            secret: WELL_KNOWN_SECRET,
        },
    )
    .unwrap();
    assert_eq!(session.kind(), SessionKind::Oiap);
    assert_eq!(session.handle(), 0x0200_0000);
    assert_eq!(session.binding(), None);
    assert_eq!(fx.mock.open_sessions(), vec![session.handle()]);

    let handle = session.handle();
    session.close(&mut tpm);
    assert!(fx.mock.open_sessions().is_empty());
    assert_eq!(fx.mock.terminate_count(handle), 1);
}

#[rstest]
fn test_open_osap_binds_entity(fx: Fixture) {
    let mut tpm = fx.tpm(fx.config());
    let key = fx.mock.add_key(auth_from_password("key"));
    let session = Session::open(
        &mut tpm,
        SessionSpec::new(
            SessionKind::Osap,
            auth_from_password("key"),
            tpm_et::KEYHANDLE,
            key,
        ),
    )
    .unwrap();
    assert_eq!(session.kind(), SessionKind::Osap);
    let binding = session.binding().unwrap();
    assert_eq!(binding.entity_type, tpm_et::KEYHANDLE);
    assert_eq!(binding.entity_handle, key);
    assert_ne!(session.state().secret, auth_from_password("key"));
    session.close(&mut tpm);
}

#[rstest]
fn test_osap_on_unknown_key_issues_no_session(fx: Fixture) {
    let mut tpm = fx.tpm(fx.config());
    let err = Session::open_osap(&mut tpm, &WELL_KNOWN_SECRET, tpm_et::KEYHANDLE, 0x0100_0042)
        .unwrap_err();
    assert!(err.is_tpm_rc(tpm_rc::INVALID_KEYHANDLE));
    assert!(fx.mock.session_terminations().is_empty());
}

#[rstest]
fn test_dsap_reads_blob_from_store(fx: Fixture) {
    let config = fx.config();
    let key = fx.mock.add_key(WELL_KNOWN_SECRET);
    fx.mock.add_delegation(b"stored blob", WELL_KNOWN_SECRET);
    append_record(
        &config.delegation_file(),
        &DelegationHeader {
            entity_type: tpm_et::DEL_KEY_BLOB.into(),
            key_handle: key,
            ..DelegationHeader::default()
        },
        b"stored blob",
    )
    .unwrap();

    let mut tpm = fx.tpm(config);
    let session = Session::open(
        &mut tpm,
        SessionSpec::new(
            SessionKind::Dsap,
            WELL_KNOWN_SECRET,
            tpm_et::DEL_KEY_BLOB,
            key,
        ),
    )
    .unwrap();
    assert_eq!(session.kind(), SessionKind::Dsap);
    assert_eq!(session.binding().unwrap().entity_handle, key);
    session.close(&mut tpm);
}

#[rstest]
fn test_dsap_without_record_fails_before_device(fx: Fixture) {
    let mut tpm = fx.tpm(fx.config());
    let result = Session::open(
        &mut tpm,
        SessionSpec::new(
            SessionKind::Dsap,
            WELL_KNOWN_SECRET,
            tpm_et::DEL_KEY_BLOB,
            0x0100_0000,
        ),
    );
    assert!(matches!(result, Err(TpmError::NotFound)));
    assert!(fx.mock.ordinals().is_empty());
}

#[rstest]
#[case::empty_store(false)]
#[case::missing_store(true)]
fn test_key_delegated_falls_back_to_osap(fx: Fixture, #[case] missing_store: bool) {
    let mut config = fx.config();
    if missing_store {
        config.delegation_dir = fx.dir.path().join("does-not-exist");
    }
    let key = fx.mock.add_key(WELL_KNOWN_SECRET);
    let mut tpm = fx.tpm(config);
    let session = Session::open(
        &mut tpm,
        SessionSpec::KeyDelegated {
            key_auth: WELL_KNOWN_SECRET,
            key_handle: key,
        },
    )
    .unwrap();
    assert_eq!(session.kind(), SessionKind::Osap);
    assert_eq!(session.binding().unwrap().entity_type, tpm_et::KEYHANDLE);
    session.close(&mut tpm);
}

#[rstest]
fn test_key_delegated_uses_override_file(fx: Fixture) {
    let blob_path = fx.dir.path().join("key.blob");
    fs::write(&blob_path, b"override blob").unwrap();
    fx.mock.add_delegation(b"override blob", WELL_KNOWN_SECRET);
    let config = Config {
        key_blob_override: Some(blob_path),
        ..fx.config()
    };
    let key = fx.mock.add_key(auth_from_password("other"));
    let mut tpm = fx.tpm(config);
    let session = Session::open(
        &mut tpm,
        SessionSpec::KeyDelegated {
            key_auth: WELL_KNOWN_SECRET,
            key_handle: key,
        },
    )
    .unwrap();
    assert_eq!(session.kind(), SessionKind::Dsap);
    session.close(&mut tpm);
    assert_eq!(fx.mock.ordinals()[0], tpm_ord::DSAP);
}

#[rstest]
fn test_with_session_closes_on_error(fx: Fixture) {
    let mut tpm = fx.tpm(fx.config());
    let result: Result<(), TpmError> = with_session(
        &mut tpm,
        SessionSpec::Oiap {
            secret: WELL_KNOWN_SECRET,
        },
        |_, _| Err(TpmError::AuthFailed),
    );
    assert!(matches!(result, Err(TpmError::AuthFailed)));
    assert_eq!(fx.mock.session_terminations(), vec![(0x0200_0000, 1)]);
    assert!(fx.mock.open_sessions().is_empty());
}

#[rstest]
fn test_with_sessions2_closes_key_session_when_data_open_fails(fx: Fixture) {
    let mut tpm = fx.tpm(fx.config());
    let result: Result<(), TpmError> = with_sessions2(
        &mut tpm,
        SessionSpec::KeyDelegated {
            key_auth: WELL_KNOWN_SECRET,
            key_handle: tpm_kh::SRK,
        },
        SessionSpec::Dsap {
            entity_auth: WELL_KNOWN_SECRET,
            entity_type: tpm_et::DEL_KEY_BLOB,
            key_handle: tpm_kh::SRK,
            blob: Some(b"unknown blob".to_vec()),
        },
        |_, _, _| Ok(()),
    );
    assert!(result.unwrap_err().is_tpm_rc(tpm_rc::BAD_PARAMETER));
    assert_eq!(fx.mock.session_terminations(), vec![(0x0200_0000, 1)]);
    assert!(fx.mock.open_sessions().is_empty());
}

#[rstest]
fn test_with_sessions2_passes_key_session_first(fx: Fixture) {
    let mut tpm = fx.tpm(fx.config());
    let kinds = with_sessions2(
        &mut tpm,
        SessionSpec::KeyDelegated {
            key_auth: WELL_KNOWN_SECRET,
            key_handle: tpm_kh::SRK,
        },
        SessionSpec::Oiap {
            secret: WELL_KNOWN_SECRET,
        },
        |_, key, data| Ok((key.kind(), data.kind())),
    )
    .unwrap();
    assert_eq!(kinds, (SessionKind::Osap, SessionKind::Oiap));
    assert_eq!(
        fx.mock.session_terminations(),
        vec![(0x0200_0000, 1), (0x0200_0001, 1)]
    );
}
