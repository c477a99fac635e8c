// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy

use rstest::{fixture, rstest};
use std::{fs, io::Write, os::unix::fs::PermissionsExt, path::PathBuf};
use tempfile::TempDir;
use tpmkey::{
    config::{Config, ENV_KEY_BLOB, ENV_OWNER_BLOB},
    constants::tpm_et,
    delegation::{append_record, DelegationHeader, DelegationStore, DELEGATION_HEADER_SIZE},
    TpmError,
};

const KEY_BLOB: u32 = tpm_et::DEL_KEY_BLOB as u32;
const OWNER_BLOB: u32 = tpm_et::DEL_OWNER_BLOB as u32;

struct Store {
    dir: TempDir,
    config: Config,
}

impl Store {
    fn path(&self) -> PathBuf {
        self.config.delegation_file()
    }

    fn add(&self, entity_type: u32, key_handle: u32, blob: &[u8]) {
        let header = DelegationHeader {
            entity_type,
            key_handle,
            pass_hash: [0x5A; 20],
            ..DelegationHeader::default()
        };
        append_record(&self.path(), &header, blob).unwrap();
    }

    fn store(&self) -> DelegationStore {
        DelegationStore::new(&self.config)
    }
}

#[fixture]
fn store() -> Store {
    let dir = TempDir::new().unwrap();
    let config = Config {
        instance: "7".to_string(),
        delegation_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    Store { dir, config }
}

#[rstest]
fn test_store_file_name(store: Store) {
    assert_eq!(store.path(), store.dir.path().join(".delegation-7"));
}

#[rstest]
fn test_find_first_match(store: Store) {
    store.add(KEY_BLOB, 0x0100_0001, b"blob-a");
    store.add(OWNER_BLOB, 0x0100_0002, b"blob-b");
    store.add(KEY_BLOB, 0x0100_0001, b"shadowed");

    let entry = store.store().find(KEY_BLOB, 0x0100_0001).unwrap();
    assert_eq!(entry.blob, b"blob-a");
    let header = entry.header.unwrap();
    assert_eq!(header.blob_size, 6);
    assert_eq!(header.pass_hash, [0x5A; 20]);

    let entry = store.store().find(OWNER_BLOB, 0x0100_0002).unwrap();
    assert_eq!(entry.blob, b"blob-b");
}

#[rstest]
fn test_find_no_match(store: Store) {
    store.add(KEY_BLOB, 0x0100_0001, b"blob-a");
    store.add(OWNER_BLOB, 0x0100_0002, b"blob-b");
    assert!(matches!(
        store.store().find(OWNER_BLOB, 0x0100_0003),
        Err(TpmError::NotFound)
    ));
}

#[rstest]
fn test_empty_store_is_created(store: Store) {
    assert!(!store.path().exists());
    assert!(matches!(
        store.store().find(KEY_BLOB, 1),
        Err(TpmError::NotFound)
    ));
    let metadata = fs::metadata(store.path()).unwrap();
    assert_eq!(metadata.len(), 0);
    assert_eq!(metadata.permissions().mode() & 0o700, 0o700);
}

#[rstest]
fn test_short_header_ends_scan(store: Store) {
    store.add(KEY_BLOB, 1, b"blob-a");
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(store.path())
        .unwrap();
    file.write_all(&[0xFF; DELEGATION_HEADER_SIZE - 1]).unwrap();
    assert!(matches!(
        store.store().find(KEY_BLOB, 2),
        Err(TpmError::NotFound)
    ));
    assert_eq!(store.store().find(KEY_BLOB, 1).unwrap().blob, b"blob-a");
}

#[rstest]
#[case::short(64)]
#[case::huge(0xFFFF_FFF0)]
fn test_truncated_blob_is_bad_file(store: Store, #[case] blob_size: u32) {
    let header = DelegationHeader {
        entity_type: KEY_BLOB,
        key_handle: 1,
        blob_size,
        ..DelegationHeader::default()
    };
    let mut bytes = header.to_bytes().to_vec();
    bytes.extend_from_slice(&[0u8; 10]);
    fs::write(store.path(), bytes).unwrap();
    assert!(matches!(
        store.store().find(KEY_BLOB, 1),
        Err(TpmError::BadFile(_))
    ));
}

#[rstest]
fn test_find_into(store: Store) {
    store.add(KEY_BLOB, 1, b"0123456789");
    let mut buf = [0u8; 16];
    let len = store.store().find_into(KEY_BLOB, 1, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"0123456789");

    let mut small = [0u8; 4];
    assert!(matches!(
        store.store().find_into(KEY_BLOB, 1, &mut small),
        Err(TpmError::BufferTooSmall {
            needed: 10,
            available: 4
        })
    ));
}

#[test]
fn test_header_layout_is_little_endian() {
    let header = DelegationHeader {
        entity_type: KEY_BLOB,
        key_handle: 0x0102_0304,
        key_digest: [1; 20],
        blob_size: 0x100,
        pass_hash: [2; 20],
        old_pass_hash: [3; 20],
    };
    let bytes = header.to_bytes();
    assert_eq!(&bytes[0..4], &[0x09, 0, 0, 0]);
    assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
    assert_eq!(&bytes[28..32], &[0x00, 0x01, 0, 0]);
    assert_eq!(DelegationHeader::from_bytes(&bytes), header);
}

#[rstest]
fn test_override_file_wins(mut store: Store) {
    store.add(KEY_BLOB, 1, b"from-store");
    let blob_path = store.dir.path().join("key.blob");
    fs::write(&blob_path, b"from-override").unwrap();
    store.config.key_blob_override = Some(blob_path);

    let entry = store.store().find(KEY_BLOB, 1).unwrap();
    assert_eq!(entry.blob, b"from-override");
    assert!(entry.header.is_none());

    let mut small = [0u8; 4];
    assert!(matches!(
        store.store().find_into(KEY_BLOB, 1, &mut small),
        Err(TpmError::BufferTooSmall { .. })
    ));
}

#[rstest]
fn test_override_applies_to_its_entity_type_only(mut store: Store) {
    store.add(OWNER_BLOB, 1, b"owner");
    let blob_path = store.dir.path().join("key.blob");
    fs::write(&blob_path, b"key").unwrap();
    store.config.key_blob_override = Some(blob_path);
    assert_eq!(store.store().find(OWNER_BLOB, 1).unwrap().blob, b"owner");
}

#[rstest]
fn test_unreadable_override_falls_back(mut store: Store) {
    store.add(KEY_BLOB, 1, b"from-store");
    store.config.key_blob_override = Some(store.dir.path().join("missing.blob"));
    assert_eq!(store.store().find(KEY_BLOB, 1).unwrap().blob, b"from-store");
}

#[rstest]
#[case(KEY_BLOB, ENV_KEY_BLOB)]
#[case(OWNER_BLOB, ENV_OWNER_BLOB)]
fn test_unset_override_and_no_store(
    mut store: Store,
    #[case] entity_type: u32,
    #[case] var: &'static str,
) {
    store.config.delegation_dir = store.dir.path().join("does-not-exist");
    match store.store().find(entity_type, 1) {
        Err(TpmError::EnvVariable(name)) => assert_eq!(name, var),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[rstest]
fn test_no_store_for_plain_entity_is_file_error(mut store: Store) {
    store.config.delegation_dir = store.dir.path().join("does-not-exist");
    assert!(matches!(
        store.store().find(tpm_et::KEYHANDLE.into(), 1),
        Err(TpmError::File(..))
    ));
}
