//! Tests for boot-time encryption, re-keying and decryption
//!
//! These tests verify:
//! - Which credential a database accepts after each transition
//! - Page bodies on disk are unreadable while encrypted
//! - Invalid transitions are refused
//! - A crash at any point of a transition leaves exactly one usable key

#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{keyed_row, test_config};
use pagevault::store::container_path;
use pagevault::{
    BootRequest, Config, ContainerId, CrashAt, CrashPoint, Credential, Database, EncryptionChange,
    EncryptionState, Row, VaultError,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const MARKER: &[u8] = b"plaintext-marker-that-must-not-leak";

type Contents = BTreeMap<ContainerId, Vec<Row>>;

fn request(credential: Option<&Credential>) -> BootRequest {
    match credential {
        Some(credential) => BootRequest::with_credential(credential.clone()),
        None => BootRequest::new(),
    }
}

fn open(dir: &Path, credential: Option<&Credential>) -> pagevault::Result<Database> {
    Database::boot(test_config(dir), request(credential))
}

/// Two containers with a few rows each, marker included; closed cleanly
fn setup_temp_db_with_data() -> (TempDir, Contents) {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let db = open(temp_dir.path(), None).unwrap();
    let mut contents = Contents::new();
    for name in ["first", "second"] {
        let c = db.create_container(name, None).unwrap();
        let txn = db.begin().unwrap();
        let mut rows = vec![Row::new(vec![MARKER.to_vec()])];
        rows.extend((0..40).map(|k| keyed_row(k + c * 100, 150)));
        rows.push(Row::new(vec![vec![7; 5000]]));
        for row in &rows {
            db.insert(txn, c, row.clone()).unwrap();
        }
        db.commit(txn).unwrap();
        contents.insert(c, rows);
    }
    db.close().unwrap();
    (temp_dir, contents)
}

fn read_contents(db: &Database) -> Contents {
    let mut contents = Contents::new();
    for name in ["first", "second"] {
        let c = db.container_id(name).unwrap();
        let txn = db.begin().unwrap();
        let rows = db.scan(txn, c).unwrap().into_iter().map(|(_, row)| row).collect();
        db.commit(txn).unwrap();
        db.check_consistency(c).unwrap();
        contents.insert(c, rows);
    }
    contents
}

fn sorted(contents: &Contents) -> BTreeMap<ContainerId, Vec<Vec<Vec<u8>>>> {
    contents
        .iter()
        .map(|(c, rows)| {
            let mut rows: Vec<Vec<Vec<u8>>> = rows.iter().map(|r| r.columns.clone()).collect();
            rows.sort();
            (*c, rows)
        })
        .collect()
}

fn marker_on_disk(dir: &Path, contents: &Contents) -> bool {
    contents.keys().any(|c| {
        let bytes = fs::read(container_path(dir, *c)).unwrap();
        bytes.windows(MARKER.len()).any(|w| w == MARKER)
    })
}

/// Run `change` with `current`, then close
fn transition(dir: &Path, current: Option<&Credential>, change: EncryptionChange) {
    let db = Database::boot(test_config(dir), request(current).change(change)).unwrap();
    db.close().unwrap();
}

// =============================================================================
// Credential Tests
// =============================================================================

#[test]
fn test_encrypt_reencrypt_decrypt() {
    let (temp_dir, expected) = setup_temp_db_with_data();
    let dir = temp_dir.path();
    let old = Credential::new("correct horse");
    let new = Credential::new("battery staple");
    assert!(marker_on_disk(dir, &expected));

    // Encrypt
    transition(dir, None, EncryptionChange::Encrypt(old.clone()));
    assert!(!marker_on_disk(dir, &expected));
    assert!(matches!(open(dir, None), Err(VaultError::CredentialRequired)));
    assert!(matches!(open(dir, Some(&new)), Err(VaultError::CredentialMismatch)));
    let db = open(dir, Some(&old)).unwrap();
    assert_eq!(db.encryption_state(), EncryptionState::Encrypted);
    assert_eq!(sorted(&read_contents(&db)), sorted(&expected));

    // New containers pick up the key too
    let extra = db.create_container("third", None).unwrap();
    let txn = db.begin().unwrap();
    db.insert(txn, extra, Row::new(vec![MARKER.to_vec()])).unwrap();
    db.commit(txn).unwrap();
    db.close().unwrap();
    let bytes = fs::read(container_path(dir, extra)).unwrap();
    assert!(!bytes.windows(MARKER.len()).any(|w| w == MARKER));

    // Re-encrypt
    transition(dir, Some(&old), EncryptionChange::Reencrypt(new.clone()));
    assert!(matches!(open(dir, Some(&old)), Err(VaultError::CredentialMismatch)));
    let db = open(dir, Some(&new)).unwrap();
    assert_eq!(db.encryption_state(), EncryptionState::Encrypted);
    assert_eq!(sorted(&read_contents(&db)), sorted(&expected));
    db.close().unwrap();

    // Decrypt
    transition(dir, Some(&new), EncryptionChange::Decrypt);
    assert!(matches!(open(dir, Some(&new)), Err(VaultError::CredentialMismatch)));
    let db = open(dir, None).unwrap();
    assert_eq!(db.encryption_state(), EncryptionState::Plain);
    assert_eq!(sorted(&read_contents(&db)), sorted(&expected));
    db.close().unwrap();
    assert!(marker_on_disk(dir, &expected));
}

#[test]
fn test_encrypted_database_keeps_working() {
    let (temp_dir, _) = setup_temp_db_with_data();
    let dir = temp_dir.path();
    let key = Credential::new("k");
    transition(dir, None, EncryptionChange::Encrypt(key.clone()));

    let db = open(dir, Some(&key)).unwrap();
    let c = db.container_id("first").unwrap();
    let txn = db.begin().unwrap();
    let id = db.insert(txn, c, keyed_row(999, 2000)).unwrap();
    db.commit(txn).unwrap();
    // Crash: the row has to come back from the log onto encrypted pages
    drop(db);

    let db = open(dir, Some(&key)).unwrap();
    let txn = db.begin().unwrap();
    assert_eq!(db.fetch(txn, id).unwrap(), keyed_row(999, 2000));
    db.commit(txn).unwrap();
}

#[test]
fn test_invalid_transitions_refused() {
    let (temp_dir, expected) = setup_temp_db_with_data();
    let dir = temp_dir.path();

    let err = Database::boot(test_config(dir), BootRequest::new().change(EncryptionChange::Decrypt))
        .err()
        .unwrap();
    assert!(matches!(err, VaultError::InvalidTransition(_)), "{err}");
    let err = Database::boot(
        test_config(dir),
        BootRequest::new().change(EncryptionChange::Reencrypt(Credential::new("x"))),
    )
    .err()
    .unwrap();
    assert!(matches!(err, VaultError::InvalidTransition(_)));

    let key = Credential::new("k");
    transition(dir, None, EncryptionChange::Encrypt(key.clone()));
    let err = Database::boot(
        test_config(dir),
        request(Some(&key)).change(EncryptionChange::Encrypt(Credential::new("again"))),
    )
    .err()
    .unwrap();
    assert!(matches!(err, VaultError::InvalidTransition(_)));

    // Refused changes leave the database as it was
    let db = open(dir, Some(&key)).unwrap();
    assert_eq!(db.encryption_state(), EncryptionState::Encrypted);
    assert_eq!(sorted(&read_contents(&db)), sorted(&expected));
}

// =============================================================================
// Crash Point Tests
// =============================================================================

struct Case {
    name: &'static str,
    /// Credential before the transition (after setup)
    before: Option<Credential>,
    /// Credential after it
    after: Option<Credential>,
    change: EncryptionChange,
}

fn cases() -> Vec<Case> {
    let old = Credential::new("old secret");
    let new = Credential::new("new secret");
    vec![
        Case {
            name: "encrypt",
            before: None,
            after: Some(new.clone()),
            change: EncryptionChange::Encrypt(new.clone()),
        },
        Case {
            name: "reencrypt",
            before: Some(old.clone()),
            after: Some(new.clone()),
            change: EncryptionChange::Reencrypt(new),
        },
        Case {
            name: "decrypt",
            before: Some(old),
            after: None,
            change: EncryptionChange::Decrypt,
        },
    ]
}

fn crashing_config(dir: &Path, point: CrashPoint) -> Config {
    let mut config = test_config(dir);
    config.faults = Config::builder()
        .fault_injector(Arc::new(CrashAt(point)))
        .build()
        .faults;
    config
}

#[test]
fn test_crash_at_every_point_leaves_one_key() {
    for case in cases() {
        for point in CrashPoint::ALL {
            let label = format!("{} at {point:?}", case.name);
            let (temp_dir, expected) = setup_temp_db_with_data();
            let dir = temp_dir.path();
            if let Some(before) = &case.before {
                transition(dir, None, EncryptionChange::Encrypt(before.clone()));
            }

            let err = Database::boot(
                crashing_config(dir, point),
                request(case.before.as_ref()).change(case.change.clone()),
            )
            .err()
            .unwrap();
            assert!(
                matches!(err, VaultError::InjectedCrash(p) if p == point),
                "{label}: {err}"
            );

            let with_before = open(dir, case.before.as_ref());
            let before_ok = with_before.is_ok();
            drop(with_before);
            let with_after = open(dir, case.after.as_ref());
            let after_ok = with_after.is_ok();
            drop(with_after);

            assert_ne!(before_ok, after_ok, "{label}: exactly one credential must open it");
            assert_eq!(after_ok, point.is_after_switch(), "{label}");

            let working = if after_ok { &case.after } else { &case.before };
            let db = open(dir, working.as_ref()).unwrap();
            assert_eq!(sorted(&read_contents(&db)), sorted(&expected), "{label}");
            let state = db.encryption_state();
            assert_eq!(
                state,
                if working.is_some() {
                    EncryptionState::Encrypted
                } else {
                    EncryptionState::Plain
                },
                "{label}"
            );
            db.close().unwrap();

            // No shadow file is left behind
            let leftovers = fs::read_dir(dir.join("seg0"))
                .unwrap()
                .filter(|e| {
                    let name = e.as_ref().unwrap().file_name();
                    !name.to_string_lossy().ends_with(".dat")
                })
                .count();
            assert_eq!(leftovers, 0, "{label}");
        }
    }
}

#[test]
fn test_failed_transition_can_be_retried() {
    let (temp_dir, expected) = setup_temp_db_with_data();
    let dir = temp_dir.path();
    let key = Credential::new("retry");

    let err = Database::boot(
        crashing_config(dir, CrashPoint::MidRewrite),
        BootRequest::new().change(EncryptionChange::Encrypt(key.clone())),
    )
    .err()
    .unwrap();
    assert!(matches!(err, VaultError::InjectedCrash(CrashPoint::MidRewrite)));

    transition(dir, None, EncryptionChange::Encrypt(key.clone()));
    let db = open(dir, Some(&key)).unwrap();
    assert_eq!(sorted(&read_contents(&db)), sorted(&expected));
}
