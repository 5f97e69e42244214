//! Tests for the file-backed service
//!
//! This test suite covers:
//! - Restart recovery of keys, messages and sequence counters
//! - Nothing readable at rest: no plaintext, no raw key material
//! - Wrong master key on reopen

use conclave_core::crypto::master_key::generate_salt;
use conclave_core::{ConclaveError, Config, Conversation, ConversationService, MasterKey};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const PASSPHRASE: &str = "conclave test passphrase 1";

fn config() -> Config {
    Config {
        pbkdf2_iterations: 1_000,
        ..Config::default()
    }
}

fn open(root: &Path, salt: &[u8], passphrase: &str) -> ConversationService {
    let config = config();
    let master = MasterKey::derive(passphrase, salt, &config).unwrap();
    ConversationService::open_file_backed(config, root, master).unwrap()
}

fn read_all_files(root: &Path) -> Vec<u8> {
    let mut bytes = Vec::new();
    for sub in ["keys", "messages"] {
        for entry in fs::read_dir(root.join(sub)).unwrap() {
            bytes.extend(fs::read(entry.unwrap().path()).unwrap());
        }
    }
    bytes
}

/// Test that history, keys and sequence numbers survive a restart
#[test]
fn test_restart_recovers_history() {
    let dir = TempDir::new().unwrap();
    let salt = generate_salt(&config()).unwrap();

    let conversation: Conversation = {
        let service = open(dir.path(), &salt, PASSPHRASE);
        let conv = service.create_conversation("A", &["B"], None).unwrap();
        service.send_message(&conv.id, "A", b"before rotation").unwrap();
        service.rotate_key(&conv.id).unwrap();
        service.send_message(&conv.id, "B", b"after rotation").unwrap();
        service.conversation(&conv.id).unwrap()
    };

    let service = open(dir.path(), &salt, PASSPHRASE);
    assert!(matches!(
        service.read_messages(&conversation.id, "A", None, None),
        Err(ConclaveError::ConversationNotFound(_))
    ));

    let restored = service.register_conversation(conversation.clone()).unwrap();
    assert_eq!(restored.key_version, 2);

    let page = service
        .read_messages(&conversation.id, "A", None, None)
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page.items[0].outcome.plaintext(), Some(&b"after rotation"[..]));
    assert_eq!(page.items[1].outcome.plaintext(), Some(&b"before rotation"[..]));

    let next = service
        .send_message(&conversation.id, "A", b"third")
        .unwrap();
    assert_eq!(next.sequence, 3);
    assert_eq!(next.key_version, 2);

    assert_eq!(service.rotate_key(&conversation.id).unwrap(), 3);
}

/// Test that neither plaintext nor key material is stored in the clear
#[test]
fn test_nothing_readable_at_rest() {
    let dir = TempDir::new().unwrap();
    let salt = generate_salt(&config()).unwrap();
    let service = open(dir.path(), &salt, PASSPHRASE);

    let conv = service.create_conversation("A", &["B"], None).unwrap();
    let secret = b"the eagle lands at midnight";
    service.send_message(&conv.id, "A", secret).unwrap();

    let key = service.key_manager().active_key(&conv.id).unwrap();
    let raw = read_all_files(dir.path());
    let text = String::from_utf8_lossy(&raw);

    assert!(!raw.windows(secret.len()).any(|w| w == secret));
    assert!(!raw
        .windows(key.material().len())
        .any(|w| w == key.material().as_slice()));
    assert!(!text.contains(&hex::encode(key.material().as_slice())));
}

/// Test that a different passphrase cannot reopen the stored keys
#[test]
fn test_wrong_passphrase_cannot_restore() {
    let dir = TempDir::new().unwrap();
    let salt = generate_salt(&config()).unwrap();

    let conversation = {
        let service = open(dir.path(), &salt, PASSPHRASE);
        let conv = service.create_conversation("A", &["B"], None).unwrap();
        service.send_message(&conv.id, "A", b"hi").unwrap();
        conv
    };

    let service = open(dir.path(), &salt, "a different passphrase 2");
    let err = service.register_conversation(conversation).unwrap_err();
    assert!(matches!(err, ConclaveError::CryptoError(_)));
}

/// Test that conversations are stored in separate logs
#[test]
fn test_one_log_per_conversation() {
    let dir = TempDir::new().unwrap();
    let salt = generate_salt(&config()).unwrap();
    let service = open(dir.path(), &salt, PASSPHRASE);

    let first = service.create_conversation("A", &["B"], None).unwrap();
    let second = service.create_conversation("A", &["C"], None).unwrap();
    service.send_message(&first.id, "A", b"1").unwrap();
    service.send_message(&second.id, "C", b"2").unwrap();

    assert_eq!(fs::read_dir(dir.path().join("keys")).unwrap().count(), 2);
    assert_eq!(fs::read_dir(dir.path().join("messages")).unwrap().count(), 2);

    let page = service.read_messages(&second.id, "A", None, None).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page.items[0].message.sequence, 1);
}
