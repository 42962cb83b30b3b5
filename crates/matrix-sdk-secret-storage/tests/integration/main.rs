// Copyright 2023 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use assert_matches2::{assert_let, assert_matches};
use matrix_sdk_secret_storage::{
    types::{
        BACKUP_KEY_SECRET, MASTER_KEY_SECRET, SELF_SIGNING_KEY_SECRET, USER_SIGNING_KEY_SECRET,
    },
    AccountDataStore, DecryptionError, KeySpec, MemoryStore, ProgressListener,
    SecretStorageError, SecretStorageSettings, SharedSecretStorage, Signatures,
};
use serde_json::json;

const CROSS_SIGNING_SECRETS: &[&str] =
    &[MASTER_KEY_SECRET, SELF_SIGNING_KEY_SECRET, USER_SIGNING_KEY_SECRET];

fn settings() -> SecretStorageSettings {
    SecretStorageSettings { passphrase_iterations: 1000, ..Default::default() }
}

#[tokio::test]
async fn bootstrap_and_recover_with_recovery_key() {
    let store = Arc::new(MemoryStore::new());
    let storage = SharedSecretStorage::with_settings(store.clone(), settings());

    assert!(!storage.is_enabled().unwrap());

    let signer = |canonical_json: &str| -> Option<Signatures> {
        Some(Signatures::from([(
            "@alice:example.org".to_owned(),
            [("ed25519:ABCDEFGH".to_owned(), format!("sig:{}", canonical_json.len()))].into(),
        )]))
    };

    let info = storage.generate_key("ssss", "Default key", Some(&signer)).await.unwrap();
    storage.set_default_key("ssss").await.unwrap();
    assert!(storage.is_enabled().unwrap());

    for (index, secret) in CROSS_SIGNING_SECRETS.iter().enumerate() {
        let plaintext = format!("private key {index}");
        storage.store_secret(secret, plaintext.as_bytes(), &[]).await.unwrap();
    }

    let document = store.get_account_data("m.secret_storage.default_key").unwrap().unwrap();
    assert_eq!(document, json!({ "key": "ssss" }));

    let key_document = store.get_account_data("m.secret_storage.key.ssss").unwrap().unwrap();
    assert_eq!(key_document["algorithm"], "m.secret_storage.v1.curve25519-aes-sha2");
    assert!(key_document["signatures"]["@alice:example.org"]["ed25519:ABCDEFGH"].is_string());

    // Another device of the user, sharing the same account data.
    let other_device = SharedSecretStorage::new(store);

    let integrity =
        other_device.check_should_be_able_to_access_secrets(CROSS_SIGNING_SECRETS, None).unwrap();
    assert!(!integrity.has_passphrase);

    let key_spec = KeySpec::from_recovery_key(&info.recovery_key).unwrap();
    assert!(other_device.get_default_key().unwrap().matches_key_spec(&key_spec));

    for (index, secret) in CROSS_SIGNING_SECRETS.iter().enumerate() {
        let plaintext = other_device.get_secret(secret, None, &key_spec).await.unwrap();
        assert_eq!(plaintext.as_slice(), format!("private key {index}").as_bytes());
    }
}

#[tokio::test]
async fn passphrase_recovery() {
    let storage = SharedSecretStorage::with_settings(MemoryStore::new(), settings());

    storage
        .generate_key_with_passphrase("ssss", "Passphrase key", "hunter2", None, None)
        .await
        .unwrap();
    storage.set_default_key("ssss").await.unwrap();
    storage.store_secret(BACKUP_KEY_SECRET, b"backup recovery key", &[]).await.unwrap();

    let integrity =
        storage.check_should_be_able_to_access_secrets(&[BACKUP_KEY_SECRET], None).unwrap();
    assert!(integrity.has_passphrase);

    let progress = Arc::new(AtomicU32::new(0));
    let listener: Arc<dyn ProgressListener> = {
        let progress = progress.clone();
        Arc::new(move |current: u32, total: u32| {
            assert!(current <= total);
            progress.store(current, Ordering::SeqCst);
        })
    };

    let key_spec =
        storage.key_spec_from_passphrase("ssss", "hunter2", Some(listener)).await.unwrap();
    assert_eq!(progress.load(Ordering::SeqCst), 1000);

    let plaintext = storage.get_secret(BACKUP_KEY_SECRET, None, &key_spec).await.unwrap();
    assert_eq!(plaintext.as_slice(), b"backup recovery key");

    let wrong = storage.key_spec_from_passphrase("ssss", "hunter3", None).await.unwrap();
    assert_matches!(
        storage.get_secret(BACKUP_KEY_SECRET, None, &wrong).await,
        Err(SecretStorageError::Decryption(DecryptionError::Mac(_)))
    );
}

#[tokio::test]
async fn key_rotation_keeps_old_secrets_readable() {
    let storage = SharedSecretStorage::with_settings(MemoryStore::new(), settings());

    let old = storage.generate_key("old", "Old key", None).await.unwrap();
    let new = storage.generate_key("new", "New key", None).await.unwrap();

    storage.set_default_key("old").await.unwrap();
    storage.store_secret(MASTER_KEY_SECRET, b"master", &[]).await.unwrap();

    storage.set_default_key("new").await.unwrap();

    assert_let!(
        Err(SecretStorageError::SecretNotEncryptedWithKey { key_id, .. }) =
            storage.check_should_be_able_to_access_secrets(&[MASTER_KEY_SECRET], None)
    );
    assert_eq!(key_id, "new");

    let plaintext =
        storage.get_secret(MASTER_KEY_SECRET, Some("old"), &old.key_spec).await.unwrap();
    assert_eq!(plaintext.as_slice(), b"master");

    // Re-encrypt the secret for both keys.
    storage.store_secret(MASTER_KEY_SECRET, &plaintext, &["old", "new"]).await.unwrap();

    let keys: Vec<_> = storage
        .get_algorithms_for_secret(MASTER_KEY_SECRET)
        .unwrap()
        .into_iter()
        .map(|key| key.unwrap().id)
        .collect();
    assert_eq!(keys, ["new", "old"]);

    let plaintext = storage.get_secret(MASTER_KEY_SECRET, None, &new.key_spec).await.unwrap();
    assert_eq!(plaintext.as_slice(), b"master");
}

#[tokio::test]
async fn wrong_recovery_key_is_rejected() {
    let storage = SharedSecretStorage::with_settings(MemoryStore::new(), settings());

    let info = storage.generate_key("ssss", "Key", None).await.unwrap();
    storage.store_secret(MASTER_KEY_SECRET, b"master", &["ssss"]).await.unwrap();

    let mut typo = info.recovery_key.clone();
    let replacement = if typo.ends_with('a') { "b" } else { "a" };
    typo.replace_range(typo.len() - 1.., replacement);

    // A typo almost always breaks the parity byte, if it doesn't the key won't
    // match.
    if let Ok(key_spec) = KeySpec::from_recovery_key(&typo) {
        assert!(!storage.get_key("ssss").unwrap().matches_key_spec(&key_spec));
    }

    let other = SharedSecretStorage::with_settings(MemoryStore::new(), settings())
        .generate_key("other", "Other key", None)
        .await
        .unwrap();
    let other_key_spec = KeySpec::from_recovery_key(&other.recovery_key).unwrap();

    assert_matches!(
        storage.get_secret(MASTER_KEY_SECRET, Some("ssss"), &other_key_spec).await,
        Err(SecretStorageError::Decryption(DecryptionError::Mac(_)))
    );

    let short_key = KeySpec::from_bytes(&[1; 16]);
    assert_matches!(
        storage.get_secret(MASTER_KEY_SECRET, Some("ssss"), &short_key).await,
        Err(SecretStorageError::BadKeyFormat)
    );
}
