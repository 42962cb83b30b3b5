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

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tokio::task::spawn_blocking;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::{
    account_data::AccountDataError,
    ciphers::{decrypt_secret, encrypt_secret},
    error::{DecryptionError, Result, SecretStorageError},
    registry::KeyRegistry,
    types::{
        EncryptedSecretContent, KeyInfo, KeySpec, SecretEventContent, DEFAULT_KEY_EVENT_TYPE,
        KEY_EVENT_TYPE_PREFIX,
    },
};

/// Encrypts secrets for storage keys and decrypts them again.
#[derive(Clone, Debug)]
pub struct SecretStore {
    registry: KeyRegistry,
}

impl SecretStore {
    /// Create a new `SecretStore` resolving keys using the given registry.
    pub fn new(registry: KeyRegistry) -> Self {
        Self { registry }
    }

    /// The registry used to resolve storage keys.
    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    /// Encrypt a secret and store it in account data.
    ///
    /// The secret is encrypted for every key in `key_ids`, or for the default
    /// key if `key_ids` is empty. Any existing content of the secret is
    /// replaced.
    ///
    /// Either all keys are resolved and the secret is encrypted for all of
    /// them, or nothing is written.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the secret, this is the account data event type
    /// under which the secret is stored.
    ///
    /// * `secret` - The plaintext of the secret.
    ///
    /// * `key_ids` - The IDs of the storage keys that should be able to
    /// decrypt the secret.
    #[instrument(skip(self, secret))]
    pub async fn store_secret(&self, name: &str, secret: &[u8], key_ids: &[&str]) -> Result<()> {
        if is_reserved_name(name) {
            return Err(SecretStorageError::ReservedSecretName(name.to_owned()));
        }

        let keys = if key_ids.is_empty() {
            vec![self.registry.get_default_key()?]
        } else {
            key_ids
                .iter()
                .map(|key_id| self.registry.get_key(key_id))
                .collect::<Result<Vec<_>>>()?
        };

        let recipients = keys
            .iter()
            .map(|key| Ok((key.id.clone(), key.public_key()?)))
            .collect::<Result<Vec<_>>>()?;

        let secret = Zeroizing::new(secret.to_vec());

        let encrypted = spawn_blocking(move || {
            recipients
                .into_iter()
                .map(|(key_id, public_key)| (key_id, encrypt_secret(&secret, &public_key)))
                .collect::<BTreeMap<_, _>>()
        })
        .await?;

        let json = serde_json::to_value(SecretEventContent { encrypted })
            .map_err(AccountDataError::from)?;

        self.registry.store().set_account_data(name, json).await?;

        info!(key_count = keys.len(), "Stored a secret in secret storage");

        Ok(())
    }

    /// Decrypt a secret.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the secret.
    ///
    /// * `key_id` - The ID of the storage key to use, the default key is used
    /// if this is `None`.
    ///
    /// * `key_spec` - The private key material of the storage key.
    #[instrument(skip(self, key_spec))]
    pub async fn get_secret(
        &self,
        name: &str,
        key_id: Option<&str>,
        key_spec: &KeySpec,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let json = self.get_secret_content(name)?;
        let encrypted = encrypted_map(name, &json)?;

        let key = self.registry.resolve_key(key_id)?;

        let content = encrypted.get(key.id.as_str()).cloned().ok_or_else(|| {
            SecretStorageError::SecretNotEncryptedWithKey {
                secret: name.to_owned(),
                key_id: key.id.clone(),
            }
        })?;

        let content: EncryptedSecretContent =
            serde_json::from_value(content).map_err(SecretStorageError::ParsingError)?;

        let private_key = key.private_key(key_spec)?;

        debug!(key_id = %key.id, "Decrypting a secret");

        let plaintext = spawn_blocking(move || decrypt_secret(&content, &private_key))
            .await?
            .inspect_err(|e| {
                if let DecryptionError::Mac(_) = e {
                    warn!("The MAC of the secret didn't match, wrong key or tampered content");
                }
            })?;

        Ok(plaintext)
    }

    /// Get the storage keys a secret is encrypted for.
    ///
    /// For every key ID present in the secret, ordered by key ID, either the
    /// resolved key or the error that occurred while resolving it is returned.
    pub fn get_algorithms_for_secret(&self, name: &str) -> Result<Vec<Result<KeyInfo>>> {
        let json = self.get_secret_content(name)?;
        let encrypted = encrypted_map(name, &json)?;

        let mut key_ids: Vec<&String> = encrypted.keys().collect();
        key_ids.sort();

        Ok(key_ids.into_iter().map(|key_id| self.registry.get_key(key_id)).collect())
    }

    pub(crate) fn get_secret_content(&self, name: &str) -> Result<Value> {
        self.registry
            .store()
            .get_account_data(name)?
            .ok_or_else(|| SecretStorageError::UnknownSecret(name.to_owned()))
    }
}

/// Is the account data event type used by the storage keys themselves?
fn is_reserved_name(name: &str) -> bool {
    name == DEFAULT_KEY_EVENT_TYPE || name.starts_with(KEY_EVENT_TYPE_PREFIX)
}

/// Get the `encrypted` map of a secret.
pub(crate) fn encrypted_map<'a>(name: &str, json: &'a Value) -> Result<&'a Map<String, Value>> {
    json.get("encrypted")
        .and_then(Value::as_object)
        .ok_or_else(|| SecretStorageError::SecretNotEncrypted(name.to_owned()))
}

#[cfg(test)]
mod tests {
    use assert_matches2::{assert_let, assert_matches};
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        account_data::{AccountDataStore, MemoryStore},
        config::SecretStorageSettings,
        utilities::{decode, encode},
    };

    const SECRET: &[u8] = b"It's a secret to everybody";

    fn secret_store() -> SecretStore {
        let settings =
            SecretStorageSettings { passphrase_iterations: 10, ..Default::default() };

        SecretStore::new(KeyRegistry::new(MemoryStore::new(), settings))
    }

    #[tokio::test]
    async fn store_and_get_secret() {
        let store = secret_store();
        let info = store.registry().generate_key("key", "Key", None).await.unwrap();

        store.store_secret("m.cross_signing.master", SECRET, &["key"]).await.unwrap();

        let secret =
            store.get_secret("m.cross_signing.master", Some("key"), &info.key_spec).await.unwrap();
        assert_eq!(secret.as_slice(), SECRET);

        let json = store.get_secret_content("m.cross_signing.master").unwrap();
        assert_let!(Some(encrypted) = json["encrypted"]["key"].as_object());
        assert!(encrypted.contains_key("ciphertext"));
        assert!(encrypted.contains_key("ephemeral"));
        assert!(encrypted.contains_key("mac"));
    }

    #[tokio::test]
    async fn passphrase_keys() {
        let store = secret_store();
        let registry = store.registry();

        registry
            .generate_key_with_passphrase("key", "Key", "my passphrase", None, None)
            .await
            .unwrap();

        store.store_secret("secret", SECRET, &["key"]).await.unwrap();

        let key = registry.get_key("key").unwrap();
        assert_let!(Some(passphrase) = key.content.passphrase);

        let key_spec = KeySpec::from_passphrase(
            "my passphrase",
            &passphrase.salt,
            passphrase.iterations,
            None,
        )
        .unwrap();

        let secret = store.get_secret("secret", Some("key"), &key_spec).await.unwrap();
        assert_eq!(secret.as_slice(), SECRET);
    }

    #[tokio::test]
    async fn multiple_recipients() {
        let store = secret_store();
        let registry = store.registry();

        let first = registry.generate_key("first", "First", None).await.unwrap();
        let second = registry.generate_key("second", "Second", None).await.unwrap();
        let third = registry.generate_key("third", "Third", None).await.unwrap();

        store.store_secret("secret", SECRET, &["second", "first"]).await.unwrap();

        let keys: Vec<_> = store
            .get_algorithms_for_secret("secret")
            .unwrap()
            .into_iter()
            .map(|key| key.unwrap().id)
            .collect();
        assert_eq!(keys, ["first", "second"]);

        for (key_id, info) in [("first", &first), ("second", &second)] {
            let secret = store.get_secret("secret", Some(key_id), &info.key_spec).await.unwrap();
            assert_eq!(secret.as_slice(), SECRET);
        }

        assert_let!(
            Err(SecretStorageError::SecretNotEncryptedWithKey { secret, key_id }) =
                store.get_secret("secret", Some("third"), &third.key_spec).await
        );
        assert_eq!(secret, "secret");
        assert_eq!(key_id, "third");
    }

    #[tokio::test]
    async fn default_key_is_used_when_no_key_is_given() {
        let store = secret_store();
        let registry = store.registry();

        let first = registry.generate_key("first", "First", None).await.unwrap();
        let second = registry.generate_key("second", "Second", None).await.unwrap();

        assert_matches!(
            store.store_secret("secret", SECRET, &[]).await,
            Err(SecretStorageError::UnknownKey(_))
        );

        registry.set_default_key("first").await.unwrap();
        store.store_secret("secret", SECRET, &[]).await.unwrap();

        registry.set_default_key("second").await.unwrap();

        let secret = store.get_secret("secret", Some("first"), &first.key_spec).await.unwrap();
        assert_eq!(secret.as_slice(), SECRET);

        assert_matches!(
            store.get_secret("secret", None, &second.key_spec).await,
            Err(SecretStorageError::SecretNotEncryptedWithKey { .. })
        );
    }

    #[tokio::test]
    async fn store_secret_is_all_or_nothing() {
        let store = secret_store();
        let registry = store.registry();

        registry.generate_key("key", "Key", None).await.unwrap();
        registry
            .store()
            .set_account_data(
                "m.secret_storage.key.aes",
                json!({ "algorithm": "m.secret_storage.v1.aes-hmac-sha2" }),
            )
            .await
            .unwrap();

        assert_matches!(
            store.store_secret("secret", SECRET, &["key", "missing"]).await,
            Err(SecretStorageError::UnknownKey(_))
        );
        assert_matches!(
            store.store_secret("secret", SECRET, &["key", "aes"]).await,
            Err(SecretStorageError::UnsupportedAlgorithm(_))
        );

        assert!(registry.store().get_account_data("secret").unwrap().is_none());
    }

    #[tokio::test]
    async fn key_metadata_names_are_reserved() {
        let store = secret_store();
        let registry = store.registry();

        registry.generate_key("key", "Key", None).await.unwrap();
        registry.set_default_key("key").await.unwrap();

        let default_key = registry.store().get_account_data(DEFAULT_KEY_EVENT_TYPE).unwrap();
        let key = registry.get_key("key").unwrap();

        let names = [DEFAULT_KEY_EVENT_TYPE, "m.secret_storage.key.key", "m.secret_storage.key.new"];

        for name in names {
            assert_let!(
                Err(SecretStorageError::ReservedSecretName(reserved)) =
                    store.store_secret(name, SECRET, &["key"]).await
            );
            assert_eq!(reserved, name);
        }

        assert_eq!(
            registry.store().get_account_data(DEFAULT_KEY_EVENT_TYPE).unwrap(),
            default_key
        );
        assert_eq!(registry.get_default_key().unwrap(), key);
        assert!(!registry.has_key("new").unwrap());
    }

    #[tokio::test]
    async fn missing_and_unencrypted_secrets() {
        let store = secret_store();
        let info = store.registry().generate_key("key", "Key", None).await.unwrap();

        assert_let!(
            Err(SecretStorageError::UnknownSecret(name)) =
                store.get_secret("never-stored", Some("key"), &info.key_spec).await
        );
        assert_eq!(name, "never-stored");

        store.registry().store().set_account_data("plain", json!({ "foo": "bar" })).await.unwrap();

        assert_matches!(
            store.get_secret("plain", Some("key"), &info.key_spec).await,
            Err(SecretStorageError::SecretNotEncrypted(_))
        );
        assert_matches!(
            store.get_algorithms_for_secret("plain"),
            Err(SecretStorageError::SecretNotEncrypted(_))
        );
        assert_matches!(
            store.get_algorithms_for_secret("never-stored"),
            Err(SecretStorageError::UnknownSecret(_))
        );
    }

    #[tokio::test]
    async fn malformed_secret_and_key_spec() {
        let store = secret_store();
        let info = store.registry().generate_key("key", "Key", None).await.unwrap();

        store
            .registry()
            .store()
            .set_account_data("secret", json!({ "encrypted": { "key": { "ciphertext": 5 } } }))
            .await
            .unwrap();

        assert_matches!(
            store.get_secret("secret", Some("key"), &info.key_spec).await,
            Err(SecretStorageError::ParsingError(_))
        );

        store.store_secret("secret", SECRET, &["key"]).await.unwrap();

        assert_matches!(
            store.get_secret("secret", Some("key"), &KeySpec::from_bytes(b"short")).await,
            Err(SecretStorageError::BadKeyFormat)
        );
    }

    #[tokio::test]
    async fn unknown_explicit_key_does_not_fall_back_to_the_default() {
        let store = secret_store();
        let info = store.registry().generate_key("key", "Key", None).await.unwrap();
        store.registry().set_default_key("key").await.unwrap();

        store.store_secret("secret", SECRET, &[]).await.unwrap();

        assert_let!(
            Err(SecretStorageError::UnknownKey(key_id)) =
                store.get_secret("secret", Some("missing"), &info.key_spec).await
        );
        assert_eq!(key_id, "missing");
    }

    #[tokio::test]
    async fn tampering_is_detected() {
        let store = secret_store();
        let info = store.registry().generate_key("key", "Key", None).await.unwrap();
        store.store_secret("secret", SECRET, &["key"]).await.unwrap();

        let original = store.get_secret_content("secret").unwrap();

        for field in ["ciphertext", "mac"] {
            let mut json = original.clone();
            let mut bytes = decode(json["encrypted"]["key"][field].as_str().unwrap()).unwrap();
            bytes[0] ^= 0xff;
            json["encrypted"]["key"][field] = encode(bytes).into();

            store.registry().store().set_account_data("secret", json).await.unwrap();

            assert_matches!(
                store.get_secret("secret", Some("key"), &info.key_spec).await,
                Err(SecretStorageError::Decryption(DecryptionError::Mac(_)))
            );
        }
    }

    #[tokio::test]
    async fn keys_that_no_longer_resolve() {
        let store = secret_store();
        store.registry().generate_key("key", "Key", None).await.unwrap();

        store
            .registry()
            .store()
            .set_account_data(
                "secret",
                json!({
                    "encrypted": {
                        "key": { "ciphertext": "", "ephemeral": "", "mac": "" },
                        "deleted": { "ciphertext": "", "ephemeral": "", "mac": "" },
                    }
                }),
            )
            .await
            .unwrap();

        let keys = store.get_algorithms_for_secret("secret").unwrap();
        assert_eq!(keys.len(), 2);

        assert_let!(Err(SecretStorageError::UnknownKey(key_id)) = &keys[0]);
        assert_eq!(key_id, "deleted");
        assert_eq!(keys[1].as_ref().unwrap().id, "key");
    }

    #[derive(Debug, Default)]
    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("the store is read-only")]
    struct ReadOnlyError;

    #[async_trait]
    impl AccountDataStore for ReadOnlyStore {
        fn get_account_data(
            &self,
            event_type: &str,
        ) -> std::result::Result<Option<Value>, AccountDataError> {
            self.inner.get_account_data(event_type)
        }

        async fn set_account_data(
            &self,
            _: &str,
            _: Value,
        ) -> std::result::Result<(), AccountDataError> {
            Err(AccountDataError::backend(ReadOnlyError))
        }
    }

    #[tokio::test]
    async fn store_errors_are_propagated() {
        let store = SecretStore::new(KeyRegistry::new(
            ReadOnlyStore::default(),
            SecretStorageSettings::default(),
        ));

        assert_matches!(
            store.registry().generate_key("key", "Key", None).await,
            Err(SecretStorageError::Store(AccountDataError::Backend(_)))
        );
    }
}
