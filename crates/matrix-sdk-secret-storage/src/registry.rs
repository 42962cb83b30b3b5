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

use std::sync::Arc;

use tokio::task::spawn_blocking;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::{
    account_data::{AccountDataError, AccountDataStore, IntoAccountDataStore},
    config::{KeyOverwritePolicy, SecretStorageSettings},
    error::{Result, SecretStorageError},
    key_derivation::{
        derive_keypair_from_passphrase, generate_random_keypair, generate_salt,
        ProgressListener, StorageKeyPair, PBKDF2_ALGORITHM,
    },
    signer::KeySigner,
    types::{
        key_event_type, DefaultKeyContent, KeyInfo, KeySpec, PassphraseInfo,
        SecretStorageAlgorithm, StorageKeyContent, StorageKeyCreationInfo,
        DEFAULT_KEY_EVENT_TYPE,
    },
};

/// Creates, persists and resolves storage keys, including the default key
/// pointer.
///
/// The private parts of the created keys are never persisted, they are handed
/// back to the caller in the [`StorageKeyCreationInfo`].
#[derive(Clone, Debug)]
pub struct KeyRegistry {
    store: Arc<dyn AccountDataStore>,
    settings: Arc<SecretStorageSettings>,
}

impl KeyRegistry {
    /// Create a new `KeyRegistry` on top of the given account data store.
    pub fn new(store: impl IntoAccountDataStore, settings: SecretStorageSettings) -> Self {
        Self { store: store.into_account_data_store(), settings: settings.into() }
    }

    /// The settings this registry creates keys with.
    pub fn settings(&self) -> &SecretStorageSettings {
        &self.settings
    }

    pub(crate) fn store(&self) -> &Arc<dyn AccountDataStore> {
        &self.store
    }

    /// Generate a new random storage key and persist its metadata.
    ///
    /// # Arguments
    ///
    /// * `key_id` - The ID of the new key.
    ///
    /// * `name` - A human readable name for the key.
    ///
    /// * `signer` - An optional signer for the key metadata, a signer that
    /// declines to sign leaves the key unsigned.
    #[instrument(skip(self, name, signer))]
    pub async fn generate_key(
        &self,
        key_id: &str,
        name: &str,
        signer: Option<&dyn KeySigner>,
    ) -> Result<StorageKeyCreationInfo> {
        self.ensure_key_id_is_available(key_id)?;

        let keypair = spawn_blocking(generate_random_keypair).await?;

        self.persist_key(key_id, name, keypair, None, signer).await
    }

    /// Generate a new storage key from a passphrase and persist its metadata.
    ///
    /// A fresh random salt is generated, the salt and the number of iterations
    /// are stored with the key so the key can later be re-derived from the
    /// passphrase.
    ///
    /// The key derivation runs on a blocking worker thread, the optional
    /// `progress` listener gets notified from that thread.
    #[instrument(skip(self, name, passphrase, signer, progress))]
    pub async fn generate_key_with_passphrase(
        &self,
        key_id: &str,
        name: &str,
        passphrase: &str,
        signer: Option<&dyn KeySigner>,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> Result<StorageKeyCreationInfo> {
        self.ensure_key_id_is_available(key_id)?;

        let passphrase_info = PassphraseInfo {
            algorithm: PBKDF2_ALGORITHM.to_owned(),
            salt: generate_salt(self.settings.passphrase_salt_length),
            iterations: self.settings.passphrase_iterations,
        };

        let passphrase = Zeroizing::new(passphrase.to_owned());
        let salt = passphrase_info.salt.clone();
        let iterations = passphrase_info.iterations;

        let keypair = spawn_blocking(move || {
            derive_keypair_from_passphrase(&passphrase, &salt, iterations, progress.as_deref())
        })
        .await??;

        self.persist_key(key_id, name, keypair, Some(passphrase_info), signer).await
    }

    async fn persist_key(
        &self,
        key_id: &str,
        name: &str,
        keypair: StorageKeyPair,
        passphrase: Option<PassphraseInfo>,
        signer: Option<&dyn KeySigner>,
    ) -> Result<StorageKeyCreationInfo> {
        let mut content = StorageKeyContent {
            name: Some(name.to_owned()),
            algorithm: SecretStorageAlgorithm::Curve25519AesSha2,
            passphrase,
            pubkey: Some(keypair.public_key.to_base64()),
            signatures: None,
        };

        if let Some(signer) = signer {
            content.signatures = signer.sign(&content.canonical_signable());

            if content.signatures.is_none() {
                debug!("The signer declined to sign the secret storage key");
            }
        }

        let json = serde_json::to_value(&content).map_err(AccountDataError::from)?;

        // Another creation of the same key ID might have finished while the key
        // was being generated. Nothing is awaited between this check and the
        // write, ordering concurrent writers is up to the account data store.
        self.ensure_key_id_is_available(key_id)?;
        self.store.set_account_data(&key_event_type(key_id), json).await?;

        info!(public_key = %keypair.public_key.to_base64(), "Created a new secret storage key");

        Ok(StorageKeyCreationInfo {
            key_id: key_id.to_owned(),
            content,
            recovery_key: keypair.private_key.to_recovery_key(),
            key_spec: KeySpec::from_private_key(&keypair.private_key),
        })
    }

    fn ensure_key_id_is_available(&self, key_id: &str) -> Result<()> {
        match self.settings.key_overwrite {
            KeyOverwritePolicy::Overwrite => Ok(()),
            KeyOverwritePolicy::Reject => {
                if self.has_key(key_id)? {
                    warn!("Refusing to overwrite an existing secret storage key");
                    Err(SecretStorageError::KeyAlreadyExists(key_id.to_owned()))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Is there a storage key with the given ID?
    pub fn has_key(&self, key_id: &str) -> Result<bool> {
        Ok(self.store.get_account_data(&key_event_type(key_id))?.is_some())
    }

    /// Get the storage key with the given ID.
    ///
    /// Fails with [`SecretStorageError::UnknownKey`] if there is no such key
    /// and with [`SecretStorageError::UnknownAlgorithm`] if the key metadata
    /// can't be parsed.
    pub fn get_key(&self, key_id: &str) -> Result<KeyInfo> {
        let json = self
            .store
            .get_account_data(&key_event_type(key_id))?
            .ok_or_else(|| SecretStorageError::UnknownKey(key_id.to_owned()))?;

        let content: StorageKeyContent = serde_json::from_value(json).map_err(|e| {
            debug!(key_id, error = ?e, "The secret storage key metadata is malformed");
            SecretStorageError::UnknownAlgorithm(key_id.to_owned())
        })?;

        Ok(KeyInfo { id: key_id.to_owned(), content })
    }

    /// Point the default key at the storage key with the given ID.
    ///
    /// The key needs to exist, otherwise [`SecretStorageError::UnknownKey`] is
    /// returned and the default key stays unchanged.
    #[instrument(skip(self))]
    pub async fn set_default_key(&self, key_id: &str) -> Result<()> {
        match self.get_key(key_id) {
            Ok(_) => {}
            Err(e @ SecretStorageError::Store(_)) => return Err(e),
            Err(_) => return Err(SecretStorageError::UnknownKey(key_id.to_owned())),
        }

        let content = DefaultKeyContent { key: key_id.to_owned() };
        let json = serde_json::to_value(content).map_err(AccountDataError::from)?;

        self.store.set_account_data(DEFAULT_KEY_EVENT_TYPE, json).await?;

        info!("Changed the default secret storage key");

        Ok(())
    }

    /// Resolve the default key pointer.
    ///
    /// Fails with [`SecretStorageError::UnknownKey`] if there is no default key
    /// or if it points to a key that doesn't exist.
    pub fn get_default_key(&self) -> Result<KeyInfo> {
        let key_id = self
            .store
            .get_account_data(DEFAULT_KEY_EVENT_TYPE)?
            .and_then(|json| serde_json::from_value::<DefaultKeyContent>(json).ok())
            .map(|content| content.key)
            .ok_or_else(|| SecretStorageError::UnknownKey(DEFAULT_KEY_EVENT_TYPE.to_owned()))?;

        self.get_key(&key_id)
    }

    /// Is secret storage set up, i.e. is there a default key that resolves?
    pub fn is_enabled(&self) -> Result<bool> {
        match self.get_default_key() {
            Ok(_) => Ok(true),
            Err(e @ SecretStorageError::Store(_)) => Err(e),
            Err(_) => Ok(false),
        }
    }

    /// Resolve an explicitly requested key, or the default key if no key ID
    /// was given.
    pub(crate) fn resolve_key(&self, key_id: Option<&str>) -> Result<KeyInfo> {
        match key_id {
            Some(key_id) => self.get_key(key_id),
            None => self.get_default_key(),
        }
    }
}
