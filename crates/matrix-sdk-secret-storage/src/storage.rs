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
use tracing::instrument;
use zeroize::Zeroizing;

use crate::{
    account_data::IntoAccountDataStore,
    config::SecretStorageSettings,
    error::{KeyDerivationError, Result, SecretStorageError},
    integrity::IntegrityChecker,
    key_derivation::{ProgressListener, PBKDF2_ALGORITHM},
    registry::KeyRegistry,
    secret_store::SecretStore,
    signer::KeySigner,
    types::{IntegrityInfo, KeyInfo, KeySpec, StorageKeyCreationInfo},
};

/// Secret storage for a single account.
///
/// This bundles the [`KeyRegistry`], the [`SecretStore`] and the
/// [`IntegrityChecker`] on top of one account data store.
#[derive(Clone, Debug)]
pub struct SharedSecretStorage {
    registry: KeyRegistry,
    secrets: SecretStore,
    integrity: IntegrityChecker,
}

impl SharedSecretStorage {
    /// Create a new `SharedSecretStorage` using the default settings.
    pub fn new(store: impl IntoAccountDataStore) -> Self {
        Self::with_settings(store, SecretStorageSettings::default())
    }

    /// Create a new `SharedSecretStorage` using the given settings.
    pub fn with_settings(
        store: impl IntoAccountDataStore,
        settings: SecretStorageSettings,
    ) -> Self {
        let registry = KeyRegistry::new(store, settings);

        Self {
            secrets: SecretStore::new(registry.clone()),
            integrity: IntegrityChecker::new(registry.clone()),
            registry,
        }
    }

    /// The registry holding the storage keys.
    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    /// Generate a new random storage key, see [`KeyRegistry::generate_key`].
    pub async fn generate_key(
        &self,
        key_id: &str,
        name: &str,
        signer: Option<&dyn KeySigner>,
    ) -> Result<StorageKeyCreationInfo> {
        self.registry.generate_key(key_id, name, signer).await
    }

    /// Generate a new storage key from a passphrase, see
    /// [`KeyRegistry::generate_key_with_passphrase`].
    pub async fn generate_key_with_passphrase(
        &self,
        key_id: &str,
        name: &str,
        passphrase: &str,
        signer: Option<&dyn KeySigner>,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> Result<StorageKeyCreationInfo> {
        self.registry.generate_key_with_passphrase(key_id, name, passphrase, signer, progress).await
    }

    /// Is there a storage key with the given ID?
    pub fn has_key(&self, key_id: &str) -> Result<bool> {
        self.registry.has_key(key_id)
    }

    /// Get the storage key with the given ID.
    pub fn get_key(&self, key_id: &str) -> Result<KeyInfo> {
        self.registry.get_key(key_id)
    }

    /// Point the default key at the storage key with the given ID.
    pub async fn set_default_key(&self, key_id: &str) -> Result<()> {
        self.registry.set_default_key(key_id).await
    }

    /// Resolve the default key.
    pub fn get_default_key(&self) -> Result<KeyInfo> {
        self.registry.get_default_key()
    }

    /// Is secret storage set up for this account?
    pub fn is_enabled(&self) -> Result<bool> {
        self.registry.is_enabled()
    }

    /// Encrypt and store a secret, see [`SecretStore::store_secret`].
    pub async fn store_secret(&self, name: &str, secret: &[u8], key_ids: &[&str]) -> Result<()> {
        self.secrets.store_secret(name, secret, key_ids).await
    }

    /// Decrypt a secret, see [`SecretStore::get_secret`].
    pub async fn get_secret(
        &self,
        name: &str,
        key_id: Option<&str>,
        key_spec: &KeySpec,
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.secrets.get_secret(name, key_id, key_spec).await
    }

    /// Get the storage keys a secret is encrypted for, see
    /// [`SecretStore::get_algorithms_for_secret`].
    pub fn get_algorithms_for_secret(&self, name: &str) -> Result<Vec<Result<KeyInfo>>> {
        self.secrets.get_algorithms_for_secret(name)
    }

    /// Check that a storage key can unlock the given secrets, see
    /// [`IntegrityChecker::check_should_be_able_to_access_secrets`].
    pub fn check_should_be_able_to_access_secrets(
        &self,
        secret_names: &[&str],
        key_id: Option<&str>,
    ) -> Result<IntegrityInfo> {
        self.integrity.check_should_be_able_to_access_secrets(secret_names, key_id)
    }

    /// Re-derive the key spec of a passphrase based storage key.
    ///
    /// The salt and number of iterations are taken from the key metadata, the
    /// derivation runs on a blocking worker thread. Fails with
    /// [`SecretStorageError::BadKeyFormat`] if the key wasn't created from a
    /// passphrase.
    ///
    /// This doesn't check that the passphrase is correct, use
    /// [`KeyInfo::matches_key_spec`] for that.
    #[instrument(skip(self, passphrase, progress))]
    pub async fn key_spec_from_passphrase(
        &self,
        key_id: &str,
        passphrase: &str,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> Result<KeySpec> {
        let key = self.registry.get_key(key_id)?;
        let info = key.content.passphrase.ok_or(SecretStorageError::BadKeyFormat)?;

        if info.algorithm != PBKDF2_ALGORITHM {
            return Err(KeyDerivationError::UnsupportedAlgorithm(info.algorithm).into());
        }

        let passphrase = Zeroizing::new(passphrase.to_owned());

        let key_spec = spawn_blocking(move || {
            KeySpec::from_passphrase(&passphrase, &info.salt, info.iterations, progress.as_deref())
        })
        .await??;

        Ok(key_spec)
    }
}
