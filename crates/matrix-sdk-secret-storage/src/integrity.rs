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

use tracing::{debug, instrument};

use crate::{
    error::{Result, SecretStorageError},
    registry::KeyRegistry,
    types::{IntegrityInfo, DEFAULT_KEY_EVENT_TYPE},
};

/// Checks that a storage key can unlock a set of secrets before the key is
/// relied upon.
#[derive(Clone, Debug)]
pub struct IntegrityChecker {
    registry: KeyRegistry,
}

impl IntegrityChecker {
    /// Create a new `IntegrityChecker` resolving keys using the given
    /// registry.
    pub fn new(registry: KeyRegistry) -> Self {
        Self { registry }
    }

    /// Check that all the given secrets are encrypted for a storage key.
    ///
    /// No decryption is attempted, this only checks that the secrets exist
    /// and contain an entry for the key. The first secret that fails the
    /// check determines the error.
    ///
    /// On success the returned [`IntegrityInfo`] tells if the key was derived
    /// from a passphrase, so the caller knows whether to ask the user for the
    /// passphrase or for the recovery key.
    ///
    /// # Arguments
    ///
    /// * `secret_names` - The names of the secrets that need to be accessible,
    /// must not be empty.
    ///
    /// * `key_id` - The ID of the storage key, the default key is used if this
    /// is `None`.
    #[instrument(skip(self))]
    pub fn check_should_be_able_to_access_secrets(
        &self,
        secret_names: &[&str],
        key_id: Option<&str>,
    ) -> Result<IntegrityInfo> {
        if secret_names.is_empty() {
            return Err(SecretStorageError::UnknownSecret("none".to_owned()));
        }

        let key = match self.registry.resolve_key(key_id) {
            Ok(key) => key,
            Err(e @ SecretStorageError::Store(_)) => return Err(e),
            Err(_) => {
                let key_id = key_id.unwrap_or(DEFAULT_KEY_EVENT_TYPE);
                return Err(SecretStorageError::UnknownKey(key_id.to_owned()));
            }
        };

        // A key that can't encrypt or decrypt can't unlock anything either.
        key.public_key()?;

        for &name in secret_names {
            let json = self
                .registry
                .store()
                .get_account_data(name)?
                .ok_or_else(|| SecretStorageError::UnknownSecret(name.to_owned()))?;

            let encrypted_for_key = json
                .get("encrypted")
                .and_then(|encrypted| encrypted.get(key.id.as_str()))
                .is_some();

            if !encrypted_for_key {
                debug!(
                    secret_name = name,
                    key_id = %key.id,
                    "The secret isn't encrypted for the key"
                );

                return Err(SecretStorageError::SecretNotEncryptedWithKey {
                    secret: name.to_owned(),
                    key_id: key.id,
                });
            }
        }

        Ok(IntegrityInfo { has_passphrase: key.has_passphrase() })
    }
}
