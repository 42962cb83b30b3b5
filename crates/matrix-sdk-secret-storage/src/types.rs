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

//! Types describing storage keys and encrypted secrets, as they are stored in
//! account data.

use std::{collections::BTreeMap, fmt};

use ruma::CanonicalJsonValue;
use serde::{Deserialize, Serialize};
use vodozemac::Curve25519PublicKey;
use zeroize::Zeroizing;

use crate::{
    error::{KeyDerivationError, Result, SecretStorageError},
    key_derivation::{derive_private_key, ProgressListener, StoragePrivateKey},
    recovery_key::{decode_recovery_key, DecodeError},
    utilities::decode,
};

/// The account data event type of the default key pointer.
pub const DEFAULT_KEY_EVENT_TYPE: &str = "m.secret_storage.default_key";

/// The prefix of the account data event type of a storage key, the key ID is
/// appended to it.
pub const KEY_EVENT_TYPE_PREFIX: &str = "m.secret_storage.key.";

/// The identifier of the `m.secret_storage.v1.curve25519-aes-sha2` algorithm.
pub const CURVE25519_AES_SHA2: &str = "m.secret_storage.v1.curve25519-aes-sha2";

/// Name of the secret holding the private cross-signing master key.
pub const MASTER_KEY_SECRET: &str = "m.cross_signing.master";

/// Name of the secret holding the private cross-signing self-signing key.
pub const SELF_SIGNING_KEY_SECRET: &str = "m.cross_signing.self_signing";

/// Name of the secret holding the private cross-signing user-signing key.
pub const USER_SIGNING_KEY_SECRET: &str = "m.cross_signing.user_signing";

/// Name of the secret holding the recovery key of the server-side key backup.
pub const BACKUP_KEY_SECRET: &str = "m.megolm_backup.v1";

/// The account data event type under which the storage key with the given ID
/// is stored.
pub fn key_event_type(key_id: &str) -> String {
    format!("{KEY_EVENT_TYPE_PREFIX}{key_id}")
}

/// Signatures over a JSON object, mapping the signing entity to a map of key
/// ID to signature.
pub type Signatures = BTreeMap<String, BTreeMap<String, String>>;

/// The algorithm a storage key uses to encrypt secrets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SecretStorageAlgorithm {
    /// The `m.secret_storage.v1.curve25519-aes-sha2` algorithm.
    Curve25519AesSha2,
    /// An algorithm this crate doesn't support.
    Unknown(String),
}

impl SecretStorageAlgorithm {
    /// The string representation of the algorithm.
    pub fn as_str(&self) -> &str {
        match self {
            SecretStorageAlgorithm::Curve25519AesSha2 => CURVE25519_AES_SHA2,
            SecretStorageAlgorithm::Unknown(algorithm) => algorithm,
        }
    }
}

impl From<String> for SecretStorageAlgorithm {
    fn from(value: String) -> Self {
        if value == CURVE25519_AES_SHA2 {
            Self::Curve25519AesSha2
        } else {
            Self::Unknown(value)
        }
    }
}

impl From<SecretStorageAlgorithm> for String {
    fn from(value: SecretStorageAlgorithm) -> Self {
        match value {
            SecretStorageAlgorithm::Curve25519AesSha2 => CURVE25519_AES_SHA2.to_owned(),
            SecretStorageAlgorithm::Unknown(algorithm) => algorithm,
        }
    }
}

impl fmt::Display for SecretStorageAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters describing how a storage key was derived from a passphrase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassphraseInfo {
    /// The KDF, only `m.pbkdf2` is supported.
    pub algorithm: String,
    /// The salt used in the key derivation.
    pub salt: String,
    /// The number of PBKDF2 rounds.
    pub iterations: u32,
}

/// The content of a `m.secret_storage.key.<key_id>` account data event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageKeyContent {
    /// A human readable name for the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The encryption algorithm of the key.
    pub algorithm: SecretStorageAlgorithm,

    /// Set if the key was derived from a passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<PassphraseInfo>,

    /// The unpadded base64 encoded Curve25519 public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,

    /// Signatures over the canonical form of the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Signatures>,
}

impl StorageKeyContent {
    /// The canonical JSON form of the content without the signatures, this is
    /// what a signer signs.
    pub fn canonical_signable(&self) -> String {
        let mut json =
            serde_json::to_value(self).expect("We should be able to serialize the key content");

        if let Some(object) = json.as_object_mut() {
            let _ = object.remove("signatures");
        }

        let canonical_json: CanonicalJsonValue =
            json.try_into().expect("Can't canonicalize the json value");

        canonical_json.to_string()
    }
}

/// A storage key, as resolved from account data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyInfo {
    /// The ID of the key.
    pub id: String,
    /// The metadata of the key.
    pub content: StorageKeyContent,
}

impl KeyInfo {
    /// Whether the key was derived from a passphrase.
    pub fn has_passphrase(&self) -> bool {
        self.content.passphrase.is_some()
    }

    /// The public part of the key, used to encrypt secrets for it.
    ///
    /// Fails with [`SecretStorageError::UnsupportedAlgorithm`] if the key
    /// doesn't use a supported algorithm and with
    /// [`SecretStorageError::UnknownAlgorithm`] if the public key is missing or
    /// malformed.
    pub fn public_key(&self) -> Result<Curve25519PublicKey> {
        self.check_algorithm()?;

        self.content
            .pubkey
            .as_deref()
            .and_then(|key| decode(key).ok())
            .and_then(|key| Curve25519PublicKey::from_slice(&key).ok())
            .ok_or_else(|| SecretStorageError::UnknownAlgorithm(self.id.clone()))
    }

    /// Check that the key spec has the right shape for this key and turn it
    /// into a private key.
    pub(crate) fn private_key(&self, key_spec: &KeySpec) -> Result<StoragePrivateKey> {
        self.check_algorithm()?;

        key_spec.to_private_key().ok_or(SecretStorageError::BadKeyFormat)
    }

    /// Does the given key spec open this key?
    ///
    /// This compares the public key derived from the key spec with the one
    /// stored in the key metadata.
    pub fn matches_key_spec(&self, key_spec: &KeySpec) -> bool {
        match (self.public_key(), self.private_key(key_spec)) {
            (Ok(public_key), Ok(private_key)) => private_key.public_key() == public_key,
            _ => false,
        }
    }

    fn check_algorithm(&self) -> Result<()> {
        match &self.content.algorithm {
            SecretStorageAlgorithm::Curve25519AesSha2 => Ok(()),
            SecretStorageAlgorithm::Unknown(algorithm) => {
                Err(SecretStorageError::UnsupportedAlgorithm(algorithm.clone()))
            }
        }
    }
}

/// The private key material that opens a storage key.
///
/// A key spec is obtained from a recovery key, from a passphrase or directly
/// from the private key. The shape of the key material is only checked once it
/// is used with a storage key.
#[derive(Clone)]
pub struct KeySpec(Zeroizing<Vec<u8>>);

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeySpec").finish_non_exhaustive()
    }
}

impl KeySpec {
    /// Create a key spec from a recovery key, as produced when the storage key
    /// was created.
    pub fn from_recovery_key(recovery_key: &str) -> Result<Self, DecodeError> {
        Ok(Self::from_private_key(&decode_recovery_key(recovery_key)?))
    }

    /// Create a key spec by expanding a passphrase.
    ///
    /// The salt and number of iterations need to be the ones stored in the
    /// [`PassphraseInfo`] of the storage key.
    pub fn from_passphrase(
        passphrase: &str,
        salt: &str,
        iterations: u32,
        progress: Option<&dyn ProgressListener>,
    ) -> Result<Self, KeyDerivationError> {
        let private_key = derive_private_key(passphrase, salt, iterations, progress)?;
        Ok(Self::from_private_key(&private_key))
    }

    /// Create a key spec from the private part of a storage key.
    pub fn from_private_key(private_key: &StoragePrivateKey) -> Self {
        Self(Zeroizing::new(private_key.as_bytes().to_vec()))
    }

    /// Create a key spec from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }

    /// The raw key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn to_private_key(&self) -> Option<StoragePrivateKey> {
        StoragePrivateKey::from_slice(&self.0)
    }
}

/// The result of a storage key creation.
#[derive(Clone)]
pub struct StorageKeyCreationInfo {
    /// The ID of the new key.
    pub key_id: String,
    /// The metadata of the key, as it was stored in account data.
    pub content: StorageKeyContent,
    /// The private key encoded as a recovery key, the caller is responsible to
    /// present it to the user.
    pub recovery_key: String,
    /// The private key material, ready to be used to open the key.
    pub key_spec: KeySpec,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for StorageKeyCreationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageKeyCreationInfo")
            .field("key_id", &self.key_id)
            .field("content", &self.content)
            .finish_non_exhaustive()
    }
}

/// A secret encrypted for a single storage key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecretContent {
    /// The unpadded base64 encoded ciphertext.
    pub ciphertext: String,
    /// The unpadded base64 encoded ephemeral Curve25519 public key.
    #[serde(alias = "ephemeral_key")]
    pub ephemeral: String,
    /// The unpadded base64 encoded, truncated, MAC of the ciphertext.
    pub mac: String,
}

/// The content of a secret account data event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SecretEventContent {
    pub encrypted: BTreeMap<String, EncryptedSecretContent>,
}

/// The content of the `m.secret_storage.default_key` account data event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DefaultKeyContent {
    pub key: String,
}

/// The result of a successful integrity check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntegrityInfo {
    /// Whether the checked key was derived from a passphrase, in which case
    /// the user can be asked for the passphrase instead of the recovery key.
    pub has_passphrase: bool,
}
