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

use hmac::digest::MacError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::task::JoinError;

use crate::{account_data::AccountDataError, recovery_key::DecodeError};

/// Convenience type alias for the secret-storage specific results.
pub type Result<T, E = SecretStorageError> = std::result::Result<T, E>;

/// Error type for the secret-storage subsystem.
#[derive(Debug, Error)]
pub enum SecretStorageError {
    /// No storage key with the given ID exists, or the default key pointer is
    /// missing or dangling.
    #[error("the secret storage key {0} is unknown")]
    UnknownKey(String),

    /// The storage key metadata exists but doesn't follow any known schema.
    #[error("the secret storage key {0} uses an unknown algorithm or is malformed")]
    UnknownAlgorithm(String),

    /// No secret with the given name exists.
    #[error("the secret {0} is unknown")]
    UnknownSecret(String),

    /// The name of the secret is reserved for the storage key metadata or the
    /// default key pointer.
    #[error("the name {0} is reserved for secret storage keys and can't hold a secret")]
    ReservedSecretName(String),

    /// The secret exists but has no `encrypted` map.
    #[error("the secret {0} is not encrypted")]
    SecretNotEncrypted(String),

    /// The secret isn't encrypted for the requested storage key.
    #[error("the secret {secret} is not encrypted with the key {key_id}")]
    SecretNotEncryptedWithKey {
        /// The name of the secret.
        secret: String,
        /// The ID of the storage key that was requested.
        key_id: String,
    },

    /// The storage key uses an algorithm we can't encrypt or decrypt with.
    #[error("the secret storage algorithm {0} is not supported")]
    UnsupportedAlgorithm(String),

    /// The key spec doesn't have the right shape for the algorithm of the
    /// storage key.
    #[error("the provided key spec has the wrong format for the storage key")]
    BadKeyFormat,

    /// The encrypted content of a secret couldn't be parsed.
    #[error("the encrypted secret content couldn't be parsed: {0}")]
    ParsingError(#[source] SerdeError),

    /// The secret couldn't be decrypted.
    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    /// A storage key with the given ID already exists and overwriting keys is
    /// not allowed.
    #[error("a secret storage key with the ID {0} already exists")]
    KeyAlreadyExists(String),

    /// The passphrase couldn't be expanded into a storage key.
    #[error(transparent)]
    KeyDerivation(#[from] KeyDerivationError),

    /// The recovery key couldn't be decoded.
    #[error(transparent)]
    RecoveryKey(#[from] DecodeError),

    /// The account data store returned an error.
    #[error("failed to read or write to the account data store: {0}")]
    Store(#[from] AccountDataError),

    /// A cryptographic operation that was offloaded to a worker thread didn't
    /// finish.
    #[error("the background task of a secret storage operation failed: {0}")]
    BackgroundTask(#[from] JoinError),
}

/// Error type describing decryption failures of the secret-storage system.
///
/// A decryption failure never returns any plaintext.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// The authentication tag didn't match, the secret was either tampered
    /// with or the wrong private key was used.
    #[error("could not decrypt the secret using the secret storage key, invalid MAC")]
    Mac(#[from] MacError),

    /// The decrypted plaintext didn't have valid padding.
    #[error("could not decrypt the secret, the plaintext has invalid padding")]
    Padding,

    /// One of the base64 encoded fields couldn't be decoded.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    /// The ephemeral public key of the encrypted secret is invalid.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),
}

/// Error type for the expansion of a passphrase into a storage key.
#[derive(Debug, Error)]
pub enum KeyDerivationError {
    /// PBKDF2 requires at least one iteration.
    #[error("the number of PBKDF2 iterations needs to be positive")]
    InvalidIterations,

    /// The passphrase info names a KDF algorithm we don't support.
    #[error("the key derivation algorithm {0} is not supported")]
    UnsupportedAlgorithm(String),
}
