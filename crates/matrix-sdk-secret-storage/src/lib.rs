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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub mod account_data;
mod ciphers;
mod config;
mod error;
mod integrity;
pub mod key_derivation;
pub mod recovery_key;
mod registry;
mod secret_store;
mod signer;
mod storage;
pub mod types;
mod utilities;

pub use account_data::{AccountDataError, AccountDataStore, IntoAccountDataStore, MemoryStore};
pub use ciphers::{decrypt_secret, encrypt_secret};
pub use config::{KeyOverwritePolicy, SecretStorageSettings};
pub use error::{DecryptionError, KeyDerivationError, Result, SecretStorageError};
pub use integrity::IntegrityChecker;
pub use key_derivation::{ProgressListener, StorageKeyPair, StoragePrivateKey};
pub use recovery_key::{decode_recovery_key, encode_recovery_key, DecodeError};
pub use registry::KeyRegistry;
pub use secret_store::SecretStore;
pub use signer::KeySigner;
pub use storage::SharedSecretStorage;
pub use types::{
    EncryptedSecretContent, IntegrityInfo, KeyInfo, KeySpec, PassphraseInfo,
    SecretStorageAlgorithm, Signatures, StorageKeyContent, StorageKeyCreationInfo,
};
#[doc(no_inline)]
pub use vodozemac;

/// The version of the matrix-sdk-secret-storage crate being used
pub static VERSION: &str = env!("CARGO_PKG_VERSION");

// Enable tracing for tests in this crate
#[cfg(all(test, not(target_family = "wasm")))]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
