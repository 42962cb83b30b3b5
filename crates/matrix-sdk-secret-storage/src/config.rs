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

use serde::{Deserialize, Serialize};

const PASSPHRASE_ITERATIONS: u32 = 500_000;
const PASSPHRASE_SALT_LENGTH: usize = 32;

/// What to do when a storage key is created with an ID that is already in
/// use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum KeyOverwritePolicy {
    /// Refuse to create the key, the existing key stays untouched.
    #[default]
    Reject,
    /// Replace the metadata of the existing key.
    ///
    /// Secrets encrypted for the old key can't be decrypted with the new one.
    Overwrite,
}

/// Settings for the creation of storage keys.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SecretStorageSettings {
    /// The number of PBKDF2 rounds used when a key is derived from a
    /// passphrase.
    #[serde(default = "default_iterations")]
    pub passphrase_iterations: u32,
    /// The length of the random salt used when a key is derived from a
    /// passphrase.
    #[serde(default = "default_salt_length")]
    pub passphrase_salt_length: usize,
    /// Whether creating a key with an existing ID is allowed.
    #[serde(default)]
    pub key_overwrite: KeyOverwritePolicy,
}

fn default_iterations() -> u32 {
    PASSPHRASE_ITERATIONS
}

fn default_salt_length() -> usize {
    PASSPHRASE_SALT_LENGTH
}

impl Default for SecretStorageSettings {
    fn default() -> Self {
        Self {
            passphrase_iterations: PASSPHRASE_ITERATIONS,
            passphrase_salt_length: PASSPHRASE_SALT_LENGTH,
            key_overwrite: KeyOverwritePolicy::Reject,
        }
    }
}
