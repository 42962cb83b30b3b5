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

use crate::types::Signatures;

/// Signs the metadata of newly created storage keys.
///
/// Typically this is backed by the cross-signing master key or the device key
/// of the user, which allows other devices to verify that a storage key was
/// created by the user.
pub trait KeySigner: Send + Sync {
    /// Sign the canonical JSON form of the storage key metadata.
    ///
    /// Returns `None` if the signer declines to sign, the key is then stored
    /// without signatures.
    fn sign(&self, canonical_json: &str) -> Option<Signatures>;
}

impl<F> KeySigner for F
where
    F: Fn(&str) -> Option<Signatures> + Send + Sync,
{
    fn sign(&self, canonical_json: &str) -> Option<Signatures> {
        self(canonical_json)
    }
}
