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

//! Creation of storage key pairs.
//!
//! A storage key pair is a Curve25519 key pair. The private part is either
//! random or the output of PBKDF2-HMAC-SHA-512 over a passphrase, a salt and a
//! number of rounds, as described in the [spec].
//!
//! [spec]: https://spec.matrix.org/v1.8/client-server-api/#deriving-keys-from-passphrases

use hmac::{
    digest::{generic_array::GenericArray, FixedOutput},
    Hmac, Mac as _,
};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sha2::Sha512;
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{error::KeyDerivationError, recovery_key::encode_recovery_key};

/// The size of the private part of a storage key, in bytes.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// The identifier of the only supported passphrase KDF.
pub const PBKDF2_ALGORITHM: &str = "m.pbkdf2";

const SHA512_OUTPUT_SIZE: usize = 64;

/// Observer for the progress of a passphrase expansion.
///
/// Expanding a passphrase runs hundreds of thousands of HMAC rounds, the
/// listener gets notified roughly once per percent. It is purely
/// observational and can't influence the derived key.
pub trait ProgressListener: Send + Sync {
    /// Called with the number of rounds done so far and the total number of
    /// rounds.
    fn on_progress(&self, progress: u32, total: u32);
}

impl<F> ProgressListener for F
where
    F: Fn(u32, u32) + Send + Sync,
{
    fn on_progress(&self, progress: u32, total: u32) {
        self(progress, total)
    }
}

/// The private part of a storage key.
///
/// The key material is zeroized when the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StoragePrivateKey(Box<[u8; PRIVATE_KEY_SIZE]>);

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for StoragePrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StoragePrivateKey").field(&"*****").finish()
    }
}

impl PartialEq for StoragePrivateKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;

        self.0.as_slice().ct_eq(other.0.as_slice()).into()
    }
}

impl Eq for StoragePrivateKey {}

impl StoragePrivateKey {
    /// Create a private key from a copy of the given bytes.
    pub fn from_bytes(bytes: &[u8; PRIVATE_KEY_SIZE]) -> Self {
        Self(Box::new(*bytes))
    }

    /// Create a private key from a slice, returns `None` if the slice doesn't
    /// contain exactly [`PRIVATE_KEY_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == PRIVATE_KEY_SIZE {
            let mut key = Box::new([0u8; PRIVATE_KEY_SIZE]);
            key.copy_from_slice(bytes);

            Some(Self(key))
        } else {
            None
        }
    }

    /// The raw key material.
    pub fn as_bytes(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.0
    }

    /// Compute the Curve25519 public key belonging to this private key.
    pub fn public_key(&self) -> Curve25519PublicKey {
        Curve25519PublicKey::from(&self.to_secret_key())
    }

    /// Encode the private key as a human presentable recovery key.
    pub fn to_recovery_key(&self) -> String {
        encode_recovery_key(self)
    }

    pub(crate) fn to_secret_key(&self) -> Curve25519SecretKey {
        Curve25519SecretKey::from_slice(&self.0)
    }
}

/// A freshly created storage key pair.
#[derive(Debug)]
pub struct StorageKeyPair {
    /// The public part, this is published in the storage key metadata.
    pub public_key: Curve25519PublicKey,
    /// The private part, this is never persisted by this crate.
    pub private_key: StoragePrivateKey,
}

impl StorageKeyPair {
    fn from_private_key(private_key: StoragePrivateKey) -> Self {
        Self { public_key: private_key.public_key(), private_key }
    }
}

/// Generate a new random storage key pair.
pub fn generate_random_keypair() -> StorageKeyPair {
    let secret_key = Curve25519SecretKey::new();
    let public_key = Curve25519PublicKey::from(&secret_key);

    StorageKeyPair { public_key, private_key: StoragePrivateKey(secret_key.to_bytes()) }
}

/// Deterministically derive a storage key pair from a passphrase.
///
/// The same passphrase, salt and number of iterations will always produce the
/// same key pair.
///
/// # Arguments
///
/// * `passphrase` - The passphrase the user chose.
///
/// * `salt` - The salt, stored in the passphrase info of the storage key.
///
/// * `iterations` - The number of PBKDF2 rounds, needs to be positive.
///
/// * `progress` - An optional listener that gets notified about the progress
/// of the key derivation.
pub fn derive_keypair_from_passphrase(
    passphrase: &str,
    salt: &str,
    iterations: u32,
    progress: Option<&dyn ProgressListener>,
) -> Result<StorageKeyPair, KeyDerivationError> {
    let private_key = derive_private_key(passphrase, salt, iterations, progress)?;

    Ok(StorageKeyPair::from_private_key(private_key))
}

/// Expand a passphrase into the private part of a storage key.
pub(crate) fn derive_private_key(
    passphrase: &str,
    salt: &str,
    iterations: u32,
    progress: Option<&dyn ProgressListener>,
) -> Result<StoragePrivateKey, KeyDerivationError> {
    if iterations == 0 {
        return Err(KeyDerivationError::InvalidIterations);
    }

    let expanded =
        pbkdf2_hmac_sha512(passphrase.as_bytes(), salt.as_bytes(), iterations, progress);

    let mut key = Box::new([0u8; PRIVATE_KEY_SIZE]);
    key.copy_from_slice(&expanded[..PRIVATE_KEY_SIZE]);

    Ok(StoragePrivateKey(key))
}

/// Generate a random alphanumeric salt of the given length.
pub(crate) fn generate_salt(length: usize) -> String {
    thread_rng().sample_iter(&Alphanumeric).take(length).map(char::from).collect()
}

/// PBKDF2-HMAC-SHA-512, producing a single output block.
///
/// The `pbkdf2` crate doesn't let us observe the rounds, so the loop is spelled
/// out here. We only ever need 32 bytes of output, which fits into the first
/// block.
fn pbkdf2_hmac_sha512(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
    progress: Option<&dyn ProgressListener>,
) -> Zeroizing<[u8; SHA512_OUTPUT_SIZE]> {
    let prf = Hmac::<Sha512>::new_from_slice(passphrase)
        .expect("We should be able to create a HMAC object from a key of any length");

    let mut round = Zeroizing::new([0u8; SHA512_OUTPUT_SIZE]);

    let mut hmac = prf.clone();
    hmac.update(salt);
    hmac.update(&1u32.to_be_bytes());
    hmac.finalize_into(GenericArray::from_mut_slice(round.as_mut_slice()));

    let mut block = Zeroizing::new(*round);
    let report_every = (iterations / 100).max(1);

    for i in 1..=iterations {
        if i > 1 {
            let mut hmac = prf.clone();
            hmac.update(round.as_slice());
            hmac.finalize_into(GenericArray::from_mut_slice(round.as_mut_slice()));

            block.iter_mut().zip(round.iter()).for_each(|(b, r)| *b ^= r);
        }

        if let Some(progress) = progress {
            if i % report_every == 0 || i == iterations {
                progress.on_progress(i, iterations);
            }
        }
    }

    block
}
