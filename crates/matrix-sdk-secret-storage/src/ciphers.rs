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

//! The `m.secret_storage.v1.curve25519-aes-sha2` secret encryption scheme.
//!
//! A secret is encrypted for a storage public key using an ephemeral
//! Curve25519 key. The shared secret of the ECDH step is expanded with
//! HKDF-SHA-256 into an AES-256 key, an HMAC-SHA-256 key and an AES-CBC
//! initialization vector. The MAC is calculated over the ciphertext and
//! truncated to 8 bytes.

use aes::{
    cipher::{
        block_padding::Pkcs7, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut,
        KeyIvInit,
    },
    Aes256,
};
use hkdf::Hkdf;
use hmac::{
    digest::{FixedOutput, MacError},
    Hmac, Mac as _,
};
use sha2::Sha256;
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    error::DecryptionError,
    key_derivation::StoragePrivateKey,
    types::EncryptedSecretContent,
    utilities::{decode, encode},
};

const KEY_SIZE: usize = 32;
const IV_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const MAC_LENGTH: usize = 8;
const EXPANDED_SIZE: usize = KEY_SIZE * 2 + IV_SIZE;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Keys derived from the ECDH shared secret between the ephemeral key and the
/// storage key.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SharedKeys {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
    iv: Box<[u8; IV_SIZE]>,
}

impl SharedKeys {
    fn new(shared_secret: &[u8; 32]) -> Self {
        let hkdf: Hkdf<Sha256> = Hkdf::new(None, shared_secret);
        let mut expanded = Zeroizing::new([0u8; EXPANDED_SIZE]);

        hkdf.expand(&[], expanded.as_mut_slice())
            .expect("We should be able to expand the shared secret into 80 bytes");

        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);
        let mut iv = Box::new([0u8; IV_SIZE]);

        aes_key.copy_from_slice(&expanded[0..KEY_SIZE]);
        mac_key.copy_from_slice(&expanded[KEY_SIZE..KEY_SIZE * 2]);
        iv.copy_from_slice(&expanded[KEY_SIZE * 2..]);

        Self { aes_key, mac_key, iv }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(
            GenericArray::from_slice(self.aes_key.as_slice()),
            GenericArray::from_slice(self.iv.as_slice()),
        )
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
        let plaintext = Aes256CbcDec::new(
            GenericArray::from_slice(self.aes_key.as_slice()),
            GenericArray::from_slice(self.iv.as_slice()),
        )
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| DecryptionError::Padding)?;

        Ok(Zeroizing::new(plaintext))
    }

    fn hmac(&self) -> Hmac<Sha256> {
        Hmac::<Sha256>::new_from_slice(self.mac_key.as_slice())
            .expect("We should be able to create a new HMAC object from our 32 byte MAC key")
    }

    fn create_mac_tag(&self, ciphertext: &[u8]) -> [u8; MAC_LENGTH] {
        let mut mac = [0u8; MAC_SIZE];

        let mut hmac = self.hmac();
        hmac.update(ciphertext);
        hmac.finalize_into(GenericArray::from_mut_slice(&mut mac));

        let mut truncated = [0u8; MAC_LENGTH];
        truncated.copy_from_slice(&mac[..MAC_LENGTH]);

        truncated
    }

    fn verify_mac(&self, ciphertext: &[u8], mac: &[u8]) -> Result<(), MacError> {
        if mac.len() != MAC_LENGTH {
            return Err(MacError);
        }

        let mut hmac = self.hmac();
        hmac.update(ciphertext);
        hmac.verify_truncated_left(mac)
    }
}

/// Encrypt a secret for the given storage public key.
///
/// Every call uses a fresh ephemeral key, encrypting the same plaintext twice
/// produces two different encrypted contents.
pub fn encrypt_secret(
    plaintext: &[u8],
    public_key: &Curve25519PublicKey,
) -> EncryptedSecretContent {
    let ephemeral_key = Curve25519SecretKey::new();
    let ephemeral_public_key = Curve25519PublicKey::from(&ephemeral_key);

    let shared_secret = ephemeral_key.diffie_hellman(public_key);
    let keys = SharedKeys::new(shared_secret.as_bytes());

    let ciphertext = keys.encrypt(plaintext);
    let mac = keys.create_mac_tag(&ciphertext);

    EncryptedSecretContent {
        ciphertext: encode(ciphertext),
        ephemeral: ephemeral_public_key.to_base64(),
        mac: encode(mac),
    }
}

/// Decrypt a secret using the private part of the storage key it was encrypted
/// for.
///
/// The MAC is checked before any decryption happens, a mismatch, be it due to
/// tampering or the wrong key, results in [`DecryptionError::Mac`].
pub fn decrypt_secret(
    content: &EncryptedSecretContent,
    private_key: &StoragePrivateKey,
) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
    let ephemeral_public_key = Curve25519PublicKey::from_slice(&decode(&content.ephemeral)?)?;
    let ciphertext = decode(&content.ciphertext)?;
    let mac = decode(&content.mac)?;

    let shared_secret = private_key.to_secret_key().diffie_hellman(&ephemeral_public_key);
    let keys = SharedKeys::new(shared_secret.as_bytes());

    keys.verify_mac(&ciphertext, &mac)?;
    keys.decrypt(&ciphertext)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use super::*;
    use crate::key_derivation::generate_random_keypair;

    const PLAINTEXT: &[u8] = b"It's a secret to everybody";

    #[test]
    fn encryption_roundtrip() {
        let keypair = generate_random_keypair();

        let encrypted = encrypt_secret(PLAINTEXT, &keypair.public_key);
        assert_ne!(decode(&encrypted.ciphertext).unwrap(), PLAINTEXT);
        assert_eq!(decode(&encrypted.mac).unwrap().len(), MAC_LENGTH);

        let decrypted = decrypt_secret(&encrypted, &keypair.private_key).unwrap();
        assert_eq!(decrypted.as_slice(), PLAINTEXT);
    }

    #[test]
    fn every_encryption_uses_a_fresh_ephemeral_key() {
        let keypair = generate_random_keypair();

        let first = encrypt_secret(PLAINTEXT, &keypair.public_key);
        let second = encrypt_secret(PLAINTEXT, &keypair.public_key);

        assert_ne!(first.ephemeral, second.ephemeral);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn empty_plaintext() {
        let keypair = generate_random_keypair();

        let encrypted = encrypt_secret(b"", &keypair.public_key);
        assert_eq!(decode(&encrypted.ciphertext).unwrap().len(), IV_SIZE);

        let decrypted = decrypt_secret(&encrypted, &keypair.private_key).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn wrong_key_fails_the_mac_check() {
        let keypair = generate_random_keypair();
        let other = generate_random_keypair();

        let encrypted = encrypt_secret(PLAINTEXT, &keypair.public_key);

        assert_matches!(
            decrypt_secret(&encrypted, &other.private_key),
            Err(DecryptionError::Mac(_))
        );
    }

    #[test]
    fn tampered_ciphertext_fails_the_mac_check() {
        let keypair = generate_random_keypair();
        let mut encrypted = encrypt_secret(PLAINTEXT, &keypair.public_key);

        let mut ciphertext = decode(&encrypted.ciphertext).unwrap();
        ciphertext[0] ^= 0x01;
        encrypted.ciphertext = encode(ciphertext);

        assert_matches!(
            decrypt_secret(&encrypted, &keypair.private_key),
            Err(DecryptionError::Mac(_))
        );
    }

    #[test]
    fn tampered_mac_fails() {
        let keypair = generate_random_keypair();
        let encrypted = encrypt_secret(PLAINTEXT, &keypair.public_key);

        let mut mac = decode(&encrypted.mac).unwrap();
        mac[MAC_LENGTH - 1] ^= 0x80;
        let flipped = EncryptedSecretContent { mac: encode(&mac), ..encrypted.clone() };

        assert_matches!(
            decrypt_secret(&flipped, &keypair.private_key),
            Err(DecryptionError::Mac(_))
        );

        let full_length = EncryptedSecretContent { mac: encode([0u8; MAC_SIZE]), ..encrypted };

        assert_matches!(
            decrypt_secret(&full_length, &keypair.private_key),
            Err(DecryptionError::Mac(_))
        );
    }

    #[test]
    fn malformed_content() {
        let keypair = generate_random_keypair();
        let encrypted = encrypt_secret(PLAINTEXT, &keypair.public_key);

        let bad_base64 =
            EncryptedSecretContent { ciphertext: "not base64!".to_owned(), ..encrypted.clone() };
        assert_matches!(
            decrypt_secret(&bad_base64, &keypair.private_key),
            Err(DecryptionError::Base64(_))
        );

        let bad_ephemeral =
            EncryptedSecretContent { ephemeral: encode([1u8; 5]), ..encrypted.clone() };
        assert_matches!(
            decrypt_secret(&bad_ephemeral, &keypair.private_key),
            Err(DecryptionError::Key(_))
        );
    }

    proptest! {
        #[test]
        fn arbitrary_plaintext_roundtrips(plaintext in prop::collection::vec(any::<u8>(), 0..512)) {
            let keypair = generate_random_keypair();

            let encrypted = encrypt_secret(&plaintext, &keypair.public_key);
            let decrypted = decrypt_secret(&encrypted, &keypair.private_key).unwrap();

            prop_assert_eq!(decrypted.as_slice(), plaintext.as_slice());
        }
    }
}
