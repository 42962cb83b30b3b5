// Copyright 2021 The Matrix.org Foundation C.I.C.
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

//! The human presentable form of a storage key.
//!
//! A recovery key is the base58 encoding of a two byte prefix, the 32 bytes of
//! the private key and a parity byte. For display purposes the string is split
//! into groups of four characters, whitespace is ignored when decoding.

use thiserror::Error;
use zeroize::Zeroizing;

use crate::key_derivation::{StoragePrivateKey, PRIVATE_KEY_SIZE};

const PREFIX: [u8; 2] = [0x8b, 0x01];
const PREFIX_PARITY: u8 = PREFIX[0] ^ PREFIX[1];
const DISPLAY_CHUNK_SIZE: usize = 4;
const DECODED_SIZE: usize = PREFIX.len() + PRIVATE_KEY_SIZE + 1;

/// Error type for the decoding of a recovery key.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The recovery key doesn't start with the expected prefix.
    #[error("The decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte doesn't match, the recovery key was likely mistyped.
    #[error("The parity byte of the recovery key doesn't match: expected {0:?}, got {1:?}")]
    Parity(u8, u8),
    /// The recovery key decoded to the wrong number of bytes.
    #[error("The decoded recovery key has a invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The recovery key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
}

fn parity_byte(bytes: &[u8]) -> u8 {
    bytes.iter().fold(PREFIX_PARITY, |acc, x| acc ^ x)
}

/// Encode a private storage key as a recovery key.
///
/// The returned string is split into space separated groups of four
/// characters.
pub fn encode_recovery_key(key: &StoragePrivateKey) -> String {
    let key = key.as_bytes();
    let bytes =
        Zeroizing::new([PREFIX.as_ref(), key.as_ref(), [parity_byte(key)].as_ref()].concat());

    let encoded = Zeroizing::new(
        bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string(),
    );

    // The capacity is reserved up front, pushing never reallocates and leaves
    // no stray copies of the key behind.
    let mut display =
        String::with_capacity(encoded.len() + encoded.len() / DISPLAY_CHUNK_SIZE);

    for (i, c) in encoded.chars().enumerate() {
        if i > 0 && i % DISPLAY_CHUNK_SIZE == 0 {
            display.push(' ');
        }

        display.push(c);
    }

    display
}

/// Decode a recovery key back into the private storage key.
///
/// Any whitespace in the input is ignored.
pub fn decode_recovery_key(recovery_key: &str) -> Result<StoragePrivateKey, DecodeError> {
    // Remove any whitespace we might have
    let value: Zeroizing<String> =
        Zeroizing::new(recovery_key.chars().filter(|c| !c.is_whitespace()).collect());

    let decoded = Zeroizing::new(
        bs58::decode(value.as_str()).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?,
    );

    if decoded.len() != DECODED_SIZE {
        return Err(DecodeError::Length(DECODED_SIZE, decoded.len()));
    }

    let (prefix, rest) = decoded.split_at(PREFIX.len());
    let (key, expected_parity) = rest.split_at(PRIVATE_KEY_SIZE);

    let expected_parity = expected_parity[0];
    let parity = parity_byte(key);

    if prefix != PREFIX {
        Err(DecodeError::Prefix(PREFIX, [prefix[0], prefix[1]]))
    } else if expected_parity != parity {
        Err(DecodeError::Parity(expected_parity, parity))
    } else {
        StoragePrivateKey::from_slice(key)
            .ok_or(DecodeError::Length(PRIVATE_KEY_SIZE, key.len()))
    }
}
