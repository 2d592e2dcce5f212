// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! ECIES as used by the RLPx handshake: secp256k1 ECDH, the NIST
//! concatenation KDF over SHA-256, AES-128-CTR, and an HMAC-SHA256 tag
//! that also covers the caller-supplied associated data (the EIP-8 size
//! prefix).

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use ctr::Ctr64BE;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};

use crate::errors::WireError;

type Aes128Ctr = Ctr64BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

const PUBLIC_KEY_LEN: usize = 65;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Bytes added around the plaintext: ephemeral public key, IV and tag.
pub const ECIES_OVERHEAD: usize = PUBLIC_KEY_LEN + IV_LEN + TAG_LEN;

/// The x coordinate of the ECDH point, the raw shared secret RLPx builds
/// everything from.
pub(crate) fn ecdh_x(public: &PublicKey, secret: &SecretKey) -> [u8; 32] {
    let point = secp256k1::ecdh::shared_secret_point(public, secret);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    x
}

/// NIST SP 800-56 concatenation KDF with SHA-256 and no shared info.
fn kdf(secret: &[u8; 32], output_len: usize) -> Vec<u8> {
    let mut output = Vec::with_capacity(output_len);
    let mut counter: u32 = 1;
    while output.len() < output_len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(secret);
        output.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    output.truncate(output_len);
    output
}

fn derive_keys(shared_x: &[u8; 32]) -> ([u8; 16], [u8; 32]) {
    let material = kdf(shared_x, 32);
    let mut encryption_key = [0u8; 16];
    encryption_key.copy_from_slice(&material[..16]);
    let mac_key: [u8; 32] = Sha256::digest(&material[16..]).into();
    (encryption_key, mac_key)
}

/// Encrypt `plaintext` to `peer`. `associated_data` is mixed into the tag
/// but not transmitted; both sides must supply the same bytes.
pub fn encrypt(peer: &PublicKey, plaintext: &[u8], associated_data: &[u8]) -> Vec<u8> {
    let (ephemeral_secret, ephemeral_public) =
        SECP256K1.generate_keypair(&mut rand::rngs::OsRng);
    let shared_x = ecdh_x(peer, &ephemeral_secret);
    let (encryption_key, mac_key) = derive_keys(&shared_x);

    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let mut ciphertext = plaintext.to_vec();
    Aes128Ctr::new(&encryption_key.into(), &iv.into()).apply_keystream(&mut ciphertext);

    let mut mac = HmacSha256::new_from_slice(&mac_key).expect("hmac accepts 32-byte keys");
    mac.update(&iv);
    mac.update(&ciphertext);
    mac.update(associated_data);
    let tag = mac.finalize().into_bytes();

    let mut message = Vec::with_capacity(ECIES_OVERHEAD + ciphertext.len());
    message.extend_from_slice(&ephemeral_public.serialize_uncompressed());
    message.extend_from_slice(&iv);
    message.extend_from_slice(&ciphertext);
    message.extend_from_slice(&tag);
    message
}

/// Decrypt an ECIES message addressed to `secret`. Any structural or tag
/// failure is reported as [`WireError::InvalidAuth`].
pub fn decrypt(
    secret: &SecretKey,
    message: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, WireError> {
    if message.len() < ECIES_OVERHEAD {
        return Err(WireError::InvalidAuth);
    }
    let ephemeral_public =
        PublicKey::from_slice(&message[..PUBLIC_KEY_LEN]).map_err(|_| WireError::InvalidAuth)?;
    let iv = &message[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + IV_LEN];
    let ciphertext = &message[PUBLIC_KEY_LEN + IV_LEN..message.len() - TAG_LEN];
    let tag = &message[message.len() - TAG_LEN..];

    let shared_x = ecdh_x(&ephemeral_public, secret);
    let (encryption_key, mac_key) = derive_keys(&shared_x);

    let mut mac = HmacSha256::new_from_slice(&mac_key).expect("hmac accepts 32-byte keys");
    mac.update(iv);
    mac.update(ciphertext);
    mac.update(associated_data);
    mac.verify_slice(tag).map_err(|_| WireError::InvalidAuth)?;

    let mut plaintext = ciphertext.to_vec();
    let iv: [u8; IV_LEN] = iv.try_into().expect("iv slice is 16 bytes");
    Aes128Ctr::new(&encryption_key.into(), &iv.into()).apply_keystream(&mut plaintext);
    Ok(plaintext)
}
