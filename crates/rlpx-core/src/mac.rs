// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use sha3::{Digest, Keccak256};

/// Running keccak-256 MAC state for one direction of an RLPx connection.
///
/// The state advances exactly once per header and once per body; sender
/// and receiver must apply the same updates in the same order or every
/// subsequent MAC check fails. There is no resynchronisation.
#[derive(Clone, Debug)]
pub struct MacChain {
    cipher: Aes256,
    digest: Keccak256,
}

impl MacChain {
    /// Seed a direction: `keccak(mac-secret XOR nonce || handshake-bytes)`.
    ///
    /// The egress chain is seeded with the *remote* nonce and the handshake
    /// ciphertext this side sent; the ingress chain with the *local* nonce
    /// and the ciphertext received. The pairing mirrors between peers.
    pub fn seeded(mac_secret: [u8; 32], nonce: &[u8; 32], handshake_bytes: &[u8]) -> Self {
        let mut xored = mac_secret;
        for (byte, n) in xored.iter_mut().zip(nonce) {
            *byte ^= n;
        }
        let mut digest = Keccak256::new();
        digest.update(xored);
        digest.update(handshake_bytes);
        Self {
            cipher: Aes256::new(&mac_secret.into()),
            digest,
        }
    }

    /// Advance the chain over one header ciphertext and return its MAC.
    pub fn header_mac(&mut self, header_ciphertext: &[u8; 16]) -> [u8; 16] {
        let whitened = self.encrypt_block(self.current());
        let mut update = [0u8; 16];
        for (idx, byte) in update.iter_mut().enumerate() {
            *byte = whitened[idx] ^ header_ciphertext[idx];
        }
        self.digest.update(update);
        self.current()
    }

    /// Advance the chain over one body ciphertext and return its MAC.
    pub fn body_mac(&mut self, body_ciphertext: &[u8]) -> [u8; 16] {
        self.digest.update(body_ciphertext);
        let seed = self.current();
        let whitened = self.encrypt_block(seed);
        let mut update = [0u8; 16];
        for (idx, byte) in update.iter_mut().enumerate() {
            *byte = whitened[idx] ^ seed[idx];
        }
        self.digest.update(update);
        self.current()
    }

    fn current(&self) -> [u8; 16] {
        let full = self.digest.clone().finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&full[..16]);
        out
    }

    fn encrypt_block(&self, input: [u8; 16]) -> [u8; 16] {
        let mut block = input.into();
        self.cipher.encrypt_block(&mut block);
        block.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrored_seeds_agree_on_every_frame() {
        let secret = [0x42u8; 32];
        let nonce = [7u8; 32];
        let mut egress = MacChain::seeded(secret, &nonce, b"handshake bytes");
        let mut ingress = MacChain::seeded(secret, &nonce, b"handshake bytes");

        for round in 0u8..4 {
            let header = [round; 16];
            assert_eq!(egress.header_mac(&header), ingress.header_mac(&header));
            let body = vec![round ^ 0xFF; 48];
            assert_eq!(egress.body_mac(&body), ingress.body_mac(&body));
        }
    }

    #[test]
    fn chain_diverges_after_differing_input() {
        let secret = [1u8; 32];
        let nonce = [2u8; 32];
        let mut a = MacChain::seeded(secret, &nonce, b"seed");
        let mut b = MacChain::seeded(secret, &nonce, b"seed");

        a.header_mac(&[0u8; 16]);
        b.header_mac(&[1u8; 16]);
        // Once the inputs differ the chains never re-align.
        assert_ne!(a.body_mac(&[0u8; 16]), b.body_mac(&[0u8; 16]));
    }

    #[test]
    fn seed_depends_on_nonce_and_handshake_bytes() {
        let secret = [3u8; 32];
        let mut base = MacChain::seeded(secret, &[0u8; 32], b"auth");
        let mut other_nonce = MacChain::seeded(secret, &[1u8; 32], b"auth");
        let mut other_bytes = MacChain::seeded(secret, &[0u8; 32], b"ack");

        let header = [9u8; 16];
        let reference = base.header_mac(&header);
        assert_ne!(reference, other_nonce.header_mac(&header));
        assert_ne!(reference, other_bytes.header_mac(&header));
    }
}
