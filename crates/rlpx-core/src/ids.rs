// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;

use rand::RngCore;
use secp256k1::PublicKey;

use crate::errors::WireError;

pub const NODE_ID_LENGTH: usize = 64;

/// A devp2p node identity: the uncompressed secp256k1 public key of the
/// node, X || Y without the 0x04 point prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; NODE_ID_LENGTH]);

impl NodeId {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let serialized = key.serialize_uncompressed();
        let mut id = [0u8; NODE_ID_LENGTH];
        id.copy_from_slice(&serialized[1..]);
        Self(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, WireError> {
        let id: [u8; NODE_ID_LENGTH] = bytes
            .try_into()
            .map_err(|_| WireError::Decode("node id must be 64 bytes".into()))?;
        Ok(Self(id))
    }

    /// Recover the full curve point. Fails if the 64 bytes are not a valid
    /// point on secp256k1.
    pub fn to_public_key(&self) -> Result<PublicKey, WireError> {
        let mut uncompressed = [0u8; 65];
        uncompressed[0] = 0x04;
        uncompressed[1..].copy_from_slice(&self.0);
        PublicKey::from_slice(&uncompressed)
            .map_err(|_| WireError::Decode("node id is not a valid secp256k1 point".into()))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }

    /// Short prefix for logging.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}…)", self.fingerprint())
    }
}

/// Generate an opaque identifier for one live connection, unique for the
/// lifetime of the process.
pub fn random_connection_id() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SECP256K1;

    #[test]
    fn node_id_roundtrips_through_public_key() {
        let (_, public) = SECP256K1.generate_keypair(&mut rand::rngs::OsRng);
        let id = NodeId::from_public_key(&public);
        let recovered = id.to_public_key().expect("valid point");
        assert_eq!(recovered, public);
    }

    #[test]
    fn node_id_rejects_garbage_point() {
        let id = NodeId([0xFFu8; NODE_ID_LENGTH]);
        assert!(id.to_public_key().is_err());
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = random_connection_id();
        let b = random_connection_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}
