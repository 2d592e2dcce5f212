// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The RLPx key-agreement handshake.
//!
//! The initiator sends an ECIES-encrypted auth message carrying a
//! signature by its ephemeral key over the static shared secret, the
//! responder answers with its ephemeral public key and nonce, and both
//! sides derive identical symmetric secrets. Messages are emitted in the
//! size-prefixed RLP format; the fixed-size pre-EIP-8 layout is still
//! accepted on read.

use rand::{Rng, RngCore};
use rlp::{Rlp, RlpStream};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use sha3::{Digest, Keccak256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ecies::{self, ECIES_OVERHEAD};
use crate::errors::WireError;
use crate::framing::{EgressFrames, IngressFrames};
use crate::ids::NodeId;
use crate::mac::MacChain;

/// Version advertised in auth messages. Higher versions are tolerated on
/// read, lower ones rejected.
pub const AUTH_VERSION: u64 = 4;

const SIGNATURE_LEN: usize = 65;
const NONCE_LEN: usize = 32;

// Fixed ciphertext sizes of the pre-EIP-8 handshake layout. The first
// byte of those messages is the 0x04 point prefix, which is how they are
// told apart from a 2-byte size prefix.
const PLAIN_AUTH_LEN: usize = 307;
const PLAIN_ACK_LEN: usize = 210;
const PLAIN_AUTH_BODY_LEN: usize = PLAIN_AUTH_LEN - ECIES_OVERHEAD;
const PLAIN_ACK_BODY_LEN: usize = PLAIN_ACK_LEN - ECIES_OVERHEAD;

fn keccak256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (idx, byte) in out.iter_mut().enumerate() {
        *byte = a[idx] ^ b[idx];
    }
    out
}

fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Random padding appended to the RLP body before encryption, so message
/// sizes do not reveal the layout version.
fn random_padding() -> Vec<u8> {
    let mut rng = rand::rngs::OsRng;
    let mut padding = vec![0u8; rng.gen_range(100..=250)];
    rng.fill_bytes(&mut padding);
    padding
}

/// Wrap an encrypted handshake body in the size-prefixed format; the
/// prefix doubles as ECIES associated data.
fn seal_prefixed(peer: &PublicKey, body: &[u8]) -> Vec<u8> {
    let ciphertext_len = body.len() + ECIES_OVERHEAD;
    let prefix = (ciphertext_len as u16).to_be_bytes();
    let ciphertext = ecies::encrypt(peer, body, &prefix);
    let mut message = Vec::with_capacity(2 + ciphertext.len());
    message.extend_from_slice(&prefix);
    message.extend_from_slice(&ciphertext);
    message
}

/// Decrypt a received handshake message in either accepted layout,
/// returning the plaintext body and whether it was the fixed pre-EIP-8
/// form.
fn open_message(
    secret: &SecretKey,
    message: &[u8],
    plain_len: usize,
) -> Result<(Vec<u8>, bool), WireError> {
    if message.first() == Some(&0x04) {
        if message.len() != plain_len {
            return Err(WireError::InvalidAuth);
        }
        let body = ecies::decrypt(secret, message, &[])?;
        Ok((body, true))
    } else {
        if message.len() < 2 + ECIES_OVERHEAD {
            return Err(WireError::InvalidAuth);
        }
        let body = ecies::decrypt(secret, &message[2..], &message[..2])?;
        Ok((body, false))
    }
}

/// Secrets derived once per connection, immutable for its lifetime.
#[derive(Debug)]
pub struct SessionSecrets {
    pub aes_secret: [u8; 32],
    pub mac_secret: [u8; 32],
    /// Session-resumption token. Derived for completeness; nothing
    /// consumes it yet.
    pub token: [u8; 32],
    pub egress_mac: MacChain,
    pub ingress_mac: MacChain,
}

impl SessionSecrets {
    /// Consume the secrets into the two framing directions.
    pub fn split(self) -> (EgressFrames, IngressFrames) {
        let egress = EgressFrames::new(&self.aes_secret, self.egress_mac);
        let ingress = IngressFrames::new(&self.aes_secret, self.ingress_mac);
        (egress, ingress)
    }
}

#[allow(clippy::too_many_arguments)]
fn derive_secrets(
    ephemeral_shared: [u8; 32],
    initiator_nonce: &[u8; 32],
    responder_nonce: &[u8; 32],
    local_nonce: &[u8; 32],
    remote_nonce: &[u8; 32],
    sent: &[u8],
    received: &[u8],
) -> SessionSecrets {
    let nonce_hash = keccak256(&[responder_nonce, initiator_nonce]);
    let shared_secret = keccak256(&[&ephemeral_shared, &nonce_hash]);
    let aes_secret = keccak256(&[&ephemeral_shared, &shared_secret]);
    let mac_secret = keccak256(&[&ephemeral_shared, &aes_secret]);
    let token = keccak256(&[&shared_secret]);
    SessionSecrets {
        aes_secret,
        mac_secret,
        token,
        egress_mac: MacChain::seeded(mac_secret, remote_nonce, sent),
        ingress_mac: MacChain::seeded(mac_secret, local_nonce, received),
    }
}

fn sign_with_recovery(digest: [u8; 32], secret: &SecretKey) -> [u8; SIGNATURE_LEN] {
    let signature = SECP256K1.sign_ecdsa_recoverable(&Message::from_digest(digest), secret);
    let (recovery_id, compact) = signature.serialize_compact();
    let mut out = [0u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id.to_i32() as u8;
    out
}

fn recover_signer(digest: [u8; 32], signature: &[u8]) -> Result<PublicKey, WireError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(WireError::BadSignature);
    }
    let recovery_id =
        RecoveryId::from_i32(signature[64] as i32).map_err(|_| WireError::BadSignature)?;
    let signature = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|_| WireError::BadSignature)?;
    SECP256K1
        .recover_ecdsa(&Message::from_digest(digest), &signature)
        .map_err(|_| WireError::BadSignature)
}

fn ephemeral_key_hash(key: &PublicKey) -> [u8; 32] {
    keccak256(&[&key.serialize_uncompressed()[1..]])
}

struct AuthBody {
    signature: Vec<u8>,
    ephemeral_hash: [u8; 32],
    node_id: NodeId,
    nonce: [u8; 32],
}

fn encode_auth_body(
    signature: &[u8; SIGNATURE_LEN],
    ephemeral_hash: &[u8; 32],
    node_id: &NodeId,
    nonce: &[u8; 32],
) -> Vec<u8> {
    let mut stream = RlpStream::new_list(5);
    stream.append(&signature.to_vec());
    stream.append(&ephemeral_hash.to_vec());
    stream.append(&node_id.as_bytes().to_vec());
    stream.append(&nonce.to_vec());
    stream.append(&AUTH_VERSION);
    let mut body = stream.out().to_vec();
    body.extend_from_slice(&random_padding());
    body
}

fn decode_auth_body(body: &[u8], plain: bool) -> Result<AuthBody, WireError> {
    if plain {
        if body.len() != PLAIN_AUTH_BODY_LEN {
            return Err(WireError::InvalidAuth);
        }
        let mut ephemeral_hash = [0u8; 32];
        ephemeral_hash.copy_from_slice(&body[65..97]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&body[161..193]);
        return Ok(AuthBody {
            signature: body[..65].to_vec(),
            ephemeral_hash,
            node_id: NodeId::from_slice(&body[97..161]).map_err(|_| WireError::InvalidAuth)?,
            nonce,
        });
    }
    let rlp = Rlp::new(body);
    let signature: Vec<u8> = rlp.val_at(0).map_err(|_| WireError::InvalidAuth)?;
    let ephemeral_hash: [u8; 32] = rlp
        .val_at::<Vec<u8>>(1)
        .map_err(|_| WireError::InvalidAuth)?
        .try_into()
        .map_err(|_| WireError::InvalidAuth)?;
    let node_id_bytes: Vec<u8> = rlp.val_at(2).map_err(|_| WireError::InvalidAuth)?;
    let nonce: [u8; NONCE_LEN] = rlp
        .val_at::<Vec<u8>>(3)
        .map_err(|_| WireError::InvalidAuth)?
        .try_into()
        .map_err(|_| WireError::InvalidAuth)?;
    let version: u64 = rlp.val_at(4).map_err(|_| WireError::InvalidAuth)?;
    if version < AUTH_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    Ok(AuthBody {
        signature,
        ephemeral_hash,
        node_id: NodeId::from_slice(&node_id_bytes).map_err(|_| WireError::InvalidAuth)?,
        nonce,
    })
}

/// Initiator-side handshake state between sending auth and reading the
/// responder's ack.
pub struct InitiatorHandshake {
    local_secret: SecretKey,
    ephemeral_secret: SecretKey,
    nonce: [u8; 32],
    auth_sent: Vec<u8>,
}

impl InitiatorHandshake {
    pub fn new(local_secret: &SecretKey, remote_public: &PublicKey) -> Self {
        let (ephemeral_secret, ephemeral_public) =
            SECP256K1.generate_keypair(&mut rand::rngs::OsRng);
        let nonce = random_nonce();

        let static_shared = ecies::ecdh_x(remote_public, local_secret);
        let signature = sign_with_recovery(xor32(&static_shared, &nonce), &ephemeral_secret);
        let local_node_id = NodeId::from_public_key(&local_secret.public_key(SECP256K1));
        let body = encode_auth_body(
            &signature,
            &ephemeral_key_hash(&ephemeral_public),
            &local_node_id,
            &nonce,
        );
        let auth_sent = seal_prefixed(remote_public, &body);

        Self {
            local_secret: *local_secret,
            ephemeral_secret,
            nonce,
            auth_sent,
        }
    }

    /// The auth message to put on the wire, size prefix included.
    pub fn auth_bytes(&self) -> &[u8] {
        &self.auth_sent
    }

    /// Process the responder's ack and derive the session secrets.
    pub fn read_ack(self, ack: &[u8]) -> Result<SessionSecrets, WireError> {
        let (body, plain) = open_message(&self.local_secret, ack, PLAIN_ACK_LEN)?;
        let (remote_ephemeral, remote_nonce) = if plain {
            if body.len() != PLAIN_ACK_BODY_LEN {
                return Err(WireError::InvalidAuth);
            }
            let ephemeral = NodeId::from_slice(&body[..64])
                .map_err(|_| WireError::InvalidAuth)?
                .to_public_key()
                .map_err(|_| WireError::InvalidAuth)?;
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&body[64..96]);
            (ephemeral, nonce)
        } else {
            let rlp = Rlp::new(&body);
            let ephemeral_bytes: Vec<u8> = rlp.val_at(0).map_err(|_| WireError::InvalidAuth)?;
            let nonce: [u8; NONCE_LEN] = rlp
                .val_at::<Vec<u8>>(1)
                .map_err(|_| WireError::InvalidAuth)?
                .try_into()
                .map_err(|_| WireError::InvalidAuth)?;
            let version: u64 = rlp.val_at(2).map_err(|_| WireError::InvalidAuth)?;
            if version < AUTH_VERSION {
                return Err(WireError::UnsupportedVersion(version));
            }
            let ephemeral = NodeId::from_slice(&ephemeral_bytes)
                .map_err(|_| WireError::InvalidAuth)?
                .to_public_key()
                .map_err(|_| WireError::InvalidAuth)?;
            (ephemeral, nonce)
        };

        let ephemeral_shared = ecies::ecdh_x(&remote_ephemeral, &self.ephemeral_secret);
        Ok(derive_secrets(
            ephemeral_shared,
            &self.nonce,
            &remote_nonce,
            &self.nonce,
            &remote_nonce,
            &self.auth_sent,
            ack,
        ))
    }
}

/// Responder side: process a received auth message and produce the ack to
/// send back, the derived secrets, and the initiator's static public key.
pub fn respond(
    local_secret: &SecretKey,
    auth: &[u8],
) -> Result<(Vec<u8>, SessionSecrets, PublicKey), WireError> {
    let (body, plain) = open_message(local_secret, auth, PLAIN_AUTH_LEN)?;
    let auth_body = decode_auth_body(&body, plain)?;

    let remote_public = auth_body
        .node_id
        .to_public_key()
        .map_err(|_| WireError::InvalidAuth)?;
    let static_shared = ecies::ecdh_x(&remote_public, local_secret);
    let remote_ephemeral = recover_signer(
        xor32(&static_shared, &auth_body.nonce),
        &auth_body.signature,
    )?;
    if ephemeral_key_hash(&remote_ephemeral) != auth_body.ephemeral_hash {
        return Err(WireError::BadSignature);
    }

    let (ephemeral_secret, ephemeral_public) = SECP256K1.generate_keypair(&mut rand::rngs::OsRng);
    let nonce = random_nonce();

    let mut stream = RlpStream::new_list(3);
    stream.append(&ephemeral_public.serialize_uncompressed()[1..].to_vec());
    stream.append(&nonce.to_vec());
    stream.append(&AUTH_VERSION);
    let mut ack_body = stream.out().to_vec();
    ack_body.extend_from_slice(&random_padding());
    let ack = seal_prefixed(&remote_public, &ack_body);

    let ephemeral_shared = ecies::ecdh_x(&remote_ephemeral, &ephemeral_secret);
    let secrets = derive_secrets(
        ephemeral_shared,
        &auth_body.nonce,
        &nonce,
        &nonce,
        &auth_body.nonce,
        &ack,
        auth,
    );
    Ok((ack, secrets, remote_public))
}

/// Read one handshake message off the stream, accepting both layouts.
async fn read_handshake_message<S>(io: &mut S, plain_len: usize) -> Result<Vec<u8>, WireError>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    io.read_exact(&mut head).await?;
    let remainder = if head[0] == 0x04 {
        plain_len - 2
    } else {
        let size = u16::from_be_bytes(head) as usize;
        if size < ECIES_OVERHEAD {
            return Err(WireError::InvalidAuth);
        }
        size
    };
    let mut message = head.to_vec();
    let start = message.len();
    message.resize(start + remainder, 0);
    io.read_exact(&mut message[start..]).await?;
    Ok(message)
}

/// Dial-side handshake over a duplex stream.
pub async fn handshake_initiator<S>(
    io: &mut S,
    local_secret: &SecretKey,
    remote_public: &PublicKey,
) -> Result<SessionSecrets, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = InitiatorHandshake::new(local_secret, remote_public);
    io.write_all(handshake.auth_bytes()).await?;
    io.flush().await?;
    let ack = read_handshake_message(io, PLAIN_ACK_LEN).await?;
    handshake.read_ack(&ack)
}

/// Accept-side handshake over a duplex stream. Returns the initiator's
/// static public key alongside the secrets.
pub async fn handshake_responder<S>(
    io: &mut S,
    local_secret: &SecretKey,
) -> Result<(SessionSecrets, PublicKey), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let auth = read_handshake_message(io, PLAIN_AUTH_LEN).await?;
    let (ack, secrets, remote_public) = respond(local_secret, &auth)?;
    io.write_all(&ack).await?;
    io.flush().await?;
    Ok((secrets, remote_public))
}
