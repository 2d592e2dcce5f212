// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::io;

/// Errors surfaced by the RLPx transport and the devp2p wire layer.
///
/// Only [`WireError::ShortFrame`] is recoverable: the ingress side keeps
/// buffering until the frame completes. Every other variant is fatal for
/// the connection it occurred on.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("transport closed")]
    TransportClosed,

    /// The receive buffer does not yet hold a whole frame.
    #[error("incomplete frame: waiting for {0} more bytes")]
    ShortFrame(usize),

    #[error("frame MAC mismatch")]
    MacMismatch,

    #[error("malformed wire data: {0}")]
    Decode(String),

    #[error("invalid handshake ciphertext")]
    InvalidAuth,

    #[error("handshake signature does not recover the advertised ephemeral key")]
    BadSignature,

    #[error("unsupported handshake version {0}")]
    UnsupportedVersion(u64),

    #[error("devp2p protocol breach")]
    ProtocolBreach,

    #[error("subprotocol not negotiated with this peer")]
    SubprotocolNotNegotiated,

    #[error("the RLPx service is not started")]
    ServiceNotStarted,
}

impl From<rlp::DecoderError> for WireError {
    fn from(err: rlp::DecoderError) -> Self {
        WireError::Decode(err.to_string())
    }
}

impl From<io::Error> for WireError {
    fn from(_: io::Error) -> Self {
        WireError::TransportClosed
    }
}

impl From<secp256k1::Error> for WireError {
    fn from(_: secp256k1::Error) -> Self {
        WireError::InvalidAuth
    }
}
