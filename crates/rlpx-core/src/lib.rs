// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Ethereum devp2p/RLPx peer transport.
//!
//! The crate establishes an encrypted, authenticated channel between two
//! nodes (the ECIES-based RLPx handshake followed by a framed,
//! MAC-chained AES-CTR stream) and multiplexes versioned subprotocols
//! over it with the devp2p control layer: Hello, Disconnect, Ping, Pong
//! and the negotiated message-id offset map.

pub mod config;
pub mod ecies;
pub mod errors;
pub mod framing;
pub mod handshake;
pub mod ids;
pub mod mac;
pub mod message;
pub mod service;
pub mod session;
pub mod subprotocol;
pub mod wire;

pub use config::ServiceConfig;
pub use errors::WireError;
pub use framing::{EgressFrames, IngressFrames, MAX_FRAME_BODY_BYTES};
pub use handshake::{
    handshake_initiator, handshake_responder, respond, InitiatorHandshake, SessionSecrets,
    AUTH_VERSION,
};
pub use ids::{random_connection_id, NodeId, NODE_ID_LENGTH};
pub use mac::MacChain;
pub use message::{
    Capability, DisconnectMessage, DisconnectReason, HelloMessage, RlpxMessage, BASE_MESSAGE_ID,
    DISCONNECT_ID, HELLO_ID, PING_ID, PONG_ID,
};
pub use service::{RlpxService, ServiceHandle};
pub use session::MessageWriter;
pub use subprotocol::{SubProtocol, SubProtocolId, SubProtocolMessage, SubProtocolRegistry};
pub use wire::{WireConnection, DEVP2P_VERSION};

#[cfg(test)]
mod conformance;
