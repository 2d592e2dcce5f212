// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::Capability;

/// A named, versioned subprotocol identity, e.g. `eth/63`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubProtocolId {
    pub name: String,
    pub version: u32,
}

impl SubProtocolId {
    pub fn of(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for SubProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// One demultiplexed subprotocol message: the message id is local to the
/// subprotocol's own numbering, the wire offset already removed.
#[derive(Debug, Clone)]
pub struct SubProtocolMessage {
    pub subprotocol: SubProtocolId,
    pub message_id: u64,
    pub payload: Vec<u8>,
    pub connection_id: String,
}

/// A subprotocol tunnelled over devp2p.
///
/// Implementations are installed into a [`SubProtocolRegistry`] and keep
/// no reference to connection internals beyond the opaque connection id;
/// replies go back through the service.
#[async_trait]
pub trait SubProtocol: Send + Sync {
    /// The canonical identity advertised in our Hello.
    fn id(&self) -> SubProtocolId;

    /// Whether this implementation can speak `id`, which may cover more
    /// versions than the advertised one.
    fn supports(&self, id: &SubProtocolId) -> bool;

    /// Number of message ids the given version uses.
    fn message_space_size(&self, version: u32) -> u64;

    /// Called once per connection after the Hello exchange selected this
    /// subprotocol.
    async fn new_peer_connection(&self, connection_id: &str);

    /// Called for every inbound message addressed to this subprotocol.
    async fn handle(&self, message: SubProtocolMessage);
}

/// Insertion-ordered set of installed subprotocols. The order decides
/// both the capability list sent in our Hello and which implementation
/// wins when several support the same capability.
#[derive(Default)]
pub struct SubProtocolRegistry {
    entries: Vec<Arc<dyn SubProtocol>>,
}

impl SubProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, subprotocol: Arc<dyn SubProtocol>) {
        self.entries.push(subprotocol);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get(&self, index: usize) -> Arc<dyn SubProtocol> {
        Arc::clone(&self.entries[index])
    }

    /// First installed subprotocol supporting the capability, if any.
    pub(crate) fn find_supporting(&self, name: &str, version: u32) -> Option<usize> {
        let id = SubProtocolId::of(name, version);
        self.entries.iter().position(|sp| sp.supports(&id))
    }

    /// The capability list for our Hello, in registry order.
    pub fn capabilities(&self) -> Vec<Capability> {
        self.entries
            .iter()
            .map(|sp| {
                let id = sp.id();
                Capability::new(id.name, id.version)
            })
            .collect()
    }
}
