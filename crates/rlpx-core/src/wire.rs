use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::errors::WireError;
use crate::ids::NodeId;
use crate::message::{
    DisconnectMessage, DisconnectReason, HelloMessage, RlpxMessage, BASE_MESSAGE_ID,
    DISCONNECT_ID, HELLO_ID, PING_ID, PONG_ID,
};
use crate::session::MessageWriter;
use crate::subprotocol::{SubProtocol, SubProtocolId, SubProtocolMessage, SubProtocolRegistry};

/// devp2p protocol version announced in our Hello. Peers announcing a
/// higher version are disconnected.
pub const DEVP2P_VERSION: u32 = 5;

/// Callback run exactly once when the connection closes, however it
/// closes: local disconnect, received Disconnect, or transport failure.
pub type DisconnectHandler = Box<dyn FnOnce() + Send>;

/// One negotiated message-id range. Subprotocol ids `0..=hi-lo` map onto
/// wire ids `lo..=hi`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MessageRange {
    lo: u64,
    hi: u64,
    /// Index into the registry.
    subprotocol: usize,
    /// The capability actually negotiated, which is what handlers are
    /// addressed by.
    identity: SubProtocolId,
}

struct WireState {
    my_hello_sent: bool,
    peer_hello: Option<HelloMessage>,
    ranges: Vec<MessageRange>,
    awaiting_pong: Option<oneshot::Sender<()>>,
    closed: bool,
    on_close: Option<DisconnectHandler>,
}

/// A stateful devp2p connection riding on an established RLPx session.
///
/// All inbound messages arrive through [`WireConnection::message_received`]
/// from a single worker, in arrival order. Outbound sends may come from
/// any task; the [`MessageWriter`] serializes them.
pub struct WireConnection {
    id: String,
    local_node_id: NodeId,
    /// Set for outbound connections, where the dialled identity is known
    /// a priori. Inbound peers are identified by their Hello.
    expected_peer: Option<NodeId>,
    writer: MessageWriter,
    registry: Arc<SubProtocolRegistry>,
    client_id: String,
    advertised_port: u16,
    state: Mutex<WireState>,
}

impl WireConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        local_node_id: NodeId,
        expected_peer: Option<NodeId>,
        writer: MessageWriter,
        registry: Arc<SubProtocolRegistry>,
        client_id: String,
        advertised_port: u16,
        on_close: DisconnectHandler,
    ) -> Self {
        Self {
            id,
            local_node_id,
            expected_peer,
            writer,
            registry,
            client_id,
            advertised_port,
            state: Mutex::new(WireState {
                my_hello_sent: false,
                peer_hello: None,
                ranges: Vec::new(),
                awaiting_pong: None,
                closed: false,
                on_close: Some(on_close),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// The peer's Hello, once received.
    pub async fn peer_hello(&self) -> Option<HelloMessage> {
        self.state.lock().await.peer_hello.clone()
    }

    /// Initiator behavior: proactively announce ourselves. Idempotent, so
    /// the mutual-Hello race is harmless.
    pub async fn handle_connection_start(&self) -> Result<(), WireError> {
        let mut state = self.state.lock().await;
        if state.closed || state.my_hello_sent {
            return Ok(());
        }
        self.send_hello_locked(&mut state).await
    }

    /// Entry point for every demultiplexed inbound message.
    pub async fn message_received(&self, message: RlpxMessage) -> Result<(), WireError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }

        match message.id {
            HELLO_ID => {
                let handlers = self.hello_received(&mut state, &message.payload).await?;
                drop(state);
                for (subprotocol, connection_id) in handlers {
                    subprotocol.new_peer_connection(&connection_id).await;
                }
                return Ok(());
            }
            DISCONNECT_ID => {
                match DisconnectMessage::decode(&message.payload) {
                    Ok(disconnect) => {
                        debug!(connection = %self.id, reason = ?disconnect.reason, "peer disconnected")
                    }
                    Err(err) => {
                        debug!(connection = %self.id, %err, "peer disconnected with undecodable reason")
                    }
                }
                self.close_locked(&mut state);
                return Ok(());
            }
            _ => {}
        }

        if state.peer_hello.is_none() || !state.my_hello_sent {
            self.disconnect_locked(&mut state, DisconnectReason::ProtocolBreach)
                .await;
            return Ok(());
        }

        match message.id {
            PING_ID => {
                self.writer.write_message(PONG_ID, &[]).await?;
            }
            PONG_ID => {
                // Completes the latest outstanding ping; a stray pong has
                // nothing to complete and is ignored.
                if let Some(waiter) = state.awaiting_pong.take() {
                    let _ = waiter.send(());
                }
            }
            id => match find_range(&state.ranges, id) {
                Some(range) => {
                    let subprotocol = self.registry.get(range.subprotocol);
                    let dispatched = SubProtocolMessage {
                        subprotocol: range.identity.clone(),
                        message_id: id - range.lo,
                        payload: message.payload,
                        connection_id: self.id.clone(),
                    };
                    drop(state);
                    subprotocol.handle(dispatched).await;
                }
                None => {
                    self.disconnect_locked(&mut state, DisconnectReason::ProtocolBreach)
                        .await;
                }
            },
        }
        Ok(())
    }

    /// Send a subprotocol message. The wire id is the negotiated range's
    /// low endpoint plus the subprotocol-local id.
    pub async fn send_subprotocol_message(
        &self,
        subprotocol: &SubProtocolId,
        message_id: u64,
        payload: &[u8],
    ) -> Result<(), WireError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(WireError::TransportClosed);
        }
        let range = state
            .ranges
            .iter()
            .find(|range| self.registry.get(range.subprotocol).supports(subprotocol))
            .ok_or(WireError::SubprotocolNotNegotiated)?;
        let wire_id = range.lo + message_id;
        self.writer.write_message(wire_id, payload).await
    }

    /// Whether the Hello exchange negotiated the given subprotocol.
    pub async fn supports_subprotocol(&self, subprotocol: &SubProtocolId) -> bool {
        let state = self.state.lock().await;
        !state.closed
            && state
                .ranges
                .iter()
                .any(|range| self.registry.get(range.subprotocol).supports(subprotocol))
    }

    /// Send a Ping and obtain a completion that resolves when the next
    /// Pong arrives. A newer Ping replaces the completion; closing the
    /// connection cancels it.
    pub async fn send_ping(&self) -> Result<oneshot::Receiver<()>, WireError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(WireError::TransportClosed);
        }
        self.writer.write_message(PING_ID, &[]).await?;
        let (sender, receiver) = oneshot::channel();
        state.awaiting_pong = Some(sender);
        Ok(receiver)
    }

    /// Tell the peer we are going away, then close. Idempotent.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        let mut state = self.state.lock().await;
        self.disconnect_locked(&mut state, reason).await;
    }

    /// Close without an outbound Disconnect (transport already gone).
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        self.close_locked(&mut state);
    }

    /// Close after a fatal session error, sending a Disconnect with the
    /// closest matching reason while the transport may still work.
    pub async fn close_on_error(&self, err: &WireError) {
        match err {
            WireError::TransportClosed => self.close().await,
            _ => self.disconnect(DisconnectReason::ProtocolBreach).await,
        }
    }

    /// Process a peer Hello. Returns the handlers to notify once the
    /// state lock is released.
    async fn hello_received(
        &self,
        state: &mut WireState,
        payload: &[u8],
    ) -> Result<Vec<(Arc<dyn SubProtocol>, String)>, WireError> {
        if state.peer_hello.is_some() {
            // Mutual-Hello race: both ends may announce at once; a repeat
            // announcement changes nothing.
            return Ok(Vec::new());
        }
        let hello = match HelloMessage::decode(payload) {
            Ok(hello) => hello,
            Err(err) => {
                debug!(connection = %self.id, %err, "undecodable hello");
                self.disconnect_locked(state, DisconnectReason::ProtocolBreach)
                    .await;
                return Ok(Vec::new());
            }
        };

        if hello.node_id.is_empty() {
            self.disconnect_locked(state, DisconnectReason::NullNodeIdentity)
                .await;
            return Ok(Vec::new());
        }
        if let Some(expected) = &self.expected_peer {
            if hello.node_id != expected.as_bytes() {
                self.disconnect_locked(state, DisconnectReason::UnexpectedIdentity)
                    .await;
                return Ok(Vec::new());
            }
        }
        if hello.node_id == self.local_node_id.as_bytes() {
            self.disconnect_locked(state, DisconnectReason::ConnectedToSelf)
                .await;
            return Ok(Vec::new());
        }
        if hello.p2p_version > DEVP2P_VERSION {
            self.disconnect_locked(state, DisconnectReason::IncompatibleP2pVersion)
                .await;
            return Ok(Vec::new());
        }

        let ranges = match self.build_ranges(&hello) {
            Ok(ranges) => ranges,
            Err(reason) => {
                self.disconnect_locked(state, reason).await;
                return Ok(Vec::new());
            }
        };

        debug!(
            connection = %self.id,
            client = %hello.client_id,
            negotiated = ranges.len(),
            "hello exchanged"
        );
        state.peer_hello = Some(hello);
        state.ranges = ranges;
        if !state.my_hello_sent {
            self.send_hello_locked(state).await?;
        }

        let handlers = state
            .ranges
            .iter()
            .map(|range| (self.registry.get(range.subprotocol), self.id.clone()))
            .collect();
        Ok(handlers)
    }

    /// The offset-map computation. The allocation must be identical on
    /// both peers: ranges follow the peer's capability order, each one
    /// `message-space + 1` wide with its preceding id left unassigned.
    fn build_ranges(&self, hello: &HelloMessage) -> Result<Vec<MessageRange>, DisconnectReason> {
        let mut seen_names = HashSet::new();
        let mut ranges = Vec::new();
        let mut start = BASE_MESSAGE_ID;
        for capability in &hello.capabilities {
            if !seen_names.insert(capability.name.clone()) {
                // A name advertised twice makes outbound routing
                // ambiguous; devp2p does not allow it.
                return Err(DisconnectReason::ProtocolBreach);
            }
            if let Some(index) = self
                .registry
                .find_supporting(&capability.name, capability.version)
            {
                let space = self.registry.get(index).message_space_size(capability.version);
                ranges.push(MessageRange {
                    lo: start + 1,
                    hi: start + space + 1,
                    subprotocol: index,
                    identity: SubProtocolId::of(capability.name.clone(), capability.version),
                });
                start += space + 1;
            }
        }
        Ok(ranges)
    }

    async fn send_hello_locked(&self, state: &mut WireState) -> Result<(), WireError> {
        let hello = HelloMessage {
            p2p_version: DEVP2P_VERSION,
            client_id: self.client_id.clone(),
            capabilities: self.registry.capabilities(),
            listen_port: self.advertised_port,
            node_id: self.local_node_id.as_bytes().to_vec(),
        };
        state.my_hello_sent = true;
        self.writer.write_message(HELLO_ID, &hello.encode()).await
    }

    async fn disconnect_locked(&self, state: &mut WireState, reason: DisconnectReason) {
        if state.closed {
            return;
        }
        let message = DisconnectMessage::new(reason);
        if let Err(err) = self
            .writer
            .write_message(DISCONNECT_ID, &message.encode())
            .await
        {
            warn!(connection = %self.id, %err, "failed to send disconnect");
        }
        debug!(connection = %self.id, ?reason, "disconnecting");
        self.close_locked(state);
    }

    fn close_locked(&self, state: &mut WireState) {
        if state.closed {
            return;
        }
        state.closed = true;
        // Cancels any outstanding ping completion.
        state.awaiting_pong = None;
        if let Some(handler) = state.on_close.take() {
            handler();
        }
    }

    #[cfg(test)]
    pub(crate) async fn negotiated_ranges(&self) -> Vec<(u64, u64, SubProtocolId)> {
        self.state
            .lock()
            .await
            .ranges
            .iter()
            .map(|range| (range.lo, range.hi, range.identity.clone()))
            .collect()
    }
}

fn find_range(ranges: &[MessageRange], id: u64) -> Option<&MessageRange> {
    ranges
        .binary_search_by(|range| {
            if range.hi < id {
                std::cmp::Ordering::Less
            } else if range.lo > id {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        })
        .ok()
        .map(|index| &ranges[index])
}
