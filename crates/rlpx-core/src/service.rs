// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use secp256k1::{SecretKey, SECP256K1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::handshake::{handshake_initiator, handshake_responder, SessionSecrets};
use crate::ids::{random_connection_id, NodeId};
use crate::message::DisconnectReason;
use crate::session::{self, MessageWriter};
use crate::subprotocol::{SubProtocolId, SubProtocolRegistry};
use crate::wire::WireConnection;

/// Owner of the connection registry: dials and accepts peers, routes
/// application sends to live connections, and tears everything down on
/// stop.
pub struct RlpxService;

impl RlpxService {
    pub async fn start(
        config: ServiceConfig,
        registry: SubProtocolRegistry,
    ) -> anyhow::Result<ServiceHandle> {
        config.validate()?;
        let local_public = config.secret_key.public_key(SECP256K1);
        let inner = Arc::new(ServiceInner {
            started: AtomicBool::new(true),
            secret_key: config.secret_key,
            local_node_id: NodeId::from_public_key(&local_public),
            client_id: config.client_id,
            listen_port: config.bind.map(|addr| addr.port()),
            advertised_port: config.advertised_port,
            actual_port: AtomicU16::new(0),
            registry: Arc::new(registry),
            connections: Arc::new(RwLock::new(HashMap::new())),
            accept_task: StdMutex::new(None),
        });

        if let Some(bind) = config.bind {
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("bind rlpx listener on {bind}"))?;
            let actual = listener.local_addr().context("listener local addr")?.port();
            inner.actual_port.store(actual, Ordering::SeqCst);
            info!(
                port = actual,
                node = %inner.local_node_id.fingerprint(),
                "rlpx service listening"
            );
            let task = tokio::spawn(accept_loop(Arc::clone(&inner), listener));
            *inner.accept_task.lock().expect("accept task lock") = Some(task);
        }

        Ok(ServiceHandle { inner })
    }
}

struct ServiceInner {
    started: AtomicBool,
    secret_key: SecretKey,
    local_node_id: NodeId,
    client_id: String,
    listen_port: Option<u16>,
    advertised_port: u16,
    actual_port: AtomicU16,
    registry: Arc<SubProtocolRegistry>,
    connections: Arc<RwLock<HashMap<String, Arc<WireConnection>>>>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a running service.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle").finish_non_exhaustive()
    }
}

impl ServiceHandle {
    pub fn node_id(&self) -> NodeId {
        self.inner.local_node_id
    }

    /// The port the listener actually bound.
    pub fn actual_port(&self) -> anyhow::Result<u16> {
        self.ensure_started()?;
        let port = self.inner.actual_port.load(Ordering::SeqCst);
        if port == 0 {
            anyhow::bail!("the service has no listener");
        }
        Ok(port)
    }

    /// The port announced in Hello messages. Falls back to the bound port
    /// when the configured listen port was 0.
    pub fn advertised_port(&self) -> anyhow::Result<u16> {
        self.ensure_started()?;
        Ok(advertised_port_value(&self.inner))
    }

    /// Dial a peer whose node id is known a priori and run the outbound
    /// handshake; on success the connection is registered and our Hello
    /// is sent proactively.
    pub async fn connect(&self, peer: NodeId, addr: SocketAddr) -> anyhow::Result<String> {
        self.ensure_started()?;
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("dial {addr}"))?;
        self.connect_stream(peer, stream).await
    }

    /// Outbound handshake over an already-established duplex stream.
    pub async fn connect_stream<S>(&self, peer: NodeId, mut io: S) -> anyhow::Result<String>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.ensure_started()?;
        let remote_public = peer.to_public_key()?;
        let secrets = handshake_initiator(&mut io, &self.inner.secret_key, &remote_public).await?;
        let connection = register_connection(&self.inner, io, secrets, Some(peer)).await;
        connection.handle_connection_start().await?;
        info!(
            connection = connection.id(),
            peer = %peer.fingerprint(),
            "outbound connection established"
        );
        Ok(connection.id().to_string())
    }

    /// Responder handshake over an incoming duplex stream. The peer's
    /// identity is learned from its Hello.
    pub async fn accept<S>(&self, io: S) -> anyhow::Result<String>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.ensure_started()?;
        let connection = accept_connection(Arc::clone(&self.inner), io).await?;
        Ok(connection)
    }

    /// Send one subprotocol message on a specific connection.
    pub async fn send(
        &self,
        connection_id: &str,
        subprotocol: &SubProtocolId,
        message_id: u64,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        self.ensure_started()?;
        let connection = self
            .connection(connection_id)
            .await
            .with_context(|| format!("unknown connection {connection_id}"))?;
        connection
            .send_subprotocol_message(subprotocol, message_id, payload)
            .await?;
        Ok(())
    }

    /// Send one subprotocol message to every live connection that
    /// negotiated the subprotocol; others are skipped.
    pub async fn broadcast(
        &self,
        subprotocol: &SubProtocolId,
        message_id: u64,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        self.ensure_started()?;
        let snapshot: Vec<Arc<WireConnection>> = {
            let connections = self.inner.connections.read().await;
            connections.values().cloned().collect()
        };
        for connection in snapshot {
            if !connection.supports_subprotocol(subprotocol).await {
                continue;
            }
            if let Err(err) = connection
                .send_subprotocol_message(subprotocol, message_id, payload)
                .await
            {
                warn!(connection = connection.id(), %err, "broadcast send failed");
            }
        }
        Ok(())
    }

    /// Ping a connection; the returned completion resolves when the next
    /// Pong arrives and errors if the connection closes first.
    pub async fn send_ping(&self, connection_id: &str) -> anyhow::Result<oneshot::Receiver<()>> {
        self.ensure_started()?;
        let connection = self
            .connection(connection_id)
            .await
            .with_context(|| format!("unknown connection {connection_id}"))?;
        Ok(connection.send_ping().await?)
    }

    pub async fn disconnect(
        &self,
        connection_id: &str,
        reason: DisconnectReason,
    ) -> anyhow::Result<()> {
        self.ensure_started()?;
        let connection = self
            .connection(connection_id)
            .await
            .with_context(|| format!("unknown connection {connection_id}"))?;
        connection.disconnect(reason).await;
        Ok(())
    }

    /// Whether the connection finished its Hello exchange and is still
    /// live. Unknown ids report `false`.
    pub async fn is_active(&self, connection_id: &str) -> anyhow::Result<bool> {
        self.ensure_started()?;
        match self.connection(connection_id).await {
            Some(connection) => {
                Ok(!connection.is_closed().await && connection.peer_hello().await.is_some())
            }
            None => Ok(false),
        }
    }

    pub async fn connection_ids(&self) -> Vec<String> {
        self.inner.connections.read().await.keys().cloned().collect()
    }

    /// Disconnect every peer with `ClientQuitting` and stop accepting.
    /// Idempotent.
    pub async fn stop(&self) -> anyhow::Result<()> {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.inner.accept_task.lock().expect("accept task lock").take() {
            task.abort();
        }
        let drained: Vec<Arc<WireConnection>> = {
            let mut connections = self.inner.connections.write().await;
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for connection in drained {
            connection
                .disconnect(DisconnectReason::ClientQuitting)
                .await;
        }
        info!("rlpx service stopped");
        Ok(())
    }

    fn ensure_started(&self) -> anyhow::Result<()> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(crate::errors::WireError::ServiceNotStarted.into());
        }
        Ok(())
    }

    async fn connection(&self, connection_id: &str) -> Option<Arc<WireConnection>> {
        self.inner
            .connections
            .read()
            .await
            .get(connection_id)
            .cloned()
    }
}

fn advertised_port_value(inner: &ServiceInner) -> u16 {
    match inner.listen_port {
        Some(0) => inner.actual_port.load(Ordering::SeqCst),
        _ => inner.advertised_port,
    }
}

async fn accept_loop(inner: Arc<ServiceInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    match accept_connection(inner, stream).await {
                        Ok(connection) => {
                            debug!(%remote, connection, "inbound connection registered")
                        }
                        Err(err) => debug!(%remote, %err, "inbound connection failed"),
                    }
                });
            }
            Err(err) => {
                warn!(%err, "accept failed");
            }
        }
    }
}

async fn accept_connection<S>(inner: Arc<ServiceInner>, mut io: S) -> anyhow::Result<String>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (secrets, remote_public) = handshake_responder(&mut io, &inner.secret_key).await?;
    if !inner.started.load(Ordering::SeqCst) {
        return Err(crate::errors::WireError::ServiceNotStarted.into());
    }
    debug!(
        peer = %NodeId::from_public_key(&remote_public).fingerprint(),
        "responder handshake complete"
    );
    // The dialler announces first; our Hello goes out when theirs lands.
    let connection = register_connection(&inner, io, secrets, None).await;
    Ok(connection.id().to_string())
}

async fn register_connection<S>(
    inner: &Arc<ServiceInner>,
    io: S,
    secrets: SessionSecrets,
    expected_peer: Option<NodeId>,
) -> Arc<WireConnection>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let (egress, ingress) = secrets.split();
    let writer = MessageWriter::new(egress, Box::new(write_half));
    let id = random_connection_id();

    let on_close = {
        let connections = Arc::clone(&inner.connections);
        let writer = writer.clone();
        let id = id.clone();
        Box::new(move || {
            tokio::spawn(async move {
                connections.write().await.remove(&id);
                writer.shutdown().await;
            });
        })
    };

    let connection = Arc::new(WireConnection::new(
        id.clone(),
        inner.local_node_id,
        expected_peer,
        writer,
        Arc::clone(&inner.registry),
        inner.client_id.clone(),
        advertised_port_value(inner),
        on_close,
    ));
    inner
        .connections
        .write()
        .await
        .insert(id, Arc::clone(&connection));
    tokio::spawn(session::drive_ingress(
        read_half,
        ingress,
        Arc::clone(&connection),
    ));
    connection
}
