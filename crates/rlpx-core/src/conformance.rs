// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Full-stack scenarios: two in-process services joined by in-memory
//! duplex streams, exercising handshake, framing, Hello negotiation and
//! the application-facing surface together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use secp256k1::SECP256K1;

use crate::config::ServiceConfig;
use crate::service::{RlpxService, ServiceHandle};
use crate::subprotocol::{SubProtocol, SubProtocolId, SubProtocolMessage, SubProtocolRegistry};

struct RecordingSubProtocol {
    identity: SubProtocolId,
    space: u64,
    seen: StdMutex<Vec<(u64, Vec<u8>)>>,
    peers: AtomicUsize,
}

impl RecordingSubProtocol {
    fn new(name: &str, version: u32, space: u64) -> Arc<Self> {
        Arc::new(Self {
            identity: SubProtocolId::of(name, version),
            space,
            seen: StdMutex::new(Vec::new()),
            peers: AtomicUsize::new(0),
        })
    }

    fn seen(&self) -> Vec<(u64, Vec<u8>)> {
        self.seen.lock().expect("seen lock").clone()
    }
}

#[async_trait]
impl SubProtocol for RecordingSubProtocol {
    fn id(&self) -> SubProtocolId {
        self.identity.clone()
    }

    fn supports(&self, id: &SubProtocolId) -> bool {
        *id == self.identity
    }

    fn message_space_size(&self, _version: u32) -> u64 {
        self.space
    }

    async fn new_peer_connection(&self, _connection_id: &str) {
        self.peers.fetch_add(1, Ordering::SeqCst);
    }

    async fn handle(&self, message: SubProtocolMessage) {
        self.seen
            .lock()
            .expect("seen lock")
            .push((message.message_id, message.payload));
    }
}

async fn start_service(
    client_id: &str,
    subprotocols: Vec<Arc<RecordingSubProtocol>>,
) -> ServiceHandle {
    let (secret, _) = SECP256K1.generate_keypair(&mut rand::rngs::OsRng);
    let mut config = ServiceConfig::new(secret, client_id);
    config.bind = None;
    let mut registry = SubProtocolRegistry::new();
    for subprotocol in subprotocols {
        registry.install(subprotocol);
    }
    RlpxService::start(config, registry)
        .await
        .expect("start service")
}

/// Join two services with an in-memory stream; returns the dialler's and
/// the acceptor's connection ids.
async fn link(dialler: &ServiceHandle, acceptor: &ServiceHandle) -> (String, String) {
    let (dial_io, accept_io) = tokio::io::duplex(1 << 16);
    let acceptor_clone = acceptor.clone();
    let accept_task =
        tokio::spawn(async move { acceptor_clone.accept(accept_io).await.expect("accept") });
    let dial_id = dialler
        .connect_stream(acceptor.node_id(), dial_io)
        .await
        .expect("connect");
    let accept_id = accept_task.await.expect("join accept");

    wait_active(dialler, &dial_id).await;
    wait_active(acceptor, &accept_id).await;
    (dial_id, accept_id)
}

async fn wait_active(service: &ServiceHandle, connection_id: &str) {
    for _ in 0..200 {
        if service
            .is_active(connection_id)
            .await
            .expect("query connection")
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("connection {connection_id} never became active");
}

async fn wait_gone(service: &ServiceHandle, connection_id: &str) {
    for _ in 0..200 {
        let ids = service.connection_ids().await;
        if !ids.iter().any(|id| id == connection_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("connection {connection_id} was never torn down");
}

async fn wait_messages(subprotocol: &RecordingSubProtocol, count: usize) -> Vec<(u64, Vec<u8>)> {
    for _ in 0..200 {
        let seen = subprotocol.seen();
        if seen.len() >= count {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {count} subprotocol messages, saw {:?}", subprotocol.seen());
}

#[tokio::test]
async fn hello_exchange_activates_subprotocols_on_both_sides() {
    let dialler_eth = RecordingSubProtocol::new("eth", 63, 17);
    let acceptor_eth = RecordingSubProtocol::new("eth", 63, 17);
    let dialler = start_service("dialler/1", vec![dialler_eth.clone()]).await;
    let acceptor = start_service("acceptor/1", vec![acceptor_eth.clone()]).await;

    link(&dialler, &acceptor).await;
    assert_eq!(dialler_eth.peers.load(Ordering::SeqCst), 1);
    assert_eq!(acceptor_eth.peers.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subprotocol_messages_flow_both_ways() {
    let dialler_eth = RecordingSubProtocol::new("eth", 63, 17);
    let acceptor_eth = RecordingSubProtocol::new("eth", 63, 17);
    let dialler = start_service("dialler/1", vec![dialler_eth.clone()]).await;
    let acceptor = start_service("acceptor/1", vec![acceptor_eth.clone()]).await;
    let (dial_id, accept_id) = link(&dialler, &acceptor).await;

    let eth = SubProtocolId::of("eth", 63);
    dialler
        .send(&dial_id, &eth, 2, b"from dialler")
        .await
        .expect("dialler send");
    acceptor
        .send(&accept_id, &eth, 5, b"from acceptor")
        .await
        .expect("acceptor send");

    let seen = wait_messages(&acceptor_eth, 1).await;
    assert_eq!(seen, vec![(2, b"from dialler".to_vec())]);
    let seen = wait_messages(&dialler_eth, 1).await;
    assert_eq!(seen, vec![(5, b"from acceptor".to_vec())]);
}

#[tokio::test]
async fn ping_pong_over_the_full_stack() {
    let dialler = start_service("dialler/1", vec![]).await;
    let acceptor = start_service("acceptor/1", vec![]).await;
    let (dial_id, _) = link(&dialler, &acceptor).await;

    let pong = dialler.send_ping(&dial_id).await.expect("send ping");
    tokio::time::timeout(Duration::from_secs(5), pong)
        .await
        .expect("pong within deadline")
        .expect("latch resolves");
}

#[tokio::test]
async fn broadcast_reaches_only_negotiated_connections() {
    let eth = SubProtocolId::of("eth", 63);
    let source = start_service("source/1", vec![RecordingSubProtocol::new("eth", 63, 17)]).await;

    let first_eth = RecordingSubProtocol::new("eth", 63, 17);
    let second_eth = RecordingSubProtocol::new("eth", 63, 17);
    let first = start_service("first/1", vec![first_eth.clone()]).await;
    let second = start_service("second/1", vec![second_eth.clone()]).await;
    // The third peer does not speak eth at all.
    let third_les = RecordingSubProtocol::new("les", 2, 21);
    let third = start_service("third/1", vec![third_les.clone()]).await;

    link(&source, &first).await;
    link(&source, &second).await;
    link(&source, &third).await;

    source
        .broadcast(&eth, 0, &[0x01])
        .await
        .expect("broadcast");

    // Exactly one frame per negotiated connection, none for the outsider.
    assert_eq!(wait_messages(&first_eth, 1).await, vec![(0, vec![0x01])]);
    assert_eq!(wait_messages(&second_eth, 1).await, vec![(0, vec![0x01])]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(first_eth.seen().len(), 1);
    assert_eq!(second_eth.seen().len(), 1);
    assert!(third_les.seen().is_empty());
}

#[tokio::test]
async fn stop_disconnects_every_peer() {
    let dialler = start_service("dialler/1", vec![]).await;
    let acceptor = start_service("acceptor/1", vec![]).await;
    let (dial_id, _accept_id) = link(&dialler, &acceptor).await;

    acceptor.stop().await.expect("stop");
    assert!(acceptor.connection_ids().await.is_empty());

    // The dialler observes the ClientQuitting disconnect and tears its
    // side down too.
    wait_gone(&dialler, &dial_id).await;
}

#[tokio::test]
async fn local_disconnect_notifies_the_remote_side() {
    let dialler = start_service("dialler/1", vec![]).await;
    let acceptor = start_service("acceptor/1", vec![]).await;
    let (dial_id, accept_id) = link(&dialler, &acceptor).await;

    dialler
        .disconnect(&dial_id, crate::message::DisconnectReason::UselessPeer)
        .await
        .expect("disconnect");
    wait_gone(&dialler, &dial_id).await;
    wait_gone(&acceptor, &accept_id).await;
}
