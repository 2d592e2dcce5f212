// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::WireError;
use crate::framing::{EgressFrames, IngressFrames};
use crate::wire::WireConnection;

type BoxedWriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

struct EgressSink {
    frames: EgressFrames,
    io: BoxedWriteHalf,
}

/// Serialized writer for one connection.
///
/// Outbound frames may originate from the inbound worker (Pong replies),
/// application senders and broadcast loops concurrently; the egress
/// cipher and MAC state must advance in one total order, so every write
/// goes through a single lock.
#[derive(Clone)]
pub struct MessageWriter {
    inner: Arc<Mutex<EgressSink>>,
}

impl MessageWriter {
    pub fn new(frames: EgressFrames, io: BoxedWriteHalf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EgressSink { frames, io })),
        }
    }

    pub async fn write_message(&self, id: u64, payload: &[u8]) -> Result<(), WireError> {
        let mut sink = self.inner.lock().await;
        let EgressSink { frames, io } = &mut *sink;
        let frame = frames.encode(id, payload)?;
        io.write_all(&frame).await?;
        io.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut sink = self.inner.lock().await;
        let _ = sink.io.shutdown().await;
    }
}

/// Inbound worker for one connection: stitches raw deliveries into whole
/// frames and hands every complete message, in arrival order, to the
/// wire layer.
pub async fn run_ingress<R>(
    mut io: R,
    mut frames: IngressFrames,
    connection: Arc<WireConnection>,
) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        if connection.is_closed().await {
            return Ok(());
        }
        let read = io.read(&mut chunk).await?;
        if read == 0 {
            return Err(WireError::TransportClosed);
        }
        frames.feed(&chunk[..read]);
        while let Some(message) = frames.next_message()? {
            connection.message_received(message).await?;
        }
    }
}

/// Run the ingress loop to completion and close the connection with the
/// policy matching how it ended.
pub async fn drive_ingress<R>(io: R, frames: IngressFrames, connection: Arc<WireConnection>)
where
    R: AsyncRead + Unpin,
{
    match run_ingress(io, frames, Arc::clone(&connection)).await {
        Ok(()) => connection.close().await,
        Err(err) => {
            debug!(connection = %connection.id(), %err, "ingress loop ended");
            connection.close_on_error(&err).await;
        }
    }
}
