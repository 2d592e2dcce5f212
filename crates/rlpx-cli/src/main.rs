// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rlpx_core::{NodeId, RlpxService, ServiceConfig, SubProtocolRegistry};
use secp256k1::{SecretKey, SECP256K1};
use tracing::info;

#[derive(Parser)]
#[command(name = "rlpx")]
#[command(about = "devp2p/RLPx reference CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a node identity and print it.
    GenIdentity,
    /// Listen for inbound RLPx connections.
    Listen {
        #[arg(long, default_value_t = 30303)]
        port: u16,
        /// Hex-encoded 32-byte secret key; generated when omitted.
        #[arg(long)]
        key: Option<String>,
        #[arg(long, default_value = "rlpx-cli/0.1")]
        client_id: String,
    },
    /// Dial a peer and measure a devp2p ping round trip.
    Dial {
        #[arg(long, value_name = "IP:PORT")]
        addr: SocketAddr,
        /// The peer's 64-byte hex node id.
        #[arg(long)]
        node_id: String,
        #[arg(long)]
        key: Option<String>,
        #[arg(long, default_value = "rlpx-cli/0.1")]
        client_id: String,
    },
}

fn load_or_generate_key(key: Option<String>) -> anyhow::Result<SecretKey> {
    match key {
        Some(hexed) => {
            let raw = hex::decode(hexed.trim_start_matches("0x")).context("decode key hex")?;
            SecretKey::from_slice(&raw).context("parse secret key")
        }
        None => {
            let (secret, _) = SECP256K1.generate_keypair(&mut rand::rngs::OsRng);
            Ok(secret)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rlpx_core=debug".parse()?)
                .add_directive("rlpx_cli=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::GenIdentity => {
            let (secret, public) = SECP256K1.generate_keypair(&mut rand::rngs::OsRng);
            println!("secret_key: {}", hex::encode(secret.secret_bytes()));
            println!("node_id: {}", NodeId::from_public_key(&public));
        }
        Command::Listen {
            port,
            key,
            client_id,
        } => {
            let secret = load_or_generate_key(key)?;
            let mut config = ServiceConfig::new(secret, client_id);
            config.bind = Some(SocketAddr::new("0.0.0.0".parse()?, port));
            config.advertised_port = port;
            let handle = RlpxService::start(config, SubProtocolRegistry::new()).await?;
            println!("node_id: {}", handle.node_id());
            println!("listening on port {}", handle.actual_port()?);

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            handle.stop().await?;
        }
        Command::Dial {
            addr,
            node_id,
            key,
            client_id,
        } => {
            let secret = load_or_generate_key(key)?;
            let peer_bytes = hex::decode(node_id.trim_start_matches("0x"))
                .context("decode peer node id hex")?;
            let peer = NodeId::from_slice(&peer_bytes)?;

            let mut config = ServiceConfig::new(secret, client_id);
            config.bind = None;
            let handle = RlpxService::start(config, SubProtocolRegistry::new()).await?;
            let connection = handle.connect(peer, addr).await?;
            println!("connected: {connection}");

            // Hello must be exchanged before ping is legal.
            let deadline = Instant::now() + Duration::from_secs(10);
            while !handle.is_active(&connection).await? {
                if Instant::now() > deadline {
                    anyhow::bail!("hello exchange timed out");
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            let started = Instant::now();
            let pong = handle.send_ping(&connection).await?;
            tokio::time::timeout(Duration::from_secs(10), pong)
                .await
                .context("pong timed out")?
                .context("connection closed before pong")?;
            println!("pong in {:?}", started.elapsed());

            handle.stop().await?;
        }
    }
    Ok(())
}
