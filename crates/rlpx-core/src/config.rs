// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;

use secp256k1::SecretKey;

/// Configuration for one [`crate::service::RlpxService`] instance.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Static secp256k1 identity key; the node id is its public key.
    pub secret_key: SecretKey,
    /// Client identifier announced in Hello, such as `rlpx-core/0.1`.
    /// Must not be blank.
    pub client_id: String,
    /// Where to listen for inbound connections. `None` runs a dial-only
    /// service. A port of 0 binds an ephemeral port, which is then also
    /// the advertised one.
    pub bind: Option<SocketAddr>,
    /// The port announced to peers in Hello, which may differ from the
    /// bound one behind port mappings.
    pub advertised_port: u16,
}

impl ServiceConfig {
    pub fn new(secret_key: SecretKey, client_id: impl Into<String>) -> Self {
        Self {
            secret_key,
            client_id: client_id.into(),
            bind: Some("0.0.0.0:30303".parse().expect("valid socket")),
            advertised_port: 30303,
        }
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.client_id.trim().is_empty() {
            anyhow::bail!("client id must contain a valid identifier");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SECP256K1;

    #[test]
    fn blank_client_id_is_rejected() {
        let (secret, _) = SECP256K1.generate_keypair(&mut rand::rngs::OsRng);
        let mut config = ServiceConfig::new(secret, "  ");
        assert!(config.validate().is_err());
        config.client_id = "rlpx-core/test".to_string();
        assert!(config.validate().is_ok());
    }
}
