use rlp::{Rlp, RlpStream};

use crate::errors::WireError;

/// Reserved devp2p message ids. Ids 4–15 are reserved but carry no
/// meaning; subprotocol ids start above [`BASE_MESSAGE_ID`].
pub const HELLO_ID: u64 = 0;
pub const DISCONNECT_ID: u64 = 1;
pub const PING_ID: u64 = 2;
pub const PONG_ID: u64 = 3;

/// Subprotocol message-id ranges are allocated starting past this value.
pub const BASE_MESSAGE_ID: u64 = 16;

/// One demultiplexed devp2p message: the leading RLP integer of a frame
/// body and the raw payload that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RlpxMessage {
    pub id: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub version: u32,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// The devp2p Hello message (id 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub p2p_version: u32,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub listen_port: u16,
    /// 64-byte node identity. Kept as raw bytes: an empty value is a
    /// protocol-level condition the wire layer must detect, not a decode
    /// failure.
    pub node_id: Vec<u8>,
}

impl HelloMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(5);
        stream.append(&self.p2p_version);
        stream.append(&self.client_id);
        stream.begin_list(self.capabilities.len());
        for cap in &self.capabilities {
            stream.begin_list(2);
            stream.append(&cap.name);
            stream.append(&cap.version);
        }
        stream.append(&(self.listen_port as u32));
        stream.append(&self.node_id);
        stream.out().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let rlp = Rlp::new(bytes);
        let p2p_version: u32 = rlp.val_at(0)?;
        let client_id: String = rlp.val_at(1)?;
        let caps = rlp.at(2)?;
        let mut capabilities = Vec::new();
        for cap in caps.iter() {
            capabilities.push(Capability {
                name: cap.val_at(0)?,
                version: cap.val_at(1)?,
            });
        }
        let listen_port: u32 = rlp.val_at(3)?;
        if listen_port > u16::MAX as u32 {
            return Err(WireError::Decode(format!(
                "listen port {listen_port} out of range"
            )));
        }
        let node_id: Vec<u8> = rlp.val_at(4)?;
        Ok(Self {
            p2p_version,
            client_id,
            capabilities,
            listen_port: listen_port as u16,
            node_id,
        })
    }
}

/// Disconnect reasons, byte values fixed by the devp2p convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    DisconnectRequested,
    NetworkError,
    ProtocolBreach,
    UselessPeer,
    TooManyPeers,
    AlreadyConnected,
    IncompatibleP2pVersion,
    NullNodeIdentity,
    ClientQuitting,
    UnexpectedIdentity,
    ConnectedToSelf,
    PingTimeout,
    SubprotocolReason,
}

impl DisconnectReason {
    pub fn code(self) -> u8 {
        match self {
            DisconnectReason::DisconnectRequested => 0,
            DisconnectReason::NetworkError => 1,
            DisconnectReason::ProtocolBreach => 2,
            DisconnectReason::UselessPeer => 3,
            DisconnectReason::TooManyPeers => 4,
            DisconnectReason::AlreadyConnected => 5,
            DisconnectReason::IncompatibleP2pVersion => 6,
            DisconnectReason::NullNodeIdentity => 7,
            DisconnectReason::ClientQuitting => 8,
            DisconnectReason::UnexpectedIdentity => 9,
            DisconnectReason::ConnectedToSelf => 10,
            DisconnectReason::PingTimeout => 11,
            DisconnectReason::SubprotocolReason => 16,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => DisconnectReason::DisconnectRequested,
            1 => DisconnectReason::NetworkError,
            2 => DisconnectReason::ProtocolBreach,
            3 => DisconnectReason::UselessPeer,
            4 => DisconnectReason::TooManyPeers,
            5 => DisconnectReason::AlreadyConnected,
            6 => DisconnectReason::IncompatibleP2pVersion,
            7 => DisconnectReason::NullNodeIdentity,
            8 => DisconnectReason::ClientQuitting,
            9 => DisconnectReason::UnexpectedIdentity,
            10 => DisconnectReason::ConnectedToSelf,
            11 => DisconnectReason::PingTimeout,
            16 => DisconnectReason::SubprotocolReason,
            _ => return None,
        })
    }
}

/// The devp2p Disconnect message (id 1): a single-element RLP list
/// holding the reason byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectMessage {
    pub reason: DisconnectReason,
}

impl DisconnectMessage {
    pub fn new(reason: DisconnectReason) -> Self {
        Self { reason }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(1);
        stream.append(&self.reason.code());
        stream.out().to_vec()
    }

    /// Accepts both the canonical `[reason]` list and a bare integer, which
    /// some historical clients emit.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let rlp = Rlp::new(bytes);
        let code: u8 = if rlp.is_list() {
            rlp.val_at(0)?
        } else {
            rlp.as_val()?
        };
        let reason = DisconnectReason::from_code(code)
            .ok_or_else(|| WireError::Decode(format!("unknown disconnect reason {code}")))?;
        Ok(Self { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_roundtrip() {
        let hello = HelloMessage {
            p2p_version: 5,
            client_id: "rlpx-core/0.1".to_string(),
            capabilities: vec![Capability::new("eth", 63), Capability::new("les", 2)],
            listen_port: 30303,
            node_id: vec![0xAB; 64],
        };
        let decoded = HelloMessage::decode(&hello.encode()).expect("decode hello");
        assert_eq!(decoded, hello);
    }

    #[test]
    fn hello_tolerates_empty_node_id() {
        let hello = HelloMessage {
            p2p_version: 5,
            client_id: "x".to_string(),
            capabilities: vec![],
            listen_port: 0,
            node_id: vec![],
        };
        let decoded = HelloMessage::decode(&hello.encode()).expect("decode hello");
        assert!(decoded.node_id.is_empty());
    }

    #[test]
    fn hello_rejects_out_of_range_port() {
        let mut stream = RlpStream::new_list(5);
        stream.append(&5u32);
        stream.append(&"x".to_string());
        stream.begin_list(0);
        stream.append(&70_000u32);
        stream.append(&vec![0u8; 64]);
        let err = HelloMessage::decode(&stream.out()).expect_err("port must be rejected");
        assert!(matches!(err, WireError::Decode(_)));
    }

    #[test]
    fn disconnect_roundtrip_and_bare_integer() {
        let msg = DisconnectMessage::new(DisconnectReason::TooManyPeers);
        let decoded = DisconnectMessage::decode(&msg.encode()).expect("decode list form");
        assert_eq!(decoded.reason, DisconnectReason::TooManyPeers);

        let bare = rlp::encode(&DisconnectReason::ConnectedToSelf.code()).to_vec();
        let decoded = DisconnectMessage::decode(&bare).expect("decode bare form");
        assert_eq!(decoded.reason, DisconnectReason::ConnectedToSelf);
    }

    #[test]
    fn disconnect_reason_codes_match_convention() {
        assert_eq!(DisconnectReason::DisconnectRequested.code(), 0);
        assert_eq!(DisconnectReason::IncompatibleP2pVersion.code(), 6);
        assert_eq!(DisconnectReason::ConnectedToSelf.code(), 10);
        assert_eq!(DisconnectReason::SubprotocolReason.code(), 16);
        assert_eq!(
            DisconnectReason::from_code(9),
            Some(DisconnectReason::UnexpectedIdentity)
        );
        assert_eq!(DisconnectReason::from_code(12), None);
    }
}
