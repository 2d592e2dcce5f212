// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr64BE;
use rlp::{Rlp, RlpStream};

use crate::errors::WireError;
use crate::mac::MacChain;
use crate::message::RlpxMessage;

type Aes256Ctr = Ctr64BE<Aes256>;

/// The frame length field is 3 bytes.
pub const MAX_FRAME_BODY_BYTES: usize = (1 << 24) - 1;

const HEADER_LEN: usize = 16;
const MAC_LEN: usize = 16;

/// The AES-CTR keystream runs with a zero IV and is continuous across
/// every frame in a direction. It is never reset.
fn frame_cipher(aes_secret: &[u8; 32]) -> Aes256Ctr {
    Aes256Ctr::new(aes_secret.into(), &[0u8; 16].into())
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(16) * 16
}

/// Encodes outgoing messages into RLPx frames:
/// `header-ct || header-mac || body-ct || body-mac`.
pub struct EgressFrames {
    aes: Aes256Ctr,
    mac: MacChain,
}

impl EgressFrames {
    pub(crate) fn new(aes_secret: &[u8; 32], mac: MacChain) -> Self {
        Self {
            aes: frame_cipher(aes_secret),
            mac,
        }
    }

    pub fn encode(&mut self, id: u64, payload: &[u8]) -> Result<Vec<u8>, WireError> {
        let mut body = rlp::encode(&id).to_vec();
        body.extend_from_slice(payload);
        let body_len = body.len();
        if body_len > MAX_FRAME_BODY_BYTES {
            return Err(WireError::Decode(format!(
                "frame body of {body_len} bytes exceeds the 24-bit length field"
            )));
        }
        body.resize(padded_len(body_len), 0);

        // 3-byte big-endian unpadded length, then RLP([0]) header-data,
        // zero padded to 16 bytes.
        let mut header = [0u8; HEADER_LEN];
        header[0] = (body_len >> 16) as u8;
        header[1] = (body_len >> 8) as u8;
        header[2] = body_len as u8;
        let mut header_data = RlpStream::new_list(1);
        header_data.append(&0u8);
        let header_data = header_data.out();
        header[3..3 + header_data.len()].copy_from_slice(&header_data);

        self.aes.apply_keystream(&mut header);
        let header_mac = self.mac.header_mac(&header);
        self.aes.apply_keystream(&mut body);
        let body_mac = self.mac.body_mac(&body);

        let mut frame = Vec::with_capacity(HEADER_LEN + MAC_LEN + body.len() + MAC_LEN);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&header_mac);
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&body_mac);
        Ok(frame)
    }
}

/// Reassembles the inbound byte stream into whole frames and decodes
/// them one message at a time.
///
/// A frame header is verified and decrypted as soon as 32 bytes are
/// buffered; the declared body length is then remembered so the cipher
/// and MAC state advance exactly once per frame even when the body
/// arrives in many deliveries.
pub struct IngressFrames {
    aes: Aes256Ctr,
    mac: MacChain,
    buf: Vec<u8>,
    pending_body_len: Option<usize>,
}

impl IngressFrames {
    pub(crate) fn new(aes_secret: &[u8; 32], mac: MacChain) -> Self {
        Self {
            aes: frame_cipher(aes_secret),
            mac,
            buf: Vec::new(),
            pending_body_len: None,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next buffered message, or `None` when the buffer does
    /// not yet hold a whole frame. MAC and decode failures are fatal.
    pub fn next_message(&mut self) -> Result<Option<RlpxMessage>, WireError> {
        match self.decode_one() {
            Ok(message) => Ok(Some(message)),
            Err(WireError::ShortFrame(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Decode exactly one frame, failing with [`WireError::ShortFrame`]
    /// when the buffer holds less than the frame declares.
    pub fn decode_one(&mut self) -> Result<RlpxMessage, WireError> {
        if self.pending_body_len.is_none() {
            if self.buf.len() < HEADER_LEN + MAC_LEN {
                return Err(WireError::ShortFrame(HEADER_LEN + MAC_LEN - self.buf.len()));
            }
            let mut header = [0u8; HEADER_LEN];
            header.copy_from_slice(&self.buf[..HEADER_LEN]);
            let expected = self.mac.header_mac(&header);
            if expected[..] != self.buf[HEADER_LEN..HEADER_LEN + MAC_LEN] {
                return Err(WireError::MacMismatch);
            }
            self.aes.apply_keystream(&mut header);
            let body_len =
                ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
            self.buf.drain(..HEADER_LEN + MAC_LEN);
            self.pending_body_len = Some(body_len);
        }

        let body_len = self.pending_body_len.unwrap_or_default();
        let padded = padded_len(body_len);
        if self.buf.len() < padded + MAC_LEN {
            return Err(WireError::ShortFrame(padded + MAC_LEN - self.buf.len()));
        }
        let mut body = self.buf[..padded].to_vec();
        let expected = self.mac.body_mac(&body);
        if expected[..] != self.buf[padded..padded + MAC_LEN] {
            return Err(WireError::MacMismatch);
        }
        self.aes.apply_keystream(&mut body);
        self.buf.drain(..padded + MAC_LEN);
        self.pending_body_len = None;
        body.truncate(body_len);

        // The first RLP item of the body is the message id; everything
        // after it is the opaque payload.
        let rlp = Rlp::new(&body);
        let info = rlp.payload_info()?;
        let id_len = info.header_len + info.value_len;
        let id: u64 = Rlp::new(&body[..id_len]).as_val()?;
        let payload = body[id_len..].to_vec();
        Ok(RlpxMessage { id, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn synced_pair() -> (EgressFrames, IngressFrames) {
        let aes_secret = [0x11u8; 32];
        let mac_secret = [0x22u8; 32];
        let nonce = [0x33u8; 32];
        let egress = EgressFrames::new(
            &aes_secret,
            MacChain::seeded(mac_secret, &nonce, b"handshake"),
        );
        let ingress = IngressFrames::new(
            &aes_secret,
            MacChain::seeded(mac_secret, &nonce, b"handshake"),
        );
        (egress, ingress)
    }

    #[test]
    fn frames_roundtrip_with_continuous_cipher_state() {
        let (mut egress, mut ingress) = synced_pair();

        // More than one frame per direction: the CTR keystream and MAC
        // chain must carry over between frames.
        let messages = [
            RlpxMessage {
                id: 0,
                payload: b"hello".to_vec(),
            },
            RlpxMessage {
                id: 3,
                payload: vec![],
            },
            RlpxMessage {
                id: 21,
                payload: vec![0xAA; 100],
            },
        ];
        for message in &messages {
            let frame = egress.encode(message.id, &message.payload).expect("encode");
            ingress.feed(&frame);
            let decoded = ingress
                .next_message()
                .expect("decode")
                .expect("whole frame buffered");
            assert_eq!(&decoded, message);
        }
    }

    #[test]
    fn partial_delivery_waits_without_advancing_twice() {
        let (mut egress, mut ingress) = synced_pair();
        let frame = egress.encode(16, &[7u8; 40]).expect("encode");

        let mut decoded = None;
        for chunk in frame.chunks(7) {
            ingress.feed(chunk);
            // Not an error until the declared size is buffered.
            if let Some(message) = ingress.next_message().expect("no fatal error") {
                decoded = Some(message);
            }
        }
        let message = decoded.expect("complete frame decoded");
        assert_eq!(message.id, 16);
        assert_eq!(message.payload, vec![7u8; 40]);
    }

    #[test]
    fn decode_one_reports_missing_byte_count() {
        let (mut egress, mut ingress) = synced_pair();
        let frame = egress.encode(2, &[]).expect("encode");
        ingress.feed(&frame[..10]);
        match ingress.decode_one() {
            Err(WireError::ShortFrame(missing)) => assert_eq!(missing, 22),
            other => panic!("expected short frame, got {other:?}"),
        }
    }

    #[test]
    fn tampered_header_ciphertext_fails_mac() {
        let (mut egress, mut ingress) = synced_pair();
        let mut frame = egress.encode(2, b"payload").expect("encode");
        frame[4] ^= 0x01;
        ingress.feed(&frame);
        assert!(matches!(
            ingress.next_message(),
            Err(WireError::MacMismatch)
        ));
    }

    #[test]
    fn tampered_header_mac_fails() {
        let (mut egress, mut ingress) = synced_pair();
        let mut frame = egress.encode(2, b"payload").expect("encode");
        frame[17] ^= 0x80;
        ingress.feed(&frame);
        assert!(matches!(
            ingress.next_message(),
            Err(WireError::MacMismatch)
        ));
    }

    #[test]
    fn tampered_body_ciphertext_fails_mac() {
        let (mut egress, mut ingress) = synced_pair();
        let mut frame = egress.encode(2, b"payload").expect("encode");
        frame[33] ^= 0x01;
        ingress.feed(&frame);
        assert!(matches!(
            ingress.next_message(),
            Err(WireError::MacMismatch)
        ));
    }

    #[test]
    fn tampered_body_mac_fails() {
        let (mut egress, mut ingress) = synced_pair();
        let frame = egress.encode(2, b"payload").expect("encode");
        let last = frame.len() - 1;
        let mut frame = frame;
        frame[last] ^= 0x40;
        ingress.feed(&frame);
        assert!(matches!(
            ingress.next_message(),
            Err(WireError::MacMismatch)
        ));
    }

    #[test]
    fn desynchronized_receiver_rejects_first_frame() {
        let (mut egress, _) = synced_pair();
        // Fresh pair whose ingress never saw the first frame: its MAC
        // chain is one frame behind and must reject the second.
        let _first = egress.encode(0, b"first").expect("encode first");
        let second = egress.encode(0, b"second").expect("encode second");
        let (_, mut stale_ingress) = synced_pair();
        stale_ingress.feed(&second);
        assert!(matches!(
            stale_ingress.next_message(),
            Err(WireError::MacMismatch)
        ));
    }

    #[test]
    fn body_padding_is_stripped() {
        let (mut egress, mut ingress) = synced_pair();
        // 1-byte payload: the padded body is 16 bytes, the header length
        // field must restore the exact payload.
        let frame = egress.encode(5, &[0x42]).expect("encode");
        ingress.feed(&frame);
        let message = ingress.next_message().expect("decode").expect("frame");
        assert_eq!(message.payload, vec![0x42]);
    }

    #[test]
    fn oversized_body_is_rejected_before_encryption() {
        let (mut egress, _) = synced_pair();
        let payload = vec![0u8; MAX_FRAME_BODY_BYTES];
        assert!(egress.encode(0, &payload).is_err());
    }
}
