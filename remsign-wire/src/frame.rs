//! Typed, length-prefixed packets.
//!
//! Every packet on the wire has the shape
//!
//! ```text
//! [ 4 bytes: length of remainder, little-endian ]
//! [ 1 byte : packet type                        ]
//! [ 4 bytes: message id (SinglePacket only)     ]
//! [ N bytes: payload                            ]
//! ```
//!
//! where the length prefix counts the plaintext remainder (type byte,
//! optional message id, payload). When the AEAD session is active the prefix
//! is encrypted under its own key and the remainder is sealed, but the
//! plaintext layout is unchanged; this module only deals in the plaintext
//! form.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const LEN_PREFIX_LEN: usize = 4;
pub const MSG_ID_LEN: usize = 4;

/// Upper bound on the plaintext body of one frame. A length prefix of zero
/// or anything above this closes the connection.
pub const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum Error {
    #[error("frame length prefix disagrees with the frame body")]
    Malformed,

    #[error("unknown packet type {0}")]
    UnknownType(u8),
}

/// Packet type codes. The gaps in the numbering are inherited from the wire
/// protocol and must not be compacted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Application data; established phase only.
    SinglePacket = 1,
    /// Initiator's opening message, empty payload.
    AeadSetup = 11,
    /// Responder presents its identity public key.
    AeadPresentPubKey = 12,
    /// Ephemeral public key + cipher suite from the initiator.
    AeadEncInit = 14,
    /// Ephemeral public key from the responder; the session is live after.
    AeadEncAck = 15,
    /// Either side requests a rekey of its outbound direction.
    AeadRekey = 16,
    AuthChallenge = 21,
    AuthReply = 22,
    AuthPropose = 23,
    Heartbeat = 30,
    Disconnect = 31,
}

impl PacketType {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::SinglePacket),
            11 => Some(Self::AeadSetup),
            12 => Some(Self::AeadPresentPubKey),
            14 => Some(Self::AeadEncInit),
            15 => Some(Self::AeadEncAck),
            16 => Some(Self::AeadRekey),
            21 => Some(Self::AuthChallenge),
            22 => Some(Self::AuthReply),
            23 => Some(Self::AuthPropose),
            30 => Some(Self::Heartbeat),
            31 => Some(Self::Disconnect),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether this frame type carries the 4-byte message id.
    pub fn carries_msg_id(self) -> bool {
        matches!(self, Self::SinglePacket)
    }

    /// Types that are only valid before the connection is established.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::AeadSetup
                | Self::AeadPresentPubKey
                | Self::AeadEncInit
                | Self::AeadEncAck
                | Self::AuthChallenge
                | Self::AuthReply
                | Self::AuthPropose
        )
    }
}

/// One parsed frame. `msg_id` is meaningful only for [`PacketType::SinglePacket`]
/// and zero otherwise.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub packet_type: PacketType,
    pub msg_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// A control or handshake frame (no message id on the wire).
    pub fn control(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        debug_assert!(!packet_type.carries_msg_id());
        Self {
            packet_type,
            msg_id: 0,
            payload: payload.into(),
        }
    }

    /// An established-phase application frame.
    pub fn single(msg_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type: PacketType::SinglePacket,
            msg_id,
            payload: payload.into(),
        }
    }

    /// Serialized length of the frame body (everything the length prefix
    /// counts).
    pub fn body_len(&self) -> usize {
        let msg_id = if self.packet_type.carries_msg_id() {
            MSG_ID_LEN
        } else {
            0
        };
        1 + msg_id + self.payload.len()
    }

    /// Encode the frame body: `type | [msg_id] | payload`, without the
    /// length prefix.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body_len());
        out.push(self.packet_type.to_u8());
        if self.packet_type.carries_msg_id() {
            out.extend_from_slice(&self.msg_id.to_le_bytes());
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Encode the full plaintext wire form: `len | type | [msg_id] | payload`.
    pub fn encode(&self) -> Bytes {
        let body_len = self.body_len();
        let mut out = BytesMut::with_capacity(LEN_PREFIX_LEN + body_len);
        out.put_u32_le(body_len as u32);
        out.put_u8(self.packet_type.to_u8());
        if self.packet_type.carries_msg_id() {
            out.put_u32_le(self.msg_id);
        }
        out.put_slice(&self.payload);
        out.freeze()
    }

    /// Parse a frame body (no length prefix). The caller has already read
    /// exactly the number of bytes the prefix announced.
    pub fn parse_body(body: &[u8]) -> Result<Self, Error> {
        let (&type_byte, rest) = body.split_first().ok_or(Error::Malformed)?;
        let packet_type =
            PacketType::from_u8(type_byte).ok_or(Error::UnknownType(type_byte))?;

        let (msg_id, payload) = if packet_type.carries_msg_id() {
            if rest.len() < MSG_ID_LEN {
                return Err(Error::Malformed);
            }
            let (id_bytes, payload) = rest.split_at(MSG_ID_LEN);
            let id = u32::from_le_bytes(
                id_bytes.try_into().expect("split_at returned 4 bytes"),
            );
            (id, payload)
        } else {
            (0, rest)
        };

        Ok(Self {
            packet_type,
            msg_id,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Parse a complete plaintext frame, enforcing that the length prefix
    /// matches the remainder exactly and stays within [`MAX_BODY_LEN`].
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < LEN_PREFIX_LEN {
            return Err(Error::Malformed);
        }
        let (prefix, body) = buf.split_at(LEN_PREFIX_LEN);
        let declared = u32::from_le_bytes(
            prefix.try_into().expect("split_at returned 4 bytes"),
        );
        if declared == 0 || declared > MAX_BODY_LEN {
            return Err(Error::Malformed);
        }
        if declared as usize != body.len() {
            return Err(Error::Malformed);
        }
        Self::parse_body(body)
    }
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, collection::vec, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn encode_parse_roundtrip() {
        proptest!(|(
            msg_id in any::<u32>(),
            payload in vec(any::<u8>(), 0..2048),
        )| {
            let frame = Frame::single(msg_id, payload);
            let parsed = Frame::parse(&frame.encode()).unwrap();
            prop_assert_eq!(parsed, frame);
        });
    }

    #[test]
    fn control_frames_have_no_msg_id() {
        let frame = Frame::control(PacketType::Heartbeat, Bytes::new());
        let encoded = frame.encode();
        // len(4) + type(1), nothing else
        assert_eq!(encoded.len(), 5);
        assert_eq!(Frame::parse(&encoded).unwrap(), frame);
    }

    #[test]
    fn single_packet_layout() {
        let frame = Frame::single(0xaabbccdd, vec![0xee, 0xff]);
        let encoded = frame.encode();
        assert_eq!(&encoded[..4], &7u32.to_le_bytes());
        assert_eq!(encoded[4], 1);
        assert_eq!(&encoded[5..9], &0xaabbccddu32.to_le_bytes());
        assert_eq!(&encoded[9..], &[0xee, 0xff]);
    }

    #[test]
    fn zero_length_prefix_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(Frame::parse(&buf), Err(Error::Malformed));

        // Even with trailing bytes present.
        buf.push(30);
        assert_eq!(Frame::parse(&buf), Err(Error::Malformed));
    }

    #[test]
    fn oversized_prefix_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_BODY_LEN + 1).to_le_bytes());
        buf.push(30);
        assert_eq!(Frame::parse(&buf), Err(Error::Malformed));
    }

    #[test]
    fn prefix_body_mismatch_rejected() {
        let frame = Frame::control(PacketType::Heartbeat, vec![1, 2, 3]);
        let mut encoded = frame.encode().to_vec();

        // Truncated body.
        encoded.pop();
        assert_eq!(Frame::parse(&encoded), Err(Error::Malformed));

        // Extra trailing byte.
        encoded.extend_from_slice(&[3, 4]);
        assert_eq!(Frame::parse(&encoded), Err(Error::Malformed));
    }

    #[test]
    fn unknown_type_rejected() {
        for code in [0u8, 2, 10, 13, 17, 24, 29, 32, 255] {
            let mut buf = Vec::new();
            buf.extend_from_slice(&1u32.to_le_bytes());
            buf.push(code);
            assert_eq!(Frame::parse(&buf), Err(Error::UnknownType(code)));
        }
    }

    #[test]
    fn all_table_codes_parse() {
        for (code, expected) in [
            (1, PacketType::SinglePacket),
            (11, PacketType::AeadSetup),
            (12, PacketType::AeadPresentPubKey),
            (14, PacketType::AeadEncInit),
            (15, PacketType::AeadEncAck),
            (16, PacketType::AeadRekey),
            (21, PacketType::AuthChallenge),
            (22, PacketType::AuthReply),
            (23, PacketType::AuthPropose),
            (30, PacketType::Heartbeat),
            (31, PacketType::Disconnect),
        ] {
            assert_eq!(PacketType::from_u8(code), Some(expected));
            assert_eq!(expected.to_u8(), code);
        }
    }
}
