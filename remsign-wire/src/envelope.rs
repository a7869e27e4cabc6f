//! The request/reply envelope carried inside established `SinglePacket`
//! frames:
//!
//! ```text
//! [ 2 bytes: message type, little-endian  ]
//! [ 4 bytes: request id, little-endian    ]
//! [ 4 bytes: payload length, little-endian ]
//! [ N bytes: payload                       ]
//! ```
//!
//! Request ids are allocated by the requesting side and echoed in the reply.
//! Id zero is reserved for server-pushed events that correlate to no request.
//! The payload encoding is owned by `remsign-signer` (JSON); this module only
//! moves bytes.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const HEADER_LEN: usize = 2 + 4 + 4;

/// Request id used by server-pushed events.
pub const EVENT_REQUEST_ID: u32 = 0;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("malformed request envelope")]
pub struct MalformedEnvelope;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub msg_type: u16,
    pub request_id: u32,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(
        msg_type: u16,
        request_id: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            msg_type,
            request_id,
            payload: payload.into(),
        }
    }

    /// An envelope for a server-pushed event (request id 0).
    pub fn event(msg_type: u16, payload: impl Into<Bytes>) -> Self {
        Self::new(msg_type, EVENT_REQUEST_ID, payload)
    }

    pub fn is_event(&self) -> bool {
        self.request_id == EVENT_REQUEST_ID
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        out.put_u16_le(self.msg_type);
        out.put_u32_le(self.request_id);
        out.put_u32_le(self.payload.len() as u32);
        out.put_slice(&self.payload);
        out.freeze()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, MalformedEnvelope> {
        if buf.len() < HEADER_LEN {
            return Err(MalformedEnvelope);
        }
        let msg_type = u16::from_le_bytes([buf[0], buf[1]]);
        let request_id = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let payload_len =
            u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;

        let payload = &buf[HEADER_LEN..];
        if payload.len() != payload_len {
            return Err(MalformedEnvelope);
        }

        Ok(Self {
            msg_type,
            request_id,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}
