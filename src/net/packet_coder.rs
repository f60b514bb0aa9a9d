//! Framing of messages on the wire:
//!
//! ```ascii
//! +------------+-------------------+-----------------------------+
//! | length u32 | protocol_type u32 | sub-header | body           |
//! +------------+-------------------+-----------------------------+
//! ```
//!
//! Both integers are big endian. `length` counts the bytes after the packet header. The low
//!  byte of `protocol_type` selects the Thrift encoding, bit 8 marks a Snappy (raw format)
//!  compressed payload, in which case `length` is the compressed length.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, trace, warn};

use crate::codec::binary::BinaryProtocol;
use crate::codec::compact::CompactProtocol;
use crate::codec::{Protocol, ProtocolKind, ProtocolLimits, ThriftStruct};
use crate::config::NetworkConfig;
use crate::error::CoderError;
use crate::message::control::{SHAKE_HAND_REQ, SHAKE_HAND_RESP, VER_REQ, VER_RESP};
use crate::message::envelope::{MessageBody, MessageEnvelope};
use crate::message::header::BaseHeader;
use crate::message::registry::MessageRegistry;

pub const PACKET_HEADER_LEN: usize = 8;
pub const COMPRESS_FLAG: u32 = 0x0100;
pub const MIN_MSG_LEN_TO_COMPRESS: usize = 256;

/// Messages that are always dispatched locally, regardless of their `dest_id`
pub const LOCAL_ONLY_MESSAGES: [&str; 7] = [
    VER_REQ,
    VER_RESP,
    SHAKE_HAND_REQ,
    SHAKE_HAND_RESP,
    "get_peer_nodes_req",
    "get_peer_nodes_resp",
    "service_broadcast_req",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u32,
    pub protocol_type: u32,
}

impl PacketHeader {
    pub fn ser(&self, dst: &mut [u8]) {
        dst[..4].copy_from_slice(&self.length.to_be_bytes());
        dst[4..PACKET_HEADER_LEN].copy_from_slice(&self.protocol_type.to_be_bytes());
    }

    /// consumes the header from the front of `buf`
    pub fn deser(buf: &mut BytesMut) -> Option<PacketHeader> {
        let result = PacketHeader::peek(buf)?;
        buf.advance(PACKET_HEADER_LEN);
        Some(result)
    }

    pub fn peek(buf: &[u8]) -> Option<PacketHeader> {
        if buf.len() < PACKET_HEADER_LEN {
            return None;
        }
        let mut raw = &buf[..PACKET_HEADER_LEN];
        Some(PacketHeader {
            length: raw.get_u32(),
            protocol_type: raw.get_u32(),
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.protocol_type & COMPRESS_FLAG != 0
    }

    pub fn protocol_kind(&self) -> Result<ProtocolKind, CoderError> {
        ProtocolKind::try_from((self.protocol_type & 0xff) as u8)
            .map_err(|_| CoderError::UnknownProtocol(self.protocol_type))
    }
}

/// How a channel encodes outgoing messages, as negotiated with its peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeContext {
    pub proto: ProtocolKind,
    pub compress: bool,
}

impl Default for EncodeContext {
    fn default() -> Self {
        EncodeContext {
            proto: ProtocolKind::Binary,
            compress: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PacketCoder {
    registry: Arc<MessageRegistry>,
    limits: ProtocolLimits,
    max_frame_len: usize,
}

impl PacketCoder {
    pub fn new(registry: Arc<MessageRegistry>, config: &NetworkConfig) -> PacketCoder {
        PacketCoder {
            registry,
            limits: config.limits(),
            max_frame_len: config.max_frame_len,
        }
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    fn protocol<'b>(&self, kind: ProtocolKind, buf: &'b mut BytesMut) -> Box<dyn Protocol + 'b> {
        match kind {
            ProtocolKind::Binary => Box::new(BinaryProtocol::new(buf, self.limits)),
            ProtocolKind::Compact => Box::new(CompactProtocol::new(buf, self.limits)),
        }
    }

    /// Decodes all complete frames at the start of `buf`, leaving a trailing partial frame
    ///  in place. Frames with a message name that has no decoder are skipped; all other
    ///  errors are fatal for the stream.
    pub fn decode_frames(&self, buf: &mut BytesMut, local_node_id: &str) -> Result<Vec<MessageEnvelope>, CoderError> {
        let mut result = Vec::new();

        while let Some(header) = PacketHeader::peek(buf) {
            let len = header.length as usize;
            if len > self.max_frame_len {
                return Err(CoderError::FrameTooLarge { len, max: self.max_frame_len });
            }
            if buf.len() < PACKET_HEADER_LEN + len {
                buf.reserve(PACKET_HEADER_LEN + len - buf.len());
                break;
            }

            let frame = buf.split_to(PACKET_HEADER_LEN + len);
            match self.decode(frame, local_node_id) {
                Ok(msg) => result.push(msg),
                Err(CoderError::UnknownMessage(name)) => warn!("skipping message {} without registered decoder", name),
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    /// Decodes a single complete frame, including its packet header.
    pub fn decode(&self, mut frame: BytesMut, local_node_id: &str) -> Result<MessageEnvelope, CoderError> {
        let Some(mut header) = PacketHeader::deser(&mut frame) else {
            return Err(CoderError::LengthMismatch { declared: PACKET_HEADER_LEN, consumed: frame.len() });
        };
        if header.length as usize != frame.len() {
            return Err(CoderError::LengthMismatch { declared: header.length as usize, consumed: frame.len() });
        }

        if header.is_compressed() {
            let decompressed_len = snap::raw::decompress_len(&frame)?;
            if decompressed_len > self.max_frame_len {
                return Err(CoderError::FrameTooLarge { len: decompressed_len, max: self.max_frame_len });
            }
            let decompressed = snap::raw::Decoder::new().decompress_vec(&frame)?;
            trace!("decompressed frame from {} to {} bytes", frame.len(), decompressed.len());
            frame = BytesMut::from(decompressed.as_slice());
            header.length = frame.len() as u32;
            header.protocol_type &= !0xff00;
        }

        let len = header.length as usize;
        let mut proto = self.protocol(header.protocol_kind()?, &mut frame);
        let base = BaseHeader::read(proto.as_mut())?;

        let result = if self.is_fast_forward(&base, local_node_id) {
            debug!(msg_name = %base.msg_name, dest_id = ?base.dest_id(), "fast forwarding message");
            let raw = proto.take_remaining();
            MessageEnvelope::forward(base, raw)
        }
        else {
            let body = self.registry.decode_body(&base.msg_name, proto.as_mut())?;
            MessageEnvelope::new(base, body)
        };

        let consumed = len - proto.remaining();
        if consumed != len {
            return Err(CoderError::LengthMismatch { declared: len, consumed });
        }
        Ok(result)
    }

    fn is_fast_forward(&self, header: &BaseHeader, local_node_id: &str) -> bool {
        if local_node_id.is_empty() || LOCAL_ONLY_MESSAGES.contains(&header.msg_name.as_str()) {
            return false;
        }
        match header.dest_id() {
            Some(dest_id) => !dest_id.contains(local_node_id),
            None => false,
        }
    }

    /// Appends one frame for `msg` to `out`, returning the number of bytes written. On error,
    ///  `out` is left as it was.
    pub fn encode(&self, msg: &MessageEnvelope, ctx: EncodeContext, out: &mut BytesMut) -> Result<usize, CoderError> {
        let start = out.len();
        let result = self.do_encode(msg, ctx, out, start);
        if result.is_err() {
            out.truncate(start);
        }
        result
    }

    fn do_encode(&self, msg: &MessageEnvelope, ctx: EncodeContext, out: &mut BytesMut, start: usize) -> Result<usize, CoderError> {
        out.put_bytes(0, PACKET_HEADER_LEN);
        let body_start = out.len();

        {
            let mut proto = self.protocol(ctx.proto, out);
            msg.header.write(proto.as_mut())?;
            match &msg.body {
                MessageBody::Forward(raw) => proto.append_raw(raw),
                body => self.registry.encode_body(&msg.header.msg_name, body, proto.as_mut())?,
            }
        }

        let len = out.len() - body_start;
        if len > self.max_frame_len {
            return Err(CoderError::FrameTooLarge { len, max: self.max_frame_len });
        }

        let mut header = PacketHeader {
            length: len as u32,
            protocol_type: u8::from(ctx.proto) as u32,
        };

        if ctx.compress && len >= MIN_MSG_LEN_TO_COMPRESS {
            let compressed = snap::raw::Encoder::new().compress_vec(&out[body_start..])?;
            trace!("compressed {} from {} to {} bytes", msg.header.msg_name, len, compressed.len());
            out.truncate(body_start);
            out.extend_from_slice(&compressed);
            header.length = compressed.len() as u32;
            header.protocol_type |= COMPRESS_FLAG;
        }

        header.ser(&mut out[start..body_start]);
        Ok(out.len() - start)
    }
}
