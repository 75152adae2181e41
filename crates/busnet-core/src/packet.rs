//! Network packet types and wire codec.
//!
//! ## Wire format
//!
//! ```text
//! ┌────────┬────────┬─────────────┬─────────────┬──────────┬────────┬───────────┐
//! │ type   │ hops   │ dstAddress  │ srcAddress  │ checksum │ length │ payload   │
//! │ (1B)   │ (1B)   │ (2B, BE)    │ (2B, BE)    │ (1B)     │ (1B)   │ (0-200B)  │
//! └────────┴────────┴─────────────┴─────────────┴──────────┴────────┴───────────┘
//! ```
//!
//! The checksum is the sum of every byte in the encoded packet modulo 256,
//! with the checksum byte itself counted as zero. Decoders recompute it the
//! same way and compare.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed header size in bytes.
pub const PACKET_HEADER_LEN: usize = 8;

/// Maximum payload a single packet can carry.
pub const MAX_PAYLOAD_LEN: usize = 200;

/// Destination address that every node accepts.
pub const BROADCAST_ADDRESS: u16 = 0xFFFF;

/// Protocol generation of this stack. Reserved as a checksum salt so that
/// incompatible generations cannot talk to each other; the current checksum
/// does not fold it in, for compatibility with deployed peers.
pub const NETWORK_VERSION: u8 = 2;

/// Byte offset of the checksum field within the header.
const CHECKSUM_OFFSET: usize = 6;

/// What a packet is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// Payload is for the layer above.
    Data = 0,
    /// Payload acknowledges a previous packet.
    Ack = 1,
    /// Payload negatively acknowledges a previous packet.
    Nack = 2,
    /// Periodic liveness broadcast, consumed by the network layer.
    Heartbeat = 3,
}

impl PacketType {
    /// Create from the wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Ack),
            2 => Some(PacketType::Nack),
            3 => Some(PacketType::Heartbeat),
            _ => None,
        }
    }
}

/// Errors from the packet codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Payload exceeds [`MAX_PAYLOAD_LEN`].
    #[error("payload too large: {len} / {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    /// Buffer is shorter than a packet header.
    #[error("packet truncated: {len} bytes")]
    Truncated { len: usize },

    /// Buffer length disagrees with the length field.
    #[error("length mismatch: header says {expected} bytes, buffer has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Recomputed checksum differs from the received byte.
    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch { computed: u8, received: u8 },

    /// The type byte names no known packet type.
    #[error("unknown packet type {0}")]
    UnknownType(u8),
}

/// An addressed, checksum-protected unit routed by the network layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPacket {
    pub packet_type: PacketType,
    /// Remaining forwards. Decremented on delivery; 0 disables forwarding.
    pub hops: u8,
    /// Destination address, [`BROADCAST_ADDRESS`] for everyone.
    pub dst_address: u16,
    /// Filled in by the sending node.
    pub src_address: u16,
    pub payload: Vec<u8>,
}

impl NetworkPacket {
    /// A data packet for `dst_address`. One hop, no forwarding.
    pub fn data(dst_address: u16, payload: Vec<u8>) -> Self {
        Self {
            packet_type: PacketType::Data,
            hops: 1,
            dst_address,
            src_address: 0,
            payload,
        }
    }

    /// The periodic liveness broadcast. Carries a single stub byte because
    /// empty payloads are rejected on the send path.
    pub fn heartbeat() -> Self {
        Self {
            packet_type: PacketType::Heartbeat,
            hops: 0,
            dst_address: BROADCAST_ADDRESS,
            src_address: 0,
            payload: vec![0],
        }
    }

    /// Size of this packet once encoded.
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_LEN + self.payload.len()
    }

    /// Serialize into wire bytes, computing the checksum.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let mut data = Vec::with_capacity(self.encoded_len());
        data.push(self.packet_type as u8);
        data.push(self.hops);
        data.extend_from_slice(&self.dst_address.to_be_bytes());
        data.extend_from_slice(&self.src_address.to_be_bytes());
        data.push(0); // checksum placeholder
        data.push(self.payload.len() as u8);
        data.extend_from_slice(&self.payload);

        data[CHECKSUM_OFFSET] = additive_checksum(&data);
        Ok(data)
    }

    /// Parse wire bytes, verifying length and checksum.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < PACKET_HEADER_LEN {
            return Err(PacketError::Truncated { len: data.len() });
        }

        let payload_len = data[7] as usize;
        if data.len() != PACKET_HEADER_LEN + payload_len {
            return Err(PacketError::LengthMismatch {
                expected: PACKET_HEADER_LEN + payload_len,
                actual: data.len(),
            });
        }

        let computed = additive_checksum(data);
        if computed != data[CHECKSUM_OFFSET] {
            return Err(PacketError::ChecksumMismatch {
                computed,
                received: data[CHECKSUM_OFFSET],
            });
        }

        let packet_type =
            PacketType::from_byte(data[0]).ok_or(PacketError::UnknownType(data[0]))?;

        Ok(Self {
            packet_type,
            hops: data[1],
            dst_address: u16::from_be_bytes([data[2], data[3]]),
            src_address: u16::from_be_bytes([data[4], data[5]]),
            payload: data[PACKET_HEADER_LEN..].to_vec(),
        })
    }
}

/// Sum of all bytes modulo 256, counting the checksum byte as zero.
pub fn additive_checksum(data: &[u8]) -> u8 {
    data.iter()
        .enumerate()
        .filter(|(i, _)| *i != CHECKSUM_OFFSET)
        .fold(0u8, |acc, (_, b)| acc.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let packet = NetworkPacket {
            packet_type: PacketType::Data,
            hops: 2,
            dst_address: 0x1234,
            src_address: 0xABCD,
            payload: vec![1, 2, 3, 4, 5],
        };

        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), 13);
        let decoded = NetworkPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_wire_layout() {
        let packet = NetworkPacket {
            packet_type: PacketType::Data,
            hops: 1,
            dst_address: 2,
            src_address: 1,
            payload: vec![1, 2, 3],
        };

        let bytes = packet.encode().unwrap();
        assert_eq!(bytes[0], 0); // DATA
        assert_eq!(bytes[1], 1); // hops
        assert_eq!(&bytes[2..4], &[0x00, 0x02]); // dst, big-endian
        assert_eq!(&bytes[4..6], &[0x00, 0x01]); // src, big-endian
        assert_eq!(bytes[6], 13); // 0+1+0+2+0+1+3+1+2+3
        assert_eq!(bytes[7], 3); // payload length
        assert_eq!(&bytes[8..], &[1, 2, 3]);
    }

    #[test]
    fn test_payload_at_cap() {
        let packet = NetworkPacket::data(9, vec![0xAA; MAX_PAYLOAD_LEN]);
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), PACKET_HEADER_LEN + MAX_PAYLOAD_LEN);
        let decoded = NetworkPacket::decode(&bytes).unwrap();
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_payload_over_cap() {
        let packet = NetworkPacket::data(9, vec![0xAA; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            packet.encode(),
            Err(PacketError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            NetworkPacket::decode(&[0, 1, 2]),
            Err(PacketError::Truncated { len: 3 })
        ));
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut bytes = NetworkPacket::data(1, vec![7, 8]).encode().unwrap();
        bytes.push(0xFF); // trailing garbage
        assert!(matches!(
            NetworkPacket::decode(&bytes),
            Err(PacketError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_corrupt_payload() {
        let mut bytes = NetworkPacket::data(1, vec![7, 8, 9]).encode().unwrap();
        bytes[9] ^= 0x10;
        assert!(matches!(
            NetworkPacket::decode(&bytes),
            Err(PacketError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_heartbeat_shape() {
        let hb = NetworkPacket::heartbeat();
        assert_eq!(hb.packet_type, PacketType::Heartbeat);
        assert_eq!(hb.dst_address, BROADCAST_ADDRESS);
        assert_eq!(hb.hops, 0);
        assert_eq!(hb.payload, vec![0]);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = NetworkPacket::data(1, vec![1]).encode().unwrap();
        bytes[0] = 9;
        // Fix the checksum so only the type is bad.
        bytes[6] = additive_checksum(&bytes);
        assert!(matches!(
            NetworkPacket::decode(&bytes),
            Err(PacketError::UnknownType(9))
        ));
    }
}
