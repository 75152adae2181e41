//! Best-effort segmentation and reassembly of arbitrary byte payloads.
//!
//! Payloads larger than a network packet are split into 128-byte segments,
//! announced by an info segment and verified on reassembly with a CRC-8.
//! Loss of any segment silently drops the whole message; there is no
//! retransmission and no receive-side timeout. A stalled reassembly is
//! broken only by the sender's next message id.
//!
//! ## Wire layout
//!
//! Every transport packet ends with an 8-byte trailer appended to the
//! network payload:
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────┬──────┬───────┐
//! │ srcPort (2B) │ dstPort (2B) │ order (2B) │ id   │ magic │
//! └──────────────┴──────────────┴────────────┴──────┴───────┘
//! ```
//!
//! Segment 0 (the info segment) carries, before the trailer:
//!
//! ```text
//! ┌──────────────────┬───────────────┬─────────┐
//! │ numSegments (2B) │ numBytes (2B) │ crc (1B)│
//! └──────────────────┴───────────────┴─────────┘
//! ```
//!
//! Data segments use `order` 1..=numSegments; the last one may be short.
//! All multi-byte fields are big-endian.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::handler::{Handler, HandlerGroup};
use crate::packet::NetworkPacket;
use crate::traits::NetworkLink;

/// Data bytes per segment.
pub const SEGMENT_LEN: usize = 128;

/// Trailer appended to every transport packet.
pub const TRAILER_LEN: usize = 8;

/// Info payload ahead of the trailer on segment 0.
const INFO_LEN: usize = 5;

/// Transport protocol generation.
pub const TRANSPORT_VERSION: u8 = 2;

/// Identifier of this transport among protocols sharing a port space.
pub const TRANSPORT_ID: u8 = 1;

/// The byte every transport packet ends with: version + id. Additive, so
/// distinct version/id pairs can collide; acknowledged smell, kept for
/// wire compatibility.
pub const TRANSPORT_MAGIC: u8 = TRANSPORT_VERSION + TRANSPORT_ID;

/// 8-bit CRC, polynomial 0x07, zero seed. Used to verify reassembled
/// payloads end-to-end.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// A fully reassembled message with its addressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportData {
    pub src_address: u16,
    pub src_port: u16,
    pub dst_address: u16,
    pub dst_port: u16,
    pub data: Vec<u8>,
}

/// Counters for transport activity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TransportStats {
    /// Messages segmented and sent.
    pub messages_tx: u64,
    /// Segments sent (info segments included).
    pub segments_tx: u64,
    /// Segments accepted for this port.
    pub segments_rx: u64,
    /// Messages reassembled, verified and delivered.
    pub messages_rx: u64,
    /// Reassemblies dropped on CRC or length verification.
    pub crc_failures: u64,
    /// Segments dropped as malformed.
    pub malformed: u64,
}

struct SegmentTrailer {
    src_port: u16,
    dst_port: u16,
    order: u16,
    id: u8,
    magic: u8,
}

impl SegmentTrailer {
    fn read(payload: &[u8]) -> Option<Self> {
        if payload.len() < TRAILER_LEN {
            return None;
        }
        let t = &payload[payload.len() - TRAILER_LEN..];
        Some(Self {
            src_port: u16::from_be_bytes([t[0], t[1]]),
            dst_port: u16::from_be_bytes([t[2], t[3]]),
            order: u16::from_be_bytes([t[4], t[5]]),
            id: t[6],
            magic: t[7],
        })
    }
}

/// Receive-side state; at most one reassembly in flight per transport.
#[derive(Default)]
struct RxSession {
    id: u8,
    expected_segments: u16,
    expected_bytes: u16,
    expected_checksum: u8,
    /// Buffered `(order, data)` pairs. Duplicates accumulate and are
    /// resolved by order during reconstruction.
    received: Vec<(u16, Vec<u8>)>,
    count: u16,
}

struct TransportInner {
    port: u16,
    node: Option<Rc<dyn NetworkLink>>,
    /// Id of the message currently being sent; changed after every send so
    /// the peer can tell messages apart.
    sending_id: u8,
    session: RxSession,
    stats: TransportStats,
}

/// Port-addressed segmenting transport bound to one network node.
///
/// Lives behind an [`Rc`]; the handler it installs on its node holds only a
/// weak back reference.
pub struct Transport {
    self_weak: Weak<Transport>,
    inner: RefCell<TransportInner>,
    receive_handlers: HandlerGroup<TransportData>,
}

impl Transport {
    pub fn new(port: u16) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            inner: RefCell::new(TransportInner {
                port,
                node: None,
                sending_id: 1,
                session: RxSession::default(),
                stats: TransportStats::default(),
            }),
            receive_handlers: HandlerGroup::new(),
        })
    }

    /// Bind to a network node and start receiving its packets.
    pub fn bind(&self, node: Rc<dyn NetworkLink>) {
        let weak = self.self_weak.clone();
        node.add_packet_receive_handler(Box::new(move |packet: &NetworkPacket| {
            if let Some(transport) = weak.upgrade() {
                transport.on_packet(packet);
            }
        }));
        self.inner.borrow_mut().node = Some(node);
    }

    /// Create a transport already bound to `node`.
    pub fn attached(port: u16, node: Rc<dyn NetworkLink>) -> Rc<Self> {
        let transport = Self::new(port);
        transport.bind(node);
        transport
    }

    pub fn set_port(&self, port: u16) {
        self.inner.borrow_mut().port = port;
    }

    pub fn port(&self) -> u16 {
        self.inner.borrow().port
    }

    pub fn stats(&self) -> TransportStats {
        self.inner.borrow().stats
    }

    /// Register a callback for fully reassembled messages on this port.
    pub fn add_receive_handler(&self, handler: Handler<TransportData>) {
        self.receive_handlers.add(handler);
    }

    pub fn clear_receive_handlers(&self) {
        self.receive_handlers.clear();
    }

    /// Segment `data` and send it to `dst_port` at `dst_address`.
    ///
    /// Best effort: the call returns once all segments are handed to the
    /// network layer. Rejected input (empty, or beyond the 16-bit byte
    /// counter) is logged and dropped.
    pub fn send(&self, data: &[u8], dst_address: u16, dst_port: u16) {
        if data.is_empty() {
            warn!("refusing to send empty payload");
            return;
        }
        if data.len() > u16::MAX as usize {
            warn!(len = data.len(), "payload exceeds transport size limit");
            return;
        }

        let (node, id) = {
            let inner = self.inner.borrow();
            let Some(node) = inner.node.clone() else {
                warn!("transport not bound to a network node");
                return;
            };
            (node, inner.sending_id)
        };

        let num_bytes = data.len() as u16;
        let num_segments = data.len().div_ceil(SEGMENT_LEN) as u16;
        let crc = crc8(data);
        trace!(num_segments, num_bytes, crc, "sending message");

        let mut info = Vec::with_capacity(INFO_LEN + TRAILER_LEN);
        info.extend_from_slice(&num_segments.to_be_bytes());
        info.extend_from_slice(&num_bytes.to_be_bytes());
        info.push(crc);
        self.send_segment(&node, info, 0, dst_address, dst_port, id);

        for (i, chunk) in data.chunks(SEGMENT_LEN).enumerate() {
            let mut payload = Vec::with_capacity(chunk.len() + TRAILER_LEN);
            payload.extend_from_slice(chunk);
            self.send_segment(&node, payload, (i + 1) as u16, dst_address, dst_port, id);
        }

        let mut inner = self.inner.borrow_mut();
        inner.sending_id = inner.sending_id.wrapping_add(1);
        inner.stats.messages_tx += 1;
    }

    /// Append the trailer and hand one segment to the network layer.
    fn send_segment(
        &self,
        node: &Rc<dyn NetworkLink>,
        mut payload: Vec<u8>,
        order: u16,
        dst_address: u16,
        dst_port: u16,
        id: u8,
    ) {
        let src_port = self.inner.borrow().port;
        payload.extend_from_slice(&src_port.to_be_bytes());
        payload.extend_from_slice(&dst_port.to_be_bytes());
        payload.extend_from_slice(&order.to_be_bytes());
        payload.push(id);
        payload.push(TRANSPORT_MAGIC);

        self.inner.borrow_mut().stats.segments_tx += 1;
        node.send_packet(&NetworkPacket::data(dst_address, payload));
    }

    /// Handler installed on the bound node.
    fn on_packet(&self, packet: &NetworkPacket) {
        let Some(trailer) = SegmentTrailer::read(&packet.payload) else {
            debug!(len = packet.payload.len(), "short packet is not a segment");
            return;
        };
        if trailer.magic != TRANSPORT_MAGIC {
            trace!(magic = trailer.magic, "not a transport packet");
            return;
        }

        let completed = {
            let mut inner = self.inner.borrow_mut();
            if trailer.dst_port != inner.port {
                trace!(dst_port = trailer.dst_port, "segment for another port");
                return;
            }
            inner.stats.segments_rx += 1;

            let body = &packet.payload[..packet.payload.len() - TRAILER_LEN];

            if trailer.id != inner.session.id {
                // A new message id always resets the session, and the
                // packet carrying it is read as session info, never as
                // data.
                inner.start_session(&trailer, body);
                return;
            }

            inner.session.received.push((trailer.order, body.to_vec()));
            inner.session.count += 1;
            if inner.session.count != inner.session.expected_segments {
                None
            } else {
                inner.finish_session(packet, &trailer)
            }
        };

        if let Some(data) = completed {
            self.receive_handlers.call(data);
        }
    }
}

impl TransportInner {
    fn start_session(&mut self, trailer: &SegmentTrailer, body: &[u8]) {
        if body.len() < INFO_LEN {
            debug!(id = trailer.id, "segment with unknown id carries no session info");
            self.stats.malformed += 1;
            return;
        }
        let num_segments = u16::from_be_bytes([body[0], body[1]]);
        let num_bytes = u16::from_be_bytes([body[2], body[3]]);
        let checksum = body[4];

        if num_segments == 0 || num_bytes == 0 || num_bytes < num_segments {
            warn!(
                id = trailer.id,
                num_segments, num_bytes, "malformed session info, discarding"
            );
            self.stats.malformed += 1;
            return;
        }

        trace!(id = trailer.id, num_segments, num_bytes, "new session");
        self.session = RxSession {
            id: trailer.id,
            expected_segments: num_segments,
            expected_bytes: num_bytes,
            expected_checksum: checksum,
            received: Vec::new(),
            count: 0,
        };
    }

    /// All expected segments are in: reconstruct strictly by order and
    /// verify. The session id survives the reset so duplicates of a
    /// finished message stay ignored until a new id arrives.
    fn finish_session(
        &mut self,
        packet: &NetworkPacket,
        trailer: &SegmentTrailer,
    ) -> Option<TransportData> {
        let mut data = Vec::with_capacity(self.session.expected_bytes as usize);
        for order in 1..=self.session.expected_segments {
            if let Some((_, body)) = self.session.received.iter().find(|(o, _)| *o == order) {
                data.extend_from_slice(body);
            }
        }

        let crc = crc8(&data);
        let length_ok = data.len() == self.session.expected_bytes as usize;
        let crc_ok = crc == self.session.expected_checksum;
        let expected_checksum = self.session.expected_checksum;

        self.session.received.clear();
        self.session.count = 0;
        self.session.expected_segments = 0;
        self.session.expected_bytes = 0;
        self.session.expected_checksum = 0;

        if crc_ok && length_ok {
            self.stats.messages_rx += 1;
            Some(TransportData {
                src_address: packet.src_address,
                src_port: trailer.src_port,
                dst_address: packet.dst_address,
                dst_port: trailer.dst_port,
                data,
            })
        } else {
            warn!(
                computed = crc,
                expected = expected_checksum,
                len = data.len(),
                "reassembled message failed verification, dropping"
            );
            self.stats.crc_failures += 1;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    /// A network layer stub that records sent packets and can feed packets
    /// back through the registered handlers.
    struct StubNode {
        address: u16,
        sent: RefCell<Vec<NetworkPacket>>,
        handlers: HandlerGroup<NetworkPacket>,
    }

    impl StubNode {
        fn new(address: u16) -> Rc<Self> {
            Rc::new(Self {
                address,
                sent: RefCell::new(Vec::new()),
                handlers: HandlerGroup::new(),
            })
        }

        fn deliver(&self, packet: NetworkPacket) {
            self.handlers.call(packet);
        }

        fn take_sent(&self) -> Vec<NetworkPacket> {
            self.sent.take()
        }
    }

    impl NetworkLink for StubNode {
        fn node_address(&self) -> u16 {
            self.address
        }

        fn send_packet(&self, packet: &NetworkPacket) {
            self.sent.borrow_mut().push(packet.clone());
        }

        fn add_packet_receive_handler(&self, handler: Handler<NetworkPacket>) {
            self.handlers.add(handler);
        }

        fn clear_packet_receive_handlers(&self) {
            self.handlers.clear();
        }
    }

    fn collect(transport: &Rc<Transport>) -> Rc<RefCell<Vec<TransportData>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        transport.add_receive_handler(Box::new(move |data: &TransportData| {
            sink.borrow_mut().push(data.clone());
        }));
        seen
    }

    /// Stamp addressing the way a delivery through a real node would.
    fn as_received(mut packet: NetworkPacket, src: u16) -> NetworkPacket {
        packet.src_address = src;
        packet
    }

    #[test]
    fn test_crc8_known_values() {
        assert_eq!(crc8(&[]), 0);
        // CRC-8 with poly 0x07 over "123456789".
        assert_eq!(crc8(b"123456789"), 0xF4);
    }

    #[test]
    fn test_send_segment_layout() {
        let node = StubNode::new(1);
        let transport = Transport::attached(9, node.clone());

        let data: Vec<u8> = (0..=255).cycle().take(300).map(|b: u16| b as u8).collect();
        transport.send(&data, 2, 9);

        let sent = node.take_sent();
        // Info segment plus ceil(300 / 128) = 3 data segments.
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|p| p.packet_type == PacketType::Data));
        assert!(sent.iter().all(|p| p.dst_address == 2));

        // Info segment: counts, size, crc, then the trailer.
        let info = &sent[0].payload;
        assert_eq!(info.len(), 13);
        assert_eq!(u16::from_be_bytes([info[0], info[1]]), 3);
        assert_eq!(u16::from_be_bytes([info[2], info[3]]), 300);
        assert_eq!(info[4], crc8(&data));
        let trailer = &info[5..];
        assert_eq!(u16::from_be_bytes([trailer[0], trailer[1]]), 9); // src port
        assert_eq!(u16::from_be_bytes([trailer[2], trailer[3]]), 9); // dst port
        assert_eq!(u16::from_be_bytes([trailer[4], trailer[5]]), 0); // order
        assert_eq!(trailer[6], 1); // first message id
        assert_eq!(trailer[7], TRANSPORT_MAGIC);

        // Data segments: 128 + 128 + 44 bytes, orders 1..=3, same id.
        let lens: Vec<usize> = sent[1..]
            .iter()
            .map(|p| p.payload.len() - TRAILER_LEN)
            .collect();
        assert_eq!(lens, vec![128, 128, 44]);
        for (i, segment) in sent[1..].iter().enumerate() {
            let t = &segment.payload[segment.payload.len() - TRAILER_LEN..];
            assert_eq!(u16::from_be_bytes([t[4], t[5]]), (i + 1) as u16);
            assert_eq!(t[6], 1);
        }
    }

    #[test]
    fn test_roundtrip_via_stub() {
        let sender_node = StubNode::new(1);
        let sender = Transport::attached(9, sender_node.clone());
        let receiver_node = StubNode::new(2);
        let receiver = Transport::attached(9, receiver_node.clone());
        let seen = collect(&receiver);

        let data: Vec<u8> = (0..300u16).map(|b| (b % 251) as u8).collect();
        sender.send(&data, 2, 9);

        for packet in sender_node.take_sent() {
            receiver_node.deliver(as_received(packet, 1));
        }

        assert_eq!(seen.borrow().len(), 1);
        let message = &seen.borrow()[0];
        assert_eq!(message.data, data);
        assert_eq!(message.src_address, 1);
        assert_eq!(message.src_port, 9);
        assert_eq!(message.dst_address, 2);
        assert_eq!(message.dst_port, 9);
    }

    #[test]
    fn test_out_of_order_segments_reassemble() {
        let sender_node = StubNode::new(1);
        let sender = Transport::attached(9, sender_node.clone());
        let receiver_node = StubNode::new(2);
        let receiver = Transport::attached(9, receiver_node.clone());
        let seen = collect(&receiver);

        let data = vec![7u8; 300];
        sender.send(&data, 2, 9);

        let mut packets = sender_node.take_sent();
        // Info first (it resets the session), then data segments reversed.
        let info = packets.remove(0);
        receiver_node.deliver(as_received(info, 1));
        packets.reverse();
        for packet in packets {
            receiver_node.deliver(as_received(packet, 1));
        }

        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].data, data);
    }

    #[test]
    fn test_exact_segment_boundaries() {
        for len in [1usize, SEGMENT_LEN, SEGMENT_LEN + 1] {
            let sender_node = StubNode::new(1);
            let sender = Transport::attached(9, sender_node.clone());
            let receiver_node = StubNode::new(2);
            let receiver = Transport::attached(9, receiver_node.clone());
            let seen = collect(&receiver);

            let data = vec![0x5Au8; len];
            sender.send(&data, 2, 9);
            let sent = sender_node.take_sent();
            let expected_segments = len.div_ceil(SEGMENT_LEN);
            assert_eq!(sent.len(), 1 + expected_segments);

            for packet in sent {
                receiver_node.deliver(as_received(packet, 1));
            }
            assert_eq!(seen.borrow().len(), 1, "len {len}");
            assert_eq!(seen.borrow()[0].data, data);
        }
    }

    #[test]
    fn test_wrong_port_ignored() {
        let sender_node = StubNode::new(1);
        let sender = Transport::attached(9, sender_node.clone());
        let receiver_node = StubNode::new(2);
        let receiver = Transport::attached(10, receiver_node.clone());
        let seen = collect(&receiver);

        sender.send(&[1, 2, 3], 2, 9);
        for packet in sender_node.take_sent() {
            receiver_node.deliver(as_received(packet, 1));
        }

        assert!(seen.borrow().is_empty());
        assert_eq!(receiver.stats().segments_rx, 0);
    }

    #[test]
    fn test_bad_magic_ignored() {
        let receiver_node = StubNode::new(2);
        let receiver = Transport::attached(9, receiver_node.clone());
        let seen = collect(&receiver);

        // A non-transport packet that happens to be 8 bytes or longer.
        let packet = NetworkPacket::data(2, vec![0u8; 12]);
        receiver_node.deliver(as_received(packet, 1));

        assert!(seen.borrow().is_empty());
        assert_eq!(receiver.stats().segments_rx, 0);
    }

    #[test]
    fn test_malformed_info_rejected() {
        let receiver_node = StubNode::new(2);
        let receiver = Transport::attached(9, receiver_node.clone());
        let seen = collect(&receiver);

        // numSegments = 0 is never valid.
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&10u16.to_be_bytes());
        payload.push(0);
        payload.extend_from_slice(&9u16.to_be_bytes()); // src port
        payload.extend_from_slice(&9u16.to_be_bytes()); // dst port
        payload.extend_from_slice(&0u16.to_be_bytes()); // order
        payload.push(5); // id
        payload.push(TRANSPORT_MAGIC);
        receiver_node.deliver(as_received(NetworkPacket::data(2, payload), 1));

        assert!(seen.borrow().is_empty());
        assert_eq!(receiver.stats().malformed, 1);
    }

    #[test]
    fn test_corrupt_segment_drops_message_next_id_recovers() {
        let sender_node = StubNode::new(1);
        let sender = Transport::attached(9, sender_node.clone());
        let receiver_node = StubNode::new(2);
        let receiver = Transport::attached(9, receiver_node.clone());
        let seen = collect(&receiver);

        let data = vec![3u8; 300];
        sender.send(&data, 2, 9);
        let mut packets = sender_node.take_sent();
        // Flip a byte in the middle data segment's body.
        packets[2].payload[10] ^= 0xFF;
        for packet in packets {
            receiver_node.deliver(as_received(packet, 1));
        }

        assert!(seen.borrow().is_empty());
        assert_eq!(receiver.stats().crc_failures, 1);

        // The next message carries a fresh id and goes through.
        sender.send(&data, 2, 9);
        for packet in sender_node.take_sent() {
            receiver_node.deliver(as_received(packet, 1));
        }
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].data, data);
    }

    #[test]
    fn test_lost_segment_stalls_until_new_id() {
        let sender_node = StubNode::new(1);
        let sender = Transport::attached(9, sender_node.clone());
        let receiver_node = StubNode::new(2);
        let receiver = Transport::attached(9, receiver_node.clone());
        let seen = collect(&receiver);

        let first = vec![1u8; 300];
        sender.send(&first, 2, 9);
        let mut packets = sender_node.take_sent();
        packets.remove(3); // lose a data segment
        for packet in packets {
            receiver_node.deliver(as_received(packet, 1));
        }
        assert!(seen.borrow().is_empty());

        let second = vec![2u8; 40];
        sender.send(&second, 2, 9);
        for packet in sender_node.take_sent() {
            receiver_node.deliver(as_received(packet, 1));
        }
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].data, second);
    }

    #[test]
    fn test_duplicates_of_finished_message_ignored() {
        let sender_node = StubNode::new(1);
        let sender = Transport::attached(9, sender_node.clone());
        let receiver_node = StubNode::new(2);
        let receiver = Transport::attached(9, receiver_node.clone());
        let seen = collect(&receiver);

        sender.send(&[9u8; 50], 2, 9);
        let packets = sender_node.take_sent();
        for packet in &packets {
            receiver_node.deliver(as_received(packet.clone(), 1));
        }
        assert_eq!(seen.borrow().len(), 1);

        // Replaying the same message (same id) must not deliver again.
        for packet in &packets {
            receiver_node.deliver(as_received(packet.clone(), 1));
        }
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_empty_send_rejected() {
        let node = StubNode::new(1);
        let transport = Transport::attached(9, node.clone());
        transport.send(&[], 2, 9);
        assert!(node.take_sent().is_empty());
        assert_eq!(transport.stats().messages_tx, 0);
    }

    #[test]
    fn test_sending_id_advances() {
        let node = StubNode::new(1);
        let transport = Transport::attached(9, node.clone());

        transport.send(&[1], 2, 9);
        transport.send(&[2], 2, 9);
        let sent = node.take_sent();
        let id_of = |p: &NetworkPacket| p.payload[p.payload.len() - 2];
        assert_eq!(id_of(&sent[0]), 1);
        assert_eq!(id_of(&sent[2]), 2);
    }
}
