//! The network layer: addressing, checksummed packet routing and liveness.
//!
//! A [`NetworkNode`] turns packets into dataframes and back across any
//! number of datalinks, short-circuits self-addressed packets to its own
//! handlers, broadcasts periodic heartbeats so peers discover it, and evicts
//! peers that go silent. The router does not forward: packets not addressed
//! to this node (or broadcast) are dropped after refreshing the sender's
//! liveness entry, and `hops` is only ever decremented.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::handler::{Handler, HandlerGroup};
use crate::packet::{NetworkPacket, PacketType, BROADCAST_ADDRESS};
use crate::peer::{PeerInfo, PeerTable};
use crate::scheduler::Task;
use crate::traits::{Dataframe, FrameLink, NetworkLink};

/// Default time of silence after which a peer is considered unreachable.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// How many heartbeats fit in one disconnect timeout window.
const HEARTBEATS_PER_TIMEOUT: u32 = 10;

/// Network node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's address. 0 is conventionally a receive-only node.
    pub address: u16,
    /// Peers silent for longer than this are dropped from the table. The
    /// heartbeat interval is derived as a tenth of it.
    pub disconnect_timeout: Duration,
}

impl NodeConfig {
    pub fn new(address: u16) -> Self {
        Self {
            address,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }
}

/// Counters for network layer activity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeStats {
    /// Packets serialized and handed to datalinks.
    pub packets_tx: u64,
    /// Packets decoded from inbound frames (including heartbeats).
    pub packets_rx: u64,
    /// Heartbeats emitted.
    pub heartbeats_tx: u64,
    /// Self-addressed packets delivered without touching a datalink.
    pub loopback: u64,
    /// Inbound frames dropped for size or checksum problems.
    pub decode_failures: u64,
    /// Peers evicted after going silent.
    pub peers_expired: u64,
}

struct NodeInner {
    address: u16,
    send_interval: Duration,
    last_send: Option<Instant>,
    /// Most recent tick time. Receive paths run between our ticks (inside
    /// a datalink's tick) and stamp liveness with this, so entries age on
    /// the same clock that prunes them.
    clock: Instant,
    peers: PeerTable,
    stats: NodeStats,
}

/// One node on the network.
///
/// Nodes live behind an [`Rc`] so that the receive handlers they install on
/// datalinks can hold weak back references; a registration never keeps a
/// node alive.
///
/// ```rust,no_run
/// use std::rc::Rc;
/// use busnet_core::datalink::Datalink;
/// use busnet_core::node::{NetworkNode, NodeConfig};
/// use busnet_core::phy::SharedBus;
///
/// let bus = SharedBus::new();
/// let link = Rc::new(Datalink::new(bus.port()));
/// let node = NetworkNode::new(NodeConfig::new(1));
/// node.add_datalink(link);
/// ```
pub struct NetworkNode {
    self_weak: Weak<NetworkNode>,
    inner: RefCell<NodeInner>,
    links: RefCell<Vec<Rc<dyn FrameLink>>>,
    receive_handlers: HandlerGroup<NetworkPacket>,
}

impl NetworkNode {
    pub fn new(config: NodeConfig) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            inner: RefCell::new(NodeInner {
                address: config.address,
                send_interval: config.disconnect_timeout / HEARTBEATS_PER_TIMEOUT,
                last_send: None,
                clock: Instant::now(),
                peers: PeerTable::new(config.disconnect_timeout),
                stats: NodeStats::default(),
            }),
            links: RefCell::new(Vec::new()),
            receive_handlers: HandlerGroup::new(),
        })
    }

    pub fn set_node_address(&self, address: u16) {
        self.inner.borrow_mut().address = address;
    }

    /// Register a downstream datalink. The node installs its own receive
    /// handler on the link; with several links attached every outbound
    /// packet is handed to each of them, without any dedup.
    pub fn add_datalink(&self, link: Rc<dyn FrameLink>) {
        let weak = self.self_weak.clone();
        link.add_receive_handler(Box::new(move |frame: &Dataframe| {
            if let Some(node) = weak.upgrade() {
                node.receive_frame(frame);
            }
        }));
        self.links.borrow_mut().push(link);
    }

    /// Whether a packet from `address` arrived within the disconnect
    /// timeout.
    pub fn is_node_reachable(&self, address: u16) -> bool {
        self.inner.borrow().peers.is_reachable(address)
    }

    /// Addresses of all currently reachable peers.
    pub fn reachable_nodes(&self) -> Vec<u16> {
        self.inner.borrow().peers.addresses()
    }

    /// Snapshot of the peer table.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.borrow().peers.peers()
    }

    pub fn stats(&self) -> NodeStats {
        self.inner.borrow().stats
    }

    /// Feed a raw inbound frame through decode, liveness and dispatch.
    /// Normally invoked by the handler installed on each datalink.
    pub fn receive_frame(&self, frame: &[u8]) {
        let mut packet = match NetworkPacket::decode(frame) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(%err, len = frame.len(), "dropping undecodable frame");
                self.inner.borrow_mut().stats.decode_failures += 1;
                return;
            }
        };

        let own_address = {
            let mut inner = self.inner.borrow_mut();
            let now = inner.clock;
            inner.peers.observe(packet.src_address, now);
            inner.stats.packets_rx += 1;
            inner.address
        };

        if packet.packet_type == PacketType::Heartbeat {
            trace!(src = packet.src_address, "heartbeat");
            return;
        }

        if packet.dst_address == own_address || packet.dst_address == BROADCAST_ADDRESS {
            packet.hops = packet.hops.saturating_sub(1);
            self.receive_handlers.call(packet);
        }
    }

    fn send_at(&self, packet: &NetworkPacket, now: Instant) {
        if packet.payload.is_empty() {
            warn!("dropping packet with empty payload");
            return;
        }

        let mut out = packet.clone();
        let own_address = self.inner.borrow().address;
        out.src_address = own_address;

        if out.dst_address == own_address {
            // Local delivery; nothing touches the wire.
            self.inner.borrow_mut().stats.loopback += 1;
            self.receive_handlers.call(out);
            return;
        }

        let bytes = match out.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "failed to encode packet");
                return;
            }
        };

        for link in self.links.borrow().iter() {
            if !link.transmit_dataframe(&bytes) {
                debug!(dst = out.dst_address, "datalink rejected outbound frame");
            }
        }

        let mut inner = self.inner.borrow_mut();
        inner.stats.packets_tx += 1;
        inner.last_send = Some(now);
    }
}

impl NetworkLink for NetworkNode {
    fn node_address(&self) -> u16 {
        self.inner.borrow().address
    }

    fn send_packet(&self, packet: &NetworkPacket) {
        let now = self.inner.borrow().clock;
        self.send_at(packet, now);
    }

    fn add_packet_receive_handler(&self, handler: Handler<NetworkPacket>) {
        self.receive_handlers.add(handler);
    }

    fn clear_packet_receive_handlers(&self) {
        self.receive_handlers.clear();
    }
}

impl Task for NetworkNode {
    fn name(&self) -> &str {
        "network-node"
    }

    /// Emit a heartbeat when nothing was sent for a while, then evict
    /// silent peers.
    fn tick(&self, now: Instant) {
        let heartbeat_due = {
            let mut inner = self.inner.borrow_mut();
            inner.clock = now;
            inner
                .last_send
                .map_or(true, |t| now.saturating_duration_since(t) > inner.send_interval)
        };

        if heartbeat_due {
            self.inner.borrow_mut().stats.heartbeats_tx += 1;
            self.send_at(&NetworkPacket::heartbeat(), now);
        }

        let mut inner = self.inner.borrow_mut();
        let expired = inner.peers.prune(now);
        if expired > 0 {
            debug!(expired, "peers went silent");
            inner.stats.peers_expired += expired as u64;
        }
    }
}
