//! # busnet — a layered stack for one shared wire
//!
//! busnet moves byte payloads between embedded nodes that share a single
//! half-duplex medium (UART, SPI, LoRa and the like). On top of a raw
//! [`PhysicalPort`] it stacks three cooperating state machines:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Application                            │
//! └───────────────────────────────────────────────────────────────┘
//!        │ send(data, addr, port)              ▲ TransportData
//! ┌───────────────────────────────────────────────────────────────┐
//! │  Transport      128-byte segments, id-tagged, CRC-8 verified  │
//! └───────────────────────────────────────────────────────────────┘
//!        │ send_packet                         ▲ NetworkPacket
//! ┌───────────────────────────────────────────────────────────────┐
//! │  NetworkNode    addressing, checksum, heartbeats, liveness    │
//! └───────────────────────────────────────────────────────────────┘
//!        │ transmit_dataframe                  ▲ Dataframe
//! ┌───────────────────────────────────────────────────────────────┐
//! │  Datalink       BLOCK/DATA/FREE arbitration and framing       │
//! └───────────────────────────────────────────────────────────────┘
//!        │ write                               ▲ read
//! ┌───────────────────────────────────────────────────────────────┐
//! │  PhysicalPort   UART / SPI / radio / in-memory SharedBus      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything is best-effort: frames are delivered atomically or silently
//! dropped, there is no retransmission, no flow control beyond local
//! back-pressure, and no multi-hop routing. The stack is single-threaded
//! and cooperative; a [`Scheduler`] ticks each layer at a bounded interval
//! or earlier when the layer reports pending work.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use std::time::{Duration, Instant};
//!
//! use busnet_core::datalink::Datalink;
//! use busnet_core::node::{NetworkNode, NodeConfig};
//! use busnet_core::phy::SharedBus;
//! use busnet_core::scheduler::Scheduler;
//! use busnet_core::transport::{Transport, TransportData};
//!
//! // Two nodes on one simulated medium.
//! let bus = SharedBus::new();
//!
//! let link_a = Rc::new(Datalink::new(bus.port()));
//! let node_a = NetworkNode::new(NodeConfig::new(1));
//! node_a.add_datalink(link_a.clone());
//! let transport_a = Transport::attached(9, node_a.clone());
//!
//! let link_b = Rc::new(Datalink::new(bus.port()));
//! let node_b = NetworkNode::new(NodeConfig::new(2));
//! node_b.add_datalink(link_b.clone());
//! let transport_b = Transport::attached(9, node_b.clone());
//! transport_b.add_receive_handler(Box::new(|message: &TransportData| {
//!     println!("{} bytes from node {}", message.data.len(), message.src_address);
//! }));
//!
//! let mut scheduler = Scheduler::new();
//! scheduler.add_task(link_a.clone(), Duration::from_secs(1));
//! scheduler.add_task(link_b.clone(), Duration::from_secs(1));
//! scheduler.add_task(node_a.clone(), Duration::from_millis(100));
//! scheduler.add_task(node_b.clone(), Duration::from_millis(100));
//!
//! transport_a.send(&[0x55; 300], 2, 9);
//! loop {
//!     scheduler.poll(Instant::now());
//! }
//! ```

pub mod datalink;
pub mod handler;
pub mod node;
pub mod packet;
pub mod peer;
pub mod phy;
pub mod scheduler;
pub mod traits;
pub mod transport;

pub use datalink::{Datalink, DatalinkConfig, LinkStats, FRAME_QUEUE_LEN, MAX_FRAME_LEN};
pub use handler::HandlerGroup;
pub use node::{NetworkNode, NodeConfig, NodeStats};
pub use packet::{
    NetworkPacket, PacketError, PacketType, BROADCAST_ADDRESS, MAX_PAYLOAD_LEN, NETWORK_VERSION,
};
pub use peer::{PeerInfo, PeerTable};
pub use phy::{BusPort, SharedBus};
pub use scheduler::{Scheduler, Task};
pub use traits::{Dataframe, FrameLink, NetworkLink, PhysicalPort};
pub use transport::{Transport, TransportData, TransportStats, SEGMENT_LEN, TRANSPORT_MAGIC};
