//! Core traits connecting the layers of the stack.
//!
//! These traits are the seams between layers: a [`PhysicalPort`] is the raw
//! byte pipe a datalink drives, a [`FrameLink`] is what the network layer
//! sees of a datalink, and a [`NetworkLink`] is what a transport sees of a
//! network node. Upward delivery always happens through registered handlers;
//! downward references are plain shared ownership. A handler must not
//! outlive the layer that registered it, which the layers guarantee by
//! capturing weak references.

use crate::handler::Handler;
use crate::packet::NetworkPacket;

/// A datalink-level unit: opaque bytes delivered atomically or not at all.
pub type Dataframe = Vec<u8>;

/// A raw byte pipe such as a UART, SPI device or radio modem.
///
/// The port reports how much can currently be read and written; the datalink
/// never writes more than the port advertises. All calls are non-blocking.
pub trait PhysicalPort {
    /// Number of bytes buffered and ready to read.
    fn readable(&self) -> usize;

    /// Number of bytes the port can accept right now. `-1` means the port
    /// imposes no limit.
    fn writable(&self) -> isize;

    /// Read a single byte, if one is available.
    fn read_byte(&mut self) -> Option<u8>;

    /// Read up to `buf.len()` bytes, returning how many were placed.
    fn read_data(&mut self, buf: &mut [u8]) -> usize;

    /// Write a single byte.
    fn write_byte(&mut self, byte: u8);

    /// Write a block of bytes.
    fn write_data(&mut self, data: &[u8]);
}

/// The datalink as seen from above: frame-level send plus per-frame receive
/// callbacks.
pub trait FrameLink {
    /// Queue a frame for transmission. Returns `false` if the frame is
    /// oversized or the transmit queue is full.
    fn transmit_dataframe(&self, frame: &[u8]) -> bool;

    /// Remaining transmit queue slots.
    fn buffer_free_space(&self) -> usize;

    /// Register a callback invoked with each fully assembled inbound frame.
    fn add_receive_handler(&self, handler: Handler<Dataframe>);

    /// Drop all frame receive callbacks.
    fn clear_receive_handlers(&self);
}

/// The network layer as seen from above: addressed packet send plus
/// per-packet receive callbacks.
pub trait NetworkLink {
    /// The address of this node.
    fn node_address(&self) -> u16;

    /// Send a packet. The node fills in the source address and checksum;
    /// self-addressed packets are delivered locally without touching any
    /// datalink. Rejected packets are logged, not surfaced.
    fn send_packet(&self, packet: &NetworkPacket);

    /// Register a callback invoked with each packet addressed to this node
    /// (or broadcast). Heartbeats are consumed by the node and never reach
    /// these callbacks.
    fn add_packet_receive_handler(&self, handler: Handler<NetworkPacket>);

    /// Drop all packet receive callbacks.
    fn clear_packet_receive_handlers(&self);
}
