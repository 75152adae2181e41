//! Medium access and framing over a shared half-duplex byte channel.
//!
//! Several nodes share one physical channel with no collision detection, so
//! access is arbitrated with three control bytes. Every physical write
//! starts with one of them:
//!
//! ```text
//! BLOCK (0x00)              "I am about to transmit; the channel is in use."
//! DATA  (0x02) len payload  One chunk of the frame currently being sent.
//! FREE  (0x01)              "Done; the channel is available."
//! ```
//!
//! A logical frame goes out as `BLOCK`, one or more `DATA` chunks (chunked
//! only because the port's writable window is bounded), then `FREE`. The
//! receive side assembles chunks into a frame and hands it to the registered
//! handlers once the `FREE` arrives. Frames are delivered atomically or
//! dropped; ordering across senders is not guaranteed.
//!
//! A watchdog returns the medium to idle if a blocking sender goes silent
//! for longer than the release timeout, so a crashed peer cannot hold the
//! channel forever. On startup the link assumes the medium is blocked and
//! listens first, in case it joined mid-conversation.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::handler::{Handler, HandlerGroup};
use crate::scheduler::Task;
use crate::traits::{Dataframe, FrameLink, PhysicalPort};

/// Maximum length of a dataframe.
pub const MAX_FRAME_LEN: usize = 230;

/// Transmit queue capacity, in frames.
pub const FRAME_QUEUE_LEN: usize = 5;

/// Largest payload of a single DATA chunk (its length field is one byte).
const MAX_CHUNK_LEN: usize = 250;

/// Default watchdog for a channel blocked by a silent peer.
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_millis(100);

/// Extra time a freshly started link assumes the channel has been busy.
const STARTUP_LISTEN: Duration = Duration::from_secs(1);

/// Control alphabet; the first byte of every physical write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ControlByte {
    Block = 0x00,
    Free = 0x01,
    Data = 0x02,
}

impl ControlByte {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ControlByte::Block),
            0x01 => Some(ControlByte::Free),
            0x02 => Some(ControlByte::Data),
            _ => None,
        }
    }
}

/// Datalink tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatalinkConfig {
    /// How long to wait for a blocked channel to free itself. Set this to a
    /// multiple of the expected frame airtime but as low as possible: for a
    /// slow radio like LoRa several seconds, for a UART a few milliseconds.
    pub release_timeout: Duration,
}

impl Default for DatalinkConfig {
    fn default() -> Self {
        Self {
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }
}

impl DatalinkConfig {
    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }
}

/// Counters for datalink activity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LinkStats {
    /// Frames fully written to the port.
    pub frames_tx: u64,
    /// Frames fully assembled and delivered to handlers.
    pub frames_rx: u64,
    /// Payload bytes written.
    pub bytes_tx: u64,
    /// Payload bytes read.
    pub bytes_rx: u64,
    /// Frames rejected at `transmit_dataframe` (oversized or queue full).
    pub tx_rejected: u64,
    /// Inbound frames dropped (overflow, watchdog, aborted transmissions).
    pub rx_dropped: u64,
    /// Times the watchdog forced the medium back to idle.
    pub release_timeouts: u64,
}

enum RxStep {
    /// Nothing readable, or nothing consumable right now.
    Idle,
    /// Consumed some input; call again.
    Progress,
    /// A complete frame is ready for the handlers.
    Frame(Dataframe),
}

struct LinkInner<P> {
    port: P,
    release_timeout: Duration,
    /// Medium state: blocked by a peer's BLOCK/DATA until FREE or watchdog.
    blocked: bool,
    /// When the medium was last blocked or refreshed; None disarms the
    /// watchdog.
    blocked_at: Option<Instant>,
    /// TX state: a popped frame is on the wire until FREE is written.
    transmitting: bool,
    tx_frame: Vec<u8>,
    tx_pos: usize,
    tx_queue: VecDeque<Vec<u8>>,
    /// RX state: inside a DATA chunk with this many bytes outstanding.
    receiving: bool,
    rx_remaining: usize,
    rx_frame: Vec<u8>,
    /// The frame under assembly overflowed; discard until FREE.
    rx_overflow: bool,
    stats: LinkStats,
}

impl<P: PhysicalPort> LinkInner<P> {
    /// Writable room right now; `usize::MAX` for unbounded ports.
    fn write_room(&self) -> usize {
        let writable = self.port.writable();
        if writable < 0 {
            usize::MAX
        } else {
            writable as usize
        }
    }

    /// A peer claimed the medium. If we were mid-transmission the channel
    /// is garbled; drop the active frame rather than resume it.
    fn peer_claimed_medium(&mut self, now: Instant) {
        if self.transmitting {
            debug!(
                dropped = self.tx_frame.len(),
                "peer claimed medium mid-transmission, dropping active frame"
            );
            self.tx_frame.clear();
            self.tx_pos = 0;
            self.transmitting = false;
            self.stats.rx_dropped += 1;
        }
        self.blocked = true;
        self.blocked_at = Some(now);
    }

    /// Consume one unit of input: a control byte, or payload of the current
    /// chunk.
    fn rx_step(&mut self, now: Instant) -> RxStep {
        let readable = self.port.readable();
        if readable == 0 {
            return RxStep::Idle;
        }

        if !self.receiving {
            let Some(byte) = self.port.read_byte() else {
                return RxStep::Idle;
            };
            match ControlByte::from_byte(byte) {
                Some(ControlByte::Block) => {
                    trace!("medium blocked by peer");
                    self.peer_claimed_medium(now);
                }
                Some(ControlByte::Data) => {
                    self.peer_claimed_medium(now);
                    match self.port.read_byte() {
                        Some(0) => debug!("empty DATA chunk ignored"),
                        Some(len) => {
                            self.receiving = true;
                            self.rx_remaining = len as usize;
                        }
                        None => warn!("DATA header missing its length byte"),
                    }
                }
                Some(ControlByte::Free) => {
                    trace!("medium freed by peer");
                    self.blocked = false;
                    self.blocked_at = None;
                    self.receiving = false;
                    self.rx_remaining = 0;
                    if self.rx_overflow {
                        self.rx_overflow = false;
                        self.rx_frame.clear();
                    } else if !self.rx_frame.is_empty() {
                        let frame = mem::take(&mut self.rx_frame);
                        self.stats.frames_rx += 1;
                        self.stats.bytes_rx += frame.len() as u64;
                        return RxStep::Frame(frame);
                    }
                }
                None => {
                    debug!(byte, "unknown control byte ignored");
                }
            }
            RxStep::Progress
        } else {
            let take = self.rx_remaining.min(readable);
            let mut buf = vec![0u8; take];
            let read = self.port.read_data(&mut buf);
            buf.truncate(read);
            if read == 0 {
                return RxStep::Idle;
            }
            // Payload is flowing; keep the watchdog fed.
            self.blocked_at = Some(now);
            if !self.rx_overflow {
                if self.rx_frame.len() + buf.len() > MAX_FRAME_LEN {
                    warn!(
                        assembled = self.rx_frame.len(),
                        incoming = buf.len(),
                        "receive buffer overflow, dropping frame"
                    );
                    self.rx_frame.clear();
                    self.rx_overflow = true;
                    self.stats.rx_dropped += 1;
                } else {
                    self.rx_frame.extend_from_slice(&buf);
                }
            }
            self.rx_remaining -= read;
            if self.rx_remaining == 0 {
                self.receiving = false;
            }
            RxStep::Progress
        }
    }

    /// Assume the blocker died if it has been silent past the timeout.
    fn check_release(&mut self, now: Instant) {
        let Some(blocked_at) = self.blocked_at else {
            return;
        };
        if now.saturating_duration_since(blocked_at) > self.release_timeout {
            self.blocked = false;
            self.blocked_at = None;
            self.stats.release_timeouts += 1;
            if self.receiving || !self.rx_frame.is_empty() || self.rx_overflow {
                debug!("release timeout mid-reception, dropping partial frame");
                self.receiving = false;
                self.rx_remaining = 0;
                self.rx_frame.clear();
                self.rx_overflow = false;
                self.stats.rx_dropped += 1;
            }
        }
    }

    /// One write action per tick: claim the medium, push a chunk, or free
    /// the medium.
    fn tx_step(&mut self) {
        if self.blocked || (!self.transmitting && self.tx_queue.is_empty()) {
            return;
        }

        let room = self.write_room();
        if self.transmitting && self.tx_pos >= self.tx_frame.len() && room > 0 {
            self.transmitting = false;
            self.tx_frame.clear();
            self.tx_pos = 0;
            self.port.write_byte(ControlByte::Free as u8);
            self.stats.frames_tx += 1;
            trace!("medium freed");
        } else if !self.transmitting && room > 0 {
            if let Some(frame) = self.tx_queue.pop_front() {
                trace!(len = frame.len(), "claiming medium");
                self.tx_frame = frame;
                self.tx_pos = 0;
                self.transmitting = true;
                self.port.write_byte(ControlByte::Block as u8);
            }
        } else if self.transmitting && room > 2 {
            let remaining = self.tx_frame.len() - self.tx_pos;
            let chunk = remaining.min(MAX_CHUNK_LEN).min(room - 2);
            let mut buf = Vec::with_capacity(chunk + 2);
            buf.push(ControlByte::Data as u8);
            buf.push(chunk as u8);
            buf.extend_from_slice(&self.tx_frame[self.tx_pos..self.tx_pos + chunk]);
            self.port.write_data(&buf);
            self.tx_pos += chunk;
            self.stats.bytes_tx += chunk as u64;
        }
    }
}

/// The medium-access and framing engine for one [`PhysicalPort`].
///
/// The link owns its port exclusively. Drive it through a
/// [`Scheduler`](crate::scheduler::Scheduler) or call [`Datalink::tick`]
/// directly.
pub struct Datalink<P: PhysicalPort> {
    inner: RefCell<LinkInner<P>>,
    receive_handlers: HandlerGroup<Dataframe>,
}

impl<P: PhysicalPort> Datalink<P> {
    pub fn new(port: P) -> Self {
        Self::with_config(port, DatalinkConfig::default())
    }

    pub fn with_config(port: P, config: DatalinkConfig) -> Self {
        Self {
            inner: RefCell::new(LinkInner {
                port,
                release_timeout: config.release_timeout,
                blocked: false,
                blocked_at: None,
                transmitting: false,
                tx_frame: Vec::new(),
                tx_pos: 0,
                tx_queue: VecDeque::new(),
                receiving: false,
                rx_remaining: 0,
                rx_frame: Vec::new(),
                rx_overflow: false,
                stats: LinkStats::default(),
            }),
            receive_handlers: HandlerGroup::new(),
        }
    }

    /// Replace the watchdog timeout, see
    /// [`DatalinkConfig::release_timeout`].
    pub fn set_physical_release_timeout(&self, timeout: Duration) {
        self.inner.borrow_mut().release_timeout = timeout;
    }

    pub fn stats(&self) -> LinkStats {
        self.inner.borrow().stats
    }

    /// Advance the RX, watchdog and TX state machines once.
    ///
    /// Completed frames are handed to the receive handlers from here, after
    /// the internal state borrow is released, so a handler may call
    /// [`Datalink::transmit_dataframe`] on this same link.
    pub fn tick(&self, now: Instant) {
        loop {
            let step = self.inner.borrow_mut().rx_step(now);
            match step {
                RxStep::Idle => break,
                RxStep::Progress => continue,
                RxStep::Frame(frame) => self.receive_handlers.call(frame),
            }
        }

        let mut inner = self.inner.borrow_mut();
        inner.check_release(now);
        inner.tx_step();
    }
}

impl<P: PhysicalPort> FrameLink for Datalink<P> {
    fn transmit_dataframe(&self, frame: &[u8]) -> bool {
        if frame.is_empty() || frame.len() > MAX_FRAME_LEN {
            warn!(len = frame.len(), max = MAX_FRAME_LEN, "frame rejected");
            self.inner.borrow_mut().stats.tx_rejected += 1;
            return false;
        }
        let mut inner = self.inner.borrow_mut();
        if inner.tx_queue.len() >= FRAME_QUEUE_LEN {
            warn!("transmit queue full, frame rejected");
            inner.stats.tx_rejected += 1;
            return false;
        }
        inner.tx_queue.push_back(frame.to_vec());
        true
    }

    fn buffer_free_space(&self) -> usize {
        FRAME_QUEUE_LEN - self.inner.borrow().tx_queue.len()
    }

    fn add_receive_handler(&self, handler: Handler<Dataframe>) {
        self.receive_handlers.add(handler);
    }

    fn clear_receive_handlers(&self) {
        self.receive_handlers.clear();
    }
}

impl<P: PhysicalPort> Task for Datalink<P> {
    fn name(&self) -> &str {
        "datalink"
    }

    /// Start blocked and already aged: a node joining a running bus must
    /// wait out any in-flight exchange before its first transmission.
    fn init(&self, now: Instant) {
        let mut inner = self.inner.borrow_mut();
        inner.transmitting = false;
        inner.blocked = true;
        inner.blocked_at = Some(now.checked_sub(STARTUP_LISTEN).unwrap_or(now));
    }

    fn tick(&self, now: Instant) {
        Datalink::tick(self, now);
    }

    fn check(&self) -> bool {
        let inner = self.inner.borrow();
        !inner.tx_queue.is_empty()
            || (inner.transmitting && inner.port.writable() != 0)
            || inner.port.readable() > 0
    }
}
