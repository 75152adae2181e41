//! In-memory physical layers.
//!
//! [`SharedBus`] models the kind of medium this stack is built for: one
//! half-duplex channel that every attached node hears. A write from any
//! endpoint lands in the inbox of every *other* endpoint; a node never reads
//! back its own bytes. The bus is lossless and ordered, which makes it
//! suitable for driving the whole stack in tests, demos and simulations
//! without hardware.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::traits::PhysicalPort;

struct BusState {
    inboxes: Vec<VecDeque<u8>>,
    write_window: isize,
    connected: bool,
}

/// A multi-endpoint half-duplex byte bus.
#[derive(Clone)]
pub struct SharedBus {
    state: Rc<RefCell<BusState>>,
}

impl SharedBus {
    /// A lossless bus with no write limit.
    pub fn new() -> Self {
        Self::with_write_window(-1)
    }

    /// A bus whose ports advertise at most `window` writable bytes at a
    /// time (`-1` for unlimited). Small windows force the datalink to chunk
    /// frames across several DATA commands.
    pub fn with_write_window(window: isize) -> Self {
        Self {
            state: Rc::new(RefCell::new(BusState {
                inboxes: Vec::new(),
                write_window: window,
                connected: true,
            })),
        }
    }

    /// Attach a new endpoint.
    pub fn port(&self) -> BusPort {
        let mut state = self.state.borrow_mut();
        state.inboxes.push(VecDeque::new());
        BusPort {
            state: self.state.clone(),
            index: state.inboxes.len() - 1,
        }
    }

    /// Connect or cut the medium. While cut, writes vanish silently.
    pub fn set_connected(&self, connected: bool) {
        self.state.borrow_mut().connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    /// Number of attached endpoints.
    pub fn endpoints(&self) -> usize {
        self.state.borrow().inboxes.len()
    }
}

impl Default for SharedBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a [`SharedBus`].
pub struct BusPort {
    state: Rc<RefCell<BusState>>,
    index: usize,
}

impl BusPort {
    fn broadcast(&self, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return;
        }
        for (i, inbox) in state.inboxes.iter_mut().enumerate() {
            if i != self.index {
                inbox.extend(data.iter().copied());
            }
        }
    }
}

impl PhysicalPort for BusPort {
    fn readable(&self) -> usize {
        self.state.borrow().inboxes[self.index].len()
    }

    fn writable(&self) -> isize {
        self.state.borrow().write_window
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.state.borrow_mut().inboxes[self.index].pop_front()
    }

    fn read_data(&mut self, buf: &mut [u8]) -> usize {
        let mut state = self.state.borrow_mut();
        let inbox = &mut state.inboxes[self.index];
        let count = buf.len().min(inbox.len());
        for slot in buf.iter_mut().take(count) {
            *slot = inbox.pop_front().unwrap_or(0);
        }
        count
    }

    fn write_byte(&mut self, byte: u8) {
        self.broadcast(&[byte]);
    }

    fn write_data(&mut self, data: &[u8]) {
        self.broadcast(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_reaches_other_ports_only() {
        let bus = SharedBus::new();
        let mut a = bus.port();
        let mut b = bus.port();
        let mut c = bus.port();

        a.write_data(&[1, 2, 3]);

        assert_eq!(a.readable(), 0);
        assert_eq!(b.readable(), 3);
        assert_eq!(c.readable(), 3);
        assert_eq!(b.read_byte(), Some(1));

        let mut buf = [0u8; 8];
        assert_eq!(c.read_data(&mut buf), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_read_data_partial() {
        let bus = SharedBus::new();
        let mut a = bus.port();
        let mut b = bus.port();

        a.write_data(&[1, 2, 3, 4, 5]);
        let mut buf = [0u8; 2];
        assert_eq!(b.read_data(&mut buf), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(b.readable(), 3);
    }

    #[test]
    fn test_write_window() {
        let bus = SharedBus::with_write_window(16);
        let a = bus.port();
        assert_eq!(a.writable(), 16);

        let unbounded = SharedBus::new().port();
        assert_eq!(unbounded.writable(), -1);
    }

    #[test]
    fn test_disconnected_bus_drops_writes() {
        let bus = SharedBus::new();
        let mut a = bus.port();
        let mut b = bus.port();

        bus.set_connected(false);
        a.write_data(&[1, 2, 3]);
        assert_eq!(b.readable(), 0);

        bus.set_connected(true);
        a.write_byte(9);
        assert_eq!(b.read_byte(), Some(9));
    }
}
