//! Handler lists for upward delivery between layers.
//!
//! Each layer exposes a `HandlerGroup` that the layer above registers a
//! callback on. Dispatch is queued rather than recursive: an item submitted
//! while a dispatch is already running (e.g. a receive handler sending a
//! packet back to its own node) is delivered by the outer dispatch loop once
//! the current item has been handed to every handler.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

/// A registered callback. Handlers receive the item by reference and must
/// copy whatever they need to retain past the call.
pub type Handler<T> = Box<dyn FnMut(&T)>;

/// An ordered list of callbacks with queued, non-recursive dispatch.
pub struct HandlerGroup<T> {
    handlers: RefCell<Vec<Handler<T>>>,
    pending: RefCell<VecDeque<T>>,
    dispatching: Cell<bool>,
}

impl<T> HandlerGroup<T> {
    pub fn new() -> Self {
        Self {
            handlers: RefCell::new(Vec::new()),
            pending: RefCell::new(VecDeque::new()),
            dispatching: Cell::new(false),
        }
    }

    /// Append a handler. Handlers are invoked in registration order.
    pub fn add(&self, handler: Handler<T>) {
        self.handlers.borrow_mut().push(handler);
    }

    /// Drop all registered handlers.
    pub fn clear(&self) {
        self.handlers.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.borrow().is_empty()
    }

    /// Deliver `item` to every handler. Items submitted from inside a
    /// handler are queued and delivered after the current item, in order.
    pub fn call(&self, item: T) {
        self.pending.borrow_mut().push_back(item);
        if self.dispatching.replace(true) {
            return;
        }
        loop {
            let next = self.pending.borrow_mut().pop_front();
            let Some(next) = next else { break };
            // Take the list out so handlers may register new handlers on
            // this group without aliasing the borrow. Additions only take
            // effect for subsequent items.
            let mut active = self.handlers.take();
            for handler in active.iter_mut() {
                handler(&next);
            }
            let mut added = self.handlers.take();
            active.append(&mut added);
            self.handlers.replace(active);
        }
        self.dispatching.set(false);
    }
}

impl<T> Default for HandlerGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}
