//! Handler slots shared by every transport implementation
//!
//! Each transport keeps exactly one message handler and at most one
//! closed handler; registering again replaces the previous one.
//!
//! Envelopes that arrive before any message handler is registered are held
//! back and handed over, in order, when the first one is installed. Reader
//! tasks start as soon as a transport is built, which is usually before the
//! bus on top of it has wired itself in.

use std::collections::VecDeque;

use parking_lot::{Mutex, RwLock};

use super::traits::{ClosedHandler, Envelope, MessageHandler, TransportError};

#[derive(Default)]
struct MessageSlot {
    handler: Option<MessageHandler>,
    backlog: VecDeque<Envelope>,
}

#[derive(Default)]
pub(crate) struct HandlerSlots {
    message: Mutex<MessageSlot>,
    closed: RwLock<Option<ClosedHandler>>,
}

impl HandlerSlots {
    /// Install the message handler and flush anything that arrived before it
    ///
    /// The backlog is flushed under the slot lock so later deliveries cannot
    /// overtake it.
    pub(crate) fn set_message(&self, handler: MessageHandler) {
        let mut slot = self.message.lock();
        if !slot.backlog.is_empty() {
            tracing::debug!(count = slot.backlog.len(), "Flushing messages received before handler registration");
        }
        while let Some(envelope) = slot.backlog.pop_front() {
            handler(envelope);
        }
        slot.handler = Some(handler);
    }

    pub(crate) fn set_closed(&self, handler: ClosedHandler) {
        *self.closed.write() = Some(handler);
    }

    /// Hand an inbound envelope to the registered handler
    ///
    /// The lock is released before the handler runs. Without a handler the
    /// envelope is queued until one is registered.
    pub(crate) fn deliver(&self, envelope: Envelope) {
        let handler = {
            let mut slot = self.message.lock();
            match slot.handler.clone() {
                Some(handler) => handler,
                None => {
                    tracing::trace!("No message handler registered yet, holding message");
                    slot.backlog.push_back(envelope);
                    return;
                }
            }
        };
        handler(envelope);
    }

    pub(crate) fn fire_closed(&self, error: Option<TransportError>) {
        let handler = self.closed.read().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }
}
