//! Address-to-handler registrations and pending reply waiters.
//!
//! Both maps live behind `parking_lot` mutexes that are never held across an
//! await point. Reply waiters are only ever resolved through
//! [`Registry::take_waiter`]: whichever caller gets `Some` back owns the
//! waiter and is the only one allowed to invoke its callback.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;

use super::envelope::Headers;
use super::message::{Message, Response};

/// Callback invoked for every message delivered to a registered address.
pub type Handler = Arc<dyn Fn(Message) + Send + Sync>;

/// Callback invoked exactly once with the outcome of a send-with-reply.
pub type ReplyCallback = Box<dyn FnOnce(Response) + Send>;

/// Live registrations for one address.
struct AddressEntry {
    /// Headers sent with the `register` frame that made the address live.
    headers: Headers,
    /// Handlers in registration order.
    handlers: Vec<(String, Handler)>,
}

/// Result of removing a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// No registration with that id existed at the address.
    NotFound,
    /// Removed; other registrations keep the address live.
    Removed,
    /// Removed the last registration; the address is no longer live.
    RemovedLast,
}

impl Removal {
    pub fn removed(&self) -> bool {
        !matches!(self, Removal::NotFound)
    }
}

/// A pending correlation for one outstanding send-with-reply.
pub struct ReplyWaiter {
    callback: ReplyCallback,
    timer: Option<AbortHandle>,
}

impl ReplyWaiter {
    /// Cancel the timeout task, if one was attached. A no-op if it already fired.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn resolve(self, response: Response) {
        (self.callback)(response)
    }
}

/// Registration and reply-waiter state owned by one [`EventBus`](super::EventBus).
#[derive(Default)]
pub struct Registry {
    registrations: Mutex<HashMap<String, AddressEntry>>,
    replies: Mutex<HashMap<String, ReplyWaiter>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a registration. Returns `true` if it is the first one for the
    /// address, i.e. the bridge has to be told about it.
    ///
    /// Registering an id that already exists at the address replaces its
    /// handler in place.
    pub fn add_registration(
        &self,
        address: &str,
        id: &str,
        headers: &Headers,
        handler: Handler,
    ) -> bool {
        let mut registrations = self.registrations.lock();
        match registrations.get_mut(address) {
            Some(entry) => {
                match entry.handlers.iter_mut().find(|(existing, _)| existing == id) {
                    Some(slot) => slot.1 = handler,
                    None => entry.handlers.push((id.to_string(), handler)),
                }
                false
            }
            None => {
                registrations.insert(
                    address.to_string(),
                    AddressEntry {
                        headers: headers.clone(),
                        handlers: vec![(id.to_string(), handler)],
                    },
                );
                debug!(address, "address is now live");
                true
            }
        }
    }

    /// Remove one registration.
    pub fn remove_registration(&self, address: &str, id: &str) -> Removal {
        let mut registrations = self.registrations.lock();
        let Some(entry) = registrations.get_mut(address) else {
            return Removal::NotFound;
        };

        let before = entry.handlers.len();
        entry.handlers.retain(|(existing, _)| existing != id);
        if entry.handlers.len() == before {
            return Removal::NotFound;
        }

        if entry.handlers.is_empty() {
            registrations.remove(address);
            debug!(address, "address is no longer live");
            Removal::RemovedLast
        } else {
            Removal::Removed
        }
    }

    /// Handlers that should receive a delivery.
    ///
    /// Point-to-point deliveries (`send == true`) go to exactly one handler,
    /// the earliest registered; broadcasts go to all of them.
    pub fn handlers_for(&self, address: &str, send: bool) -> Vec<Handler> {
        let registrations = self.registrations.lock();
        match registrations.get(address) {
            Some(entry) if send => entry
                .handlers
                .first()
                .map(|(_, handler)| vec![Arc::clone(handler)])
                .unwrap_or_default(),
            Some(entry) => entry
                .handlers
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.registrations.lock().contains_key(address)
    }

    /// Every live address with the headers it was registered with.
    pub fn addresses(&self) -> Vec<(String, Headers)> {
        let registrations = self.registrations.lock();
        let mut addresses: Vec<(String, Headers)> = registrations
            .iter()
            .map(|(address, entry)| (address.clone(), entry.headers.clone()))
            .collect();
        addresses.sort_by(|a, b| a.0.cmp(&b.0));
        addresses
    }

    /// Number of handlers registered at an address.
    pub fn registration_count(&self, address: &str) -> usize {
        self.registrations
            .lock()
            .get(address)
            .map_or(0, |entry| entry.handlers.len())
    }

    /// Track a new reply waiter. Reply addresses are generated per call, so
    /// an existing entry is never overwritten in practice.
    pub fn insert_waiter(&self, reply_address: &str, callback: ReplyCallback) {
        let mut replies = self.replies.lock();
        replies.insert(
            reply_address.to_string(),
            ReplyWaiter {
                callback,
                timer: None,
            },
        );
        debug!(reply_address, pending = replies.len(), "registered reply waiter");
    }

    /// Attach the timeout task to a waiter. If the waiter was already
    /// resolved the timer is aborted and `false` is returned.
    pub fn attach_timer(&self, reply_address: &str, timer: AbortHandle) -> bool {
        let mut replies = self.replies.lock();
        match replies.get_mut(reply_address) {
            Some(waiter) => {
                waiter.timer = Some(timer);
                true
            }
            None => {
                timer.abort();
                false
            }
        }
    }

    /// Atomically remove a waiter. Only the caller that receives `Some` may
    /// resolve it.
    pub fn take_waiter(&self, reply_address: &str) -> Option<ReplyWaiter> {
        self.replies.lock().remove(reply_address)
    }

    /// Number of reply waiters still pending.
    pub fn pending_replies(&self) -> usize {
        self.replies.lock().len()
    }
}
