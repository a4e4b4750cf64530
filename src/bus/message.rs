//! Received messages, reply outcomes and per-call delivery options.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::client::EventBus;
use super::envelope::{Headers, InboundEnvelope};
use super::error::BusError;

/// Read-only view of a message delivered by the bridge.
///
/// A message keeps a handle to the bus it arrived on so it can be replied to
/// from inside a handler or reply callback.
#[derive(Clone)]
pub struct Message {
    address: String,
    body: Value,
    headers: Headers,
    reply_address: Option<String>,
    send: bool,
    bus: EventBus,
}

impl Message {
    pub(crate) fn from_envelope(address: String, envelope: InboundEnvelope, bus: EventBus) -> Self {
        Self {
            address,
            body: envelope.body,
            headers: envelope.headers,
            reply_address: envelope.reply_address,
            send: envelope.send,
            bus,
        }
    }

    /// Address the message was delivered to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The body (content) of the message.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Deserialize the body into a typed value.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn reply_address(&self) -> Option<&str> {
        self.reply_address.as_deref()
    }

    /// True if this message was the result of a send (vs. publish).
    pub fn is_send(&self) -> bool {
        self.send
    }

    /// True if the sender is waiting for a reply.
    pub fn is_replyable(&self) -> bool {
        self.reply_address.is_some()
    }

    /// Send a reply to this message without waiting for a reply back.
    ///
    /// Returns `Ok(false)` without touching the wire if the message carries no
    /// reply address.
    pub async fn reply<B: Serialize + ?Sized>(
        &self,
        body: &B,
        options: DeliveryOptions,
    ) -> Result<bool, BusError> {
        match self.reply_address.as_deref() {
            Some(reply_address) => {
                self.bus.send(reply_address, body, options).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Send a reply and wait for the replier's answer, enabling multi-hop
    /// exchanges. `callback` fires exactly once, with the next message or a
    /// timeout.
    pub async fn reply_with<B, F>(
        &self,
        body: &B,
        options: DeliveryOptions,
        callback: F,
    ) -> Result<bool, BusError>
    where
        B: Serialize + ?Sized,
        F: FnOnce(Response) + Send + 'static,
    {
        match self.reply_address.as_deref() {
            Some(reply_address) => {
                self.bus
                    .send_with_reply(reply_address, body, options, callback)
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("address", &self.address)
            .field("body", &self.body)
            .field("headers", &self.headers)
            .field("reply_address", &self.reply_address)
            .field("send", &self.send)
            .finish()
    }
}

/// Outcome delivered to a reply callback.
#[derive(Debug, Clone)]
pub enum Response {
    /// The reply arrived before the timeout.
    Reply(Message),
    /// No reply arrived in time.
    TimedOut,
}

impl Response {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Response::TimedOut)
    }

    /// The reply message, `None` if the wait timed out.
    pub fn message(&self) -> Option<&Message> {
        match self {
            Response::Reply(message) => Some(message),
            Response::TimedOut => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Response::Reply(message) => Some(message),
            Response::TimedOut => None,
        }
    }
}

/// Per-call options for `send`, `publish` and replies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryOptions {
    /// Headers to send with the message.
    pub headers: Headers,
    /// How long to wait for a reply. `None` uses the configured default.
    pub reply_timeout: Option<Duration>,
}

impl DeliveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_headers(headers: Headers) -> Self {
        Self {
            headers,
            reply_timeout: None,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }
}
