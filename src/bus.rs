//! Client for the TCP event bus bridge protocol.
//!
//! This module implements the client side of the bridge: a persistent TCP
//! connection carrying length-prefixed JSON frames.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐        TCP socket           ┌─────────────────────┐
//! │   Application   │  ◄─────────────────────────►│  event bus bridge   │
//! │   (EventBus)    │   length-prefixed JSON      │                     │
//! └─────────────────┘                             └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON:
//!
//! ```text
//! \x00\x00\x00\x0f{"type":"ping"}
//! ```
//!
//! Outbound commands are `ping`, `register`, `unregister`, `send` and
//! `publish`. Inbound frames are message deliveries (with an `address`) or
//! `err` notices (without one).
//!
//! # Usage
//!
//! ```ignore
//! use eventbus_bridge::bus::{DeliveryOptions, EventBus};
//! use serde_json::json;
//!
//! let bus = EventBus::new("localhost", 7000);
//! bus.connect().await?;
//! let response = bus
//!     .request("test.echo", &json!({"foo": "bar"}), DeliveryOptions::new())
//!     .await?;
//! ```

mod client;
mod envelope;
mod error;
mod framing;
mod message;
mod registry;

pub use client::{ConnectionState, ErrorHandler, EventBus};
pub use envelope::{Headers, Inbound, InboundEnvelope, OutboundEnvelope};
pub use error::BusError;
pub use framing::{
    decode_frame, encode_frame, write_frame, FrameReader, DEFAULT_MAX_FRAME_SIZE,
    LENGTH_PREFIX_SIZE,
};
pub use message::{DeliveryOptions, Message, Response};
pub use registry::{Handler, ReplyCallback};
