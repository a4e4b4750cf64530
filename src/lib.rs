//! Event bus bridge client library
//!
//! This library provides an async client for the TCP event bus bridge
//! protocol:
//!
//! - `bus` - Connection engine, framing codec, envelopes and registry
//! - `config` - Client configuration (defaults, config file, environment)
//!
//! # Bus Module
//!
//! ```ignore
//! use eventbus_bridge::bus::{EventBus, Headers};
//! use eventbus_bridge::config::BusConfig;
//!
//! let bus = EventBus::with_config(BusConfig::resolve()?);
//! bus.set_error_handler(|err| eprintln!("bus error: {}", err));
//! bus.connect().await?;
//! bus.register("test.time", None, &Headers::new(), |msg| {
//!     println!("{}", msg.body());
//! })
//! .await?;
//! ```

pub mod bus;
pub mod config;
