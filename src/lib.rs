//! In-memory AMQP-style message queue engine.
//!
//! The core is the queue engine ([`core::queue::Queue`]): ordered
//! containers with pluggable delivery disciplines, consumer credit and
//! filtering, message groups, policies, persistent-store coordination
//! and auto-deletion. Around it sit the exchange registry
//! ([`core::exchange::ExchangeRegistry`]) routing publications to bound
//! queues, and the sender path ([`sender::SenderContext`]) encoding
//! messages into AMQP 1.0 wire form.

pub mod config;
pub mod core;
pub mod logging;
pub mod sender;

pub use crate::core::error::{Error, Result};
