//! Outbound sender path.
//!
//! A [`SenderContext`] models one outgoing link: it encodes messages
//! into their AMQP 1.0 wire form and tracks a FIFO of unsettled
//! deliveries bounded by the link capacity and the credit granted by
//! the peer.

pub mod codec;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{info, trace, warn};

use crate::core::error::{Error, Result};
use crate::core::message::{Address, Message};

/// Terminal state reported by the peer for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected,
    Released,
}

#[derive(Debug, Default)]
struct DeliveryState {
    settled: AtomicBool,
    outcome: Mutex<Option<Outcome>>,
}

/// Handle onto one in-flight delivery. The peer side resolves it with
/// an outcome; either side may settle it.
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    id: u32,
    state: Arc<DeliveryState>,
}

impl DeliveryHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn settle(&self) {
        self.state.settled.store(true, Ordering::Release);
    }

    pub fn is_settled(&self) -> bool {
        self.state.settled.load(Ordering::Acquire)
    }

    pub fn resolve(&self, outcome: Outcome) {
        *self.state.outcome.lock() = Some(outcome);
    }

    pub fn outcome(&self) -> Option<Outcome> {
        *self.state.outcome.lock()
    }

    /// Settled locally or resolved remotely.
    pub fn is_delivered(&self) -> bool {
        self.is_settled() || self.outcome().is_some()
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome() == Some(Outcome::Accepted)
    }
}

/// One outstanding transfer.
struct Delivery {
    handle: DeliveryHandle,
    /// Delivery tag bytes: the little-endian id.
    tag: [u8; 4],
    encoded: Bytes,
}

/// An outgoing link with bounded unsettled state.
pub struct SenderContext {
    name: String,
    address: Address,
    capacity: usize,
    credit: u32,
    next_id: u32,
    deliveries: VecDeque<Delivery>,
}

impl SenderContext {
    pub fn new(name: impl Into<String>, address: Address, capacity: usize) -> Self {
        SenderContext {
            name: name.into(),
            address,
            capacity,
            credit: 0,
            next_id: 0,
            deliveries: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.address.name
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Shrinking capacity below the unsettled count is refused.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        if capacity < self.deliveries.len() {
            return Err(Error::Sender(
                "desired capacity is less than unsettled message count".to_string(),
            ));
        }
        self.capacity = capacity;
        Ok(())
    }

    /// Flow from the peer.
    pub fn add_credit(&mut self, credit: u32) {
        self.credit += credit;
    }

    pub fn credit(&self) -> u32 {
        self.credit
    }

    /// Encode and transfer a message. Returns `None` when the link has
    /// no room (unsettled at capacity) or no credit.
    pub fn send(&mut self, msg: &Message) -> Option<DeliveryHandle> {
        if self.process_unsettled() >= self.capacity || self.credit == 0 {
            return None;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let encoded = codec::encode_message(msg, &self.address);
        let handle = DeliveryHandle { id, state: Arc::new(DeliveryState::default()) };
        trace!(
            sender = %self.name,
            id,
            bytes = encoded.len(),
            "sending delivery"
        );
        self.deliveries.push_back(Delivery {
            handle: handle.clone(),
            tag: id.to_le_bytes(),
            encoded,
        });
        self.credit -= 1;
        Some(handle)
    }

    /// Wire form of the oldest unsettled delivery (tag, payload).
    pub fn peek_front(&self) -> Option<(&[u8; 4], &Bytes)> {
        self.deliveries.front().map(|d| (&d.tag, &d.encoded))
    }

    /// Drain deliveries the peer has confirmed from the head of the
    /// FIFO; returns the number still unsettled.
    pub fn process_unsettled(&mut self) -> usize {
        while let Some(front) = self.deliveries.front() {
            if !front.handle.is_delivered() {
                break;
            }
            let front = self.deliveries.pop_front().expect("peeked delivery vanished");
            match front.handle.outcome() {
                Some(Outcome::Rejected) => {
                    warn!(sender = %self.name, id = front.handle.id(), "delivery was rejected by peer");
                }
                Some(Outcome::Accepted) | None => {}
                Some(outcome) => {
                    info!(
                        sender = %self.name,
                        id = front.handle.id(),
                        ?outcome,
                        "delivery was not accepted by peer"
                    );
                }
            }
            front.handle.settle();
        }
        self.deliveries.len()
    }

    pub fn unsettled(&self) -> usize {
        self.deliveries.len()
    }

    /// True once nothing remains unsettled.
    pub fn settled(&mut self) -> bool {
        self.process_unsettled() == 0
    }
}
