// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Transport queue
//!
//! Bounded FIFO between the producers (telemetry, protocol handlers) and the
//! single session consumer. Enqueue waits at most a short timeout for a free
//! slot. Dequeue policy depends on the message class:
//! - `Data` leaves the queue after one publish attempt, whatever the result
//! - `ConfigSnapshot` and `Status` stay at the head until published
//!
//! The session marks the queue offline while it has no broker connection;
//! `Data` is refused at enqueue meanwhile, since stale telemetry would only
//! crowd out status messages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};

use crate::error::TransportError;
use crate::param::Document;
use crate::protocol::{status_payload, Topics};

/// Default number of slots
pub const DEFAULT_CAPACITY: usize = 25;

/// Default enqueue timeout
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Class of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Telemetry, best effort
    Data,
    /// Configuration snapshot, at least once
    ConfigSnapshot,
    /// Status text, at least once
    Status,
}

impl MessageClass {
    /// Whether a failed publish keeps the message at the head
    pub fn retains_until_sent(&self) -> bool {
        !matches!(self, Self::Data)
    }

    /// Topic this class is published on
    pub fn topic(&self, topics: &Topics) -> String {
        match self {
            Self::Data => topics.up_data(),
            Self::ConfigSnapshot => topics.up_config(),
            Self::Status => topics.up_status(),
        }
    }
}

/// A self-contained outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub class: MessageClass,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// Telemetry document
    pub fn data(document: &Document) -> Result<Self, TransportError> {
        Self::document(MessageClass::Data, document)
    }

    /// Configuration snapshot document
    pub fn config(document: &Document) -> Result<Self, TransportError> {
        Self::document(MessageClass::ConfigSnapshot, document)
    }

    /// Status text; texts longer than the status limit are refused
    pub fn status(text: &str) -> Result<Self, TransportError> {
        Ok(Self {
            class: MessageClass::Status,
            payload: status_payload(text)?,
        })
    }

    fn document(class: MessageClass, document: &Document) -> Result<Self, TransportError> {
        let payload =
            serde_json::to_vec(document).map_err(|e| TransportError::Malformed(e.to_string()))?;
        Ok(Self { class, payload })
    }
}

/// Queue tunables
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of slots
    pub capacity: usize,
    /// Longest wait for a free slot
    pub enqueue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }
}

/// Bounded outbound queue
#[derive(Debug)]
pub struct TransportQueue {
    config: QueueConfig,
    slots: Mutex<VecDeque<OutboundMessage>>,
    not_full: Condvar,
    dropped: AtomicU64,
    online: AtomicBool,
}

impl TransportQueue {
    /// Queue with default tunables
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Queue with custom tunables
    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            slots: Mutex::new(VecDeque::with_capacity(config.capacity)),
            config,
            not_full: Condvar::new(),
            dropped: AtomicU64::new(0),
            online: AtomicBool::new(true),
        }
    }

    /// Open or close the gate for `Data`; set by the session owner
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Whether `Data` is accepted
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    fn slots(&self) -> MutexGuard<'_, VecDeque<OutboundMessage>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message, waiting at most the enqueue timeout for a slot
    pub fn enqueue(&self, message: OutboundMessage) -> Result<(), TransportError> {
        if message.class == MessageClass::Data && !self.is_online() {
            debug!("Offline, discarding telemetry");
            return Err(TransportError::NotConnected);
        }
        let capacity = self.config.capacity;
        let (mut slots, _) = self
            .not_full
            .wait_timeout_while(self.slots(), self.config.enqueue_timeout, |s| {
                s.len() >= capacity
            })
            .unwrap_or_else(PoisonError::into_inner);
        if slots.len() >= capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Queue full, dropping {:?} message", message.class);
            return Err(TransportError::QueueFull {
                timeout_ms: self.config.enqueue_timeout.as_millis() as u64,
            });
        }
        slots.push_back(message);
        Ok(())
    }

    /// Enqueue a status text, logging instead of failing
    pub fn push_status(&self, text: &str) -> bool {
        match OutboundMessage::status(text).and_then(|m| self.enqueue(m)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Status not queued ({}): {}", e, text);
                false
            }
        }
    }

    /// Copy of the head message
    pub fn peek(&self) -> Option<OutboundMessage> {
        self.slots().front().cloned()
    }

    /// Settle the head after a publish attempt
    ///
    /// The head is removed when it was published or when its class is not
    /// retried. Returns whether it was removed.
    pub fn complete_head(&self, published: bool) -> bool {
        let mut slots = self.slots();
        let remove = match slots.front() {
            Some(head) => published || !head.class.retains_until_sent(),
            None => false,
        };
        if remove {
            if let Some(head) = slots.pop_front() {
                if !published {
                    debug!("Discarding unsent {:?} message", head.class);
                }
            }
            self.not_full.notify_one();
        }
        remove
    }

    /// Messages waiting
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    /// Whether no message is waiting
    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Messages refused at enqueue since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Classes of the waiting messages, head first
    pub fn classes(&self) -> Vec<MessageClass> {
        self.slots().iter().map(|m| m.class).collect()
    }
}

impl Default for TransportQueue {
    fn default() -> Self {
        Self::new()
    }
}
