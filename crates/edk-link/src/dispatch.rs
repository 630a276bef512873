use chrono::Utc;
use edk_core::Reading;
use std::collections::VecDeque;
use tracing::{debug, warn};

pub const HISTORY_CAPACITY: usize = 100;

/// A sink for live readings: visualization feed, list display, logger.
/// Returning an error isolates this consumer for that reading; delivery to
/// the others continues.
pub trait ReadingConsumer {
    fn name(&self) -> &str;
    fn on_reading(&mut self, reading: &Reading) -> anyhow::Result<()>;
}

/// Fans each inbound reading out to every registered consumer, synchronously
/// and in registration order, while keeping a bounded recent-history ring.
pub struct ReadingDispatcher {
    history: VecDeque<Reading>,
    consumers: Vec<Box<dyn ReadingConsumer>>,
    next_seq: u64,
    active_device: Option<String>,
}

impl ReadingDispatcher {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            consumers: Vec::new(),
            next_seq: 0,
            active_device: None,
        }
    }

    /// Readings are dropped entirely while no device is selected.
    pub fn set_active_device(&mut self, device_id: Option<String>) {
        self.active_device = device_id;
    }

    pub fn active_device(&self) -> Option<&str> {
        self.active_device.as_deref()
    }

    pub fn subscribe(&mut self, consumer: Box<dyn ReadingConsumer>) {
        self.consumers.push(consumer);
    }

    pub fn unsubscribe(&mut self, name: &str) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|consumer| consumer.name() != name);
        self.consumers.len() != before
    }

    pub fn ingest(&mut self, angle_degrees: f64, distance: f64) -> Option<Reading> {
        if self.active_device.is_none() {
            debug!(event = "reading_dropped", reason = "no active device");
            return None;
        }

        self.next_seq += 1;
        let reading = Reading {
            angle_degrees,
            distance,
            observed_at: Utc::now(),
            seq: self.next_seq,
        };

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(reading.clone());

        for consumer in &mut self.consumers {
            if let Err(err) = consumer.on_reading(&reading) {
                warn!(
                    event = "consumer_error",
                    consumer = consumer.name(),
                    error = %err
                );
            }
        }

        Some(reading)
    }

    /// Newest-first slice of the history, at most `n` entries.
    pub fn recent(&self, n: usize) -> Vec<Reading> {
        self.history.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

impl Default for ReadingDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
