//! In-Process Event Bus
//!
//! Same contract as the durable queue, held in process memory. Used by unit
//! tests and the single-process dev profile; leases run on the tokio clock
//! so paused-time tests can drive redelivery.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::{BusError, Delivery, EventBus, EventStream};
use crate::settings::EventSettings;

#[derive(Debug, Clone)]
struct Message {
    receipt: i64,
    key: String,
    payload: serde_json::Value,
    attempts: u32,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<Message>,
    inflight: HashMap<i64, (Message, Instant)>,
    dead: Vec<Message>,
}

/// In-process [`EventBus`] implementation
pub struct MemoryEventBus {
    settings: EventSettings,
    next_receipt: Mutex<i64>,
    queues: Mutex<HashMap<EventStream, Queue>>,
}

impl MemoryEventBus {
    pub fn new(settings: EventSettings) -> Self {
        Self {
            settings,
            next_receipt: Mutex::new(1),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Move expired leases back to pending so they can be claimed again.
    fn reclaim(queue: &mut Queue, now: Instant) {
        let expired: Vec<i64> = queue
            .inflight
            .iter()
            .filter(|(_, (_, deadline))| now >= *deadline)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some((message, _)) = queue.inflight.remove(&receipt) {
                queue.pending.push_back(message);
            }
        }
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(
        &self,
        stream: EventStream,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<(), BusError> {
        let receipt = {
            let mut next = self.next_receipt.lock();
            let receipt = *next;
            *next += 1;
            receipt
        };

        self.queues
            .lock()
            .entry(stream)
            .or_default()
            .pending
            .push_back(Message {
                receipt,
                key: key.to_string(),
                payload,
                attempts: 0,
            });
        Ok(())
    }

    async fn pull(&self, stream: EventStream) -> Result<Option<Delivery>, BusError> {
        let now = Instant::now();
        let visibility = Duration::from_secs(self.settings.visibility_timeout_secs);
        let mut queues = self.queues.lock();
        let queue = queues.entry(stream).or_default();

        Self::reclaim(queue, now);

        while let Some(mut message) = queue.pending.pop_front() {
            if message.attempts >= self.settings.max_attempts {
                queue.dead.push(message);
                continue;
            }
            message.attempts += 1;

            let delivery = Delivery {
                receipt: message.receipt,
                stream,
                key: message.key.clone(),
                payload: message.payload.clone(),
                attempts: message.attempts,
            };
            queue
                .inflight
                .insert(message.receipt, (message, now + visibility));
            return Ok(Some(delivery));
        }

        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        if let Some(queue) = self.queues.lock().get_mut(&delivery.stream) {
            queue.inflight.remove(&delivery.receipt);
        }
        Ok(())
    }

    async fn dead_letters(&self, stream: EventStream) -> Result<Vec<Delivery>, BusError> {
        let queues = self.queues.lock();
        Ok(queues
            .get(&stream)
            .map(|queue| {
                queue
                    .dead
                    .iter()
                    .map(|message| Delivery {
                        receipt: message.receipt,
                        stream,
                        key: message.key.clone(),
                        payload: message.payload.clone(),
                        attempts: message.attempts,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
