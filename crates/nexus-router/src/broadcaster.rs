//! Server-sent event broadcasting with bounded listener queues
//!
//! Slow consumers never block producers: each listener has a bounded queue
//! that drops its oldest event on overflow. Late arrivals are additionally
//! stored in a short-TTL table for one-shot polling retrieval.

use crate::shadow_race::LateArrival;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// A JSON event pushed to SSE listeners.
#[derive(Debug, Clone, Serialize)]
pub struct SseEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Bounded per-listener event queue with drop-oldest overflow.
pub struct ListenerQueue {
    events: Mutex<VecDeque<SseEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: Mutex<u64>,
}

impl ListenerQueue {
    fn new(capacity: usize) -> Self {
        ListenerQueue {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            dropped: Mutex::new(0),
        }
    }

    fn push(&self, event: SseEvent) {
        {
            let mut events = self.events.lock();
            if events.len() >= self.capacity {
                events.pop_front();
                *self.dropped.lock() += 1;
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Await the next event.
    pub async fn recv(&self) -> SseEvent {
        loop {
            if let Some(event) = self.events.lock().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop.
    pub fn try_recv(&self) -> Option<SseEvent> {
        self.events.lock().pop_front()
    }

    pub fn dropped_events(&self) -> u64 {
        *self.dropped.lock()
    }
}

struct StoredArrival {
    arrival: LateArrival,
    expires_at: DateTime<Utc>,
}

/// Fan-out hub for SSE events and the late-arrival table.
pub struct SseBroadcaster {
    listeners: Mutex<HashMap<String, Arc<ListenerQueue>>>,
    late_arrivals: Mutex<HashMap<String, StoredArrival>>,
    queue_capacity: usize,
    arrival_ttl_secs: i64,
}

impl SseBroadcaster {
    pub fn new(queue_capacity: usize, arrival_ttl_secs: u64) -> Self {
        SseBroadcaster {
            listeners: Mutex::new(HashMap::new()),
            late_arrivals: Mutex::new(HashMap::new()),
            queue_capacity,
            arrival_ttl_secs: arrival_ttl_secs as i64,
        }
    }

    pub fn register_listener(&self, listener_id: &str) -> Arc<ListenerQueue> {
        let queue = Arc::new(ListenerQueue::new(self.queue_capacity));
        self.listeners
            .lock()
            .insert(listener_id.to_string(), queue.clone());
        debug!(listener_id, "SSE listener registered");
        queue
    }

    pub fn unregister_listener(&self, listener_id: &str) {
        self.listeners.lock().remove(listener_id);
        debug!(listener_id, "SSE listener unregistered");
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Push a JSON event to every listener.
    pub fn push(&self, event_type: &str, data: serde_json::Value) {
        let event = SseEvent {
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
        };
        for queue in self.listeners.lock().values() {
            queue.push(event.clone());
        }
    }

    /// Store a late arrival for one-shot polling retrieval.
    pub fn store_late_arrival(&self, request_id: &str, arrival: LateArrival) {
        let mut arrivals = self.late_arrivals.lock();
        Self::purge_expired(&mut arrivals);
        arrivals.insert(
            request_id.to_string(),
            StoredArrival {
                arrival,
                expires_at: Utc::now() + Duration::seconds(self.arrival_ttl_secs),
            },
        );
    }

    /// Retrieve and consume a late arrival.
    pub fn get_late_arrival(&self, request_id: &str) -> Option<LateArrival> {
        let mut arrivals = self.late_arrivals.lock();
        Self::purge_expired(&mut arrivals);
        arrivals.remove(request_id).map(|stored| stored.arrival)
    }

    fn purge_expired(arrivals: &mut HashMap<String, StoredArrival>) {
        let now = Utc::now();
        arrivals.retain(|_, stored| stored.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broadcaster() -> SseBroadcaster {
        SseBroadcaster::new(4, 300)
    }

    #[tokio::test]
    async fn push_reaches_all_listeners() {
        let hub = broadcaster();
        let a = hub.register_listener("a");
        let b = hub.register_listener("b");

        hub.push("health", serde_json::json!({"overall": "healthy"}));

        assert_eq!(a.recv().await.event_type, "health");
        assert_eq!(b.recv().await.event_type, "health");
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let hub = broadcaster();
        let q = hub.register_listener("slow");

        for i in 0..6 {
            hub.push("pulse", serde_json::json!({ "cycle": i }));
        }

        // Capacity 4: cycles 0 and 1 were dropped.
        assert_eq!(q.dropped_events(), 2);
        assert_eq!(q.recv().await.data["cycle"], 2);
    }

    #[tokio::test]
    async fn late_arrival_is_one_shot() {
        let hub = broadcaster();
        let arrival = LateArrival {
            request_id: "req-1".to_string(),
            endpoint: "/simulate".to_string(),
            data: serde_json::json!({"pts": 31.5}),
            delay_ms: 412.0,
            arrival_time: Utc::now(),
        };
        hub.store_late_arrival("req-1", arrival);

        assert!(hub.get_late_arrival("req-1").is_some());
        assert!(hub.get_late_arrival("req-1").is_none());
    }

    #[tokio::test]
    async fn unregistered_listener_gets_nothing() {
        let hub = broadcaster();
        let q = hub.register_listener("a");
        hub.unregister_listener("a");
        hub.push("pulse", serde_json::json!({}));
        assert!(q.try_recv().is_none());
    }
}
