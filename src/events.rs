// Lifecycle event bus with bounded, best-effort subscribers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::call::Cdr;
use crate::{CallId, CallState};

#[derive(Debug, Clone)]
pub enum ServerEvent {
    CallStarted {
        call_id: CallId,
        from: String,
        to: String,
        direction: &'static str,
    },
    CallAnswered {
        call_id: CallId,
    },
    CallStateChanged {
        call_id: CallId,
        state: CallState,
    },
    CallEnded {
        call_id: CallId,
        cdr: Box<Cdr>,
    },
    DtmfDetected {
        call_id: CallId,
        digit: char,
        method: &'static str,
    },
    BridgeStateChanged {
        call_id: CallId,
        state: &'static str,
    },
    RegistrationUpdated {
        aor: String,
        contacts: usize,
    },
    SmsReceived {
        from: String,
        to: String,
        body: String,
    },
}

struct Subscriber {
    tx: mpsc::Sender<ServerEvent>,
    dropped: Arc<AtomicU64>,
}

// Fan-out bus. Slow subscribers lose events rather than stalling calls;
// each keeps a dropped counter for the metrics surface.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Subscribe with a bounded queue. The returned counter reports events
    /// this subscriber missed.
    pub async fn subscribe(
        &self,
        capacity: usize,
    ) -> (mpsc::Receiver<ServerEvent>, Arc<AtomicU64>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.write().await.push(Subscriber {
            tx,
            dropped: dropped.clone(),
        });
        (rx, dropped)
    }

    pub async fn publish(&self, event: ServerEvent) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            if subscriber.tx.try_send(event.clone()).is_err() {
                subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("subscriber queue full, event dropped");
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_event(n: usize) -> ServerEvent {
        ServerEvent::DtmfDetected {
            call_id: CallId(format!("call-{}", n)),
            digit: '5',
            method: "rfc2833",
        }
    }

    #[tokio::test]
    async fn test_delivery_to_all_subscribers() {
        let bus = EventBus::new();
        let (mut rx1, _) = bus.subscribe(8).await;
        let (mut rx2, _) = bus.subscribe(8).await;

        bus.publish(test_event(1)).await;

        assert!(matches!(
            rx1.recv().await.unwrap(),
            ServerEvent::DtmfDetected { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            ServerEvent::DtmfDetected { .. }
        ));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_not_blocks() {
        let bus = EventBus::new();
        let (mut rx, dropped) = bus.subscribe(2).await;

        for n in 0..5 {
            bus.publish(test_event(n)).await;
        }

        // Two delivered, three dropped, publish never blocked
        assert_eq!(dropped.load(Ordering::Relaxed), 3);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_closed_subscribers_pruned() {
        let bus = EventBus::new();
        let (rx, _) = bus.subscribe(2).await;
        assert_eq!(bus.subscriber_count().await, 1);

        drop(rx);
        bus.publish(test_event(0)).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
