//! Host lifecycle event bus.
//!
//! The store (§4.A) publishes `host-discovered` / `host-updated` /
//! `host-removed` / `scan-complete` events; the agent service (§4.F)
//! subscribes to turn them into outbound C&C frames. Modelled on the
//! teacher's pub-sub event bus, but scoped to this one closed event set
//! instead of a generic filter/history system — there is no replay-from-
//! disk requirement (§1 Non-goals), so no ring-buffer history is kept.

use crate::types::Host;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// The closed set of events the store can emit (§4.A).
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    HostDiscovered(Host),
    HostUpdated(Host),
    HostRemoved { name: String },
    ScanComplete { host_count: usize },
}

struct Subscriber {
    sender: UnboundedSender<LifecycleEvent>,
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Subscriber>,
}

/// Thread-safe, fan-out-to-all pub-sub channel for [`LifecycleEvent`]s.
///
/// Mutating calls on the store take an `emit_lifecycle_event` flag (§4.A);
/// when a caller suppresses emission (agent-driven mutations, to avoid echo
/// loops per §7) it is the caller's job to explicitly [`publish`] the
/// equivalent event afterwards, not this bus's.
#[derive(Clone, Default)]
pub struct LifecycleBus {
    state: Arc<Mutex<BusState>>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all future events. Closed receivers are pruned lazily
    /// on the next publish.
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<LifecycleEvent> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.state.lock().subscribers.push(Subscriber { sender: tx });
        rx
    }

    /// Publish to every live subscriber; returns the number that received
    /// it.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        let mut state = self.state.lock();
        let mut delivered = 0;
        state.subscribers.retain(|sub| match sub.sender.send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => false,
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HostStatus;

    fn sample_host(name: &str) -> Host {
        Host {
            name: name.to_string(),
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            ip: "192.168.1.10".to_string(),
            status: HostStatus::Awake,
            last_seen: None,
            discovered: false,
            ping_responsive: None,
            notes: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = LifecycleBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let delivered = bus.publish(LifecycleEvent::HostDiscovered(sample_host("PHANTOM")));
        assert_eq!(delivered, 2);

        assert!(matches!(
            rx1.recv().await.unwrap(),
            LifecycleEvent::HostDiscovered(_)
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            LifecycleEvent::HostDiscovered(_)
        ));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = LifecycleBus::new();
        {
            let _rx = bus.subscribe();
        }
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(LifecycleEvent::ScanComplete { host_count: 0 });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
