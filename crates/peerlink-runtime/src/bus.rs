//! Event bus
//!
//! The engine is the only publisher, so events leave it in exactly the order
//! it applied them. At most one consumer is attached at a time; with none
//! attached, events are dropped rather than buffered.

use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tracing::trace;

use peerlink_core::channel::{
    create_app_event_channel, AppEventReceiver, AppEventSender, NonBlockingSend,
};
use peerlink_core::AppEvent;

// ----------------------------------------------------------------------------
// Event Bus
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BusStats {
    pub delivered: u64,
    pub dropped: u64,
    pub attached: bool,
}

#[derive(Debug, Default)]
struct BusState {
    consumer: Option<AppEventSender>,
    delivered: u64,
    dropped: u64,
}

/// Single-consumer, ordered event delivery
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a consumer, replacing (and ending) any previous one
    pub fn attach(&self) -> EventStream {
        let (sender, receiver) = create_app_event_channel();
        self.lock().consumer = Some(sender);
        EventStream { receiver }
    }

    pub fn detach(&self) {
        self.lock().consumer = None;
    }

    pub fn is_attached(&self) -> bool {
        self.lock().consumer.is_some()
    }

    /// Deliver one event; `false` when nobody was listening
    pub fn publish(&self, event: AppEvent) -> bool {
        let mut state = self.lock();
        let delivered = match &state.consumer {
            Some(sender) => sender.try_send_now(event).is_ok(),
            None => {
                trace!("No consumer attached, dropping event");
                false
            }
        };
        if delivered {
            state.delivered += 1;
        } else {
            // A dropped stream counts as a detach
            state.consumer = None;
            state.dropped += 1;
        }
        delivered
    }

    pub fn stats(&self) -> BusStats {
        let state = self.lock();
        BusStats {
            delivered: state.delivered,
            dropped: state.dropped,
            attached: state.consumer.is_some(),
        }
    }
}

// ----------------------------------------------------------------------------
// Event Stream
// ----------------------------------------------------------------------------

/// Consumer side of the bus; ends when detached or replaced
#[derive(Debug)]
pub struct EventStream {
    receiver: AppEventReceiver,
}

impl EventStream {
    pub async fn next_event(&mut self) -> Option<AppEvent> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<AppEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = AppEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use peerlink_core::PeerId;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[test]
    fn test_publish_without_consumer_drops() {
        let bus = EventBus::new();
        assert!(!bus.publish(AppEvent::Stopped));
        assert_eq!(
            bus.stats(),
            BusStats {
                delivered: 0,
                dropped: 1,
                attached: false
            }
        );
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let bus = EventBus::new();
        let mut stream = bus.attach();
        bus.publish(AppEvent::AdvertisingStarted);
        bus.publish(AppEvent::InvitationSent {
            peer_id: PeerId::new(1),
        });
        bus.publish(AppEvent::Stopped);

        assert_eq!(stream.next().await, Some(AppEvent::AdvertisingStarted));
        assert_eq!(stream.next_event().await.unwrap().name(), "invitationSent");
        assert_eq!(stream.try_next(), Some(AppEvent::Stopped));
        assert_eq!(stream.try_next(), None);
    }

    #[test]
    fn test_stream_wakes_on_publish() {
        let bus = EventBus::new();
        let mut stream = bus.attach();
        let mut next = task::spawn(stream.next_event());
        assert_pending!(next.poll());

        bus.publish(AppEvent::BrowsingStarted);
        assert!(next.is_woken());
        assert_ready_eq!(next.poll(), Some(AppEvent::BrowsingStarted));
    }

    #[tokio::test]
    async fn test_no_buffering_across_reattach() {
        let bus = EventBus::new();
        let mut first = bus.attach();
        bus.detach();
        assert!(!bus.publish(AppEvent::AdvertisingStarted));
        assert_eq!(first.next_event().await, None);

        let mut second = bus.attach();
        bus.publish(AppEvent::Stopped);
        assert_eq!(second.next_event().await, Some(AppEvent::Stopped));
        assert_eq!(bus.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_attach_replaces_previous_consumer() {
        let bus = EventBus::new();
        let mut old = bus.attach();
        let mut new = bus.attach();
        bus.publish(AppEvent::Stopped);

        assert_eq!(old.next_event().await, None);
        assert_eq!(new.next_event().await, Some(AppEvent::Stopped));
    }

    #[test]
    fn test_dropped_stream_detaches() {
        let bus = EventBus::new();
        drop(bus.attach());
        assert!(!bus.publish(AppEvent::Stopped));
        assert!(!bus.is_attached());
    }
}
