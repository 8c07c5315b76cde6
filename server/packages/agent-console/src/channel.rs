use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::events::NormalizedEvent;

const CHANNEL_CAPACITY: usize = 1024;

pub type EventStream = BoxStream<'static, NormalizedEvent>;

/// Single-producer, multi-consumer fan-out for one session's events.
///
/// Subscribers see every event sent after they attach, up to and including
/// the terminal `done`/`error`. Once a terminal event is sent the channel is
/// closed for good. Dropping a subscriber never affects the others. A
/// subscriber that falls too far behind is ended rather than shown a gap.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<Mutex<ChannelState>>,
}

enum ChannelState {
    Open(broadcast::Sender<NormalizedEvent>),
    Finished,
    Cancelled,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state() {
            ChannelState::Open(sender) => format!("open({} subscribers)", sender.receiver_count()),
            ChannelState::Finished => "finished".to_string(),
            ChannelState::Cancelled => "cancelled".to_string(),
        };
        f.debug_struct("EventChannel").field("state", &state).finish()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(ChannelState::Open(sender))),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        // The guarded sections never panic, so a poisoned lock still holds a
        // consistent state.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends an event. Returns false if the channel no longer accepts events.
    pub fn send(&self, event: NormalizedEvent) -> bool {
        let mut state = self.state();
        let sender = match &*state {
            ChannelState::Open(sender) => sender,
            ChannelState::Finished => {
                tracing::error!(event = event.kind(), "event sent after terminal event");
                debug_assert!(false, "event {} sent after terminal event", event.kind());
                return false;
            }
            ChannelState::Cancelled => {
                tracing::debug!(event = event.kind(), "dropping event for cancelled session");
                return false;
            }
        };
        let terminal = event.is_terminal();
        // No receivers is fine: sessions keep running headless.
        let _ = sender.send(event);
        if terminal {
            *state = ChannelState::Finished;
        }
        true
    }

    /// Closes the channel without a terminal event. Current subscribers drain
    /// what was already sent and then end.
    pub fn close(&self) {
        let mut state = self.state();
        if matches!(&*state, ChannelState::Open(_)) {
            *state = ChannelState::Cancelled;
        }
    }

    pub fn is_closed(&self) -> bool {
        !matches!(&*self.state(), ChannelState::Open(_))
    }

    pub fn subscriber_count(&self) -> usize {
        match &*self.state() {
            ChannelState::Open(sender) => sender.receiver_count(),
            ChannelState::Finished | ChannelState::Cancelled => 0,
        }
    }

    /// Attaches a new consumer. A consumer arriving after a terminal event
    /// gets a single `done` so it can detach cleanly. After cancellation it
    /// gets nothing.
    pub fn subscribe(&self) -> EventStream {
        let receiver = match &*self.state() {
            ChannelState::Open(sender) => sender.subscribe(),
            ChannelState::Finished => return stream::once(async { NormalizedEvent::Done }).boxed(),
            ChannelState::Cancelled => return stream::empty().boxed(),
        };
        stream::unfold(Some(receiver), |receiver| async move {
            let mut receiver = receiver?;
            match receiver.recv().await {
                Ok(event) => {
                    let next = if event.is_terminal() { None } else { Some(receiver) };
                    Some((event, next))
                }
                Err(RecvError::Lagged(skipped)) => {
                    // The client reconnects and re-fetches history.
                    tracing::warn!(skipped, "event subscriber lagged; ending its stream");
                    None
                }
                Err(RecvError::Closed) => None,
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_through_terminal_event() {
        let channel = EventChannel::new();
        let first = channel.subscribe();
        channel.send(NormalizedEvent::text("a"));
        let second = channel.subscribe();
        channel.send(NormalizedEvent::text("b"));
        channel.send(NormalizedEvent::Done);

        let first = first.collect::<Vec<_>>().await;
        let second = second.collect::<Vec<_>>().await;
        assert_eq!(
            first,
            vec![
                NormalizedEvent::text("a"),
                NormalizedEvent::text("b"),
                NormalizedEvent::Done
            ]
        );
        assert_eq!(second, vec![NormalizedEvent::text("b"), NormalizedEvent::Done]);
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn late_subscriber_gets_exactly_one_done() {
        let channel = EventChannel::new();
        channel.send(NormalizedEvent::error("boom"));
        let events = channel.subscribe().collect::<Vec<_>>().await;
        assert_eq!(events, vec![NormalizedEvent::Done]);
    }

    #[tokio::test]
    async fn dropping_one_subscriber_does_not_affect_another() {
        let channel = EventChannel::new();
        let dropped = channel.subscribe();
        let kept = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);
        drop(dropped);
        assert_eq!(channel.subscriber_count(), 1);
        assert!(channel.send(NormalizedEvent::text("still here")));
        channel.send(NormalizedEvent::Done);
        let events = kept.collect::<Vec<_>>().await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn close_ends_subscribers_without_terminal_event() {
        let channel = EventChannel::new();
        let subscriber = channel.subscribe();
        channel.send(NormalizedEvent::text("partial"));
        channel.close();
        assert!(!channel.send(NormalizedEvent::text("ignored")));
        drop(channel);
        let events = subscriber.collect::<Vec<_>>().await;
        assert_eq!(events, vec![NormalizedEvent::text("partial")]);
    }

    #[tokio::test]
    async fn late_subscriber_after_cancel_gets_nothing() {
        let channel = EventChannel::new();
        channel.send(NormalizedEvent::text("partial"));
        channel.close();
        let events = channel.subscribe().collect::<Vec<_>>().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn lagging_subscriber_is_ended_instead_of_skipping() {
        let channel = EventChannel::new();
        let lagging = channel.subscribe();
        for index in 0..CHANNEL_CAPACITY + 8 {
            channel.send(NormalizedEvent::text(index.to_string()));
        }
        assert!(lagging.collect::<Vec<_>>().await.is_empty());

        let fresh = channel.subscribe();
        channel.send(NormalizedEvent::Done);
        assert_eq!(fresh.collect::<Vec<_>>().await, vec![NormalizedEvent::Done]);
    }
}
