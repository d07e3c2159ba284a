//! In-process broadcast relay.
//!
//! Every envelope is encoded to JSON on send and decoded again for each
//! recipient session, so the wire codec is exercised exactly as with a
//! remote relay. Sessions are grouped by [`RoomId::signaling_topic`]. Like a
//! broadcast topic, a session never receives its own messages.

use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use async_trait::async_trait;
use futures::{channel::mpsc, stream::LocalBoxStream, StreamExt as _};
use tracing::warn;

use crate::{
    error::SignalingError,
    proto::{ChannelEvent, ChannelLifecycle, RoomId, SignalEnvelope},
    signaling::{ChannelSession, SignalingChannel},
};

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, Vec<Subscriber>>,
    next_id: u64,
    refused: u32,
    delivered: u64,
}

impl Inner {
    fn deliver(&mut self, topic: &str, from: Option<u64>, raw: &str) {
        let envelope = match SignalEnvelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic, error = %e, "Dropping malformed envelope");
                return;
            }
        };
        let subscribers = match self.topics.get(topic) {
            Some(subscribers) => subscribers,
            None => return,
        };
        let mut delivered = 0;
        for sub in subscribers.iter().filter(|s| Some(s.id) != from) {
            let event = ChannelEvent::Message(envelope.clone());
            if sub.tx.unbounded_send(event).is_ok() {
                delivered += 1;
            }
        }
        self.delivered += delivered;
    }

    fn remove(&mut self, topic: &str, id: u64) {
        if let Some(subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|s| s.id != id);
        }
    }

    fn is_subscribed(&self, topic: &str, id: u64) -> bool {
        self.topics
            .get(topic)
            .map_or(false, |subs| subs.iter().any(|s| s.id == id))
    }
}

#[derive(Default)]
pub struct MemoryRelay {
    inner: Rc<RefCell<Inner>>,
}

impl MemoryRelay {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Number of live sessions on `room`.
    pub fn subscribers(&self, room: &RoomId) -> usize {
        self.inner
            .borrow()
            .topics
            .get(&room.signaling_topic())
            .map_or(0, Vec::len)
    }

    /// Total number of envelopes handed to recipient sessions.
    pub fn delivered(&self) -> u64 {
        self.inner.borrow().delivered
    }

    /// Makes the next `n` subscription attempts fail.
    pub fn refuse_subscriptions(&self, n: u32) {
        self.inner.borrow_mut().refused = n;
    }

    /// Drops every session on `room`, each one observing
    /// [`ChannelLifecycle::Disconnected`] as its last event.
    pub fn disconnect(&self, room: &RoomId) {
        let subscribers = self
            .inner
            .borrow_mut()
            .topics
            .remove(&room.signaling_topic())
            .unwrap_or_default();
        for sub in subscribers {
            let _ = sub.tx.unbounded_send(ChannelEvent::Lifecycle(
                ChannelLifecycle::Disconnected,
            ));
        }
    }

    /// Reports a channel error to every session on `room` without dropping
    /// them.
    pub fn report_error(&self, room: &RoomId, reason: &str) {
        let inner = self.inner.borrow();
        let topic = room.signaling_topic();
        for sub in inner.topics.get(&topic).into_iter().flatten() {
            let _ = sub.tx.unbounded_send(ChannelEvent::Lifecycle(
                ChannelLifecycle::ChannelError(reason.to_owned()),
            ));
        }
    }

    /// Broadcasts a raw JSON payload to every session on `room`, as a
    /// foreign client would.
    pub fn inject(&self, room: &RoomId, raw: &str) {
        self.inner
            .borrow_mut()
            .deliver(&room.signaling_topic(), None, raw);
    }
}

#[async_trait(?Send)]
impl SignalingChannel for MemoryRelay {
    async fn subscribe(
        &self,
        room: &RoomId,
    ) -> Result<Box<dyn ChannelSession>, SignalingError> {
        let mut inner = self.inner.borrow_mut();
        if inner.refused > 0 {
            inner.refused -= 1;
            return Err(SignalingError::Transport(
                "relay is unreachable".to_owned(),
            ));
        }
        inner.next_id += 1;
        let id = inner.next_id;

        let (tx, rx) = mpsc::unbounded();
        let _ = tx.unbounded_send(ChannelEvent::Lifecycle(
            ChannelLifecycle::Subscribed,
        ));
        let topic = room.signaling_topic();
        inner
            .topics
            .entry(topic.clone())
            .or_default()
            .push(Subscriber { id, tx });

        Ok(Box::new(MemorySession {
            relay: Rc::downgrade(&self.inner),
            topic,
            id,
            events: RefCell::new(Some(rx)),
        }))
    }
}

struct MemorySession {
    relay: Weak<RefCell<Inner>>,
    topic: String,
    id: u64,
    events: RefCell<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl ChannelSession for MemorySession {
    fn send(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        let raw = envelope.to_json()?;
        let relay = self.relay.upgrade().ok_or(SignalingError::Closed)?;
        let mut relay = relay.borrow_mut();
        if !relay.is_subscribed(&self.topic, self.id) {
            return Err(SignalingError::Closed);
        }
        relay.deliver(&self.topic, Some(self.id), &raw);
        Ok(())
    }

    fn take_events(&self) -> Option<LocalBoxStream<'static, ChannelEvent>> {
        self.events.borrow_mut().take().map(|rx| rx.boxed_local())
    }

    fn unsubscribe(&self) {
        if let Some(relay) = self.relay.upgrade() {
            relay.borrow_mut().remove(&self.topic, self.id);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod spec {
    use futures::StreamExt as _;

    use crate::proto::{IceCandidate, SignalMessage};

    use super::*;

    fn envelope(from: &str, to: &str) -> SignalEnvelope {
        SignalEnvelope {
            from: from.into(),
            to: to.into(),
            payload: SignalMessage::IceCandidate {
                candidate: IceCandidate {
                    candidate: "candidate:1".to_owned(),
                    sdp_mid: None,
                    sdp_m_line_index: None,
                },
            },
        }
    }

    #[tokio::test]
    async fn broadcasts_to_other_sessions_only() {
        let relay = MemoryRelay::new();
        let room = RoomId::new("r");
        let a = relay.subscribe(&room).await.unwrap();
        let b = relay.subscribe(&room).await.unwrap();
        let mut a_events = a.take_events().unwrap();
        let mut b_events = b.take_events().unwrap();

        a.send(&envelope("a", "b")).unwrap();
        a.send(&envelope("a", "c")).unwrap();

        let subscribed = ChannelEvent::Lifecycle(ChannelLifecycle::Subscribed);
        assert_eq!(b_events.next().await, Some(subscribed.clone()));
        assert_eq!(
            b_events.next().await,
            Some(ChannelEvent::Message(envelope("a", "b")))
        );
        assert_eq!(
            b_events.next().await,
            Some(ChannelEvent::Message(envelope("a", "c")))
        );

        assert_eq!(a_events.next().await, Some(subscribed));
        assert_eq!(relay.delivered(), 2);
        drop(relay);
        drop(a);
        assert_eq!(a_events.next().await, None);
    }

    #[tokio::test]
    async fn disconnect_ends_sessions() {
        let relay = MemoryRelay::new();
        let room = RoomId::new("r");
        let a = relay.subscribe(&room).await.unwrap();
        let mut events = a.take_events().unwrap();
        let _ = events.next().await;

        relay.disconnect(&room);

        assert_eq!(
            events.next().await,
            Some(ChannelEvent::Lifecycle(ChannelLifecycle::Disconnected))
        );
        assert_eq!(events.next().await, None);
        assert_eq!(a.send(&envelope("a", "b")), Err(SignalingError::Closed));
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let relay = MemoryRelay::new();
        let room = RoomId::new("r");
        let a = relay.subscribe(&room).await.unwrap();

        relay.inject(&room, r#"{"from":"x","to":"a","data":{"type":"?"}}"#);
        relay.disconnect(&room);

        let events: Vec<_> = a.take_events().unwrap().collect().await;
        assert_eq!(
            events,
            vec![
                ChannelEvent::Lifecycle(ChannelLifecycle::Subscribed),
                ChannelEvent::Lifecycle(ChannelLifecycle::Disconnected),
            ]
        );
    }

    #[tokio::test]
    async fn rooms_do_not_share_topics() {
        let relay = MemoryRelay::new();
        let lobby = RoomId::new("lobby");
        let other = RoomId::new("other");
        let a = relay.subscribe(&lobby).await.unwrap();
        let b = relay.subscribe(&other).await.unwrap();
        assert_eq!(relay.subscribers(&lobby), 1);

        a.send(&envelope("a", "b")).unwrap();
        assert_eq!(relay.delivered(), 0);

        relay.disconnect(&lobby);
        assert_eq!(relay.subscribers(&lobby), 0);
        assert_eq!(relay.subscribers(&other), 1);
        drop(b);
        assert_eq!(relay.subscribers(&other), 0);
    }
}
