use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use futures::{
    channel::mpsc,
    future::LocalBoxFuture,
    stream::LocalBoxStream,
    StreamExt as _,
};
use medea_reactive::{DroppedError, ObservableCell};
use tokio::{
    task::{spawn_local, JoinHandle},
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    proto::{
        ChannelEvent, ChannelLifecycle, ConnectionStatus, RoomId,
        SignalEnvelope, SignalMessage, UserId,
    },
    signaling::{ChannelSession, SignalSender, SignalingChannel},
};

/// Exclusive owner of the room's [`ChannelSession`].
///
/// Watches the session lifecycle and, once it is disconnected, opens a brand
/// new session after a fixed backoff. Retries are unlimited and never grow
/// the interval. Peer links are not touched by a reconnect.
///
/// Envelopes of every session are forwarded into a single inbound queue, so
/// per-sender ordering survives a session swap.
pub struct ReconnectionSupervisor {
    room: RoomId,
    local_id: UserId,
    channel: Rc<dyn SignalingChannel>,
    backoff: Duration,
    session: RefCell<Option<Rc<dyn ChannelSession>>>,
    pump: RefCell<Option<JoinHandle<()>>>,
    reconnect: RefCell<Option<JoinHandle<()>>>,
    status: ObservableCell<ConnectionStatus>,
    inbound_tx: mpsc::UnboundedSender<SignalEnvelope>,
    inbound_rx: RefCell<Option<mpsc::UnboundedReceiver<SignalEnvelope>>>,
    sessions_opened: Cell<u32>,
    stopped: Cell<bool>,
}

impl ReconnectionSupervisor {
    pub fn new(
        room: RoomId,
        local_id: UserId,
        channel: Rc<dyn SignalingChannel>,
        backoff: Duration,
    ) -> Rc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded();
        Rc::new(Self {
            room,
            local_id,
            channel,
            backoff,
            session: RefCell::new(None),
            pump: RefCell::new(None),
            reconnect: RefCell::new(None),
            status: ObservableCell::new(ConnectionStatus::Connecting),
            inbound_tx,
            inbound_rx: RefCell::new(Some(inbound_rx)),
            sessions_opened: Cell::new(0),
            stopped: Cell::new(true),
        })
    }

    /// Takes the queue of inbound envelopes, in arrival order.
    pub fn take_inbound(
        &self,
    ) -> Option<LocalBoxStream<'static, SignalEnvelope>> {
        self.inbound_rx.borrow_mut().take().map(|rx| rx.boxed_local())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    pub fn on_status_change(&self) -> LocalBoxStream<'static, ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn when_status(
        &self,
        status: ConnectionStatus,
    ) -> LocalBoxFuture<'static, Result<(), DroppedError>> {
        self.status.when_eq(status)
    }

    /// Number of sessions opened since creation.
    pub fn sessions_opened(&self) -> u32 {
        self.sessions_opened.get()
    }

    pub fn has_session(&self) -> bool {
        self.session.borrow().is_some()
    }

    pub async fn start(self: &Rc<Self>) {
        self.stopped.set(false);
        self.connect().await;
    }

    /// Cancels any pending reconnect and closes the current session.
    pub fn stop(&self) {
        self.stopped.set(true);
        if let Some(timer) = self.reconnect.borrow_mut().take() {
            timer.abort();
        }
        if let Some(pump) = self.pump.borrow_mut().take() {
            pump.abort();
        }
        let session = self.session.borrow_mut().take();
        if let Some(session) = session {
            session.unsubscribe();
        }
    }

    async fn connect(self: &Rc<Self>) {
        self.status.set(ConnectionStatus::Connecting);
        match self.channel.subscribe(&self.room).await {
            Ok(session) => {
                if self.stopped.get() {
                    session.unsubscribe();
                    return;
                }
                self.install(Rc::from(session));
            }
            Err(e) => {
                warn!(room = %self.room, error = %e, "Signaling subscribe failed");
                self.status.set(ConnectionStatus::Failed);
                self.schedule_reconnect();
            }
        }
    }

    /// Replaces the current session with `session`.
    fn install(self: &Rc<Self>, session: Rc<dyn ChannelSession>) {
        let events = session.take_events();
        let old = self.session.borrow_mut().replace(session);
        if let Some(old) = old {
            old.unsubscribe();
        }
        if let Some(pump) = self.pump.borrow_mut().take() {
            pump.abort();
        }
        self.sessions_opened.set(self.sessions_opened.get() + 1);

        let mut events = match events {
            Some(events) => events,
            None => {
                warn!(room = %self.room, "Session events already taken");
                return;
            }
        };
        let this = Rc::downgrade(self);
        let pump = spawn_local(async move {
            while let Some(event) = events.next().await {
                let this = match this.upgrade() {
                    Some(this) => this,
                    None => return,
                };
                match event {
                    ChannelEvent::Message(envelope) => {
                        let _ = this.inbound_tx.unbounded_send(envelope);
                    }
                    ChannelEvent::Lifecycle(lifecycle) => {
                        if this.on_lifecycle(lifecycle) {
                            return;
                        }
                    }
                }
            }
            if let Some(this) = this.upgrade() {
                debug!(room = %this.room, "Signaling session ended");
                this.on_lifecycle(ChannelLifecycle::Disconnected);
            }
        });
        *self.pump.borrow_mut() = Some(pump);
    }

    /// Returns `true` if the session is gone.
    fn on_lifecycle(self: &Rc<Self>, lifecycle: ChannelLifecycle) -> bool {
        match lifecycle {
            ChannelLifecycle::Subscribed => {
                info!(room = %self.room, "Signaling channel subscribed");
                self.status.set(ConnectionStatus::Connected);
                false
            }
            ChannelLifecycle::ChannelError(reason) => {
                warn!(room = %self.room, %reason, "Signaling channel error");
                self.status.set(ConnectionStatus::Failed);
                false
            }
            ChannelLifecycle::Disconnected => {
                warn!(room = %self.room, "Signaling channel disconnected");
                self.status.set(ConnectionStatus::Failed);
                let session = self.session.borrow_mut().take();
                if let Some(session) = session {
                    session.unsubscribe();
                }
                self.schedule_reconnect();
                true
            }
        }
    }

    fn schedule_reconnect(self: &Rc<Self>) {
        if self.stopped.get() {
            return;
        }
        if let Some(pending) = self.reconnect.borrow_mut().take() {
            pending.abort();
        }
        info!(
            room = %self.room,
            backoff_ms = self.backoff.as_millis() as u64,
            "Scheduling signaling reconnect"
        );

        let this = Rc::downgrade(self);
        let backoff = self.backoff;
        let timer = spawn_local(async move {
            sleep(backoff).await;
            if let Some(this) = this.upgrade() {
                // Forget our own handle so nothing aborts this task midway.
                drop(this.reconnect.borrow_mut().take());
                if !this.stopped.get() {
                    this.connect().await;
                }
            }
        });
        *self.reconnect.borrow_mut() = Some(timer);
    }
}

impl SignalSender for ReconnectionSupervisor {
    fn send(&self, to: &UserId, message: SignalMessage) {
        let envelope = SignalEnvelope {
            from: self.local_id.clone(),
            to: to.clone(),
            payload: message,
        };
        let session = self.session.borrow().clone();
        match session {
            Some(session) => {
                if let Err(e) = session.send(&envelope) {
                    warn!(
                        to = %envelope.to,
                        kind = envelope.payload.kind(),
                        error = %e,
                        "Failed to send signal"
                    );
                }
            }
            None => warn!(
                to = %envelope.to,
                kind = envelope.payload.kind(),
                "No live signaling session, dropping signal"
            ),
        }
    }
}

impl Drop for ReconnectionSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod spec {
    use async_trait::async_trait;
    use futures::StreamExt as _;
    use tokio::task::LocalSet;

    use crate::{
        error::SignalingError, proto::IceCandidate,
        signaling::memory::MemoryRelay,
    };

    use super::*;

    fn supervisor(relay: &Rc<MemoryRelay>, user: &str) -> Rc<ReconnectionSupervisor> {
        ReconnectionSupervisor::new(
            RoomId::new("room"),
            user.into(),
            Rc::clone(relay) as Rc<dyn SignalingChannel>,
            Duration::from_secs(3),
        )
    }

    fn candidate() -> SignalMessage {
        SignalMessage::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:7".to_owned(),
                sdp_mid: None,
                sdp_m_line_index: None,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_fixed_backoff() {
        LocalSet::new()
            .run_until(async {
                let relay = MemoryRelay::new();
                let room = RoomId::new("room");
                let sup = supervisor(&relay, "a");

                sup.start().await;
                sup.when_status(ConnectionStatus::Connected).await.unwrap();
                assert_eq!(sup.sessions_opened(), 1);

                relay.disconnect(&room);
                sup.when_status(ConnectionStatus::Failed).await.unwrap();
                assert!(!sup.has_session());

                sleep(Duration::from_millis(2900)).await;
                assert_eq!(sup.sessions_opened(), 1);

                sleep(Duration::from_millis(200)).await;
                sup.when_status(ConnectionStatus::Connected).await.unwrap();
                assert_eq!(sup.sessions_opened(), 2);
                assert_eq!(relay.subscribers(&room), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_failed_subscribe_without_growing_interval() {
        LocalSet::new()
            .run_until(async {
                let relay = MemoryRelay::new();
                relay.refuse_subscriptions(2);
                let sup = supervisor(&relay, "a");

                sup.start().await;
                assert_eq!(sup.status(), ConnectionStatus::Failed);

                sleep(Duration::from_millis(3100)).await;
                assert_eq!(sup.status(), ConnectionStatus::Failed);
                assert_eq!(sup.sessions_opened(), 0);

                sleep(Duration::from_millis(3000)).await;
                sup.when_status(ConnectionStatus::Connected).await.unwrap();
                assert_eq!(sup.sessions_opened(), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn channel_error_does_not_reconnect() {
        LocalSet::new()
            .run_until(async {
                let relay = MemoryRelay::new();
                let room = RoomId::new("room");
                let sup = supervisor(&relay, "a");
                sup.start().await;
                sup.when_status(ConnectionStatus::Connected).await.unwrap();

                relay.report_error(&room, "boom");
                sup.when_status(ConnectionStatus::Failed).await.unwrap();

                sleep(Duration::from_secs(10)).await;
                assert_eq!(sup.sessions_opened(), 1);
                assert!(sup.has_session());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_reconnect() {
        LocalSet::new()
            .run_until(async {
                let relay = MemoryRelay::new();
                let room = RoomId::new("room");
                let sup = supervisor(&relay, "a");
                sup.start().await;
                sup.when_status(ConnectionStatus::Connected).await.unwrap();

                relay.disconnect(&room);
                sup.when_status(ConnectionStatus::Failed).await.unwrap();
                sup.stop();

                sleep(Duration::from_secs(10)).await;
                assert_eq!(sup.sessions_opened(), 1);
                assert_eq!(relay.subscribers(&room), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn forwards_envelopes_in_order() {
        LocalSet::new()
            .run_until(async {
                let relay = MemoryRelay::new();
                let a = supervisor(&relay, "a");
                let b = supervisor(&relay, "b");
                let mut inbound = b.take_inbound().unwrap();
                a.start().await;
                b.start().await;

                a.send(&"b".into(), candidate());
                a.send(&"c".into(), candidate());

                let first = inbound.next().await.unwrap();
                let second = inbound.next().await.unwrap();
                assert_eq!((first.from.as_str(), first.to.as_str()), ("a", "b"));
                assert_eq!(second.to.as_str(), "c");
            })
            .await;
    }

    /// Relay whose sessions only count unsubscriptions and keep their
    /// subscription alive when dropped.
    #[derive(Default)]
    struct CountingChannel {
        unsubscribed: Rc<Cell<u32>>,
        sessions: RefCell<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
    }

    struct CountingSession {
        unsubscribed: Rc<Cell<u32>>,
        events: RefCell<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    }

    impl ChannelSession for CountingSession {
        fn send(&self, _: &SignalEnvelope) -> Result<(), SignalingError> {
            Ok(())
        }

        fn take_events(&self) -> Option<LocalBoxStream<'static, ChannelEvent>> {
            self.events.borrow_mut().take().map(|rx| rx.boxed_local())
        }

        fn unsubscribe(&self) {
            self.unsubscribed.set(self.unsubscribed.get() + 1);
        }
    }

    #[async_trait(?Send)]
    impl SignalingChannel for CountingChannel {
        async fn subscribe(
            &self,
            _: &RoomId,
        ) -> Result<Box<dyn ChannelSession>, SignalingError> {
            let (tx, rx) = mpsc::unbounded();
            let _ = tx.unbounded_send(ChannelEvent::Lifecycle(
                ChannelLifecycle::Subscribed,
            ));
            self.sessions.borrow_mut().push(tx);
            Ok(Box::new(CountingSession {
                unsubscribed: Rc::clone(&self.unsubscribed),
                events: RefCell::new(Some(rx)),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_session_is_unsubscribed() {
        LocalSet::new()
            .run_until(async {
                let channel = Rc::new(CountingChannel::default());
                let sup = ReconnectionSupervisor::new(
                    RoomId::new("room"),
                    "a".into(),
                    Rc::clone(&channel) as Rc<dyn SignalingChannel>,
                    Duration::from_secs(3),
                );
                sup.start().await;
                sup.when_status(ConnectionStatus::Connected).await.unwrap();

                let _ = channel.sessions.borrow()[0].unbounded_send(
                    ChannelEvent::Lifecycle(ChannelLifecycle::Disconnected),
                );
                sup.when_status(ConnectionStatus::Failed).await.unwrap();
                assert_eq!(channel.unsubscribed.get(), 1);

                sleep(Duration::from_secs(4)).await;
                assert_eq!(sup.sessions_opened(), 2);
                assert_eq!(sup.status(), ConnectionStatus::Connected);
                assert_eq!(channel.unsubscribed.get(), 1);

                sup.stop();
                assert_eq!(channel.unsubscribed.get(), 2);
            })
            .await;
    }
}
