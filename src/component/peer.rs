//! Link to a single remote member of the room.
//!
//! Every change of a [`PeerLink`] goes through [`transition`], a pure
//! function from the current [`PeerState`] and a [`PeerEvent`] to the next
//! state and the [`Effect`]s to run. Only effects touch the platform.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use futures::{future::LocalBoxFuture, StreamExt as _};
use medea_reactive::{DroppedError, ObservableCell};
use tokio::task::{spawn_local, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::{
    component::LocalStream,
    error::NegotiationError,
    proto::{IceCandidate, SessionDescription, SignalMessage, UserId},
    signaling::SignalSender,
    sys::{
        AudioRenderer, MediaStreamTrack, PeerConnectionEvent,
        PeerConnectionState, RtcPeerConnection, RtpSender, TrackKind,
        TransceiverDirection,
    },
};

/// Which side of a pair produces the offers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

impl NegotiationRole {
    /// Derives the role of `local` towards `remote`.
    ///
    /// The side whose identifier sorts first initiates. Both sides compute
    /// this independently and always agree, so each pair has exactly one
    /// offerer.
    pub fn for_pair(local: &UserId, remote: &UserId) -> Self {
        if local < remote {
            Self::Initiator
        } else {
            Self::Responder
        }
    }

    pub fn is_initiator(self) -> bool {
        self == Self::Initiator
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug)]
pub enum PeerEvent {
    /// Link was registered. Carries the local capture, if any.
    Created(Option<LocalStream>),
    LocalStreamChanged(LocalStream),
    OutboundEnabled(bool),
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    RemoteSignal(SignalMessage),
    ConnectionStateChanged(PeerConnectionState),
    RemoteTrack(Rc<dyn MediaStreamTrack>),
    Close,
}

impl From<PeerConnectionEvent> for PeerEvent {
    fn from(event: PeerConnectionEvent) -> Self {
        match event {
            PeerConnectionEvent::NegotiationNeeded => Self::NegotiationNeeded,
            PeerConnectionEvent::IceCandidate(c) => Self::LocalCandidate(c),
            PeerConnectionEvent::ConnectionStateChanged(state) => {
                Self::ConnectionStateChanged(state)
            }
            PeerConnectionEvent::Track(track) => Self::RemoteTrack(track),
        }
    }
}

#[derive(Debug)]
pub enum Effect {
    AttachLocal(LocalStream),
    /// Asks for remote audio even though nothing is sent.
    RequestReceiveOnly,
    SetOutboundEnabled(bool),
    SendOffer,
    Answer(SessionDescription),
    AcceptAnswer(SessionDescription),
    AddRemoteCandidate(IceCandidate),
    SendCandidate(IceCandidate),
    PlayRemoteAudio(Rc<dyn MediaStreamTrack>),
    Reject(NegotiationError),
    Release,
}

#[derive(Debug)]
pub struct Transition {
    pub next: PeerState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: PeerState, effects: Vec<Effect>) -> Self {
        Self {
            next: state,
            effects,
        }
    }
}

pub fn transition(
    state: PeerState,
    role: NegotiationRole,
    event: PeerEvent,
) -> Transition {
    use Effect as E;
    use PeerEvent as Ev;
    use PeerState as S;

    match (state, event) {
        (S::Closed, _) => Transition::stay(state, vec![]),
        (_, Ev::Close) => Transition {
            next: S::Closed,
            effects: vec![E::Release],
        },
        // A failed link only waits to be pruned.
        (S::Failed, _) => Transition::stay(state, vec![]),

        (S::New, Ev::Created(local)) => {
            let effects = match local {
                Some(stream) => vec![E::AttachLocal(stream)],
                None if role.is_initiator() => vec![E::RequestReceiveOnly],
                None => vec![],
            };
            Transition {
                next: S::Negotiating,
                effects,
            }
        }
        (S::New, _) | (_, Ev::Created(_)) => Transition::stay(state, vec![]),

        (_, Ev::LocalStreamChanged(stream)) => {
            Transition::stay(state, vec![E::AttachLocal(stream)])
        }
        (_, Ev::OutboundEnabled(enabled)) => {
            Transition::stay(state, vec![E::SetOutboundEnabled(enabled)])
        }
        (_, Ev::NegotiationNeeded) => match role {
            NegotiationRole::Initiator => {
                Transition::stay(state, vec![E::SendOffer])
            }
            NegotiationRole::Responder => Transition::stay(state, vec![]),
        },
        (_, Ev::LocalCandidate(candidate)) => {
            Transition::stay(state, vec![E::SendCandidate(candidate)])
        }
        (_, Ev::RemoteSignal(SignalMessage::Offer { sdp })) => {
            let effect = match role {
                NegotiationRole::Responder => E::Answer(sdp),
                NegotiationRole::Initiator => {
                    E::Reject(NegotiationError::UnexpectedOffer)
                }
            };
            Transition::stay(state, vec![effect])
        }
        (_, Ev::RemoteSignal(SignalMessage::Answer { sdp })) => {
            let effect = match role {
                NegotiationRole::Initiator => E::AcceptAnswer(sdp),
                NegotiationRole::Responder => {
                    E::Reject(NegotiationError::UnexpectedAnswer)
                }
            };
            Transition::stay(state, vec![effect])
        }
        (_, Ev::RemoteSignal(SignalMessage::IceCandidate { candidate })) => {
            Transition::stay(state, vec![E::AddRemoteCandidate(candidate)])
        }
        (_, Ev::ConnectionStateChanged(conn_state)) => {
            let next = match conn_state {
                PeerConnectionState::Connected => S::Connected,
                PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed => S::Failed,
                PeerConnectionState::New
                | PeerConnectionState::Connecting => state,
            };
            Transition::stay(next, vec![])
        }
        (_, Ev::RemoteTrack(track)) => {
            Transition::stay(state, vec![E::PlayRemoteAudio(track)])
        }
    }
}

/// Audio link to one remote member.
///
/// Owns the platform connection, the senders of the local tracks and the
/// remote audio playback. All of them are released on [`PeerLink::close`]
/// or when the link is dropped.
pub struct PeerLink {
    remote_id: UserId,
    role: NegotiationRole,
    conn: Rc<dyn RtcPeerConnection>,
    state: ObservableCell<PeerState>,
    senders: RefCell<Vec<Rc<dyn RtpSender>>>,
    signals: Rc<dyn SignalSender>,
    renderer: Rc<dyn AudioRenderer>,
    playing: Cell<bool>,
    events_task: RefCell<Option<JoinHandle<()>>>,
}

impl PeerLink {
    pub fn new(
        remote_id: UserId,
        role: NegotiationRole,
        conn: Rc<dyn RtcPeerConnection>,
        signals: Rc<dyn SignalSender>,
        renderer: Rc<dyn AudioRenderer>,
    ) -> Rc<Self> {
        Rc::new(Self {
            remote_id,
            role,
            conn,
            state: ObservableCell::new(PeerState::New),
            senders: RefCell::default(),
            signals,
            renderer,
            playing: Cell::new(false),
            events_task: RefCell::new(None),
        })
    }

    /// Starts listening to the connection and attaches `local` tracks.
    pub async fn start(
        self: &Rc<Self>,
        local: Option<LocalStream>,
    ) -> Result<(), NegotiationError> {
        self.spawn_on_connection_event();
        self.handle(PeerEvent::Created(local)).await
    }

    pub fn remote_id(&self) -> &UserId {
        &self.remote_id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn state(&self) -> PeerState {
        self.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state.get() == PeerState::Closed
    }

    pub fn when_state(
        &self,
        state: PeerState,
    ) -> LocalBoxFuture<'static, Result<(), DroppedError>> {
        self.state.when_eq(state)
    }

    /// Local tracks currently transmitted to the remote member.
    pub fn attached_tracks(&self) -> Vec<Rc<dyn MediaStreamTrack>> {
        self.senders.borrow().iter().filter_map(|s| s.track()).collect()
    }

    pub fn is_playing_remote(&self) -> bool {
        self.playing.get()
    }

    /// Feeds `event` through [`transition`] and runs the resulting effects.
    ///
    /// Effects that are still pending when the link gets closed are dropped
    /// silently.
    pub async fn handle(&self, event: PeerEvent) -> Result<(), NegotiationError> {
        let mut result = Ok(());
        for effect in self.advance(event) {
            let outcome = match effect {
                Effect::Release => {
                    self.release();
                    Ok(())
                }
                effect if self.is_closed() => {
                    trace!(remote = %self.remote_id, ?effect, "Discarding effect");
                    Ok(())
                }
                effect => self.apply(effect).await,
            };
            if let Err(e) = outcome {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    pub fn close(&self) {
        for effect in self.advance(PeerEvent::Close) {
            if let Effect::Release = effect {
                self.release();
            }
        }
    }

    fn advance(&self, event: PeerEvent) -> Vec<Effect> {
        let prev = self.state.get();
        let Transition { next, effects } = transition(prev, self.role, event);
        if next != prev {
            debug!(remote = %self.remote_id, ?prev, ?next, "Peer state changed");
            self.state.set(next);
        }
        effects
    }

    async fn apply(&self, effect: Effect) -> Result<(), NegotiationError> {
        match effect {
            Effect::AttachLocal(stream) => self.attach_local(&stream).await,
            Effect::RequestReceiveOnly => self
                .conn
                .add_transceiver(TrackKind::Audio, TransceiverDirection::RecvOnly)
                .map_err(NegotiationError::AttachTrack),
            Effect::SetOutboundEnabled(enabled) => {
                for track in self.attached_tracks() {
                    track.set_enabled(enabled);
                }
                Ok(())
            }
            Effect::SendOffer => self.send_offer().await,
            Effect::Answer(offer) => self.answer(offer).await,
            Effect::AcceptAnswer(answer) => {
                self.conn
                    .set_remote_description(answer)
                    .await
                    .map_err(NegotiationError::SetRemoteDescription)?;
                debug!(remote = %self.remote_id, "Applied SDP answer");
                Ok(())
            }
            Effect::AddRemoteCandidate(candidate) => {
                // Early or redundant candidates are expected and harmless.
                if let Err(e) = self.conn.add_ice_candidate(candidate).await {
                    debug!(
                        remote = %self.remote_id,
                        error = %e,
                        "Ignoring ICE candidate"
                    );
                }
                Ok(())
            }
            Effect::SendCandidate(candidate) => {
                self.signals.send(
                    &self.remote_id,
                    SignalMessage::IceCandidate { candidate },
                );
                Ok(())
            }
            Effect::PlayRemoteAudio(track) => {
                self.renderer.play(&self.remote_id, track);
                self.playing.set(true);
                Ok(())
            }
            Effect::Reject(err) => Err(err),
            Effect::Release => {
                self.release();
                Ok(())
            }
        }
    }

    /// Puts the `stream` tracks onto this link's senders, reusing existing
    /// senders so no renegotiation is needed.
    async fn attach_local(
        &self,
        stream: &LocalStream,
    ) -> Result<(), NegotiationError> {
        for (i, track) in stream.tracks().iter().enumerate() {
            let sender = self.senders.borrow().get(i).cloned();
            match sender {
                Some(sender) => {
                    let same = sender
                        .track()
                        .map_or(false, |current| current.id() == track.id());
                    if !same {
                        sender
                            .replace_track(Some(Rc::clone(track)))
                            .await
                            .map_err(NegotiationError::AttachTrack)?;
                    }
                }
                None => {
                    let sender = self
                        .conn
                        .add_track(Rc::clone(track))
                        .map_err(NegotiationError::AttachTrack)?;
                    self.senders.borrow_mut().push(sender);
                }
            }
            if self.is_closed() {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn send_offer(&self) -> Result<(), NegotiationError> {
        let offer = self
            .conn
            .create_offer()
            .await
            .map_err(NegotiationError::CreateOffer)?;
        if self.is_closed() {
            return Ok(());
        }
        self.conn
            .set_local_description(offer.clone())
            .await
            .map_err(NegotiationError::SetLocalDescription)?;
        if self.is_closed() {
            return Ok(());
        }
        self.signals
            .send(&self.remote_id, SignalMessage::Offer { sdp: offer });
        debug!(remote = %self.remote_id, "Sent SDP offer");
        Ok(())
    }

    async fn answer(
        &self,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.conn
            .set_remote_description(offer)
            .await
            .map_err(NegotiationError::SetRemoteDescription)?;
        if self.is_closed() {
            return Ok(());
        }
        let answer = self
            .conn
            .create_answer()
            .await
            .map_err(NegotiationError::CreateAnswer)?;
        if self.is_closed() {
            return Ok(());
        }
        self.conn
            .set_local_description(answer.clone())
            .await
            .map_err(NegotiationError::SetLocalDescription)?;
        if self.is_closed() {
            return Ok(());
        }
        self.signals
            .send(&self.remote_id, SignalMessage::Answer { sdp: answer });
        debug!(remote = %self.remote_id, "Sent SDP answer");
        Ok(())
    }

    fn release(&self) {
        if let Some(task) = self.events_task.borrow_mut().take() {
            task.abort();
        }
        if let Err(e) = self.conn.close() {
            warn!(
                remote = %self.remote_id,
                error = %e,
                "Failed to close peer connection"
            );
        }
        self.senders.borrow_mut().clear();
        if self.playing.replace(false) {
            self.renderer.stop(&self.remote_id);
        }
        info!(remote = %self.remote_id, "Peer link closed");
    }

    /// Spawns listener for the events of the underlying connection.
    fn spawn_on_connection_event(self: &Rc<Self>) {
        let mut events = match self.conn.take_events() {
            Some(events) => events,
            None => {
                warn!(remote = %self.remote_id, "Connection events taken");
                return;
            }
        };
        let this = Rc::downgrade(self);
        let task = spawn_local(async move {
            while let Some(event) = events.next().await {
                let this = match this.upgrade() {
                    Some(this) => this,
                    None => break,
                };
                if let Err(e) = this.handle(event.into()).await {
                    warn!(
                        remote = %this.remote_id,
                        error = %e,
                        "Peer negotiation failed"
                    );
                }
            }
        });
        *self.events_task.borrow_mut() = Some(task);
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}
