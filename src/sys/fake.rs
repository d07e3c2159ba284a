//! In-process implementation of the platform seam.
//!
//! Connections do not move any media. They produce descriptions of the form
//! `fake-sdp pc=<n> audio=<tracks>`, gather one host candidate per local
//! description and report `Connected` once both descriptions are applied
//! and at least one remote candidate was accepted.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    fmt,
    rc::Rc,
};

use async_trait::async_trait;
use futures::{channel::mpsc, stream::LocalBoxStream, StreamExt};

use crate::{
    config::{AudioConstraints, RtcConfiguration},
    error::{MediaError, RtcError},
    proto::{IceCandidate, SdpType, SessionDescription, UserId},
    sys::{
        AudioRenderer, MediaDevices, MediaStreamTrack, PeerConnectionEvent,
        PeerConnectionFactory, PeerConnectionState, RtcPeerConnection,
        RtpSender, TrackKind, TransceiverDirection,
    },
};

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: Cell<bool>,
    live: Cell<bool>,
}

impl FakeTrack {
    pub fn audio(id: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            id: id.into(),
            kind: TrackKind::Audio,
            enabled: Cell::new(true),
            live: Cell::new(true),
        })
    }
}

impl MediaStreamTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.get()
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    fn stop(&self) {
        self.live.set(false);
    }

    fn is_live(&self) -> bool {
        self.live.get()
    }
}

/// Microphone that can be told to refuse access.
#[derive(Debug, Default)]
pub struct FakeMediaDevices {
    failure: RefCell<Option<MediaError>>,
    issued: RefCell<Vec<Rc<FakeTrack>>>,
    last_constraints: Cell<Option<AudioConstraints>>,
}

impl FakeMediaDevices {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Makes every following acquisition fail with `err`, or succeed again
    /// on [`None`].
    pub fn fail_with(&self, err: Option<MediaError>) {
        *self.failure.borrow_mut() = err;
    }

    /// Every track handed out so far, oldest first.
    pub fn issued(&self) -> Vec<Rc<FakeTrack>> {
        self.issued.borrow().clone()
    }

    pub fn live_tracks(&self) -> usize {
        self.issued.borrow().iter().filter(|t| t.is_live()).count()
    }

    pub fn last_constraints(&self) -> Option<AudioConstraints> {
        self.last_constraints.get()
    }
}

#[async_trait(?Send)]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<Vec<Rc<dyn MediaStreamTrack>>, MediaError> {
        self.last_constraints.set(Some(*constraints));
        if let Some(err) = self.failure.borrow().clone() {
            return Err(err);
        }
        let n = self.issued.borrow().len();
        let track = FakeTrack::audio(format!("mic-{}", n));
        self.issued.borrow_mut().push(Rc::clone(&track));

        Ok(vec![track as Rc<dyn MediaStreamTrack>])
    }
}

#[derive(Debug, Default)]
pub struct FakeRtpSender {
    track: RefCell<Option<Rc<dyn MediaStreamTrack>>>,
}

#[async_trait(?Send)]
impl RtpSender for FakeRtpSender {
    fn track(&self) -> Option<Rc<dyn MediaStreamTrack>> {
        self.track.borrow().clone()
    }

    async fn replace_track(
        &self,
        track: Option<Rc<dyn MediaStreamTrack>>,
    ) -> Result<(), RtcError> {
        *self.track.borrow_mut() = track;
        Ok(())
    }
}

pub struct FakePeerConnection {
    serial: u32,
    remote: UserId,
    events_tx: mpsc::UnboundedSender<PeerConnectionEvent>,
    events_rx: RefCell<Option<mpsc::UnboundedReceiver<PeerConnectionEvent>>>,
    local_desc: RefCell<Option<SessionDescription>>,
    remote_desc: RefCell<Option<SessionDescription>>,
    senders: RefCell<Vec<Rc<FakeRtpSender>>>,
    recv_only: Cell<u32>,
    accepted_candidates: Cell<u32>,
    rejected_candidates: Cell<u32>,
    gathered: Cell<bool>,
    announced_tracks: Cell<u32>,
    state: Cell<PeerConnectionState>,
}

impl FakePeerConnection {
    fn new(serial: u32, remote: UserId) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded();
        Self {
            serial,
            remote,
            events_tx,
            events_rx: RefCell::new(Some(events_rx)),
            local_desc: RefCell::default(),
            remote_desc: RefCell::default(),
            senders: RefCell::default(),
            recv_only: Cell::new(0),
            accepted_candidates: Cell::new(0),
            rejected_candidates: Cell::new(0),
            gathered: Cell::new(false),
            announced_tracks: Cell::new(0),
            state: Cell::new(PeerConnectionState::New),
        }
    }

    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    pub fn state(&self) -> PeerConnectionState {
        self.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state.get() == PeerConnectionState::Closed
    }

    pub fn senders(&self) -> Vec<Rc<FakeRtpSender>> {
        self.senders.borrow().clone()
    }

    pub fn recv_only_transceivers(&self) -> u32 {
        self.recv_only.get()
    }

    pub fn accepted_candidates(&self) -> u32 {
        self.accepted_candidates.get()
    }

    pub fn rejected_candidates(&self) -> u32 {
        self.rejected_candidates.get()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_desc.borrow().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_desc.borrow().clone()
    }

    /// Reports a transport-level state change, as ICE would.
    pub fn simulate_state(&self, state: PeerConnectionState) {
        self.state.set(state);
        self.emit(PeerConnectionEvent::ConnectionStateChanged(state));
    }

    fn emit(&self, event: PeerConnectionEvent) {
        let _ = self.events_tx.unbounded_send(event);
    }

    fn ensure_open(&self) -> Result<(), RtcError> {
        if self.is_closed() {
            Err(RtcError::new("peer connection is closed"))
        } else {
            Ok(())
        }
    }

    fn describe(&self) -> String {
        let audio = self
            .senders
            .borrow()
            .iter()
            .filter(|s| s.track().is_some())
            .count();
        format!("fake-sdp pc={} audio={}", self.serial, audio)
    }

    fn parse_audio(sdp: &str) -> Result<u32, RtcError> {
        let malformed = || RtcError::new(format!("malformed SDP: {:?}", sdp));
        if !sdp.starts_with("fake-sdp ") {
            return Err(malformed());
        }
        sdp.split_whitespace()
            .find_map(|part| part.strip_prefix("audio="))
            .and_then(|n| n.parse().ok())
            .ok_or_else(malformed)
    }

    fn is_stable(&self) -> bool {
        match (&*self.local_desc.borrow(), &*self.remote_desc.borrow()) {
            (Some(local), Some(remote)) => local.kind != remote.kind,
            _ => false,
        }
    }

    fn maybe_connect(&self) {
        if self.state.get() != PeerConnectionState::Connected
            && self.is_stable()
            && self.accepted_candidates.get() > 0
        {
            self.simulate_state(PeerConnectionState::Connected);
        }
    }
}

#[async_trait(?Send)]
impl RtcPeerConnection for FakePeerConnection {
    fn take_events(
        &self,
    ) -> Option<LocalBoxStream<'static, PeerConnectionEvent>> {
        self.events_rx.borrow_mut().take().map(StreamExt::boxed_local)
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.describe()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_open()?;
        match &*self.remote_desc.borrow() {
            Some(remote) if remote.kind == SdpType::Offer => {}
            _ => return Err(RtcError::new("no remote offer to answer")),
        }
        Ok(SessionDescription::answer(self.describe()))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), RtcError> {
        self.ensure_open()?;
        Self::parse_audio(&desc.sdp)?;
        *self.local_desc.borrow_mut() = Some(desc);
        if self.state.get() == PeerConnectionState::New {
            self.state.set(PeerConnectionState::Connecting);
        }
        if !self.gathered.replace(true) {
            self.emit(PeerConnectionEvent::IceCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 10.0.0.{} {} typ host",
                    self.serial,
                    self.serial % 250 + 1,
                    50000 + self.serial,
                ),
                sdp_mid: Some("0".to_owned()),
                sdp_m_line_index: Some(0),
            }));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), RtcError> {
        self.ensure_open()?;
        let audio = Self::parse_audio(&desc.sdp)?;
        if desc.kind == SdpType::Answer {
            match &*self.local_desc.borrow() {
                Some(local) if local.kind == SdpType::Offer => {}
                _ => return Err(RtcError::new("no local offer pending")),
            }
        }
        *self.remote_desc.borrow_mut() = Some(desc);

        for n in self.announced_tracks.get()..audio {
            self.emit(PeerConnectionEvent::Track(FakeTrack::audio(format!(
                "remote-{}-{}",
                self.serial, n
            ))));
        }
        self.announced_tracks.set(audio.max(self.announced_tracks.get()));
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        _: IceCandidate,
    ) -> Result<(), RtcError> {
        self.ensure_open()?;
        if self.remote_desc.borrow().is_none() {
            self.rejected_candidates
                .set(self.rejected_candidates.get() + 1);
            return Err(RtcError::new("remote description is not set"));
        }
        self.accepted_candidates
            .set(self.accepted_candidates.get() + 1);
        self.maybe_connect();
        Ok(())
    }

    fn add_track(
        &self,
        track: Rc<dyn MediaStreamTrack>,
    ) -> Result<Rc<dyn RtpSender>, RtcError> {
        self.ensure_open()?;
        let sender = Rc::new(FakeRtpSender {
            track: RefCell::new(Some(track)),
        });
        self.senders.borrow_mut().push(Rc::clone(&sender));
        self.emit(PeerConnectionEvent::NegotiationNeeded);
        Ok(sender)
    }

    fn add_transceiver(
        &self,
        _: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), RtcError> {
        self.ensure_open()?;
        if direction == TransceiverDirection::RecvOnly {
            self.recv_only.set(self.recv_only.get() + 1);
        }
        self.emit(PeerConnectionEvent::NegotiationNeeded);
        Ok(())
    }

    fn close(&self) -> Result<(), RtcError> {
        self.state.set(PeerConnectionState::Closed);
        self.events_tx.close_channel();
        Ok(())
    }
}

impl fmt::Debug for FakePeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakePeerConnection")
            .field("serial", &self.serial)
            .field("remote", &self.remote)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Factory remembering every connection it created.
#[derive(Debug, Default)]
pub struct FakePeerConnectionFactory {
    next_serial: Cell<u32>,
    created: RefCell<Vec<Rc<FakePeerConnection>>>,
    refuse: RefCell<HashSet<UserId>>,
    last_config: RefCell<Option<RtcConfiguration>>,
}

impl FakePeerConnectionFactory {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Makes creation of connections to `remote` fail.
    pub fn refuse(&self, remote: &UserId) {
        self.refuse.borrow_mut().insert(remote.clone());
    }

    pub fn allow(&self, remote: &UserId) {
        self.refuse.borrow_mut().remove(remote);
    }

    /// Connections created for `remote`, oldest first.
    pub fn connections_to(&self, remote: &UserId) -> Vec<Rc<FakePeerConnection>> {
        self.created
            .borrow()
            .iter()
            .filter(|pc| &pc.remote == remote)
            .cloned()
            .collect()
    }

    /// The newest connection created for `remote`.
    pub fn latest_to(&self, remote: &UserId) -> Option<Rc<FakePeerConnection>> {
        self.connections_to(remote).pop()
    }

    pub fn created_count(&self) -> usize {
        self.created.borrow().len()
    }

    pub fn last_config(&self) -> Option<RtcConfiguration> {
        self.last_config.borrow().clone()
    }
}

impl PeerConnectionFactory for FakePeerConnectionFactory {
    fn create(
        &self,
        remote: &UserId,
        config: &RtcConfiguration,
    ) -> Result<Rc<dyn RtcPeerConnection>, RtcError> {
        if self.refuse.borrow().contains(remote) {
            return Err(RtcError::new("connection refused by platform"));
        }
        *self.last_config.borrow_mut() = Some(config.clone());
        let serial = self.next_serial.get() + 1;
        self.next_serial.set(serial);

        let pc = Rc::new(FakePeerConnection::new(serial, remote.clone()));
        self.created.borrow_mut().push(Rc::clone(&pc));
        Ok(pc)
    }
}

/// Renderer recording which remote peers are currently audible.
#[derive(Debug, Default)]
pub struct FakeAudioRenderer {
    playing: RefCell<HashMap<UserId, Rc<dyn MediaStreamTrack>>>,
}

impl FakeAudioRenderer {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn is_playing(&self, remote: &UserId) -> bool {
        self.playing.borrow().contains_key(remote)
    }

    pub fn playing_count(&self) -> usize {
        self.playing.borrow().len()
    }
}

impl AudioRenderer for FakeAudioRenderer {
    fn play(&self, remote: &UserId, track: Rc<dyn MediaStreamTrack>) {
        self.playing.borrow_mut().insert(remote.clone(), track);
    }

    fn stop(&self, remote: &UserId) {
        self.playing.borrow_mut().remove(remote);
    }
}
