use std::{fmt, rc::Rc};

use async_trait::async_trait;
use futures::stream::LocalBoxStream;

use crate::{
    config::RtcConfiguration,
    error::RtcError,
    proto::{IceCandidate, SessionDescription, UserId},
    sys::{MediaStreamTrack, TrackKind},
};

/// Transport-level state of a peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    RecvOnly,
}

/// Events a peer connection emits on its own.
#[derive(Debug)]
pub enum PeerConnectionEvent {
    NegotiationNeeded,
    IceCandidate(IceCandidate),
    ConnectionStateChanged(PeerConnectionState),
    Track(Rc<dyn MediaStreamTrack>),
}

#[async_trait(?Send)]
pub trait RtpSender: fmt::Debug {
    fn track(&self) -> Option<Rc<dyn MediaStreamTrack>>;

    /// Swaps the transmitted track without renegotiation.
    async fn replace_track(
        &self,
        track: Option<Rc<dyn MediaStreamTrack>>,
    ) -> Result<(), RtcError>;
}

#[async_trait(?Send)]
pub trait RtcPeerConnection: fmt::Debug {
    /// Takes the stream of [`PeerConnectionEvent`]s.
    ///
    /// Returns [`None`] if the stream was already taken. The stream ends
    /// once the connection is closed.
    fn take_events(
        &self,
    ) -> Option<LocalBoxStream<'static, PeerConnectionEvent>>;

    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;

    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), RtcError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), RtcError>;

    async fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), RtcError>;

    fn add_track(
        &self,
        track: Rc<dyn MediaStreamTrack>,
    ) -> Result<Rc<dyn RtpSender>, RtcError>;

    fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), RtcError>;

    /// Closes the connection, aborting any negotiation in flight.
    fn close(&self) -> Result<(), RtcError>;
}

pub trait PeerConnectionFactory {
    fn create(
        &self,
        remote: &UserId,
        config: &RtcConfiguration,
    ) -> Result<Rc<dyn RtcPeerConnection>, RtcError>;
}
