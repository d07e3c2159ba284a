//! Seam between the room logic and the platform media stack.

pub mod fake;
mod media_stream_track;
mod rtc_peer_connection;

pub use self::{
    media_stream_track::{
        AudioRenderer, MediaDevices, MediaStreamTrack, TrackKind,
    },
    rtc_peer_connection::{
        PeerConnectionEvent, PeerConnectionFactory, PeerConnectionState,
        RtcPeerConnection, RtpSender, TransceiverDirection,
    },
};
