use std::{fmt, rc::Rc};

use async_trait::async_trait;

use crate::{config::AudioConstraints, error::MediaError, proto::UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Platform media track.
///
/// Disabling a track keeps it attached to its senders but makes it
/// transmit silence, so connected peers need no renegotiation.
pub trait MediaStreamTrack: fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    fn enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Stops capture. A stopped track never becomes live again.
    fn stop(&self);

    fn is_live(&self) -> bool;
}

/// Capture device access.
#[async_trait(?Send)]
pub trait MediaDevices {
    /// Requests a live audio-only capture with the provided processing
    /// constraints.
    async fn get_user_media(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<Vec<Rc<dyn MediaStreamTrack>>, MediaError>;
}

/// Rendering collaborator playing remote audio.
///
/// The room never owns output devices itself: it hands each remote track
/// to the renderer and asks it to stop once the peer is gone.
pub trait AudioRenderer {
    fn play(&self, remote: &UserId, track: Rc<dyn MediaStreamTrack>);

    fn stop(&self, remote: &UserId);
}
