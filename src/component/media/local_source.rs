use std::{cell::RefCell, rc::Rc};

use tracing::{debug, warn};

use crate::{
    config::AudioConstraints,
    error::MediaError,
    sys::{MediaDevices, MediaStreamTrack, TrackKind},
};

/// Live microphone capture.
#[derive(Clone, Debug)]
pub struct LocalStream {
    tracks: Vec<Rc<dyn MediaStreamTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Rc<dyn MediaStreamTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Rc<dyn MediaStreamTrack>] {
        &self.tracks
    }

    fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Owner of the single local microphone capture.
///
/// Hard mute is realized by [`LocalMediaSource::release`], which stops the
/// capture device entirely instead of just silencing tracks.
pub struct LocalMediaSource {
    devices: Rc<dyn MediaDevices>,
    constraints: AudioConstraints,
    stream: RefCell<Option<LocalStream>>,
}

impl LocalMediaSource {
    pub fn new(
        devices: Rc<dyn MediaDevices>,
        constraints: AudioConstraints,
    ) -> Self {
        Self {
            devices,
            constraints,
            stream: RefCell::new(None),
        }
    }

    /// Returns the current [`LocalStream`], starting capture if there is
    /// none.
    pub async fn acquire(&self) -> Result<LocalStream, MediaError> {
        if let Some(stream) = self.current() {
            return Ok(stream);
        }

        let tracks = self.devices.get_user_media(&self.constraints).await?;
        let (audio, other): (Vec<_>, Vec<_>) = tracks
            .into_iter()
            .partition(|t| t.kind() == TrackKind::Audio);
        for track in other {
            warn!(track = track.id(), "Dropping non-audio capture track");
            track.stop();
        }
        if audio.is_empty() {
            return Err(MediaError::DeviceUnavailable(
                "capture returned no audio track".to_owned(),
            ));
        }
        let stream = LocalStream { tracks: audio };

        // Someone else may have finished acquiring while we were waiting.
        if let Some(existing) = self.current() {
            stream.stop();
            return Ok(existing);
        }
        *self.stream.borrow_mut() = Some(stream.clone());
        debug!(tracks = stream.tracks.len(), "Local capture started");

        Ok(stream)
    }

    /// Stops capture. Does nothing if nothing is captured.
    pub fn release(&self) {
        let stream = self.stream.borrow_mut().take();
        if let Some(stream) = stream {
            stream.stop();
            debug!("Local capture stopped");
        }
    }

    pub fn current(&self) -> Option<LocalStream> {
        self.stream.borrow().clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.stream.borrow().is_some()
    }
}
