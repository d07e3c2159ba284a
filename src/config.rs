//! Room configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// STUN/TURN server handed to every peer connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Processing requested from the capture device. Best effort: a device may
/// ignore any of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Configuration passed to the platform when creating a peer connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub ice_servers: Vec<IceServer>,

    /// Fixed delay before re-subscribing to a disconnected signaling
    /// channel. Applied on every attempt, without growth or cap.
    pub reconnect_backoff_ms: u64,

    pub audio: AudioConstraints,
}

impl RoomConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn rtc_configuration(&self) -> RtcConfiguration {
        RtcConfiguration {
            ice_servers: self.ice_servers.clone(),
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        let mut ice_servers = vec![IceServer::stun("stun:stun.l.google.com:19302")];
        ice_servers.extend(
            (1..=4).map(|n| {
                IceServer::stun(format!("stun:stun{}.l.google.com:19302", n))
            }),
        );
        // Free relay without TURNS support. Fine for testing only.
        ice_servers.push(IceServer::turn(
            "turn:freestun.net:3478",
            "free",
            "free",
        ));

        Self {
            ice_servers,
            reconnect_backoff_ms: 3000,
            audio: AudioConstraints::default(),
        }
    }
}
