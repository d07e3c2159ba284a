//! Room-scoped pub/sub channel carrying [`SignalEnvelope`]s.

pub mod memory;
mod supervisor;

use async_trait::async_trait;
use futures::stream::LocalBoxStream;

use crate::{
    error::SignalingError,
    proto::{ChannelEvent, RoomId, SignalEnvelope, SignalMessage, UserId},
};

pub use self::supervisor::ReconnectionSupervisor;

/// Relay able to open sessions on a room's signaling topic.
#[async_trait(?Send)]
pub trait SignalingChannel {
    async fn subscribe(
        &self,
        room: &RoomId,
    ) -> Result<Box<dyn ChannelSession>, SignalingError>;
}

/// Single subscription to a room's signaling topic.
///
/// Sessions are never reused: a reconnect opens a new one.
pub trait ChannelSession {
    /// Broadcasts `envelope` to the other members of the room.
    fn send(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError>;

    /// Takes the stream of inbound messages and lifecycle events.
    ///
    /// Returns [`None`] if the stream was already taken.
    fn take_events(&self) -> Option<LocalBoxStream<'static, ChannelEvent>>;

    fn unsubscribe(&self);
}

/// Outbound half of signaling as seen by peer links.
pub trait SignalSender {
    fn send(&self, to: &UserId, message: SignalMessage);
}
