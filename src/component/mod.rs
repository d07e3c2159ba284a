mod manager;
mod media;
mod peer;
mod room;

pub use self::{
    manager::{PeerConnectionManager, Reconciliation},
    media::{LocalMediaSource, LocalStream},
    peer::{
        transition, Effect, NegotiationRole, PeerEvent, PeerLink, PeerState,
        Transition,
    },
    room::{Room, Services},
};
