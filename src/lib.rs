//! Orchestration core of a full-mesh audio room.
//!
//! Every member keeps a direct audio link to every other member. Links are
//! negotiated through a room-scoped signaling channel and reconciled with
//! the membership kept in a [`store::RoomStore`]. The platform media stack
//! is reached only through the traits of [`sys`].

pub mod component;
pub mod config;
pub mod error;
pub mod proto;
pub mod signaling;
pub mod store;
pub mod sys;

pub use self::{
    component::{Room, Services},
    config::RoomConfig,
    error::RoomError,
    proto::{ConnectionStatus, Participant, RoomId, UserId},
};
