//! Persistent room membership.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::Rc,
};

use async_trait::async_trait;
use futures::{channel::mpsc, stream::LocalBoxStream, StreamExt as _};
use tracing::debug;

use crate::{
    error::StoreError,
    proto::{Participant, RoomId, UserId},
};

/// Source of the authenticated local identity.
pub trait Identity {
    fn current_user_id(&self) -> UserId;
}

impl Identity for UserId {
    fn current_user_id(&self) -> UserId {
        self.clone()
    }
}

/// Membership storage of rooms.
///
/// A `(room, user)` pair is unique: joining twice is not an error and
/// leaves a single record.
#[async_trait(?Send)]
pub trait RoomStore {
    async fn create_room(
        &self,
        room: &RoomId,
        name: &str,
        created_by: &UserId,
    ) -> Result<(), StoreError>;

    /// Current members of `room`, in join order.
    async fn participants(
        &self,
        room: &RoomId,
    ) -> Result<Vec<Participant>, StoreError>;

    async fn join_room(
        &self,
        room: &RoomId,
        user: &UserId,
        is_muted: bool,
    ) -> Result<(), StoreError>;

    async fn leave_room(
        &self,
        room: &RoomId,
        user: &UserId,
    ) -> Result<(), StoreError>;

    async fn update_mute(
        &self,
        room: &RoomId,
        user: &UserId,
        is_muted: bool,
    ) -> Result<(), StoreError>;

    async fn delete_room(&self, room: &RoomId) -> Result<(), StoreError>;

    /// Fires whenever the member set (or a member's mute flag) of `room`
    /// changes. Carries no payload: listeners re-read
    /// [`RoomStore::participants`].
    fn membership_changes(&self, room: &RoomId) -> LocalBoxStream<'static, ()>;
}

#[derive(Debug)]
struct RoomRecord {
    name: String,
    created_by: UserId,
    members: Vec<(UserId, bool)>,
}

/// [`RoomStore`] kept in memory and shared by every client of a process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: RefCell<HashMap<RoomId, RoomRecord>>,
    display_names: RefCell<HashMap<UserId, String>>,
    watchers: RefCell<HashMap<RoomId, Vec<mpsc::UnboundedSender<()>>>>,
    failing: RefCell<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn set_display_name(&self, user: &UserId, name: impl Into<String>) {
        self.display_names
            .borrow_mut()
            .insert(user.clone(), name.into());
    }

    pub fn room_exists(&self, room: &RoomId) -> bool {
        self.rooms.borrow().contains_key(room)
    }

    pub fn room_name(&self, room: &RoomId) -> Option<String> {
        self.rooms.borrow().get(room).map(|r| r.name.clone())
    }

    pub fn room_creator(&self, room: &RoomId) -> Option<UserId> {
        self.rooms.borrow().get(room).map(|r| r.created_by.clone())
    }

    /// Makes `operation` (named as the [`RoomStore`] method) fail until
    /// [`MemoryStore::recover`] is called.
    pub fn fail(&self, operation: &'static str) {
        self.failing.borrow_mut().insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        self.failing.borrow_mut().remove(operation);
    }

    fn check(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.failing.borrow().contains(operation) {
            Err(StoreError::new(operation, "store is unavailable"))
        } else {
            Ok(())
        }
    }

    fn notify(&self, room: &RoomId) {
        if let Some(watchers) = self.watchers.borrow_mut().get_mut(room) {
            watchers.retain(|tx| tx.unbounded_send(()).is_ok());
        }
    }
}

#[async_trait(?Send)]
impl RoomStore for MemoryStore {
    async fn create_room(
        &self,
        room: &RoomId,
        name: &str,
        created_by: &UserId,
    ) -> Result<(), StoreError> {
        self.check("create_room")?;
        let mut rooms = self.rooms.borrow_mut();
        if rooms.contains_key(room) {
            return Err(StoreError::new("create_room", "room already exists"));
        }
        rooms.insert(
            room.clone(),
            RoomRecord {
                name: name.to_owned(),
                created_by: created_by.clone(),
                members: Vec::new(),
            },
        );
        Ok(())
    }

    async fn participants(
        &self,
        room: &RoomId,
    ) -> Result<Vec<Participant>, StoreError> {
        self.check("participants")?;
        let rooms = self.rooms.borrow();
        let names = self.display_names.borrow();
        let members = rooms.get(room).map_or(&[][..], |r| &r.members[..]);
        Ok(members
            .iter()
            .map(|(id, is_muted)| Participant {
                user_id: id.clone(),
                display_name: names.get(id).cloned(),
                is_muted: *is_muted,
            })
            .collect())
    }

    async fn join_room(
        &self,
        room: &RoomId,
        user: &UserId,
        is_muted: bool,
    ) -> Result<(), StoreError> {
        self.check("join_room")?;
        {
            let mut rooms = self.rooms.borrow_mut();
            let record = rooms.get_mut(room).ok_or_else(|| {
                StoreError::new("join_room", "room does not exist")
            })?;
            if record.members.iter().any(|(id, _)| id == user) {
                debug!(%room, %user, "Already a member");
                return Ok(());
            }
            record.members.push((user.clone(), is_muted));
        }
        self.notify(room);
        Ok(())
    }

    async fn leave_room(
        &self,
        room: &RoomId,
        user: &UserId,
    ) -> Result<(), StoreError> {
        self.check("leave_room")?;
        if let Some(record) = self.rooms.borrow_mut().get_mut(room) {
            record.members.retain(|(id, _)| id != user);
        }
        self.notify(room);
        Ok(())
    }

    async fn update_mute(
        &self,
        room: &RoomId,
        user: &UserId,
        is_muted: bool,
    ) -> Result<(), StoreError> {
        self.check("update_mute")?;
        {
            let mut rooms = self.rooms.borrow_mut();
            let member = rooms
                .get_mut(room)
                .and_then(|r| r.members.iter_mut().find(|(id, _)| id == user))
                .ok_or_else(|| {
                    StoreError::new("update_mute", "not a member of the room")
                })?;
            member.1 = is_muted;
        }
        self.notify(room);
        Ok(())
    }

    async fn delete_room(&self, room: &RoomId) -> Result<(), StoreError> {
        self.check("delete_room")?;
        self.rooms.borrow_mut().remove(room);
        self.notify(room);
        Ok(())
    }

    fn membership_changes(&self, room: &RoomId) -> LocalBoxStream<'static, ()> {
        let (tx, rx) = mpsc::unbounded();
        self.watchers
            .borrow_mut()
            .entry(room.clone())
            .or_default()
            .push(tx);
        rx.boxed_local()
    }
}
