//! Lifecycle of the local member inside a single room.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use futures::{future::LocalBoxFuture, stream::LocalBoxStream, StreamExt as _};
use medea_reactive::{DroppedError, ObservableCell};
use tokio::task::{spawn_local, JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    component::{
        manager::{PeerConnectionManager, Reconciliation},
        media::LocalMediaSource,
    },
    config::RoomConfig,
    error::RoomError,
    proto::{ConnectionStatus, Participant, RoomId, UserId},
    signaling::{ReconnectionSupervisor, SignalSender, SignalingChannel},
    store::{Identity, RoomStore},
    sys::{AudioRenderer, MediaDevices, PeerConnectionFactory},
};

/// Everything a [`Room`] talks to outside of this crate.
#[derive(Clone)]
pub struct Services {
    pub store: Rc<dyn RoomStore>,
    pub channel: Rc<dyn SignalingChannel>,
    pub factory: Rc<dyn PeerConnectionFactory>,
    pub devices: Rc<dyn MediaDevices>,
    pub renderer: Rc<dyn AudioRenderer>,
}

/// Local member of a full-mesh audio room.
///
/// Keeps one peer link per other member, mirrors the local mute flag into
/// the store and keeps the signaling channel alive across disconnects.
pub struct Room {
    id: RoomId,
    local_id: UserId,
    store: Rc<dyn RoomStore>,
    media: Rc<LocalMediaSource>,
    manager: Rc<PeerConnectionManager>,
    supervisor: Rc<ReconnectionSupervisor>,
    participants: RefCell<Vec<Participant>>,
    is_muted: ObservableCell<bool>,
    joined: Cell<bool>,
    signals_task: RefCell<Option<JoinHandle<()>>>,
    membership_task: RefCell<Option<JoinHandle<()>>>,
}

impl Room {
    pub fn new(
        id: RoomId,
        identity: &dyn Identity,
        config: &RoomConfig,
        services: Services,
    ) -> Rc<Self> {
        let local_id = identity.current_user_id();
        let media = Rc::new(LocalMediaSource::new(
            services.devices,
            config.audio,
        ));
        let supervisor = ReconnectionSupervisor::new(
            id.clone(),
            local_id.clone(),
            services.channel,
            config.reconnect_backoff(),
        );
        let manager = Rc::new(PeerConnectionManager::new(
            local_id.clone(),
            config.rtc_configuration(),
            services.factory,
            Rc::clone(&supervisor) as Rc<dyn SignalSender>,
            services.renderer,
            Rc::clone(&media),
        ));

        Rc::new(Self {
            id,
            local_id,
            store: services.store,
            media,
            manager,
            supervisor,
            participants: RefCell::default(),
            is_muted: ObservableCell::new(false),
            joined: Cell::new(false),
            signals_task: RefCell::new(None),
            membership_task: RefCell::new(None),
        })
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    pub fn is_joined(&self) -> bool {
        self.joined.get()
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted.get()
    }

    pub fn on_mute_change(&self) -> LocalBoxStream<'static, bool> {
        self.is_muted.subscribe()
    }

    /// Last member list read from the store.
    pub fn participants(&self) -> Vec<Participant> {
        self.participants.borrow().clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.supervisor.status()
    }

    pub fn on_connection_status_change(
        &self,
    ) -> LocalBoxStream<'static, ConnectionStatus> {
        self.supervisor.on_status_change()
    }

    pub fn when_connection_status(
        &self,
        status: ConnectionStatus,
    ) -> LocalBoxFuture<'static, Result<(), DroppedError>> {
        self.supervisor.when_status(status)
    }

    pub fn peers(&self) -> &Rc<PeerConnectionManager> {
        &self.manager
    }

    pub fn signaling(&self) -> &Rc<ReconnectionSupervisor> {
        &self.supervisor
    }

    /// Enters the room.
    ///
    /// Registers the membership unless it already exists, starts the
    /// microphone, subscribes to signaling and links up with every member
    /// already present.
    ///
    /// A microphone failure does not abort the join: the room is entered
    /// muted and listen-only, and the failure is still returned as
    /// [`RoomError::Media`] so it can be shown to the user.
    pub async fn join(self: &Rc<Self>) -> Result<(), RoomError> {
        if self.joined.get() {
            return Ok(());
        }

        let present = self.store.participants(&self.id).await?;
        if present.iter().any(|p| p.user_id == self.local_id) {
            debug!(room = %self.id, "Already a member");
        } else {
            self.store
                .join_room(&self.id, &self.local_id, self.is_muted.get())
                .await?;
        }
        self.joined.set(true);
        info!(room = %self.id, user = %self.local_id, "Joined room");

        let capture = if self.is_muted.get() {
            Ok(())
        } else {
            self.media.acquire().await.map(drop)
        };
        if let Err(e) = &capture {
            warn!(room = %self.id, error = %e, "Joining without microphone");
            self.is_muted.set(true);
            self.persist_mute(true).await;
        }

        self.spawn_on_signal();
        self.supervisor.start().await;
        self.spawn_on_membership_change();
        if let Err(e) = self.refresh_participants().await {
            warn!(room = %self.id, error = %e, "Failed to load members");
        }

        capture.map_err(RoomError::from)
    }

    /// Leaves the room.
    ///
    /// Local resources are released even if the store could not be
    /// updated. The room record is deleted once nobody is left in it.
    pub async fn leave(&self) -> Result<(), RoomError> {
        if !self.joined.get() {
            return Ok(());
        }
        let result = self.unregister().await;
        self.cleanup();
        info!(room = %self.id, user = %self.local_id, "Left room");
        result
    }

    /// Flips the local mute flag and returns the new value.
    ///
    /// Muting stops the microphone. Unmuting captures it again and puts the
    /// new track onto every existing link.
    pub async fn toggle_mute(&self) -> Result<bool, RoomError> {
        if !self.joined.get() {
            return Err(RoomError::NotJoined);
        }
        let muted = !self.is_muted.get();
        self.store
            .update_mute(&self.id, &self.local_id, muted)
            .await?;

        if muted {
            self.is_muted.set(true);
            self.manager.set_outbound_enabled(false).await;
            self.media.release();
            debug!(room = %self.id, "Muted");
            return Ok(true);
        }

        match self.media.acquire().await {
            Ok(stream) => {
                self.is_muted.set(false);
                self.manager.attach_local_stream(&stream).await;
                self.manager.set_outbound_enabled(true).await;
                debug!(room = %self.id, "Unmuted");
                Ok(false)
            }
            Err(e) => {
                warn!(room = %self.id, error = %e, "Failed to unmute");
                self.persist_mute(true).await;
                Err(e.into())
            }
        }
    }

    /// Re-reads the member list and reconciles peer links with it.
    pub async fn refresh_participants(
        &self,
    ) -> Result<Reconciliation, RoomError> {
        let participants = self.store.participants(&self.id).await?;
        *self.participants.borrow_mut() = participants.clone();
        if !self.joined.get() {
            return Ok(Reconciliation::default());
        }
        Ok(self.manager.reconcile(&participants).await)
    }

    async fn unregister(&self) -> Result<(), RoomError> {
        self.store.leave_room(&self.id, &self.local_id).await?;
        let remaining = self.store.participants(&self.id).await?;
        if remaining.is_empty() {
            info!(room = %self.id, "Deleting empty room");
            self.store.delete_room(&self.id).await?;
        }
        Ok(())
    }

    async fn persist_mute(&self, muted: bool) {
        if let Err(e) = self
            .store
            .update_mute(&self.id, &self.local_id, muted)
            .await
        {
            warn!(room = %self.id, error = %e, "Failed to store mute flag");
        }
    }

    fn cleanup(&self) {
        self.joined.set(false);
        if let Some(task) = self.membership_task.borrow_mut().take() {
            task.abort();
        }
        self.manager.close_all();
        self.media.release();
        self.supervisor.stop();
        self.participants.borrow_mut().clear();
    }

    /// Spawns the sequential consumer of inbound signaling envelopes.
    ///
    /// Spawned once per [`Room`]: the inbound queue outlives sessions and
    /// joins.
    fn spawn_on_signal(self: &Rc<Self>) {
        let mut inbound = match self.supervisor.take_inbound() {
            Some(inbound) => inbound,
            None => return,
        };
        let this = Rc::downgrade(self);
        let task = spawn_local(async move {
            while let Some(envelope) = inbound.next().await {
                let this = match this.upgrade() {
                    Some(this) => this,
                    None => break,
                };
                if this.joined.get() {
                    this.manager.handle_envelope(envelope).await;
                }
            }
        });
        *self.signals_task.borrow_mut() = Some(task);
    }

    fn spawn_on_membership_change(self: &Rc<Self>) {
        let mut changes = self.store.membership_changes(&self.id);
        let this = Rc::downgrade(self);
        let task = spawn_local(async move {
            while changes.next().await.is_some() {
                let this = match this.upgrade() {
                    Some(this) => this,
                    None => break,
                };
                if let Err(e) = this.refresh_participants().await {
                    warn!(room = %this.id, error = %e, "Membership refresh failed");
                }
            }
        });
        let old = self.membership_task.borrow_mut().replace(task);
        if let Some(old) = old {
            old.abort();
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        if let Some(task) = self.signals_task.borrow_mut().take() {
            task.abort();
        }
        self.cleanup();
    }
}
