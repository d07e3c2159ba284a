//! Keeps one [`PeerLink`] per remote member of the room.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::Rc,
};

use tracing::{debug, info, trace, warn};

use crate::{
    component::{
        media::{LocalMediaSource, LocalStream},
        peer::{NegotiationRole, PeerEvent, PeerLink, PeerState},
    },
    config::RtcConfiguration,
    error::NegotiationError,
    proto::{Participant, SignalEnvelope, SignalMessage, UserId},
    signaling::SignalSender,
    sys::{AudioRenderer, PeerConnectionFactory},
};

/// Signals kept per unknown sender until a link to it appears.
const EARLY_SIGNALS_LIMIT: usize = 32;

/// Unknown senders whose signals are held at the same time.
const EARLY_SENDERS_LIMIT: usize = 64;

/// Outcome of a single [`PeerConnectionManager::reconcile`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub created: Vec<UserId>,
    pub removed: Vec<UserId>,
    /// Members whose link could not be created. Retried by the next call.
    pub failed: Vec<UserId>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty()
            && self.removed.is_empty()
            && self.failed.is_empty()
    }
}

pub struct PeerConnectionManager {
    local_id: UserId,
    rtc_config: RtcConfiguration,
    factory: Rc<dyn PeerConnectionFactory>,
    signals: Rc<dyn SignalSender>,
    renderer: Rc<dyn AudioRenderer>,
    media: Rc<LocalMediaSource>,
    links: RefCell<HashMap<UserId, Rc<PeerLink>>>,

    /// Signals that arrived before the membership update naming their
    /// sender.
    early: RefCell<HashMap<UserId, Vec<SignalMessage>>>,
}

impl PeerConnectionManager {
    pub fn new(
        local_id: UserId,
        rtc_config: RtcConfiguration,
        factory: Rc<dyn PeerConnectionFactory>,
        signals: Rc<dyn SignalSender>,
        renderer: Rc<dyn AudioRenderer>,
        media: Rc<LocalMediaSource>,
    ) -> Self {
        Self {
            local_id,
            rtc_config,
            factory,
            signals,
            renderer,
            media,
            links: RefCell::default(),
            early: RefCell::default(),
        }
    }

    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    pub fn link(&self, remote: &UserId) -> Option<Rc<PeerLink>> {
        self.links.borrow().get(remote).cloned()
    }

    /// Remote members a link exists for, sorted.
    pub fn remote_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<_> = self.links.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.links.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.borrow().is_empty()
    }

    pub fn states(&self) -> HashMap<UserId, PeerState> {
        self.links
            .borrow()
            .iter()
            .map(|(id, link)| (id.clone(), link.state()))
            .collect()
    }

    /// Brings the set of links in line with `participants`.
    ///
    /// Links to members that are gone, and links that failed, are closed.
    /// Every other member except the local one gets a link if it has none.
    /// A failed link whose member is still present is thus recreated.
    ///
    /// Links are registered before any negotiation starts, so a concurrent
    /// call never creates a second link to the same member.
    ///
    /// Held early signals of senders absent from `participants` are
    /// discarded.
    pub async fn reconcile(&self, participants: &[Participant]) -> Reconciliation {
        let wanted: HashSet<&UserId> = participants
            .iter()
            .map(|p| &p.user_id)
            .filter(|id| **id != self.local_id)
            .collect();
        let mut report = Reconciliation::default();

        self.early.borrow_mut().retain(|id, held| {
            let keep = wanted.contains(id);
            if !keep {
                debug!(from = %id, count = held.len(), "Discarding held signals");
            }
            keep
        });

        let stale: Vec<_> = self
            .links
            .borrow()
            .iter()
            .filter(|(id, link)| {
                !wanted.contains(id) || link.state() == PeerState::Failed
            })
            .map(|(id, link)| (id.clone(), Rc::clone(link)))
            .collect();
        for (id, link) in stale {
            self.links.borrow_mut().remove(&id);
            debug!(remote = %id, state = ?link.state(), "Removing peer link");
            link.close();
            report.removed.push(id);
        }

        let mut missing: Vec<&UserId> = wanted
            .iter()
            .copied()
            .filter(|id| !self.links.borrow().contains_key(*id))
            .collect();
        missing.sort();

        let mut started = Vec::new();
        for id in missing {
            match self.create_link(id) {
                Ok(link) => {
                    self.links
                        .borrow_mut()
                        .insert(id.clone(), Rc::clone(&link));
                    report.created.push(id.clone());
                    started.push(link);
                }
                Err(e) => {
                    warn!(remote = %id, error = %e, "Failed to create peer link");
                    report.failed.push(id.clone());
                }
            }
        }

        let local = self.media.current();
        for link in started {
            if link.is_closed() {
                continue;
            }
            if let Err(e) = link.start(local.clone()).await {
                warn!(
                    remote = %link.remote_id(),
                    error = %e,
                    "Failed to start peer link"
                );
            }
            self.replay_early(&link).await;
        }

        if !report.is_noop() {
            info!(
                created = report.created.len(),
                removed = report.removed.len(),
                failed = report.failed.len(),
                total = self.len(),
                "Peer links reconciled"
            );
        }
        report
    }

    /// Routes an inbound envelope to the link of its sender.
    pub async fn handle_envelope(&self, envelope: SignalEnvelope) {
        let SignalEnvelope { from, to, payload } = envelope;
        if to != self.local_id {
            trace!(%from, %to, "Skipping envelope for another member");
            return;
        }
        match self.link(&from) {
            Some(link) => self.deliver(&link, payload).await,
            None => {
                let mut early = self.early.borrow_mut();
                if !early.contains_key(&from)
                    && early.len() >= EARLY_SENDERS_LIMIT
                {
                    warn!(%from, "Too many unknown senders, dropping signal");
                    return;
                }
                let queue = early.entry(from.clone()).or_default();
                if queue.len() < EARLY_SIGNALS_LIMIT {
                    debug!(%from, kind = payload.kind(), "Holding early signal");
                    queue.push(payload);
                } else {
                    warn!(%from, "Dropping signal from unknown member");
                }
            }
        }
    }

    /// Puts `stream` onto every link, replacing previous local tracks.
    pub async fn attach_local_stream(&self, stream: &LocalStream) {
        for link in self.snapshot() {
            let event = PeerEvent::LocalStreamChanged(stream.clone());
            if let Err(e) = link.handle(event).await {
                warn!(
                    remote = %link.remote_id(),
                    error = %e,
                    "Failed to attach local audio"
                );
            }
        }
    }

    pub async fn set_outbound_enabled(&self, enabled: bool) {
        for link in self.snapshot() {
            let event = PeerEvent::OutboundEnabled(enabled);
            if let Err(e) = link.handle(event).await {
                warn!(remote = %link.remote_id(), error = %e, "Toggle failed");
            }
        }
    }

    /// Closes every link. The manager may be reused afterwards.
    pub fn close_all(&self) {
        let links: Vec<_> = self.links.borrow_mut().drain().collect();
        for (_, link) in links {
            link.close();
        }
        self.early.borrow_mut().clear();
    }

    fn create_link(
        &self,
        remote: &UserId,
    ) -> Result<Rc<PeerLink>, NegotiationError> {
        let conn = self.factory.create(remote, &self.rtc_config).map_err(
            |source| NegotiationError::CreateConnection {
                remote: remote.clone(),
                source,
            },
        )?;
        let role = NegotiationRole::for_pair(&self.local_id, remote);
        debug!(%remote, ?role, "Creating peer link");

        Ok(PeerLink::new(
            remote.clone(),
            role,
            conn,
            Rc::clone(&self.signals),
            Rc::clone(&self.renderer),
        ))
    }

    async fn replay_early(&self, link: &Rc<PeerLink>) {
        let held = self.early.borrow_mut().remove(link.remote_id());
        for message in held.into_iter().flatten() {
            self.deliver(link, message).await;
        }
    }

    async fn deliver(&self, link: &PeerLink, message: SignalMessage) {
        let kind = message.kind();
        if let Err(e) = link.handle(PeerEvent::RemoteSignal(message)).await {
            warn!(
                remote = %link.remote_id(),
                kind,
                error = %e,
                "Failed to apply signal"
            );
        }
    }

    fn snapshot(&self) -> Vec<Rc<PeerLink>> {
        self.links.borrow().values().cloned().collect()
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
