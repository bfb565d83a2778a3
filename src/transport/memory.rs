//! In-process transport.
//!
//! Two sessions (one per [`EndpointId`]) are paired inside one
//! [`MemoryTransport`]. Descriptions are synthetic SDP, candidates are fake
//! host candidates emitted when a local description is set, and the pair
//! reports `Connected` once both sides hold both descriptions and have
//! accepted at least one candidate from the other. Faults and a gate on
//! offer creation let tests reproduce provider failures and slow completions.

use crate::error::TransportError;
use crate::media::MediaHandle;
use crate::peer::types::{Candidate, ConnectionState, EndpointId, SdpKind, SessionDescriptor};
use crate::transport::{
    EventStream, SessionConfig, TransportChannel, TransportEvent, TransportProvider,
    TransportResult, TransportSession,
};
use crate::utils::random_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

/// Provider operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    CreateSession,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddCandidate,
}

#[derive(Default)]
struct Shared {
    sessions: Mutex<HashMap<EndpointId, Arc<MemorySession>>>,
    faults: Mutex<Vec<(EndpointId, FaultPoint)>>,
    offer_gate: Mutex<Option<Arc<Semaphore>>>,
    connect_lock: Mutex<()>,
}

impl Shared {
    fn take_fault(&self, endpoint: EndpointId, point: FaultPoint) -> bool {
        let mut faults = self.faults.lock();
        match faults.iter().position(|f| *f == (endpoint, point)) {
            Some(i) => {
                faults.remove(i);
                true
            }
            None => false,
        }
    }

    fn session(&self, endpoint: EndpointId) -> Option<Arc<MemorySession>> {
        self.sessions.lock().get(&endpoint).cloned()
    }

    /// Brings the pair up once both sides are ready
    fn maybe_connect(&self) {
        let (Some(a), Some(b)) = (
            self.session(EndpointId::Local),
            self.session(EndpointId::Remote),
        ) else {
            return;
        };
        let _guard = self.connect_lock.lock();
        if !a.ready_to_connect() || !b.ready_to_connect() {
            return;
        }
        for (side, other) in [(&a, &b), (&b, &a)] {
            let mut inner = side.inner.lock();
            inner.connected = true;
            inner.peer = Arc::downgrade(other);
        }

        for (side, other) in [(&a, &b), (&b, &a)] {
            side.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));
            let (channels, media) = {
                let inner = side.inner.lock();
                let channels: Vec<_> = inner
                    .channels
                    .iter()
                    .filter(|c| c.local_origin)
                    .cloned()
                    .collect();
                (channels, inner.media.clone())
            };
            for channel in channels {
                announce_channel(side, other, &channel);
            }
            if let Some(media) = media {
                other.emit(TransportEvent::RemoteStreamAvailable(MediaHandle {
                    id: random_id(),
                    label: format!("remote {}", media.label),
                    video: media.video,
                    audio: media.audio,
                }));
            }
        }
    }
}

/// Opens `channel` (created on `side`) and its mirror on `other`
fn announce_channel(
    side: &Arc<MemorySession>,
    other: &Arc<MemorySession>,
    channel: &Arc<MemoryChannel>,
) {
    let mirror = Arc::new(MemoryChannel {
        label: channel.label.clone(),
        local_origin: false,
        open: AtomicBool::new(true),
        closed: AtomicBool::new(false),
        owner: Arc::downgrade(other),
        peer: Mutex::new(Arc::downgrade(side)),
    });
    other.inner.lock().channels.push(mirror.clone());
    *channel.peer.lock() = Arc::downgrade(other);
    channel.open.store(true, Ordering::SeqCst);

    other.emit(TransportEvent::DataChannelOpenedByPeer(mirror));
    side.emit(TransportEvent::ChannelOpen {
        label: channel.label.clone(),
    });
    other.emit(TransportEvent::ChannelOpen {
        label: channel.label.clone(),
    });
}

/// Handle released by [`MemoryTransport::hold_offers`]
pub struct OfferGate {
    semaphore: Arc<Semaphore>,
    shared: Arc<Shared>,
}

impl OfferGate {
    /// Lets every held and future offer complete
    pub fn release(&self) {
        *self.shared.offer_gate.lock() = None;
        self.semaphore.close();
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    candidates_per_gather: usize,
    early_candidates: bool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            candidates_per_gather: 2,
            early_candidates: false,
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of host candidates each session trickles after setLocalDescription
    pub fn with_candidates(mut self, count: usize) -> Self {
        self.candidates_per_gather = count;
        self
    }

    /// Accept candidates before the remote description is set
    pub fn with_early_candidates(mut self) -> Self {
        self.early_candidates = true;
        self
    }

    /// Makes the next `point` call on `endpoint`'s session fail
    pub fn fail_next(&self, endpoint: EndpointId, point: FaultPoint) {
        self.shared.faults.lock().push((endpoint, point));
    }

    /// Reports a transport-level `Failed` connection state on `endpoint`'s
    /// current session, as a lost ICE/DTLS path would
    pub fn fail_connection(&self, endpoint: EndpointId) -> bool {
        match self.shared.session(endpoint) {
            Some(session) => {
                debug!(%endpoint, "Memory session connection failed");
                session.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Failed));
                true
            }
            None => false,
        }
    }

    /// Holds every `create_offer` until the returned gate is released
    pub fn hold_offers(&self) -> OfferGate {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.shared.offer_gate.lock() = Some(semaphore.clone());
        OfferGate {
            semaphore,
            shared: self.shared.clone(),
        }
    }

    /// Provider calls made on the current session of `endpoint`
    pub fn operations(&self, endpoint: EndpointId) -> Vec<String> {
        self.with_session(endpoint, |inner| inner.operations.clone())
    }

    /// Candidates the session accepted via `add_candidate`, in order
    pub fn added_candidates(&self, endpoint: EndpointId) -> Vec<Candidate> {
        self.with_session(endpoint, |inner| inner.added.clone())
    }

    /// Candidates the session discovered, in order
    pub fn emitted_candidates(&self, endpoint: EndpointId) -> Vec<Candidate> {
        self.with_session(endpoint, |inner| inner.emitted.clone())
    }

    pub fn is_connected(&self, endpoint: EndpointId) -> bool {
        self.with_session(endpoint, |inner| inner.connected)
    }

    fn with_session<T: Default>(
        &self,
        endpoint: EndpointId,
        f: impl FnOnce(&SessionInner) -> T,
    ) -> T {
        let Some(session) = self.shared.session(endpoint) else {
            return T::default();
        };
        let inner = session.inner.lock();
        f(&inner)
    }
}

#[async_trait]
impl TransportProvider for MemoryTransport {
    async fn create_session(
        &self,
        config: SessionConfig,
    ) -> TransportResult<(Arc<dyn TransportSession>, EventStream)> {
        if self.shared.take_fault(config.endpoint, FaultPoint::CreateSession) {
            return Err(TransportError::Rejected("session creation refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new_cyclic(|me| MemorySession {
            me: me.clone(),
            endpoint: config.endpoint,
            session_id: config.session_id,
            candidates_per_gather: self.candidates_per_gather,
            early_candidates: self.early_candidates,
            events: tx,
            shared: Arc::downgrade(&self.shared),
            inner: Mutex::new(SessionInner::default()),
        });
        session.emit(TransportEvent::ConnectionStateChanged(ConnectionState::New));
        self.shared
            .sessions
            .lock()
            .insert(config.endpoint, session.clone());
        debug!(endpoint = %config.endpoint, "Memory session created");
        let session: Arc<dyn TransportSession> = session;
        Ok((session, rx))
    }
}

#[derive(Default)]
struct SessionInner {
    local: Option<SessionDescriptor>,
    remote: Option<SessionDescriptor>,
    media: Option<MediaHandle>,
    channels: Vec<Arc<MemoryChannel>>,
    /// Set once the pair connects
    peer: Weak<MemorySession>,
    added: Vec<Candidate>,
    emitted: Vec<Candidate>,
    operations: Vec<String>,
    offers: u32,
    connected: bool,
    closed: bool,
}

pub struct MemorySession {
    me: Weak<MemorySession>,
    endpoint: EndpointId,
    session_id: String,
    candidates_per_gather: usize,
    early_candidates: bool,
    events: mpsc::UnboundedSender<TransportEvent>,
    shared: Weak<Shared>,
    inner: Mutex<SessionInner>,
}

impl MemorySession {
    fn emit(&self, event: TransportEvent) {
        // receiver gone means nobody is listening any more
        let _ = self.events.send(event);
    }

    /// Records the call and fails if closed or a fault is armed
    fn enter(&self, op: &str, point: Option<FaultPoint>) -> TransportResult<()> {
        {
            let mut inner = self.inner.lock();
            inner.operations.push(op.to_string());
            if inner.closed {
                return Err(TransportError::Closed);
            }
        }
        if let (Some(point), Some(shared)) = (point, self.shared.upgrade()) {
            if shared.take_fault(self.endpoint, point) {
                return Err(TransportError::Rejected(format!("{op} refused")));
            }
        }
        Ok(())
    }

    fn ready_to_connect(&self) -> bool {
        let inner = self.inner.lock();
        !inner.closed
            && !inner.connected
            && inner.local.is_some()
            && inner.remote.is_some()
            && (self.candidates_per_gather == 0 || !inner.added.is_empty())
    }

    fn after_change(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.maybe_connect();
        }
    }

    fn render_sdp(&self, kind: SdpKind) -> String {
        let mut inner = self.inner.lock();
        inner.offers += 1;
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.session_id, inner.offers
        );
        match (kind, &inner.remote) {
            (SdpKind::Answer, Some(offer)) => {
                for line in offer.sdp.lines().filter(|l| l.starts_with("m=")) {
                    sdp.push_str(line);
                    sdp.push_str("\r\n");
                }
            }
            _ => {
                if inner.media.is_some() {
                    sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
                }
                if !inner.channels.is_empty() {
                    sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
                }
            }
        }
        sdp
    }

    fn gather(&self) {
        let base_port = match self.endpoint {
            EndpointId::Local => 50000,
            EndpointId::Remote => 60000,
        };
        for i in 0..self.candidates_per_gather {
            let candidate = Candidate {
                owner: self.endpoint,
                candidate: format!(
                    "candidate:{} 1 udp {} 127.0.0.1 {} typ host generation 0",
                    i + 1,
                    2130706431 - i,
                    base_port + i
                ),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            };
            self.inner.lock().emitted.push(candidate.clone());
            self.emit(TransportEvent::CandidateDiscovered(candidate));
        }
        self.emit(TransportEvent::GatheringComplete);
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    async fn create_offer(&self) -> TransportResult<SessionDescriptor> {
        let gate = match self.shared.upgrade() {
            Some(shared) => shared.offer_gate.lock().clone(),
            None => None,
        };
        self.inner.lock().operations.push("create_offer".into());
        if let Some(gate) = gate {
            // closed semaphore means the gate was released
            let _ = gate.acquire().await;
        }
        if self.inner.lock().closed {
            return Err(TransportError::Closed);
        }
        if let Some(shared) = self.shared.upgrade() {
            if shared.take_fault(self.endpoint, FaultPoint::CreateOffer) {
                return Err(TransportError::Rejected("create_offer refused".into()));
            }
        }
        Ok(SessionDescriptor::offer(
            self.render_sdp(SdpKind::Offer),
            self.session_id.clone(),
        ))
    }

    async fn create_answer(&self) -> TransportResult<SessionDescriptor> {
        self.enter("create_answer", Some(FaultPoint::CreateAnswer))?;
        let has_offer = matches!(&self.inner.lock().remote, Some(d) if d.kind == SdpKind::Offer);
        if !has_offer {
            return Err(TransportError::Rejected("no remote offer to answer".into()));
        }
        Ok(SessionDescriptor::answer(
            self.render_sdp(SdpKind::Answer),
            self.session_id.clone(),
        ))
    }

    async fn set_local_description(&self, desc: &SessionDescriptor) -> TransportResult<()> {
        self.enter(
            &format!("set_local_description({})", desc.kind),
            Some(FaultPoint::SetLocalDescription),
        )?;
        self.inner.lock().local = Some(desc.clone());
        self.gather();
        self.after_change();
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescriptor) -> TransportResult<()> {
        self.enter(
            &format!("set_remote_description({})", desc.kind),
            Some(FaultPoint::SetRemoteDescription),
        )?;
        self.inner.lock().remote = Some(desc.clone());
        self.after_change();
        Ok(())
    }

    async fn add_candidate(&self, candidate: &Candidate) -> TransportResult<()> {
        self.enter("add_candidate", Some(FaultPoint::AddCandidate))?;
        if candidate.owner != self.endpoint.counterpart() {
            return Err(TransportError::Rejected(
                "candidate was gathered by this session".into(),
            ));
        }
        {
            let mut inner = self.inner.lock();
            if inner.remote.is_none() && !self.early_candidates {
                return Err(TransportError::Rejected(
                    "remote description not set".into(),
                ));
            }
            inner.added.push(candidate.clone());
        }
        self.after_change();
        Ok(())
    }

    fn supports_early_candidates(&self) -> bool {
        self.early_candidates
    }

    async fn attach_media(&self, media: &MediaHandle) -> TransportResult<()> {
        self.enter("attach_media", None)?;
        self.inner.lock().media = Some(media.clone());
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> TransportResult<Arc<dyn TransportChannel>> {
        self.enter(&format!("create_data_channel({label})"), None)?;
        let channel = Arc::new(MemoryChannel {
            label: label.to_string(),
            local_origin: true,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            owner: self.me.clone(),
            peer: Mutex::new(Weak::new()),
        });
        let peer = {
            let mut inner = self.inner.lock();
            inner.channels.push(channel.clone());
            inner.peer.upgrade()
        };

        // channels created after connection open straight away
        if let (Some(me), Some(peer)) = (self.me.upgrade(), peer) {
            announce_channel(&me, &peer, &channel);
        }
        let channel: Arc<dyn TransportChannel> = channel;
        Ok(channel)
    }

    async fn close(&self) -> TransportResult<()> {
        let (channels, peer) = {
            let mut inner = self.inner.lock();
            inner.operations.push("close".into());
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            (std::mem::take(&mut inner.channels), inner.peer.upgrade())
        };

        for channel in &channels {
            if !channel.closed.swap(true, Ordering::SeqCst) {
                self.emit(TransportEvent::ChannelClosed {
                    label: channel.label.clone(),
                });
                if let (Some(peer), true) = (&peer, channel.open.load(Ordering::SeqCst)) {
                    peer.emit(TransportEvent::ChannelClosed {
                        label: channel.label.clone(),
                    });
                }
            }
        }
        self.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Closed));

        if let Some(peer) = peer {
            peer.emit(TransportEvent::ConnectionStateChanged(
                ConnectionState::Disconnected,
            ));
        }
        debug!(endpoint = %self.endpoint, "Memory session closed");
        Ok(())
    }
}

pub struct MemoryChannel {
    label: String,
    local_origin: bool,
    open: AtomicBool,
    closed: AtomicBool,
    owner: Weak<MemorySession>,
    peer: Mutex<Weak<MemorySession>>,
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("channel not open".into()));
        }
        let peer = self.peer.lock().upgrade().ok_or(TransportError::Closed)?;
        if peer.inner.lock().closed {
            return Err(TransportError::Closed);
        }
        peer.emit(TransportEvent::ChannelMessage {
            label: self.label.clone(),
            data: text.to_string(),
        });
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let peer = self.peer.lock().upgrade();
        for session in [self.owner.upgrade(), peer].into_iter().flatten() {
            session.emit(TransportEvent::ChannelClosed {
                label: self.label.clone(),
            });
        }
        Ok(())
    }
}
