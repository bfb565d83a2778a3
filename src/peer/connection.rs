use crate::error::{Error, Result, TransportError};
use crate::logger::dump_descriptor;
use crate::media::MediaHandle;
use crate::peer::sdx::{self, Side};
use crate::peer::state::EndpointState;
use crate::peer::types::{
    Candidate, EndpointId, SessionDescriptor, SessionPhase, Transition,
};
use crate::transport::{TransportChannel, TransportSession};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// What happened to a candidate handed to [`Endpoint::ingest_candidate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Submitted to the transport
    Applied,
    /// Held until the remote description is set
    Queued,
    /// The transport refused it; not fatal
    Rejected,
}

/// State machine for one side of the call.
///
/// Operations on one endpoint run strictly one after another in submission
/// order (`op_lock` is a fair mutex). `close` does not wait in that queue.
/// An operation still inside the transport when `close` runs sees the
/// `closed` phase when it resumes and returns [`Error::SessionClosed`]
/// without touching state.
pub struct Endpoint {
    id: EndpointId,
    session_id: String,
    session: Arc<dyn TransportSession>,
    state: Mutex<EndpointState>,
    op_lock: tokio::sync::Mutex<()>,
    phase_tx: watch::Sender<SessionPhase>,
    counterpart: OnceLock<Weak<Endpoint>>,
    failure: Mutex<Option<Error>>,
}

impl Endpoint {
    pub fn new(
        id: EndpointId,
        session_id: String,
        session: Arc<dyn TransportSession>,
    ) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(SessionPhase::New);
        Arc::new(Self {
            id,
            session_id,
            session,
            state: Mutex::new(EndpointState::default()),
            op_lock: tokio::sync::Mutex::new(()),
            phase_tx,
            counterpart: OnceLock::new(),
            failure: Mutex::new(None),
        })
    }

    /// Associates two endpoints with each other. Only the first link sticks.
    pub fn link(a: &Arc<Endpoint>, b: &Arc<Endpoint>) {
        let _ = a.counterpart.set(Arc::downgrade(b));
        let _ = b.counterpart.set(Arc::downgrade(a));
    }

    pub fn counterpart(&self) -> Option<Arc<Endpoint>> {
        self.counterpart.get().and_then(Weak::upgrade)
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    /// Copy of the current negotiation state
    pub fn snapshot(&self) -> EndpointState {
        self.state.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    /// Negotiation error that closed this endpoint, if it failed itself
    pub fn failure(&self) -> Option<Error> {
        self.failure.lock().clone()
    }

    /// `new -> offering`; returns the offer without applying it
    #[instrument(skip(self), fields(endpoint = %self.id))]
    pub async fn create_offer(&self) -> Result<SessionDescriptor> {
        let _op = self.op_lock.lock().await;

        let checked = sdx::check_create_offer(self.id, &self.state.lock());
        if let Err(e) = checked {
            return Err(self.reject(Transition::CreateOffer, e).await);
        }

        debug!("createOffer start");
        let result = self.session.create_offer().await;
        let offer = self.settle(Transition::CreateOffer, result).await?;
        self.set_phase(SessionPhase::Offering);
        dump_descriptor(self.id, &offer);
        Ok(offer)
    }

    /// Produces an answer to the remote offer; phase stays `answering`
    /// until the answer is applied locally
    #[instrument(skip(self), fields(endpoint = %self.id))]
    pub async fn create_answer(&self) -> Result<SessionDescriptor> {
        let _op = self.op_lock.lock().await;

        let checked = sdx::check_create_answer(self.id, &self.state.lock());
        if let Err(e) = checked {
            return Err(self.reject(Transition::CreateAnswer, e).await);
        }

        debug!("createAnswer start");
        let result = self.session.create_answer().await;
        let answer = self.settle(Transition::CreateAnswer, result).await?;
        dump_descriptor(self.id, &answer);
        Ok(answer)
    }

    /// setLocalDescription
    #[instrument(skip(self, desc), fields(endpoint = %self.id, kind = %desc.kind))]
    pub async fn apply_local(&self, desc: SessionDescriptor) -> Result<()> {
        let _op = self.op_lock.lock().await;

        let next = self.validate(Side::Local, &desc)?;
        let result = self.session.set_local_description(&desc).await;
        self.settle(Transition::SetLocalDescription, result).await?;

        self.state.lock().local_description = Some(desc);
        self.set_phase(next);
        info!("setLocalDescription complete");
        Ok(())
    }

    /// setRemoteDescription, then replays candidates that arrived early
    #[instrument(skip(self, desc), fields(endpoint = %self.id, kind = %desc.kind))]
    pub async fn apply_remote(&self, desc: SessionDescriptor) -> Result<()> {
        let _op = self.op_lock.lock().await;

        let next = self.validate(Side::Remote, &desc)?;
        let result = self.session.set_remote_description(&desc).await;
        self.settle(Transition::SetRemoteDescription, result).await?;

        let pending = {
            let mut state = self.state.lock();
            state.remote_description = Some(desc);
            state.pending_candidates.drain(..).collect::<Vec<_>>()
        };
        self.set_phase(next);
        info!("setRemoteDescription complete");

        if !pending.is_empty() {
            debug!(count = pending.len(), "Applying pending candidates");
        }
        for candidate in pending {
            if self.is_closed() {
                break;
            }
            if let Err(e) = self.session.add_candidate(&candidate).await {
                warn!("Failed to apply pending candidate {}: {}", candidate.candidate, e);
            }
        }
        Ok(())
    }

    /// Accepts a candidate discovered by the counterpart.
    ///
    /// Queues it while no remote description is set unless the transport
    /// takes early candidates. Fails softly with [`Error::StaleCandidate`]
    /// once this endpoint is closed.
    pub async fn ingest_candidate(&self, candidate: Candidate) -> Result<Ingest> {
        let _op = self.op_lock.lock().await;

        {
            let mut state = self.state.lock();
            if state.is_closed() {
                return Err(Error::StaleCandidate { endpoint: self.id });
            }
            if !state.accepts_candidates() && !self.session.supports_early_candidates() {
                debug!(endpoint = %self.id, "Remote description not set yet, queuing candidate");
                state.pending_candidates.push_back(candidate);
                return Ok(Ingest::Queued);
            }
        }

        match self.session.add_candidate(&candidate).await {
            Ok(()) => {
                debug!(endpoint = %self.id, "addIceCandidate success");
                Ok(Ingest::Applied)
            }
            Err(_) if self.is_closed() => Err(Error::StaleCandidate { endpoint: self.id }),
            Err(e) => {
                warn!(endpoint = %self.id, "Failed to add ICE candidate: {}", e);
                Ok(Ingest::Rejected)
            }
        }
    }

    /// Adds the local stream to the session
    pub async fn attach_media(&self, media: &MediaHandle) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.is_closed() {
            return Err(Error::SessionClosed { endpoint: self.id });
        }
        let result = self.session.attach_media(media).await;
        self.settle(Transition::AttachMedia, result).await
    }

    /// Creates a data channel on this endpoint's session
    pub async fn create_channel(&self, label: &str) -> Result<Arc<dyn TransportChannel>> {
        let _op = self.op_lock.lock().await;
        if self.is_closed() {
            return Err(Error::SessionClosed { endpoint: self.id });
        }
        let result = self.session.create_data_channel(label).await;
        self.settle(Transition::OpenDataChannel, result).await
    }

    /// Moves to `closed` and shuts the session. Closing twice is a no-op.
    pub async fn close(&self) {
        let first = self.state.lock().close();
        if !first {
            return;
        }
        self.phase_tx.send_replace(SessionPhase::Closed);
        info!(endpoint = %self.id, "Endpoint closed");

        if let Err(e) = self.session.close().await {
            warn!(endpoint = %self.id, "Transport close failed: {}", e);
        }
    }

    /// Fail-together: closes this endpoint and its counterpart and returns
    /// the negotiation error describing why
    pub async fn fail(&self, transition: Transition, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        error!(endpoint = %self.id, %transition, "Negotiation failed: {}", reason);
        let err = Error::Negotiation {
            endpoint: self.id,
            transition,
            reason,
        };
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err.clone());
            }
        }
        self.close().await;
        if let Some(peer) = self.counterpart() {
            peer.close().await;
        }
        err
    }

    fn set_phase(&self, next: SessionPhase) {
        let prev = {
            let mut state = self.state.lock();
            let prev = state.phase;
            state.phase = next;
            prev
        };
        if prev != next {
            debug!(endpoint = %self.id, "Phase {} -> {}", prev, next);
            self.phase_tx.send_replace(next);
        }
    }

    fn validate(&self, side: Side, desc: &SessionDescriptor) -> Result<SessionPhase> {
        let phase = self.phase();
        sdx::next_phase(self.id, phase, side, desc.kind).inspect_err(|e| {
            if let Error::ProtocolSequence { .. } = e {
                error!(endpoint = %self.id, "{}", e);
            }
        })
    }

    /// Precondition failures on create: closed stays benign, anything else
    /// takes both endpoints down
    async fn reject(&self, transition: Transition, e: Error) -> Error {
        match e {
            Error::Negotiation { reason, .. } => self.fail(transition, reason).await,
            other => other,
        }
    }

    /// Converts a provider completion into the crate taxonomy
    async fn settle<T>(
        &self,
        transition: Transition,
        result: std::result::Result<T, TransportError>,
    ) -> Result<T> {
        if self.is_closed() {
            debug!(endpoint = %self.id, %transition, "Discarding completion for closed endpoint");
            return Err(Error::SessionClosed { endpoint: self.id });
        }
        match result {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(transition, e.to_string()).await),
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SdpKind;
    use crate::transport::memory::{FaultPoint, MemoryTransport};
    use crate::transport::{EventStream, SessionConfig, TransportProvider};

    type Pair = (Arc<Endpoint>, Arc<Endpoint>, EventStream, EventStream);

    async fn pair(transport: &MemoryTransport) -> Pair {
        let mut made = Vec::new();
        for id in [EndpointId::Local, EndpointId::Remote] {
            let (session, events) = transport
                .create_session(SessionConfig {
                    endpoint: id,
                    session_id: format!("{id}-test"),
                    ice_servers: Vec::new(),
                })
                .await
                .unwrap();
            made.push((Endpoint::new(id, format!("{id}-test"), session), events));
        }
        let (remote, remote_events) = made.pop().unwrap();
        let (local, local_events) = made.pop().unwrap();
        Endpoint::link(&local, &remote);
        (local, remote, local_events, remote_events)
    }

    #[tokio::test]
    async fn offer_answer_round_trip_connects_both() {
        let transport = MemoryTransport::new();
        let (local, remote, _le, _re) = pair(&transport).await;

        let offer = local.create_offer().await.unwrap();
        assert_eq!(local.phase(), SessionPhase::Offering);
        local.apply_local(offer.clone()).await.unwrap();
        assert_eq!(local.phase(), SessionPhase::Offered);

        remote.apply_remote(offer).await.unwrap();
        assert_eq!(remote.phase(), SessionPhase::Answering);
        let answer = remote.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        remote.apply_local(answer.clone()).await.unwrap();
        assert_eq!(remote.phase(), SessionPhase::Connected);

        local.apply_remote(answer).await.unwrap();
        assert_eq!(local.phase(), SessionPhase::Connected);
    }

    #[tokio::test]
    async fn inconsistent_remote_descriptor_leaves_phase_unchanged() {
        let transport = MemoryTransport::new();
        let (local, remote, _le, _re) = pair(&transport).await;

        let offer = local.create_offer().await.unwrap();
        local.apply_local(offer.clone()).await.unwrap();

        // an offer is not a valid reply to our own offer
        let err = local.apply_remote(offer.clone()).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolSequence { .. }));
        assert_eq!(local.phase(), SessionPhase::Offered);

        let bogus_answer = SessionDescriptor::answer("v=0".into(), "x".into());
        let err = remote.apply_remote(bogus_answer).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolSequence { .. }));
        assert_eq!(remote.phase(), SessionPhase::New);
    }

    #[tokio::test]
    async fn double_close_is_noop() {
        let transport = MemoryTransport::new();
        let (local, _remote, _le, _re) = pair(&transport).await;

        local.close().await;
        assert_eq!(local.phase(), SessionPhase::Closed);
        local.close().await;
        assert_eq!(local.phase(), SessionPhase::Closed);
        assert_eq!(transport.operations(EndpointId::Local), vec!["close"]);
    }

    #[tokio::test]
    async fn create_offer_twice_fails_together() {
        let transport = MemoryTransport::new();
        let (local, remote, _le, _re) = pair(&transport).await;

        let offer = local.create_offer().await.unwrap();
        local.apply_local(offer).await.unwrap();

        let err = local.create_offer().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Negotiation {
                endpoint: EndpointId::Local,
                transition: Transition::CreateOffer,
                ..
            }
        ));
        assert!(local.is_closed());
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn provider_rejection_closes_both_endpoints() {
        let transport = MemoryTransport::new();
        transport.fail_next(EndpointId::Remote, FaultPoint::CreateAnswer);
        let (local, remote, _le, _re) = pair(&transport).await;

        let offer = local.create_offer().await.unwrap();
        local.apply_local(offer.clone()).await.unwrap();
        remote.apply_remote(offer).await.unwrap();

        let err = remote.create_answer().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Negotiation {
                endpoint: EndpointId::Remote,
                transition: Transition::CreateAnswer,
                ..
            }
        ));
        assert_eq!(local.phase(), SessionPhase::Closed);
        assert_eq!(remote.phase(), SessionPhase::Closed);
    }

    #[tokio::test]
    async fn early_candidates_are_queued_then_replayed_in_order() {
        let transport = MemoryTransport::new();
        let (local, remote, _le, _re) = pair(&transport).await;

        let host = |line: &str| Candidate::new(EndpointId::Local, line);
        let first = host("candidate:a 1 udp 1 127.0.0.1 4000 typ host");
        let second = host("candidate:b 1 udp 1 127.0.0.1 4001 typ host");
        assert_eq!(remote.ingest_candidate(first.clone()).await.unwrap(), Ingest::Queued);
        assert_eq!(remote.ingest_candidate(second.clone()).await.unwrap(), Ingest::Queued);
        assert_eq!(remote.snapshot().pending_candidates.len(), 2);
        assert!(transport.added_candidates(EndpointId::Remote).is_empty());

        let offer = local.create_offer().await.unwrap();
        local.apply_local(offer.clone()).await.unwrap();
        remote.apply_remote(offer).await.unwrap();

        assert!(remote.snapshot().pending_candidates.is_empty());
        assert_eq!(transport.added_candidates(EndpointId::Remote), vec![first, second]);
    }

    #[tokio::test]
    async fn candidate_for_closed_endpoint_is_stale() {
        let transport = MemoryTransport::new();
        let (_local, remote, _le, _re) = pair(&transport).await;

        remote.close().await;
        let err = remote
            .ingest_candidate(Candidate::new(EndpointId::Local, "candidate:x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleCandidate { endpoint: EndpointId::Remote }));
    }

    #[tokio::test]
    async fn offer_completing_after_close_is_discarded() {
        let transport = MemoryTransport::new();
        let gate = transport.hold_offers();
        let (local, _remote, _le, _re) = pair(&transport).await;

        let pending = {
            let local = local.clone();
            tokio::spawn(async move { local.create_offer().await })
        };
        tokio::task::yield_now().await;

        local.close().await;
        gate.release();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::SessionClosed { .. })));
        assert_eq!(local.phase(), SessionPhase::Closed);
        assert!(local.snapshot().local_description.is_none());
    }
}
