//! Loopback orchestrator.
//!
//! Owns the two endpoints of one call and acts as their signaling channel:
//! the offer produced by Local is applied to Remote, the answer goes back,
//! and every candidate either side discovers is relayed to the other as it
//! arrives. One [`Orchestrator`] can run any number of calls one after
//! another (`start`, `hangup`, `start` again); there is no global state.

use crate::config::LoopbackConfig;
use crate::error::{Error, Result};
use crate::media::{DisplaySurface, MediaCaptureProvider, MediaHandle, SurfaceId};
use crate::peer::connection::Endpoint;
use crate::peer::data_channel::{ChannelMessage, DataChannel, DataChannelManager};
use crate::peer::ice::{CandidateRelay, RelayStats};
use crate::peer::types::{ConnectionState, EndpointId, ReadyState, SessionPhase, Transition};
use crate::transport::{EventStream, SessionConfig, TransportEvent, TransportProvider};
use crate::utils::random_id;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Which UI triggers are currently usable
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub start: bool,
    pub hangup: bool,
    pub send: bool,
}

impl Controls {
    const IDLE: Controls = Controls {
        start: true,
        hangup: false,
        send: false,
    };
    const STARTED: Controls = Controls {
        start: false,
        hangup: true,
        send: false,
    };
}

/// Pieces of the running call that event pumps and readers need
#[derive(Clone)]
struct CallView {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    send_channel: Arc<DataChannel>,
    relay: Arc<CandidateRelay>,
}

struct ActiveCall {
    view: CallView,
    media: MediaHandle,
    pumps: Vec<JoinHandle<()>>,
}

/// What `start` finds when it runs
enum CallSlot {
    Idle,
    Active(ActiveCall),
    /// Setup failed; `hangup` must acknowledge it before the next `start`
    Failed,
}

struct Shared {
    channels: DataChannelManager,
    display: Arc<dyn DisplaySurface>,
    controls: watch::Sender<Controls>,
    failure: Mutex<Option<Error>>,
    current: Mutex<Option<CallView>>,
}

impl Shared {
    fn update_controls(&self, f: impl FnOnce(&mut Controls)) {
        self.controls.send_modify(f);
    }

    /// Recomputes the send control from the Local send channel's state
    fn refresh_send(&self) {
        let open = self
            .current
            .lock()
            .as_ref()
            .is_some_and(|c| c.send_channel.ready_state() == ReadyState::Open);
        self.update_controls(|c| c.send = open);
    }

    /// Remembers the first fatal error of the call and locks out `start`
    fn record_failure(&self, e: Error) {
        error!("Call failed: {}", e);
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(e);
        }
        drop(failure);
        self.update_controls(|c| {
            c.start = false;
            c.hangup = true;
            c.send = false;
        });
    }
}

pub struct Orchestrator {
    config: LoopbackConfig,
    transport: Arc<dyn TransportProvider>,
    capture: Arc<dyn MediaCaptureProvider>,
    shared: Arc<Shared>,
    call: tokio::sync::Mutex<CallSlot>,
}

impl Orchestrator {
    pub fn new(
        config: LoopbackConfig,
        transport: Arc<dyn TransportProvider>,
        capture: Arc<dyn MediaCaptureProvider>,
        display: Arc<dyn DisplaySurface>,
    ) -> Self {
        let (controls, _) = watch::channel(Controls::IDLE);
        Self {
            config,
            transport,
            capture,
            shared: Arc::new(Shared {
                channels: DataChannelManager::new(),
                display,
                controls,
                failure: Mutex::new(None),
                current: Mutex::new(None),
            }),
            call: tokio::sync::Mutex::new(CallSlot::Idle),
        }
    }

    /// Acquires local media, creates both endpoints and kicks off negotiation.
    ///
    /// Returns once the offer has been requested; negotiation and candidate
    /// exchange continue in the background. After a failed setup, returns
    /// that failure again until `hangup` is called.
    pub async fn start(&self) -> Result<()> {
        let mut call = self.call.lock().await;
        match &*call {
            CallSlot::Idle => {}
            CallSlot::Active(_) => {
                warn!("start() ignored: call already running");
                return Err(Error::AlreadyStarted);
            }
            CallSlot::Failed => {
                warn!("start() ignored: previous call failed, hang up first");
                return Err(self.last_error().unwrap_or(Error::AlreadyStarted));
            }
        }

        info!("Requesting local stream");
        let media = match self.capture.acquire_local_media(&self.config.media).await {
            Ok(media) => media,
            Err(e) => {
                let e = Error::from(e);
                error!("{}", e);
                self.shared.update_controls(|c| *c = Controls::IDLE);
                return Err(e);
            }
        };
        info!(media_id = %media.id, "Received local stream");
        self.shared.display.attach_stream(SurfaceId::LocalVideo, &media);
        *self.shared.failure.lock() = None;

        match self.connect(media.clone()).await {
            Ok(active) => {
                *call = CallSlot::Active(active);
                Ok(())
            }
            Err(e) => {
                self.capture.release_media(&media).await;
                self.shared.display.clear(SurfaceId::LocalVideo);
                self.shared.channels.close_all();
                *self.shared.current.lock() = None;
                if e.is_fatal() {
                    self.shared.record_failure(e.clone());
                    *call = CallSlot::Failed;
                } else {
                    self.shared.update_controls(|c| *c = Controls::IDLE);
                }
                Err(e)
            }
        }
    }

    async fn connect(&self, media: MediaHandle) -> Result<ActiveCall> {
        let started_at = Instant::now();
        let session_id = random_id();
        info!(%session_id, "Starting call");

        let (local, local_events) = self.endpoint(EndpointId::Local, &session_id).await?;
        let (remote, remote_events) = match self.endpoint(EndpointId::Remote, &session_id).await {
            Ok(made) => made,
            Err(e) => {
                local.close().await;
                return Err(e);
            }
        };
        Endpoint::link(&local, &remote);

        let relay = Arc::new(CandidateRelay::new());
        // pumps start before any description is applied so no candidate is missed
        let pumps = vec![
            tokio::spawn(pump(
                self.shared.clone(),
                local.clone(),
                relay.clone(),
                local_events,
                started_at,
            )),
            tokio::spawn(pump(
                self.shared.clone(),
                remote.clone(),
                relay.clone(),
                remote_events,
                started_at,
            )),
        ];

        let prepared = async {
            local.attach_media(&media).await?;
            info!("Added local stream to local endpoint");
            self.shared
                .channels
                .open(&local, &self.config.data_channel_label)
                .await
        };
        let send_channel = match prepared.await {
            Ok(channel) => channel,
            Err(e) => {
                local.close().await;
                remote.close().await;
                for pump in &pumps {
                    pump.abort();
                }
                return Err(e);
            }
        };

        let view = CallView {
            local: local.clone(),
            remote: remote.clone(),
            send_channel,
            relay,
        };
        *self.shared.current.lock() = Some(view.clone());
        self.shared.update_controls(|c| *c = Controls::STARTED);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = negotiate(&local, &remote).await {
                if e.is_benign() {
                    debug!("Negotiation abandoned: {}", e);
                    return;
                }
                shared.record_failure(e);
                local.close().await;
                remote.close().await;
            }
        });

        Ok(ActiveCall { view, media, pumps })
    }

    async fn endpoint(
        &self,
        id: EndpointId,
        session_id: &str,
    ) -> Result<(Arc<Endpoint>, EventStream)> {
        let config = SessionConfig {
            endpoint: id,
            session_id: session_id.to_string(),
            ice_servers: self.config.ice_servers.clone(),
        };
        let (session, events) =
            self.transport
                .create_session(config)
                .await
                .map_err(|e| Error::Negotiation {
                    endpoint: id,
                    transition: Transition::CreateSession,
                    reason: e.to_string(),
                })?;
        info!(endpoint = %id, "Created peer connection object");
        Ok((Endpoint::new(id, session_id.to_string(), session), events))
    }

    /// Tears the call down. Safe while negotiation is still in flight;
    /// a no-op when nothing is running.
    pub async fn hangup(&self) {
        let mut call = self.call.lock().await;
        let active = match std::mem::replace(&mut *call, CallSlot::Idle) {
            CallSlot::Active(active) => active,
            CallSlot::Failed => {
                info!("Clearing failed call");
                self.shared.update_controls(|c| *c = Controls::IDLE);
                return;
            }
            CallSlot::Idle => {
                debug!("hangup() with no call running");
                self.shared.update_controls(|c| *c = Controls::IDLE);
                return;
            }
        };
        info!("Ending call");

        self.shared.channels.close_all();
        active.view.local.close().await;
        active.view.remote.close().await;
        for pump in &active.pumps {
            pump.abort();
        }
        *self.shared.current.lock() = None;

        self.capture.release_media(&active.media).await;
        self.shared.display.clear(SurfaceId::LocalVideo);
        self.shared.display.clear(SurfaceId::RemoteVideo);

        let stats = active.view.relay.stats();
        info!(
            applied = stats.applied,
            queued = stats.queued,
            rejected = stats.rejected,
            stale = stats.stale,
            dropped = stats.dropped,
            "Candidate relay totals"
        );
        self.shared.update_controls(|c| *c = Controls::IDLE);
    }

    /// Sends text on the Local send channel
    pub async fn send(&self, text: &str) -> Result<()> {
        let channel = self
            .shared
            .current
            .lock()
            .as_ref()
            .map(|c| c.send_channel.clone());
        match channel {
            Some(channel) => channel.send(text).await,
            None => Err(Error::ChannelNotOpen {
                label: self.config.data_channel_label.clone(),
                state: ReadyState::Closed,
            }),
        }
    }

    /// Resolves once both endpoints are `connected`.
    ///
    /// Fails with the recorded error if the call is torn down first, or with
    /// [`Error::Timeout`] when `timeout` elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let Some(view) = self.shared.current.lock().clone() else {
            return Err(Error::SessionClosed {
                endpoint: EndpointId::Local,
            });
        };

        let wait = async {
            for endpoint in [&view.local, &view.remote] {
                let mut phases = endpoint.subscribe();
                let reached = phases
                    .wait_for(|p| matches!(p, SessionPhase::Connected | SessionPhase::Closed))
                    .await
                    .map(|p| *p);
                if !matches!(reached, Ok(SessionPhase::Connected)) {
                    let cause = view
                        .local
                        .failure()
                        .or_else(|| view.remote.failure())
                        .or_else(|| self.last_error());
                    return Err(cause.unwrap_or(Error::SessionClosed {
                        endpoint: endpoint.id(),
                    }));
                }
            }
            Ok(())
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout("both endpoints to connect".into()))?
    }

    /// Current UI control state; updates arrive on the returned receiver
    pub fn controls(&self) -> watch::Receiver<Controls> {
        self.shared.controls.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.shared.current.lock().is_some()
    }

    /// Phase of one endpoint of the running call
    pub fn phase(&self, id: EndpointId) -> Option<SessionPhase> {
        self.endpoint_handle(id).map(|e| e.phase())
    }

    pub fn endpoint_handle(&self, id: EndpointId) -> Option<Arc<Endpoint>> {
        self.shared.current.lock().as_ref().map(|c| match id {
            EndpointId::Local => c.local.clone(),
            EndpointId::Remote => c.remote.clone(),
        })
    }

    /// Candidate relay counters of the running call
    pub fn relay_stats(&self) -> Option<RelayStats> {
        self.shared.current.lock().as_ref().map(|c| c.relay.stats())
    }

    /// The fatal error that ended the last call, if any
    pub fn last_error(&self) -> Option<Error> {
        self.shared.failure.lock().clone()
    }

    pub fn on_message(&self, callback: impl Fn(ChannelMessage) + Send + Sync + 'static) {
        self.shared.channels.on_message(callback);
    }

    pub fn on_state_change(
        &self,
        callback: impl Fn(EndpointId, &str, ReadyState) + Send + Sync + 'static,
    ) {
        self.shared.channels.on_state_change(callback);
    }
}

/// Offer from Local, answer from Remote, each applied on both sides
async fn negotiate(local: &Endpoint, remote: &Endpoint) -> Result<()> {
    let offer = local.create_offer().await?;
    local.apply_local(offer.clone()).await?;
    remote.apply_remote(offer).await?;

    let answer = remote.create_answer().await?;
    remote.apply_local(answer.clone()).await?;
    local.apply_remote(answer).await?;
    info!("Offer/answer exchange complete");
    Ok(())
}

/// Drains one endpoint's transport events in the order they were issued
async fn pump(
    shared: Arc<Shared>,
    endpoint: Arc<Endpoint>,
    relay: Arc<CandidateRelay>,
    mut events: EventStream,
    started_at: Instant,
) {
    let id = endpoint.id();
    let mut stream_seen = false;

    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::CandidateDiscovered(candidate) => {
                relay.on_candidate_discovered(&endpoint, candidate).await;
            }
            TransportEvent::GatheringComplete => {
                debug!(endpoint = %id, "Candidate gathering complete");
            }
            TransportEvent::ConnectionStateChanged(state) => {
                info!(endpoint = %id, "ICE state: {}", state);
                if state == ConnectionState::Failed && !endpoint.is_closed() {
                    let e = endpoint
                        .fail(Transition::Transport, "transport connection failed")
                        .await;
                    shared.record_failure(e);
                }
            }
            TransportEvent::RemoteStreamAvailable(media) => {
                if id != EndpointId::Remote {
                    debug!(endpoint = %id, media_id = %media.id, "Ignoring remote stream");
                    continue;
                }
                if !stream_seen {
                    stream_seen = true;
                    info!("Setup time: {} ms", started_at.elapsed().as_millis());
                }
                info!(media_id = %media.id, "Remote endpoint received remote stream");
                shared.display.attach_stream(SurfaceId::RemoteVideo, &media);
            }
            TransportEvent::DataChannelOpenedByPeer(channel) => {
                shared.channels.adopt(id, channel);
            }
            TransportEvent::ChannelOpen { label } => {
                shared.channels.handle_open(id, &label);
                shared.refresh_send();
            }
            TransportEvent::ChannelMessage { label, data } => {
                shared.channels.handle_message(id, &label, data);
            }
            TransportEvent::ChannelClosed { label } => {
                shared.channels.handle_closed(id, &label);
                shared.refresh_send();
            }
        }
    }
    debug!(endpoint = %id, "Event stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LogDisplay, SyntheticCapture};
    use crate::transport::memory::{FaultPoint, MemoryTransport};

    type Parts = (Orchestrator, Arc<SyntheticCapture>, Arc<LogDisplay>);

    fn orchestrator(transport: &MemoryTransport) -> Parts {
        let capture = Arc::new(SyntheticCapture::new());
        let display = Arc::new(LogDisplay::new());
        let orch = Orchestrator::new(
            LoopbackConfig::default(),
            Arc::new(transport.clone()),
            capture.clone(),
            display.clone(),
        );
        (orch, capture, display)
    }

    #[tokio::test]
    async fn controls_follow_lifecycle() {
        let transport = MemoryTransport::new();
        let (orch, _capture, _display) = orchestrator(&transport);
        let mut controls = orch.controls();
        assert_eq!(*controls.borrow(), Controls::IDLE);

        orch.start().await.unwrap();
        assert!(controls.borrow_and_update().hangup);

        controls.wait_for(|c| c.send).await.unwrap();
        orch.hangup().await;
        assert_eq!(*orch.controls().borrow(), Controls::IDLE);
    }

    #[tokio::test]
    async fn media_failure_keeps_start_enabled() {
        let transport = MemoryTransport::new();
        let (orch, capture, _display) = orchestrator(&transport);
        capture.set_failure(Some("camera busy"));

        let err = orch.start().await.unwrap_err();
        assert!(matches!(err, Error::MediaAcquisition(_)));
        assert!(err.is_retryable());
        assert!(orch.controls().borrow().start);
        assert!(!orch.is_started());

        capture.set_failure(None);
        orch.start().await.unwrap();
        orch.hangup().await;
    }

    #[tokio::test]
    async fn surfaces_follow_the_call() {
        let transport = MemoryTransport::new();
        let (orch, capture, display) = orchestrator(&transport);

        orch.start().await.unwrap();
        orch.wait_connected(Duration::from_secs(5)).await.unwrap();
        assert!(display.showing(SurfaceId::LocalVideo).is_some());

        tokio::time::timeout(Duration::from_secs(5), async {
            while display.showing(SurfaceId::RemoteVideo).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        orch.hangup().await;
        assert!(display.showing(SurfaceId::LocalVideo).is_none());
        assert!(display.showing(SurfaceId::RemoteVideo).is_none());
        assert_eq!(capture.active_handles(), 0);
    }

    #[tokio::test]
    async fn session_creation_failure_releases_media() {
        let transport = MemoryTransport::new();
        transport.fail_next(EndpointId::Remote, FaultPoint::CreateSession);
        let (orch, capture, _display) = orchestrator(&transport);

        let err = orch.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Negotiation {
                transition: Transition::CreateSession,
                ..
            }
        ));
        assert_eq!(capture.active_handles(), 0);
        assert!(!orch.controls().borrow().start);

        // start stays locked out until the failure is acknowledged
        let again = orch.start().await.unwrap_err();
        assert!(matches!(
            again,
            Error::Negotiation {
                transition: Transition::CreateSession,
                ..
            }
        ));
        assert_eq!(capture.acquired_total(), 1);

        orch.hangup().await;
        assert!(orch.controls().borrow().start);
        orch.start().await.unwrap();
        orch.hangup().await;
    }
}
