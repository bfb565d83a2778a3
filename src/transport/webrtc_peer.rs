//! Transport backed by real `webrtc` peer connections.
//!
//! Both sessions live in this process, so host candidates are enough to
//! connect them; configured STUN/TURN servers are passed through unchanged.

use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::media::MediaHandle;
use crate::peer::types::{Candidate, ConnectionState, EndpointId, SdpKind, SessionDescriptor};
use crate::transport::{
    EventStream, SessionConfig, TransportChannel, TransportEvent, TransportProvider,
    TransportResult, TransportSession,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Provider that creates `RTCPeerConnection`s
#[derive(Debug, Default, Clone)]
pub struct WebRtcTransport;

impl WebRtcTransport {
    pub fn new() -> Self {
        Self
    }
}

fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn connection_state(st: RTCPeerConnectionState) -> ConnectionState {
    match st {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn to_rtc(desc: &SessionDescriptor) -> TransportResult<RTCSessionDescription> {
    let sdp = desc.sdp.clone();
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
    };
    Ok(rtc)
}

fn decode_text(data: &Bytes) -> String {
    String::from_utf8_lossy(data).into_owned()
}

#[async_trait]
impl TransportProvider for WebRtcTransport {
    async fn create_session(
        &self,
        config: SessionConfig,
    ) -> TransportResult<(Arc<dyn TransportSession>, EventStream)> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&config.ice_servers)).await?);
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = config.endpoint;

        let events = tx.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(c) = cand else {
                    debug!(%endpoint, "ICE candidate gathering completed");
                    let _ = events.send(TransportEvent::GatheringComplete);
                    return;
                };
                match c.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::CandidateDiscovered(Candidate {
                            owner: endpoint,
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!(%endpoint, "Unable to serialize ICE candidate: {}", e),
                }
            })
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            debug!(%endpoint, "ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        let events = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            let _ = events.send(TransportEvent::ConnectionStateChanged(connection_state(st)));
            Box::pin(async {})
        }));

        let events = tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = events.clone();
            Box::pin(async move {
                info!(%endpoint, label = %dc.label(), "Peer opened data channel");
                let channel = WebRtcChannel::attach(dc, events.clone());
                let _ = events.send(TransportEvent::DataChannelOpenedByPeer(channel));
            })
        }));

        let events = tx.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                Box::pin(async move {
                    let kind = track.kind();
                    let _ = events.send(TransportEvent::RemoteStreamAvailable(MediaHandle {
                        id: track.stream_id(),
                        label: track.id(),
                        video: kind == RTPCodecType::Video,
                        audio: kind == RTPCodecType::Audio,
                    }));
                })
            },
        ));

        let session = Arc::new(WebRtcSession {
            endpoint,
            session_id: config.session_id,
            pc,
            events: tx,
            channels: Mutex::new(Vec::new()),
        });
        let session: Arc<dyn TransportSession> = session;
        Ok((session, rx))
    }
}

pub struct WebRtcSession {
    endpoint: EndpointId,
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    events: EventSender,
    channels: Mutex<Vec<Arc<RTCDataChannel>>>,
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn create_offer(&self) -> TransportResult<SessionDescriptor> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescriptor::offer(offer.sdp, self.session_id.clone()))
    }

    async fn create_answer(&self) -> TransportResult<SessionDescriptor> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescriptor::answer(answer.sdp, self.session_id.clone()))
    }

    async fn set_local_description(&self, desc: &SessionDescriptor) -> TransportResult<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescriptor) -> TransportResult<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: &Candidate) -> TransportResult<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn attach_media(&self, media: &MediaHandle) -> TransportResult<()> {
        if !media.video {
            return Err(TransportError::Rejected(
                "only video streams can be attached".into(),
            ));
        }
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            format!("video-{}", media.id),
            media.id.clone(),
        ));
        self.pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        debug!(endpoint = %self.endpoint, media_id = %media.id, "Added local video track");
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> TransportResult<Arc<dyn TransportChannel>> {
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await?;
        self.channels.lock().push(dc.clone());
        Ok(WebRtcChannel::attach(dc, self.events.clone()))
    }

    async fn close(&self) -> TransportResult<()> {
        let channels = std::mem::take(&mut *self.channels.lock());
        for dc in channels {
            if let Err(e) = dc.close().await {
                debug!(endpoint = %self.endpoint, "Data channel close failed: {}", e);
            }
        }
        self.pc.close().await?;
        Ok(())
    }
}

pub struct WebRtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

impl WebRtcChannel {
    /// Wires the channel's callbacks into the session event feed
    fn attach(dc: Arc<RTCDataChannel>, events: EventSender) -> Arc<dyn TransportChannel> {
        let label = dc.label().to_owned();

        let (tx, l) = (events.clone(), label.clone());
        dc.on_open(Box::new(move || {
            let _ = tx.send(TransportEvent::ChannelOpen { label: l });
            Box::pin(async {})
        }));

        let (tx, l) = (events.clone(), label.clone());
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = tx.send(TransportEvent::ChannelMessage {
                label: l.clone(),
                data: decode_text(&msg.data),
            });
            Box::pin(async {})
        }));

        let (tx, l) = (events, label.clone());
        dc.on_close(Box::new(move || {
            let _ = tx.send(TransportEvent::ChannelClosed { label: l.clone() });
            Box::pin(async {})
        }));

        Arc::new(WebRtcChannel { label, dc })
    }
}

#[async_trait]
impl TransportChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> TransportResult<()> {
        self.dc.send_text(text.to_owned()).await?;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.dc.close().await?;
        Ok(())
    }
}
