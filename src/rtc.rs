//! Peer connection that streams one video track to the browser.

use crate::error::{Error, Result};
use crate::media::{MediaPipeline, MediaSettings, SampleSink};
use crate::signaling::{LinkState, Negotiator, SessionDescriptionMessage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

pub const CONTROL_CHANNEL: &str = "control";
const GREETING: &str = "hello from playhost";

/// Called for every locally discovered ICE candidate.
pub type CandidateHandler = Arc<dyn Fn(RTCIceCandidateInit) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RtcSettings {
    pub ice_servers: Vec<String>,
}

impl Default for RtcSettings {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
        }
    }
}

/// Outbound video track, detached from its connection on removal.
struct TrackSink {
    peer: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl SampleSink for TrackSink {
    async fn write_sample(&self, sample: &Sample) -> Result<()> {
        Ok(self.track.write_sample(sample).await?)
    }

    async fn remove(&self) -> Result<()> {
        Ok(self.peer.remove_track(&self.sender).await?)
    }
}

pub struct RealtimeConnection {
    peer: Arc<RTCPeerConnection>,
    pipeline: MediaPipeline,
    link: watch::Receiver<LinkState>,
    /// Remote candidates received before the offer.
    pending: Mutex<Vec<RTCIceCandidateInit>>,
    closed: AtomicBool,
}

impl RealtimeConnection {
    /// Create the peer connection and start streaming into its video track.
    pub async fn open(
        settings: &RtcSettings,
        media: &MediaSettings,
        on_candidate: CandidateHandler,
    ) -> Result<Self> {
        if settings.ice_servers.len() < 2 {
            warn!(servers = settings.ice_servers.len(), "fewer than two ICE servers configured");
        }

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: settings
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let peer = Arc::new(api.new_peer_connection(config).await?);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_owned(),
            "playhost".to_owned(),
        ));
        let sender = peer
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be read for interceptors like NACK to work.
        let rtcp = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });

        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let on_candidate = Arc::clone(&on_candidate);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => on_candidate(init),
                    Err(e) => warn!(err = %e, "failed to serialize local candidate"),
                }
            })
        }));

        let (link_tx, link) = watch::channel(LinkState::New);
        peer.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            info!(state = %s, "peer connection state changed");
            let next = match s {
                RTCPeerConnectionState::Connected => Some(LinkState::Connected),
                RTCPeerConnectionState::Failed => Some(LinkState::Failed),
                RTCPeerConnectionState::Closed => Some(LinkState::Closed),
                _ => None,
            };
            if let Some(next) = next {
                link_tx.send_replace(next);
            }
            Box::pin(async {})
        }));

        open_control_channel(&peer).await?;
        peer.on_data_channel(Box::new(|channel: Arc<RTCDataChannel>| {
            log_messages(&channel);
            Box::pin(async {})
        }));

        let sink = Arc::new(TrackSink {
            peer: Arc::clone(&peer),
            track,
            sender,
        });
        let source = media.frame_source()?;
        let pipeline = MediaPipeline::start(media, source, sink)?;

        info!("realtime connection opened");
        Ok(Self {
            peer,
            pipeline,
            link,
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

}

async fn open_control_channel(peer: &RTCPeerConnection) -> Result<()> {
    let channel = peer.create_data_channel(CONTROL_CHANNEL, None).await?;
    let weak = Arc::downgrade(&channel);
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            let Some(channel) = weak.upgrade() else {
                return;
            };
            info!(label = channel.label(), "data channel open");
            if let Err(e) = channel.send_text(GREETING.to_owned()).await {
                warn!(err = %e, "failed to greet on data channel");
            }
        })
    }));
    log_messages(&channel);
    Ok(())
}

fn log_messages(channel: &Arc<RTCDataChannel>) {
    let label = channel.label().to_owned();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        info!(label = %label, message = %String::from_utf8_lossy(&msg.data), "data channel message");
        Box::pin(async {})
    }));
}

#[async_trait]
impl Negotiator for RealtimeConnection {
    async fn handle_offer(&self, sdp: String) -> Result<SessionDescriptionMessage> {
        let offer = RTCSessionDescription::offer(sdp)?;
        {
            let mut pending = self.pending.lock().await;
            self.peer.set_remote_description(offer).await?;
            for candidate in pending.drain(..) {
                if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                    warn!(err = %e, "failed to apply queued candidate");
                }
            }
        }
        let answer = self.peer.create_answer(None).await?;
        self.peer.set_local_description(answer).await?;
        let local = self
            .peer
            .local_description()
            .await
            .ok_or_else(|| Error::Protocol("no local description after answering".into()))?;
        Ok(SessionDescriptionMessage {
            kind: local.sdp_type.to_string(),
            sdp: local.sdp,
        })
    }

    async fn handle_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if self.peer.remote_description().await.is_none() {
            debug!(queued = pending.len() + 1, "queueing candidate until the offer arrives");
            pending.push(candidate);
            return Ok(());
        }
        Ok(self.peer.add_ice_candidate(candidate).await?)
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pipeline.shutdown().await;
        if let Err(e) = self.peer.close().await {
            warn!(err = %e, "failed to close peer connection");
        }
        info!("realtime connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Resolution;
    use crate::media::{CaptureKind, EncoderCommand, Framing};
    use crate::signaling::{ChannelState, Message, Outbound, SignalingChannel};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use std::sync::Mutex;
    use std::time::Duration;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    fn test_media() -> MediaSettings {
        MediaSettings {
            encoder: EncoderCommand {
                program: "cat".into(),
                args: vec![],
                framing: Framing::Chunked(1024),
            },
            grace: Duration::from_millis(100),
            ..MediaSettings::new(Resolution { width: 8, height: 8 }, CaptureKind::TestPattern)
        }
    }

    async fn client() -> RTCPeerConnection {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        api.new_peer_connection(RTCConfiguration::default()).await.unwrap()
    }

    #[tokio::test]
    async fn answers_an_offer() {
        let candidates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&candidates);
        let settings = RtcSettings { ice_servers: vec![] };
        let server = RealtimeConnection::open(
            &settings,
            &test_media(),
            Arc::new(move |c: RTCIceCandidateInit| sink.lock().unwrap().push(c)),
        )
        .await
        .unwrap();

        let browser = client().await;
        browser
            .add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .unwrap();
        let offer = browser.create_offer(None).await.unwrap();
        browser.set_local_description(offer.clone()).await.unwrap();

        assert!(server.peer.remote_description().await.is_none());
        let answer = server.handle_offer(offer.sdp.clone()).await.unwrap();
        assert_eq!(answer.kind, "answer");
        assert!(answer.sdp.contains("VP8"));

        let remote = server.peer.remote_description().await.unwrap();
        assert_eq!(remote.sdp_type, RTCSdpType::Offer);
        let local = server.peer.local_description().await.unwrap();
        assert_eq!(local.sdp_type, RTCSdpType::Answer);

        browser
            .set_remote_description(RTCSessionDescription::answer(answer.sdp).unwrap())
            .await
            .unwrap();

        server.close().await;
        server.close().await;
        assert!(!server.pipeline.is_running());
        browser.close().await.unwrap();
    }

    fn host_candidate() -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn browser_offer(browser: &RTCPeerConnection) -> String {
        browser
            .add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .unwrap();
        let offer = browser.create_offer(None).await.unwrap();
        browser.set_local_description(offer.clone()).await.unwrap();
        offer.sdp
    }

    #[tokio::test]
    async fn candidates_before_the_offer_are_applied_with_it() {
        let server = RealtimeConnection::open(
            &RtcSettings { ice_servers: vec![] },
            &test_media(),
            Arc::new(|_: RTCIceCandidateInit| {}),
        )
        .await
        .unwrap();

        server.handle_candidate(host_candidate()).await.unwrap();
        assert_eq!(server.pending.lock().await.len(), 1);
        assert!(server.peer.remote_description().await.is_none());

        let browser = client().await;
        let answer = server.handle_offer(browser_offer(&browser).await).await.unwrap();
        assert_eq!(answer.kind, "answer");
        assert_eq!(server.pending.lock().await.len(), 0);

        server.handle_candidate(host_candidate()).await.unwrap();
        assert_eq!(server.pending.lock().await.len(), 0);

        server.close().await;
        browser.close().await.unwrap();
    }

    #[tokio::test]
    async fn signaling_survives_a_candidate_before_the_offer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let outbound = Outbound::new(tx, cancel.clone());
        let server = Arc::new(
            RealtimeConnection::open(
                &RtcSettings { ice_servers: vec![] },
                &test_media(),
                outbound.candidate_handler(),
            )
            .await
            .unwrap(),
        );

        let browser = client().await;
        let offer = browser_offer(&browser).await;
        let candidate = Message::Candidate(host_candidate().into()).to_json().unwrap();
        let offer = serde_json::json!({"__message_type__": 1, "sdp": offer, "type": "offer"}).to_string();

        let mut channel = SignalingChannel::new(server.clone(), outbound, cancel);
        let inbound = futures_util::stream::iter(vec![Ok::<_, Error>(candidate), Ok(offer)]);
        channel.run(inbound).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);

        let mut answered = false;
        while let Ok(text) = rx.try_recv() {
            if let Message::Description(answer) = Message::parse(&text).unwrap() {
                assert_eq!(answer.kind, "answer");
                answered = true;
            }
        }
        assert!(answered);
        assert_eq!(server.pending.lock().await.len(), 0);
        browser.close().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_offer_is_an_error() {
        let server = RealtimeConnection::open(
            &RtcSettings { ice_servers: vec![] },
            &test_media(),
            Arc::new(|_: RTCIceCandidateInit| {}),
        )
        .await
        .unwrap();
        assert!(server.handle_offer("not sdp".into()).await.is_err());
        server.close().await;
    }
}
