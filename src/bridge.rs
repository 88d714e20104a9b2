use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::codec::video_mime;
use crate::config::WebRtcConfig;
use crate::error::CoordinatorError;
use crate::socket;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);
const MAX_MISSED_HEALTH_CHECKS: u32 = 5;

/// Input event relayed from the browser's data channel to the sandbox.
/// The payload stays opaque to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: String,
}

/// Invoked with the base64-encoded JSON of every gathered local candidate.
pub type OnIceCandidate = Box<dyn Fn(String) + Send + Sync>;

/// Process-wide WebRTC machinery, built once at startup and cloned into
/// every session; all sessions observe the same ICE settings.
pub struct WebRtcRuntime {
    setting_engine: SettingEngine,
    disable_default_interceptors: bool,
    ice_servers: Vec<String>,
}

impl WebRtcRuntime {
    pub async fn from_config(conf: &WebRtcConfig) -> Result<Self> {
        let mut setting_engine = SettingEngine::default();

        if let Some(range) = &conf.udp_port_range {
            let ephemeral = EphemeralUDP::new(range.min, range.max)
                .context("invalid ICE ephemeral port range")?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        } else if let Some(port) = conf.single_udp_port {
            let udp_socket = socket::bind_udp_port(port)
                .await
                .context("bind ICE mux port")?;
            info!("multiplexing all ICE traffic on udp port {}", port);
            setting_engine
                .set_udp_network(UDPNetwork::Muxed(UDPMuxDefault::new(UDPMuxParams::new(
                    udp_socket,
                ))));
        }

        if let Some(ip) = &conf.nat_1to1_ip {
            setting_engine.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
        }

        Ok(Self {
            setting_engine,
            disable_default_interceptors: conf.disable_default_interceptors,
            ice_servers: conf.ice_servers.clone(),
        })
    }
}

/// Per-session face of the WebRTC library: owns the peer connection, the
/// outbound tracks, the input and health-check data channels, and the
/// terminal-event latch.
pub struct WebRtcBridge {
    id: String,
    pc: Arc<RTCPeerConnection>,
    video_rx: Arc<Mutex<Option<mpsc::Receiver<Packet>>>>,
    audio_rx: Arc<Mutex<Option<mpsc::Receiver<Packet>>>>,
    input_tx: mpsc::Sender<InputEvent>,
    input_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    health_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    /// Cancelled by StopClient; stops the health worker.
    closed: CancellationToken,
    /// Cancelled on the first terminal event; observed by the session.
    exit: CancellationToken,
    streaming: Arc<AtomicBool>,
}

impl WebRtcBridge {
    pub async fn new(
        id: String,
        runtime: &WebRtcRuntime,
        video_rx: mpsc::Receiver<Packet>,
        audio_rx: mpsc::Receiver<Packet>,
        input_tx: mpsc::Sender<InputEvent>,
    ) -> Result<Self, CoordinatorError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CoordinatorError::Signaling(e.to_string()))?;

        let mut registry = Registry::new();
        if !runtime.disable_default_interceptors {
            registry = register_default_interceptors(registry, &mut media_engine)
                .map_err(|e| CoordinatorError::Signaling(e.to_string()))?;
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(runtime.setting_engine.clone())
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: runtime.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| CoordinatorError::Signaling(e.to_string()))?,
        );

        Ok(Self {
            id,
            pc,
            video_rx: Arc::new(Mutex::new(Some(video_rx))),
            audio_rx: Arc::new(Mutex::new(Some(audio_rx))),
            input_tx,
            input_channel: Mutex::new(None),
            health_channel: Mutex::new(None),
            closed: CancellationToken::new(),
            exit: CancellationToken::new(),
            streaming: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The latch observed by the session's teardown supervisor. Every
    /// terminal path funnels into this token; cancelling it is idempotent.
    pub fn exit_token(&self) -> CancellationToken {
        self.exit.clone()
    }

    /// Publish tracks and data channels, wire the ICE handlers, and return
    /// the base64-encoded local offer.
    pub async fn start_client(
        &self,
        codec: &str,
        on_candidate: OnIceCandidate,
    ) -> Result<String, CoordinatorError> {
        info!("[{}] starting webrtc client", self.id);

        let video_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: video_mime(codec).to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "coordinator".to_owned(),
        ));
        self.publish_track(video_track.clone()).await?;

        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "coordinator".to_owned(),
        ));
        self.publish_track(audio_track.clone()).await?;

        self.add_input_channel().await?;
        self.add_health_check().await?;

        let id = self.id.clone();
        let exit = self.exit.clone();
        let streaming = self.streaming.clone();
        let video_rx = self.video_rx.clone();
        let audio_rx = self.audio_rx.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let id = id.clone();
                let exit = exit.clone();
                let streaming = streaming.clone();
                let video_rx = video_rx.clone();
                let audio_rx = audio_rx.clone();
                let video_track = video_track.clone();
                let audio_track = audio_track.clone();
                Box::pin(async move {
                    if state == RTCIceConnectionState::Connected
                        && !streaming.swap(true, Ordering::SeqCst)
                    {
                        info!("[{}] ICE connected, draining media queues", id);
                        if let Some(rx) = video_rx.lock().ok().and_then(|mut slot| slot.take()) {
                            spawn_drain(id.clone(), "video", rx, video_track);
                        }
                        if let Some(rx) = audio_rx.lock().ok().and_then(|mut slot| slot.take()) {
                            spawn_drain(id.clone(), "audio", rx, audio_track);
                        }
                    }

                    if matches!(
                        state,
                        RTCIceConnectionState::Failed
                            | RTCIceConnectionState::Closed
                            | RTCIceConnectionState::Disconnected
                    ) {
                        warn!("[{}] ICE reached terminal state {}", id, state);
                        exit.cancel();
                    }
                })
            }));

        let id = self.id.clone();
        let on_candidate = Arc::new(on_candidate);
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let id = id.clone();
            let on_candidate = on_candidate.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => match encode_payload(&init) {
                        Ok(encoded) => on_candidate(encoded),
                        Err(e) => warn!("[{}] failed to encode ICE candidate: {}", id, e),
                    },
                    Err(e) => warn!("[{}] failed to serialize ICE candidate: {}", id, e),
                }
            })
        }));

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CoordinatorError::Signaling(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| CoordinatorError::Signaling(e.to_string()))?;

        encode_payload(&offer)
    }

    async fn publish_track(
        &self,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Result<(), CoordinatorError> {
        let rtp_sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| CoordinatorError::Signaling(e.to_string()))?;

        // Drain inbound RTCP so the interceptors keep running.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
        });

        Ok(())
    }

    async fn add_input_channel(&self) -> Result<(), CoordinatorError> {
        let channel = self
            .pc
            .create_data_channel("app-input", None)
            .await
            .map_err(|e| CoordinatorError::Signaling(e.to_string()))?;

        let id = self.id.clone();
        let input_tx = self.input_tx.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let id = id.clone();
            let input_tx = input_tx.clone();
            Box::pin(async move {
                match serde_json::from_slice::<InputEvent>(&msg.data) {
                    Ok(event) => {
                        if input_tx.try_send(event).is_err() {
                            warn!("[{}] input queue full, dropping event", id);
                        }
                    }
                    Err(e) => warn!("[{}] dropping malformed input message: {}", id, e),
                }
            })
        }));

        if let Ok(mut slot) = self.input_channel.lock() {
            *slot = Some(channel);
        }
        Ok(())
    }

    async fn add_health_check(&self) -> Result<(), CoordinatorError> {
        let channel = self
            .pc
            .create_data_channel("health-check", None)
            .await
            .map_err(|e| CoordinatorError::Signaling(e.to_string()))?;

        let counter = Arc::new(HealthCounter::new());

        let on_message = counter.clone();
        channel.on_message(Box::new(move |_msg: DataChannelMessage| {
            on_message.reset();
            Box::pin(async {})
        }));

        let id = self.id.clone();
        let closed = self.closed.clone();
        let exit = self.exit.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(
                Instant::now() + HEALTH_CHECK_INTERVAL,
                HEALTH_CHECK_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = ticker.tick() => {
                        if counter.tick() {
                            warn!("[{}] health check expired", id);
                            exit.cancel();
                            break;
                        }
                    }
                }
            }
            debug!("[{}] health worker stopped", id);
        });

        if let Ok(mut slot) = self.health_channel.lock() {
            *slot = Some(channel);
        }
        Ok(())
    }

    /// Apply the peer's base64-encoded SDP answer.
    pub async fn set_remote_sdp(&self, data: &str) -> Result<(), CoordinatorError> {
        let answer: RTCSessionDescription = decode_payload(data)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| CoordinatorError::Signaling(e.to_string()))
    }

    /// Apply a base64-encoded remote ICE candidate.
    pub async fn add_candidate(&self, data: &str) -> Result<(), CoordinatorError> {
        let candidate: RTCIceCandidateInit = decode_payload(data)?;
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| CoordinatorError::Protocol(e.to_string()))
    }

    /// Close the data channels and the peer connection and stop the health
    /// worker. The drains run dry once the session closes the queues.
    pub async fn stop_client(&self) {
        if let Some(channel) = self.input_channel.lock().ok().and_then(|mut slot| slot.take()) {
            if let Err(e) = channel.close().await {
                debug!("[{}] input channel close: {}", self.id, e);
            }
        }
        if let Some(channel) = self.health_channel.lock().ok().and_then(|mut slot| slot.take()) {
            if let Err(e) = channel.close().await {
                debug!("[{}] health channel close: {}", self.id, e);
            }
        }
        if let Err(e) = self.pc.close().await {
            warn!("[{}] peer connection close: {}", self.id, e);
        }
        self.closed.cancel();
    }
}

/// Missed-tick counter behind the health-check worker: the peer pings, the
/// coordinator detects silence.
struct HealthCounter {
    missed: AtomicU32,
}

impl HealthCounter {
    fn new() -> Self {
        Self { missed: AtomicU32::new(0) }
    }

    fn reset(&self) {
        self.missed.store(0, Ordering::SeqCst);
    }

    /// Returns true when the allowed number of consecutive silent ticks is
    /// exhausted.
    fn tick(&self) -> bool {
        self.missed.fetch_add(1, Ordering::SeqCst) + 1 >= MAX_MISSED_HEALTH_CHECKS
    }
}

fn spawn_drain(
    id: String,
    lane: &'static str,
    mut rx: mpsc::Receiver<Packet>,
    track: Arc<TrackLocalStaticRTP>,
) {
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if let Err(e) = track.write_rtp(&packet).await {
                warn!("[{}] failed to write {} RTP: {}", id, lane, e);
            }
        }
        debug!("[{}] {} drain finished", id, lane);
    });
}

fn encode_payload<T: Serialize>(value: &T) -> Result<String, CoordinatorError> {
    let json = serde_json::to_vec(value).map_err(|e| CoordinatorError::Protocol(e.to_string()))?;
    Ok(BASE64.encode(json))
}

fn decode_payload<T: DeserializeOwned>(data: &str) -> Result<T, CoordinatorError> {
    let json = BASE64
        .decode(data)
        .map_err(|e| CoordinatorError::Protocol(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| CoordinatorError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRtcConfig;

    async fn bridge_under_test() -> (WebRtcBridge, mpsc::Sender<Packet>, mpsc::Receiver<InputEvent>) {
        let runtime = WebRtcRuntime::from_config(&WebRtcConfig::default())
            .await
            .unwrap();
        let (video_tx, video_rx) = mpsc::channel(100);
        let (_audio_tx, audio_rx) = mpsc::channel(100);
        let (input_tx, input_rx) = mpsc::channel(100);
        let bridge = WebRtcBridge::new("test-session".to_string(), &runtime, video_rx, audio_rx, input_tx)
            .await
            .unwrap();
        (bridge, video_tx, input_rx)
    }

    #[tokio::test]
    async fn test_start_client_returns_decodable_offer() {
        let (bridge, _video_tx, _input_rx) = bridge_under_test().await;

        let offer = bridge
            .start_client("vpx", Box::new(|_| {}))
            .await
            .unwrap();

        let decoded: RTCSessionDescription = decode_payload(&offer).unwrap();
        assert!(decoded.sdp.contains("m=video"));
        assert!(decoded.sdp.contains("m=audio"));
        assert!(decoded.sdp.contains("m=application"));
        assert!(!bridge.exit_token().is_cancelled());

        bridge.stop_client().await;
    }

    #[tokio::test]
    async fn test_h264_codec_is_negotiated() {
        let (bridge, _video_tx, _input_rx) = bridge_under_test().await;

        let offer = bridge
            .start_client("h264", Box::new(|_| {}))
            .await
            .unwrap();
        let decoded: RTCSessionDescription = decode_payload(&offer).unwrap();
        assert!(decoded.sdp.contains("H264"));

        bridge.stop_client().await;
    }

    #[tokio::test]
    async fn test_set_remote_sdp_rejects_garbage() {
        let (bridge, _video_tx, _input_rx) = bridge_under_test().await;
        let err = bridge.set_remote_sdp("not base64!").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Protocol(_)));
        bridge.stop_client().await;
    }

    #[tokio::test]
    async fn test_add_candidate_rejects_garbage() {
        let (bridge, _video_tx, _input_rx) = bridge_under_test().await;
        let encoded = BASE64.encode(b"{\"not\": \"a candidate\"");
        let err = bridge.add_candidate(&encoded).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Protocol(_)));
        bridge.stop_client().await;
    }

    #[test]
    fn test_health_counter_expires_after_five_silent_ticks() {
        let counter = HealthCounter::new();
        for _ in 0..4 {
            assert!(!counter.tick());
        }
        assert!(counter.tick());
    }

    #[test]
    fn test_health_counter_reset_restarts_the_window() {
        let counter = HealthCounter::new();
        for _ in 0..4 {
            assert!(!counter.tick());
        }
        counter.reset();
        for _ in 0..4 {
            assert!(!counter.tick());
        }
        assert!(counter.tick());
    }

    #[test]
    fn test_payload_round_trip() {
        let event = InputEvent { kind: "MOUSEMOVE".to_string(), data: "1,2".to_string() };
        let encoded = encode_payload(&event).unwrap();
        let decoded: InputEvent = decode_payload(&encoded).unwrap();
        assert_eq!(decoded, event);
    }
}
