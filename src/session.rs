use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bridge::{OnIceCandidate, WebRtcBridge, WebRtcRuntime};
use crate::catalog::AppCatalog;
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::relay::StreamRelayer;
use crate::sandbox::SandboxControl;
use crate::signaling::{MessageKind, SignalMessage, SignalingConnection};
use crate::socket;

/// Capacity of the per-session video, audio and input queues.
pub const STREAM_QUEUE_CAPACITY: usize = 100;

/// Shared dependencies handed to every connection.
pub struct AppState {
    pub config: CoordinatorConfig,
    pub webrtc: WebRtcRuntime,
    pub catalog: AppCatalog,
    pub sandbox: Arc<dyn SandboxControl>,
}

/// One client's end-to-end connection, from START to its first terminal
/// event. Holds every resource teardown must release.
pub struct Session {
    id: String,
    video_port: u16,
    audio_port: u16,
    input_port: u16,
    bridge: Arc<WebRtcBridge>,
    relayer: Arc<StreamRelayer>,
    sandbox: Arc<dyn SandboxControl>,
    torn_down: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("video_port", &self.video_port)
            .field("audio_port", &self.audio_port)
            .field("input_port", &self.input_port)
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ports(&self) -> (u16, u16, u16) {
        (self.video_port, self.audio_port, self.input_port)
    }

    /// Release everything the session acquired. Runs at most once no matter
    /// how many planes fail. Order matters: the sandbox stops emitting
    /// first, the bridge stops feeding the input queue, then the relayer
    /// drops its sockets and senders, which closes the queues and lets the
    /// drains run dry.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] releasing session resources", self.id);

        if let Err(e) = self.sandbox.stop(&self.id).await {
            error!("[{}] failed to stop sandbox: {}", self.id, e);
        }

        self.bridge.stop_client().await;
        self.relayer.close().await;

        // Wake the exit supervisor in case teardown came from elsewhere.
        self.bridge.exit_token().cancel();

        info!("[{}] session torn down", self.id);
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_signaling(socket, state))
}

async fn handle_signaling(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4().to_string();
    let conn = Arc::new(SignalingConnection::new(socket));
    info!("[{}] signaling connected", session_id);

    let mut session: Option<Arc<Session>> = None;

    loop {
        let raw = match conn.read_text().await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                warn!("[{}] signaling read failed: {}", session_id, e);
                break;
            }
        };

        let msg: SignalMessage = match serde_json::from_str(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[{}] dropping malformed signaling frame: {}", session_id, e);
                continue;
            }
        };

        match msg.kind {
            MessageKind::Start => {
                if session.is_some() {
                    warn!("[{}] ignoring duplicate START", session_id);
                    continue;
                }
                let on_candidate = candidate_forwarder(session_id.clone(), conn.clone());
                match start_session(&session_id, &state, on_candidate).await {
                    Ok((started, offer)) => {
                        let reply = SignalMessage { kind: MessageKind::Sdp, data: offer };
                        if let Err(e) = conn.send(&reply).await {
                            error!("[{}] failed to send offer: {}", session_id, e);
                            started.teardown().await;
                            break;
                        }
                        session = Some(started);
                    }
                    Err(e) => error!("[{}] failed to start session: {}", session_id, e),
                }
            }
            MessageKind::Sdp => {
                let Some(session) = session.as_ref() else { continue };
                if let Err(e) = session.bridge.set_remote_sdp(&msg.data).await {
                    warn!("[{}] dropping remote SDP: {}", session_id, e);
                }
            }
            MessageKind::Ice => {
                let Some(session) = session.as_ref() else { continue };
                if let Err(e) = session.bridge.add_candidate(&msg.data).await {
                    warn!("[{}] dropping remote ICE candidate: {}", session_id, e);
                }
            }
            MessageKind::Unknown => {}
        }
    }

    // The signaling channel is this session's lifeline; its end is terminal.
    if let Some(session) = session {
        session.teardown().await;
    }
    info!("[{}] signaling disconnected", session_id);
}

/// Forward gathered local candidates to the peer as ICE frames, preserving
/// the order the library emitted them.
fn candidate_forwarder(session_id: String, conn: Arc<SignalingConnection>) -> OnIceCandidate {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(candidate) = rx.recv().await {
            let msg = SignalMessage { kind: MessageKind::Ice, data: candidate };
            if let Err(e) = conn.send(&msg).await {
                warn!("[{}] failed to send ICE candidate: {}", session_id, e);
            }
        }
    });
    Box::new(move |candidate| {
        let _ = tx.send(candidate);
    })
}

/// Provision a session: sockets, queues, relayer, sandbox, bridge, offer.
/// On failure everything acquired so far is released; in particular the
/// sandbox is stopped iff its launch succeeded.
async fn start_session(
    id: &str,
    state: &Arc<AppState>,
    on_candidate: OnIceCandidate,
) -> Result<(Arc<Session>, String), CoordinatorError> {
    let (video_socket, video_port) = socket::bind_udp().await?;
    let (audio_socket, audio_port) = socket::bind_udp().await?;
    let (input_listener, input_port) = socket::bind_tcp().await?;

    info!("[{}] waiting for video at udp port {}", id, video_port);
    info!("[{}] waiting for audio at udp port {}", id, audio_port);
    info!("[{}] waiting for input at tcp port {}", id, input_port);

    let (video_tx, video_rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
    let (audio_tx, audio_rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
    let (input_tx, input_rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);

    let relayer = Arc::new(StreamRelayer::new(
        id.to_string(),
        video_socket,
        audio_socket,
        input_listener,
        video_tx,
        audio_tx,
        input_rx,
        state.config.screen.width,
        state.config.screen.height,
    ));
    relayer.start();

    if let Err(e) = state.sandbox.start(id, video_port, audio_port, input_port).await {
        relayer.close().await;
        return Err(e);
    }

    let bridge = match WebRtcBridge::new(
        id.to_string(),
        &state.webrtc,
        video_rx,
        audio_rx,
        input_tx,
    )
    .await
    {
        Ok(bridge) => Arc::new(bridge),
        Err(e) => {
            stop_sandbox_best_effort(id, state).await;
            relayer.close().await;
            return Err(e);
        }
    };

    let offer = match bridge.start_client(&state.config.video_codec, on_candidate).await {
        Ok(offer) => offer,
        Err(e) => {
            stop_sandbox_best_effort(id, state).await;
            bridge.stop_client().await;
            relayer.close().await;
            return Err(e);
        }
    };

    let session = Arc::new(Session {
        id: id.to_string(),
        video_port,
        audio_port,
        input_port,
        bridge: bridge.clone(),
        relayer,
        sandbox: state.sandbox.clone(),
        torn_down: AtomicBool::new(false),
    });

    // First terminal event, whichever plane it comes from, tears down.
    let exit = bridge.exit_token();
    let supervised = session.clone();
    tokio::spawn(async move {
        exit.cancelled().await;
        supervised.teardown().await;
    });

    Ok((session, offer))
}

async fn stop_sandbox_best_effort(id: &str, state: &Arc<AppState>) {
    if let Err(e) = state.sandbox.stop(id).await {
        error!("[{}] failed to stop sandbox during unwind: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSandbox {
        starts: Mutex<Vec<(String, u16, u16, u16)>>,
        stops: Mutex<Vec<String>>,
        fail_start: bool,
    }

    #[async_trait]
    impl SandboxControl for RecordingSandbox {
        async fn start(
            &self,
            session_id: &str,
            video_port: u16,
            audio_port: u16,
            input_port: u16,
        ) -> Result<(), CoordinatorError> {
            if self.fail_start {
                return Err(CoordinatorError::SandboxLaunch(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "boom",
                )));
            }
            self.starts.lock().unwrap().push((
                session_id.to_string(),
                video_port,
                audio_port,
                input_port,
            ));
            Ok(())
        }

        async fn stop(&self, session_id: &str) -> Result<(), CoordinatorError> {
            self.stops.lock().unwrap().push(session_id.to_string());
            Ok(())
        }
    }

    async fn state_with(sandbox: Arc<RecordingSandbox>) -> Arc<AppState> {
        let config = CoordinatorConfig::default();
        let webrtc = WebRtcRuntime::from_config(&config.webrtc).await.unwrap();
        Arc::new(AppState {
            config,
            webrtc,
            catalog: AppCatalog::default(),
            sandbox,
        })
    }

    #[tokio::test]
    async fn test_happy_start_allocates_and_launches() {
        let sandbox = Arc::new(RecordingSandbox::default());
        let state = state_with(sandbox.clone()).await;

        let (session, offer) = start_session("s1", &state, Box::new(|_| {}))
            .await
            .unwrap();

        assert!(!offer.is_empty());
        let starts = sandbox.starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 1);
        let (started_id, video, audio, input) = starts[0].clone();
        assert_eq!(started_id, "s1");
        assert_eq!(session.ports(), (video, audio, input));
        assert_ne!(video, audio);
        // No terminal event yet.
        assert!(sandbox.stops.lock().unwrap().is_empty());

        session.teardown().await;
        let stops = sandbox.stops.lock().unwrap().clone();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0], "s1");
    }

    #[tokio::test]
    async fn test_failed_launch_does_not_stop_sandbox() {
        let sandbox = Arc::new(RecordingSandbox { fail_start: true, ..Default::default() });
        let state = state_with(sandbox.clone()).await;

        let err = start_session("s2", &state, Box::new(|_| {})).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::SandboxLaunch(_)));
        assert!(sandbox.stops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_runs_exactly_once() {
        let sandbox = Arc::new(RecordingSandbox::default());
        let state = state_with(sandbox.clone()).await;
        let (session, _offer) = start_session("s3", &state, Box::new(|_| {}))
            .await
            .unwrap();

        // Two planes fail at once.
        tokio::join!(session.teardown(), session.teardown());
        session.teardown().await;

        let stops = sandbox.stops.lock().unwrap().clone();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0], "s3");
    }

    #[tokio::test]
    async fn test_exit_latch_triggers_teardown() {
        let sandbox = Arc::new(RecordingSandbox::default());
        let state = state_with(sandbox.clone()).await;
        let (session, _offer) = start_session("s4", &state, Box::new(|_| {}))
            .await
            .unwrap();

        session.bridge.exit_token().cancel();

        // The supervisor runs the teardown; poll for its effect.
        for _ in 0..50 {
            if !sandbox.stops.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let stops = sandbox.stops.lock().unwrap().clone();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0], "s4");
        assert_eq!(session.id(), "s4");
    }

    #[tokio::test]
    async fn test_media_queue_drops_beyond_capacity() {
        let (tx, mut rx) = mpsc::channel::<u32>(STREAM_QUEUE_CAPACITY);
        for i in 0..STREAM_QUEUE_CAPACITY as u32 {
            tx.try_send(i).unwrap();
        }
        // The 101st pending packet is dropped, not queued.
        assert!(tx.try_send(999).is_err());

        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, STREAM_QUEUE_CAPACITY);
    }
}
