use std::sync::Mutex;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

use crate::bridge::InputEvent;
use crate::error::CoordinatorError;

/// Largest UDP datagram the sandbox encoder emits.
const MAX_DATAGRAM: usize = 1600;

struct RelayerIo {
    video_socket: UdpSocket,
    audio_socket: UdpSocket,
    input_listener: TcpListener,
    video_tx: mpsc::Sender<Packet>,
    audio_tx: mpsc::Sender<Packet>,
    input_rx: mpsc::Receiver<InputEvent>,
}

/// Shuttles RTP packets from the sandbox's UDP sockets into the session
/// queues and input events from the session queue to the sandbox's TCP
/// socket.
///
/// Each worker owns its socket and its queue endpoint, so a worker winding
/// down releases the port before the queue closes.
pub struct StreamRelayer {
    id: String,
    screen_width: u16,
    screen_height: u16,
    io: Mutex<Option<RelayerIo>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl StreamRelayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        video_socket: UdpSocket,
        audio_socket: UdpSocket,
        input_listener: TcpListener,
        video_tx: mpsc::Sender<Packet>,
        audio_tx: mpsc::Sender<Packet>,
        input_rx: mpsc::Receiver<InputEvent>,
        screen_width: u16,
        screen_height: u16,
    ) -> Self {
        Self {
            id,
            screen_width,
            screen_height,
            io: Mutex::new(Some(RelayerIo {
                video_socket,
                audio_socket,
                input_listener,
                video_tx,
                audio_tx,
                input_rx,
            })),
            workers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Launch the three relay workers.
    pub fn start(&self) {
        let io = match self.io.lock().ok().and_then(|mut slot| slot.take()) {
            Some(io) => io,
            None => {
                warn!("[{}] relayer already started", self.id);
                return;
            }
        };

        debug!(
            "[{}] relaying sandbox streams at {}x{}",
            self.id, self.screen_width, self.screen_height
        );

        let handles = vec![
            tokio::spawn(run_packet_reader(
                self.id.clone(),
                "video",
                io.video_socket,
                io.video_tx,
                self.shutdown.clone(),
            )),
            tokio::spawn(run_packet_reader(
                self.id.clone(),
                "audio",
                io.audio_socket,
                io.audio_tx,
                self.shutdown.clone(),
            )),
            tokio::spawn(run_input_writer(
                self.id.clone(),
                io.input_listener,
                io.input_rx,
                self.shutdown.clone(),
            )),
        ];

        if let Ok(mut workers) = self.workers.lock() {
            workers.extend(handles);
        }
    }

    /// Stop all workers and wait for them to wind down. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();

        // Never started: just release the held sockets.
        if let Ok(mut slot) = self.io.lock() {
            slot.take();
        }

        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        debug!("[{}] relayer closed", self.id);
    }
}

/// Blocking-read datagrams, parse them as RTP, enqueue into the lane.
///
/// A full queue drops the packet: fresh frames beat delayed delivery.
async fn run_packet_reader(
    id: String,
    lane: &'static str,
    socket: UdpSocket,
    tx: mpsc::Sender<Packet>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, _)) => {
                let mut raw = &buf[..len];
                match Packet::unmarshal(&mut raw) {
                    Ok(packet) => {
                        if tx.try_send(packet).is_err() {
                            debug!("[{}] {} queue full, dropping packet", id, lane);
                        }
                    }
                    Err(e) => debug!("[{}] discarding non-RTP {} datagram: {}", id, lane, e),
                }
            }
            Err(e) => {
                warn!("[{}] {} socket read failed: {}", id, lane, e);
                break;
            }
        }
    }
    debug!("[{}] {} reader stopped", id, lane);
}

/// Accept the sandbox's single input connection and feed it queued events,
/// one JSON object per line. A broken connection is logged and the writer
/// goes back to accepting until teardown.
async fn run_input_writer(
    id: String,
    listener: TcpListener,
    mut rx: mpsc::Receiver<InputEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("[{}] input listener accept failed: {}", id, e);
                break;
            }
        };
        info!("[{}] sandbox connected for input from {}", id, addr);

        match pump_input(&id, stream, &mut rx, &shutdown).await {
            Ok(()) => break,
            Err(e) => warn!("[{}] input connection lost, waiting for reconnect: {}", id, e),
        }
    }
    debug!("[{}] input writer stopped", id);
}

async fn pump_input(
    id: &str,
    mut stream: TcpStream,
    rx: &mut mpsc::Receiver<InputEvent>,
    shutdown: &CancellationToken,
) -> Result<(), CoordinatorError> {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            event = rx.recv() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
        };
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!("[{}] skipping unserializable input event: {}", id, e);
                continue;
            }
        };
        line.push(b'\n');
        stream
            .write_all(&line)
            .await
            .map_err(CoordinatorError::Transport)?;
    }
}
