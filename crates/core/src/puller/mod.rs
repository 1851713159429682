//! Upstream puller: a long-lived RTSP client pulling from an upstream URL
//! into a local path (§4.5).

pub mod client;

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::config::Protocol;
use crate::dispatcher::DispatcherHandle;
use crate::dispatcher::event::Flow;

/// Opaque identifier the dispatcher assigns a puller at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PullerId(pub(crate) u64);

/// Commands the dispatcher can send down to a running puller thread.
pub enum ToPuller {
    /// Shut down the upstream connection and stop retrying.
    Terminate,
}

/// Handle the dispatcher holds for a puller thread.
#[derive(Clone)]
pub struct PullerHandle {
    to_puller: mpsc::Sender<ToPuller>,
}

impl PullerHandle {
    pub fn new(to_puller: mpsc::Sender<ToPuller>) -> Self {
        PullerHandle { to_puller }
    }

    pub fn terminate(&self) {
        let _ = self.to_puller.send(ToPuller::Terminate);
    }
}

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn the puller thread for `path`, sourced from `url` over `protocol`.
///
/// Runs for the process lifetime: on any upstream failure it posts
/// `StreamerNotReady` and retries after an exponential backoff, per §4.5.
pub fn spawn(
    id: PullerId,
    path: String,
    url: String,
    protocol: Protocol,
    dispatcher: DispatcherHandle,
) -> (PullerHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = PullerHandle::new(tx);
    let join = thread::spawn(move || run(id, path, url, protocol, dispatcher, rx));
    (handle, join)
}

fn run(
    id: PullerId,
    path: String,
    url: String,
    protocol: Protocol,
    dispatcher: DispatcherHandle,
    rx: mpsc::Receiver<ToPuller>,
) {
    let mut backoff = MIN_BACKOFF;
    loop {
        if matches!(rx.try_recv(), Ok(ToPuller::Terminate)) {
            return;
        }

        match play_session(id, &url, protocol, &dispatcher, &rx) {
            Ok(terminated) => {
                if terminated {
                    return;
                }
                backoff = MIN_BACKOFF;
            }
            Err(e) => {
                tracing::warn!(path = %path, url = %url, error = %e, "upstream puller failed, retrying");
            }
        }

        dispatcher.streamer_not_ready(id);

        match rx.recv_timeout(backoff) {
            Ok(ToPuller::Terminate) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Connect, DESCRIBE, SETUP every track, PLAY, then forward frames until
/// the upstream connection fails or `Terminate` is received.
///
/// Returns `Ok(true)` if asked to terminate, `Ok(false)` if the upstream
/// connection simply ended (caller should back off and retry).
fn play_session(
    id: PullerId,
    url: &str,
    protocol: Protocol,
    dispatcher: &DispatcherHandle,
    rx: &mpsc::Receiver<ToPuller>,
) -> crate::error::Result<bool> {
    let mut upstream = client::UpstreamClient::connect(url, READ_TIMEOUT)?;
    let (raw_sdp, parsed) = upstream.describe()?;
    let track_count = parsed.media_count();

    let mut udp_sockets = Vec::new();
    for track_id in 0..track_count {
        match protocol {
            Protocol::Tcp => {
                upstream.setup(track_id, Protocol::Tcp, 0, 0)?;
            }
            Protocol::Udp => {
                let rtp = UdpSocket::bind("0.0.0.0:0")?;
                let rtcp = UdpSocket::bind("0.0.0.0:0")?;
                rtp.set_read_timeout(Some(Duration::from_millis(500)))?;
                rtcp.set_read_timeout(Some(Duration::from_millis(500)))?;
                let rtp_port = rtp.local_addr()?.port();
                let rtcp_port = rtcp.local_addr()?.port();
                upstream.setup(track_id, Protocol::Udp, rtp_port, rtcp_port)?;
                udp_sockets.push((rtp, rtcp));
            }
        }
    }

    upstream.play()?;
    dispatcher.streamer_ready(id, raw_sdp);

    let stop = Arc::new(AtomicBool::new(false));
    let mut reader_threads = Vec::new();
    for (track_id, (rtp, rtcp)) in udp_sockets.into_iter().enumerate() {
        for (socket, flow) in [(rtp, Flow::Rtp), (rtcp, Flow::Rtcp)] {
            let d = dispatcher.clone();
            let s = stop.clone();
            reader_threads.push(thread::spawn(move || {
                udp_reader_loop(socket, id, track_id, flow, d, s)
            }));
        }
    }

    let terminated = if protocol == Protocol::Tcp {
        loop {
            if matches!(rx.try_recv(), Ok(ToPuller::Terminate)) {
                break true;
            }
            match upstream.read_interleaved_frame() {
                Ok(frame) => {
                    let track_id = (frame.channel / 2) as usize;
                    let flow = if frame.channel % 2 == 0 { Flow::Rtp } else { Flow::Rtcp };
                    dispatcher.streamer_frame(id, track_id, flow, frame.payload);
                }
                Err(e) => {
                    stop.store(true, Ordering::SeqCst);
                    for t in reader_threads {
                        let _ = t.join();
                    }
                    return Err(e);
                }
            }
        }
    } else {
        loop {
            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(ToPuller::Terminate) => break true,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break false,
            }
        }
    };

    stop.store(true, Ordering::SeqCst);
    for t in reader_threads {
        let _ = t.join();
    }
    let _ = upstream.teardown();
    Ok(terminated)
}

fn udp_reader_loop(
    socket: UdpSocket,
    id: PullerId,
    track_id: usize,
    flow: Flow,
    dispatcher: DispatcherHandle,
    stop: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 65_535];
    while !stop.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(n) => dispatcher.streamer_frame(id, track_id, flow, buf[..n].to_vec()),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(_) => break,
        }
    }
}
