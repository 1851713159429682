//! UDP listeners: one socket per flow, RTP and RTCP, bound to the ports
//! configured in [`Config`](crate::config::Config) (§4.3). Each runs its own
//! receive loop posting `ClientFrameUdp` events; the dispatcher's fan-out
//! writes back through the same socket via [`UdpWriter`].

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::dispatcher::event::Flow;
use crate::dispatcher::DispatcherHandle;
use crate::error::Result;

use super::ListenerHandle;

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// A bound UDP socket wrapped for serialized writes (§5 "per-socket writes
/// serialized with a `parking_lot::Mutex`").
#[derive(Clone)]
pub struct UdpWriter {
    socket: Arc<Mutex<UdpSocket>>,
}

impl UdpWriter {
    pub(crate) fn from_socket(socket: UdpSocket) -> Self {
        UdpWriter {
            socket: Arc::new(Mutex::new(socket)),
        }
    }

    /// Best-effort send: a dropped datagram on a slow/gone reader is not an
    /// error the dispatcher needs to react to.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) {
        let socket = self.socket.lock();
        if let Err(e) = socket.send_to(payload, addr) {
            tracing::debug!(%addr, error = %e, "UDP send failed, dropping datagram");
        }
    }
}

pub fn spawn(
    bind_port: u16,
    flow: Flow,
    dispatcher: DispatcherHandle,
) -> Result<(UdpWriter, ListenerHandle, thread::JoinHandle<()>)> {
    let socket = UdpSocket::bind(("0.0.0.0", bind_port))?;
    socket.set_read_timeout(Some(POLL_TIMEOUT))?;
    let reader_socket = socket.try_clone()?;
    let writer = UdpWriter::from_socket(socket);
    let (handle, running) = ListenerHandle::new();
    let join = thread::spawn(move || recv_loop(reader_socket, flow, dispatcher, running));
    Ok((writer, handle, join))
}

fn recv_loop(socket: UdpSocket, flow: Flow, dispatcher: DispatcherHandle, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; 65_535];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((n, addr)) => dispatcher.client_frame_udp(flow, addr, buf[..n].to_vec()),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, ?flow, "UDP recv error");
                }
            }
        }
    }
    tracing::debug!(?flow, "UDP recv loop exited");
}
