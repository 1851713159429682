//! TCP listener: accepts RTSP control connections and hands each one to its
//! own per-connection thread (§4.4). The listener itself does nothing more
//! than accept and delegate — session state lives in the dispatcher and the
//! connection actor, not here.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::dispatcher::DispatcherHandle;
use crate::error::Result;
use crate::session::connection;

use super::ListenerHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn spawn(
    listener: TcpListener,
    dispatcher: DispatcherHandle,
    config: Arc<Config>,
) -> Result<(ListenerHandle, thread::JoinHandle<()>)> {
    listener.set_nonblocking(true)?;
    let (handle, running) = ListenerHandle::new();
    let join = thread::spawn(move || accept_loop(listener, dispatcher, config, running));
    Ok((handle, join))
}

fn accept_loop(
    listener: TcpListener,
    dispatcher: DispatcherHandle,
    config: Arc<Config>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                tracing::debug!(%peer, "accepted TCP connection");
                let d = dispatcher.clone();
                let c = config.clone();
                thread::spawn(move || connection::handle(stream, d, c));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("TCP accept loop exited");
}
