//! Top-level server orchestrator (§2, §6).
//!
//! Wires the five components together: binds the RTP/RTCP UDP sockets and
//! the RTSP TCP socket, starts the dispatcher thread, and spawns one puller
//! thread per configured upstream path. [`Server::start`] is the only entry
//! point a host binary needs; everything else (accept loops, per-connection
//! threads, the dispatcher's event loop) runs in the background until
//! [`Server::stop`] tears it back down in the fixed order from §5.

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::config::{Config, Source};
use crate::dispatcher::event::Flow;
use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::error::Result;
use crate::puller::{self, PullerId};
use crate::transport::{tcp, udp};

/// A fully started RTSP server: the dispatcher thread plus every listener
/// and puller thread it owns. Dropping this without calling
/// [`stop`](Self::stop) leaves the background threads running — always
/// call `stop` to shut down cleanly.
pub struct Server {
    handle: DispatcherHandle,
    dispatcher_join: Option<JoinHandle<()>>,
    tcp_join: Option<JoinHandle<()>>,
    rtp_join: Option<JoinHandle<()>>,
    rtcp_join: Option<JoinHandle<()>>,
    puller_joins: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind every configured socket and start the dispatcher, listener, and
    /// puller threads. Returns once the RTSP TCP socket and both UDP
    /// sockets are bound and listening.
    pub fn start(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        // The event channel is `sync_channel(0)`: every send blocks until
        // the dispatcher thread receives it, which is the "unbuffered"
        // backpressure §5 calls for.
        let (tx, rx) = mpsc::sync_channel(0);
        let handle = DispatcherHandle::new(tx);

        let (udp_rtp, rtp_listener, rtp_join) = udp::spawn(config.rtp_port, Flow::Rtp, handle.clone())?;
        let (udp_rtcp, rtcp_listener, rtcp_join) = udp::spawn(config.rtcp_port, Flow::Rtcp, handle.clone())?;

        let tcp_socket = TcpListener::bind(("0.0.0.0", config.rtsp_port))?;
        let (tcp_listener, tcp_join) = tcp::spawn(tcp_socket, handle.clone(), config.clone())?;

        let mut dispatcher = Dispatcher::new(udp_rtp, udp_rtcp);
        dispatcher.set_tcp_listener(tcp_listener);
        dispatcher.set_rtp_listener(rtp_listener);
        dispatcher.set_rtcp_listener(rtcp_listener);

        let mut puller_joins = Vec::new();
        for (index, (path_name, path_conf)) in config.paths.iter().enumerate() {
            let Source::Rtsp(url) = &path_conf.source else {
                continue;
            };
            let id = PullerId(index as u64);
            let (puller_handle, join) = puller::spawn(
                id,
                path_name.clone(),
                url.clone(),
                path_conf.source_protocol,
                handle.clone(),
            );
            dispatcher.register_streamer(id, puller_handle, path_name.clone());
            puller_joins.push(join);
        }

        let dispatcher_join = dispatcher.spawn(rx);

        tracing::info!(
            rtsp_port = config.rtsp_port,
            rtp_port = config.rtp_port,
            rtcp_port = config.rtcp_port,
            "RTSP server listening"
        );

        Ok(Server {
            handle,
            dispatcher_join: Some(dispatcher_join),
            tcp_join: Some(tcp_join),
            rtp_join: Some(rtp_join),
            rtcp_join: Some(rtcp_join),
            puller_joins,
        })
    }

    /// A cloneable handle producers use to talk to the dispatcher. Exposed
    /// mainly for tests that want to drive dispatcher events directly
    /// without going through real sockets.
    pub fn dispatcher_handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Shut down in the order §5 mandates: send `Terminate`, which the
    /// dispatcher answers only after draining in-flight events and closing
    /// every puller, listener, and client session it owns; then join every
    /// background thread so this call returns only once nothing is left
    /// running.
    pub fn stop(mut self) -> Result<()> {
        self.handle.terminate()?;
        if let Some(join) = self.dispatcher_join.take() {
            let _ = join.join();
        }
        if let Some(join) = self.tcp_join.take() {
            let _ = join.join();
        }
        if let Some(join) = self.rtp_join.take() {
            let _ = join.join();
        }
        if let Some(join) = self.rtcp_join.take() {
            let _ = join.join();
        }
        for join in self.puller_joins.drain(..) {
            let _ = join.join();
        }
        tracing::info!("RTSP server stopped");
        Ok(())
    }
}
