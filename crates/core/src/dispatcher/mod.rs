//! The event dispatcher: a single OS thread that owns every piece of shared
//! mutable server state (the clients set, the publisher registry, and the
//! `publisherCount`/`receiverCount` counters) and processes one [`Event`] at
//! a time off an `mpsc::Receiver`. No other component ever locks this state
//! directly — they hold a cloneable [`DispatcherHandle`] and communicate
//! purely through messages, most of which carry a one-shot reply channel.
//!
//! Serializing every state transition through a single thread removes the
//! need for any lock around the registry: invariants like "at most one
//! publisher per path" only have to be checked in one place, by one thread,
//! reading its own exclusively-owned `HashMap`.

pub mod event;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Protocol;
use crate::error::{Result, RtspError};
use crate::protocol::ParsedSdp;
use crate::puller::{PullerHandle, PullerId};
use crate::session::{ClientHandle, ClientId, ClientSession, SessionState, Track};
use crate::transport::udp::UdpWriter;
use crate::transport::ListenerHandle;

use event::{Event, Flow, Reply, SetupAck};

/// Cloneable front-end every producer (TCP listener, UDP listeners, client
/// connections, pullers) uses to talk to the dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::SyncSender<Event>,
}

impl DispatcherHandle {
    pub(crate) fn new(tx: mpsc::SyncSender<Event>) -> Self {
        DispatcherHandle { tx }
    }

    /// Send a reply-bearing event and block for the dispatcher's answer.
    /// A channel disconnect (dispatcher thread gone) surfaces as the same
    /// `Terminated` error a caller would get from an explicit drain reply.
    fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Event) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| RtspError::Terminated)?;
        reply_rx.recv().map_err(|_| RtspError::Terminated)
    }

    /// Send a fire-and-forget event. Dropped silently if the dispatcher has
    /// already shut down — callers of these never need the result.
    fn cast(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn client_new(&self, handle: ClientHandle, peer_ip: IpAddr) -> Result<ClientId> {
        self.call(|reply| Event::ClientNew {
            handle,
            peer_ip,
            reply,
        })
    }

    pub fn client_close(&self, client: ClientId) -> Result<()> {
        self.call(|reply| Event::ClientClose { client, reply })
    }

    pub fn client_describe(&self, path: String) -> Result<Option<Vec<u8>>> {
        self.call(|reply| Event::ClientDescribe { path, reply })
    }

    pub fn client_announce(&self, client: ClientId, path: String, sdp: Vec<u8>) -> Result<()> {
        self.call(|reply| Event::ClientAnnounce {
            client,
            path,
            sdp,
            reply,
        })?
    }

    pub fn client_setup_play(
        &self,
        client: ClientId,
        path: String,
        protocol: Protocol,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<SetupAck> {
        self.call(|reply| Event::ClientSetupPlay {
            client,
            path,
            protocol,
            rtp_port,
            rtcp_port,
            reply,
        })?
    }

    pub fn client_setup_record(
        &self,
        client: ClientId,
        protocol: Protocol,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<SetupAck> {
        self.call(|reply| Event::ClientSetupRecord {
            client,
            protocol,
            rtp_port,
            rtcp_port,
            reply,
        })?
    }

    pub fn client_play1(&self, client: ClientId) -> Result<()> {
        self.call(|reply| Event::ClientPlay1 { client, reply })?
    }

    pub fn client_play2(&self, client: ClientId) -> Result<()> {
        self.call(|reply| Event::ClientPlay2 { client, reply })
    }

    pub fn client_pause(&self, client: ClientId) -> Result<()> {
        self.call(|reply| Event::ClientPause { client, reply })
    }

    pub fn client_record(&self, client: ClientId) -> Result<()> {
        self.call(|reply| Event::ClientRecord { client, reply })
    }

    pub fn client_frame_udp(&self, flow: Flow, addr: SocketAddr, payload: Vec<u8>) {
        self.cast(Event::ClientFrameUdp {
            flow,
            addr,
            payload,
        });
    }

    pub fn client_frame_tcp(&self, path: String, track_id: usize, flow: Flow, payload: Vec<u8>) {
        self.cast(Event::ClientFrameTcp {
            path,
            track_id,
            flow,
            payload,
        });
    }

    pub fn streamer_ready(&self, puller: PullerId, sdp: Vec<u8>) {
        self.cast(Event::StreamerReady { puller, sdp });
    }

    pub fn streamer_not_ready(&self, puller: PullerId) {
        self.cast(Event::StreamerNotReady { puller });
    }

    pub fn streamer_frame(&self, puller: PullerId, track_id: usize, flow: Flow, payload: Vec<u8>) {
        self.cast(Event::StreamerFrame {
            puller,
            track_id,
            flow,
            payload,
        });
    }

    pub fn terminate(&self) -> Result<()> {
        self.call(|reply| Event::Terminate { reply })
    }
}

/// A publisher slot is owned either by a connected client (publishing via
/// ANNOUNCE/RECORD) or by an upstream puller (republishing a pulled stream).
enum PublisherRef {
    Client(ClientId),
    Streamer(PullerId),
}

struct StreamerEntry {
    handle: PullerHandle,
    path: String,
    ready: bool,
    raw_sdp: Vec<u8>,
    sdp: Option<ParsedSdp>,
}

/// Normalize an address for identity comparison, so a client whose publish
/// and read sockets mix IPv4 and IPv4-mapped-IPv6 forms still matches.
fn ip_eq(a: IpAddr, b: IpAddr) -> bool {
    a.to_canonical() == b.to_canonical()
}

pub struct Dispatcher {
    clients: HashMap<ClientId, ClientSession>,
    publishers: HashMap<String, PublisherRef>,
    streamers: HashMap<PullerId, StreamerEntry>,
    publisher_count: usize,
    receiver_count: usize,
    next_client_id: u64,
    draining: bool,
    udp_rtp: UdpWriter,
    udp_rtcp: UdpWriter,
    tcp_listener: Option<ListenerHandle>,
    rtp_listener: Option<ListenerHandle>,
    rtcp_listener: Option<ListenerHandle>,
}

impl Dispatcher {
    pub fn new(udp_rtp: UdpWriter, udp_rtcp: UdpWriter) -> Self {
        Dispatcher {
            clients: HashMap::new(),
            publishers: HashMap::new(),
            streamers: HashMap::new(),
            publisher_count: 0,
            receiver_count: 0,
            next_client_id: 0,
            draining: false,
            udp_rtp,
            udp_rtcp,
            tcp_listener: None,
            rtp_listener: None,
            rtcp_listener: None,
        }
    }

    pub fn set_tcp_listener(&mut self, handle: ListenerHandle) {
        self.tcp_listener = Some(handle);
    }

    pub fn set_rtp_listener(&mut self, handle: ListenerHandle) {
        self.rtp_listener = Some(handle);
    }

    pub fn set_rtcp_listener(&mut self, handle: ListenerHandle) {
        self.rtcp_listener = Some(handle);
    }

    /// Install an upstream puller's publisher slot before the dispatcher
    /// thread starts. Safe to call without going through an event because
    /// nothing else can observe `self` concurrently at this point.
    pub fn register_streamer(&mut self, id: PullerId, handle: PullerHandle, path: String) {
        self.publishers.insert(path.clone(), PublisherRef::Streamer(id));
        self.streamers.insert(
            id,
            StreamerEntry {
                handle,
                path,
                ready: false,
                raw_sdp: Vec::new(),
                sdp: None,
            },
        );
    }

    /// Spawn the dispatcher loop on its own thread, consuming `self`.
    pub fn spawn(self, rx: mpsc::Receiver<Event>) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run(rx))
    }

    fn run(mut self, rx: mpsc::Receiver<Event>) {
        loop {
            match rx.recv() {
                Ok(Event::Terminate { reply }) => {
                    self.shutdown(&rx, reply);
                    return;
                }
                Ok(event) => self.handle_event(event),
                Err(_) => return,
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::ClientNew {
                handle,
                peer_ip,
                reply,
            } => self.on_client_new(handle, peer_ip, reply),
            Event::ClientClose { client, reply } => self.on_client_close(client, reply),
            Event::ClientDescribe { path, reply } => self.on_client_describe(path, reply),
            Event::ClientAnnounce {
                client,
                path,
                sdp,
                reply,
            } => self.on_client_announce(client, path, sdp, reply),
            Event::ClientSetupPlay {
                client,
                path,
                protocol,
                rtp_port,
                rtcp_port,
                reply,
            } => self.on_setup_play(client, path, protocol, rtp_port, rtcp_port, reply),
            Event::ClientSetupRecord {
                client,
                protocol,
                rtp_port,
                rtcp_port,
                reply,
            } => self.on_setup_record(client, protocol, rtp_port, rtcp_port, reply),
            Event::ClientPlay1 { client, reply } => self.on_play1(client, reply),
            Event::ClientPlay2 { client, reply } => self.on_play2(client, reply),
            Event::ClientPause { client, reply } => self.on_pause(client, reply),
            Event::ClientRecord { client, reply } => self.on_record(client, reply),
            Event::ClientFrameUdp {
                flow,
                addr,
                payload,
            } => self.on_client_frame_udp(flow, addr, payload),
            Event::ClientFrameTcp {
                path,
                track_id,
                flow,
                payload,
            } => self.fan_out(&path, track_id, flow, payload),
            Event::StreamerReady { puller, sdp } => self.on_streamer_ready(puller, sdp),
            Event::StreamerNotReady { puller } => self.on_streamer_not_ready(puller),
            Event::StreamerFrame {
                puller,
                track_id,
                flow,
                payload,
            } => self.on_streamer_frame(puller, track_id, flow, payload),
            Event::Terminate { .. } => unreachable!("Terminate is handled directly in run()"),
        }
    }

    /// Drain events that were already blocked on `send()` at the moment
    /// Terminate was processed, then close owned resources in the fixed
    /// order from §5: upstream pullers, TCP listener, RTCP listener, RTP
    /// listener, then every client session.
    fn shutdown(&mut self, rx: &mpsc::Receiver<Event>, reply: event::Reply<()>) {
        self.draining = true;
        loop {
            match rx.recv_timeout(Duration::from_millis(20)) {
                Ok(event) => self.handle_event(event),
                Err(_) => break,
            }
        }

        for (_, streamer) in self.streamers.drain() {
            streamer.handle.terminate();
        }
        if let Some(l) = self.tcp_listener.take() {
            l.close();
        }
        if let Some(l) = self.rtcp_listener.take() {
            l.close();
        }
        if let Some(l) = self.rtp_listener.take() {
            l.close();
        }
        for (_, session) in self.clients.drain() {
            session.handle.close();
        }

        self.log("terminated");
        let _ = reply.send(());
    }

    fn log(&self, message: &str) {
        tracing::info!(
            clients = self.clients.len(),
            publishers = self.publisher_count,
            receivers = self.receiver_count,
            "[{}/{}/{}] {}",
            self.clients.len(),
            self.publisher_count,
            self.receiver_count,
            message
        );
    }

    fn has_ready_publisher(&self, path: &str) -> bool {
        match self.publishers.get(path) {
            Some(PublisherRef::Client(id)) => self
                .clients
                .get(id)
                .map(|c| c.is_ready_publisher())
                .unwrap_or(false),
            Some(PublisherRef::Streamer(id)) => {
                self.streamers.get(id).map(|s| s.ready).unwrap_or(false)
            }
            None => false,
        }
    }

    fn media_count_for(&self, path: &str) -> usize {
        match self.publishers.get(path) {
            Some(PublisherRef::Client(id)) => self
                .clients
                .get(id)
                .and_then(|c| c.sdp.as_ref())
                .map(|s| s.media_count())
                .unwrap_or(0),
            Some(PublisherRef::Streamer(id)) => self
                .streamers
                .get(id)
                .and_then(|s| s.sdp.as_ref())
                .map(|s| s.media_count())
                .unwrap_or(0),
            None => 0,
        }
    }

    fn close_readers_on(&self, path: &str) {
        for session in self.clients.values() {
            if session.state == SessionState::Play && session.path.as_deref() == Some(path) {
                session.handle.close();
            }
        }
    }

    /// Deliver one payload to every ready reader on `path`, at most once per
    /// reader, over whichever transport that reader negotiated.
    fn fan_out(&self, path: &str, track_id: usize, flow: Flow, payload: Vec<u8>) {
        for session in self.clients.values() {
            if session.state != SessionState::Play || session.path.as_deref() != Some(path) {
                continue;
            }
            match session.transport {
                Some(Protocol::Udp) => {
                    if let Some(track) = session.tracks.get(track_id) {
                        let port = match flow {
                            Flow::Rtp => track.rtp_port,
                            Flow::Rtcp => track.rtcp_port,
                        };
                        let addr = SocketAddr::new(session.peer_ip, port);
                        match flow {
                            Flow::Rtp => self.udp_rtp.send_to(&payload, addr),
                            Flow::Rtcp => self.udp_rtcp.send_to(&payload, addr),
                        }
                    }
                }
                Some(Protocol::Tcp) => {
                    let channel = 2 * track_id as u8 + if flow == Flow::Rtcp { 1 } else { 0 };
                    session.handle.send_frame(channel, payload.clone());
                }
                None => {}
            }
        }
    }

    fn on_client_new(&mut self, handle: ClientHandle, peer_ip: IpAddr, reply: Reply<ClientId>) {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        self.clients.insert(id, ClientSession::new(handle, peer_ip));
        self.log("client connected");
        let _ = reply.send(id);
    }

    fn on_client_close(&mut self, client: ClientId, reply: Reply<()>) {
        if let Some(session) = self.clients.remove(&client) {
            if let Some(path) = session.path.clone() {
                let owns_slot = matches!(
                    self.publishers.get(&path),
                    Some(PublisherRef::Client(owner)) if *owner == client
                );
                if owns_slot {
                    self.publishers.remove(&path);
                    if session.state == SessionState::Record {
                        self.publisher_count = self.publisher_count.saturating_sub(1);
                        self.close_readers_on(&path);
                    }
                }
            }
            if session.state == SessionState::Play {
                self.receiver_count = self.receiver_count.saturating_sub(1);
            }
        }
        self.log("client closed");
        let _ = reply.send(());
    }

    fn on_client_describe(&self, path: String, reply: Reply<Option<Vec<u8>>>) {
        let sdp = match self.publishers.get(&path) {
            Some(PublisherRef::Client(id)) => self
                .clients
                .get(id)
                .filter(|c| c.is_ready_publisher())
                .and_then(|c| c.sdp.as_ref())
                .map(|s| s.raw().to_vec()),
            Some(PublisherRef::Streamer(id)) => self
                .streamers
                .get(id)
                .filter(|s| s.ready)
                .map(|s| s.raw_sdp.clone()),
            None => None,
        };
        let _ = reply.send(sdp);
    }

    fn on_client_announce(
        &mut self,
        client: ClientId,
        path: String,
        sdp: Vec<u8>,
        reply: Reply<Result<()>>,
    ) {
        if self.draining {
            let _ = reply.send(Err(RtspError::Terminated));
            return;
        }
        if self.publishers.contains_key(&path) {
            let _ = reply.send(Err(RtspError::PublisherConflict(path)));
            return;
        }
        let Some(session) = self.clients.get_mut(&client) else {
            let _ = reply.send(Err(RtspError::Terminated));
            return;
        };
        session.path = Some(path.clone());
        session.state = SessionState::Announce;
        session.sdp = Some(ParsedSdp::parse(sdp));
        self.publishers.insert(path, PublisherRef::Client(client));
        self.log("announce");
        let _ = reply.send(Ok(()));
    }

    fn on_setup_play(
        &mut self,
        client: ClientId,
        path: String,
        protocol: Protocol,
        rtp_port: u16,
        rtcp_port: u16,
        reply: Reply<Result<SetupAck>>,
    ) {
        if self.draining {
            let _ = reply.send(Err(RtspError::Terminated));
            return;
        }
        if !self.has_ready_publisher(&path) {
            let _ = reply.send(Err(RtspError::NoSuchStream(path)));
            return;
        }
        let media_count = self.media_count_for(&path);
        let Some(session) = self.clients.get_mut(&client) else {
            let _ = reply.send(Err(RtspError::Terminated));
            return;
        };
        if session.tracks.len() >= media_count {
            let _ = reply.send(Err(RtspError::Sequencing(
                "all tracks already set up".to_string(),
            )));
            return;
        }
        session.tracks.push(Track { rtp_port, rtcp_port });
        session.path = Some(path);
        session.transport = Some(protocol);
        session.state = SessionState::PrePlay;
        let track_id = session.tracks.len() - 1;
        self.log("setup play");
        let _ = reply.send(Ok(SetupAck { track_id }));
    }

    fn on_setup_record(
        &mut self,
        client: ClientId,
        protocol: Protocol,
        rtp_port: u16,
        rtcp_port: u16,
        reply: Reply<Result<SetupAck>>,
    ) {
        if self.draining {
            let _ = reply.send(Err(RtspError::Terminated));
            return;
        }
        let Some(session) = self.clients.get_mut(&client) else {
            let _ = reply.send(Err(RtspError::Terminated));
            return;
        };
        session.tracks.push(Track { rtp_port, rtcp_port });
        session.transport = Some(protocol);
        session.state = SessionState::PreRecord;
        let track_id = session.tracks.len() - 1;
        self.log("setup record");
        let _ = reply.send(Ok(SetupAck { track_id }));
    }

    fn on_play1(&mut self, client: ClientId, reply: Reply<Result<()>>) {
        if self.draining {
            let _ = reply.send(Err(RtspError::Terminated));
            return;
        }
        let Some(session) = self.clients.get(&client) else {
            let _ = reply.send(Err(RtspError::Terminated));
            return;
        };
        let Some(path) = session.path.clone() else {
            let _ = reply.send(Err(RtspError::NoSuchStream(String::new())));
            return;
        };
        if !self.has_ready_publisher(&path) {
            let _ = reply.send(Err(RtspError::NoSuchStream(path)));
            return;
        }
        let media_count = self.media_count_for(&path);
        if session.tracks.len() != media_count {
            let _ = reply.send(Err(RtspError::Sequencing(format!(
                "expected {} tracks set up, got {}",
                media_count,
                session.tracks.len()
            ))));
            return;
        }
        let _ = reply.send(Ok(()));
    }

    fn on_play2(&mut self, client: ClientId, reply: Reply<()>) {
        if let Some(session) = self.clients.get_mut(&client) {
            session.state = SessionState::Play;
            self.receiver_count += 1;
        }
        self.log("play");
        let _ = reply.send(());
    }

    fn on_pause(&mut self, client: ClientId, reply: Reply<()>) {
        if let Some(session) = self.clients.get_mut(&client) {
            session.state = SessionState::PrePlay;
            self.receiver_count = self.receiver_count.saturating_sub(1);
        }
        self.log("pause");
        let _ = reply.send(());
    }

    fn on_record(&mut self, client: ClientId, reply: Reply<()>) {
        if let Some(session) = self.clients.get_mut(&client) {
            session.state = SessionState::Record;
            self.publisher_count += 1;
        }
        self.log("record");
        let _ = reply.send(());
    }

    fn on_client_frame_udp(&mut self, flow: Flow, addr: SocketAddr, payload: Vec<u8>) {
        let mut found: Option<(ClientId, String, usize)> = None;
        for (id, session) in self.clients.iter() {
            if session.state != SessionState::Record || session.transport != Some(Protocol::Udp) {
                continue;
            }
            if !ip_eq(session.peer_ip, addr.ip()) {
                continue;
            }
            for (idx, track) in session.tracks.iter().enumerate() {
                let matched = match flow {
                    Flow::Rtp => track.rtp_port == addr.port(),
                    Flow::Rtcp => track.rtcp_port == addr.port(),
                };
                if matched {
                    if let Some(path) = &session.path {
                        found = Some((*id, path.clone(), idx));
                    }
                    break;
                }
            }
            if found.is_some() {
                break;
            }
        }

        let Some((client_id, path, track_id)) = found else {
            return;
        };
        if let Some(session) = self.clients.get_mut(&client_id) {
            session.last_frame_at = Some(Instant::now());
        }
        self.fan_out(&path, track_id, flow, payload);
    }

    fn on_streamer_ready(&mut self, puller: PullerId, sdp: Vec<u8>) {
        if let Some(s) = self.streamers.get_mut(&puller) {
            if !s.ready {
                self.publisher_count += 1;
            }
            s.ready = true;
            s.sdp = Some(ParsedSdp::parse(sdp.clone()));
            s.raw_sdp = sdp;
        }
        self.log("streamer ready");
    }

    fn on_streamer_not_ready(&mut self, puller: PullerId) {
        let path = self.streamers.get_mut(&puller).and_then(|s| {
            if s.ready {
                s.ready = false;
                self.publisher_count = self.publisher_count.saturating_sub(1);
                Some(s.path.clone())
            } else {
                None
            }
        });
        if let Some(path) = path {
            self.close_readers_on(&path);
        }
        self.log("streamer not ready");
    }

    fn on_streamer_frame(&mut self, puller: PullerId, track_id: usize, flow: Flow, payload: Vec<u8>) {
        if let Some(path) = self.streamers.get(&puller).map(|s| s.path.clone()) {
            self.fan_out(&path, track_id, flow, payload);
        }
    }
}
