//! Per-connection RTSP actor (§4.2, §4.4).
//!
//! One thread per TCP control connection, split into a reader half (this
//! module, driving the RTSP method dispatch and decoding any interleaved
//! media the client pushes) and a writer half (a small loop draining
//! [`ToConnection`] so dispatcher-pushed frames, locally built responses and
//! a forced close all serialize through the one socket without a mutex).
//! Session state itself — [`SessionState`], bound path, negotiated
//! transport — lives only here; the dispatcher never sees more than the
//! `ClientSession` record it keeps on the client's behalf.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;

use rand::Rng;

use crate::config::{Config, PathConf, Protocol};
use crate::dispatcher::DispatcherHandle;
use crate::error::{Result, RtspError};
use crate::protocol::interleaved::{self, InterleavedFrame};
use crate::protocol::{RtspRequest, RtspResponse};

use super::auth;
use super::{ClientHandle, ClientId, SessionState, ToConnection};

/// Accept loop entry point: own the connection end to end. Returns once the
/// client disconnects, times out, sends TEARDOWN, or the dispatcher forces
/// the session closed.
pub fn handle(stream: TcpStream, dispatcher: DispatcherHandle, config: Arc<Config>) {
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let writer_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    drop(stream);

    let (to_conn_tx, to_conn_rx) = mpsc::channel();
    let placeholder = ClientHandle::new(ClientId(0), to_conn_tx.clone());
    let client_id = match dispatcher.client_new(placeholder, peer_addr.ip()) {
        Ok(id) => id,
        Err(e) => {
            tracing::debug!(%peer_addr, error = %e, "rejected new connection");
            return;
        }
    };

    let _ = reader_stream.set_read_timeout(Some(config.read_timeout));
    let write_timeout = config.write_timeout;
    let writer_join = thread::spawn(move || writer_loop(writer_stream, to_conn_rx, write_timeout));

    let mut conn = Connection {
        reader: BufReader::new(reader_stream),
        to_conn: to_conn_tx,
        dispatcher: dispatcher.clone(),
        config,
        client_id,
        peer_addr,
        state: SessionState::Initial,
        path: None,
        transport: None,
        nonce: generate_nonce(),
        publish_hook_fired: false,
        read_hook_fired: false,
    };

    conn.run();

    let _ = dispatcher.client_close(client_id);
    let _ = conn.to_conn.send(ToConnection::Close);
    let _ = writer_join.join();

    if let Some(path) = &conn.path {
        if conn.publish_hook_fired {
            run_hook(&conn.config.post_script, path, "publish");
        }
        if conn.read_hook_fired {
            run_hook(&conn.config.post_script, path, "read");
        }
    }
    tracing::debug!(%peer_addr, "connection closed");
}

fn writer_loop(mut stream: TcpStream, rx: mpsc::Receiver<ToConnection>, write_timeout: std::time::Duration) {
    let _ = stream.set_write_timeout(Some(write_timeout));
    for msg in rx {
        let bytes = match msg {
            ToConnection::Response(bytes) => bytes,
            ToConnection::Frame { channel, payload } => InterleavedFrame::new(channel, payload).encode(),
            ToConnection::Close => break,
        };
        if let Err(e) = stream.write_all(&bytes) {
            tracing::debug!(error = %e, "connection write failed, closing");
            break;
        }
    }
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

struct Connection {
    reader: BufReader<TcpStream>,
    to_conn: mpsc::Sender<ToConnection>,
    dispatcher: DispatcherHandle,
    config: Arc<Config>,
    client_id: ClientId,
    peer_addr: SocketAddr,
    state: SessionState,
    path: Option<String>,
    transport: Option<Protocol>,
    nonce: String,
    publish_hook_fired: bool,
    read_hook_fired: bool,
}

impl Connection {
    fn run(&mut self) {
        loop {
            let first_byte = match self.reader.fill_buf() {
                Ok(buf) if buf.is_empty() => break,
                Ok(buf) => buf[0],
                Err(_) => break,
            };

            if first_byte == interleaved::MAGIC {
                match self.read_interleaved_frame() {
                    Ok(frame) => self.handle_incoming_frame(frame),
                    Err(_) => break,
                }
                continue;
            }

            let request = match self.read_request() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "malformed RTSP request");
                    break;
                }
            };

            if self.dispatch_request(&request) {
                break;
            }
        }
    }

    fn read_interleaved_frame(&mut self) -> Result<InterleavedFrame> {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header)?;
        let channel = header[1];
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        Ok(InterleavedFrame::new(channel, payload))
    }

    fn handle_incoming_frame(&mut self, frame: InterleavedFrame) {
        if self.state != SessionState::Record || self.transport != Some(Protocol::Tcp) {
            return;
        }
        let Some(path) = self.path.clone() else { return };
        let track_id = (frame.channel / 2) as usize;
        let flow = if frame.channel % 2 == 0 {
            crate::dispatcher::event::Flow::Rtp
        } else {
            crate::dispatcher::event::Flow::Rtcp
        };
        self.dispatcher.client_frame_tcp(path, track_id, flow, frame.payload);
    }

    fn read_request(&mut self) -> Result<Option<RtspRequest>> {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(None);
            }
            head.push_str(&line);
            if line == "\r\n" || line == "\n" {
                break;
            }
        }
        let mut request = RtspRequest::parse(&head)?;
        if let Some(len) = request.content_length().filter(|&len| len > 0) {
            let mut body = vec![0u8; len];
            self.reader.read_exact(&mut body)?;
            request = request.with_body(body);
        }
        Ok(Some(request))
    }

    /// Dispatches one parsed request, writing its response through the
    /// writer thread. Returns whether the connection should close.
    fn dispatch_request(&mut self, request: &RtspRequest) -> bool {
        let cseq = request.cseq().unwrap_or("0").to_string();
        tracing::debug!(peer = %self.peer_addr, method = %request.method, uri = %request.uri, "request");

        let (response, stop) = match request.method.as_str() {
            "OPTIONS" => (self.handle_options(&cseq), false),
            "DESCRIBE" => (self.handle_describe(&cseq, request), false),
            "ANNOUNCE" => (self.handle_announce(&cseq, request), false),
            "SETUP" => (self.handle_setup(&cseq, request), false),
            "PLAY" => (self.handle_play(&cseq, request), false),
            "PAUSE" => (self.handle_pause(&cseq), false),
            "RECORD" => (self.handle_record(&cseq), false),
            "TEARDOWN" => (self.handle_teardown(&cseq), true),
            "GET_PARAMETER" => (self.handle_get_parameter(&cseq, request), false),
            other => {
                tracing::warn!(method = other, "unsupported RTSP method");
                (RtspResponse::not_implemented().add_header("CSeq", &cseq), false)
            }
        };

        let _ = self.to_conn.send(ToConnection::Response(response.serialize()));
        stop
    }

    // OPTIONS is legal in every session state (§7 "supplemented" behavior).
    fn handle_options(&self, cseq: &str) -> RtspResponse {
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header(
                "Public",
                "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, PAUSE, RECORD, TEARDOWN, GET_PARAMETER",
            )
    }

    fn handle_describe(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let path = path_from_uri(&request.uri);
        if let Err(e) = self.authorize(&path, false, request) {
            return self.auth_error_response(e, cseq);
        }
        match self.dispatcher.client_describe(path.clone()) {
            Ok(Some(sdp)) => RtspResponse::ok()
                .add_header("CSeq", cseq)
                .add_header("Content-Type", "application/sdp")
                .add_header("Content-Base", &request.uri)
                .with_body(sdp),
            Ok(None) => RtspResponse::not_found().add_header("CSeq", cseq),
            Err(e) => response_for_error(&e, cseq),
        }
    }

    fn handle_announce(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        if self.state != SessionState::Initial {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }
        let path = path_from_uri(&request.uri);
        if let Err(e) = self.authorize(&path, true, request) {
            return self.auth_error_response(e, cseq);
        }
        match self.dispatcher.client_announce(self.client_id, path.clone(), request.body.clone()) {
            Ok(()) => {
                self.state = SessionState::Announce;
                self.path = Some(path.clone());
                self.publish_hook_fired = true;
                run_hook(&self.config.pre_script, &path, "publish");
                RtspResponse::ok().add_header("CSeq", cseq)
            }
            Err(e) => response_for_error(&e, cseq),
        }
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        if !matches!(
            self.state,
            SessionState::Initial | SessionState::Announce | SessionState::PreRecord | SessionState::PrePlay
        ) {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }
        let Some(transport_header) = request.get_header("Transport") else {
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };
        let Some(requested) = parse_transport(transport_header) else {
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };
        let protocol = requested.protocol();
        if !self.config.protocols.contains(&protocol) {
            return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
        }

        let recording = matches!(self.state, SessionState::Announce | SessionState::PreRecord);
        let path = self.setup_path(&request.uri);

        if let Err(e) = self.authorize(&path, recording, request) {
            return self.auth_error_response(e, cseq);
        }

        let result = if recording {
            self.dispatcher.client_setup_record(self.client_id, protocol, requested.rtp_port(), requested.rtcp_port())
        } else {
            self.dispatcher.client_setup_play(
                self.client_id,
                path.clone(),
                protocol,
                requested.rtp_port(),
                requested.rtcp_port(),
            )
        };

        match result {
            Ok(ack) => {
                self.transport = Some(protocol);
                if recording {
                    self.state = SessionState::PreRecord;
                } else {
                    let first_binding = self.path.is_none();
                    self.state = SessionState::PrePlay;
                    self.path = Some(path.clone());
                    if first_binding {
                        self.read_hook_fired = true;
                        run_hook(&self.config.pre_script, &path, "read");
                    }
                }
                let transport_value = match requested {
                    RequestedTransport::Udp { client_rtp_port, client_rtcp_port } => format!(
                        "RTP/AVP;unicast;client_port={client_rtp_port}-{client_rtcp_port};server_port={}-{}",
                        self.config.rtp_port, self.config.rtcp_port
                    ),
                    RequestedTransport::Tcp => format!(
                        "RTP/AVP/TCP;interleaved={}-{}",
                        InterleavedFrame::rtp_channel(ack.track_id as u8),
                        InterleavedFrame::rtcp_channel(ack.track_id as u8),
                    ),
                };
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Transport", &transport_value)
                    .add_header("Session", &self.session_id())
            }
            Err(e) => response_for_error(&e, cseq),
        }
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        if self.state != SessionState::PrePlay {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }
        let path = self.path.clone().unwrap_or_default();
        if let Err(e) = self.authorize(&path, false, request) {
            return self.auth_error_response(e, cseq);
        }
        if let Err(e) = self.dispatcher.client_play1(self.client_id) {
            return response_for_error(&e, cseq);
        }
        let _ = self.dispatcher.client_play2(self.client_id);
        self.state = SessionState::Play;
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &self.session_id())
            .add_header("Range", "npt=0.000-")
    }

    fn handle_pause(&mut self, cseq: &str) -> RtspResponse {
        if self.state != SessionState::Play {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }
        let _ = self.dispatcher.client_pause(self.client_id);
        self.state = SessionState::PrePlay;
        RtspResponse::ok().add_header("CSeq", cseq).add_header("Session", &self.session_id())
    }

    fn handle_record(&mut self, cseq: &str) -> RtspResponse {
        if self.state != SessionState::PreRecord {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }
        let _ = self.dispatcher.client_record(self.client_id);
        self.state = SessionState::Record;
        RtspResponse::ok().add_header("CSeq", cseq).add_header("Session", &self.session_id())
    }

    fn handle_teardown(&mut self, cseq: &str) -> RtspResponse {
        RtspResponse::ok().add_header("CSeq", cseq).add_header("Session", &self.session_id())
    }

    // GET_PARAMETER with no body is the documented RTSP keepalive; echo the
    // Session header back and nothing else (§7 "supplemented" behavior).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let mut response = RtspResponse::ok().add_header("CSeq", cseq);
        if let Some(session) = request.get_header("Session") {
            let id = session.split(';').next().unwrap_or(session).trim();
            if id == self.session_id() {
                response = response.add_header("Session", &self.session_id());
            }
        }
        response
    }

    fn setup_path(&self, uri: &str) -> String {
        match &self.path {
            Some(p) => p.clone(),
            None => strip_track_segment(&path_from_uri(uri)).to_string(),
        }
    }

    fn session_id(&self) -> String {
        format!("{:08X}", self.client_id.as_u64())
    }

    fn path_conf(&self, path: &str) -> Result<PathConf> {
        self.config
            .path_conf(path)
            .cloned()
            .ok_or_else(|| RtspError::PathNotFound(path.to_string()))
    }

    fn authorize(&self, path: &str, publish: bool, request: &RtspRequest) -> Result<()> {
        let conf = self.path_conf(path)?;
        let (user, pass, ips) = auth::credentials_for(&conf, publish);
        if !auth::check_ip_allowed(ips, self.peer_addr.ip()) {
            return Err(RtspError::Forbidden);
        }
        match auth::check_credentials(user, pass, request.get_header("Authorization"), &request.method, &request.uri, &self.nonce) {
            auth::AuthResult::NotRequired | auth::AuthResult::Granted => Ok(()),
            auth::AuthResult::MissingCredentials | auth::AuthResult::Denied => Err(RtspError::Unauthorized),
        }
    }

    fn auth_error_response(&mut self, err: RtspError, cseq: &str) -> RtspResponse {
        match err {
            RtspError::Unauthorized => {
                self.nonce = generate_nonce();
                RtspResponse::unauthorized()
                    .add_header("CSeq", cseq)
                    .add_header("WWW-Authenticate", &format!("Basic realm=\"{}\"", auth::REALM))
                    .add_header(
                        "WWW-Authenticate",
                        &format!("Digest realm=\"{}\", nonce=\"{}\"", auth::REALM, self.nonce),
                    )
            }
            other => response_for_error(&other, cseq),
        }
    }
}

/// Maps a dispatcher error to the RTSP status it stands for (§7). Kept as
/// one function so the status code for a given failure is decided in
/// exactly one place.
fn response_for_error(err: &RtspError, cseq: &str) -> RtspResponse {
    let response = match err {
        RtspError::PublisherConflict(_) | RtspError::Terminated => RtspResponse::service_unavailable(),
        RtspError::NoSuchStream(_) | RtspError::PathNotFound(_) => RtspResponse::not_found(),
        RtspError::Sequencing(_) => RtspResponse::aggregate_not_allowed(),
        RtspError::Unauthorized => RtspResponse::unauthorized(),
        RtspError::Forbidden => RtspResponse::forbidden(),
        RtspError::Parse { .. } => RtspResponse::bad_request(),
        RtspError::Io(_) | RtspError::Config(_) => RtspResponse::internal_error(),
    };
    response.add_header("CSeq", cseq)
}

enum RequestedTransport {
    Udp { client_rtp_port: u16, client_rtcp_port: u16 },
    Tcp,
}

impl RequestedTransport {
    fn protocol(&self) -> Protocol {
        match self {
            RequestedTransport::Udp { .. } => Protocol::Udp,
            RequestedTransport::Tcp => Protocol::Tcp,
        }
    }

    fn rtp_port(&self) -> u16 {
        match self {
            RequestedTransport::Udp { client_rtp_port, .. } => *client_rtp_port,
            RequestedTransport::Tcp => 0,
        }
    }

    fn rtcp_port(&self) -> u16 {
        match self {
            RequestedTransport::Udp { client_rtcp_port, .. } => *client_rtcp_port,
            RequestedTransport::Tcp => 0,
        }
    }
}

fn parse_transport(header: &str) -> Option<RequestedTransport> {
    if header.contains("RTP/AVP/TCP") || header.contains("interleaved=") {
        return Some(RequestedTransport::Tcp);
    }
    let ports = header.split(';').find_map(|part| part.trim().strip_prefix("client_port="))?;
    let mut parts = ports.split('-');
    let rtp_port: u16 = parts.next()?.trim().parse().ok()?;
    let rtcp_port: u16 = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(rtp_port + 1);
    Some(RequestedTransport::Udp { client_rtp_port: rtp_port, client_rtcp_port: rtcp_port })
}

/// Derives a path from a request URI by dropping the scheme and host.
/// `rtsp://host:port/cam1/track1` yields `cam1/track1` — callers that need
/// just the stream path strip the trailing track segment separately.
fn path_from_uri(uri: &str) -> String {
    let after_scheme = uri.strip_prefix("rtsp://").or_else(|| uri.strip_prefix("rtsps://")).unwrap_or(uri);
    let after_host = after_scheme.splitn(2, '/').nth(1).unwrap_or("");
    after_host.trim_matches('/').to_string()
}

/// SETUP for playback names the track in the URI (`.../trackN` or
/// `.../streamid=N`, both seen in the wild); the stream path is everything
/// before it. Not RTSP-mandated syntax, just the convention this server's
/// own DESCRIBE responses and most clients agree on.
fn strip_track_segment(path: &str) -> &str {
    if let Some((base, tail)) = path.rsplit_once('/') {
        if tail.starts_with("track") || tail.starts_with("streamid=") {
            return base;
        }
    }
    path
}

fn generate_nonce() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

/// Fires a pre/post connection hook script, if configured, with
/// `RTSP_PATH`/`RTSP_SOURCE_TYPE` set. Fire-and-forget: a reaper thread
/// collects the exit status so the child never lingers as a zombie, but
/// nothing here waits on it or inspects the result.
fn run_hook(script: &Option<PathBuf>, path: &str, source_type: &str) {
    let Some(script) = script else { return };
    match std::process::Command::new(script)
        .env("RTSP_PATH", path)
        .env("RTSP_SOURCE_TYPE", source_type)
        .spawn()
    {
        Ok(mut child) => {
            thread::spawn(move || {
                let _ = child.wait();
            });
        }
        Err(e) => tracing::warn!(script = %script.display(), error = %e, "hook script failed to spawn"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_from_uri_strips_scheme_and_host() {
        assert_eq!(path_from_uri("rtsp://127.0.0.1:8554/cam1/track1"), "cam1/track1");
        assert_eq!(path_from_uri("rtsp://host/cam1"), "cam1");
    }

    #[test]
    fn strip_track_segment_drops_track_suffix() {
        assert_eq!(strip_track_segment("cam1/track1"), "cam1");
        assert_eq!(strip_track_segment("cam1/streamid=0"), "cam1");
        assert_eq!(strip_track_segment("cam1"), "cam1");
    }

    #[test]
    fn parse_transport_udp() {
        let t = parse_transport("RTP/AVP;unicast;client_port=6000-6001").unwrap();
        assert_eq!(t.protocol(), Protocol::Udp);
        assert_eq!(t.rtp_port(), 6000);
        assert_eq!(t.rtcp_port(), 6001);
    }

    #[test]
    fn parse_transport_tcp_interleaved() {
        let t = parse_transport("RTP/AVP/TCP;interleaved=0-1").unwrap();
        assert_eq!(t.protocol(), Protocol::Tcp);
    }

    #[test]
    fn parse_transport_rejects_garbage() {
        assert!(parse_transport("garbage").is_none());
    }
}
