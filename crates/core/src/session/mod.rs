//! RTSP client session state (RFC 2326 §3, §A.1).
//!
//! A [`ClientSession`] record is owned exclusively by the dispatcher — this
//! module defines the *shape* of that record plus the pieces a connection
//! thread needs to talk to the rest of the system: [`ClientHandle`] (how
//! the dispatcher pushes frames/close back to a connection) and
//! [`auth`] (credential/IP-allow-list verification run by the connection
//! before proposing a state transition to the dispatcher).

pub mod auth;
pub mod connection;

use std::net::IpAddr;
use std::sync::mpsc;
use std::time::Instant;

use crate::config::Protocol;
use crate::protocol::ParsedSdp;

/// Opaque per-connection identifier assigned by the dispatcher in response
/// to `ClientNew`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub(crate) u64);

impl ClientId {
    /// Used to format the RTSP `Session` header value.
    pub(crate) fn as_u64(self) -> u64 {
        self.0
    }
}

/// RTSP session state machine (RFC 2326 §A.1).
///
/// ```text
/// INITIAL ──ANNOUNCE──► ANNOUNCE ──SETUP──► PRE_RECORD ──RECORD──► RECORD
/// INITIAL ──SETUP─────► PRE_PLAY ──PLAY──► PLAY ──PAUSE──► PRE_PLAY
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Announce,
    PreRecord,
    Record,
    PrePlay,
    Play,
}

/// One media track (RTP+RTCP pair) set up within a session.
///
/// `trackId` is the track's index in the session's track list — not stored
/// on the struct itself, just the position it occupies in
/// `ClientSession::tracks`. For TCP-interleaved tracks the two ports are
/// unused; the channel numbers are derived from the index instead
/// (`2*trackId`, `2*trackId+1`), per [`crate::protocol::interleaved`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Track {
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

/// Messages sent to a connection's writer thread. Both dispatcher-pushed
/// media and the connection's own locally built RTSP responses travel
/// through this one channel, so a single thread owns the socket's write
/// half and nothing needs a write-side mutex.
pub enum ToConnection {
    /// Write a serialized RTSP response.
    Response(Vec<u8>),
    /// Write an interleaved RTP/RTCP frame (RFC 2326 §10.12).
    Frame { channel: u8, payload: Vec<u8> },
    /// Force the connection closed (teardown cascade, streamer gone
    /// not-ready, or shutdown drain).
    Close,
}

/// Handle the dispatcher holds for a connected client.
///
/// Cloned freely; the receiving end lives on the connection's writer
/// thread. Dropping every clone (connection gone) makes further sends
/// silently no-op, which is fine — the dispatcher learns about the
/// disconnect through `ClientClose`, not through send failures.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    to_conn: mpsc::Sender<ToConnection>,
}

impl ClientHandle {
    pub fn new(id: ClientId, to_conn: mpsc::Sender<ToConnection>) -> Self {
        ClientHandle { id, to_conn }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn send_frame(&self, channel: u8, payload: Vec<u8>) {
        let _ = self.to_conn.send(ToConnection::Frame { channel, payload });
    }

    pub fn close(&self) {
        let _ = self.to_conn.send(ToConnection::Close);
    }
}

/// The dispatcher's record of one connected client (RFC 2326 §3).
///
/// Mirrors the fields named in the design's data model: bound path,
/// negotiated transport, setup tracks, and — for UDP-recording clients —
/// the last inbound frame time an external liveness checker would consult.
pub struct ClientSession {
    pub handle: ClientHandle,
    pub peer_ip: IpAddr,
    pub state: SessionState,
    pub path: Option<String>,
    pub transport: Option<Protocol>,
    pub tracks: Vec<Track>,
    /// SDP this client ANNOUNCEd, once it has (publisher capability).
    pub sdp: Option<ParsedSdp>,
    pub last_frame_at: Option<Instant>,
}

impl ClientSession {
    pub fn new(handle: ClientHandle, peer_ip: IpAddr) -> Self {
        ClientSession {
            handle,
            peer_ip,
            state: SessionState::Initial,
            path: None,
            transport: None,
            tracks: Vec::new(),
            sdp: None,
            last_frame_at: None,
        }
    }

    /// A client-as-publisher is "ready" exactly when it has reached RECORD
    /// (§4.1 "Publisher slot semantics").
    pub fn is_ready_publisher(&self) -> bool {
        self.state == SessionState::Record
    }
}
