//! The dispatcher's event taxonomy.
//!
//! Every event is either fire-and-forget or carries a one-shot reply
//! channel (`std::sync::mpsc::Sender`, sent exactly once) — never a
//! completion flag shared across calls. This mirrors the design note that
//! reply channels are per-event one-shots and are never reused.

use std::net::SocketAddr;
use std::sync::mpsc;

use crate::config::Protocol;
use crate::error::Result;
use crate::puller::PullerId;
use crate::session::{ClientHandle, ClientId};
use std::net::IpAddr;

/// Which RTP sub-channel a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Rtp,
    Rtcp,
}

/// Acknowledgement of a successful SETUP (`ClientSetupPlay`/`ClientSetupRecord`).
///
/// Carries the `trackId` assigned to the newly appended track, which the
/// session needs to build the `Transport` response header.
#[derive(Debug, Clone, Copy)]
pub struct SetupAck {
    pub track_id: usize,
}

pub(crate) type Reply<T> = mpsc::Sender<T>;

/// The dispatcher's closed event sum (§4.1).
pub enum Event {
    ClientNew {
        handle: ClientHandle,
        peer_ip: IpAddr,
        reply: Reply<ClientId>,
    },
    ClientClose {
        client: ClientId,
        reply: Reply<()>,
    },
    ClientDescribe {
        path: String,
        reply: Reply<Option<Vec<u8>>>,
    },
    ClientAnnounce {
        client: ClientId,
        path: String,
        sdp: Vec<u8>,
        reply: Reply<Result<()>>,
    },
    ClientSetupPlay {
        client: ClientId,
        path: String,
        protocol: Protocol,
        rtp_port: u16,
        rtcp_port: u16,
        reply: Reply<Result<SetupAck>>,
    },
    ClientSetupRecord {
        client: ClientId,
        protocol: Protocol,
        rtp_port: u16,
        rtcp_port: u16,
        reply: Reply<Result<SetupAck>>,
    },
    ClientPlay1 {
        client: ClientId,
        reply: Reply<Result<()>>,
    },
    ClientPlay2 {
        client: ClientId,
        reply: Reply<()>,
    },
    ClientPause {
        client: ClientId,
        reply: Reply<()>,
    },
    ClientRecord {
        client: ClientId,
        reply: Reply<()>,
    },
    ClientFrameUdp {
        flow: Flow,
        addr: SocketAddr,
        payload: Vec<u8>,
    },
    ClientFrameTcp {
        path: String,
        track_id: usize,
        flow: Flow,
        payload: Vec<u8>,
    },
    StreamerReady {
        puller: PullerId,
        /// Raw SDP bytes obtained from the upstream DESCRIBE. The event
        /// table (§4.1) doesn't carry a payload for this event, but the
        /// dispatcher has nowhere else to learn it: a streamer's SDP is
        /// only ever produced by the puller thread itself.
        sdp: Vec<u8>,
    },
    StreamerNotReady {
        puller: PullerId,
    },
    StreamerFrame {
        puller: PullerId,
        track_id: usize,
        flow: Flow,
        payload: Vec<u8>,
    },
    Terminate {
        reply: Reply<()>,
    },
}
