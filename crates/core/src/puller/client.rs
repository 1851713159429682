//! Minimal upstream RTSP client used by the puller (§4.5).
//!
//! Reuses [`RtspRequest`]/[`RtspResponse`] for wire encoding rather than a
//! separate RTSP client dependency — the protocol is symmetric enough that
//! the same types serve both directions.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::config::Protocol;
use crate::error::{RtspError, Result};
use crate::protocol::sdp::ParsedSdp;
use crate::protocol::{RtspRequest, RtspResponse};

/// A blocking RTSP client connection to an upstream server.
pub struct UpstreamClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    uri: String,
    cseq: u32,
    session_id: Option<String>,
}

impl UpstreamClient {
    /// Connect to `uri`'s host:port (defaulting to 554 when unspecified).
    pub fn connect(uri: &str, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(uri)
            .map_err(|e| RtspError::Config(format!("invalid upstream URL '{uri}': {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| RtspError::Config(format!("upstream URL '{uri}' has no host")))?;
        let port = parsed.port().unwrap_or(554);

        let stream = TcpStream::connect((host, port))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let reader = BufReader::new(stream.try_clone()?);

        Ok(UpstreamClient {
            stream,
            reader,
            uri: uri.to_string(),
            cseq: 1,
            session_id: None,
        })
    }

    fn request(&mut self, method: &str, headers: &[(&str, &str)]) -> Result<RtspResponse> {
        let mut req = RtspRequest::build(method, &self.uri).with_header("CSeq", self.cseq.to_string());
        if let Some(session_id) = self.session_id.clone() {
            req = req.with_header("Session", session_id);
        }
        for (name, value) in headers {
            req = req.with_header(name, value.to_string());
        }
        self.cseq += 1;

        self.stream.write_all(&req.serialize())?;

        let mut head = String::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(RtspError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "upstream closed connection",
                )));
            }
            head.push_str(&line);
            if line == "\r\n" || line == "\n" {
                break;
            }
        }

        let mut response = RtspResponse::parse(&head)?;
        if let Some(len) = response
            .get_header("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&len| len > 0)
        {
            let mut body = vec![0u8; len];
            self.reader.read_exact(&mut body)?;
            response = response.with_body(body);
        }

        if response.status_code >= 300 {
            return Err(RtspError::Config(format!(
                "upstream {method} failed: {} {}",
                response.status_code, response.status_text
            )));
        }

        Ok(response)
    }

    /// DESCRIBE: obtain the SDP describing the upstream's media.
    pub fn describe(&mut self) -> Result<(Vec<u8>, ParsedSdp)> {
        let resp = self.request("DESCRIBE", &[("Accept", "application/sdp")])?;
        let raw = resp.body.unwrap_or_default();
        let parsed = ParsedSdp::parse(raw.clone());
        Ok((raw, parsed))
    }

    /// SETUP one track. For TCP, negotiates interleaved channels
    /// `2*track_id`/`2*track_id+1`; for UDP, negotiates the given client
    /// ports and returns the server's chosen ports (unused by the caller
    /// today, since incoming media is demultiplexed by source IP/port at
    /// the dispatcher regardless of which local port received it).
    pub fn setup(&mut self, track_id: usize, protocol: Protocol, client_rtp_port: u16, client_rtcp_port: u16) -> Result<()> {
        let transport = match protocol {
            Protocol::Tcp => format!(
                "RTP/AVP/TCP;interleaved={}-{}",
                track_id * 2,
                track_id * 2 + 1
            ),
            Protocol::Udp => format!(
                "RTP/AVP;unicast;client_port={client_rtp_port}-{client_rtcp_port}"
            ),
        };
        let resp = self.request("SETUP", &[("Transport", &transport)])?;
        if self.session_id.is_none() {
            if let Some(session) = resp.get_header("Session") {
                self.session_id = Some(session.split(';').next().unwrap_or(session).to_string());
            }
        }
        Ok(())
    }

    /// PLAY: start media delivery.
    pub fn play(&mut self) -> Result<()> {
        self.request("PLAY", &[])?;
        Ok(())
    }

    /// TEARDOWN: stop media delivery and release the upstream session.
    pub fn teardown(&mut self) -> Result<()> {
        self.request("TEARDOWN", &[])?;
        Ok(())
    }

    /// Read one TCP-interleaved frame from the control connection
    /// (used when `sourceProtocol: tcp`).
    pub fn read_interleaved_frame(&mut self) -> Result<crate::protocol::InterleavedFrame> {
        use crate::protocol::interleaved::InterleavedFrame;

        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header)?;
        if header[0] != crate::protocol::interleaved::MAGIC {
            return Err(RtspError::Parse {
                kind: crate::error::ParseErrorKind::InvalidHeader,
            });
        }
        let channel = header[1];
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        Ok(InterleavedFrame { channel, payload })
    }

    /// Hand back the underlying stream's clone, for setting UDP recv
    /// timeouts from the driving puller loop.
    pub fn control_stream(&self) -> Result<TcpStream> {
        Ok(self.stream.try_clone()?)
    }
}
