//! SDP (Session Description Protocol, RFC 4566) handling.
//!
//! Unlike a media server that generates codec-specific SDP from its own
//! packetizers, this server relays whatever SDP body a publisher supplied
//! in its ANNOUNCE request (or an upstream server returned from DESCRIBE)
//! verbatim to readers. The only thing the dispatcher needs out of it is
//! the number of media sections, to know how many SETUP requests to expect
//! for a given path.

/// A publisher-supplied SDP document, held as opaque bytes.
///
/// The server never parses codec parameters, `a=` attributes, or timing —
/// it forwards the body byte-for-byte. [`media_count`](Self::media_count)
/// is the one piece of structure the dispatcher relies on, to track how
/// many tracks a SETUP sequence should cover.
#[derive(Debug, Clone)]
pub struct ParsedSdp {
    raw: Vec<u8>,
    media_count: usize,
}

impl ParsedSdp {
    /// Parse just enough of `raw` to count media descriptions (`m=` lines).
    pub fn parse(raw: Vec<u8>) -> Self {
        let media_count = raw
            .split(|&b| b == b'\n')
            .filter(|line| {
                let line = trim_cr(line);
                line.starts_with(b"m=")
            })
            .count();
        ParsedSdp { raw, media_count }
    }

    /// The original bytes, unmodified, as relayed to DESCRIBE callers.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Number of `m=` (media description) lines found in the document.
    ///
    /// Used to validate that a PLAY request arrives only after every track
    /// has been SETUP (RFC 2326 §10.5, "aggregate operation").
    pub fn media_count(&self) -> usize {
        self.media_count
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    if let Some((b'\r', rest)) = line.split_last().map(|(l, r)| (*l, r)) {
        rest
    } else {
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_media_sections() {
        let sdp = b"v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 0 RTP/AVP 96\r\nm=audio 0 RTP/AVP 97\r\n".to_vec();
        let parsed = ParsedSdp::parse(sdp);
        assert_eq!(parsed.media_count(), 2);
    }

    #[test]
    fn zero_media_sections() {
        let sdp = b"v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_vec();
        let parsed = ParsedSdp::parse(sdp);
        assert_eq!(parsed.media_count(), 0);
    }

    #[test]
    fn raw_bytes_preserved_verbatim() {
        let sdp = b"v=0\r\nm=video 0 RTP/AVP 96\r\n".to_vec();
        let parsed = ParsedSdp::parse(sdp.clone());
        assert_eq!(parsed.raw(), &sdp[..]);
    }

    #[test]
    fn tolerates_bare_lf() {
        let sdp = b"v=0\nm=video 0 RTP/AVP 96\nm=audio 0 RTP/AVP 97\n".to_vec();
        let parsed = ParsedSdp::parse(sdp);
        assert_eq!(parsed.media_count(), 2);
    }
}
