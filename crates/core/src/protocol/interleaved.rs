//! TCP-interleaved binary data framing (RFC 2326 §10.12).
//!
//! When a session negotiates `RTP/AVP/TCP` transport, RTP/RTCP packets are
//! interleaved with RTSP requests/responses on the same TCP connection,
//! each wrapped in a 4-byte frame:
//!
//! ```text
//! '$' (1 byte) | channel (1 byte) | length (2 bytes, big-endian) | data
//! ```
//!
//! By convention (and as assigned during SETUP in this server) a track's
//! RTP channel is `2 * track_id` and its companion RTCP channel is
//! `2 * track_id + 1`.

/// Marker byte that distinguishes an interleaved frame from an RTSP
/// request/response line (which can never start with `$`, since method
/// names and `RTSP/1.0` status lines are all ASCII letters).
pub const MAGIC: u8 = b'$';

/// An interleaved RTP/RTCP frame as carried inside a TCP-interleaved session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Vec<u8>,
}

impl InterleavedFrame {
    pub fn new(channel: u8, payload: Vec<u8>) -> Self {
        InterleavedFrame { channel, payload }
    }

    /// RTP channel number for a track (RFC 2326 §10.12: even channel).
    pub fn rtp_channel(track_id: u8) -> u8 {
        track_id * 2
    }

    /// RTCP channel number for a track (the next odd channel).
    pub fn rtcp_channel(track_id: u8) -> u8 {
        track_id * 2 + 1
    }

    /// Encode as `$`, channel, big-endian u16 length, then payload.
    ///
    /// Panics if `payload` exceeds `u16::MAX` bytes; RTP/RTCP packets never
    /// approach that size in practice (network MTU bounds them far lower).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.payload.len());
        out.push(MAGIC);
        out.push(self.channel);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_numbering_matches_rfc() {
        assert_eq!(InterleavedFrame::rtp_channel(0), 0);
        assert_eq!(InterleavedFrame::rtcp_channel(0), 1);
        assert_eq!(InterleavedFrame::rtp_channel(3), 6);
        assert_eq!(InterleavedFrame::rtcp_channel(3), 7);
    }

    #[test]
    fn encode_prefixes_magic_channel_and_length() {
        let frame = InterleavedFrame::new(0, vec![1, 2, 3, 4]);
        let encoded = frame.encode();
        assert_eq!(encoded, vec![b'$', 0, 0, 4, 1, 2, 3, 4]);
    }
}
