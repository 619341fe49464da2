//! Wire packet codec.
//!
//! Header layout, 16 bytes big-endian:
//!
//! ```text
//! [0]      flag
//! [1..5]   seq
//! [5..7]   total_len   (length of the whole frame across all fragments)
//! [7..9]   frag_offset (byte offset of this fragment within the frame)
//! [9]      frag_index
//! [10..14] sid
//! [14..16] data_len    (payload bytes in this packet, noise excluded)
//! ```
//!
//! Trailing bytes past `data_len` are noise and are discarded on decode.

use std::net::Ipv4Addr;

use rand::{thread_rng, Rng};

use crate::error::{Error, Result};
use crate::flags::{self, Flags};
use crate::PROTO_VERSION;

/// Serialized header size.
pub const HDR_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub flag: Flags,
    pub seq: u32,
    pub total_len: u16,
    pub frag_offset: u16,
    pub frag_index: u8,
    pub sid: u32,
    pub data_len: u16,
}

impl Header {
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = self.flag.bits();
        buf[1..5].copy_from_slice(&self.seq.to_be_bytes());
        buf[5..7].copy_from_slice(&self.total_len.to_be_bytes());
        buf[7..9].copy_from_slice(&self.frag_offset.to_be_bytes());
        buf[9] = self.frag_index;
        buf[10..14].copy_from_slice(&self.sid.to_be_bytes());
        buf[14..16].copy_from_slice(&self.data_len.to_be_bytes());
    }

    pub fn encode(&self) -> [u8; HDR_LEN] {
        let mut buf = [0u8; HDR_LEN];
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Header> {
        if buf.len() < HDR_LEN {
            return Err(Error::PacketTooShort(buf.len()));
        }
        Ok(Header {
            flag: Flags::new(buf[0]),
            seq: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            total_len: u16::from_be_bytes([buf[5], buf[6]]),
            frag_offset: u16::from_be_bytes([buf[7], buf[8]]),
            frag_index: buf[9],
            sid: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
            data_len: u16::from_be_bytes([buf[14], buf[15]]),
        })
    }
}

/// Packet body storage.
///
/// `Frame` holds a preassembled buffer with `HDR_LEN` bytes of room at the
/// front and the payload already resident behind it, so the relay path
/// serializes without copying the frame. Noise bytes, if any, sit after the
/// payload in the same buffer.
#[derive(Debug, Clone)]
enum Body {
    Parts { payload: Vec<u8>, noise: Vec<u8> },
    Frame(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub header: Header,
    body: Body,
}

impl Packet {
    pub fn new(flag: Flags, seq: u32, sid: u32, payload: Vec<u8>) -> Packet {
        let dlen = payload.len() as u16;
        Packet {
            header: Header {
                flag,
                seq,
                sid,
                total_len: dlen,
                data_len: dlen,
                ..Header::default()
            },
            body: Body::Parts {
                payload,
                noise: Vec::new(),
            },
        }
    }

    /// Wraps an interface frame that was read into a buffer with `HDR_LEN`
    /// bytes of headroom. The header is written in place when the packet is
    /// serialized.
    pub fn from_frame(buf: Vec<u8>) -> Packet {
        debug_assert!(buf.len() >= HDR_LEN);
        let dlen = (buf.len() - HDR_LEN) as u16;
        Packet {
            header: Header {
                flag: Flags::new(flags::DAT),
                total_len: dlen,
                data_len: dlen,
                ..Header::default()
            },
            body: Body::Frame(buf),
        }
    }

    pub fn data(seq: u32, sid: u32, payload: Vec<u8>) -> Packet {
        Packet::new(Flags::new(flags::DAT), seq, sid, payload)
    }

    /// Client knock: PSH with the session id as payload.
    pub fn knock(sid: u32) -> Packet {
        Packet::new(Flags::new(flags::PSH), 0, sid, sid.to_be_bytes().to_vec())
    }

    /// Server idle probe: PSH with an empty payload.
    pub fn heartbeat() -> Packet {
        Packet::new(Flags::new(flags::PSH), 0, 0, Vec::new())
    }

    /// Server reply to a knock from an established peer.
    pub fn heartbeat_ack() -> Packet {
        Packet::new(Flags::new(flags::PSH | flags::ACK), 0, 0, vec![0])
    }

    /// Client heartbeat ack: PSH|ACK carrying the session id.
    pub fn client_heartbeat_ack(sid: u32) -> Packet {
        Packet::new(
            Flags::new(flags::PSH | flags::ACK),
            0,
            sid,
            sid.to_be_bytes().to_vec(),
        )
    }

    /// Client handshake request: HSH with the session id as payload.
    pub fn handshake(sid: u32) -> Packet {
        Packet::new(Flags::new(flags::HSH), 0, sid, sid.to_be_bytes().to_vec())
    }

    /// Server hello: HSH|ACK carrying `{version, assigned ip, mask bits}`.
    pub fn handshake_reply(ip: Ipv4Addr, mask: u8) -> Packet {
        let mut payload = Vec::with_capacity(6);
        payload.push(PROTO_VERSION);
        payload.extend_from_slice(&ip.octets());
        payload.push(mask);
        Packet::new(Flags::new(flags::HSH | flags::ACK), 0, 0, payload)
    }

    /// Client confirmation of the server hello: HSH|ACK with the session id.
    pub fn handshake_confirm(sid: u32) -> Packet {
        Packet::new(
            Flags::new(flags::HSH | flags::ACK),
            0,
            sid,
            sid.to_be_bytes().to_vec(),
        )
    }

    /// Handshake rejection: HSH|FIN with a reason string as payload.
    pub fn handshake_reject(reason: &str) -> Packet {
        Packet::new(
            Flags::new(flags::HSH | flags::FIN),
            0,
            0,
            reason.as_bytes().to_vec(),
        )
    }

    /// Session teardown: FIN with the session id as payload.
    pub fn finish(sid: u32) -> Packet {
        Packet::new(Flags::new(flags::FIN), 0, sid, sid.to_be_bytes().to_vec())
    }

    /// Teardown acknowledgement: FIN|ACK, empty payload.
    pub fn finish_ack() -> Packet {
        Packet::new(Flags::new(flags::FIN | flags::ACK), 0, 0, Vec::new())
    }

    pub fn payload(&self) -> &[u8] {
        let dlen = self.header.data_len as usize;
        match &self.body {
            Body::Parts { payload, .. } => payload,
            Body::Frame(buf) => &buf[HDR_LEN..HDR_LEN + dlen],
        }
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        let dlen = self.header.data_len as usize;
        match &mut self.body {
            Body::Parts { payload, .. } => payload,
            Body::Frame(buf) => &mut buf[HDR_LEN..HDR_LEN + dlen],
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        let dlen = self.header.data_len as usize;
        match self.body {
            Body::Parts { payload, .. } => payload,
            Body::Frame(mut buf) => {
                buf.truncate(HDR_LEN + dlen);
                buf.drain(..HDR_LEN);
                buf
            }
        }
    }

    /// Appends `n` random noise bytes after the payload. Noise counts toward
    /// the wire size but not `data_len`, so the receiver drops it.
    pub fn add_noise(&mut self, n: usize) {
        let mut rng = thread_rng();
        match &mut self.body {
            Body::Parts { noise, .. } => {
                noise.resize(n, 0);
                rng.fill(&mut noise[..]);
            }
            Body::Frame(buf) => {
                let start = buf.len();
                buf.resize(start + n, 0);
                rng.fill(&mut buf[start..]);
            }
        }
    }

    pub fn noise_len(&self) -> usize {
        match &self.body {
            Body::Parts { noise, .. } => noise.len(),
            Body::Frame(buf) => buf.len() - HDR_LEN - self.header.data_len as usize,
        }
    }

    /// Serializes into `header || payload || noise`. The buffer is built
    /// once and cached; later calls only rewrite the header bytes, so seq
    /// and flag edits after the first serialization stay coherent.
    pub fn wire(&mut self) -> &[u8] {
        if let Body::Parts { payload, noise } = &self.body {
            let mut buf = Vec::with_capacity(HDR_LEN + payload.len() + noise.len());
            buf.extend_from_slice(&[0u8; HDR_LEN]);
            buf.extend_from_slice(payload);
            buf.extend_from_slice(noise);
            self.body = Body::Frame(buf);
        }
        match &mut self.body {
            Body::Frame(buf) => {
                self.header.encode_into(&mut buf[..HDR_LEN]);
                buf
            }
            Body::Parts { .. } => unreachable!(),
        }
    }

    /// Parses a received datagram (after decryption).
    pub fn decode(buf: &[u8]) -> Result<Packet> {
        let header = Header::decode(buf)?;
        let dlen = header.data_len as usize;
        if buf.len() < HDR_LEN + dlen {
            return Err(Error::LengthMismatch {
                expected: HDR_LEN + dlen,
                actual: buf.len(),
            });
        }
        Ok(Packet {
            header,
            body: Body::Parts {
                payload: buf[HDR_LEN..HDR_LEN + dlen].to_vec(),
                noise: Vec::new(),
            },
        })
    }

    /// Reads the session id prefix that knock, handshake and finish
    /// payloads carry.
    pub fn sid_payload(&self) -> Result<u32> {
        let p = self.payload();
        if p.len() < 4 {
            return Err(Error::Payload(format!(
                "session id payload too short: {} bytes",
                p.len()
            )));
        }
        Ok(u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
    }

    /// Parses a server hello payload into `(version, ip, mask bits)`.
    pub fn handshake_reply_payload(&self) -> Result<(u8, Ipv4Addr, u8)> {
        let p = self.payload();
        if p.len() < 6 {
            return Err(Error::Payload(format!(
                "handshake reply too short: {} bytes",
                p.len()
            )));
        }
        Ok((p[0], Ipv4Addr::new(p[1], p[2], p[3], p[4]), p[5]))
    }

    /// Rejection reason text from a HSH|FIN payload.
    pub fn reject_reason(&self) -> String {
        String::from_utf8_lossy(self.payload()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let h = Header {
            flag: Flags::new(flags::DAT | flags::MFR),
            seq: 0xDEADBEEF,
            total_len: 1500,
            frag_offset: 700,
            frag_index: 3,
            sid: 0x01020304,
            data_len: 123,
        };
        let buf = h.encode();
        assert_eq!(Header::decode(&buf).unwrap(), h);
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(matches!(
            Packet::decode(&[0u8; 10]),
            Err(Error::PacketTooShort(10))
        ));
    }

    #[test]
    fn decode_rejects_lying_data_len() {
        let mut buf = Header {
            data_len: 500,
            ..Header::default()
        }
        .encode()
        .to_vec();
        buf.extend_from_slice(&[0u8; 4]);
        assert!(matches!(
            Packet::decode(&buf),
            Err(Error::LengthMismatch { expected: 516, .. })
        ));
    }

    #[test]
    fn noise_is_dropped_on_decode() {
        let mut p = Packet::data(7, 42, vec![9, 9, 9]);
        p.add_noise(20);
        let wire = p.wire().to_vec();
        assert_eq!(wire.len(), HDR_LEN + 3 + 20);
        let back = Packet::decode(&wire).unwrap();
        assert_eq!(back.payload(), &[9, 9, 9]);
        assert_eq!(back.noise_len(), 0);
    }

    #[test]
    fn frame_buffer_serializes_in_place() {
        let mut buf = vec![0u8; HDR_LEN];
        buf.extend_from_slice(b"ip frame bytes");
        let mut p = Packet::from_frame(buf);
        p.header.seq = 99;
        let wire = p.wire();
        assert_eq!(&wire[HDR_LEN..], b"ip frame bytes");
        let h = Header::decode(wire).unwrap();
        assert_eq!(h.seq, 99);
        assert_eq!(h.data_len, 14);
    }

    #[test]
    fn wire_rewrites_header_after_edit() {
        let mut p = Packet::data(1, 0, vec![5; 8]);
        let _ = p.wire();
        p.header.seq = 2;
        let h = Header::decode(p.wire()).unwrap();
        assert_eq!(h.seq, 2);
    }

    #[test]
    fn handshake_reply_payload_round_trip() {
        let p = Packet::handshake_reply(Ipv4Addr::new(10, 1, 1, 5), 24);
        let (ver, ip, mask) = p.handshake_reply_payload().unwrap();
        assert_eq!(ver, PROTO_VERSION);
        assert_eq!(ip, Ipv4Addr::new(10, 1, 1, 5));
        assert_eq!(mask, 24);
    }

    #[test]
    fn sid_payload_round_trip() {
        assert_eq!(Packet::knock(0xCAFEBABE).sid_payload().unwrap(), 0xCAFEBABE);
        assert!(Packet::heartbeat().sid_payload().is_err());
    }
}
