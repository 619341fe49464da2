//! Frame fragmentation and reassembly.
//!
//! Oversized interface frames are cut into at most [`MAX_FRAGMENTS`] pieces
//! whose sizes follow the morpher's hints. All fragments of a frame share
//! one sequence number; `frag_offset` places each piece inside the frame and
//! the MFR flag is set on every fragment but the last. The receiving side
//! collects fragments in a sequence-keyed cache and releases the frame once
//! every byte has arrived. Stale partial frames are dropped by `sweep`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::flags::{self, Flags};
use crate::morph::Morpher;
use crate::packet::Packet;

/// A fragment hint within this many bytes of the remainder ends the split.
pub const FRAG_THRESHOLD: isize = 32;

/// Hard cap on fragments per frame.
pub const MAX_FRAGMENTS: usize = 8;

/// Partial frames older than this are dropped by `sweep`.
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// Splits `frame` into fragments sized by the morpher's hints.
///
/// The split walks a prefix sum: each hint consumes its size from the
/// remainder unless the remainder is within [`FRAG_THRESHOLD`] of the hint,
/// in which case the last fragment takes everything; if it undershoots the
/// hint by more than the threshold, the gap is filled with noise so the
/// on-wire size still matches the hint. The fragment cap absorbs any
/// remainder into the final piece.
pub fn fragmentate(seq: u32, sid: u32, frame: &[u8], morpher: &mut dyn Morpher) -> Vec<Packet> {
    let frame_size = frame.len();
    let mut prefixes: Vec<usize> = Vec::with_capacity(MAX_FRAGMENTS);
    let mut prefix = 0usize;
    let mut padding = 0usize;
    let mut rest = frame_size;

    for i in 0..MAX_FRAGMENTS {
        let hint = morpher.next_packet_size().max(1);
        let delta = rest as isize - hint as isize;
        if delta < FRAG_THRESHOLD {
            if delta < -FRAG_THRESHOLD {
                padding = (-delta) as usize;
            }
            prefix += rest;
            prefixes.push(prefix);
            break;
        }
        if i == MAX_FRAGMENTS - 1 {
            prefix += rest;
        } else {
            prefix += hint;
            rest -= hint;
        }
        prefixes.push(prefix);
    }

    let count = prefixes.len();
    let mut packets = Vec::with_capacity(count);
    let mut start = 0usize;
    for (i, &end) in prefixes.iter().enumerate() {
        let mut p = Packet::data(seq, sid, frame[start..end].to_vec());
        p.header.flag = Flags::new(flags::DAT).set(flags::MFR);
        p.header.total_len = frame_size as u16;
        p.header.frag_offset = start as u16;
        p.header.frag_index = i as u8;
        start = end;
        packets.push(p);
    }
    if let Some(last) = packets.last_mut() {
        last.header.flag = last.header.flag.clear(flags::MFR);
        if padding > 0 {
            last.add_noise(padding);
        }
    }
    packets
}

struct Record {
    at: Instant,
    packet: Packet,
    received: usize,
}

/// Sequence-keyed fragment cache.
#[derive(Default)]
pub struct Reassembler {
    cache: HashMap<u32, Record>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler::default()
    }

    /// Feeds received data packets through the cache and returns the frames
    /// that are complete. Unfragmented packets pass through untouched.
    /// Fragments whose declared offset and length fall outside the declared
    /// frame size are dropped.
    pub fn reassemble(&mut self, incoming: Vec<Packet>) -> Vec<Packet> {
        let mut done = Vec::new();
        for packet in incoming {
            let h = packet.header;
            if h.data_len == h.total_len {
                done.push(packet);
                continue;
            }
            let offset = h.frag_offset as usize;
            let dlen = h.data_len as usize;
            let total = h.total_len as usize;
            if offset + dlen > total {
                continue;
            }
            let record = self.cache.entry(h.seq).or_insert_with(|| {
                let mut assembled = Packet::data(h.seq, h.sid, vec![0u8; total]);
                assembled.header.flag = Flags::new(flags::DAT).set(flags::MFR);
                Record {
                    at: Instant::now(),
                    packet: assembled,
                    received: 0,
                }
            });
            record.packet.payload_mut()[offset..offset + dlen]
                .copy_from_slice(&packet.payload()[..dlen]);
            record.received += dlen;
            if record.received >= total {
                let mut record = match self.cache.remove(&h.seq) {
                    Some(r) => r,
                    None => continue,
                };
                record.packet.header.flag = record.packet.header.flag.clear(flags::MFR);
                done.push(record.packet);
            }
        }
        done
    }

    /// Drops partial frames older than `max_age`.
    pub fn sweep(&mut self, max_age: Duration) {
        self.cache.retain(|_, r| r.at.elapsed() < max_age);
    }

    pub fn pending(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morph::FixedMorpher;

    fn frame(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn split_follows_hints() {
        let data = frame(5000);
        let mut m = FixedMorpher::new(1400);
        let packets = fragmentate(42, 7, &data, &mut m);
        assert_eq!(packets.len(), 4);
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.header.seq, 42);
            assert_eq!(p.header.total_len, 5000);
            assert_eq!(p.header.frag_index, i as u8);
            assert_eq!(p.header.flag.has(flags::MFR), i != 3);
        }
        assert_eq!(packets[3].header.frag_offset, 4200);
        assert_eq!(packets[3].header.data_len, 800);
        // last fragment undershoots the 1400 hint, filled with noise
        assert_eq!(packets[3].noise_len(), 600);
    }

    #[test]
    fn near_fit_makes_one_packet() {
        let data = frame(1390);
        let mut m = FixedMorpher::new(1400);
        let packets = fragmentate(1, 0, &data, &mut m);
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].header.flag.has(flags::MFR));
        assert_eq!(packets[0].header.data_len, 1390);
        assert_eq!(packets[0].noise_len(), 0);
    }

    #[test]
    fn fragment_cap_absorbs_remainder() {
        let data = frame(10_000);
        let mut m = FixedMorpher::new(1000);
        let packets = fragmentate(2, 0, &data, &mut m);
        assert_eq!(packets.len(), MAX_FRAGMENTS);
        let last = packets.last().unwrap();
        assert_eq!(
            last.header.frag_offset as usize + last.header.data_len as usize,
            10_000
        );
    }

    #[test]
    fn reassembles_out_of_order() {
        let data = frame(5000);
        let mut m = FixedMorpher::new(1400);
        let mut packets = fragmentate(9, 0, &data, &mut m);
        packets.reverse();
        let mut r = Reassembler::new();
        let mut done = Vec::new();
        for p in packets {
            done.extend(r.reassemble(vec![p]));
        }
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload(), &data[..]);
        assert!(!done[0].header.flag.has(flags::MFR));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn unfragmented_passes_through() {
        let mut r = Reassembler::new();
        let done = r.reassemble(vec![Packet::data(1, 0, vec![1, 2, 3])]);
        assert_eq!(done.len(), 1);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn out_of_bounds_fragment_is_dropped() {
        let mut evil = Packet::data(5, 0, vec![0xAA; 100]);
        evil.header.total_len = 50;
        evil.header.frag_offset = 0;
        let mut r = Reassembler::new();
        assert!(r.reassemble(vec![evil]).is_empty());
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn sweep_drops_stale_partials() {
        let data = frame(5000);
        let mut m = FixedMorpher::new(1400);
        let packets = fragmentate(3, 0, &data, &mut m);
        let mut r = Reassembler::new();
        r.reassemble(vec![packets[0].clone()]);
        assert_eq!(r.pending(), 1);
        r.sweep(Duration::from_secs(60));
        assert_eq!(r.pending(), 1);
        r.sweep(Duration::ZERO);
        assert_eq!(r.pending(), 0);
    }
}
