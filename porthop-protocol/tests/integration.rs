//! End-to-end protocol pipeline: fragment, envelope, decode, reassemble.

use porthop_protocol::{
    fragmentate, Cipher, FixedMorpher, Packet, RandMorpher, Reassembler, MAX_FRAGMENTS,
};

fn frame(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i * 7 % 256) as u8).collect()
}

#[test]
fn fragmented_frame_survives_the_wire() {
    let cipher = Cipher::new(b"integration key");
    let data = frame(5000);
    let mut morpher = FixedMorpher::new(1400);

    let mut on_wire: Vec<Vec<u8>> = fragmentate(11, 0xBEEF0000, &data, &mut morpher)
        .into_iter()
        .map(|mut p| cipher.seal(&mut p).expect("seal"))
        .collect();
    // datagrams arrive in any order
    on_wire.reverse();

    let mut reassembler = Reassembler::new();
    let mut frames = Vec::new();
    for datagram in on_wire {
        let packet = cipher.open(&datagram).expect("open");
        frames.extend(reassembler.reassemble(vec![packet]));
    }
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload(), &data[..]);
    assert_eq!(reassembler.pending(), 0);
}

#[test]
fn random_morphing_never_exceeds_the_cap() {
    let data = frame(20_000);
    let mut morpher = RandMorpher::new(1400);
    let packets = fragmentate(1, 0, &data, &mut morpher);
    assert!(packets.len() <= MAX_FRAGMENTS);
    let covered: usize = packets.iter().map(|p| p.header.data_len as usize).sum();
    assert_eq!(covered, 20_000);
}

#[test]
fn noise_padding_does_not_leak_into_the_frame() {
    let cipher = Cipher::new(b"k");
    let data = frame(900);
    // hint far above the frame size forces padding on the single fragment
    let mut morpher = FixedMorpher::new(1400);
    let mut packets = fragmentate(5, 0, &data, &mut morpher);
    assert_eq!(packets.len(), 1);
    assert!(packets[0].noise_len() > 0);

    let wire = cipher.seal(&mut packets[0]).expect("seal");
    let back = cipher.open(&wire).expect("open");
    assert_eq!(back.payload(), &data[..]);
}

#[test]
fn interleaved_frames_reassemble_independently() {
    let a = frame(3000);
    let b = frame(4000);
    let mut morpher = FixedMorpher::new(1000);
    let mut mixed = Vec::new();
    let fa = fragmentate(100, 0, &a, &mut morpher);
    let fb = fragmentate(200, 0, &b, &mut morpher);
    for (x, y) in fa.iter().zip(fb.iter()) {
        mixed.push(x.clone());
        mixed.push(y.clone());
    }
    mixed.extend(fb.iter().skip(fa.len()).cloned());

    let mut r = Reassembler::new();
    let done = r.reassemble(mixed);
    assert_eq!(done.len(), 2);
    let mut payloads: Vec<&[u8]> = done.iter().map(Packet::payload).collect();
    payloads.sort_by_key(|p| p.len());
    assert_eq!(payloads[0], &a[..]);
    assert_eq!(payloads[1], &b[..]);
    assert_eq!(r.pending(), 0);
}

#[test]
fn tampered_datagram_is_rejected() {
    let cipher = Cipher::new(b"k");
    let mut p = Packet::data(1, 0, frame(100));
    let mut wire = cipher.seal(&mut p).expect("seal");
    let last = wire.len() - 1;
    wire[last] ^= 0xFF;
    assert!(cipher.open(&wire).is_err());
}
