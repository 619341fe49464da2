//! Packet size morphing.
//!
//! A morpher hints the next on-wire fragment size so traffic does not show
//! a constant MTU-sized profile. The fragmenter treats the hint loosely;
//! see `fragment`.

use rand::{thread_rng, Rng};

pub trait Morpher: Send {
    /// Size hint for the next fragment, in payload bytes.
    fn next_packet_size(&mut self) -> usize;
}

/// Always returns the same size. Used when morphing is off and in tests.
pub struct FixedMorpher {
    size: usize,
}

impl FixedMorpher {
    pub fn new(size: usize) -> FixedMorpher {
        FixedMorpher { size }
    }
}

impl Morpher for FixedMorpher {
    fn next_packet_size(&mut self) -> usize {
        self.size
    }
}

/// Uniform random sizes in `[max/2, max]`.
pub struct RandMorpher {
    max: usize,
}

impl RandMorpher {
    pub fn new(max: usize) -> RandMorpher {
        RandMorpher { max: max.max(2) }
    }
}

impl Morpher for RandMorpher {
    fn next_packet_size(&mut self) -> usize {
        thread_rng().gen_range(self.max / 2..=self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_is_fixed() {
        let mut m = FixedMorpher::new(500);
        assert_eq!(m.next_packet_size(), 500);
        assert_eq!(m.next_packet_size(), 500);
    }

    #[test]
    fn rand_stays_in_band() {
        let mut m = RandMorpher::new(1400);
        for _ in 0..100 {
            let s = m.next_packet_size();
            assert!((700..=1400).contains(&s));
        }
    }
}
