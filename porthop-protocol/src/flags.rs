//! Packet flag byte.
//!
//! The first header byte classifies the message. `DAT` is the absence of
//! every other bit, so a pure data packet has a zero flag byte.

use std::fmt;

/// Knock / heartbeat.
pub const PSH: u8 = 0x80;
/// Handshake.
pub const HSH: u8 = 0x40;
/// Session teardown.
pub const FIN: u8 = 0x20;
/// More fragments follow.
pub const MFR: u8 = 0x08;
/// Acknowledgement modifier.
pub const ACK: u8 = 0x04;
/// Data packet: no bits set.
pub const DAT: u8 = 0x00;

/// Flag byte wrapper with explicit bit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const fn new(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn set(self, bit: u8) -> Self {
        Flags(self.0 | bit)
    }

    pub const fn clear(self, bit: u8) -> Self {
        Flags(self.0 & !bit)
    }

    pub const fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub const fn is_data(self) -> bool {
        self.0 & !MFR == DAT
    }
}

impl From<u8> for Flags {
    fn from(bits: u8) -> Self {
        Flags(bits)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == DAT {
            return write!(f, "DAT");
        }
        let mut first = true;
        for (bit, name) in [
            (PSH, "PSH"),
            (HSH, "HSH"),
            (FIN, "FIN"),
            (MFR, "MFR"),
            (ACK, "ACK"),
        ] {
            if self.has(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            // unknown bits only
            write!(f, "0x{:02x}", self.0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear() {
        let f = Flags::new(DAT).set(MFR);
        assert!(f.has(MFR));
        assert!(f.is_data());
        let f = f.clear(MFR);
        assert_eq!(f.bits(), DAT);
    }

    #[test]
    fn display_combinations() {
        assert_eq!(Flags::new(DAT).to_string(), "DAT");
        assert_eq!(Flags::new(PSH | ACK).to_string(), "PSH|ACK");
        assert_eq!(Flags::new(HSH | FIN).to_string(), "HSH|FIN");
        assert_eq!(Flags::new(DAT | MFR).to_string(), "MFR");
    }
}
