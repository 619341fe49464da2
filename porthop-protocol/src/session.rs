//! Session identity and lifecycle state.
//!
//! The client picks a random 32-bit session id. The server's peer table is
//! keyed by 64-bit values: the session id shifted into the upper half, and
//! an alias derived from the assigned tunnel IP in the lower half. The two
//! key spaces cannot collide because an IPv4 address never has the upper
//! 32 bits set.

use std::fmt;
use std::net::Ipv4Addr;

use rand::{thread_rng, Rng};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

impl SessionId {
    pub fn random() -> SessionId {
        SessionId(thread_rng().gen())
    }

    /// Peer-table key for this session.
    pub fn session_key(self) -> u64 {
        (self.0 as u64) << 32
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Peer-table alias key for a tunnel IP.
pub fn route_key(ip: Ipv4Addr) -> u64 {
    u32::from(ip) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Init = 0,
    Handshake = 1,
    Working = 2,
    Fin = 3,
}

impl SessionState {
    pub fn from_u8(v: u8) -> SessionState {
        match v {
            1 => SessionState::Handshake,
            2 => SessionState::Working,
            3 => SessionState::Fin,
            _ => SessionState::Init,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Init => "INIT",
            SessionState::Handshake => "HANDSHAKE",
            SessionState::Working => "WORKING",
            SessionState::Fin => "FIN",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_spaces_are_disjoint() {
        let sid = SessionId(1);
        assert_eq!(sid.session_key(), 1u64 << 32);
        let rk = route_key(Ipv4Addr::new(255, 255, 255, 255));
        assert!(rk < 1u64 << 32);
        assert_ne!(sid.session_key(), rk);
    }

    #[test]
    fn random_ids_live_in_the_session_key_space() {
        let sid = SessionId::random();
        assert_eq!(sid.session_key() & 0xFFFF_FFFF, 0);
        assert_eq!((sid.session_key() >> 32) as u32, sid.0);
    }

    #[test]
    fn state_round_trip() {
        for s in [
            SessionState::Init,
            SessionState::Handshake,
            SessionState::Working,
            SessionState::Fin,
        ] {
            assert_eq!(SessionState::from_u8(s.as_u8()), s);
        }
        assert_eq!(SessionState::from_u8(200), SessionState::Init);
    }
}
