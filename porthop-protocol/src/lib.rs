//! Porthop protocol implementation.
//!
//! A UDP-based VPN protocol with port hopping: IP frames from a virtual
//! interface are packed into an encrypted, compressible, fragmentable wire
//! format and spread across a range of UDP ports. This crate holds the
//! protocol core only; socket and interface loops live in `porthop-engine`.
//!
//! ```rust
//! use porthop_protocol::{Cipher, Packet};
//!
//! let cipher = Cipher::new(b"pre-shared-key");
//! let mut packet = Packet::data(1, 0xAABBCCDD, vec![1, 2, 3]);
//! let wire = cipher.seal(&mut packet).unwrap();
//! let back = cipher.open(&wire).unwrap();
//! assert_eq!(back.payload(), &[1, 2, 3]);
//! ```

mod crypto;
mod error;
pub mod flags;
mod fragment;
mod morph;
mod packet;
mod pool;
mod session;
pub mod transport;

pub use crypto::Cipher;
pub use error::{Error, Result};
pub use flags::Flags;
pub use fragment::{fragmentate, Reassembler, FRAG_THRESHOLD, MAX_FRAGMENTS, STALE_AFTER};
pub use morph::{FixedMorpher, Morpher, RandMorpher};
pub use packet::{Header, Packet, HDR_LEN};
pub use pool::Ipv4Pool;
pub use session::{route_key, SessionId, SessionState};

/// Protocol version byte carried in the handshake hello.
pub const PROTO_VERSION: u8 = 0x01;

/// Default tunnel MTU.
pub const DEFAULT_MTU: usize = 1400;

/// Buffer size for interface and socket reads.
pub const IFACE_BUFSIZE: usize = 2000;
