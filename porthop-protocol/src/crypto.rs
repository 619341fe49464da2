//! Cipher envelope: Snappy compression inside AES-256-CBC.
//!
//! Wire layout is `IV(16) || AES-CBC(pkcs7(snappy(plaintext)))`. A fresh
//! random IV is drawn per datagram. The pre-shared key is PKCS#5-padded to
//! 32 bytes once at construction; there is no per-session keying and no
//! authentication tag.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{thread_rng, Rng};

use crate::error::{Error, Result};
use crate::packet::Packet;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const BLOCK: usize = 16;

/// Pads a pre-shared key to `KEY_LEN` bytes, PKCS#5 style: the fill byte is
/// the number of bytes added. Longer keys are truncated.
fn pad_key(key: &[u8]) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    if key.len() >= KEY_LEN {
        out.copy_from_slice(&key[..KEY_LEN]);
    } else {
        out[..key.len()].copy_from_slice(key);
        let fill = (KEY_LEN - key.len()) as u8;
        for b in &mut out[key.len()..] {
            *b = fill;
        }
    }
    out
}

pub struct Cipher {
    key: [u8; KEY_LEN],
}

impl Cipher {
    pub fn new(key: &[u8]) -> Cipher {
        Cipher { key: pad_key(key) }
    }

    /// Serializes and envelopes a packet for the wire.
    pub fn seal(&self, packet: &mut Packet) -> Result<Vec<u8>> {
        self.encrypt(packet.wire())
    }

    /// Opens a received datagram and decodes the packet inside.
    pub fn open(&self, data: &[u8]) -> Result<Packet> {
        let plain = self.decrypt(data)?;
        Packet::decode(&plain)
    }

    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let compressed = snap::raw::Encoder::new().compress_vec(plain)?;
        let mut iv = [0u8; IV_LEN];
        thread_rng().fill(&mut iv[..]);
        let ct = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(&compressed);
        let mut out = Vec::with_capacity(IV_LEN + ct.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < IV_LEN + BLOCK || (data.len() - IV_LEN) % BLOCK != 0 {
            return Err(Error::Decrypt(format!(
                "ciphertext length {} is not iv + whole blocks",
                data.len()
            )));
        }
        let (iv, ct) = data.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| {
            Error::Decrypt("bad iv".into())
        })?;
        let compressed = Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ct)
            .map_err(|e| Error::Decrypt(e.to_string()))?;
        Ok(snap::raw::Decoder::new().decompress_vec(&compressed)?)
    }
}
