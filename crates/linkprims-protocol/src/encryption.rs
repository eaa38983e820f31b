use bytes::BytesMut;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use rand::Rng;
use tracing::error;

use crate::args::Args;
use crate::error::{ProtocolError, Result};
use crate::protocol::{pass_empty, LinkInfo, Outcome, Protocol};

pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

/// Authenticated encryption of already framed buffers with
/// XChaCha20-Poly1305. Wire format: `nonce(24) ‖ tag(16) ‖ ciphertext`.
///
/// A frame that fails authentication disconnects the link.
pub struct EncryptionProtocol {
    cipher: XChaCha20Poly1305,
    allow_empty_data: Option<bool>,
    link_name: String,
}

impl std::fmt::Debug for EncryptionProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionProtocol")
            .field("link_name", &self.link_name)
            .finish_non_exhaustive()
    }
}

impl EncryptionProtocol {
    pub fn new(key: &[u8; KEY_SIZE], allow_empty_data: Option<bool>) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
            allow_empty_data,
            link_name: String::new(),
        }
    }

    /// Key given as 64 hex characters.
    pub fn from_hex_key(key: &str, allow_empty_data: Option<bool>) -> Result<Self> {
        let bytes = linkprims_packet::parser::hex_to_bytes(key)
            .filter(|bytes| bytes.len() == KEY_SIZE)
            .ok_or_else(|| {
                ProtocolError::invalid("ENCRYPTION", "key must be 64 hex characters")
            })?;
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(Self::new(&key, allow_empty_data))
    }

    /// `key allow_empty_data`
    pub fn from_args(values: &[String]) -> Result<Self> {
        let args = Args::new("ENCRYPTION", values, 2)?;
        Self::from_hex_key(args.required(0, "key")?, args.opt_flag(1, "allow_empty_data")?)
    }

    fn open(&self, data: &[u8]) -> Option<BytesMut> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return None;
        }
        let (nonce, rest) = data.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);
        let mut plaintext = BytesMut::from(ciphertext);
        self.cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(nonce),
                b"",
                &mut plaintext,
                Tag::from_slice(tag),
            )
            .ok()?;
        Some(plaintext)
    }
}

impl Protocol for EncryptionProtocol {
    fn name(&self) -> &'static str {
        "ENCRYPTION"
    }

    fn attach(&mut self, link: &LinkInfo) {
        self.link_name = link.name.clone();
    }

    fn allow_empty_data(&self) -> Option<bool> {
        self.allow_empty_data
    }

    fn read_data(&mut self, data: BytesMut, at_tail: bool) -> Result<Outcome<BytesMut>> {
        if data.is_empty() {
            return Ok(pass_empty(self.allow_empty_data, data, at_tail));
        }
        match self.open(&data) {
            Some(plaintext) => Ok(Outcome::Ready(plaintext)),
            None => {
                error!(
                    interface = %self.link_name,
                    length = data.len(),
                    "frame failed authentication"
                );
                Ok(Outcome::Disconnect)
            }
        }
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<Outcome<Vec<u8>>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill(&mut nonce);
        let mut ciphertext = data;
        let tag = self
            .cipher
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), b"", &mut ciphertext)
            .map_err(|err| ProtocolError::Cipher(err.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ciphertext);
        Ok(Outcome::Ready(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn sealed(protocol: &mut EncryptionProtocol, plaintext: &[u8]) -> Vec<u8> {
        let Outcome::Ready(wire) = protocol.write_data(plaintext.to_vec()).unwrap() else {
            panic!("expected data");
        };
        wire
    }

    #[test]
    fn test_seal_and_open() {
        let mut protocol = EncryptionProtocol::from_hex_key(KEY, None).unwrap();
        let wire = sealed(&mut protocol, b"NOOP");
        assert_eq!(wire.len(), NONCE_SIZE + TAG_SIZE + 4);
        assert_ne!(&wire[NONCE_SIZE + TAG_SIZE..], b"NOOP");
        assert_eq!(
            protocol.read_data(BytesMut::from(&wire[..]), true).unwrap(),
            Outcome::Ready(BytesMut::from(&b"NOOP"[..]))
        );
    }

    #[test]
    fn test_tampering_disconnects() {
        let mut protocol = EncryptionProtocol::from_hex_key(KEY, None).unwrap();
        let mut wire = sealed(&mut protocol, b"SAFE MODE");
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert_eq!(
            protocol.read_data(BytesMut::from(&wire[..]), true).unwrap(),
            Outcome::Disconnect
        );
        assert_eq!(
            protocol.read_data(BytesMut::from(&[0u8; 10][..]), true).unwrap(),
            Outcome::Disconnect
        );
    }

    #[test]
    fn test_wrong_key_disconnects() {
        let mut sender = EncryptionProtocol::from_hex_key(KEY, None).unwrap();
        let wire = sealed(&mut sender, b"x");
        let mut receiver = EncryptionProtocol::new(&[7u8; KEY_SIZE], None);
        assert_eq!(
            receiver.read_data(BytesMut::from(&wire[..]), true).unwrap(),
            Outcome::Disconnect
        );
    }

    #[test]
    fn test_key_validation() {
        assert!(EncryptionProtocol::from_hex_key("abcd", None).is_err());
        assert!(EncryptionProtocol::from_args(&[]).is_err());
    }
}
