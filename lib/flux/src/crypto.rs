//! Per-session pluggable stream ciphers. Every adapter operates on a contiguous byte slice
//! in place and must never change its length — the wire header's size field is computed before
//! encryption and must still describe the buffer afterwards.
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;

pub const KEY_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;

type Aes128Ctr = Ctr128BE<aes::Aes128>;

/// A per-session stream cipher. `nonce` is the session's current send/recv sequence number so
/// that replaying the same plaintext at a different point in the stream never reuses keystream.
pub trait EncryptionAdapter: Send + Sync {
    fn encrypt(&self, buf: &mut [u8], nonce: u64);
    fn decrypt(&self, buf: &mut [u8], nonce: u64);
}

/// No encryption; used when the configuration selects `encryption = "none"`.
pub struct NoneCipher;

impl EncryptionAdapter for NoneCipher {
    #[inline]
    fn encrypt(&self, _buf: &mut [u8], _nonce: u64) {}
    #[inline]
    fn decrypt(&self, _buf: &mut [u8], _nonce: u64) {}
}

/// A keystream xor cipher. Cheap, not cryptographically strong, useful for obfuscating traffic
/// against casual packet inspection without paying for AES.
pub struct XorCipher {
    key: Vec<u8>,
}

impl XorCipher {
    pub fn new(key: Vec<u8>) -> Self {
        assert!(!key.is_empty(), "xor cipher key must not be empty");
        XorCipher { key }
    }

    #[inline]
    fn apply(&self, buf: &mut [u8], nonce: u64) {
        let nonce_bytes = nonce.to_le_bytes();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= self.key[i % self.key.len()] ^ nonce_bytes[i % nonce_bytes.len()];
        }
    }
}

impl EncryptionAdapter for XorCipher {
    #[inline]
    fn encrypt(&self, buf: &mut [u8], nonce: u64) {
        self.apply(buf, nonce)
    }

    #[inline]
    fn decrypt(&self, buf: &mut [u8], nonce: u64) {
        self.apply(buf, nonce)
    }
}

/// AES-128-CTR, the production stream cipher. The nonce is folded into the low 8 bytes of the
/// IV so each message in the stream is encrypted under a distinct counter, matching the way the
/// session advances its send/recv sequence number by exactly one per message.
pub struct AesCipher {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl AesCipher {
    pub fn new(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        AesCipher { key, iv }
    }

    fn keystream_for(&self, nonce: u64) -> Aes128Ctr {
        let mut iv = self.iv;
        let nonce_bytes = nonce.to_be_bytes();
        for (i, b) in nonce_bytes.iter().enumerate() {
            iv[IV_SIZE - 8 + i] ^= b;
        }
        Aes128Ctr::new((&self.key).into(), (&iv).into())
    }
}

impl EncryptionAdapter for AesCipher {
    #[inline]
    fn encrypt(&self, buf: &mut [u8], nonce: u64) {
        self.keystream_for(nonce).apply_keystream(buf);
    }

    #[inline]
    fn decrypt(&self, buf: &mut [u8], nonce: u64) {
        // CTR mode is its own inverse.
        self.keystream_for(nonce).apply_keystream(buf);
    }
}

/// Fills `out` with cryptographically secure random bytes; used to mint UDP tokens and session keys.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    rand::thread_rng().fill_bytes(out);
}

/// Builds the adapter selected by the `encryption` configuration field.
pub fn build_adapter(kind: &str, key: &[u8], iv: &[u8]) -> Box<dyn EncryptionAdapter> {
    match kind {
        "none" => Box::new(NoneCipher),
        "xor" => Box::new(XorCipher::new(key.to_vec())),
        "aes" => {
            let mut k = [0u8; KEY_SIZE];
            let mut v = [0u8; IV_SIZE];
            let klen = key.len().min(KEY_SIZE);
            let vlen = iv.len().min(IV_SIZE);
            k[..klen].copy_from_slice(&key[..klen]);
            v[..vlen].copy_from_slice(&iv[..vlen]);
            Box::new(AesCipher::new(k, v))
        }
        other => panic!("unknown encryption kind: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_round_trips_without_changing_length() {
        let cipher = AesCipher::new([7u8; KEY_SIZE], [3u8; IV_SIZE]);
        let original = b"the quick brown fox jumps".to_vec();
        let mut buf = original.clone();

        cipher.encrypt(&mut buf, 42);
        assert_eq!(buf.len(), original.len());
        assert_ne!(buf, original);

        cipher.decrypt(&mut buf, 42);
        assert_eq!(buf, original);
    }

    #[test]
    fn aes_distinct_nonces_produce_distinct_ciphertext() {
        let cipher = AesCipher::new([1u8; KEY_SIZE], [2u8; IV_SIZE]);
        let plain = b"identical plaintext payload".to_vec();

        let mut a = plain.clone();
        let mut b = plain.clone();
        cipher.encrypt(&mut a, 1);
        cipher.encrypt(&mut b, 2);

        assert_ne!(a, b);
    }

    #[test]
    fn xor_round_trips() {
        let cipher = XorCipher::new(vec![1, 2, 3, 4]);
        let original = b"round trip me please".to_vec();
        let mut buf = original.clone();

        cipher.encrypt(&mut buf, 9);
        assert_ne!(buf, original);
        cipher.decrypt(&mut buf, 9);
        assert_eq!(buf, original);
    }

    #[test]
    fn none_cipher_is_identity() {
        let cipher = NoneCipher;
        let original = b"plaintext".to_vec();
        let mut buf = original.clone();
        cipher.encrypt(&mut buf, 0);
        assert_eq!(buf, original);
    }
}
