//! Key exchange.

use super::GUID;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

/// Generate a fresh `Sec-WebSocket-Key`: 16 random bytes, base64.
#[inline]
pub fn new_sec_key() -> [u8; 24] {
    let nonce: [u8; 16] = rand::random();
    let mut output = [0_u8; 24];
    STANDARD.encode_slice(nonce, &mut output).unwrap();
    output
}

/// Derive the `Sec-WebSocket-Accept` value for a client's key.
///
/// SHA-1 over the key immediately followed by the protocol GUID, then
/// base64. The output buffers are exact-size, so the encode cannot fail.
#[inline]
pub fn derive_accept_key(sec_key: &[u8]) -> [u8; 28] {
    let mut sha1 = Sha1::new();
    sha1.update(sec_key);
    sha1.update(GUID);
    let digest = sha1.finalize();

    let mut output = [0_u8; 28];
    STANDARD.encode_slice(digest, &mut output).unwrap();
    output
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn accept_key_known_vector() {
        assert_eq!(
            &derive_accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_valid_base64() {
        for _ in 0..256 {
            let key = new_sec_key();
            let nonce = STANDARD.decode(key).unwrap();
            assert_eq!(nonce.len(), 16);
        }
    }

    #[test]
    fn encoded_length_and_round_trip() {
        // the padded output is always 4 bytes per started triple, and
        // decoding must reconstruct the input exactly
        let mut rng = thread_rng();
        for len in 0..128_usize {
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let encoded = STANDARD.encode(&data);
            assert_eq!(encoded.len(), 4 * ((len + 2) / 3));
            assert_eq!(STANDARD.decode(&encoded).unwrap(), data);
        }
    }
}
