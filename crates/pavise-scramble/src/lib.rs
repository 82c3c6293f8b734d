//! Per-connection stream obfuscation.
//!
//! When the scramble option is enabled, both ends of a connection begin by
//! exchanging a burst of pseudo-random *noise* whose length is hidden
//! inside the noise itself.  Each side derives a pair of 128-bit keys by
//! hashing the two noise bursts (XXH3-128), and from then on every byte on
//! the wire is XOR-combined with a rolling keystream.  The goal is not
//! cryptographic secrecy; it is to keep the byte stream free of any
//! recognizable protocol signature.
//!
//! Layering order on a connection is fixed: TCP, then scramble, then
//! (optionally) TLS, then the proxied protocol.  The noise handshake runs
//! once, immediately after TCP establishment and strictly before any
//! protocol byte.
//!
//! # Noise framing
//!
//! A noise burst is `len` bytes, `MIN_NOISE_LEN <= len <= max_len`.  The
//! first four bytes are a masked header: bytes 2 and 3 are random, and
//! bytes 0 and 1 are `len` XOR-folded onto them
//! (`b0 = b2 ^ (len >> 8)`, `b1 = b3 ^ (len & 0xFF)`), so the header is
//! indistinguishable from the random payload that follows.  The first
//! byte can additionally be constrained to avoid a caller-supplied filter
//! set, so that a listener can still tell noise apart from the protocols
//! it serves directly.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![warn(clippy::cognitive_complexity)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unwrap_used)]

use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

mod stream;

pub use stream::ScrambleStream;

/// Shortest noise burst we will ever send or accept.
pub const MIN_NOISE_LEN: usize = 4;

/// Longest noise burst we will ever accept.
pub const MAX_NOISE_LEN: usize = 0x7FFF;

/// An error from the noise handshake.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer's noise header declared an impossible length.
    #[error("peer noise length {0} is out of range")]
    BadNoiseLength(usize),

    /// I/O failed while exchanging noise.
    #[error("I/O error during noise handshake")]
    Io(#[from] std::io::Error),
}

/// Generate a noise burst of a random length up to `max_len`.
///
/// The first byte is guaranteed not to be in `first_byte_filter`, so a
/// listener that also serves unscrambled protocols can still dispatch on
/// the first byte.
pub fn generate_noise(max_len: u16, first_byte_filter: &[u8]) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let max_len = (usize::from(max_len)).clamp(MIN_NOISE_LEN, MAX_NOISE_LEN);
    let len = rng.gen_range(MIN_NOISE_LEN..=max_len);

    let mut data = vec![0_u8; len];
    rng.fill(&mut data[..]);

    // Fold the length onto the two random mask bytes.
    data[0] = data[2] ^ (len >> 8) as u8;
    data[1] = data[3] ^ (len & 0xFF) as u8;

    // Re-roll the mask until the visible first byte clears the filter.
    while first_byte_filter.contains(&data[0]) {
        data[2] = rng.gen();
        data[0] = data[2] ^ (len >> 8) as u8;
    }

    data
}

/// Recover the total length of a peer's noise burst from its first bytes.
///
/// Returns `None` until at least four bytes are available.
pub fn recover_length(prefix: &[u8]) -> Option<Result<usize, Error>> {
    if prefix.len() < 4 {
        return None;
    }
    let len = usize::from(prefix[0] ^ prefix[2]) << 8 | usize::from(prefix[1] ^ prefix[3]);
    if !(MIN_NOISE_LEN..=MAX_NOISE_LEN).contains(&len) {
        return Some(Err(Error::BadNoiseLength(len)));
    }
    Some(Ok(len))
}

/// Derive a 16-byte scramble key from a noise burst.
///
/// XXH3-128 of the data; high half first, each half in little-endian byte
/// order.
pub fn compute_key(data: &[u8]) -> [u8; 16] {
    let digest = xxhash_rust::xxh3::xxh3_128(data);
    let high = (digest >> 64) as u64;
    let low = digest as u64;
    let mut key = [0_u8; 16];
    key[..8].copy_from_slice(&high.to_le_bytes());
    key[8..].copy_from_slice(&low.to_le_bytes());
    key
}

/// The rolling XOR keystream.
///
/// Each processed byte consumes one key byte; when the key is exhausted it
/// is replaced by `compute_key` of itself, so the keystream never repeats
/// with a 16-byte period.
#[derive(Clone, Debug)]
pub struct ScrambleCodec {
    /// Current key material.
    key: [u8; 16],
    /// Next key byte to use.
    pos: usize,
}

impl ScrambleCodec {
    /// Create a codec from a derived key.
    pub fn new(key: [u8; 16]) -> Self {
        ScrambleCodec { key, pos: 0 }
    }

    /// Transform `data` in place.  Scrambling and unscrambling are the
    /// same operation; what matters is that the two directions of a
    /// connection use independent codecs.
    pub fn apply(&mut self, data: &mut [u8]) {
        for b in data {
            *b ^= self.key[self.pos];
            self.pos += 1;
            if self.pos == self.key.len() {
                self.key = compute_key(&self.key);
                self.pos = 0;
            }
        }
    }
}

/// Both directions' keys, as produced by the noise handshake.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct NoiseKeys {
    /// Key for the bytes we write.
    pub write_key: [u8; 16],
    /// Key for the bytes we read.
    pub read_key: [u8; 16],
}

/// Run the noise handshake on a fresh connection.
///
/// Both sides send a burst and read the peer's; the key for each
/// direction is the hash of the noise its *writer* sent, so the two sides
/// agree without any further negotiation.  `first_byte_filter` constrains
/// our burst's first byte (pass the listener's protocol bytes on the
/// accept side; an empty slice elsewhere).
pub async fn noise_handshake<S>(
    stream: &mut S,
    noise_length: u16,
    first_byte_filter: &[u8],
) -> Result<NoiseKeys, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = generate_noise(noise_length, first_byte_filter);
    stream.write_all(&ours).await?;
    stream.flush().await?;

    let mut theirs = vec![0_u8; MIN_NOISE_LEN];
    stream.read_exact(&mut theirs).await?;
    let total = match recover_length(&theirs) {
        Some(r) => r?,
        None => unreachable!("four bytes always recover a length"),
    };
    theirs.resize(total, 0);
    stream.read_exact(&mut theirs[MIN_NOISE_LEN..]).await?;

    Ok(NoiseKeys {
        write_key: compute_key(&ours),
        read_key: compute_key(&theirs),
    })
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn noise_length_round_trips() {
        for _ in 0..200 {
            let noise = generate_noise(0x0FFF, &[]);
            assert_eq!(recover_length(&noise).unwrap().unwrap(), noise.len());
        }
    }

    #[test]
    fn first_byte_filter_is_respected() {
        let filter = [0x04, 0x05, 0x16, b'G', b'P', b'C'];
        for _ in 0..200 {
            let noise = generate_noise(256, &filter);
            assert!(!filter.contains(&noise[0]));
            assert_eq!(recover_length(&noise).unwrap().unwrap(), noise.len());
        }
    }

    #[test]
    fn tiny_max_still_works() {
        let noise = generate_noise(1, &[]);
        assert_eq!(noise.len(), MIN_NOISE_LEN);
    }

    #[test]
    fn bogus_length_is_rejected() {
        // A prefix whose folded length is zero.
        let prefix = [0xAA, 0xBB, 0xAA, 0xBB, 0x00];
        match recover_length(&prefix) {
            Some(Err(Error::BadNoiseLength(0))) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn compute_key_is_deterministic_and_sensitive() {
        let a = compute_key(b"some noise bytes");
        let b = compute_key(b"some noise bytes");
        let c = compute_key(b"some noise byteZ");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn codec_round_trips_across_rollover() {
        let key = compute_key(b"key material");
        let mut tx = ScrambleCodec::new(key);
        let mut rx = ScrambleCodec::new(key);

        let plain: Vec<u8> = (0..100_u8).cycle().take(1000).collect();
        let mut wire = plain.clone();
        // Scramble in uneven chunks so key rollover lands mid-chunk.
        for chunk in wire.chunks_mut(7) {
            tx.apply(chunk);
        }
        assert_ne!(wire, plain);
        for chunk in wire.chunks_mut(13) {
            rx.apply(chunk);
        }
        assert_eq!(wire, plain);
    }

    #[tokio::test]
    async fn handshake_agrees_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let (ka, kb) = tokio::join!(
            noise_handshake(&mut a, 0x0FFF, &[]),
            noise_handshake(&mut b, 0x0FFF, &[0x05]),
        );
        let ka = ka.unwrap();
        let kb = kb.unwrap();
        assert_eq!(ka.write_key, kb.read_key);
        assert_eq!(ka.read_key, kb.write_key);
    }
}
