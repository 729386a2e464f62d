//! Content fingerprints for Strata.
//!
//! Every tracked file is fingerprinted with SHA-256 over its raw bytes; the
//! manifest format stores digests as lowercase hex. This crate provides the
//! digest value type, a multi-step [`Context`], and an [`AsyncWrite`] sink
//! that hashes and counts a byte stream in one pass.
//!
//! [`AsyncWrite`]: tokio::io::AsyncWrite

use std::fmt as sfmt;
use std::str::FromStr;

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest;
use thiserror::Error;

/// Size in bytes of a SHA-256 digest.
pub const DIGEST_SIZE: usize = 32;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum ParseHashError {
    #[error("hash has wrong length {0} != {expected}", expected = 2 * DIGEST_SIZE)]
    WrongLength(usize),

    #[error("hash contains non-hex characters: {0:?}")]
    NotHex(String),
}

/// A SHA-256 content fingerprint.
///
/// Displayed, serialized, and parsed as 64 lowercase hex characters, the
/// representation the manifest format uses.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct Sha256([u8; DIGEST_SIZE]);

impl Sha256 {
    pub const fn new(digest: [u8; DIGEST_SIZE]) -> Self {
        Self(digest)
    }

    pub fn from_slice(digest: &[u8]) -> Result<Self, ParseHashError> {
        let data: [u8; DIGEST_SIZE] = digest
            .try_into()
            .map_err(|_| ParseHashError::WrongLength(2 * digest.len()))?;
        Ok(Self(data))
    }

    /// Returns the digest of `data`.
    ///
    /// ```
    /// # use strata_utils_hash::Sha256;
    /// let hash = Sha256::digest("abc");
    ///
    /// assert_eq!(
    ///     "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
    ///     hash.to_string()
    /// );
    /// ```
    pub fn digest<B: AsRef<[u8]>>(data: B) -> Self {
        let mut ctx = Context::new();
        ctx.update(data);
        ctx.finish()
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The first `n` hex characters of the digest, used for content-derived
    /// transaction ids.
    pub fn hex_prefix(&self, n: usize) -> String {
        let mut hex = HEXLOWER.encode(&self.0);
        hex.truncate(n);
        hex
    }
}

impl AsRef<[u8]> for Sha256 {
    fn as_ref(&self) -> &[u8] {
        self.digest_bytes()
    }
}

impl sfmt::Display for Sha256 {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl sfmt::Debug for Sha256 {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        write!(f, "Sha256({self})")
    }
}

impl FromStr for Sha256 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2 * DIGEST_SIZE {
            return Err(ParseHashError::WrongLength(s.len()));
        }
        let bytes = HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(|_| ParseHashError::NotHex(s.to_owned()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Sha256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Sha256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A context for multi-step (Init-Update-Finish) digest calculation.
///
/// # Examples
///
/// ```
/// use strata_utils_hash::{Context, Sha256};
///
/// let one_shot = Sha256::digest("hello, world");
///
/// let mut ctx = Context::new();
/// ctx.update("hello");
/// ctx.update(", ");
/// ctx.update("world");
/// let multi_step = ctx.finish();
///
/// assert_eq!(one_shot, multi_step);
/// ```
#[derive(Clone)]
pub struct Context(sha2::Sha256);

impl Context {
    pub fn new() -> Self {
        Self(sha2::Sha256::new())
    }

    /// Update the digest with all the data in `data`.
    /// `update` may be called zero or more times before `finish` is called.
    pub fn update<D: AsRef<[u8]>>(&mut self, data: D) {
        self.0.update(data.as_ref());
    }

    /// Finalizes the digest calculation and returns the [`Sha256`] value.
    /// This consumes the context to prevent misuse.
    pub fn finish(self) -> Sha256 {
        Sha256(self.0.finalize().into())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl sfmt::Debug for Context {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        f.debug_tuple("Context").finish()
    }
}

/// A hash sink that implements [`AsyncWrite`].
///
/// # Examples
///
/// ```
/// use tokio::io;
/// use strata_utils_hash::{HashSink, Sha256};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> std::io::Result<()> {
/// let mut reader: &[u8] = b"hello, world";
/// let mut sink = HashSink::new();
///
/// io::copy(&mut reader, &mut sink).await?;
/// let (size, hash) = sink.finish();
///
/// assert_eq!(Sha256::digest("hello, world"), hash);
/// assert_eq!(12, size);
/// # Ok(())
/// # }
/// ```
///
/// [`AsyncWrite`]: tokio::io::AsyncWrite
#[derive(Debug)]
pub struct HashSink(Option<(u64, Context)>);

impl HashSink {
    pub fn new() -> HashSink {
        HashSink(Some((0, Context::new())))
    }

    /// Finalizes this sink and returns the number of bytes written and the hash.
    pub fn finish(self) -> (u64, Sha256) {
        let (read, ctx) = self.0.expect("HashSink already finished");
        (read, ctx.finish())
    }
}

impl Default for HashSink {
    fn default() -> Self {
        Self::new()
    }
}

impl tokio::io::AsyncWrite for HashSink {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.0.as_mut() {
            None => {
                return std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "cannot write to HashSink after calling finish()",
                )));
            }
            Some((read, ctx)) => {
                *read += buf.len() as u64;
                ctx.update(buf)
            }
        }
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod unittests {
    use hex_literal::hex;
    use rstest::rstest;

    use super::*;

    /// value taken from: https://tools.ietf.org/html/rfc4634
    const SHA256_ABC: Sha256 = Sha256::new(hex!(
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    ));
    /// value taken from: https://tools.ietf.org/html/rfc4634
    const SHA256_LONG: Sha256 = Sha256::new(hex!(
        "248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1"
    ));

    #[rstest]
    #[case::abc(&SHA256_ABC, "abc")]
    #[case::long(&SHA256_LONG, "abcdbcdecdefdefgefghfghighijhijkijkljklmklmnlmnomnopnopq")]
    fn test_digest(#[case] expected: &Sha256, #[case] input: &str) {
        assert_eq!(Sha256::digest(input), *expected);
    }

    #[test]
    fn empty_input_has_distinct_digest() {
        // Zero-byte files must hash to a real digest, not read as absent.
        let empty = Sha256::digest("");
        assert_eq!(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            empty.to_string()
        );
        assert_ne!(empty, Sha256::digest("\0"));
    }

    #[rstest]
    #[case::too_short("abc")]
    #[case::not_hex("zz7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")]
    fn parse_rejects(#[case] input: &str) {
        assert!(input.parse::<Sha256>().is_err());
    }

    #[test]
    fn parse_roundtrip() {
        let parsed: Sha256 = SHA256_ABC.to_string().parse().unwrap();
        assert_eq!(parsed, SHA256_ABC);
    }

    #[test]
    fn parse_accepts_uppercase() {
        let upper = SHA256_ABC.to_string().to_ascii_uppercase();
        assert_eq!(upper.parse::<Sha256>().unwrap(), SHA256_ABC);
    }

    #[test]
    fn hex_prefix_truncates() {
        assert_eq!(SHA256_ABC.hex_prefix(8), "ba7816bf");
    }

    #[test]
    fn serde_roundtrip_as_hex_string() {
        let json = serde_json::to_value(SHA256_ABC).unwrap();
        assert_eq!(
            json.as_str().unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let back: Sha256 = serde_json::from_value(json).unwrap();
        assert_eq!(back, SHA256_ABC);
    }

    #[tokio::test]
    async fn hash_sink_counts_and_hashes() {
        let mut reader: &[u8] = b"abc";
        let mut sink = HashSink::new();
        tokio::io::copy(&mut reader, &mut sink).await.unwrap();
        let (size, hash) = sink.finish();
        assert_eq!(size, 3);
        assert_eq!(hash, SHA256_ABC);
    }
}
