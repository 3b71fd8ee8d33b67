//! Decoder for the Logan encrypted log container.
//!
//! A container is a run of blocks laid out as
//! `[0x01][u32 big-endian length][ciphertext][optional 0x00]`. Each
//! ciphertext is AES-128-CBC over a compressed text chunk. Corrupt regions
//! are skipped by resynchronising on the next plausible block header, and a
//! block that fails to decrypt or inflate is counted and dropped.

use crate::model::DecodeStats;
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use cgmtrace_config::{ConfigError, DecoderConfig};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use std::io::Read;
use tracing::debug;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const BLOCK_MARKER: u8 = 0x01;
pub const BLOCK_TERMINATOR: u8 = 0x00;
const HEADER_LEN: usize = 5;
const AES_BLOCK_LEN: usize = 16;

#[derive(Clone)]
pub struct LoganCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl std::fmt::Debug for LoganCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoganCipher").finish_non_exhaustive()
    }
}

impl LoganCipher {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    pub fn from_config(cfg: &DecoderConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(cfg.key_bytes()?, cfg.iv_bytes()?))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_LEN != 0 {
            return None;
        }

        let mut buf = ciphertext.to_vec();
        let plain_len = Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .ok()?
            .len();
        buf.truncate(plain_len);
        strip_pkcs7(&mut buf);
        Some(buf)
    }
}

/// Output of [`decode_container`].
#[derive(Debug, Clone, Default)]
pub struct DecodeOutcome {
    pub lines: Vec<String>,
    pub stats: DecodeStats,
}

/// Decoded view of a raw log file, container or plaintext.
#[derive(Debug, Clone, Default)]
pub struct DecodedLog {
    pub container: bool,
    pub lines: Vec<String>,
    pub stats: DecodeStats,
}

fn read_block_len(bytes: &[u8], at: usize) -> Option<usize> {
    let header = bytes.get(at + 1..at + HEADER_LEN)?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    usize::try_from(len).ok()
}

/// Returns the body length of a plausible block header at `at`.
fn plausible_block(bytes: &[u8], at: usize) -> Option<usize> {
    if bytes.get(at) != Some(&BLOCK_MARKER) {
        return None;
    }
    let len = read_block_len(bytes, at)?;
    let remaining = bytes.len().saturating_sub(at + HEADER_LEN);
    if len == 0 || len > remaining {
        return None;
    }
    Some(len)
}

pub fn is_logan_container(bytes: &[u8]) -> bool {
    let Some(len) = plausible_block(bytes, 0) else {
        return false;
    };

    // Ciphertext is essentially never valid UTF-8, JSON text always is.
    let body = &bytes[HEADER_LEN..HEADER_LEN + len];
    let looks_like_json = std::str::from_utf8(body)
        .map(|text| text.trim_start().starts_with(['{', '[']))
        .unwrap_or(false);
    !looks_like_json
}

fn strip_pkcs7(buf: &mut Vec<u8>) {
    let Some(&pad) = buf.last() else {
        return;
    };
    let pad_len = pad as usize;
    if pad_len == 0 || pad_len > AES_BLOCK_LEN || pad_len > buf.len() {
        return;
    }
    if buf[buf.len() - pad_len..].iter().all(|b| *b == pad) {
        buf.truncate(buf.len() - pad_len);
    }
}

fn read_all(mut reader: impl Read) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).ok()?;
    Some(out)
}

/// Probes gzip, then zlib, then headerless deflate.
pub fn inflate(compressed: &[u8]) -> Option<Vec<u8>> {
    read_all(GzDecoder::new(compressed))
        .or_else(|| read_all(ZlibDecoder::new(compressed)))
        .or_else(|| read_all(DeflateDecoder::new(compressed)))
}

pub fn split_lines(text: &str) -> impl Iterator<Item = String> + '_ {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
}

fn decode_block(cipher: &LoganCipher, ciphertext: &[u8]) -> Option<Vec<String>> {
    let compressed = cipher.decrypt(ciphertext)?;
    let plain = inflate(&compressed)?;
    Some(split_lines(&String::from_utf8_lossy(&plain)).collect())
}

/// Scans every block of a container. Never fails; failures land in the stats.
pub fn decode_container(bytes: &[u8], cipher: &LoganCipher) -> DecodeOutcome {
    let mut outcome = DecodeOutcome::default();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let Some(len) = plausible_block(bytes, pos) else {
            pos += 1;
            continue;
        };

        let body_start = pos + HEADER_LEN;
        let body = &bytes[body_start..body_start + len];
        outcome.stats.blocks_attempted += 1;

        match decode_block(cipher, body) {
            Some(lines) => {
                outcome.stats.blocks_succeeded += 1;
                outcome.lines.extend(lines);
            }
            None => {
                outcome.stats.blocks_failed += 1;
                debug!("skipping undecodable logan block at offset {pos} ({len} bytes)");
            }
        }

        pos = body_start + len;
        if bytes.get(pos) == Some(&BLOCK_TERMINATOR) {
            pos += 1;
        }
    }

    outcome
}

/// Decodes a container when the bytes look like one, otherwise treats them as text.
pub fn decode_bytes(bytes: &[u8], cipher: &LoganCipher) -> DecodedLog {
    if is_logan_container(bytes) {
        let outcome = decode_container(bytes, cipher);
        return DecodedLog {
            container: true,
            lines: outcome.lines,
            stats: outcome.stats,
        };
    }

    DecodedLog {
        container: false,
        lines: split_lines(&String::from_utf8_lossy(bytes)).collect(),
        stats: DecodeStats::default(),
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{block, compress, encrypt, frame, Codec, IV, KEY};
    use super::*;

    fn cipher() -> LoganCipher {
        LoganCipher::new(KEY, IV)
    }

    #[test]
    fn decodes_each_compression_variant() {
        for codec in [Codec::Gzip, Codec::Zlib, Codec::Deflate] {
            let bytes = block("line one\nline two\n", codec);
            let outcome = decode_container(&bytes, &cipher());
            assert_eq!(outcome.lines, vec!["line one", "line two"]);
            assert_eq!(outcome.stats.blocks_attempted, 1);
            assert_eq!(outcome.stats.blocks_succeeded, 1);
            assert_eq!(outcome.stats.blocks_failed, 0);
        }
    }

    #[test]
    fn concatenates_blocks_with_and_without_terminator() {
        let mut bytes = block("a\n", Codec::Gzip);
        bytes.extend(frame(&encrypt(&compress("b\nc\n", Codec::Zlib)), false));
        bytes.extend(block("d", Codec::Deflate));

        let outcome = decode_container(&bytes, &cipher());
        assert_eq!(outcome.lines, vec!["a", "b", "c", "d"]);
        assert_eq!(outcome.stats.blocks_attempted, 3);
        assert_eq!(outcome.stats.blocks_succeeded, 3);
    }

    #[test]
    fn undecryptable_block_is_counted_and_skipped() {
        let mut bytes = block("first\n", Codec::Gzip);
        // 17 bytes cannot be CBC ciphertext.
        bytes.extend(frame(&[0xAB; 17], true));
        bytes.extend(block("third\n", Codec::Gzip));

        let outcome = decode_container(&bytes, &cipher());
        assert_eq!(outcome.lines, vec!["first", "third"]);
        assert_eq!(outcome.stats.blocks_attempted, 3);
        assert_eq!(outcome.stats.blocks_succeeded, 2);
        assert_eq!(outcome.stats.blocks_failed, 1);
    }

    #[test]
    fn wrong_key_fails_blocks_without_panicking() {
        let bytes = block("secret\n", Codec::Gzip);
        let other = LoganCipher::new(*b"ffffffffffffffff", IV);
        let outcome = decode_container(&bytes, &other);
        assert!(!outcome.lines.iter().any(|line| line == "secret"));
        assert_eq!(outcome.stats.blocks_attempted, 1);
        assert_eq!(
            outcome.stats.blocks_attempted,
            outcome.stats.blocks_succeeded + outcome.stats.blocks_failed
        );
    }

    #[test]
    fn resynchronises_after_leading_garbage() {
        let mut bytes = vec![0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x42, 0x42];
        bytes.extend(block("recovered\n", Codec::Gzip));

        let outcome = decode_container(&bytes, &cipher());
        assert_eq!(outcome.lines, vec!["recovered"]);
        assert_eq!(
            outcome.stats.blocks_attempted,
            outcome.stats.blocks_succeeded + outcome.stats.blocks_failed
        );
    }

    #[test]
    fn counters_stay_consistent_on_arbitrary_bytes() {
        let mut seed = 0x2545_f491_u32;
        for round in 0..64 {
            let len = 8 + round * 7;
            let bytes: Vec<u8> = (0..len)
                .map(|i| {
                    seed ^= seed << 13;
                    seed ^= seed >> 17;
                    seed ^= seed << 5;
                    if i % 11 == 0 {
                        BLOCK_MARKER
                    } else {
                        (seed & 0xFF) as u8
                    }
                })
                .collect();
            let outcome = decode_container(&bytes, &cipher());
            assert_eq!(
                outcome.stats.blocks_attempted,
                outcome.stats.blocks_succeeded + outcome.stats.blocks_failed
            );
        }
    }

    #[test]
    fn plaintext_json_is_not_mistaken_for_container() {
        assert!(!is_logan_container(b"{\"payload\":\"{}\"}\n"));
        assert!(!is_logan_container(b""));
        // Header-shaped prefix followed by JSON body.
        let mut tricky = vec![BLOCK_MARKER, 0, 0, 0, 4];
        tricky.extend_from_slice(b" {}\n");
        assert!(!is_logan_container(&tricky));

        assert!(is_logan_container(&block("x", Codec::Gzip)));
    }

    #[test]
    fn decode_bytes_passes_plaintext_through() {
        let decoded = decode_bytes(b"{\"a\":1}\r\n\n  \n{\"b\":2}\n", &cipher());
        assert!(!decoded.container);
        assert_eq!(decoded.lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(decoded.stats, DecodeStats::default());
    }

    #[test]
    fn zero_length_header_is_skipped() {
        let mut bytes = vec![BLOCK_MARKER, 0, 0, 0, 0];
        bytes.extend(block("after\n", Codec::Gzip));
        let outcome = decode_container(&bytes, &cipher());
        assert_eq!(outcome.lines, vec!["after"]);
        assert_eq!(outcome.stats.blocks_attempted, 1);
    }
}
