//! The per-packet decision cache and its on-disk format.
//!
//! The cache is the engine's output contract: one 2-bit entry per input
//! packet, in capture order, preceded by a fixed header. The replay engine
//! walks the same capture and reads entry *i* to decide what to do with
//! packet *i*, so the writer must emit an entry for every packet the source
//! delivered, including gated-out ones.
//!
//! On-disk layout, all integers big-endian:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 8 | magic `"capprep\0"` |
//! | 8 | 1 | format version |
//! | 9 | 8 | packet count `N` |
//! | 17 | 256 | comment, null-padded |
//! | 273 | ⌈2N/8⌉ | packed decisions |
//!
//! Within the payload, packet `i` (0-based) occupies the two bits at
//! `byte[i / 4] >> (6 - 2 * (i % 4))`: the first packet sits in the two
//! most significant bits of the first byte. The high bit of each pair is the
//! send bit (1 = send), the low bit is the side (1 = secondary).

use nom::IResult;
use nom::bytes::complete::take;
use nom_derive::*;
use serde::Serialize;
use tracing::debug;

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::PrepError;

/// Identifies a cache file.
pub const CACHE_MAGIC: [u8; 8] = *b"capprep\0";
/// Format version this engine reads and writes.
pub const CACHE_VERSION: u8 = 1;
/// Size of the fixed, null-padded comment field.
pub const COMMENT_LEN: usize = 256;

/// Packed entries per payload byte.
const ENTRIES_PER_BYTE: usize = 4;
const HEADER_LEN: usize = 8 + 1 + 8 + COMMENT_LEN;

/// The egress interface a sent packet goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    /// Conventionally the client side.
    Primary,
    /// Conventionally the server side.
    Secondary,
}

/// One cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    /// Gated out: `{drop, primary}` on the wire.
    Skip,
    /// Send on the given side.
    Send(Side),
}

impl Decision {
    fn to_bits(self) -> u8 {
        match self {
            Decision::Skip => 0b00,
            Decision::Send(Side::Primary) => 0b10,
            Decision::Send(Side::Secondary) => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Decision {
        if bits & 0b10 == 0 {
            Decision::Skip
        } else if bits & 0b01 == 0 {
            Decision::Send(Side::Primary)
        } else {
            Decision::Send(Side::Secondary)
        }
    }
}

fn magic_bytes(input: &[u8]) -> IResult<&[u8], [u8; 8]> {
    let (rest, bytes) = take(8usize)(input)?;
    Ok((
        rest,
        [
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ],
    ))
}

fn comment_bytes(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (rest, bytes) = take(COMMENT_LEN)(input)?;
    Ok((rest, bytes.to_vec()))
}

/// The fixed cache-file header.
#[derive(Nom, Debug, Clone, Serialize)]
pub struct CacheHeader {
    #[nom(Parse = "magic_bytes")]
    pub magic: [u8; 8],
    pub version: u8,
    pub packet_count: u64,
    #[nom(Parse = "comment_bytes")]
    comment: Vec<u8>,
}

impl CacheHeader {
    /// The comment with its null padding stripped.
    pub fn comment(&self) -> String {
        let end = self
            .comment
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.comment.len());
        String::from_utf8_lossy(&self.comment[..end]).into_owned()
    }

    fn validate(&self) -> Result<(), PrepError> {
        if self.magic != CACHE_MAGIC {
            return Err(PrepError::CacheFormat {
                message: "bad magic, not a cache file".to_string(),
            });
        }
        if self.version != CACHE_VERSION {
            return Err(PrepError::CacheFormat {
                message: format!(
                    "unsupported cache version {} (supported: {})",
                    self.version, CACHE_VERSION
                ),
            });
        }
        Ok(())
    }
}

/// In-memory cache under construction, plus serialization both ways.
#[derive(Debug, Clone, Serialize)]
pub struct Cache {
    decisions: Vec<Decision>,
    comment: String,
}

impl Cache {
    /// Starts an empty cache. The comment is truncated to fit the fixed
    /// header field, on a character boundary, leaving room for a final NUL.
    pub fn new(comment: &str) -> Self {
        let mut end = comment.len().min(COMMENT_LEN - 1);
        while !comment.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            decisions: Vec::new(),
            comment: comment[..end].to_string(),
        }
    }

    /// Appends the decision for the next packet ordinal.
    pub fn push(&mut self, decision: Decision) {
        self.decisions.push(decision);
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Serializes header plus packed payload.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        let payload_len = self.decisions.len().div_ceil(ENTRIES_PER_BYTE);
        let mut out = Vec::with_capacity(HEADER_LEN + payload_len);
        out.extend_from_slice(&CACHE_MAGIC);
        out.push(CACHE_VERSION);
        out.extend_from_slice(&(self.decisions.len() as u64).to_be_bytes());
        let mut comment = [0u8; COMMENT_LEN];
        comment[..self.comment.len()].copy_from_slice(self.comment.as_bytes());
        out.extend_from_slice(&comment);

        let mut payload = vec![0u8; payload_len];
        for (i, decision) in self.decisions.iter().enumerate() {
            let shift = 6 - 2 * (i % ENTRIES_PER_BYTE);
            payload[i / ENTRIES_PER_BYTE] |= decision.to_bits() << shift;
        }
        out.extend_from_slice(&payload);
        out
    }

    /// Writes the cache to `path`, creating or truncating the file.
    pub fn write_file(&self, path: &Path) -> Result<(), PrepError> {
        let map_err = |e: std::io::Error| PrepError::CacheWrite {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        let mut file = File::create(path).map_err(map_err)?;
        file.write_all(&self.to_be_bytes()).map_err(map_err)?;
        debug!(path = %path.display(), packets = self.len(), "wrote cache");
        Ok(())
    }

    /// Parses a serialized cache back into decisions and comment.
    pub fn from_be_bytes(bytes: &[u8]) -> Result<Cache, PrepError> {
        let (payload, header) =
            CacheHeader::parse_be(bytes).map_err(|_| PrepError::CacheFormat {
                message: "truncated cache header".to_string(),
            })?;
        header.validate()?;
        let count = usize::try_from(header.packet_count).map_err(|_| PrepError::CacheFormat {
            message: "packet count does not fit in memory".to_string(),
        })?;
        if payload.len() < count.div_ceil(ENTRIES_PER_BYTE) {
            return Err(PrepError::CacheFormat {
                message: format!(
                    "payload truncated: {} packets need {} bytes, found {}",
                    count,
                    count.div_ceil(ENTRIES_PER_BYTE),
                    payload.len()
                ),
            });
        }
        let mut decisions = Vec::with_capacity(count);
        for i in 0..count {
            let shift = 6 - 2 * (i % ENTRIES_PER_BYTE);
            let bits = (payload[i / ENTRIES_PER_BYTE] >> shift) & 0b11;
            decisions.push(Decision::from_bits(bits));
        }
        Ok(Cache {
            decisions,
            comment: header.comment(),
        })
    }

    /// Reads a cache file written by [`Cache::write_file`].
    pub fn read_file(path: &Path) -> Result<Cache, PrepError> {
        let bytes = std::fs::read(path).map_err(|e| PrepError::CacheRead {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_be_bytes(&bytes)
    }
}

/// Reads just the header of a cache file and returns its comment. Used by
/// `--print-comment`; the payload is never touched.
pub fn read_comment(path: &Path) -> Result<String, PrepError> {
    let map_err = |e: std::io::Error| PrepError::CacheRead {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let mut file = File::open(path).map_err(map_err)?;
    let mut header_bytes = [0u8; HEADER_LEN];
    file.read_exact(&mut header_bytes).map_err(map_err)?;
    let (_, header) =
        CacheHeader::parse_be(&header_bytes[..]).map_err(|_| PrepError::CacheFormat {
            message: "truncated cache header".to_string(),
        })?;
    header.validate()?;
    Ok(header.comment())
}
