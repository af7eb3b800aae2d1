//! Capture-file access.
//!
//! The engine only needs an ordered stream of `(captured-length, bytes)`
//! frames, reopenable from the start for auto mode's second pass. The stock
//! implementation reads legacy pcap files; [`MemorySource`] serves tests,
//! benches and callers that already hold frames in memory.

use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};
use tracing::{debug, warn};

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::PrepError;

const READER_BUFFER: usize = 65536;

/// One captured frame as delivered to the engine.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Captured (possibly truncated) length in bytes.
    pub caplen: u32,
    /// The captured bytes, starting at the Ethernet header.
    pub data: Vec<u8>,
}

/// An ordered source of captured frames. One pass per open; auto mode opens
/// the source twice.
pub trait FrameSource {
    /// The next frame, or `None` at end of capture.
    fn next_frame(&mut self) -> Result<Option<Frame>, PrepError>;
}

/// Legacy pcap file reader.
pub struct PcapFileSource {
    path: PathBuf,
    reader: LegacyPcapReader<File>,
}

impl std::fmt::Debug for PcapFileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcapFileSource")
            .field("path", &self.path)
            .finish()
    }
}

impl PcapFileSource {
    pub fn open(path: &Path) -> Result<Self, PrepError> {
        let map_err = |message: String| PrepError::CaptureOpen {
            path: path.to_path_buf(),
            message,
        };
        let file = File::open(path).map_err(|e| map_err(e.to_string()))?;
        let reader =
            LegacyPcapReader::new(READER_BUFFER, file).map_err(|e| map_err(e.to_string()))?;
        debug!(path = %path.display(), "opened capture");
        Ok(Self {
            path: path.to_path_buf(),
            reader,
        })
    }
}

impl FrameSource for PcapFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, PrepError> {
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let frame = match block {
                        PcapBlockOwned::LegacyHeader(_) => None,
                        PcapBlockOwned::Legacy(packet) => Some(Frame {
                            caplen: packet.caplen,
                            data: packet.data.to_vec(),
                        }),
                        PcapBlockOwned::NG(_) => {
                            warn!(path = %self.path.display(), "skipping pcapng block in legacy capture");
                            None
                        }
                    };
                    self.reader.consume(offset);
                    if let Some(frame) = frame {
                        return Ok(Some(frame));
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    self.reader.refill().map_err(|e| PrepError::CaptureRead {
                        message: e.to_string(),
                    })?;
                }
                Err(e) => {
                    return Err(PrepError::CaptureRead {
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Frames held in memory. Each open yields the same sequence again.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    frames: Vec<Vec<u8>>,
    next: usize,
}

impl MemorySource {
    pub fn new(frames: Vec<Vec<u8>>) -> Self {
        Self { frames, next: 0 }
    }
}

impl FrameSource for MemorySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, PrepError> {
        let Some(data) = self.frames.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        Ok(Some(Frame {
            caplen: data.len() as u32,
            data: data.clone(),
        }))
    }
}

/// Compiles a BPF expression once, against an Ethernet link type, for the
/// gate to evaluate per frame. Compilation is libpcap's; only evaluation
/// happens in-process.
#[cfg(feature = "bpf")]
pub fn compile_bpf(expr: &str) -> Result<pcap::BpfProgram, PrepError> {
    let capture = pcap::Capture::dead(pcap::Linktype::ETHERNET).map_err(|e| {
        PrepError::BpfCompile {
            expr: expr.to_string(),
            message: e.to_string(),
        }
    })?;
    capture
        .compile(expr, true)
        .map_err(|e| PrepError::BpfCompile {
            expr: expr.to_string(),
            message: e.to_string(),
        })
}
