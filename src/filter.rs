//! Include/exclude gating applied before classification.
//!
//! One predicate may be configured per run, in either polarity. Packets that
//! fail the gate are written to the cache as `{drop, primary}` so that packet
//! ordinals stay aligned between this tool and the replay engine reading the
//! cache.
//!
//! Filter specs use a one-letter prefix:
//!
//! | Spec | Predicate |
//! |---|---|
//! | `P:1,5-10` | packet ordinals (singletons and closed ranges) |
//! | `S:cidr,...` | source address in CIDR set |
//! | `D:cidr,...` | destination address in CIDR set |
//! | `B:cidr,...` | either address in CIDR set |
//! | `F:expr` | BPF expression over the raw frame |

use serde::Serialize;

use crate::PrepError;
use crate::cidr::CidrSet;
use crate::decode::Ipv4Fields;

/// Whether a matching packet is kept or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Polarity {
    /// Packets pass the gate iff the predicate matches.
    Include,
    /// Packets pass the gate iff the predicate does not match.
    Exclude,
}

/// Which IPv4 address a CIDR predicate inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddressField {
    Source,
    Destination,
    Either,
}

/// A parsed `--include`/`--exclude` argument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FilterSpec {
    PacketList(PacketIdList),
    Cidr { set: CidrSet, which: AddressField },
    Bpf(String),
}

impl FilterSpec {
    /// Parses the `X:...` spec syntax.
    pub fn parse(spec: &str) -> Result<FilterSpec, PrepError> {
        let Some((kind, rest)) = spec.split_once(':') else {
            return Err(PrepError::InvalidFilter {
                spec: spec.to_string(),
                reason: "expected a P:, S:, D:, B: or F: prefix".to_string(),
            });
        };
        match kind {
            "P" => Ok(FilterSpec::PacketList(PacketIdList::parse(rest)?)),
            "S" => Ok(FilterSpec::Cidr {
                set: CidrSet::parse_list(rest, ',')?,
                which: AddressField::Source,
            }),
            "D" => Ok(FilterSpec::Cidr {
                set: CidrSet::parse_list(rest, ',')?,
                which: AddressField::Destination,
            }),
            "B" => Ok(FilterSpec::Cidr {
                set: CidrSet::parse_list(rest, ',')?,
                which: AddressField::Either,
            }),
            "F" => Ok(FilterSpec::Bpf(rest.to_string())),
            other => Err(PrepError::InvalidFilter {
                spec: spec.to_string(),
                reason: format!("unknown filter kind {other:?}"),
            }),
        }
    }
}

/// A union of singletons and closed ranges over 1-based packet ordinals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PacketIdList {
    /// Sorted, non-overlapping `(low, high)` inclusive ranges.
    ranges: Vec<(u64, u64)>,
}

impl PacketIdList {
    /// Parses `1,5-10,20`-style lists. Ranges are inclusive on both ends.
    pub fn parse(text: &str) -> Result<Self, PrepError> {
        let invalid = |reason: &str| PrepError::InvalidFilter {
            spec: text.to_string(),
            reason: reason.to_string(),
        };
        let mut ranges = Vec::new();
        for token in text.split(',') {
            let token = token.trim();
            let (low, high) = match token.split_once('-') {
                Some((low, high)) => (
                    low.trim()
                        .parse::<u64>()
                        .map_err(|_| invalid("bad range start"))?,
                    high.trim()
                        .parse::<u64>()
                        .map_err(|_| invalid("bad range end"))?,
                ),
                None => {
                    let id = token.parse::<u64>().map_err(|_| invalid("bad packet id"))?;
                    (id, id)
                }
            };
            if low == 0 {
                return Err(invalid("packet ordinals are 1-based"));
            }
            if low > high {
                return Err(invalid("range start exceeds range end"));
            }
            ranges.push((low, high));
        }
        if ranges.is_empty() {
            return Err(invalid("empty packet list"));
        }
        // Sort and merge so membership can binary-search.
        ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
        for (low, high) in ranges {
            match merged.last_mut() {
                Some(last) if low <= last.1.saturating_add(1) => last.1 = last.1.max(high),
                _ => merged.push((low, high)),
            }
        }
        Ok(Self { ranges: merged })
    }

    /// O(log n) membership over the sorted range list.
    pub fn contains(&self, ordinal: u64) -> bool {
        let idx = self.ranges.partition_point(|&(low, _)| low <= ordinal);
        idx > 0 && ordinal <= self.ranges[idx - 1].1
    }
}

/// The compiled gate: a predicate plus its polarity.
pub struct Gate {
    polarity: Polarity,
    predicate: Predicate,
}

// Custom Debug: a compiled BPF program has nothing printable.
impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.predicate {
            Predicate::Packets(_) => "packet-list",
            Predicate::Cidr { .. } => "cidr",
            #[cfg(feature = "bpf")]
            Predicate::Bpf(_) => "bpf",
        };
        f.debug_struct("Gate")
            .field("polarity", &self.polarity)
            .field("predicate", &kind)
            .finish()
    }
}

enum Predicate {
    Packets(PacketIdList),
    Cidr { set: CidrSet, which: AddressField },
    #[cfg(feature = "bpf")]
    Bpf(pcap::BpfProgram),
}

impl Gate {
    /// Compiles a parsed spec. BPF expressions are compiled once here, not
    /// per packet; without the `bpf` feature they are rejected outright.
    pub fn compile(polarity: Polarity, spec: FilterSpec) -> Result<Gate, PrepError> {
        let predicate = match spec {
            FilterSpec::PacketList(list) => Predicate::Packets(list),
            FilterSpec::Cidr { set, which } => Predicate::Cidr { set, which },
            #[cfg(feature = "bpf")]
            FilterSpec::Bpf(expr) => Predicate::Bpf(crate::capture::compile_bpf(&expr)?),
            #[cfg(not(feature = "bpf"))]
            FilterSpec::Bpf(expr) => {
                return Err(PrepError::InvalidFilter {
                    spec: format!("F:{expr}"),
                    reason: "BPF filters need the `bpf` build feature".to_string(),
                });
            }
        };
        Ok(Gate {
            polarity,
            predicate,
        })
    }

    fn passes(&self, matched: bool) -> bool {
        match self.polarity {
            Polarity::Include => matched,
            Polarity::Exclude => !matched,
        }
    }

    /// Evaluates the predicates that work on the raw frame: the packet-ordinal
    /// list and the BPF program. CIDR predicates always pass here and are
    /// checked after decoding.
    #[cfg_attr(not(feature = "bpf"), allow(unused_variables))]
    pub fn passes_frame(&self, ordinal: u64, frame: &[u8]) -> bool {
        match &self.predicate {
            Predicate::Packets(list) => self.passes(list.contains(ordinal)),
            Predicate::Cidr { .. } => true,
            #[cfg(feature = "bpf")]
            Predicate::Bpf(program) => self.passes(program.filter(frame)),
        }
    }

    /// Evaluates the CIDR predicate against a decoded IPv4 header. The other
    /// predicates always pass here (they were checked on the raw frame).
    pub fn passes_ipv4(&self, fields: &Ipv4Fields) -> bool {
        match &self.predicate {
            Predicate::Cidr { set, which } => {
                let matched = match which {
                    AddressField::Source => set.contains(fields.src),
                    AddressField::Destination => set.contains(fields.dst),
                    AddressField::Either => set.contains(fields.src) || set.contains(fields.dst),
                };
                self.passes(matched)
            }
            _ => true,
        }
    }
}
