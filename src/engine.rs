//! Run configuration and the classification driver.
//!
//! [`Config`] is plain data, immutable once built. [`Engine::new`] compiles
//! it (regex, CIDR lists, the gate) and owns every mutable piece for the
//! duration of one run: the learner tree, the service table and the cache
//! under construction. Auto mode is an explicit two-pass loop over
//! [`Pass::Learn`] and [`Pass::Emit`]; every other mode runs a single emit
//! pass.

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use std::path::{Path, PathBuf};

use crate::PrepError;
use crate::cache::{Cache, Decision, Side};
use crate::capture::{Frame, FrameSource, PcapFileSource};
use crate::cidr::CidrSet;
use crate::decode::{DecodedFrame, Ipv4Fields, decode_frame};
use crate::filter::{FilterSpec, Gate, Polarity};
use crate::services::{ServicePortTable, Transport};
use crate::tree::{HostRole, IpTree};

/// Ratio used by the learner when none is configured.
pub const DEFAULT_RATIO: f64 = 2.0;
/// Shortest covering prefix aggregation may emit by default.
pub const DEFAULT_MIN_MASK: u8 = 8;
/// Deepest aggregation walk by default; beyond it, host routes.
pub const DEFAULT_MAX_MASK: u8 = 30;

/// How source addresses are classified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Mode {
    /// Source address (dotted quad) against a regular expression.
    Regex(String),
    /// Source address against a CIDR list (the unparsed `a.b.c.d/p,...` text).
    Cidr(String),
    /// Destination port against the service table.
    Port,
    /// Two-pass learning from destination-port evidence.
    Auto(AutoKind),
}

/// Auto-mode second-pass policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AutoKind {
    /// Tree lookup; unknown hosts take the bridge default side.
    Bridge,
    /// Aggregate the tree into server CIDRs, then match like CIDR mode.
    Router,
    /// Tree lookup; unknown hosts are treated as clients.
    Client,
    /// Tree lookup; unknown hosts are treated as servers.
    Server,
}

/// One pass over the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Feed the learner; write nothing.
    Learn,
    /// Emit one decision per delivered packet.
    Emit,
}

/// Immutable run configuration, assembled by the CLI (or a library caller)
/// before the engine starts.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub mode: Mode,
    /// Learner ratio; strictly positive.
    pub ratio: f64,
    /// Aggregation bounds, `0 < min_mask <= max_mask <= 32`.
    pub min_mask: u8,
    pub max_mask: u8,
    /// Side for frames that are not classifiable IPv4.
    pub non_ip: Side,
    /// Side bridge sub-mode assigns to unknown hosts.
    pub bridge_unknown: Side,
    /// Services file overriding the default well-known range.
    pub services_file: Option<PathBuf>,
    /// Comment embedded in the cache header.
    pub comment: String,
    /// At most one include/exclude predicate.
    pub filter: Option<(Polarity, FilterSpec)>,
}

impl Config {
    /// A configuration with every knob at its default.
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ratio: DEFAULT_RATIO,
            min_mask: DEFAULT_MIN_MASK,
            max_mask: DEFAULT_MAX_MASK,
            non_ip: Side::Primary,
            bridge_unknown: Side::Primary,
            services_file: None,
            comment: String::new(),
            filter: None,
        }
    }

    fn validate(&self) -> Result<(), PrepError> {
        let config_err = |message: &str| PrepError::Config {
            message: message.to_string(),
        };
        if !(self.ratio > 0.0) {
            return Err(config_err("ratio must be strictly positive"));
        }
        if self.min_mask == 0 || self.min_mask > self.max_mask || self.max_mask > 32 {
            return Err(config_err(
                "mask bounds must satisfy 0 < min-mask <= max-mask <= 32",
            ));
        }
        Ok(())
    }
}

/// Compiled per-mode classifier state.
enum Classifier {
    Regex(Regex),
    Cidr(CidrSet),
    Port,
    Auto(AutoKind),
}

// Custom Debug: a compiled regex prints as its pattern.
impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classifier::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
            Classifier::Cidr(set) => f.debug_tuple("Cidr").field(&set.to_string()).finish(),
            Classifier::Port => write!(f, "Port"),
            Classifier::Auto(kind) => f.debug_tuple("Auto").field(kind).finish(),
        }
    }
}

/// The classification driver. Owns all mutable state for one run.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    classifier: Classifier,
    services: ServicePortTable,
    gate: Option<Gate>,
    tree: IpTree,
    /// Server networks derived by router-mode aggregation after pass 1.
    server_nets: Option<CidrSet>,
}

impl Engine {
    /// Compiles a configuration. All parse and validation failures surface
    /// here, before any capture is opened.
    pub fn new(config: Config) -> Result<Engine, PrepError> {
        config.validate()?;

        let classifier = match &config.mode {
            Mode::Regex(pattern) => Classifier::Regex(Regex::new(pattern).map_err(|e| {
                PrepError::InvalidRegex {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                }
            })?),
            Mode::Cidr(list) => Classifier::Cidr(CidrSet::parse_list(list, ',')?),
            Mode::Port => Classifier::Port,
            Mode::Auto(kind) => Classifier::Auto(*kind),
        };

        let mut services = ServicePortTable::default();
        if let Some(path) = &config.services_file {
            services.load_services_file(path)?;
        }

        let gate = config
            .filter
            .as_ref()
            .map(|(polarity, spec)| Gate::compile(*polarity, spec.clone()))
            .transpose()?;

        Ok(Engine {
            config,
            classifier,
            services,
            gate,
            tree: IpTree::new(),
            server_nets: None,
        })
    }

    /// The passes this run makes over the capture.
    pub fn passes(&self) -> &'static [Pass] {
        match self.classifier {
            Classifier::Auto(_) => &[Pass::Learn, Pass::Emit],
            _ => &[Pass::Emit],
        }
    }

    /// Runs the full classification, reopening the source once per pass.
    ///
    /// The i-th cache entry corresponds to the i-th frame the source
    /// delivers; a source that delivers nothing is an error.
    pub fn run<S, F>(&mut self, mut open_source: F) -> Result<Cache, PrepError>
    where
        S: FrameSource,
        F: FnMut() -> Result<S, PrepError>,
    {
        let mut cache = Cache::new(&self.config.comment);
        for &pass in self.passes() {
            debug!(?pass, "starting pass");
            let mut source = open_source()?;
            let mut ordinal = 0u64;
            while let Some(frame) = source.next_frame()? {
                ordinal += 1;
                self.process_frame(pass, ordinal, &frame, &mut cache);
            }
            if ordinal == 0 {
                return Err(PrepError::EmptyCapture);
            }
            if pass == Pass::Learn {
                self.finish_learning()?;
            } else {
                info!(packets = ordinal, "cached {ordinal} packets");
            }
        }
        Ok(cache)
    }

    /// Convenience wrapper reading a pcap file.
    pub fn run_file(&mut self, path: &Path) -> Result<Cache, PrepError> {
        self.run(|| PcapFileSource::open(path))
    }

    fn process_frame(&mut self, pass: Pass, ordinal: u64, frame: &Frame, cache: &mut Cache) {
        // Ordinal and BPF predicates see the raw frame.
        if let Some(gate) = &self.gate {
            if !gate.passes_frame(ordinal, &frame.data) {
                if pass == Pass::Emit {
                    cache.push(Decision::Skip);
                }
                return;
            }
        }

        let fields = match decode_frame(&frame.data) {
            DecodedFrame::Ipv4(fields) => fields,
            DecodedFrame::NonIp { .. } => {
                // Non-IP frames bypass the CIDR gate: there is no address to
                // test. The learner never sees them either.
                if pass == Pass::Emit {
                    cache.push(Decision::Send(self.config.non_ip));
                }
                return;
            }
        };

        if let Some(gate) = &self.gate {
            if !gate.passes_ipv4(&fields) {
                if pass == Pass::Emit {
                    cache.push(Decision::Skip);
                }
                return;
            }
        }

        match pass {
            Pass::Learn => self.learn(&fields),
            Pass::Emit => cache.push(Decision::Send(self.classify(&fields))),
        }
    }

    /// Pass-1 bookkeeping: a service destination port is client evidence for
    /// the source, anything else is server evidence.
    fn learn(&mut self, fields: &Ipv4Fields) {
        let Some(transport) = Transport::from_protocol(fields.protocol) else {
            return;
        };
        let Some(port) = fields.dst_port else {
            return;
        };
        let acting_as_client = self.services.is_server_port(transport, port);
        self.tree.observe(fields.src, acting_as_client);
    }

    /// Between the passes: assign roles, and for router sub-mode collapse
    /// the tree into server networks.
    fn finish_learning(&mut self) -> Result<(), PrepError> {
        self.tree.finalize(self.config.ratio);
        if let Classifier::Auto(AutoKind::Router) = self.classifier {
            info!("building server network list from learned hosts");
            let nets = self
                .tree
                .aggregate(self.config.min_mask, self.config.max_mask)?;
            self.server_nets = Some(nets);
        }
        Ok(())
    }

    fn classify(&self, fields: &Ipv4Fields) -> Side {
        match &self.classifier {
            Classifier::Regex(re) => {
                if re.is_match(&fields.src.to_string()) {
                    Side::Secondary
                } else {
                    Side::Primary
                }
            }
            Classifier::Cidr(set) => {
                if set.contains(fields.src) {
                    Side::Secondary
                } else {
                    Side::Primary
                }
            }
            Classifier::Port => self.classify_by_port(fields),
            Classifier::Auto(AutoKind::Router) => {
                let covered = self
                    .server_nets
                    .as_ref()
                    .is_some_and(|nets| nets.contains(fields.src));
                if covered { Side::Secondary } else { Side::Primary }
            }
            Classifier::Auto(kind) => match self.tree.role_of(fields.src) {
                HostRole::Server => Side::Secondary,
                HostRole::Client => Side::Primary,
                HostRole::Unknown => match kind {
                    AutoKind::Client => Side::Primary,
                    AutoKind::Server => Side::Secondary,
                    AutoKind::Bridge => self.config.bridge_unknown,
                    AutoKind::Router => unreachable!("router handled above"),
                },
            },
        }
    }

    /// Port mode: server-bound traffic goes to the secondary side. IPv4
    /// without a usable destination port falls back to the non-IP side.
    fn classify_by_port(&self, fields: &Ipv4Fields) -> Side {
        let port = Transport::from_protocol(fields.protocol).zip(fields.dst_port);
        match port {
            Some((transport, port)) => {
                if self.services.is_server_port(transport, port) {
                    Side::Secondary
                } else {
                    Side::Primary
                }
            }
            None => self.config.non_ip,
        }
    }

    /// The learner, for inspection after a run.
    pub fn tree(&self) -> &IpTree {
        &self.tree
    }

    /// Router-mode server networks, once pass 1 has completed.
    pub fn server_networks(&self) -> Option<&CidrSet> {
        self.server_nets.as_ref()
    }
}
