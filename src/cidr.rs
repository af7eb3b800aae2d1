//! Insertion-ordered CIDR sets.
//!
//! A [`CidrSet`] is a plain list of IPv4 networks checked with a linear,
//! first-match-wins scan. No coalescing and no overlap detection: the set
//! iterates exactly in insertion order, which is what both CIDR mode and the
//! router-mode aggregation output rely on.

use ipnet::Ipv4Net;
use serde::Serialize;

use std::fmt;
use std::net::Ipv4Addr;

use crate::PrepError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CidrSet {
    nets: Vec<Ipv4Net>,
}

impl CidrSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a separator-delimited list of `a.b.c.d/p` tokens.
    ///
    /// A bare `a.b.c.d` token is taken as a /32. Host bits below the prefix
    /// are masked off. Any invalid token fails the whole parse.
    pub fn parse_list(text: &str, separator: char) -> Result<Self, PrepError> {
        let mut set = CidrSet::new();
        for token in text.split(separator) {
            let token = token.trim();
            if token.contains('/') {
                let net: Ipv4Net = token.parse().map_err(|_| PrepError::InvalidCidr {
                    token: token.to_string(),
                })?;
                set.nets.push(net.trunc());
            } else {
                let addr: Ipv4Addr = token.parse().map_err(|_| PrepError::InvalidCidr {
                    token: token.to_string(),
                })?;
                set.append(addr, 32)?;
            }
        }
        Ok(set)
    }

    /// Appends one network, masking host bits to keep the stored network
    /// address clean.
    pub fn append(&mut self, network: Ipv4Addr, prefix_len: u8) -> Result<(), PrepError> {
        let net = Ipv4Net::new(network, prefix_len).map_err(|_| PrepError::InvalidCidr {
            token: format!("{network}/{prefix_len}"),
        })?;
        self.nets.push(net.trunc());
        Ok(())
    }

    /// First-match membership test. An empty set contains nothing.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.nets.iter().any(|net| net.contains(&ip))
    }

    /// Networks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Ipv4Net> {
        self.nets.iter()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

impl fmt::Display for CidrSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, net) in self.nets.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{net}")?;
        }
        Ok(())
    }
}
