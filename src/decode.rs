//! Ethernet II frame decoding.
//!
//! Only the fields classification needs are pulled out of each frame: the
//! ethertype, and for IPv4 the source/destination addresses, the protocol
//! number, and the TCP/UDP destination port. Everything else in the frame is
//! skipped over.

use nom::IResult;
use nom::bytes::complete::take;
use nom::number::complete::be_u32;
use nom_derive::*;
use serde::Serialize;
use tracing::debug;

use std::net::Ipv4Addr;

/// Ethertype carried by IPv4 frames.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

/// Fixed part of the IPv4 header, without options.
const IPV4_FIXED_LEN: usize = 20;

fn mac_octets(input: &[u8]) -> IResult<&[u8], [u8; 6]> {
    let (rest, bytes) = take(6usize)(input)?;
    Ok((
        rest,
        [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]],
    ))
}

/// Ethernet II header: two MACs and a big-endian ethertype.
#[derive(Nom, Debug, Clone, Serialize)]
pub struct EthernetHeader {
    /// Destination MAC address
    #[nom(Parse = "mac_octets")]
    pub dst_mac: [u8; 6],
    /// Source MAC address
    #[nom(Parse = "mac_octets")]
    pub src_mac: [u8; 6],
    /// Ethertype; 0x0800 for IPv4
    pub ethertype: u16,
}

/// IPv4 header, fixed portion. Options are skipped via the IHL field.
#[derive(Nom, Debug, Clone, Serialize)]
pub struct Ipv4Header {
    /// Version (high nibble) and header length in 32-bit words (low nibble)
    pub version_ihl: u8,
    /// Type of service
    pub tos: u8,
    /// Total datagram length
    pub total_length: u16,
    /// Identification
    pub identification: u16,
    /// Flags and fragment offset
    pub flags_fragment: u16,
    /// Time to live
    pub ttl: u8,
    /// IP protocol number (TCP = 6, UDP = 17)
    pub protocol: u8,
    /// Header checksum
    pub checksum: u16,
    /// Source address
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub src: Ipv4Addr,
    /// Destination address
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Header length in bytes as declared by the IHL nibble.
    pub fn header_len(&self) -> usize {
        ((self.version_ihl & 0x0f) as usize) * 4
    }
}

/// Leading four bytes shared by the TCP and UDP headers.
#[derive(Nom, Debug, Clone, Copy, Serialize)]
pub struct TransportPorts {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
}

/// The IPv4 fields the classifiers consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ipv4Fields {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    /// Destination port for TCP/UDP; `None` for other protocols or when the
    /// capture is truncated before the transport header.
    pub dst_port: Option<u16>,
}

/// Outcome of decoding one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecodedFrame {
    /// Anything that is not a complete IPv4 packet.
    NonIp { ethertype: u16 },
    /// An IPv4 packet with the fields classification needs.
    Ipv4(Ipv4Fields),
}

/// Decodes a raw captured frame down to [`DecodedFrame`].
///
/// Frames shorter than an Ethernet header, and IPv4 frames whose capture is
/// truncated inside the IP header, are reported as non-IP: there is no source
/// address to classify on, so they take the non-IP policy.
pub fn decode_frame(data: &[u8]) -> DecodedFrame {
    let (rest, eth) = match EthernetHeader::parse_be(data) {
        Ok(parsed) => parsed,
        Err(_) => {
            debug!(len = data.len(), "frame shorter than an Ethernet header");
            return DecodedFrame::NonIp { ethertype: 0 };
        }
    };

    if eth.ethertype != ETHERTYPE_IPV4 {
        return DecodedFrame::NonIp {
            ethertype: eth.ethertype,
        };
    }

    let (after_fixed, ip) = match Ipv4Header::parse_be(rest) {
        Ok(parsed) => parsed,
        Err(_) => {
            debug!(caplen = data.len(), "IPv4 header truncated by the capture");
            return DecodedFrame::NonIp {
                ethertype: eth.ethertype,
            };
        }
    };

    let options_len = ip.header_len().saturating_sub(IPV4_FIXED_LEN);
    let dst_port = match ip.protocol {
        IPPROTO_TCP | IPPROTO_UDP => after_fixed
            .get(options_len..)
            .and_then(|l4| TransportPorts::parse_be(l4).ok())
            .map(|(_rest, ports)| ports.dst_port),
        _ => None,
    };

    DecodedFrame::Ipv4(Ipv4Fields {
        src: ip.src,
        dst: ip.dst,
        protocol: ip.protocol,
        dst_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_frame(src: [u8; 4], dst: [u8; 4], dst_port: u16) -> Vec<u8> {
        let mut frame = vec![
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, // dst mac
            0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, // src mac
            0x08, 0x00, // ethertype
        ];
        frame.extend_from_slice(&[0x45, 0x00, 0x00, 0x28, 0x00, 0x01, 0x00, 0x00, 0x40, 0x06]);
        frame.extend_from_slice(&[0x00, 0x00]); // checksum
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(&1234u16.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&[0u8; 16]); // rest of the TCP header
        frame
    }

    #[test]
    fn decodes_tcp_frame() {
        let frame = tcp_frame([10, 0, 0, 1], [192, 168, 1, 1], 80);
        match decode_frame(&frame) {
            DecodedFrame::Ipv4(fields) => {
                assert_eq!(fields.src, Ipv4Addr::new(10, 0, 0, 1));
                assert_eq!(fields.dst, Ipv4Addr::new(192, 168, 1, 1));
                assert_eq!(fields.protocol, IPPROTO_TCP);
                assert_eq!(fields.dst_port, Some(80));
            }
            other => panic!("expected IPv4, got {other:?}"),
        }
    }

    #[test]
    fn decode_agrees_with_etherparse() {
        let frame = tcp_frame([172, 16, 5, 9], [10, 9, 8, 7], 443);
        let sliced = etherparse::SlicedPacket::from_ethernet(&frame).unwrap();
        let ip = match sliced.net {
            Some(etherparse::NetSlice::Ipv4(ip)) => ip,
            other => panic!("etherparse saw {other:?}"),
        };
        let DecodedFrame::Ipv4(fields) = decode_frame(&frame) else {
            panic!("expected IPv4");
        };
        assert_eq!(fields.src, ip.header().source_addr());
        assert_eq!(fields.dst, ip.header().destination_addr());
        match sliced.transport {
            Some(etherparse::TransportSlice::Tcp(tcp)) => {
                assert_eq!(fields.dst_port, Some(tcp.destination_port()));
            }
            other => panic!("etherparse saw {other:?}"),
        }
    }

    #[test]
    fn skips_ipv4_options() {
        // IHL = 6 words: one 4-byte option before the TCP header.
        let mut frame = vec![
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x08, 0x00, // ethernet
            0x46, 0x00, 0x00, 0x20, 0x00, 0x01, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00,
        ];
        frame.extend_from_slice(&[10, 1, 1, 1]);
        frame.extend_from_slice(&[10, 1, 1, 2]);
        frame.extend_from_slice(&[0x01, 0x01, 0x01, 0x01]); // option padding
        frame.extend_from_slice(&9999u16.to_be_bytes());
        frame.extend_from_slice(&53u16.to_be_bytes());
        frame.extend_from_slice(&[0, 8, 0, 0]); // udp len + checksum
        let DecodedFrame::Ipv4(fields) = decode_frame(&frame) else {
            panic!("expected IPv4");
        };
        assert_eq!(fields.protocol, IPPROTO_UDP);
        assert_eq!(fields.dst_port, Some(53));
    }

    #[test]
    fn non_ip_ethertype() {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&[0x08, 0x06]); // ARP
        frame.extend_from_slice(&[0u8; 28]);
        assert_eq!(
            decode_frame(&frame),
            DecodedFrame::NonIp { ethertype: 0x0806 }
        );
    }

    #[test]
    fn truncated_transport_header_loses_port_only() {
        let frame = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 80);
        // cut the frame just after the IP header
        let DecodedFrame::Ipv4(fields) = decode_frame(&frame[..34]) else {
            panic!("expected IPv4");
        };
        assert_eq!(fields.dst_port, None);
        assert_eq!(fields.src, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn runt_frame_is_non_ip() {
        assert_eq!(decode_frame(&[1, 2, 3]), DecodedFrame::NonIp { ethertype: 0 });
    }
}
