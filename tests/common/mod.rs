//! Shared fixtures: synthetic Ethernet frames and a minimal legacy pcap
//! writer, so the end-to-end tests need no capture files checked in.

#![allow(dead_code)]

use std::io::Write;

pub fn eth_ip_frame(protocol: u8, src: [u8; 4], dst: [u8; 4], l4: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 12];
    frame.extend_from_slice(&[0x08, 0x00]);
    let total_len = (20 + l4.len()) as u16;
    frame.extend_from_slice(&[0x45, 0x00]);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x40, protocol, 0x00, 0x00]);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(l4);
    frame
}

pub fn tcp_frame(src: [u8; 4], dst: [u8; 4], dst_port: u16) -> Vec<u8> {
    let mut l4 = Vec::with_capacity(20);
    l4.extend_from_slice(&40000u16.to_be_bytes());
    l4.extend_from_slice(&dst_port.to_be_bytes());
    l4.extend_from_slice(&[0u8; 16]);
    eth_ip_frame(6, src, dst, &l4)
}

pub fn udp_frame(src: [u8; 4], dst: [u8; 4], dst_port: u16) -> Vec<u8> {
    let mut l4 = Vec::with_capacity(8);
    l4.extend_from_slice(&40000u16.to_be_bytes());
    l4.extend_from_slice(&dst_port.to_be_bytes());
    l4.extend_from_slice(&[0u8; 4]);
    eth_ip_frame(17, src, dst, &l4)
}

pub fn arp_frame() -> Vec<u8> {
    let mut frame = vec![0u8; 12];
    frame.extend_from_slice(&[0x08, 0x06]);
    frame.extend_from_slice(&[0u8; 28]);
    frame
}

/// Writes a legacy pcap file (big-endian, linktype 1) holding `frames`.
pub fn write_pcap(frames: &[Vec<u8>]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&0xa1b2c3d4u32.to_be_bytes()).unwrap();
    file.write_all(&2u16.to_be_bytes()).unwrap();
    file.write_all(&4u16.to_be_bytes()).unwrap();
    file.write_all(&0u32.to_be_bytes()).unwrap();
    file.write_all(&0u32.to_be_bytes()).unwrap();
    file.write_all(&65535u32.to_be_bytes()).unwrap();
    file.write_all(&1u32.to_be_bytes()).unwrap();
    for (i, frame) in frames.iter().enumerate() {
        file.write_all(&(i as u32).to_be_bytes()).unwrap();
        file.write_all(&0u32.to_be_bytes()).unwrap();
        file.write_all(&(frame.len() as u32).to_be_bytes()).unwrap();
        file.write_all(&(frame.len() as u32).to_be_bytes()).unwrap();
        file.write_all(frame).unwrap();
    }
    file.flush().unwrap();
    file
}
