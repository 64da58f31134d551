//! IPv4 packet parsing and building.
//!
//! Parsing leans on smoltcp wire types; replies are always freshly built
//! rather than mutating the input buffer. Input checksums are not verified
//! (the kernel already accepted the packet onto the TUN), but every emitted
//! packet carries correct one's-complement checksums.

use crate::error::{NetStackError, Result};
use smoltcp::wire::{IpProtocol, Ipv4Packet, TcpPacket, UdpPacket};
use std::net::Ipv4Addr;

pub const DEFAULT_MTU: usize = 1500;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
/// Largest TCP payload that fits one emitted packet at the default MTU.
pub const MAX_TCP_PAYLOAD: usize = DEFAULT_MTU - IPV4_HEADER_LEN - TCP_HEADER_LEN;

/// Advertised receive window on every emitted segment.
const TCP_WINDOW: u16 = 65535;
/// Don't-fragment, zero fragment offset.
const IPV4_FLAGS_DF: u16 = 0x4000;
const IPV4_TTL: u8 = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        flags
    }
}

/// One transport segment/datagram borrowed out of a raw IPv4 packet.
#[derive(Debug)]
pub enum Transport<'a> {
    Tcp(TcpSegment<'a>),
    Udp(UdpDatagram<'a>),
    Icmp,
    Other(u8),
}

#[derive(Debug)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: &'a [u8],
}

#[derive(Debug)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

#[derive(Debug)]
pub struct ParsedPacket<'a> {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub transport: Transport<'a>,
}

/// Parse a raw TUN packet as IPv4.
///
/// Rejects anything shorter than an IPv4 header or with a version nibble
/// other than 4; options are skipped by honouring IHL.
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket<'_>> {
    if data.len() < IPV4_HEADER_LEN {
        return Err(NetStackError::PacketTooShort {
            expected: IPV4_HEADER_LEN,
            actual: data.len(),
        });
    }
    let version = data[0] >> 4;
    if version != 4 {
        return Err(NetStackError::InvalidIpVersion(version));
    }

    // The read buffer may be longer than the datagram; trim to total length
    // before handing it to the wire parser.
    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if total_len < IPV4_HEADER_LEN || total_len > data.len() {
        return Err(NetStackError::InvalidPacket(format!(
            "total length {} vs buffer {}",
            total_len,
            data.len()
        )));
    }
    let data = &data[..total_len];

    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| NetStackError::InvalidPacket(format!("IPv4: {}", e)))?;

    let src_addr = pkt.src_addr();
    let dst_addr = pkt.dst_addr();
    let protocol = pkt.next_header();
    let ihl = ((data[0] & 0x0F) as usize) * 4;
    let payload = &data[ihl..];

    let transport = match protocol {
        IpProtocol::Tcp => parse_tcp(payload)?,
        IpProtocol::Udp => parse_udp(payload)?,
        IpProtocol::Icmp => Transport::Icmp,
        other => Transport::Other(other.into()),
    };

    Ok(ParsedPacket {
        src_addr,
        dst_addr,
        transport,
    })
}

fn parse_tcp(data: &[u8]) -> Result<Transport<'_>> {
    let pkt = TcpPacket::new_checked(data)
        .map_err(|e| NetStackError::InvalidPacket(format!("TCP: {}", e)))?;

    let header_len = pkt.header_len() as usize;
    Ok(Transport::Tcp(TcpSegment {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
        },
        window: pkt.window_len(),
        payload: &data[header_len.min(data.len())..],
    }))
}

fn parse_udp(data: &[u8]) -> Result<Transport<'_>> {
    let pkt = UdpPacket::new_checked(data)
        .map_err(|e| NetStackError::InvalidPacket(format!("UDP: {}", e)))?;

    Ok(Transport::Udp(UdpDatagram {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        payload: &data[UDP_HEADER_LEN..],
    }))
}

/// Build a client-bound IPv4 TCP packet.
///
/// Header policy for emitted packets: IHL 5 (no options), identification 0
/// with DF set, TTL 64, data offset 5, window 65535.
#[allow(clippy::too_many_arguments)]
pub fn build_ipv4_tcp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = IPV4_HEADER_LEN + TCP_HEADER_LEN + payload.len();
    let mut pkt = vec![0u8; total_len];

    write_ipv4_header(&mut pkt, src_ip, dst_ip, total_len, 6);

    let tcp = &mut pkt[IPV4_HEADER_LEN..];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
    tcp[13] = flags.to_byte();
    tcp[14..16].copy_from_slice(&TCP_WINDOW.to_be_bytes());
    tcp[20..].copy_from_slice(payload);

    let cksum = transport_checksum(&src_ip.octets(), &dst_ip.octets(), 6, &pkt[IPV4_HEADER_LEN..]);
    pkt[IPV4_HEADER_LEN + 16..IPV4_HEADER_LEN + 18].copy_from_slice(&cksum.to_be_bytes());

    pkt
}

/// Build a client-bound IPv4 UDP packet (DNS replies).
pub fn build_ipv4_udp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let mut pkt = vec![0u8; total_len];

    write_ipv4_header(&mut pkt, src_ip, dst_ip, total_len, 17);

    let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
    let udp = &mut pkt[IPV4_HEADER_LEN..];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
    udp[8..].copy_from_slice(payload);

    let cksum = udp_checksum(&src_ip.octets(), &dst_ip.octets(), &pkt[IPV4_HEADER_LEN..]);
    pkt[IPV4_HEADER_LEN + 6..IPV4_HEADER_LEN + 8].copy_from_slice(&cksum.to_be_bytes());

    pkt
}

fn write_ipv4_header(
    pkt: &mut [u8],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    total_len: usize,
    protocol: u8,
) {
    pkt[0] = 0x45;
    pkt[1] = 0x00;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    // identification 0; DF makes that safe.
    pkt[4..6].copy_from_slice(&[0, 0]);
    pkt[6..8].copy_from_slice(&IPV4_FLAGS_DF.to_be_bytes());
    pkt[8] = IPV4_TTL;
    pkt[9] = protocol;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());

    let cksum = checksum(&pkt[..IPV4_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&cksum.to_be_bytes());
}

/// One's-complement sum over 16-bit words, then complemented.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// Checksum over the IPv4 pseudo-header plus the transport segment.
pub fn transport_checksum(src: &[u8; 4], dst: &[u8; 4], proto: u8, data: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = sum.wrapping_add(((src[0] as u32) << 8) | src[1] as u32);
    sum = sum.wrapping_add(((src[2] as u32) << 8) | src[3] as u32);
    sum = sum.wrapping_add(((dst[0] as u32) << 8) | dst[1] as u32);
    sum = sum.wrapping_add(((dst[2] as u32) << 8) | dst[3] as u32);
    sum = sum.wrapping_add(proto as u32);
    sum = sum.wrapping_add(data.len() as u32);
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

fn udp_checksum(src: &[u8; 4], dst: &[u8; 4], udp: &[u8]) -> u16 {
    // A computed zero is transmitted as all-ones for UDP.
    let cksum = transport_checksum(src, dst, 17, udp);
    if cksum == 0 { 0xFFFF } else { cksum }
}
