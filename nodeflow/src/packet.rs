//! Decoding of the L2 frame embedded in monitor events. Unlike the
//! monitor headers, packet fields are big endian.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Error, Result};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;
pub const IP_PROTO_ICMPV6: u8 = 58;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EthernetHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ether_type: [u8; 2],
}

impl EthernetHeader {
    pub fn ether_type(&self) -> u16 {
        u16::from_be_bytes(self.ether_type)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub dscp_ecn: u8,
    pub total_len: [u8; 2],
    pub identification: [u8; 2],
    pub flags_frag: [u8; 2],
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

impl Ipv4Header {
    /// Header length in bytes, accounting for options.
    pub fn header_len(&self) -> usize {
        ((self.version_ihl & 0x0f) as usize) * 4
    }

    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src)
    }

    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Ipv6Header {
    pub version_class_flow: [u8; 4],
    pub payload_len: [u8; 2],
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: [u8; 16],
    pub dst: [u8; 16],
}

impl Ipv6Header {
    pub fn source(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.src)
    }

    pub fn destination(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.dst)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcpHeader {
    pub source_port: [u8; 2],
    pub destination_port: [u8; 2],
    pub sequence: [u8; 4],
    pub acknowledgment: [u8; 4],
    pub offset_reserved: u8,
    pub flags: u8,
    pub window: [u8; 2],
    pub checksum: [u8; 2],
    pub urgent: [u8; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UdpHeader {
    pub source_port: [u8; 2],
    pub destination_port: [u8; 2],
    pub length: [u8; 2],
    pub checksum: [u8; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IcmpV4Header {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: [u8; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IcmpV6Header {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: [u8; 2],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
    pub ns: bool,
}

impl TcpFlags {
    fn from_header(hdr: &TcpHeader) -> Self {
        Self {
            fin: hdr.flags & 0x01 != 0,
            syn: hdr.flags & 0x02 != 0,
            rst: hdr.flags & 0x04 != 0,
            psh: hdr.flags & 0x08 != 0,
            ack: hdr.flags & 0x10 != 0,
            urg: hdr.flags & 0x20 != 0,
            ece: hdr.flags & 0x40 != 0,
            cwr: hdr.flags & 0x80 != 0,
            ns: hdr.offset_reserved & 0x01 != 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct L3 {
    pub src: IpAddr,
    pub dst: IpAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L4 {
    Tcp {
        source_port: u16,
        destination_port: u16,
        flags: TcpFlags,
    },
    Udp {
        source_port: u16,
        destination_port: u16,
    },
    IcmpV4 {
        icmp_type: u8,
        code: u8,
    },
    IcmpV6 {
        icmp_type: u8,
        code: u8,
    },
}

/// The layers that could be decoded from a frame. Captures are often
/// truncated, so deeper layers degrade to `None` instead of failing the
/// whole event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    pub l3: Option<L3>,
    pub l4: Option<L4>,
}

/// Decodes an Ethernet frame down to the transport layer. A missing or
/// short L2/L3 header is an error; anything below that is best effort.
pub fn decode_frame(frame: &[u8]) -> Result<Decoded> {
    let (eth, rest) = EthernetHeader::read_from_prefix(frame)
        .map_err(|_| Error::TruncatedHeader("ethernet"))?;

    match eth.ether_type() {
        ETHERTYPE_IPV4 => decode_ipv4(rest),
        ETHERTYPE_IPV6 => decode_ipv6(rest),
        other => Err(Error::UnknownEtherType(other)),
    }
}

fn decode_ipv4(data: &[u8]) -> Result<Decoded> {
    let (hdr, _) =
        Ipv4Header::read_from_prefix(data).map_err(|_| Error::TruncatedHeader("ipv4"))?;
    let l3 = L3 {
        src: hdr.source().into(),
        dst: hdr.destination().into(),
    };

    // Options sit between the fixed header and the transport layer.
    let header_len = hdr.header_len().max(std::mem::size_of::<Ipv4Header>());
    let rest = match data.get(header_len..) {
        Some(rest) => rest,
        None => {
            return Ok(Decoded {
                l3: Some(l3),
                l4: None,
            });
        }
    };

    let l4 = match hdr.protocol {
        IP_PROTO_TCP => decode_tcp(rest),
        IP_PROTO_UDP => decode_udp(rest),
        IP_PROTO_ICMP => IcmpV4Header::read_from_prefix(rest)
            .ok()
            .map(|(h, _)| L4::IcmpV4 {
                icmp_type: h.icmp_type,
                code: h.code,
            }),
        _ => None,
    };
    Ok(Decoded { l3: Some(l3), l4 })
}

fn decode_ipv6(data: &[u8]) -> Result<Decoded> {
    let (hdr, rest) =
        Ipv6Header::read_from_prefix(data).map_err(|_| Error::TruncatedHeader("ipv6"))?;
    let l3 = L3 {
        src: hdr.source().into(),
        dst: hdr.destination().into(),
    };

    // Extension headers are not walked; captures carrying them only
    // yield L3.
    let l4 = match hdr.next_header {
        IP_PROTO_TCP => decode_tcp(rest),
        IP_PROTO_UDP => decode_udp(rest),
        IP_PROTO_ICMPV6 => IcmpV6Header::read_from_prefix(rest)
            .ok()
            .map(|(h, _)| L4::IcmpV6 {
                icmp_type: h.icmp_type,
                code: h.code,
            }),
        _ => None,
    };
    Ok(Decoded { l3: Some(l3), l4 })
}

fn decode_tcp(data: &[u8]) -> Option<L4> {
    let (hdr, _) = TcpHeader::read_from_prefix(data).ok()?;
    Some(L4::Tcp {
        source_port: u16::from_be_bytes(hdr.source_port),
        destination_port: u16::from_be_bytes(hdr.destination_port),
        flags: TcpFlags::from_header(&hdr),
    })
}

fn decode_udp(data: &[u8]) -> Option<L4> {
    let (hdr, _) = UdpHeader::read_from_prefix(data).ok()?;
    Some(L4::Udp {
        source_port: u16::from_be_bytes(hdr.source_port),
        destination_port: u16::from_be_bytes(hdr.destination_port),
    })
}
