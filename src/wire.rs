//! Framing helpers shared by both cores. Wire structs live next to their
//! protocols (`stp::bpdu`, `mospf::proto`); this module holds the header
//! offsets, the decode entry point, and the IPv4 carrier builder.

use bytemuck::Pod;
use pnet::packet::ipv4::{self, Ipv4Flags, MutableIpv4Packet};
use pnet::packet::ip::IpNextHeaderProtocol;
use std::mem;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const ETHER_HDR_SIZE: usize = 14;
pub const LLC_HDR_SIZE: usize = 3;
pub const IP_BASE_HDR_SIZE: usize = 20;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

/// Decodes a wire struct at `off`, copying out of the (possibly unaligned)
/// frame buffer.
pub fn pod_at<T: Pod>(buf: &[u8], off: usize) -> Result<T, ParseError> {
    let need = off + mem::size_of::<T>();
    if buf.len() < need {
        return Err(ParseError::Truncated {
            need,
            have: buf.len(),
        });
    }
    Ok(bytemuck::pod_read_unaligned(&buf[off..need]))
}

/// Writes a 20-byte IPv4 header with computed checksum into `buf`.
/// Addresses are host-order u32.
#[allow(clippy::too_many_arguments)]
pub fn fill_ipv4(
    buf: &mut [u8],
    total_len: u16,
    id: u16,
    dont_fragment: bool,
    ttl: u8,
    protocol: u8,
    saddr: u32,
    daddr: u32,
) {
    let mut ip = MutableIpv4Packet::new(buf).expect("ip buffer sized by caller");
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_dscp(0);
    ip.set_ecn(0);
    ip.set_total_length(total_len);
    ip.set_identification(id);
    ip.set_flags(if dont_fragment {
        Ipv4Flags::DontFragment
    } else {
        0
    });
    ip.set_fragment_offset(0);
    ip.set_ttl(ttl);
    ip.set_next_level_protocol(IpNextHeaderProtocol::new(protocol));
    ip.set_source(Ipv4Addr::from(saddr));
    ip.set_destination(Ipv4Addr::from(daddr));
    ip.set_checksum(0);
    let sum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(sum);
}

/// Rewrites source/destination of an existing IPv4 header and fixes up the
/// header checksum. Used when cloning a packet template per neighbor.
pub fn patch_ipv4_addrs(ip_buf: &mut [u8], saddr: u32, daddr: u32) {
    let mut ip = MutableIpv4Packet::new(ip_buf).expect("ip header present");
    ip.set_source(Ipv4Addr::from(saddr));
    ip.set_destination(Ipv4Addr::from(daddr));
    ip.set_checksum(0);
    let sum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(sum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ipv4::Ipv4Packet;

    #[test]
    fn ipv4_header_round_trips() {
        let mut buf = [0u8; IP_BASE_HDR_SIZE];
        fill_ipv4(&mut buf, 44, 7, true, 64, 90, 0x0a000001, 0xe0000005);
        let ip = Ipv4Packet::new(&buf).unwrap();
        assert_eq!(ip.get_version(), 4);
        assert_eq!(ip.get_total_length(), 44);
        assert_eq!(ip.get_flags(), Ipv4Flags::DontFragment);
        assert_eq!(ip.get_next_level_protocol().0, 90);
        assert_eq!(u32::from(ip.get_source()), 0x0a000001);
        assert_eq!(u32::from(ip.get_destination()), 0xe0000005);
        assert_eq!(ipv4::checksum(&ip), ip.get_checksum());
    }

    #[test]
    fn pod_at_rejects_short_frames() {
        let buf = [0u8; 3];
        assert!(pod_at::<u32>(&buf, 0).is_err());
        assert!(pod_at::<u16>(&buf, 0).is_ok());
    }
}
