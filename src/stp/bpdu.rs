//! Config BPDU wire format. BPDUs ride inside an 802.3 frame whose
//! ether_type field carries the payload length, followed by an LLC header.
//! All multi-byte fields are stored network-order; accessors convert.

use crate::wire::{ETHER_HDR_SIZE, LLC_HDR_SIZE};
use bytemuck::{Pod, Zeroable};
use pnet::packet::ethernet::{EtherType, MutableEthernetPacket};
use pnet::util::MacAddr;
use std::mem;

/// Reserved multicast address for 802.1D bridge protocol traffic.
pub const ETH_STP_ADDR: MacAddr = MacAddr(0x01, 0x80, 0xc2, 0x00, 0x00, 0x01);

pub const STP_PROTOCOL_ID: u16 = 0x0000;
pub const STP_PROTOCOL_VERSION: u8 = 0x00;
pub const STP_TYPE_CONFIG: u8 = 0x00;
pub const STP_TYPE_TCN: u8 = 0x80;

pub const STP_BRIDGE_PRIORITY: u16 = 0x8000;
pub const STP_PORT_PRIORITY: u8 = 0x80;

/// Timer values in milliseconds; they double as the raw wire fields.
pub const STP_HELLO_TIME: u16 = 2_000;
pub const STP_MAX_AGE: u16 = 20_000;
pub const STP_FWD_DELAY: u16 = 15_000;

pub const LLC_DSAP_SNAP: u8 = 0xaa;
pub const LLC_SSAP_SNAP: u8 = 0xaa;
pub const LLC_CNTL_SNAP: u8 = 0x03;

/// Leading bytes common to every BPDU type, decoded first so short TCN
/// frames can still be classified.
#[repr(C, packed)]
#[derive(Pod, Zeroable, Copy, Clone)]
pub struct StpHeader {
    proto_id: u16,
    version: u8,
    msg_type: u8,
}

impl StpHeader {
    pub const SIZE: usize = mem::size_of::<Self>();

    pub fn msg_type(&self) -> u8 {
        self.msg_type
    }
}

#[repr(C, packed)]
#[derive(Pod, Zeroable, Copy, Clone)]
pub struct ConfigBpdu {
    proto_id: u16,
    version: u8,
    msg_type: u8,
    flags: u8,
    root_id: u64,
    root_path_cost: u32,
    switch_id: u64,
    port_id: u16,
    msg_age: u16,
    max_age: u16,
    hello_time: u16,
    fwd_delay: u16,
}

impl ConfigBpdu {
    pub const SIZE: usize = mem::size_of::<Self>();

    pub fn new(root_id: u64, root_path_cost: u32, switch_id: u64, port_id: u16) -> Self {
        ConfigBpdu {
            proto_id: STP_PROTOCOL_ID.to_be(),
            version: STP_PROTOCOL_VERSION,
            msg_type: STP_TYPE_CONFIG,
            flags: 0,
            root_id: root_id.to_be(),
            root_path_cost: root_path_cost.to_be(),
            switch_id: switch_id.to_be(),
            port_id: port_id.to_be(),
            msg_age: 0u16.to_be(),
            max_age: STP_MAX_AGE.to_be(),
            hello_time: STP_HELLO_TIME.to_be(),
            fwd_delay: STP_FWD_DELAY.to_be(),
        }
    }

    pub fn root_id(&self) -> u64 {
        u64::from_be(self.root_id)
    }

    pub fn root_path_cost(&self) -> u32 {
        u32::from_be(self.root_path_cost)
    }

    pub fn switch_id(&self) -> u64 {
        u64::from_be(self.switch_id)
    }

    pub fn port_id(&self) -> u16 {
        u16::from_be(self.port_id)
    }
}

pub const STP_FRAME_SIZE: usize = ETHER_HDR_SIZE + LLC_HDR_SIZE + ConfigBpdu::SIZE;

/// Builds the full Ethernet + LLC + BPDU frame for one port.
pub fn encode_frame(src_mac: MacAddr, bpdu: &ConfigBpdu) -> [u8; STP_FRAME_SIZE] {
    let mut buf = [0u8; STP_FRAME_SIZE];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf)
            .expect("Bpdu frame size is constant and accomodates the ethernet header");
        eth.set_destination(ETH_STP_ADDR);
        eth.set_source(src_mac);
        // 802.3: the type field holds the payload length
        eth.set_ethertype(EtherType::new((LLC_HDR_SIZE + ConfigBpdu::SIZE) as u16));
    }
    buf[ETHER_HDR_SIZE] = LLC_DSAP_SNAP;
    buf[ETHER_HDR_SIZE + 1] = LLC_SSAP_SNAP;
    buf[ETHER_HDR_SIZE + 2] = LLC_CNTL_SNAP;
    buf[ETHER_HDR_SIZE + LLC_HDR_SIZE..].copy_from_slice(bytemuck::bytes_of(bpdu));
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::pod_at;
    use pnet::packet::ethernet::EthernetPacket;

    #[test]
    fn config_bpdu_layout() {
        assert_eq!(ConfigBpdu::SIZE, 35);
        assert_eq!(STP_FRAME_SIZE, 52);
    }

    #[test]
    fn encode_then_decode() {
        let src = MacAddr(0, 0, 0, 0, 0, 0x2a);
        let bpdu = ConfigBpdu::new(0x8000_0000_0000_0001, 7, 0x8000_0000_0000_0002, 0x8001);
        let frame = encode_frame(src, &bpdu);

        let eth = EthernetPacket::new(&frame).unwrap();
        assert_eq!(eth.get_destination(), ETH_STP_ADDR);
        assert_eq!(eth.get_source(), src);
        assert_eq!(eth.get_ethertype().0 as usize, LLC_HDR_SIZE + ConfigBpdu::SIZE);

        let hdr: StpHeader = pod_at(&frame, ETHER_HDR_SIZE + LLC_HDR_SIZE).unwrap();
        assert_eq!(hdr.msg_type(), STP_TYPE_CONFIG);

        let decoded: ConfigBpdu = pod_at(&frame, ETHER_HDR_SIZE + LLC_HDR_SIZE).unwrap();
        assert_eq!(decoded.root_id(), 0x8000_0000_0000_0001);
        assert_eq!(decoded.root_path_cost(), 7);
        assert_eq!(decoded.switch_id(), 0x8000_0000_0000_0002);
        assert_eq!(decoded.port_id(), 0x8001);
    }
}
