//! Interface plumbing shared by both agents. Each interface pairs a pnet
//! datalink sender with its addresses; receivers are kept separate because
//! simultaneous borrows to both the tx and rx are almost always needed.

use anyhow::bail;
use log::warn;
use pnet::datalink::{
    self, Channel::Ethernet, Config, DataLinkReceiver, DataLinkSender, NetworkInterface,
};
use pnet::ipnetwork::IpNetwork;
use pnet::util::MacAddr;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Transmit seam: production sends through a pnet channel, tests record.
pub trait FrameTx: Send {
    fn send(&mut self, frame: &[u8]);
}

struct DatalinkTx(Box<dyn DataLinkSender>);

impl FrameTx for DatalinkTx {
    fn send(&mut self, frame: &[u8]) {
        self.0.build_and_send(1, frame.len(), &mut |outbound| {
            outbound.clone_from_slice(frame);
        });
    }
}

/// Maps a host-order IPv4 address to the MAC it was last seen from.
/// Stands in for the host's ARP service: the receive loop feeds it from
/// incoming control traffic.
pub type ArpCache = Arc<Mutex<HashMap<u32, MacAddr>>>;

pub struct Iface {
    pub name: String,
    pub mac: MacAddr,
    /// Host-order IPv4 address, 0 when the interface carries none.
    pub ip: u32,
    pub mask: u32,
    tx: Box<dyn FrameTx>,
    arp: ArpCache,
}

impl Iface {
    pub fn new(
        name: String,
        mac: MacAddr,
        ip: u32,
        mask: u32,
        tx: Box<dyn FrameTx>,
        arp: ArpCache,
    ) -> Self {
        Iface {
            name,
            mac,
            ip,
            mask,
            tx,
            arp,
        }
    }

    pub fn send(&mut self, frame: &[u8]) {
        self.tx.send(frame);
    }

    /// Unicast send: fills in the destination MAC from the ARP cache. A miss
    /// drops the frame; control traffic is best-effort and the next periodic
    /// emission will retry.
    pub fn send_by_arp(&mut self, dst_ip: u32, frame: &mut [u8]) {
        let resolved = self.arp.lock().unwrap().get(&dst_ip).copied();
        let Some(mac) = resolved else {
            warn!(
                "{}: no arp entry for {}, dropping frame",
                self.name,
                Ipv4Addr::from(dst_ip)
            );
            return;
        };
        frame[0..6].copy_from_slice(&mac.octets());
        self.tx.send(frame);
    }
}

fn open_port(
    intf: &NetworkInterface,
    poll_timeout: Option<Duration>,
    arp: &ArpCache,
) -> anyhow::Result<(Iface, Box<dyn DataLinkReceiver>)> {
    let port_cfg = Config {
        read_timeout: poll_timeout,
        ..Config::default()
    };
    let Ok(Ethernet(tx, rx)) = datalink::channel(intf, port_cfg) else {
        bail!("Failed to open ethernet channel on interface: {:#?}", intf);
    };
    let Some(mac) = intf.mac else {
        bail!("Cannot use interface {} without a mac address", intf.name);
    };
    let (ip, mask) = intf
        .ips
        .iter()
        .find_map(|net| match net {
            IpNetwork::V4(v4) => Some((u32::from(v4.ip()), u32::from(v4.mask()))),
            _ => None,
        })
        .unwrap_or((0, 0));
    Ok((
        Iface::new(
            intf.name.clone(),
            mac,
            ip,
            mask,
            Box::new(DatalinkTx(tx)),
            arp.clone(),
        ),
        rx,
    ))
}

/// Opens every OS interface whose name contains `filter` (the emulated
/// network names ports `<node>-eth<n>`). Returns the interfaces alongside
/// their receivers, index-aligned.
pub fn open_ifaces(
    filter: &str,
    poll_timeout: Option<Duration>,
    arp: &ArpCache,
) -> anyhow::Result<(Vec<Iface>, Vec<Box<dyn DataLinkReceiver>>)> {
    let mut ifaces = Vec::new();
    let mut inbound = Vec::new();
    for intf in datalink::interfaces()
        .iter()
        .filter(|intf| intf.name.contains(filter))
    {
        let (iface, rx) = open_port(intf, poll_timeout, arp)?;
        ifaces.push(iface);
        inbound.push(rx);
    }
    if ifaces.is_empty() {
        bail!("Failed to identify any viable interfaces matching {filter:?}");
    }
    Ok((ifaces, inbound))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records every sent frame for assertion.
    #[derive(Clone, Default)]
    pub struct RecordTx(pub Arc<Mutex<Vec<Vec<u8>>>>);

    impl FrameTx for RecordTx {
        fn send(&mut self, frame: &[u8]) {
            self.0.lock().unwrap().push(frame.to_vec());
        }
    }

    /// Builds an in-memory interface plus a handle on its outbound frames.
    pub fn test_iface(
        name: &str,
        mac: MacAddr,
        ip: u32,
        mask: u32,
        arp: &ArpCache,
    ) -> (Iface, Arc<Mutex<Vec<Vec<u8>>>>) {
        let tx = RecordTx::default();
        let sent = tx.0.clone();
        (
            Iface::new(name.to_string(), mac, ip, mask, Box::new(tx), arp.clone()),
            sent,
        )
    }
}
