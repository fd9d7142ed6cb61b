//! mOSPF instance: neighbor discovery over multicast Hellos, link-state
//! flooding over unicast LSUs, and the thread plumbing around them. All
//! instance state lives behind one lock; the routing table has its own,
//! always taken second.

use crate::iface::{ArpCache, Iface};
use crate::mospf::database::{Lsa, Lsdb};
use crate::mospf::nbr::Neighbor;
use crate::mospf::proto::{
    self, MospfHdr, MospfHello, MospfLsa, MospfLsu, DEFAULT_TTL, MOSPF_ALL_SPF_MAC,
    MOSPF_ALL_SPF_ROUTERS, MOSPF_DEFAULT_HELLOINT, MOSPF_DEFAULT_LSUINT, MOSPF_MAX_LSU_TTL,
    MOSPF_NEIGHBOR_TIMEOUT, MOSPF_PROTO, MOSPF_TYPE_HELLO, MOSPF_TYPE_LSU, MOSPF_VERSION,
};
use crate::mospf::spf;
use crate::rtable::Rtable;
use crate::wire::{self, ETHER_HDR_SIZE, IP_BASE_HDR_SIZE};
use anyhow::bail;
use log::error;
use pnet::datalink::DataLinkReceiver;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet::packet::Packet;
use std::io::ErrorKind;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub struct RouterIface {
    pub iface: Iface,
    pub helloint: u16,
    pub nbrs: Vec<Neighbor>,
}

pub struct Router {
    /// The IPv4 address of the first interface, host order.
    pub router_id: u32,
    pub area_id: u32,
    pub sequence_num: u16,
    /// Seconds between unforced LSU emissions.
    pub lsuint: u16,
    pub ifaces: Vec<RouterIface>,
    pub lsdb: Lsdb,
    /// Set on any neighbor insertion or expiry; cleared once per LSU pass.
    pub nbr_changed: bool,
}

impl Router {
    pub fn new(ifaces: Vec<Iface>) -> anyhow::Result<Self> {
        let Some(first) = ifaces.first() else {
            bail!("Cannot run mospf without interfaces");
        };
        let router_id = first.ip;
        Ok(Router {
            router_id,
            area_id: 0,
            sequence_num: 0,
            lsuint: MOSPF_DEFAULT_LSUINT,
            ifaces: ifaces
                .into_iter()
                .map(|iface| RouterIface {
                    iface,
                    helloint: MOSPF_DEFAULT_HELLOINT,
                    nbrs: Vec::new(),
                })
                .collect(),
            lsdb: Lsdb::new(),
            nbr_changed: false,
        })
    }

    /// Emits one Hello per interface to 224.0.0.5.
    pub fn send_hello(&mut self) {
        let mospf_len = MospfHdr::SIZE + MospfHello::SIZE;
        let off = ETHER_HDR_SIZE + IP_BASE_HDR_SIZE;
        let mut template = vec![0u8; off + mospf_len];
        {
            let mut eth =
                MutableEthernetPacket::new(&mut template).expect("template sized above");
            eth.set_destination(MOSPF_ALL_SPF_MAC);
            eth.set_ethertype(EtherTypes::Ipv4);
        }
        wire::fill_ipv4(
            &mut template[ETHER_HDR_SIZE..],
            (IP_BASE_HDR_SIZE + mospf_len) as u16,
            0,
            false,
            DEFAULT_TTL,
            MOSPF_PROTO,
            0,
            MOSPF_ALL_SPF_ROUTERS,
        );
        let hdr = MospfHdr::new(
            MOSPF_TYPE_HELLO,
            mospf_len as u16,
            self.router_id,
            self.area_id,
        );
        template[off..off + MospfHdr::SIZE].copy_from_slice(bytemuck::bytes_of(&hdr));

        for rif in &mut self.ifaces {
            let mut frame = template.clone();
            let hello = MospfHello::new(rif.iface.mask, rif.helloint);
            frame[off + MospfHdr::SIZE..off + mospf_len]
                .copy_from_slice(bytemuck::bytes_of(&hello));
            proto::write_mospf_checksum(&mut frame, off, mospf_len);
            wire::patch_ipv4_addrs(
                &mut frame[ETHER_HDR_SIZE..],
                rif.iface.ip,
                MOSPF_ALL_SPF_ROUTERS,
            );
            frame[6..12].copy_from_slice(&rif.iface.mac.octets());
            rif.iface.send(&frame);
        }
    }

    fn handle_hello(&mut self, ifidx: usize, saddr: u32, rid: u32, mask: u32) {
        let rif = &mut self.ifaces[ifidx];
        if let Some(nbr) = rif.nbrs.iter_mut().find(|n| n.rid == rid) {
            nbr.alive = MOSPF_NEIGHBOR_TIMEOUT;
            return;
        }
        rif.nbrs.push(Neighbor {
            rid,
            ip: saddr,
            mask,
            alive: MOSPF_NEIGHBOR_TIMEOUT,
        });
        self.nbr_changed = true;
    }

    /// One liveness tick: every neighbor's countdown drops by a second and
    /// expired ones are removed. Returns whether anything expired.
    pub fn age_neighbors(&mut self) -> bool {
        let mut expired = false;
        for rif in &mut self.ifaces {
            rif.nbrs.retain_mut(|nbr| {
                nbr.alive -= 1;
                if nbr.alive == 0 {
                    expired = true;
                    false
                } else {
                    true
                }
            });
        }
        if expired {
            self.nbr_changed = true;
        }
        expired
    }

    /// The advertisements this router would flood right now: one stub LSA
    /// per neighbor-less interface, one LSA per neighbor otherwise.
    pub fn build_self_lsas(&self) -> Vec<Lsa> {
        let mut lsas = Vec::new();
        for rif in &self.ifaces {
            if rif.nbrs.is_empty() {
                lsas.push(Lsa {
                    subnet: rif.iface.ip & rif.iface.mask,
                    mask: rif.iface.mask,
                    rid: 0,
                });
            }
            for nbr in &rif.nbrs {
                lsas.push(Lsa {
                    subnet: nbr.ip & nbr.mask,
                    mask: nbr.mask,
                    rid: nbr.rid,
                });
            }
        }
        lsas
    }

    /// Refreshes the local LSDB entry and unicasts the new LSU to every
    /// known neighbor. The local entry's seq always equals the wire seq.
    pub fn emit_lsu(&mut self) {
        let lsas = self.build_self_lsas();
        self.sequence_num = self.sequence_num.wrapping_add(1);
        let seq = self.sequence_num;
        self.lsdb.upsert(self.router_id, seq, lsas.clone());

        let template =
            build_lsu_packet(self.router_id, self.area_id, seq, MOSPF_MAX_LSU_TTL, &lsas);
        for rif in &mut self.ifaces {
            let RouterIface { iface, nbrs, .. } = rif;
            for nbr in nbrs.iter() {
                let mut frame = template.clone();
                wire::patch_ipv4_addrs(&mut frame[ETHER_HDR_SIZE..], iface.ip, nbr.ip);
                frame[6..12].copy_from_slice(&iface.mac.octets());
                iface.send_by_arp(nbr.ip, &mut frame);
            }
        }
    }

    /// Validates and dispatches a received mOSPF frame. Returns true when
    /// the LSDB changed, i.e. the caller should re-run SPF.
    pub fn handle_packet(&mut self, ifidx: usize, frame: &[u8]) -> bool {
        if frame.len() < ETHER_HDR_SIZE + IP_BASE_HDR_SIZE {
            error!("received runt mospf frame ({} bytes)", frame.len());
            return false;
        }
        let Some(ip) = Ipv4Packet::new(&frame[ETHER_HDR_SIZE..]) else {
            error!("received frame with unparsable ip header");
            return false;
        };
        let saddr = u32::from(ip.get_source());
        let off = ETHER_HDR_SIZE + ip.get_header_length() as usize * 4;

        let hdr: MospfHdr = match wire::pod_at(frame, off) {
            Ok(h) => h,
            Err(e) => {
                error!("received truncated mospf packet: {e}");
                return false;
            }
        };
        if hdr.version() != MOSPF_VERSION {
            error!(
                "received mospf packet with incorrect version ({})",
                hdr.version()
            );
            return false;
        }
        let len = hdr.len() as usize;
        if len < MospfHdr::SIZE || frame.len() < off + len {
            error!("received mospf packet with bad length ({len})");
            return false;
        }
        if hdr.checksum() != proto::mospf_checksum(&frame[off..off + len]) {
            error!("received mospf packet with incorrect checksum");
            return false;
        }
        if hdr.aid() != self.area_id {
            error!("received mospf packet with incorrect area id");
            return false;
        }

        match hdr.typ() {
            MOSPF_TYPE_HELLO => {
                match wire::pod_at::<MospfHello>(frame, off + MospfHdr::SIZE) {
                    Ok(hello) => self.handle_hello(ifidx, saddr, hdr.rid(), hello.mask()),
                    Err(e) => error!("received truncated hello: {e}"),
                }
                false
            }
            MOSPF_TYPE_LSU => self.handle_lsu(ifidx, frame, off, &hdr),
            t => {
                error!("received mospf packet with unknown type ({t})");
                false
            }
        }
    }

    /// Installs a newer LSU and floods it out every other interface, one
    /// copy per neighbor, with both TTLs decremented. Stale sequence
    /// numbers are discarded without a flood.
    fn handle_lsu(&mut self, ifidx: usize, frame: &[u8], off: usize, hdr: &MospfHdr) -> bool {
        let lsu: MospfLsu = match wire::pod_at(frame, off + MospfHdr::SIZE) {
            Ok(l) => l,
            Err(e) => {
                error!("received truncated lsu: {e}");
                return false;
            }
        };

        let nadv = lsu.nadv() as usize;
        let lsa_off = off + MospfHdr::SIZE + MospfLsu::SIZE;
        let mut lsas = Vec::with_capacity(nadv);
        for i in 0..nadv {
            match wire::pod_at::<MospfLsa>(frame, lsa_off + i * MospfLsa::SIZE) {
                Ok(w) => lsas.push(Lsa {
                    subnet: w.subnet(),
                    mask: w.mask(),
                    rid: w.rid(),
                }),
                Err(e) => {
                    error!("received lsu with truncated lsa list: {e}");
                    return false;
                }
            }
        }

        let entry = self.lsdb.get_or_insert(hdr.rid());
        if lsu.seq() <= entry.seq {
            return false;
        }
        entry.seq = lsu.seq();
        entry.lsas = lsas;

        let mut fwd = frame.to_vec();
        let lsu_off = off + MospfHdr::SIZE;
        fwd[lsu_off + 2..lsu_off + 4]
            .copy_from_slice(&lsu.ttl().saturating_sub(1).to_be_bytes());
        {
            let mut ip = MutableIpv4Packet::new(&mut fwd[ETHER_HDR_SIZE..])
                .expect("ip header validated above");
            let ttl = ip.get_ttl().saturating_sub(1);
            ip.set_ttl(ttl);
        }
        proto::write_mospf_checksum(&mut fwd, off, hdr.len() as usize);

        for (i, rif) in self.ifaces.iter_mut().enumerate() {
            if i == ifidx {
                continue;
            }
            let RouterIface { iface, nbrs, .. } = rif;
            for nbr in nbrs.iter() {
                let mut out = fwd.clone();
                wire::patch_ipv4_addrs(&mut out[ETHER_HDR_SIZE..], iface.ip, nbr.ip);
                out[6..12].copy_from_slice(&iface.mac.octets());
                iface.send_by_arp(nbr.ip, &mut out);
            }
        }
        true
    }
}

/// Builds a complete LSU frame with zeroed ethernet addresses; the sender
/// patches addresses per neighbor.
fn build_lsu_packet(rid: u32, aid: u32, seq: u16, ttl: u16, lsas: &[Lsa]) -> Vec<u8> {
    let mospf_len = MospfHdr::SIZE + MospfLsu::SIZE + MospfLsa::SIZE * lsas.len();
    let off = ETHER_HDR_SIZE + IP_BASE_HDR_SIZE;
    let mut frame = vec![0u8; off + mospf_len];
    {
        let mut eth = MutableEthernetPacket::new(&mut frame).expect("frame sized above");
        eth.set_ethertype(EtherTypes::Ipv4);
    }
    wire::fill_ipv4(
        &mut frame[ETHER_HDR_SIZE..],
        (IP_BASE_HDR_SIZE + mospf_len) as u16,
        rand::random(),
        true,
        DEFAULT_TTL,
        MOSPF_PROTO,
        0,
        0,
    );
    let hdr = MospfHdr::new(MOSPF_TYPE_LSU, mospf_len as u16, rid, aid);
    frame[off..off + MospfHdr::SIZE].copy_from_slice(bytemuck::bytes_of(&hdr));
    let lsu = MospfLsu::new(seq, ttl, lsas.len() as u32);
    frame[off + MospfHdr::SIZE..off + MospfHdr::SIZE + MospfLsu::SIZE]
        .copy_from_slice(bytemuck::bytes_of(&lsu));
    let mut pos = off + MospfHdr::SIZE + MospfLsu::SIZE;
    for lsa in lsas {
        let w = MospfLsa::new(lsa.subnet, lsa.mask, lsa.rid);
        frame[pos..pos + MospfLsa::SIZE].copy_from_slice(bytemuck::bytes_of(&w));
        pos += MospfLsa::SIZE;
    }
    proto::write_mospf_checksum(&mut frame, off, mospf_len);
    frame
}

/// The running daemon: instance state plus the routing table, with the
/// LSU emitter parked on a condvar so a neighbor change wakes it early.
/// Lock order is always instance before rtable.
pub struct Mospf {
    state: Mutex<Router>,
    lsu_wake: Condvar,
    rtable: Mutex<Rtable>,
}

impl Mospf {
    pub fn new(router: Router) -> Arc<Self> {
        Arc::new(Mospf {
            state: Mutex::new(router),
            lsu_wake: Condvar::new(),
            rtable: Mutex::new(Rtable::new()),
        })
    }

    /// Receive-path entry: handles one frame, wakes the LSU emitter on a
    /// neighbor change, re-runs SPF on an LSDB change.
    pub fn handle_frame(&self, ifidx: usize, frame: &[u8]) {
        let mut st = self.state.lock().unwrap();
        let installed = st.handle_packet(ifidx, frame);
        if st.nbr_changed {
            self.lsu_wake.notify_one();
        }
        if installed {
            let mut rt = self.rtable.lock().unwrap();
            spf::generate_rt(&st, &mut rt);
        }
    }

    fn hello_loop(&self) {
        let mut ticks = 0u32;
        loop {
            thread::sleep(Duration::from_secs(MOSPF_DEFAULT_HELLOINT as u64));
            let mut st = self.state.lock().unwrap();
            st.send_hello();
            ticks += 1;
            if ticks % 4 == 0 {
                st.lsdb.dump();
                let names: Vec<&str> =
                    st.ifaces.iter().map(|r| r.iface.name.as_str()).collect();
                self.rtable.lock().unwrap().dump(&names);
            }
        }
    }

    fn aging_loop(&self) {
        loop {
            thread::sleep(Duration::from_secs(1));
            let mut st = self.state.lock().unwrap();
            if st.age_neighbors() {
                self.lsu_wake.notify_one();
            }
        }
    }

    fn lsu_loop(&self) {
        loop {
            let mut st = self.state.lock().unwrap();
            let deadline = Instant::now() + Duration::from_secs(st.lsuint as u64);
            while !st.nbr_changed {
                let timeout = deadline.saturating_duration_since(Instant::now());
                if timeout.is_zero() {
                    break;
                }
                let (guard, _) = self.lsu_wake.wait_timeout(st, timeout).unwrap();
                st = guard;
            }
            st.nbr_changed = false;
            st.emit_lsu();
            let mut rt = self.rtable.lock().unwrap();
            spf::generate_rt(&st, &mut rt);
        }
    }

    /// Spawns the periodic threads and runs the receive loop inline. The
    /// ARP cache learns from every incoming mOSPF packet's source.
    pub fn run(
        self: Arc<Self>,
        mut inbound: Vec<Box<dyn DataLinkReceiver>>,
        arp: ArpCache,
    ) -> anyhow::Result<()> {
        let me = self.clone();
        thread::spawn(move || me.hello_loop());
        let me = self.clone();
        thread::spawn(move || me.aging_loop());
        let me = self.clone();
        thread::spawn(move || me.lsu_loop());

        loop {
            for (ifidx, rx) in inbound.iter_mut().enumerate() {
                let bytes = match rx.next() {
                    Ok(p) => p,
                    Err(e) => {
                        if e.kind() == ErrorKind::TimedOut {
                            continue;
                        }
                        bail!("Exiting on io error: {e:#?}");
                    }
                };
                let Some(eth_pkt) = EthernetPacket::new(bytes) else {
                    continue;
                };
                if eth_pkt.get_ethertype() != EtherTypes::Ipv4 {
                    continue;
                }
                let Some(ip) = Ipv4Packet::new(eth_pkt.payload()) else {
                    continue;
                };
                if ip.get_next_level_protocol().0 != MOSPF_PROTO {
                    // everything else belongs to the forwarding path
                    continue;
                }
                arp.lock()
                    .unwrap()
                    .insert(u32::from(ip.get_source()), eth_pkt.get_source());
                self.handle_frame(ifidx, bytes);
            }
        }
    }
}
