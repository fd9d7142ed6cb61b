//! Spanning-tree bridge core. The bridge owns one port per ethernet
//! interface, exchanges config BPDUs with its neighbors, and converges on a
//! loop-free tree by electing a root bridge and, per non-root bridge, a
//! root port. All state is guarded by one bridge-wide lock; the receive
//! loop and the timer thread both take it before touching anything.

pub mod bpdu;
pub mod timer;

use crate::iface::Iface;
use crate::wire::{self, ETHER_HDR_SIZE, LLC_HDR_SIZE};
use anyhow::bail;
use self::bpdu::{ConfigBpdu, StpHeader, STP_BRIDGE_PRIORITY, STP_PORT_PRIORITY};
use log::{error, info};
use pnet::datalink::DataLinkReceiver;
use pnet::packet::ethernet::EthernetPacket;
use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Every link has unit cost in this lab network.
const STP_PATH_COST: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Root,
    Designated,
    Alternate,
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRole::Root => f.write_str("ROOT"),
            PortRole::Designated => f.write_str("DESIGNATED"),
            PortRole::Alternate => f.write_str("ALTERNATE"),
        }
    }
}

/// The four-field quadruple BPDU election runs on. Lower is better; the
/// derived `Ord` gives the lexicographic comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityVector {
    root: u64,
    cost: u32,
    switch: u64,
    port: u16,
}

impl PriorityVector {
    fn of_bpdu(c: &ConfigBpdu) -> Self {
        PriorityVector {
            root: c.root_id(),
            cost: c.root_path_cost(),
            switch: c.switch_id(),
            port: c.port_id(),
        }
    }
}

pub struct StpPort {
    pub port_id: u16,
    pub path_cost: u32,
    pub designated_root: u64,
    pub designated_switch: u64,
    pub designated_port: u16,
    pub designated_cost: u32,
    iface: Iface,
}

impl StpPort {
    fn designated_vector(&self) -> PriorityVector {
        PriorityVector {
            root: self.designated_root,
            cost: self.designated_cost,
            switch: self.designated_switch,
            port: self.designated_port,
        }
    }
}

pub struct Stp {
    pub switch_id: u64,
    pub designated_root: u64,
    pub root_path_cost: u32,
    /// Index into `ports`; `None` while this bridge believes itself root.
    pub root_port: Option<usize>,
    ports: Vec<StpPort>,
    hello_timer: timer::Timer,
}

impl Stp {
    /// Builds the bridge over the given interfaces. The switch id is the
    /// configured priority in the high bytes over the first interface's MAC;
    /// every port starts out designated with this bridge as root.
    pub fn new(ifaces: Vec<Iface>) -> anyhow::Result<Self> {
        let Some(first) = ifaces.first() else {
            bail!("Cannot run a bridge without interfaces");
        };
        let mac: u64 = first
            .mac
            .octets()
            .iter()
            .fold(0, |acc, &b| (acc << 8) | b as u64);
        let switch_id = ((STP_BRIDGE_PRIORITY as u64) << 48) | mac;

        let ports = ifaces
            .into_iter()
            .enumerate()
            .map(|(i, iface)| {
                let port_id = ((STP_PORT_PRIORITY as u16) << 8) | (i as u16 + 1);
                StpPort {
                    port_id,
                    path_cost: STP_PATH_COST,
                    designated_root: switch_id,
                    designated_switch: switch_id,
                    designated_port: port_id,
                    designated_cost: 0,
                    iface,
                }
            })
            .collect();

        let mut hello_timer =
            timer::Timer::new(Duration::from_millis(bpdu::STP_HELLO_TIME as u64));
        hello_timer.start(Instant::now());

        Ok(Stp {
            switch_id,
            designated_root: switch_id,
            root_path_cost: 0,
            root_port: None,
            ports,
            hello_timer,
        })
    }

    pub fn is_root_switch(&self) -> bool {
        self.designated_root == self.switch_id
    }

    fn port_is_designated(&self, i: usize) -> bool {
        let p = &self.ports[i];
        p.designated_switch == self.switch_id && p.designated_port == p.port_id
    }

    pub fn port_role(&self, i: usize) -> PortRole {
        if self.root_port == Some(i) {
            PortRole::Root
        } else if self.port_is_designated(i) {
            PortRole::Designated
        } else {
            PortRole::Alternate
        }
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    fn port_send_config(&mut self, i: usize) {
        // A non-root bridge with no root port has no path to advertise.
        if !self.is_root_switch() && self.root_port.is_none() {
            return;
        }
        let config = ConfigBpdu::new(
            self.designated_root,
            self.root_path_cost,
            self.switch_id,
            self.ports[i].port_id,
        );
        let frame = bpdu::encode_frame(self.ports[i].iface.mac, &config);
        self.ports[i].iface.send(&frame);
    }

    /// Emits one config BPDU from every designated port.
    pub fn send_config(&mut self) {
        for i in 0..self.ports.len() {
            if self.port_is_designated(i) {
                self.port_send_config(i);
            }
        }
    }

    pub fn handle_hello_timeout(&mut self, now: Instant) {
        self.send_config();
        self.hello_timer.start(now);
    }

    #[cfg(test)]
    fn hello_running(&self) -> bool {
        self.hello_timer.is_running()
    }

    /// Root-ness is derived from `designated_root`; the hello timer follows
    /// every transition.
    fn sync_hello_timer(&mut self, was_root: bool, now: Instant) {
        let is_root = self.is_root_switch();
        if was_root && !is_root {
            self.hello_timer.stop();
        } else if !was_root && is_root {
            self.hello_timer.start(now);
        }
    }

    fn handle_config(&mut self, pidx: usize, config: &ConfigBpdu, now: Instant) {
        let incoming = PriorityVector::of_bpdu(config);
        let stored = self.ports[pidx].designated_vector();

        match incoming.cmp(&stored) {
            std::cmp::Ordering::Greater => {
                // Worse than what this port advertises: reassert ourselves.
                let switch_id = self.switch_id;
                let p = &mut self.ports[pidx];
                p.designated_switch = switch_id;
                p.designated_port = p.port_id;
            }
            std::cmp::Ordering::Equal => {
                self.send_config();
            }
            std::cmp::Ordering::Less => {
                let was_root = self.is_root_switch();
                {
                    let p = &mut self.ports[pidx];
                    p.designated_root = config.root_id();
                    p.designated_cost = config.root_path_cost();
                    p.designated_switch = config.switch_id();
                    p.designated_port = config.port_id();
                }

                // Keep the current root port if it is still at least as good
                // as what just arrived.
                if let Some(rp) = self.root_port {
                    if incoming >= self.ports[rp].designated_vector() {
                        self.sync_hello_timer(was_root, now);
                        return;
                    }
                }

                self.root_port = Some(pidx);
                self.designated_root = config.root_id();
                self.root_path_cost =
                    self.ports[pidx].designated_cost + self.ports[pidx].path_cost;

                for (i, p) in self.ports.iter_mut().enumerate() {
                    if i != pidx {
                        p.designated_root = self.designated_root;
                        p.designated_cost = self.root_path_cost;
                    }
                }

                self.sync_hello_timer(was_root, now);
                self.send_config();
            }
        }
    }

    /// Entry point for a frame addressed to the bridge group address.
    pub fn handle_packet(&mut self, pidx: usize, frame: &[u8], now: Instant) {
        let header: StpHeader = match wire::pod_at(frame, ETHER_HDR_SIZE + LLC_HDR_SIZE) {
            Ok(h) => h,
            Err(e) => {
                error!("malformed stp frame on port {:02x}: {e}", self.ports[pidx].port_id);
                return;
            }
        };
        match header.msg_type() {
            bpdu::STP_TYPE_CONFIG => {
                match wire::pod_at::<ConfigBpdu>(frame, ETHER_HDR_SIZE + LLC_HDR_SIZE) {
                    Ok(config) => self.handle_config(pidx, &config, now),
                    Err(e) => error!("truncated config bpdu: {e}"),
                }
            }
            bpdu::STP_TYPE_TCN => error!("TCN packet is not supported"),
            t => error!("received invalid STP packet (type {t:#04x})"),
        }
    }

    /// Logs the per-port election outcome, in the short-id format the lab
    /// graders consume.
    pub fn dump_state(&self) {
        if self.is_root_switch() {
            info!("this switch is root.");
        } else {
            info!(
                "non-root switch, designated root: {:04x}, root path cost: {}.",
                self.designated_root & 0xffff,
                self.root_path_cost
            );
        }
        for i in 0..self.ports.len() {
            let p = &self.ports[i];
            info!("port id: {:02}, role: {}.", p.port_id & 0xff, self.port_role(i));
            info!(
                "\tdesignated ->root: {:04x}, ->switch: {:04x}, ->port: {:02}, ->cost: {}.",
                p.designated_root & 0xffff,
                p.designated_switch & 0xffff,
                p.designated_port & 0xff,
                p.designated_cost
            );
        }
    }
}

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigterm(_: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

/// Runs the bridge: a timer thread ticking every 100 µs and the inline
/// receive loop, both serialized on the bridge lock. SIGTERM dumps the
/// election state and exits.
pub fn run(stp: Arc<Mutex<Stp>>, mut inbound: Vec<Box<dyn DataLinkReceiver>>) -> anyhow::Result<()> {
    let handler = on_sigterm as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    let timer_stp = stp.clone();
    thread::spawn(move || loop {
        thread::sleep(Duration::from_micros(100));
        let mut stp = timer_stp.lock().unwrap();
        let now = Instant::now();
        if stp.hello_timer.due(now) {
            stp.handle_hello_timeout(now);
        }
    });

    loop {
        if TERMINATE.load(Ordering::SeqCst) {
            stp.lock().unwrap().dump_state();
            std::process::exit(0);
        }
        for (pidx, rx) in inbound.iter_mut().enumerate() {
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
                error!("Failed to parse frame of {} bytes", bytes.len());
                continue;
            };
            // Everything that isn't bridge control traffic belongs to the
            // host's forwarding path, not to us.
            if eth_pkt.get_destination() != bpdu::ETH_STP_ADDR {
                continue;
            }
            stp.lock().unwrap().handle_packet(pidx, bytes, Instant::now());
        }
    }
}
