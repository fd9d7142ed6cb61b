//! Routing table written by the SPF pass. The data-plane read path lives in
//! the host; the agent only clears, fills, and dumps it under `rtable_lock`
//! (the `Mutex` wrapping this struct).

use log::info;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtEntry {
    /// Destination subnet, host order.
    pub dest: u32,
    pub mask: u32,
    /// Next-hop router id, 0 for directly attached subnets.
    pub gw: u32,
    pub dist: u32,
    /// Index into the owning router's interface list.
    pub iface: usize,
}

#[derive(Default)]
pub struct Rtable {
    entries: Vec<RtEntry>,
}

impl Rtable {
    pub fn new() -> Self {
        Rtable::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn add(&mut self, entry: RtEntry) {
        self.entries.push(entry);
    }

    pub fn find_dest_mut(&mut self, dest: u32) -> Option<&mut RtEntry> {
        self.entries.iter_mut().find(|e| e.dest == dest)
    }

    pub fn entries(&self) -> &[RtEntry] {
        &self.entries
    }

    pub fn dump(&self, ifnames: &[&str]) {
        info!("Routing Table:");
        for e in &self.entries {
            info!(
                "{:<16} {:<16} {:<16} {:>4}  {}",
                Ipv4Addr::from(e.dest).to_string(),
                Ipv4Addr::from(e.mask).to_string(),
                Ipv4Addr::from(e.gw).to_string(),
                e.dist,
                ifnames.get(e.iface).copied().unwrap_or("?")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_and_replace() {
        let mut rt = Rtable::new();
        rt.add(RtEntry {
            dest: 0x0a000100,
            mask: 0xffffff00,
            gw: 0,
            dist: 0,
            iface: 0,
        });
        assert!(rt.find_dest_mut(0x0a000200).is_none());
        let e = rt.find_dest_mut(0x0a000100).unwrap();
        e.dist = 2;
        assert_eq!(rt.entries()[0].dist, 2);
        rt.clear();
        assert!(rt.entries().is_empty());
    }
}
