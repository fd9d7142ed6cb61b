use anyhow::Result;
use lanctl::iface::{self, ArpCache};
use lanctl::mospf::{Mospf, Router};
use std::time::Duration;

/// mOSPF router agent. Takes an optional interface-name filter (default
/// `-eth`, matching the emulated network's port names).
fn main() -> Result<()> {
    env_logger::init();
    let filter = std::env::args().nth(1).unwrap_or_else(|| "-eth".to_string());

    let arp = ArpCache::default();
    let (ifaces, inbound) =
        iface::open_ifaces(&filter, Some(Duration::from_micros(1000)), &arp)?;
    let mospf = Mospf::new(Router::new(ifaces)?);
    mospf.run(inbound, arp)
}
