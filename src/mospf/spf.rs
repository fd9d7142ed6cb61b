//! Dijkstra over the LSDB and the routing-table rewrite. The produced
//! table is a pure function of the database snapshot and the local
//! interface list; router indices are assigned fresh per pass from the
//! database's insertion order.

use crate::mospf::daemon::Router;
use crate::rtable::{RtEntry, Rtable};
use log::warn;
use std::net::Ipv4Addr;

pub const MAX_DIST: u32 = u32::MAX;
pub const BAD_GW: u32 = u32::MAX;

struct DistEntry {
    rid: u32,
    visited: bool,
    dist: u32,
    /// First-hop router id along the path; 0 on the local router.
    gw: u32,
}

/// Interface whose neighbor list contains the router `gw`.
fn gw_to_iface(r: &Router, gw: u32) -> Option<usize> {
    r.ifaces
        .iter()
        .position(|rif| rif.nbrs.iter().any(|n| n.rid == gw))
}

/// Interface directly attached to `subnet`.
fn subnet_to_iface(r: &Router, subnet: u32) -> Option<usize> {
    r.ifaces
        .iter()
        .position(|rif| rif.iface.ip & rif.iface.mask == subnet)
}

/// Recomputes the routing table from the LSDB. Called under the instance
/// lock with the rtable lock held by the caller's `&mut`.
pub fn generate_rt(r: &Router, rtable: &mut Rtable) {
    rtable.clear();

    let entries: Vec<_> = r.lsdb.iter().collect();
    let rnum = entries.len();
    let Some(self_idx) = entries.iter().position(|e| e.rid == r.router_id) else {
        // nothing self-originated yet, so no paths to compute
        return;
    };

    let mut dist: Vec<DistEntry> = entries
        .iter()
        .map(|e| DistEntry {
            rid: e.rid,
            visited: false,
            dist: MAX_DIST,
            gw: BAD_GW,
        })
        .collect();
    dist[self_idx].visited = true;
    dist[self_idx].dist = 0;
    dist[self_idx].gw = 0;
    // One-hop neighbors are their own next hop.
    for lsa in &entries[self_idx].lsas {
        if lsa.rid == 0 {
            continue;
        }
        if let Some(k) = entries.iter().position(|e| e.rid == lsa.rid) {
            if k != self_idx {
                dist[k].dist = 1;
                dist[k].gw = dist[k].rid;
            }
        }
    }

    let mut graph = vec![vec![false; rnum]; rnum];
    for (i, e) in entries.iter().enumerate() {
        for lsa in &e.lsas {
            if lsa.rid == 0 {
                continue;
            }
            if let Some(j) = entries.iter().position(|x| x.rid == lsa.rid) {
                graph[i][j] = true;
            }
        }
    }

    for _ in 0..rnum.saturating_sub(1) {
        let mut min_j = None;
        let mut min_dist = MAX_DIST;
        for (j, d) in dist.iter().enumerate() {
            if !d.visited && d.dist < min_dist {
                min_dist = d.dist;
                min_j = Some(j);
            }
        }
        // Whatever is left is unreachable.
        let Some(m) = min_j else {
            break;
        };
        dist[m].visited = true;
        let (m_dist, m_gw, m_rid) = (dist[m].dist, dist[m].gw, dist[m].rid);
        for (j, d) in dist.iter_mut().enumerate() {
            if graph[m][j] && !d.visited {
                let cand = m_dist.saturating_add(1);
                if cand < d.dist {
                    d.dist = cand;
                    d.gw = if m_gw != 0 { m_gw } else { m_rid };
                }
            }
        }
    }

    for (j, e) in entries.iter().enumerate() {
        for lsa in &e.lsas {
            let d = &dist[j];
            if let Some(rt) = rtable.find_dest_mut(lsa.subnet) {
                if d.dist >= rt.dist {
                    continue;
                }
                let iface = if d.gw != 0 {
                    gw_to_iface(r, d.gw)
                } else {
                    subnet_to_iface(r, lsa.subnet)
                };
                let Some(ifidx) = iface else {
                    warn!(
                        "no interface towards {} (gw {}), keeping existing route",
                        Ipv4Addr::from(lsa.subnet),
                        Ipv4Addr::from(d.gw)
                    );
                    continue;
                };
                rt.dist = d.dist;
                rt.gw = d.gw;
                rt.iface = ifidx;
                rt.mask = r.ifaces[ifidx].iface.mask;
            } else if let Some(ifidx) = gw_to_iface(r, d.gw) {
                rtable.add(RtEntry {
                    dest: lsa.subnet,
                    mask: r.ifaces[ifidx].iface.mask,
                    gw: d.gw,
                    dist: d.dist,
                    iface: ifidx,
                });
            } else if d.gw == 0 {
                let Some(ifidx) = subnet_to_iface(r, lsa.subnet) else {
                    warn!(
                        "no local interface on subnet {}, skipping",
                        Ipv4Addr::from(lsa.subnet)
                    );
                    continue;
                };
                rtable.add(RtEntry {
                    dest: lsa.subnet,
                    mask: r.ifaces[ifidx].iface.mask,
                    gw: 0,
                    dist: d.dist,
                    iface: ifidx,
                });
            } else {
                warn!(
                    "no interface towards gw {} for {}, skipping",
                    Ipv4Addr::from(d.gw),
                    Ipv4Addr::from(lsa.subnet)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::testing::test_iface;
    use crate::iface::ArpCache;
    use crate::mospf::database::Lsa;
    use crate::mospf::nbr::Neighbor;
    use crate::mospf::proto::MOSPF_NEIGHBOR_TIMEOUT;
    use pnet::util::MacAddr;

    const MASK24: u32 = 0xffff_ff00;
    const R0: u32 = 0x0a00_0101; // 10.0.1.1
    const R1: u32 = 0x0a00_0102; // 10.0.1.2
    const R2: u32 = 0x0a00_0202; // 10.0.2.2
    const NET01: u32 = 0x0a00_0100;
    const NET12: u32 = 0x0a00_0200;
    const NET2: u32 = 0x0a00_0300;

    fn router_with(addrs: &[(u32, u32)], nbrs: &[(usize, Neighbor)]) -> Router {
        let arp = ArpCache::default();
        let ifaces = addrs
            .iter()
            .enumerate()
            .map(|(i, (ip, mask))| {
                test_iface(
                    &format!("r0-eth{i}"),
                    MacAddr(0, 0, 0, 0, 1, i as u8),
                    *ip,
                    *mask,
                    &arp,
                )
                .0
            })
            .collect();
        let mut r = Router::new(ifaces).unwrap();
        for (ifidx, nbr) in nbrs {
            r.ifaces[*ifidx].nbrs.push(nbr.clone());
        }
        r
    }

    fn nbr(rid: u32, ip: u32) -> Neighbor {
        Neighbor {
            rid,
            ip,
            mask: MASK24,
            alive: MOSPF_NEIGHBOR_TIMEOUT,
        }
    }

    /// R0 -- R1 -- R2 in a line; R2 hangs a stub subnet off the far end.
    fn line_topology() -> Router {
        let mut r = router_with(&[(R0, MASK24)], &[(0, nbr(R1, R1))]);
        r.lsdb.upsert(
            R0,
            1,
            vec![Lsa {
                subnet: NET01,
                mask: MASK24,
                rid: R1,
            }],
        );
        r.lsdb.upsert(
            R1,
            1,
            vec![
                Lsa {
                    subnet: NET01,
                    mask: MASK24,
                    rid: R0,
                },
                Lsa {
                    subnet: NET12,
                    mask: MASK24,
                    rid: R2,
                },
            ],
        );
        r.lsdb.upsert(
            R2,
            1,
            vec![
                Lsa {
                    subnet: NET12,
                    mask: MASK24,
                    rid: R1,
                },
                Lsa {
                    subnet: NET2,
                    mask: MASK24,
                    rid: 0,
                },
            ],
        );
        r
    }

    #[test]
    fn two_hop_route_goes_through_first_hop() {
        let r = line_topology();
        let mut rtable = Rtable::new();
        generate_rt(&r, &mut rtable);

        let far = rtable
            .entries()
            .iter()
            .find(|e| e.dest == NET2)
            .expect("route to the far stub subnet");
        assert_eq!(far.dist, 2);
        assert_eq!(far.gw, R1);
        assert_eq!(far.iface, 0);

        let mid = rtable.entries().iter().find(|e| e.dest == NET12).unwrap();
        assert_eq!(mid.dist, 1);
        assert_eq!(mid.gw, R1);

        let local = rtable.entries().iter().find(|e| e.dest == NET01).unwrap();
        assert_eq!(local.dist, 0);
        assert_eq!(local.gw, 0);
    }

    #[test]
    fn stub_router_routes_its_own_subnet() {
        let stub_net = 0x0a00_0500;
        let mut r = router_with(&[(0x0a00_0501, MASK24)], &[]);
        r.lsdb.upsert(
            0x0a00_0501,
            1,
            vec![Lsa {
                subnet: stub_net,
                mask: MASK24,
                rid: 0,
            }],
        );
        let mut rtable = Rtable::new();
        generate_rt(&r, &mut rtable);

        assert_eq!(rtable.entries().len(), 1);
        let e = &rtable.entries()[0];
        assert_eq!((e.dest, e.mask, e.gw, e.dist, e.iface), (stub_net, MASK24, 0, 0, 0));
    }

    #[test]
    fn missing_self_entry_leaves_table_empty() {
        let mut r = router_with(&[(R0, MASK24)], &[]);
        r.lsdb.upsert(
            R1,
            3,
            vec![Lsa {
                subnet: NET12,
                mask: MASK24,
                rid: 0,
            }],
        );
        let mut rtable = Rtable::new();
        rtable.add(RtEntry {
            dest: 1,
            mask: 2,
            gw: 3,
            dist: 4,
            iface: 0,
        });
        generate_rt(&r, &mut rtable);
        assert!(rtable.entries().is_empty());
    }

    #[test]
    fn unreachable_routers_produce_no_routes() {
        // R2 is in the database but no path leads to it.
        let mut r = router_with(&[(R0, MASK24)], &[(0, nbr(R1, R1))]);
        r.lsdb.upsert(
            R0,
            1,
            vec![Lsa {
                subnet: NET01,
                mask: MASK24,
                rid: R1,
            }],
        );
        r.lsdb.upsert(
            R2,
            1,
            vec![Lsa {
                subnet: NET2,
                mask: MASK24,
                rid: 0,
            }],
        );
        let mut rtable = Rtable::new();
        generate_rt(&r, &mut rtable);
        assert!(rtable.entries().iter().all(|e| e.dest != NET2));
    }

    #[test]
    fn spf_is_deterministic() {
        let r = line_topology();
        let mut first = Rtable::new();
        let mut second = Rtable::new();
        generate_rt(&r, &mut first);
        generate_rt(&r, &mut second);
        assert_eq!(first.entries(), second.entries());
    }
}
