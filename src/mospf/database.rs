//! Link-state database: one entry per router in the area, keyed by router
//! id, insertion-ordered. SPF assigns indices per pass from that order.

use log::debug;
use std::net::Ipv4Addr;

/// Host-order advertisement. `rid == 0` marks a stub network with no
/// neighbor behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lsa {
    pub subnet: u32,
    pub mask: u32,
    pub rid: u32,
}

#[derive(Debug, Clone)]
pub struct LsdbEntry {
    pub rid: u32,
    pub seq: u16,
    pub lsas: Vec<Lsa>,
}

#[derive(Default)]
pub struct Lsdb {
    entries: Vec<LsdbEntry>,
}

impl Lsdb {
    pub fn new() -> Self {
        Lsdb::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, rid: u32) -> Option<&LsdbEntry> {
        self.entries.iter().find(|e| e.rid == rid)
    }

    /// Returns the entry for `rid`, inserting a fresh one with `seq = 0`
    /// so a first LSU (seq ≥ 1) always installs.
    pub fn get_or_insert(&mut self, rid: u32) -> &mut LsdbEntry {
        if let Some(i) = self.entries.iter().position(|e| e.rid == rid) {
            return &mut self.entries[i];
        }
        self.entries.push(LsdbEntry {
            rid,
            seq: 0,
            lsas: Vec::new(),
        });
        self.entries.last_mut().unwrap()
    }

    /// Replaces (or creates) the entry for `rid` wholesale.
    pub fn upsert(&mut self, rid: u32, seq: u16, lsas: Vec<Lsa>) {
        let entry = self.get_or_insert(rid);
        entry.seq = seq;
        entry.lsas = lsas;
    }

    pub fn iter(&self) -> impl Iterator<Item = &LsdbEntry> {
        self.entries.iter()
    }

    pub fn dump(&self) {
        for e in &self.entries {
            debug!(
                "rid: {}, seq: {}, nadv: {}",
                Ipv4Addr::from(e.rid),
                e.seq,
                e.lsas.len()
            );
            for lsa in &e.lsas {
                debug!(
                    "\tsubnet: {}, mask: {}, nbr rid: {}",
                    Ipv4Addr::from(lsa.subnet),
                    Ipv4Addr::from(lsa.mask),
                    Ipv4Addr::from(lsa.rid)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_entry_per_rid() {
        let mut db = Lsdb::new();
        db.get_or_insert(1).seq = 3;
        db.get_or_insert(2);
        db.get_or_insert(1);
        assert_eq!(db.len(), 2);
        assert_eq!(db.get(1).unwrap().seq, 3);

        db.upsert(
            1,
            4,
            vec![Lsa {
                subnet: 0x0a000000,
                mask: 0xffffff00,
                rid: 0,
            }],
        );
        assert_eq!(db.len(), 2);
        assert_eq!(db.get(1).unwrap().seq, 4);
        assert_eq!(db.get(1).unwrap().lsas.len(), 1);
        // Insertion order is preserved for SPF indexing.
        let rids: Vec<u32> = db.iter().map(|e| e.rid).collect();
        assert_eq!(rids, vec![1, 2]);
    }
}
