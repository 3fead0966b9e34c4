//! 5-tuple to connection mapping
//!
//! O(1) expected lookup by hashing the tuple. The table never destroys
//! records on its own; the engine drives eviction through the purge pass.

use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::packet::FiveTuple;

use super::{Conn, ConnStatus};

#[derive(Default)]
pub(crate) struct ConnTable {
    map: HashMap<FiveTuple, Conn>,
}

impl ConnTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn contains(&self, tuple: &FiveTuple) -> bool {
        self.map.contains_key(tuple)
    }

    pub(crate) fn get_mut(&mut self, tuple: &FiveTuple) -> Option<&mut Conn> {
        self.map.get_mut(tuple)
    }

    pub(crate) fn insert(&mut self, conn: Conn) {
        self.map.insert(*conn.tuple(), conn);
    }

    pub(crate) fn remove(&mut self, tuple: &FiveTuple) -> Option<Conn> {
        self.map.remove(tuple)
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &Conn> {
        self.map.values()
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut Conn> {
        self.map.values_mut()
    }

    /// Iterate records that are not logically closed
    ///
    /// Closed records are skipped: the embedder may already have released
    /// its side-state in the close callback.
    pub(crate) fn active(&self) -> impl Iterator<Item = &Conn> {
        self.map.values().filter(|c| c.status != ConnStatus::Closed)
    }

    /// Tuples of records that are closed or idle beyond their protocol's
    /// budget at time `now`
    pub(crate) fn collect_expired(&self, now: u64, config: &EngineConfig) -> Vec<FiveTuple> {
        self.map
            .values()
            .filter(|c| {
                c.status == ConnStatus::Closed
                    || now >= c.tstamp + config.timeout_for(c.tuple().proto)
            })
            .map(|c| *c.tuple())
            .collect()
    }

    /// All tuples ordered by last activity, oldest first
    pub(crate) fn oldest_first(&self) -> Vec<FiveTuple> {
        let mut entries: Vec<(u64, FiveTuple)> =
            self.map.values().map(|c| (c.tstamp, *c.tuple())).collect();
        entries.sort_by_key(|(tstamp, _)| *tstamp);
        entries.into_iter().map(|(_, tuple)| tuple).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tuple(src_port: u16) -> FiveTuple {
        FiveTuple::udp(
            Ipv4Addr::new(10, 0, 0, 2),
            src_port,
            Ipv4Addr::new(8, 8, 8, 8),
            53,
        )
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut table = ConnTable::new();
        assert!(!table.contains(&tuple(1000)));

        table.insert(Conn::new(tuple(1000), 5));
        assert_eq!(table.len(), 1);
        assert!(table.contains(&tuple(1000)));
        assert!(table.get_mut(&tuple(1000)).is_some());
        assert!(table.get_mut(&tuple(1001)).is_none());

        let conn = table.remove(&tuple(1000)).unwrap();
        assert_eq!(conn.last_activity(), 5);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_active_skips_closed() {
        let mut table = ConnTable::new();
        table.insert(Conn::new(tuple(1), 0));
        let mut closed = Conn::new(tuple(2), 0);
        closed.status = ConnStatus::Closed;
        table.insert(closed);

        assert_eq!(table.len(), 2);
        assert_eq!(table.active().count(), 1);
    }

    #[test]
    fn test_collect_expired() {
        let config = EngineConfig::default(); // UDP budget: 15s
        let mut table = ConnTable::new();
        table.insert(Conn::new(tuple(1), 100)); // idle 20s at now=120
        table.insert(Conn::new(tuple(2), 110)); // idle 10s
        let mut closed = Conn::new(tuple(3), 119);
        closed.status = ConnStatus::Closed;
        table.insert(closed);

        let mut expired = table.collect_expired(120, &config);
        expired.sort_by_key(|t| t.src_port);
        assert_eq!(
            expired.iter().map(|t| t.src_port).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn test_oldest_first() {
        let mut table = ConnTable::new();
        table.insert(Conn::new(tuple(1), 30));
        table.insert(Conn::new(tuple(2), 10));
        table.insert(Conn::new(tuple(3), 20));

        let order: Vec<u16> = table.oldest_first().iter().map(|t| t.src_port).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }
}
