use std::net::SocketAddr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const TRANSLATION_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationEntry {
    pub new_id: u16,
    pub original_id: u16,
    pub client: SocketAddr,
    pub created_at: Instant,
}

/// 查询 ID 转换表：固定容量的环形表，写满后覆盖最旧的条目。
/// Query-ID translation ring: fixed capacity, the oldest slot is overwritten
/// once the ring wraps. Lookups scan linearly; entries are never removed on lookup.
pub struct TranslationTable {
    slots: Vec<Option<TranslationEntry>>,
    pos: usize,
    rng: fastrand::Rng,
}

impl TranslationTable {
    pub fn new(capacity: usize) -> Self {
        Self::with_rng(capacity, fastrand::Rng::with_seed(clock_seed()))
    }

    pub fn with_rng(capacity: usize, rng: fastrand::Rng) -> Self {
        let capacity = capacity.clamp(1, u16::MAX as usize);
        Self {
            slots: vec![None; capacity],
            pos: 0,
            rng,
        }
    }

    /// Pick an id no live entry uses, bind it to the client and store it in
    /// the next slot, dropping whatever the slot held before.
    pub fn allocate(&mut self, original_id: u16, client: SocketAddr, now: Instant) -> u16 {
        // capacity is far below 65536, so a free id always exists
        let new_id = loop {
            let candidate = self.rng.u16(..);
            if self.lookup(candidate).is_none() {
                break candidate;
            }
        };
        self.slots[self.pos] = Some(TranslationEntry {
            new_id,
            original_id,
            client,
            created_at: now,
        });
        self.pos = (self.pos + 1) % self.slots.len();
        new_id
    }

    pub fn lookup(&self, id: u16) -> Option<&TranslationEntry> {
        self.slots.iter().flatten().find(|e| e.new_id == id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs() << 20) ^ u64::from(d.subsec_nanos()))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn client(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn allocate_then_lookup_restores_client() {
        let mut table = TranslationTable::new(TRANSLATION_CAPACITY);
        let now = Instant::now();
        let id = table.allocate(0x1234, client(5000), now);
        let entry = table.lookup(id).expect("entry");
        assert_eq!(entry.original_id, 0x1234);
        assert_eq!(entry.client, client(5000));
        assert_eq!(entry.created_at, now);
        // a late duplicate response can still be detranslated
        assert!(table.lookup(id).is_some());
    }

    #[test]
    fn outstanding_ids_are_distinct_up_to_capacity() {
        for seed in 0..20 {
            let mut table = TranslationTable::with_rng(TRANSLATION_CAPACITY, fastrand::Rng::with_seed(seed));
            let now = Instant::now();
            let ids: HashSet<u16> = (0..TRANSLATION_CAPACITY as u16)
                .map(|i| table.allocate(i, client(i), now))
                .collect();
            assert_eq!(ids.len(), TRANSLATION_CAPACITY);
            assert_eq!(table.len(), TRANSLATION_CAPACITY);
        }
    }

    #[test]
    fn live_ids_stay_unique_across_wraps() {
        let mut table = TranslationTable::with_rng(4, fastrand::Rng::with_seed(7));
        let now = Instant::now();
        for i in 0..200 {
            table.allocate(i, client(i), now);
            let live: Vec<u16> = table.slots.iter().flatten().map(|e| e.new_id).collect();
            let unique: HashSet<u16> = live.iter().copied().collect();
            assert_eq!(live.len(), unique.len());
        }
    }

    #[test]
    fn oldest_entry_is_evicted_when_ring_wraps() {
        let mut table = TranslationTable::new(3);
        let now = Instant::now();
        let first = table.allocate(1, client(1), now);
        let second = table.allocate(2, client(2), now);
        table.allocate(3, client(3), now);
        assert!(table.lookup(first).is_some());

        let fourth = table.allocate(4, client(4), now);
        assert!(table.lookup(first).is_none());
        assert!(table.lookup(second).is_some());
        assert_eq!(table.lookup(fourth).map(|e| e.original_id), Some(4));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn empty_slots_never_match() {
        let table = TranslationTable::new(TRANSLATION_CAPACITY);
        assert!(table.lookup(0).is_none());
        assert_eq!(table.len(), 0);
    }
}
