use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Recent-committed-transactions index: commit time -> trxids, per worker.
/// Validation collects every locally committed transaction whose commit time
/// falls in `(bt, ct - 1]` of the validating transaction.
#[derive(Debug, Default)]
pub struct RctIndex {
    inner: Mutex<BTreeMap<u64, Vec<u64>>>,
}

impl RctIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_trx(&self, ct: u64, trx_id: u64) {
        self.inner.lock().entry(ct).or_default().push(trx_id);
    }

    /// Union of trx-sets with commit time in `[lo, hi]`.
    pub fn query_trx(&self, lo: u64, hi: u64) -> Vec<u64> {
        if lo > hi {
            return Vec::new();
        }
        let inner = self.inner.lock();
        inner
            .range(lo..=hi)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    /// Drops entries older than the GC watermark; no future validator can
    /// query below its own begin time.
    pub fn prune(&self, min_active_bt: u64) -> usize {
        let mut inner = self.inner.lock();
        let keep = inner.split_off(&min_active_bt);
        let dropped = inner.values().map(Vec::len).sum();
        *inner = keep;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_query_is_inclusive() {
        let rct = RctIndex::new();
        rct.insert_trx(5, 100);
        rct.insert_trx(7, 101);
        rct.insert_trx(7, 102);
        rct.insert_trx(9, 103);

        assert_eq!(rct.query_trx(5, 7), vec![100, 101, 102]);
        assert_eq!(rct.query_trx(6, 6), Vec::<u64>::new());
        assert_eq!(rct.query_trx(8, 5), Vec::<u64>::new());
    }

    #[test]
    fn prune_drops_old_entries() {
        let rct = RctIndex::new();
        rct.insert_trx(5, 100);
        rct.insert_trx(9, 101);
        assert_eq!(rct.prune(6), 1);
        assert_eq!(rct.query_trx(0, 100), vec![101]);
    }
}
