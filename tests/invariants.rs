use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use proptest::prelude::*;

use gryphon::coordinator::{MAX_TIME, TRX_TAG};
use gryphon::storage::mem_pool::ConcurrentMemPool;
use gryphon::storage::mvcc_list::{AppendOutcome, MvccList, MvccPool};
use gryphon::storage::value_store::MvccValueStore;
use gryphon::Value;

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Int),
        any::<f64>().prop_map(|f| Value::Double(if f.is_nan() { 0.0 } else { f })),
        proptest::char::any().prop_map(Value::Char),
        "[ -~]{0,120}".prop_map(Value::Str),
    ]
}

proptest! {
    // R1: insert then read back yields equal bytes and type
    #[test]
    fn value_store_round_trip(values in prop::collection::vec(arb_value(), 1..40)) {
        let store: MvccValueStore = MvccValueStore::new(1 << 14, 1);
        let headers: Vec<_> = values.iter().map(|v| store.insert(v, 0)).collect();
        for (header, value) in headers.iter().zip(&values) {
            prop_assert_eq!(&store.read(header).unwrap(), value);
        }
        for header in &headers {
            store.free(header, 0);
        }
        let (gets, frees) = store.usage();
        prop_assert_eq!(gets, frees);
    }

    // V1: committed versions are strictly ordered and adjacent versions
    // share their boundary timestamp
    #[test]
    fn mvcc_chain_stays_well_formed(ops in prop::collection::vec((0u8..3, 0u8..3), 1..60)) {
        let pool: MvccPool<u32> = MvccPool::new(1 << 12, 1);
        let list = MvccList::<u32>::new();
        list.append_initial(&pool, 0, 0);

        let mut clock = 1u64;
        let mut live: Option<u64> = None;
        for (op, who) in ops {
            let trx = TRX_TAG | ((who as u64 + 1) << 8);
            match op {
                0 => {
                    let outcome = list.append_version(&pool, 0, trx, clock, clock as u32);
                    match outcome {
                        AppendOutcome::Appended => live = Some(trx),
                        AppendOutcome::Reused(_) => live = Some(trx),
                        AppendOutcome::Conflict => {
                            prop_assert!(live.is_some() && live != Some(trx));
                        }
                    }
                    clock += 1;
                }
                1 => {
                    if live == Some(trx) {
                        list.commit_version(&pool, trx, clock);
                        clock += 1;
                        live = None;
                    }
                }
                _ => {
                    if live == Some(trx) {
                        list.abort_version(&pool, 0, trx);
                        live = None;
                    }
                }
            }

            let mut versions = Vec::new();
            list.for_each_version(&pool, |item| {
                versions.push((item.begin_time, item.end_time, item.trx_id));
            });
            // at most one uncommitted item, and only at the tail
            for (i, &(begin, end, trx_id)) in versions.iter().enumerate() {
                if trx_id != 0 {
                    prop_assert_eq!(i, versions.len() - 1);
                } else {
                    prop_assert!(begin < end);
                }
            }
            let committed: Vec<_> = versions.iter().filter(|v| v.2 == 0).collect();
            for pair in committed.windows(2) {
                prop_assert!(pair[0].0 < pair[1].0, "begin times must increase");
                prop_assert_eq!(pair[0].1, pair[1].0, "adjacent versions must touch");
            }
            if let Some(last) = committed.last() {
                prop_assert_eq!(last.1, MAX_TIME);
            }
        }
    }

    // V2: all reads of one transaction observe identical bytes
    #[test]
    fn repeated_reads_are_stable(writers in prop::collection::vec(0u8..3, 1..20)) {
        let pool: MvccPool<u32> = MvccPool::new(1 << 12, 1);
        let list = MvccList::<u32>::new();
        list.append_initial(&pool, 0, 7);

        let reader = TRX_TAG | (99 << 8);
        let reader_bt = 1u64;
        let first = list.visible_version(&pool, reader, reader_bt, true);

        let mut clock = 2u64;
        for who in writers {
            let trx = TRX_TAG | ((who as u64 + 1) << 8);
            if let AppendOutcome::Appended =
                list.append_version(&pool, 0, trx, clock, clock as u32)
            {
                list.commit_version(&pool, trx, clock + 1);
            }
            clock += 2;
            prop_assert_eq!(
                list.visible_version(&pool, reader, reader_bt, true),
                first.clone()
            );
        }
    }
}

// R2: applying a commit twice is equivalent to applying it once
#[test]
fn commit_is_idempotent() {
    let pool: MvccPool<u32> = MvccPool::new(1 << 12, 1);
    let list = MvccList::<u32>::new();
    list.append_initial(&pool, 0, 1);

    let trx = TRX_TAG | (1 << 8);
    list.append_version(&pool, 0, trx, 5, 2);
    list.commit_version(&pool, trx, 6);
    let mut once = Vec::new();
    list.for_each_version(&pool, |item| once.push((item.begin_time, item.end_time, item.trx_id)));

    list.commit_version(&pool, trx, 6);
    let mut twice = Vec::new();
    list.for_each_version(&pool, |item| twice.push((item.begin_time, item.end_time, item.trx_id)));
    assert_eq!(once, twice);
}

// V5: outstanding offsets across threads are always distinct and inside the
// arena
#[test]
fn pool_never_hands_out_duplicates() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 2000;
    let pool: Arc<ConcurrentMemPool<u64, 64>> =
        Arc::new(ConcurrentMemPool::new(1 << 16, THREADS));
    let seen = Arc::new(Mutex::new(HashSet::new()));

    let mut handles = Vec::new();
    for tid in 0..THREADS {
        let pool = pool.clone();
        let seen = seen.clone();
        handles.push(thread::spawn(move || {
            let mut mine = Vec::new();
            for round in 0..PER_THREAD {
                let off = pool.get(tid);
                assert!(off < pool.capacity());
                {
                    let mut seen = seen.lock().unwrap();
                    assert!(seen.insert(off), "duplicate offset {off}");
                }
                mine.push(off);
                if round % 3 == 0 {
                    if let Some(off) = mine.pop() {
                        seen.lock().unwrap().remove(&off);
                        pool.free(off, tid);
                    }
                }
            }
            for off in mine {
                seen.lock().unwrap().remove(&off);
                pool.free(off, tid);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let usage = pool.usage();
    assert_eq!(usage.gets, usage.frees);
}

// end-to-end scenario 6, scaled: interleaved inserts and frees across 8
// threads leave the free list covering the whole arena
#[test]
fn value_store_free_list_covers_capacity_after_churn() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 5000;
    let capacity = 1 << 16;
    let store: Arc<MvccValueStore<64>> = Arc::new(MvccValueStore::new(capacity, THREADS));

    let mut handles = Vec::new();
    for tid in 0..THREADS {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            let mut held = Vec::new();
            for i in 0..PER_THREAD {
                let value = Value::Str(format!("t{tid}-value-{i}"));
                held.push((store.insert(&value, tid), value));
                if i % 2 == 0 {
                    let (header, value) = held.remove(held.len() / 2);
                    assert_eq!(store.read(&header).unwrap(), value);
                    store.free(&header, tid);
                }
            }
            for (header, _) in held {
                store.free(&header, tid);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let (gets, frees) = store.usage();
    assert_eq!(gets, frees, "every allocated cell must come back");

    let mut distinct = HashSet::new();
    store.scan_free_offsets(|off| {
        assert!(off < capacity);
        distinct.insert(off);
    });
    assert_eq!(distinct.len() as u32, capacity);
}

// V4: racing writers to the same property key never allocate a second cell
#[test]
fn concurrent_cell_allocation_is_unique() {
    use gryphon::storage::mvcc_list::MvccPool as ItemPool;
    use gryphon::storage::property_row::{PropStores, PropertyRowList, PropertyRowPool};
    use gryphon::storage::value_store::ValueHeader;

    const THREADS: usize = 4;
    const KEYS: u64 = 16;
    let rows = Arc::new(PropertyRowPool::new(1 << 13, THREADS));
    let mvcc: Arc<ItemPool<ValueHeader>> = Arc::new(ItemPool::new(1 << 13, THREADS));
    let values: Arc<MvccValueStore> = Arc::new(MvccValueStore::new(1 << 13, THREADS));
    let list = Arc::new(PropertyRowList::new());
    let start = Arc::new(std::sync::Barrier::new(THREADS));

    let mut handles = Vec::new();
    for tid in 0..THREADS {
        let (rows, mvcc, values, list, start) = (
            rows.clone(),
            mvcc.clone(),
            values.clone(),
            list.clone(),
            start.clone(),
        );
        handles.push(thread::spawn(move || {
            let stores = PropStores {
                rows: &rows,
                mvcc: &mvcc,
                values: &values,
                tid,
            };
            start.wait();
            for pid in 0..KEYS {
                let trx = TRX_TAG | ((tid as u64 + 1) << 8);
                let _ = list.modify(&stores, pid, &Value::Int(tid as i64), trx, 1);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // one cell per pid, regardless of how the writers raced
    assert_eq!(list.property_count(), KEYS as usize);
}

// R3: parsing is deterministic, so a plan re-parsed from the same source is
// identical operator for operator
#[test]
fn parsing_is_deterministic() {
    use gryphon::loader::RawGraph;
    use gryphon::plan::parser::{Parser, ParserOptions};
    use gryphon::plan::TrxPlan;

    let graph = RawGraph::modern();
    let queries = [
        "g.V().has(\"name\", \"marko\").out(\"knows\").values(\"name\")",
        "g.V().union(out(\"knows\"), out(\"created\")).dedup().count()",
        "g.V().hasLabel(\"person\").order(\"age\", decr).limit(2)",
        "x = g.V().hasLabel(\"software\"); g.V(x).in(\"created\").count()",
    ];
    for query in queries {
        let mut plans = Vec::new();
        for _ in 0..2 {
            let mut parser = Parser::new(&graph.schema, None, ParserOptions::default());
            let mut plan = TrxPlan::new(TRX_TAG | 0x100, 1);
            parser.parse(query, &mut plan).unwrap();
            plans.push(plan);
        }
        let (a, b) = (&plans[0], &plans[1]);
        assert_eq!(a.query_plans.len(), b.query_plans.len());
        for (qa, qb) in a.query_plans.iter().zip(&b.query_plans) {
            let (Some(qa), Some(qb)) = (qa, qb) else {
                panic!("missing query plan");
            };
            assert_eq!(qa.ops.len(), qb.ops.len());
            for (oa, ob) in qa.ops.iter().zip(&qb.ops) {
                assert_eq!(oa, ob, "query {query}");
            }
        }
    }
}
