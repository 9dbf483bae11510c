#![allow(dead_code)]

use gryphon::config::Config;
use gryphon::loader::RawGraph;
use gryphon::GraphCluster;

pub fn test_config(workers: usize) -> Config {
    Config {
        num_workers: workers,
        num_expert_threads: 2,
        row_pool_size: 1 << 14,
        mvcc_pool_size: 1 << 14,
        vp_store_cells: 1 << 14,
        ep_store_cells: 1 << 14,
        ..Config::default()
    }
}

pub fn modern_cluster(workers: usize) -> GraphCluster {
    init_tracing();
    GraphCluster::build(test_config(workers), &RawGraph::modern())
}

/// Set `GRYPHON_TEST_LOG=1` to see worker logs while debugging a test.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        if std::env::var_os("GRYPHON_TEST_LOG").is_some() {
            let _ = tracing_subscriber::fmt().try_init();
        }
    });
}

/// Result values without the per-query headers.
pub fn result_values(results: &[String]) -> Vec<String> {
    results
        .iter()
        .filter(|line| !line.starts_with("Query "))
        .cloned()
        .collect()
}

/// Sorted multiset comparison helper.
pub fn sorted(mut values: Vec<String>) -> Vec<String> {
    values.sort();
    values
}
