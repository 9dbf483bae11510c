use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{GraphError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Snapshot,
    Serializable,
}

/// One node entry from the cluster config file (`hostname:tcp_port:rdma_port`
/// per line, master first, ranks by file order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    pub hostname: String,
    pub tcp_port: u16,
    pub rdma_port: u16,
}

#[derive(Debug, Clone)]
pub struct ClusterTopology {
    pub master: NodeAddr,
    pub workers: Vec<NodeAddr>,
}

impl ClusterTopology {
    pub fn parse(text: &str) -> Result<Self> {
        let mut nodes = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split(':');
            let hostname = parts
                .next()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| bad_line(lineno, line))?
                .to_string();
            let tcp_port = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| bad_line(lineno, line))?;
            let rdma_port = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| bad_line(lineno, line))?;
            if parts.next().is_some() {
                return Err(bad_line(lineno, line));
            }
            nodes.push(NodeAddr {
                hostname,
                tcp_port,
                rdma_port,
            });
        }
        if nodes.len() < 2 {
            return Err(GraphError::InvalidArgument(
                "cluster config needs a master line and at least one worker".into(),
            ));
        }
        let master = nodes.remove(0);
        Ok(ClusterTopology {
            master,
            workers: nodes,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

fn bad_line(lineno: usize, line: &str) -> GraphError {
    GraphError::InvalidArgument(format!(
        "cluster config line {}: expected hostname:tcp_port:rdma_port, got '{line}'",
        lineno + 1
    ))
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of workers in the in-process cluster.
    pub num_workers: usize,
    /// Expert threads per worker.
    pub num_expert_threads: usize,
    pub isolation: IsolationLevel,
    pub use_rdma: bool,
    pub snapshot_path: Option<String>,
    /// Maximum payload bytes per message before the builder splits.
    pub max_data_size: usize,
    /// Capacities of the row / MVCC item pools, in elements.
    pub row_pool_size: u32,
    pub mvcc_pool_size: u32,
    /// Capacities of the vertex / edge property value stores, in cells.
    pub vp_store_cells: u32,
    pub ep_store_cells: u32,
    /// Transaction table main/indirect bucket counts.
    pub trx_main_buckets: usize,
    pub trx_indirect_buckets: usize,
    /// Cardinality ratio gate for index push-down.
    pub index_ratio: u64,
    pub enable_step_reorder: bool,
    pub enable_indexing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: 1,
            num_expert_threads: 4,
            isolation: IsolationLevel::Snapshot,
            use_rdma: false,
            snapshot_path: None,
            max_data_size: 1 << 20,
            row_pool_size: 1 << 16,
            mvcc_pool_size: 1 << 18,
            vp_store_cells: 1 << 18,
            ep_store_cells: 1 << 18,
            trx_main_buckets: 1024,
            trx_indirect_buckets: 256,
            index_ratio: 3,
            enable_step_reorder: true,
            enable_indexing: true,
        }
    }
}

impl Config {
    /// Parses `key=value` lines; unknown keys are rejected so typos in a
    /// deployment file fail loudly.
    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg = Config::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                GraphError::InvalidArgument(format!(
                    "config line {}: expected key=value, got '{line}'",
                    lineno + 1
                ))
            })?;
            cfg.set(key.trim(), value.trim())?;
        }
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let bad = |v: &str| {
            GraphError::InvalidArgument(format!("bad value '{v}' for config key '{key}'"))
        };
        match key {
            "num_workers" => self.num_workers = value.parse().map_err(|_| bad(value))?,
            "num_expert_threads" => {
                self.num_expert_threads = value.parse().map_err(|_| bad(value))?
            }
            "isolation" => {
                self.isolation = match value {
                    "SI" => IsolationLevel::Snapshot,
                    "SERIALIZABLE" => IsolationLevel::Serializable,
                    _ => return Err(bad(value)),
                }
            }
            "use_rdma" => self.use_rdma = parse_bool(value).ok_or_else(|| bad(value))?,
            "snapshot_path" => self.snapshot_path = Some(value.to_string()),
            "max_data_size" => self.max_data_size = value.parse().map_err(|_| bad(value))?,
            "row_pool_size" => self.row_pool_size = value.parse().map_err(|_| bad(value))?,
            "mvcc_pool_size" => self.mvcc_pool_size = value.parse().map_err(|_| bad(value))?,
            "vp_store_cells" => self.vp_store_cells = value.parse().map_err(|_| bad(value))?,
            "ep_store_cells" => self.ep_store_cells = value.parse().map_err(|_| bad(value))?,
            "trx_main_buckets" => {
                self.trx_main_buckets = value.parse().map_err(|_| bad(value))?
            }
            "trx_indirect_buckets" => {
                self.trx_indirect_buckets = value.parse().map_err(|_| bad(value))?
            }
            "index_ratio" => self.index_ratio = value.parse().map_err(|_| bad(value))?,
            "enable_step_reorder" => {
                self.enable_step_reorder = parse_bool(value).ok_or_else(|| bad(value))?
            }
            "enable_indexing" => {
                self.enable_indexing = parse_bool(value).ok_or_else(|| bad(value))?
            }
            _ => {
                return Err(GraphError::InvalidArgument(format!(
                    "unknown config key '{key}'"
                )))
            }
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "t" | "true" | "1" => Some(true),
        "f" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Flags togglable at runtime through `SetConfig(name, value)`.
#[derive(Debug)]
pub struct RuntimeFlags {
    pub step_reorder: AtomicBool,
    pub indexing: AtomicBool,
}

impl RuntimeFlags {
    pub fn new(cfg: &Config) -> Self {
        Self {
            step_reorder: AtomicBool::new(cfg.enable_step_reorder),
            indexing: AtomicBool::new(cfg.enable_indexing),
        }
    }

    pub fn set(&self, name: &str, enable: bool) -> Result<()> {
        match name {
            "step_reorder" => self.step_reorder.store(enable, Ordering::SeqCst),
            "indexing" => self.indexing.store(enable, Ordering::SeqCst),
            _ => {
                return Err(GraphError::InvalidArgument(format!(
                    "unknown runtime config '{name}'"
                )))
            }
        }
        Ok(())
    }

    pub fn step_reorder(&self) -> bool {
        self.step_reorder.load(Ordering::SeqCst)
    }

    pub fn indexing(&self) -> bool {
        self.indexing.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cluster_topology() {
        let topo = ClusterTopology::parse(
            "master.local:7000:8000\nw0.local:7001:8001\nw1.local:7002:8002\n",
        )
        .unwrap();
        assert_eq!(topo.master.hostname, "master.local");
        assert_eq!(topo.worker_count(), 2);
        assert_eq!(topo.workers[1].rdma_port, 8002);
    }

    #[test]
    fn rejects_malformed_node_line() {
        assert!(ClusterTopology::parse("master:7000\nw0:1:2\n").is_err());
    }

    #[test]
    fn parses_engine_config() {
        let cfg = Config::parse(
            "num_workers=2\nnum_expert_threads=3\nisolation=SERIALIZABLE\nuse_rdma=f\n",
        )
        .unwrap();
        assert_eq!(cfg.num_workers, 2);
        assert_eq!(cfg.num_expert_threads, 3);
        assert_eq!(cfg.isolation, IsolationLevel::Serializable);
        assert!(Config::parse("no_such_key=1").is_err());
    }

    #[test]
    fn loads_config_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# deployment overrides").unwrap();
        writeln!(file, "num_workers=4").unwrap();
        writeln!(file, "snapshot_path=/tmp/snap").unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.num_workers, 4);
        assert_eq!(cfg.snapshot_path.as_deref(), Some("/tmp/snap"));
    }
}
