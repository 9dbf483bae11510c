use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::info;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::loader::{fill_partition, RawGraph};
use crate::mailbox::build_fabric;
use crate::storage::DataStorage;
use crate::worker::{spawn_worker, TrxReply, Worker};

/// An in-process cluster: N shared-nothing workers wired by the mailbox
/// fabric, one coordinator for ids and timestamps. This is the execution
/// core behind the request socket; transport to external clients is a
/// collaborator, not part of the core.
pub struct GraphCluster {
    workers: Vec<Worker>,
    coordinator: Arc<Coordinator>,
    next_worker: AtomicUsize,
}

impl GraphCluster {
    /// Builds the cluster and loads each worker's partition from `graph`.
    pub fn build(config: Config, graph: &RawGraph) -> Self {
        let config = Arc::new(config);
        let coordinator = Arc::new(Coordinator::new(config.num_workers));
        let (mailboxes, mut queues) = build_fabric(
            config.num_workers,
            config.num_expert_threads,
            1024,
        );
        let schema = Arc::new(graph.schema.clone());

        let mut workers = Vec::with_capacity(config.num_workers);
        for (rank, mailbox) in mailboxes.into_iter().enumerate() {
            let storage = Arc::new(DataStorage::new(&config, rank, schema.clone()));
            // the scheduler thread owns the extra pool slot
            fill_partition(&storage, graph, config.num_expert_threads);
            workers.push(spawn_worker(
                rank,
                config.clone(),
                storage,
                Arc::new(mailbox),
                std::mem::take(&mut queues[rank]),
                coordinator.clone(),
            ));
        }
        info!(workers = workers.len(), "cluster up");

        Self {
            workers,
            coordinator,
            next_worker: AtomicUsize::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn worker(&self, rank: usize) -> &Worker {
        &self.workers[rank]
    }

    /// Submits a transaction to the next worker round-robin and waits for
    /// its reply.
    pub fn submit(&self, query: &str) -> Result<TrxReply> {
        let rank = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[rank].submit(query)
    }

    /// Submits to one specific worker.
    pub fn submit_at(&self, rank: usize, query: &str) -> Result<TrxReply> {
        self.workers[rank].submit(query)
    }
}
