pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod experts;
pub mod index;
pub mod loader;
pub mod mailbox;
pub mod message;
pub mod plan;
pub mod predicate;
pub mod schema;
pub mod storage;
pub mod trx;
pub mod types;
pub mod worker;

pub use crate::cluster::GraphCluster;
pub use crate::config::{Config, IsolationLevel};
pub use crate::error::{GraphError, ReadStat, Result, WriteStat};
pub use crate::loader::RawGraph;
pub use crate::types::{Eid, Value, Vid};
pub use crate::worker::TrxReply;
