pub mod rct;
pub mod table;

pub use rct::RctIndex;
pub use table::{
    ClusterTrxStub, TableWrite, TableWriter, TransactionTable, TrxStatus, TrxTableStub,
};
